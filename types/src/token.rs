use sha2::{Digest, Sha256};

use crate::Mysql;

/// Parsed caller identity from the `Token` request header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub name: String,
    pub group_name: String,
    /// Solo index for agent callers; unset for the coordinator.
    pub id: i32,
    pub myctl: bool,
    pub rand_id: i64,
    pub group_token: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid token")]
    Invalid,
    #[error("invalid rand id")]
    RandId,
    #[error("invalid name")]
    Name,
}

/// Shared secret per cluster. Every caller that can read the cluster's
/// credentials can derive it; nobody else can.
pub fn group_token(mysql: &Mysql) -> String {
    let input = format!(
        "{}:{}@{}",
        mysql.spec.local_username,
        mysql.spec.local_password,
        mysql.group_name()
    );
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)
}

/// Header value sent by a caller named `name` (a solo name or
/// `<group>-myctl`). `rand_id` is the caller's process start time, used for
/// restart detection.
pub fn solo_token(mysql: &Mysql, name: &str, rand_id: i64) -> String {
    raw_token(name, rand_id, &group_token(mysql))
}

/// Assemble a token around an already-known group secret; used by the agent
/// before it has fetched the cluster object.
pub fn raw_token(name: &str, rand_id: i64, group_token: &str) -> String {
    format!("{}:{}@{}", name, to_base36(rand_id), group_token)
}

/// Wall clock at process start, the `rand_id` carried in every token this
/// process emits.
pub fn process_rand_id() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis())
}

pub fn parse_token(s: &str) -> Result<Token, TokenError> {
    let i = s.find(':').ok_or(TokenError::Invalid)?;
    let j = s.find('@').ok_or(TokenError::Invalid)?;
    if i < 1 || j < 1 || j <= i {
        return Err(TokenError::Invalid);
    }

    let name = &s[..i];
    let rand_id = i64::from_str_radix(&s[i + 1..j], 36).map_err(|_| TokenError::RandId)?;
    let group_token = &s[j + 1..];

    let k = name.rfind('-').ok_or(TokenError::Name)?;
    if k < 1 {
        return Err(TokenError::Name);
    }
    let group_name = &name[..k];
    let rest = &name[k + 1..];
    let myctl = rest == "myctl";
    let id = if myctl {
        0
    } else {
        rest.parse::<i32>().map_err(|_| TokenError::Name)?
    };

    Ok(Token {
        name: name.to_string(),
        group_name: group_name.to_string(),
        id,
        myctl,
        rand_id,
        group_token: group_token.to_string(),
    })
}

fn to_base36(mut v: i64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if v == 0 {
        return "0".to_string();
    }
    let negative = v < 0;
    let mut buf = Vec::with_capacity(14);
    while v != 0 {
        let d = (v % 36).unsigned_abs() as usize;
        buf.push(DIGITS[d]);
        v /= 36;
    }
    if negative {
        buf.push(b'-');
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}
