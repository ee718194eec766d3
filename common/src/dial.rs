use std::time::Duration;

use futures::future::join_all;
use myops_types::Mysql;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// One retry after this pause; a single refused dial is not a verdict.
const RETRY_AFTER: Duration = Duration::from_millis(250);

/// Open-and-close a TCP connection to prove the port answers. Retries once.
pub async fn dial_check(addr: &str, deadline: Duration) -> Result<(), String> {
    let attempt = async {
        match TcpStream::connect(addr).await {
            Ok(_) => Ok(()),
            Err(first) => {
                tokio::time::sleep(RETRY_AFTER).await;
                TcpStream::connect(addr)
                    .await
                    .map(|_| ())
                    .map_err(|_| first.to_string())
            }
        }
    };
    match timeout(deadline, attempt).await {
        Ok(r) => r,
        Err(_) => Err(format!("dial {addr}: deadline exceeded")),
    }
}

/// Dial every solo's database port in parallel under a shared deadline.
/// Returns `(id, error)` per destination; `None` means the port answered.
pub async fn cross_check(mysql: &Mysql, deadline: Duration) -> Vec<(i32, Option<String>)> {
    let solos = mysql
        .status
        .as_ref()
        .map(|s| s.solos.as_slice())
        .unwrap_or_default();

    let dials = solos.iter().map(|solo| {
        let addr = format!("{}:{}", solo.spec.host, solo.spec.port);
        let id = solo.spec.id;
        async move { (id, dial_check(&addr, deadline).await.err()) }
    });

    join_all(dials).await
}
