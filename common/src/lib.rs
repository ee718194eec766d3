use owo_colors::OwoColorize;

pub mod dial;
pub mod probes;
pub mod shutdown;

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}

pub mod response {
    use axum::Json;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use myops_types::Envelope;
    use serde::Serialize;

    /// 200 with the payload in the `Data` slot.
    pub fn data<T: Serialize>(v: T) -> Response {
        Json(Envelope::data(v)).into_response()
    }

    /// Protocol-level failure: still a 200, but the envelope carries `Error`
    /// and no data. Callers check the envelope, not the status line.
    pub fn error(message: impl Into<String>) -> Response {
        let message = message.into();
        tracing::warn!(%message, "request rejected");
        Json(Envelope::<()>::error(message)).into_response()
    }

    pub fn bad_request() -> Response {
        StatusCode::BAD_REQUEST.into_response()
    }

    pub fn forbidden() -> Response {
        StatusCode::FORBIDDEN.into_response()
    }

    pub fn not_found() -> Response {
        StatusCode::NOT_FOUND.into_response()
    }

    pub fn internal_server_error() -> Response {
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }

    pub fn service_unavailable() -> Response {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

pub mod access_log {
    use axum::http::StatusCode;
    use owo_colors::OwoColorize;

    pub async fn public(
        req: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> axum::response::Response {
        request("ADDON", req, next, false).await
    }

    pub async fn errors_only(
        req: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> axum::response::Response {
        request("ADDON", req, next, true).await
    }

    pub async fn request(
        prefix: &str,
        req: axum::extract::Request,
        next: axum::middleware::Next,
        errors_only: bool,
    ) -> axum::response::Response {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let start = std::time::Instant::now();
        let response = next.run(req).await;
        let duration = start.elapsed();
        let is_success = response.status().is_success()
            || response.status() == StatusCode::SWITCHING_PROTOCOLS;
        if is_success && errors_only {
            return response;
        }
        let (a, b) = if is_success {
            ((20, 163, 73), (25, 163, 118))
        } else {
            ((230, 126, 16), (171, 85, 17))
        };
        println!(
            "🧾 {} {} {} {} {} {}{}{}",
            format!("[{}]", prefix).truecolor(a.0, a.1, a.2),
            method.truecolor(b.0, b.1, b.2),
            path.truecolor(b.0, b.1, b.2),
            "→".truecolor(a.0, a.1, a.2),
            response.status().truecolor(b.0, b.1, b.2),
            "(".truecolor(a.0, a.1, a.2),
            format!("{:?}", duration).truecolor(b.0, b.1, b.2),
            ")".truecolor(a.0, a.1, a.2),
        );
        response
    }
}

pub fn print_error<T>(e: T)
where
    T: Into<anyhow::Error> + std::fmt::Display + std::fmt::Debug,
{
    eprintln!(
        "❌ {}",
        format!("{:?}", e.into())
            .split("\n")
            .map(|s| s.red().to_string())
            .collect::<Vec<_>>()
            .join("\n"),
    );
}
