use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;

/// The startup/liveness/readiness flag trio behind the `/probe` routes.
/// Flags start false and are flipped by the owning supervisor.
#[derive(Clone, Default, Debug)]
pub struct Probes {
    inner: Arc<Flags>,
}

#[derive(Default, Debug)]
struct Flags {
    startup: AtomicBool,
    liveness: AtomicBool,
    readiness: AtomicBool,
}

impl Probes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn startup(&self) -> bool {
        self.inner.startup.load(Ordering::Relaxed)
    }

    pub fn liveness(&self) -> bool {
        self.inner.liveness.load(Ordering::Relaxed)
    }

    pub fn readiness(&self) -> bool {
        self.inner.readiness.load(Ordering::Relaxed)
    }

    pub fn set_startup(&self, v: bool) {
        self.inner.startup.store(v, Ordering::Relaxed);
    }

    pub fn set_liveness(&self, v: bool) {
        self.inner.liveness.store(v, Ordering::Relaxed);
    }

    pub fn set_readiness(&self, v: bool) {
        self.inner.readiness.store(v, Ordering::Relaxed);
    }

    /// Clear everything; used when the supervised process dies.
    pub fn clear(&self) {
        self.set_startup(false);
        self.set_liveness(false);
        self.set_readiness(false);
    }

    /// `/probe/{startup,liveness,readiness}`: 200 with the probe name when
    /// the flag is up, 503 otherwise.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/probe/startup", get(startup))
            .route("/probe/liveness", get(liveness))
            .route("/probe/readiness", get(readiness))
            .with_state(self.clone())
    }
}

async fn startup(State(probes): State<Probes>) -> impl IntoResponse {
    flag(probes.startup(), "startup")
}

async fn liveness(State(probes): State<Probes>) -> impl IntoResponse {
    flag(probes.liveness(), "liveness")
}

async fn readiness(State(probes): State<Probes>) -> impl IntoResponse {
    flag(probes.readiness(), "readiness")
}

fn flag(up: bool, name: &'static str) -> (StatusCode, &'static str) {
    if up {
        (StatusCode::OK, name)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probes_flip_independently() {
        let probes = Probes::new();
        assert!(!probes.startup());

        probes.set_startup(true);
        probes.set_liveness(true);
        assert!(probes.startup());
        assert!(probes.liveness());
        assert!(!probes.readiness());

        probes.clear();
        assert!(!probes.startup());
        assert!(!probes.liveness());
    }
}
