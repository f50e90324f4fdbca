use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

/// Request and error counters reported by `/health`.
#[derive(Debug, Default)]
pub struct RequestMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
}

impl RequestMetrics {
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Errors as a percentage of all requests.
    pub fn error_rate(&self) -> f64 {
        let requests = self.request_count();
        if requests == 0 {
            0.0
        } else {
            self.error_count() as f64 / requests as f64 * 100.0
        }
    }
}

/// Count every request, and every response with a 4xx/5xx status.
pub async fn track(State(metrics): State<Arc<RequestMetrics>>, req: Request, next: Next) -> Response {
    metrics.requests.fetch_add(1, Ordering::Relaxed);
    let response = next.run(req).await;
    if response.status().as_u16() >= 400 {
        metrics.errors.fetch_add(1, Ordering::Relaxed);
    }
    response
}
