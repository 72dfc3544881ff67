//! Request logging middleware.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use tracing::info;

use crate::capture::ResponseCapture;
use crate::logging::Logging;
use crate::request_id::RequestIds;

/// State for [`log_requests`].
#[derive(Debug, Clone)]
pub struct RequestLog {
    logging: Logging,
    ids: RequestIds,
}

impl RequestLog {
    pub fn new(logging: Logging) -> Self {
        Self {
            logging,
            ids: RequestIds::os(),
        }
    }

    pub fn with_ids(mut self, ids: RequestIds) -> Self {
        self.ids = ids;
        self
    }
}

/// Wrap every route of `app` with [`log_requests`].
pub fn wrap(app: Router, log: RequestLog) -> Router {
    app.layer(middleware::from_fn_with_state(log, log_requests))
}

/// Log a "request received" entry, run the inner handler with a
/// [`ResponseCapture`] in the request extensions, then log "response
/// completed" with the elapsed time and captured status. Both entries carry
/// the same request ID.
pub async fn log_requests(
    State(log): State<RequestLog>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let id = log.logging.emit(|| log.ids.next());
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());

    log.logging.emit(|| {
        info!(
            id = %id,
            method = %method,
            path = %path,
            remote = %remote,
            "request received"
        )
    });

    let capture = ResponseCapture::new();
    req.extensions_mut().insert(capture.clone());
    let response = capture.observe(next.run(req).await);

    let duration = round_to_millis(start.elapsed());
    let status = capture.status().unwrap_or(StatusCode::OK);
    log.logging.emit(|| {
        info!(
            id = %id,
            method = %method,
            path = %path,
            duration = %humantime::format_duration(duration),
            status = status.as_u16(),
            "response completed"
        )
    });

    response
}

/// Round to the nearest millisecond.
pub fn round_to_millis(elapsed: Duration) -> Duration {
    let millis = (elapsed.as_micros() + 500) / 1000;
    Duration::from_millis(millis as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_millis() {
        assert_eq!(round_to_millis(Duration::from_micros(0)), Duration::ZERO);
        assert_eq!(round_to_millis(Duration::from_micros(499)), Duration::ZERO);
        assert_eq!(
            round_to_millis(Duration::from_micros(1500)),
            Duration::from_millis(2)
        );
        assert_eq!(
            round_to_millis(Duration::from_micros(12_345)),
            Duration::from_millis(12)
        );
    }

    #[test]
    fn test_rounded_duration_renders_in_millis() {
        let duration = round_to_millis(Duration::from_micros(12_345));
        assert_eq!(humantime::format_duration(duration).to_string(), "12ms");
    }
}
