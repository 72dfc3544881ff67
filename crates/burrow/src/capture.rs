//! Response status capture.
//!
//! [`ResponseCapture`] records the status a response actually went out with.
//! The first recorded value wins: either the status of the response head, or
//! `200 OK` if body bytes are observed before any status was recorded. Later
//! writes never change it, so the logged status cannot contradict what the
//! client received.
//!
//! Only the adapter records statuses. Inner handlers receive the capture
//! through the request extensions and can read the status or use the optional
//! output capabilities:
//! - connection takeover maps to the HTTP upgrade mechanism and fails with
//!   [`CaptureError::Unsupported`] when the connection cannot be upgraded
//! - flushing maps to body framing: [`CapturedBody`] forwards every frame as
//!   soon as the inner body yields it and buffers nothing, so there is never
//!   pending output to flush

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use http_body::{Body as HttpBody, Frame, SizeHint};
use hyper::upgrade::OnUpgrade;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("{0} not supported by the underlying connection")]
    Unsupported(&'static str),
}

const UNSET: u16 = 0;

#[derive(Debug, Clone, Default)]
pub struct ResponseCapture {
    status: Arc<AtomicU16>,
}

impl ResponseCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an explicitly set status. Returns `false` if a status was
    /// already captured.
    pub(crate) fn write_status(&self, status: StatusCode) -> bool {
        self.status
            .compare_exchange(UNSET, status.as_u16(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Note that body bytes are going out. Captures `200 OK` if nothing was
    /// recorded yet.
    pub(crate) fn write_body(&self) {
        self.write_status(StatusCode::OK);
    }

    /// The captured status, if any output happened.
    pub fn status(&self) -> Option<StatusCode> {
        match self.status.load(Ordering::Acquire) {
            UNSET => None,
            code => StatusCode::from_u16(code).ok(),
        }
    }

    /// Capture the status of `response` and route its body through this
    /// capture.
    pub fn observe(&self, response: Response) -> Response {
        self.write_status(response.status());
        let capture = self.clone();
        response.map(|inner| {
            Body::new(CapturedBody {
                inner,
                capture,
                started: false,
            })
        })
    }

    /// Take over the raw connection behind `request`.
    pub fn take_over<B>(&self, request: &mut Request<B>) -> Result<OnUpgrade, CaptureError> {
        request
            .extensions_mut()
            .remove::<OnUpgrade>()
            .ok_or(CaptureError::Unsupported("connection takeover"))
    }
}

/// Body wrapper that reports the first data frame to its [`ResponseCapture`].
pub struct CapturedBody {
    inner: Body,
    capture: ResponseCapture,
    started: bool,
}

impl HttpBody for CapturedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        if let Poll::Ready(Some(Ok(frame))) = &polled {
            if !this.started && frame.is_data() {
                this.started = true;
                this.capture.write_body();
            }
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
