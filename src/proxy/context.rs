use crate::upstream::RequestGuard;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, SizeHint};
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub const NO_HEALTHY_INSTANCE_BODY: &str = r#"{"error":"Service temporarily unavailable"}"#;
pub const CIRCUIT_OPEN_BODY: &str = r#"{"error":"circuit breaker open"}"#;
pub const NOT_FOUND_BODY: &str = r#"{"error":"not found"}"#;
pub const PAYLOAD_TOO_LARGE_BODY: &str = r#"{"error":"payload too large"}"#;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Response body that keeps the instance's in-flight slot until the last
/// frame has been read or the body is dropped, so least-connections counts
/// a streaming response for as long as it is streaming.
pub struct GuardedBody {
    inner: BoxBody,
    guard: Option<RequestGuard>,
}

impl GuardedBody {
    pub fn new(inner: BoxBody, guard: RequestGuard) -> Self {
        Self {
            inner,
            guard: Some(guard),
        }
    }
}

impl Body for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let polled = Pin::new(&mut self.inner).poll_frame(cx);
        if matches!(polled, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            self.guard = None;
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

/// `{"error":"Bad gateway","detail":<detail>}`
pub fn bad_gateway_body(detail: &str) -> String {
    serde_json::json!({ "error": "Bad gateway", "detail": detail }).to_string()
}

/// Build a JSON response. Falls back to a bare 500 if the builder rejects it.
pub fn json_response(status: StatusCode, body: impl Into<Bytes>) -> hyper::Response<BoxBody> {
    hyper::Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap_or_else(|_| {
            let mut resp = hyper::Response::new(empty_body());
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        })
}

/// Per-request bookkeeping for metrics and the access log.
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub client_ip: IpAddr,
    pub service: String,
    pub instance: String,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
}

impl RequestContext {
    pub fn new(method: String, path: String, client_ip: IpAddr) -> Self {
        Self {
            method,
            path,
            client_ip,
            service: String::new(),
            instance: String::new(),
            start: Instant::now(),
            upstream_start: None,
        }
    }

    /// Gateway-generated error: records metrics, logs the access line and
    /// builds the JSON response.
    pub fn error_response(
        &self,
        status: StatusCode,
        body: impl Into<Bytes>,
    ) -> hyper::Response<BoxBody> {
        self.finish(status.as_u16());
        json_response(status, body)
    }

    /// Record request metrics and emit the access log line.
    pub fn finish(&self, status: u16) {
        self.finalize_metrics(status);
        self.log_access(status);
    }

    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "gateway_http_requests_total",
            "service" => self.service.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
            "instance" => self.instance.clone(),
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "service" => self.service.clone(),
            "instance" => self.instance.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "gateway_upstream_request_duration_seconds",
                "service" => self.service.clone(),
                "instance" => self.instance.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }
    }

    fn log_access(&self, status: u16) {
        let total_ms = self.start.elapsed().as_millis();
        let upstream_ms = self
            .upstream_start
            .map(|s| s.elapsed().as_millis())
            .unwrap_or(0);

        tracing::info!(
            client_ip = %self.client_ip,
            method = %self.method,
            path = %self.path,
            status = status,
            service = %self.service,
            instance = %self.instance,
            latency_ms = %total_ms,
            upstream_ms = %upstream_ms,
            "access"
        );
    }
}
