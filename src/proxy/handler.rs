use crate::error::GatewayError;
use crate::proxy::context::{
    bad_gateway_body, BoxBody, GuardedBody, RequestContext, CIRCUIT_OPEN_BODY, NOT_FOUND_BODY,
    NO_HEALTHY_INSTANCE_BODY, PAYLOAD_TOO_LARGE_BODY,
};
use crate::server::{GatewayState, UpstreamClient};
use crate::upstream::{breaker_key, BreakerError, RequestGuard};
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Why a forwarded call counts as a breaker failure.
enum ForwardError {
    /// The upstream answered with a failure status; the response is still
    /// relayed to the caller unchanged.
    Status(Response<Incoming>),
    Timeout,
    Transport(String),
}

/// Handle one inbound request:
///
/// 1. ROUTE_MATCH: path prefix to logical service
/// 2. SELECT: healthy instance from the registry's balancer
/// 3. FORWARD: through the instance's circuit breaker
/// 4. LOG: metrics and access line
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let path = req.uri().path().to_string();
    let method = req.method().as_str().to_string();

    let client_ip = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip());

    let mut ctx = RequestContext::new(method, path, client_ip);

    // Route match
    let route = match state.router.match_path(&ctx.path) {
        Some(r) => r,
        None => {
            debug!("proxy: {}, path={}", GatewayError::NoRouteMatch, ctx.path);
            return Ok(ctx.error_response(StatusCode::NOT_FOUND, NOT_FOUND_BODY));
        }
    };
    ctx.service.push_str(&route.service);

    if let Some(max_bytes) = state.config.proxy.max_body_bytes {
        if let Some(cl) = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            if cl > max_bytes {
                debug!(
                    "proxy: request body too large, content_length={}, max={}, service={}",
                    cl, max_bytes, ctx.service
                );
                return Ok(ctx.error_response(StatusCode::PAYLOAD_TOO_LARGE, PAYLOAD_TOO_LARGE_BODY));
            }
        }
    }

    // Instance selection; the guard keeps the in-flight count until the
    // relayed body finishes or an error response is returned.
    let guard = match state.registry.select_instance(&route.service) {
        Ok(g) => g,
        Err(e) => {
            warn!("proxy: {}, path={}", e, ctx.path);
            return Ok(ctx.error_response(StatusCode::SERVICE_UNAVAILABLE, NO_HEALTHY_INSTANCE_BODY));
        }
    };
    ctx.instance.push_str(guard.id());

    let upstream_uri = build_upstream_uri(
        guard.instance.url(),
        &route.upstream_path,
        req.uri().query(),
    );

    let (parts, body) = req.into_parts();
    let mut headers = parts.headers;
    inject_forwarded_headers(&mut headers, peer_addr, &host);
    remove_hop_headers(&mut headers);
    headers.remove(HOST);

    let mut builder = Request::builder().method(parts.method).uri(&upstream_uri);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let upstream_req = match builder.body(body.boxed()) {
        Ok(r) => r,
        Err(e) => {
            let err = GatewayError::Internal(e.to_string());
            warn!("proxy: failed to build upstream request, service={}, error={}", ctx.service, err);
            return Ok(ctx.error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                r#"{"error":"internal server error"}"#,
            ));
        }
    };

    let key = breaker_key(&ctx.service, &ctx.instance);
    let timeout = Duration::from_millis(state.config.proxy.forward_timeout_ms);
    let count_client_errors = state.breakers.config().count_client_errors;

    ctx.upstream_start = Some(Instant::now());
    let result = state
        .breakers
        .execute(&key, || {
            http_forward(&state.client, upstream_req, timeout, count_client_errors)
        })
        .await;

    let resp = match result {
        Ok(resp) => resp,
        Err(BreakerError::Inner(ForwardError::Status(resp))) => {
            warn!(
                "proxy: {}, service={}, instance={}, uri={}",
                GatewayError::UpstreamStatus(resp.status().as_u16()),
                ctx.service,
                ctx.instance,
                upstream_uri
            );
            resp
        }
        Err(BreakerError::Open) => {
            debug!("proxy: {}, path={}", GatewayError::CircuitOpen(key), ctx.path);
            ctx.upstream_start = None;
            return Ok(ctx.error_response(StatusCode::SERVICE_UNAVAILABLE, CIRCUIT_OPEN_BODY));
        }
        Err(BreakerError::Inner(ForwardError::Timeout)) => {
            let err = GatewayError::UpstreamTimeout;
            warn!(
                "proxy: {}, service={}, instance={}, uri={}, timeout_ms={}",
                err,
                ctx.service,
                ctx.instance,
                upstream_uri,
                timeout.as_millis()
            );
            return Ok(ctx.error_response(
                StatusCode::BAD_GATEWAY,
                bad_gateway_body(&err.to_string()),
            ));
        }
        Err(BreakerError::Inner(ForwardError::Transport(msg))) => {
            let err = GatewayError::UpstreamConnect(msg);
            warn!(
                "proxy: {}, service={}, instance={}, uri={}",
                err, ctx.service, ctx.instance, upstream_uri
            );
            return Ok(ctx.error_response(
                StatusCode::BAD_GATEWAY,
                bad_gateway_body(&err.to_string()),
            ));
        }
    };

    let final_resp = build_downstream_response(resp, guard);
    ctx.finish(final_resp.status().as_u16());
    Ok(final_resp)
}

/// Send `req` and classify the outcome for the circuit breaker. Only the
/// response head is bounded by `timeout`; the body streams afterwards.
async fn http_forward(
    client: &UpstreamClient,
    req: Request<BoxBody>,
    timeout: Duration,
    count_client_errors: bool,
) -> Result<Response<Incoming>, ForwardError> {
    match tokio::time::timeout(timeout, client.request(req)).await {
        Ok(Ok(resp)) => {
            if is_breaker_failure(resp.status(), count_client_errors) {
                Err(ForwardError::Status(resp))
            } else {
                Ok(resp)
            }
        }
        Ok(Err(e)) => Err(ForwardError::Transport(error_chain(&e))),
        Err(_) => Err(ForwardError::Timeout),
    }
}

fn is_breaker_failure(status: StatusCode, count_client_errors: bool) -> bool {
    status.is_server_error() || (count_client_errors && status.is_client_error())
}

/// `{base}{path}` plus `?{query}` when the inbound request carried one.
fn build_upstream_uri(base: &str, path: &str, query: Option<&str>) -> String {
    let mut uri = String::with_capacity(base.len() + path.len() + query.map_or(0, |q| q.len() + 1));
    uri.push_str(base);
    uri.push_str(path);
    if let Some(q) = query {
        uri.push('?');
        uri.push_str(q);
    }
    uri
}

/// hyper's client errors keep the useful part (e.g. "Connection refused") in
/// the source chain.
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut msg = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

/// The instance stays counted as in flight until the relayed body finishes.
fn build_downstream_response(
    upstream_resp: Response<Incoming>,
    guard: RequestGuard,
) -> Response<BoxBody> {
    let (mut parts, body) = upstream_resp.into_parts();
    remove_hop_headers(&mut parts.headers);
    Response::from_parts(parts, GuardedBody::new(body.boxed(), guard).boxed())
}

fn remove_hop_headers(headers: &mut http::HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("proxy-connection"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

/// Add `X-Forwarded-*` and `X-Real-IP` so instances can see the original
/// client. `X-Forwarded-For` is appended to; `X-Forwarded-Proto` is kept if
/// a front proxy already set it.
fn inject_forwarded_headers(
    headers: &mut http::HeaderMap,
    peer_addr: SocketAddr,
    original_host: &str,
) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let peer_ip = peer_addr.ip().to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let combined = format!("{}, {}", existing, peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if !original_host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(XFH.clone(), v);
        }
    }

    if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XRI.clone(), v);
    }
}
