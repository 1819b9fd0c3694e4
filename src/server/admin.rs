use super::GatewayState;
use crate::proxy::context::{json_response, BoxBody, NOT_FOUND_BODY};
use crate::upstream::{breaker_key, HealthRecord, LogicalService};
use http::StatusCode;
use hyper::body::Incoming;
use hyper::{Request, Response};

pub fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    Ok(route_admin(req.uri().path(), &state))
}

fn route_admin(path: &str, state: &GatewayState) -> Response<BoxBody> {
    match path {
        "/health" | "/healthz" => json_response(StatusCode::OK, r#"{"status":"ok"}"#),

        "/ready" | "/readyz" => {
            let unavailable = state.registry.unavailable_services();
            if unavailable.is_empty() {
                let body = serde_json::json!({
                    "status": "ready",
                    "services": state.registry.services().len(),
                    "instances": state.config.total_instance_count(),
                });
                json_response(StatusCode::OK, body.to_string())
            } else {
                let body = serde_json::json!({
                    "status": "not_ready",
                    "unavailable": unavailable,
                });
                json_response(StatusCode::SERVICE_UNAVAILABLE, body.to_string())
            }
        }

        "/metrics" => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(crate::proxy::context::full_body(state.metrics.render()))
            .unwrap_or_else(|_| json_response(StatusCode::INTERNAL_SERVER_ERROR, "{}")),

        "/services" => {
            let services: Vec<serde_json::Value> = state
                .registry
                .services()
                .iter()
                .map(|svc| service_json(svc, state))
                .collect();
            let body = serde_json::to_string_pretty(&services).unwrap_or_default();
            json_response(StatusCode::OK, body)
        }

        _ => json_response(StatusCode::NOT_FOUND, NOT_FOUND_BODY),
    }
}

fn service_json(svc: &LogicalService, state: &GatewayState) -> serde_json::Value {
    let instances: Vec<serde_json::Value> = svc
        .instances()
        .iter()
        .map(|inst| {
            let key = breaker_key(svc.name(), inst.id());
            let circuit = state.breakers.snapshot(&key).map(|s| {
                serde_json::json!({
                    "key": key,
                    "state": s.status.as_str(),
                    "failures": s.failures,
                    "successes": s.successes,
                    "since_last_failure_ms": s.since_last_failure.map(|d| d.as_millis() as u64),
                })
            });
            serde_json::json!({
                "id": inst.id(),
                "url": inst.url(),
                "weight": inst.weight,
                "active_requests": inst.active_requests(),
                "healthy": svc.is_healthy(inst.id()),
                "health": svc.health(inst.id()).map(|r| health_json(&r)),
                "circuit": circuit,
            })
        })
        .collect();

    serde_json::json!({
        "name": svc.name(),
        "strategy": svc.strategy().as_str(),
        "instances": instances,
    })
}

fn health_json(record: &HealthRecord) -> serde_json::Value {
    serde_json::json!({
        "healthy": record.healthy,
        "last_check": humantime::format_rfc3339_millis(record.last_check).to_string(),
        "last_response_time_ms": record.last_response_time_ms,
        "last_error": record.last_error,
    })
}
