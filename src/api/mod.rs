//! HTTP control surface. Read endpoints serve snapshots; write endpoints
//! funnel through the Supervisor, which owns all state. Every failure is a
//! structured `{status, message}` payload, never a bare 500.

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::port_allocator::PortAllocator;
use crate::supervisor::error::WardenError;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Deserialize)]
pub struct PortAllocateRequest {
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub preferred_port: Option<u16>,
}

#[derive(Clone)]
pub struct ApiServer {
    pub supervisor: Arc<Supervisor>,
    pub listen_addr: String,
}

impl ApiServer {
    pub fn new(supervisor: Arc<Supervisor>, listen_addr: &str) -> Self {
        Self {
            supervisor,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers([header::ACCEPT, header::CONTENT_TYPE, header::AUTHORIZATION]);

        Router::new()
            .route("/warden/healthcheck/basic", get(healthcheck))
            .route("/warden/status", get(status))
            .route("/warden/services", get(list_services))
            .route("/warden/service/:name/enable", post(enable_service))
            .route("/warden/service/:name/disable", post(disable_service))
            .route("/warden/port/allocate", post(allocate_port))
            .route("/warden/port/check/:port", get(check_port))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(self.clone())
    }

    pub async fn start(self) -> Result<()> {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("Control API listening on http://{}", self.listen_addr);
        axum::serve(listener, router).await?;
        Ok(())
    }
}

/// GET /warden/healthcheck/basic - the warden's own liveness endpoint,
/// the same plain-text contract it demands of its services.
async fn healthcheck() -> &'static str {
    "true"
}

/// GET /warden/status - aggregate counts, ports in use, timestamp.
async fn status(State(state): State<ApiServer>) -> impl IntoResponse {
    let services = state.supervisor.snapshot().await;
    let ports = state.supervisor.ports_in_use().await;
    Json(json!({
        "status": "operational",
        "services_count": services.len(),
        "ports_in_use": ports,
        "timestamp": chrono::Local::now().to_rfc3339(),
    }))
}

/// GET /warden/services - snapshot of every record.
async fn list_services(State(state): State<ApiServer>) -> impl IntoResponse {
    Json(state.supervisor.snapshot().await)
}

/// POST /warden/service/:name/enable
async fn enable_service(
    Path(name): Path<String>,
    State(state): State<ApiServer>,
) -> Result<impl IntoResponse, WardenError> {
    let service = state.supervisor.enable(&name).await?;
    Ok(Json(json!({
        "status": "success",
        "message": format!("{} enabled", name),
        "service": service,
    })))
}

/// POST /warden/service/:name/disable
async fn disable_service(
    Path(name): Path<String>,
    State(state): State<ApiServer>,
) -> Result<impl IntoResponse, WardenError> {
    let service = state.supervisor.disable(&name).await?;
    Ok(Json(json!({
        "status": "success",
        "message": format!("{} disabled", name),
        "service": service,
    })))
}

/// POST /warden/port/allocate - allocate a port for a service and persist
/// the assignment. Reports `reassigned` when the preferred port was taken.
async fn allocate_port(
    State(state): State<ApiServer>,
    Json(req): Json<PortAllocateRequest>,
) -> Result<impl IntoResponse, WardenError> {
    let (name, preferred) = match (req.service_name, req.preferred_port) {
        (Some(name), Some(port)) => (name, port),
        _ => {
            return Err(WardenError::BadRequest(
                "service_name, preferred_port".to_string(),
            ))
        }
    };

    // reject unknown services before reserving anything
    state.supervisor.get_record(&name).await?;

    let assigned = state.supervisor.allocator.allocate(preferred, &name).await?;
    state.supervisor.assign_port(&name, assigned).await?;

    if assigned == preferred {
        Ok(Json(json!({
            "status": "success",
            "service": name,
            "port": assigned,
        })))
    } else {
        Ok(Json(json!({
            "status": "reassigned",
            "service": name,
            "requested_port": preferred,
            "assigned_port": assigned,
        })))
    }
}

/// GET /warden/port/check/:port
async fn check_port(Path(port): Path<u16>) -> impl IntoResponse {
    let in_use = !PortAllocator::is_free(port);
    Json(json!({
        "port": port,
        "in_use": in_use,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WardenConfig;
    use crate::service::ServiceRecord;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    fn server_with(records: Vec<ServiceRecord>, dir: &std::path::Path) -> ApiServer {
        let registry = dir.join("services.json");
        std::fs::write(&registry, serde_json::to_string_pretty(&records).unwrap()).unwrap();
        let config = WardenConfig {
            registry_path: registry,
            services_dir: Some(dir.to_path_buf()),
            port_range_lo: 42500,
            port_range_hi: 42520,
            ..Default::default()
        };
        let supervisor = Arc::new(Supervisor::new(config).unwrap());
        ApiServer::new(supervisor, "127.0.0.1:0")
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_healthcheck_is_plain_true() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with(vec![], dir.path());
        let response = server
            .router()
            .oneshot(Request::get("/warden/healthcheck/basic").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"true");
    }

    #[tokio::test]
    async fn test_status_reports_counts() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with(
            vec![ServiceRecord::new("a", 42501), ServiceRecord::new("b", 42502)],
            dir.path(),
        );
        let response = server
            .router()
            .oneshot(Request::get("/warden/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "operational");
        assert_eq!(json["services_count"], 2);
        assert!(json["timestamp"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_services_snapshot_has_no_ephemeral_fields() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with(vec![ServiceRecord::new("tts", 42503)], dir.path());
        let response = server
            .router()
            .oneshot(Request::get("/warden/services").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        let rec = &json.as_array().unwrap()[0];
        assert_eq!(rec["name"], "tts");
        assert_eq!(rec["port"], 42503);
        assert!(rec.get("pid").is_none());
        assert!(rec.get("consecutive_health_failures").is_none());
    }

    #[tokio::test]
    async fn test_enable_unknown_service_is_structured_404() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with(vec![], dir.path());
        let response = server
            .router()
            .oneshot(
                Request::post("/warden/service/ghost/enable")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["status"], "error");
        assert!(json["message"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_disable_updates_service_list() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with(vec![ServiceRecord::new("camera", 42504)], dir.path());
        let router = server.router();

        let response = router
            .clone()
            .oneshot(
                Request::post("/warden/service/camera/disable")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "success");
        assert_eq!(json["service"]["enabled"], false);
        assert_eq!(json["service"]["running"], false);

        // immediately visible in the services list
        let response = router
            .oneshot(Request::get("/warden/services").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json[0]["enabled"], false);
        assert_eq!(json[0]["running"], false);
    }

    #[tokio::test]
    async fn test_port_allocate_success_and_reassigned() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with(
            vec![ServiceRecord::new("a", 42505), ServiceRecord::new("b", 42506)],
            dir.path(),
        );
        let router = server.router();

        let response = router
            .clone()
            .oneshot(
                Request::post("/warden/port/allocate")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"service_name": "a", "preferred_port": 42510}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["status"], "success");
        assert_eq!(json["port"], 42510);

        // the same port again, for b: reassignment within the range
        let response = router
            .oneshot(
                Request::post("/warden/port/allocate")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"service_name": "b", "preferred_port": 42510}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["status"], "reassigned");
        assert_eq!(json["requested_port"], 42510);
        assert_ne!(json["assigned_port"], 42510);
    }

    #[tokio::test]
    async fn test_port_allocate_missing_fields_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with(vec![ServiceRecord::new("a", 42507)], dir.path());
        let response = server
            .router()
            .oneshot(
                Request::post("/warden/port/allocate")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"service_name": "a"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["status"], "error");
    }

    #[tokio::test]
    async fn test_port_allocate_unknown_service_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with(vec![], dir.path());
        let response = server
            .router()
            .oneshot(
                Request::post("/warden/port/allocate")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"service_name": "ghost", "preferred_port": 42511}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_port_check() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with(vec![], dir.path());
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let bound = listener.local_addr().unwrap().port();

        let response = server
            .router()
            .oneshot(
                Request::get(format!("/warden/port/check/{}", bound))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["port"], bound);
        assert_eq!(json["in_use"], true);
    }
}
