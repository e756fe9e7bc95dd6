//! Health endpoints for services embedding a messaging client.
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`): broker ping, closed client
//! - Client stats (`/stats`)
//! - Prometheus metrics (`/metrics`)

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::client::{ClientStats, MessagingClient};
use crate::metrics;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub client: MessagingClient,
    pub app_name: String,
    pub app_version: String,
}

impl HealthState {
    pub fn new(
        client: MessagingClient,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            client,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Liveness: the process is up.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness: the client is open and the broker answers a ping within the
/// connection timeout.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    if state.client.is_closed() {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "client": "closed" }
            })),
        ));
    }

    let timeout = state.client.config().connection_timeout;
    let broker = state.client.broker();

    match tokio::time::timeout(timeout, broker.ping()).await {
        Ok(Ok(())) => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": { "broker": "ok" }
            })),
        )),
        Ok(Err(e)) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "broker": format!("error: {}", e) }
            })),
        )),
        Err(_) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "broker": format!("ping timed out after {:?}", timeout) }
            })),
        )),
    }
}

pub async fn stats_handler(State(state): State<HealthState>) -> Json<ClientStats> {
    Json(state.client.stats())
}

pub async fn metrics_handler() -> impl IntoResponse {
    let body = metrics::render_metrics();
    if body.is_empty() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call init_metrics() at startup.".to_string(),
        );
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
}

/// Router with every health endpoint.
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::config::MessagingConfig;
    use std::sync::Arc;

    async fn state(broker: Arc<InMemoryBroker>) -> HealthState {
        let config = MessagingConfig::new("orders").with_critical_messages_dir(
            std::env::temp_dir()
                .join(format!("health-test-{}", uuid::Uuid::new_v4()))
                .to_string_lossy()
                .into_owned(),
        );
        let client = MessagingClient::connect(config, broker).await.unwrap();
        HealthState::new(client, "orders-worker", "0.1.0")
    }

    #[tokio::test]
    async fn test_health_handler() {
        let state = state(Arc::new(InMemoryBroker::new())).await;
        let Json(body) = health_handler(State(state)).await;
        assert_eq!(body.status, "healthy");
        assert_eq!(body.name, "orders-worker");
    }

    #[tokio::test]
    async fn test_ready_follows_broker() {
        let broker = Arc::new(InMemoryBroker::new());
        let state = state(broker.clone()).await;

        assert!(ready_handler(State(state.clone())).await.is_ok());

        broker.set_unreachable(true);
        let (status, _) = ready_handler(State(state.clone())).await.unwrap_err();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        broker.set_unreachable(false);
        state.client.close().await.unwrap();
        let (_, Json(body)) = ready_handler(State(state)).await.unwrap_err();
        assert_eq!(body["checks"]["client"], "closed");
    }

    #[tokio::test]
    async fn test_stats_handler() {
        let state = state(Arc::new(InMemoryBroker::new())).await;
        let Json(stats) = stats_handler(State(state)).await;
        assert_eq!(stats.service, "orders");
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.retry_topic.as_deref(), Some("events.retry"));
    }
}
