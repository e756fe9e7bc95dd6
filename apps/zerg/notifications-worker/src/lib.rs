//! Notifications Worker Service
//!
//! Consumes platform events from the shared event log and turns the ones
//! addressed to users into notifications.
//!
//! ## Architecture
//!
//! ```text
//! events (main topic)      events.retry (backoff)      events.dlq
//!        ↓                        ↓                        ↓
//!   MessagingClient::consume_with_retries          (optional) DLQ recovery
//!        ↓
//!   NotificationHandler
//! ```
//!
//! ## Features
//!
//! - Allow-list driven: only `MESSAGING_ALLOWED_TYPES` reach the handler
//! - Failed notifications are retried with exponential backoff, then quarantined
//! - Optional DLQ recovery loop (`NOTIFICATIONS_DLQ_RECOVERY=true`)
//! - Health, readiness and Prometheus endpoints for Kubernetes probes

use async_trait::async_trait;
use axum::Router;
use core_config::{app_info, env_bool, env_parse, Environment, FromEnv};
use eyre::{Result, WrapErr};
use reliable_messaging::{
    health_router, init_metrics, Envelope, Handler, HandlerError, HealthState, MessageType,
    MessagingClient, MessagingConfig,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Notification requested by another service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub recipient: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

fn default_channel() -> String {
    "email".to_string()
}

/// Minimal view of order and payment events
#[derive(Debug, Deserialize)]
struct CustomerEvent {
    #[serde(alias = "email")]
    customer_email: String,
    #[serde(default)]
    order_id: Option<String>,
}

/// Maps incoming envelopes to notifications.
#[derive(Debug, Default, Clone)]
pub struct NotificationHandler;

impl NotificationHandler {
    /// Build the notification for an envelope, if its type produces one.
    pub fn notification_for(envelope: &Envelope) -> Result<Option<NotificationRequest>, HandlerError> {
        let notification = match envelope.message_type {
            MessageType::NotificationRequested => {
                let request: NotificationRequest = envelope
                    .payload_json()
                    .map_err(|e| HandlerError::new(format!("invalid notification request: {}", e)))?;
                Some(request)
            }
            MessageType::OrderCreated | MessageType::PaymentFailed | MessageType::PaymentCompleted => {
                let event: CustomerEvent = envelope
                    .payload_json()
                    .map_err(|e| HandlerError::new(format!("invalid {} payload: {}", envelope.message_type, e)))?;
                let order = event.order_id.unwrap_or_else(|| envelope.id.clone());
                let subject = match envelope.message_type {
                    MessageType::OrderCreated => format!("Order {} received", order),
                    MessageType::PaymentFailed => format!("Payment for order {} failed", order),
                    _ => format!("Payment for order {} completed", order),
                };
                Some(NotificationRequest {
                    recipient: event.customer_email,
                    channel: default_channel(),
                    subject,
                    body: String::new(),
                })
            }
            _ => None,
        };

        match notification {
            Some(n) if n.recipient.trim().is_empty() => Err(HandlerError::new("notification has no recipient")),
            other => Ok(other),
        }
    }
}

#[async_trait]
impl Handler for NotificationHandler {
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        match Self::notification_for(&envelope)? {
            Some(notification) => {
                info!(
                    message_id = %envelope.id,
                    from_service = %envelope.from_service,
                    channel = %notification.channel,
                    recipient = %notification.recipient,
                    subject = %notification.subject,
                    "Dispatching notification"
                );
            }
            None => {
                warn!(
                    message_id = %envelope.id,
                    message_type = %envelope.message_type,
                    "No notification template for message type"
                );
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "notifications"
    }
}

/// Start the health and metrics HTTP server
async fn start_health_server(state: HealthState, port: u16) -> Result<()> {
    let app: Router = health_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the notifications worker
///
/// # Errors
///
/// Returns an error if the messaging configuration is invalid, the broker
/// is unreachable at startup, or a consumer loop fails to subscribe.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    if !init_metrics() {
        warn!("Prometheus recorder unavailable, /metrics will be empty");
    }

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting notifications worker");
    info!("Environment: {:?}", environment);

    let health_port: u16 = env_parse("NOTIFICATIONS_WORKER_HEALTH_PORT", 8083)
        .wrap_err("Invalid health port")?;
    let dlq_recovery = env_bool("NOTIFICATIONS_DLQ_RECOVERY", false)
        .wrap_err("Invalid NOTIFICATIONS_DLQ_RECOVERY")?;

    let config = MessagingConfig::from_env().wrap_err("Failed to load messaging configuration")?;
    info!(
        service = %config.service_name,
        brokers = ?config.brokers,
        main_topic = %config.main_topic,
        max_concurrent_handlers = config.max_concurrent_handlers,
        max_retries = config.max_retries,
        "Messaging configuration loaded"
    );

    let client = MessagingClient::connect_redis(config)
        .await
        .wrap_err("Failed to connect to the event log")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let health_state = HealthState::new(client.clone(), app_info.name, app_info.version);
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    let consumed = if dlq_recovery {
        info!("Starting consumers with DLQ recovery");
        tokio::try_join!(
            client.consume_with_retries(shutdown_rx.clone(), NotificationHandler),
            client.consume_dlq_with_recovery(shutdown_rx, NotificationHandler),
        )
        .map(|_| ())
    } else {
        info!("Starting consumers");
        client.consume_with_retries(shutdown_rx, NotificationHandler).await
    };

    // Drain in-flight handlers even when a loop failed
    let closed = client.close().await;
    consumed.wrap_err("Consumer loop failed")?;
    closed.wrap_err("Failed to close messaging client")?;

    info!("Notifications worker stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.wrap_err("Failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install signal handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
