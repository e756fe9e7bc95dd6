//! Notifications Worker Service - Entry Point
//!
//! Background worker that turns platform events into user notifications.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_notifications_worker::run().await
}
