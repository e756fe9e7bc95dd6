//! Message handler abstraction

use crate::envelope::Envelope;
use crate::error::HandlerError;
use async_trait::async_trait;
use std::future::Future;

/// Business logic invoked for every accepted envelope.
///
/// Returning `Err` drives the retry state machine; the handler never sees
/// envelopes outside its service's allow-list.
///
/// # Example
///
/// ```rust,ignore
/// struct SendReceipt { mailer: Arc<Mailer> }
///
/// #[async_trait]
/// impl Handler for SendReceipt {
///     async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
///         let order: OrderCompleted = envelope.payload_json().map_err(|e| e.to_string())?;
///         self.mailer.receipt(order).await.map_err(eyre::Report::from)?;
///         Ok(())
///     }
///
///     fn name(&self) -> &str {
///         "send_receipt"
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError>;

    /// Name used in logs
    fn name(&self) -> &str {
        "handler"
    }
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        (self)(envelope).await
    }
}
