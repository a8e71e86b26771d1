// Outbound message dispatch

pub mod whatsapp;

pub use whatsapp::WhatsAppGateway;

use crate::errors::DispatchError;
use crate::models::ResolvedContent;
use async_trait::async_trait;

/// Sends resolved content to a subject's channel address
///
/// Returns the provider message id. Any error means the step was not delivered
/// and must not be advanced.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DispatchGateway: Send + Sync {
    async fn send(&self, address: &str, content: &ResolvedContent) -> Result<String, DispatchError>;
}
