// WhatsApp Business Cloud API gateway

use super::DispatchGateway;
use crate::config::WhatsAppConfig;
use crate::errors::DispatchError;
use crate::models::ResolvedContent;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, instrument};

/// Dispatches messages through the WhatsApp Cloud API `/messages` endpoint
pub struct WhatsAppGateway {
    client: reqwest::Client,
    messages_url: String,
    access_token: String,
}

impl WhatsAppGateway {
    pub fn new(config: &WhatsAppConfig) -> Result<Self, DispatchError> {
        if config.access_token.is_empty() {
            return Err(DispatchError::NotConfigured(
                "WhatsApp access_token not configured".to_string(),
            ));
        }
        if config.phone_number_id.is_empty() {
            return Err(DispatchError::NotConfigured(
                "WhatsApp phone_number_id not configured".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| DispatchError::Request(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            messages_url: format!(
                "{}/{}/messages",
                config.api_base_url.trim_end_matches('/'),
                config.phone_number_id
            ),
            access_token: config.access_token.clone(),
        })
    }
}

/// Cloud API request body for one message
fn message_body(to: &str, content: &ResolvedContent) -> Value {
    let mut body = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": content.kind(),
    });

    let payload = match content {
        ResolvedContent::Text { body } => json!({ "preview_url": false, "body": body }),
        ResolvedContent::Audio { url } => json!({ "link": url }),
        ResolvedContent::Image { url, caption } => {
            let mut image = json!({ "link": url });
            if let Some(caption) = caption {
                image["caption"] = json!(caption);
            }
            image
        }
        ResolvedContent::Document {
            url,
            file_name,
            caption,
        } => {
            let mut document = json!({ "link": url, "filename": file_name });
            if let Some(caption) = caption {
                document["caption"] = json!(caption);
            }
            document
        }
    };

    body[content.kind()] = payload;
    body
}

#[async_trait]
impl DispatchGateway for WhatsAppGateway {
    #[instrument(skip(self, content), fields(kind = content.kind()))]
    async fn send(&self, address: &str, content: &ResolvedContent) -> Result<String, DispatchError> {
        let body = message_body(address, content);

        let response = self
            .client
            .post(&self.messages_url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "WhatsApp API request failed");
                DispatchError::Request(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), "WhatsApp API error");
            return Err(DispatchError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let result: Value = response
            .json()
            .await
            .map_err(|e| DispatchError::InvalidResponse(e.to_string()))?;

        let message_id = result["messages"][0]["id"]
            .as_str()
            .ok_or_else(|| DispatchError::InvalidResponse("Missing message id".to_string()))?
            .to_string();

        debug!(message_id = %message_id, "WhatsApp message sent");
        Ok(message_id)
    }
}
