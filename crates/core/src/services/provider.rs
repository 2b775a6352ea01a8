//! Outgoing mail providers.
//!
//! The Email Service only sees [`EmailProvider`]. Each implementation maps
//! its own failures onto [`ProviderError::Transient`] (try again later) or
//! [`ProviderError::Permanent`] (the message will never be accepted).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::{
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
};
use postbox_common::{
    AppError, AppResult, IdGenerator,
    config::{EmailConfig, ProviderKind, SendGridSettings, SmtpSettings},
};
use reqwest::StatusCode;
use serde_json::json;
use thiserror::Error;

/// A rendered message addressed to one recipient.
#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    /// Queue job this message belongs to.
    pub job_id: String,
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// Provider acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Message ID from provider (if available)
    pub message_id: Option<String>,
}

/// Provider failure, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Network trouble, throttling or a temporary rejection.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// The provider will never accept this message.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl ProviderError {
    /// Whether sending the same message again may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Transmits rendered mail.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// Send one message.
    async fn send(&self, email: &OutgoingEmail) -> Result<DeliveryReceipt, ProviderError>;
}

/// Build the provider selected in configuration.
pub fn build_provider(config: &EmailConfig) -> AppResult<Arc<dyn EmailProvider>> {
    let provider: Arc<dyn EmailProvider> = match config.provider {
        ProviderKind::Log => Arc::new(LogProvider),
        ProviderKind::Smtp => {
            let smtp = config.smtp.as_ref().ok_or_else(|| {
                AppError::Config("email.provider is smtp but [email.smtp] is missing".to_string())
            })?;
            Arc::new(SmtpProvider::new(smtp, config)?)
        }
        ProviderKind::SendGrid => {
            let sendgrid = config.sendgrid.as_ref().ok_or_else(|| {
                AppError::Config(
                    "email.provider is sendgrid but [email.sendgrid] is missing".to_string(),
                )
            })?;
            Arc::new(SendGridProvider::new(sendgrid, config))
        }
    };

    tracing::info!(provider = provider.name(), "Email provider configured");
    Ok(provider)
}

// === Log ===

/// Logs messages instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProvider;

#[async_trait]
impl EmailProvider for LogProvider {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<DeliveryReceipt, ProviderError> {
        tracing::info!(
            job_id = %email.job_id,
            to = %email.to,
            subject = %email.subject,
            "Email delivery logged (log provider)"
        );
        tracing::debug!(job_id = %email.job_id, body = %email.text, "Email text body");

        Ok(DeliveryReceipt {
            message_id: Some(format!("log-{}", IdGenerator::new().generate())),
        })
    }
}

// === SMTP ===

/// SMTP relay via `lettre`.
pub struct SmtpProvider {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    reply_to: Option<Mailbox>,
}

impl SmtpProvider {
    /// Create a provider for the given relay. Does not connect.
    pub fn new(settings: &SmtpSettings, email: &EmailConfig) -> AppResult<Self> {
        let builder = if settings.implicit_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
        }
        .map_err(|e| AppError::Config(format!("Invalid SMTP relay {}: {e}", settings.host)))?;

        let mut builder = builder
            .port(settings.port)
            .timeout(Some(Duration::from_secs(settings.timeout_secs)));

        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let from = parse_mailbox(&email.from_address, Some(&email.from_name))
            .map_err(|e| AppError::Config(format!("Invalid from address: {e}")))?;
        let reply_to = email
            .reply_to
            .as_deref()
            .map(|addr| parse_mailbox(addr, None))
            .transpose()
            .map_err(|e| AppError::Config(format!("Invalid reply-to address: {e}")))?;

        Ok(Self {
            transport: builder.build(),
            from,
            reply_to,
        })
    }

    fn build_message(&self, email: &OutgoingEmail) -> Result<Message, ProviderError> {
        let to = parse_mailbox(&email.to, email.to_name.as_deref())
            .map_err(|e| ProviderError::Permanent(format!("invalid recipient: {e}")))?;

        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject.clone());
        if let Some(reply_to) = &self.reply_to {
            builder = builder.reply_to(reply_to.clone());
        }

        builder
            .multipart(MultiPart::alternative_plain_html(
                email.text.clone(),
                email.html.clone(),
            ))
            .map_err(|e| ProviderError::Permanent(format!("invalid message: {e}")))
    }
}

fn parse_mailbox(address: &str, name: Option<&str>) -> Result<Mailbox, lettre::address::AddressError> {
    let address: Address = address.parse()?;
    Ok(Mailbox::new(name.map(ToString::to_string), address))
}

#[async_trait]
impl EmailProvider for SmtpProvider {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<DeliveryReceipt, ProviderError> {
        let message = self.build_message(email)?;

        match self.transport.send(message).await {
            Ok(response) => Ok(DeliveryReceipt {
                message_id: response.first_line().map(ToString::to_string),
            }),
            // 5xx replies and malformed input will fail the same way again
            Err(e) if e.is_permanent() || e.is_client() => {
                Err(ProviderError::Permanent(e.to_string()))
            }
            Err(e) => Err(ProviderError::Transient(e.to_string())),
        }
    }
}

// === SendGrid ===

/// `SendGrid` v3 mail API via `reqwest`.
pub struct SendGridProvider {
    http_client: reqwest::Client,
    api_key: String,
    endpoint: String,
    from_address: String,
    from_name: String,
    reply_to: Option<String>,
}

impl SendGridProvider {
    /// Create a new `SendGrid` provider.
    #[must_use]
    pub fn new(settings: &SendGridSettings, email: &EmailConfig) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            api_key: settings.api_key.clone(),
            endpoint: format!("{}/v3/mail/send", settings.base_url.trim_end_matches('/')),
            from_address: email.from_address.clone(),
            from_name: email.from_name.clone(),
            reply_to: email.reply_to.clone(),
        }
    }

    fn body(&self, email: &OutgoingEmail) -> serde_json::Value {
        let mut to = json!({ "email": email.to });
        if let Some(name) = &email.to_name {
            to["name"] = json!(name);
        }

        let mut body = json!({
            "personalizations": [{ "to": [to] }],
            "from": {
                "email": self.from_address,
                "name": self.from_name,
            },
            "subject": email.subject,
            "content": [
                {"type": "text/plain", "value": email.text},
                {"type": "text/html", "value": email.html},
            ],
            "custom_args": { "job_id": email.job_id },
        });
        if let Some(reply_to) = &self.reply_to {
            body["reply_to"] = json!({ "email": reply_to });
        }
        body
    }
}

/// 408, 429 and 5xx are worth retrying; any other rejection is final.
fn classify_status(status: StatusCode, detail: String) -> ProviderError {
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        ProviderError::Transient(format!("SendGrid returned {status}: {detail}"))
    } else {
        ProviderError::Permanent(format!("SendGrid returned {status}: {detail}"))
    }
}

#[async_trait]
impl EmailProvider for SendGridProvider {
    fn name(&self) -> &'static str {
        "sendgrid"
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<DeliveryReceipt, ProviderError> {
        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.body(email))
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("SendGrid request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let message_id = response
                .headers()
                .get("X-Message-Id")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            return Ok(DeliveryReceipt { message_id });
        }

        let detail = response.text().await.unwrap_or_default();
        Err(classify_status(status, detail))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn email_config(provider: ProviderKind) -> EmailConfig {
        EmailConfig {
            provider,
            from_address: "noreply@postbox.example".to_string(),
            from_name: "Postbox".to_string(),
            reply_to: Some("support@postbox.example".to_string()),
            instance_name: "Postbox".to_string(),
            instance_url: "https://postbox.example".to_string(),
            smtp: Some(SmtpSettings {
                host: "smtp.postbox.example".to_string(),
                port: 2525,
                implicit_tls: false,
                username: Some("user".to_string()),
                password: Some("secret".to_string()),
                timeout_secs: 5,
            }),
            sendgrid: Some(SendGridSettings {
                api_key: "SG.test".to_string(),
                base_url: "https://sendgrid.test/".to_string(),
            }),
        }
    }

    fn outgoing(to: &str) -> OutgoingEmail {
        OutgoingEmail {
            job_id: "job-1".to_string(),
            to: to.to_string(),
            to_name: Some("Alice".to_string()),
            subject: "Hello".to_string(),
            text: "Hi".to_string(),
            html: "<p>Hi</p>".to_string(),
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, String::new()).is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new()).is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, String::new()).is_retryable());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, String::new()).is_retryable());
    }

    #[test]
    fn test_sendgrid_body() {
        let config = email_config(ProviderKind::SendGrid);
        let provider = SendGridProvider::new(config.sendgrid.as_ref().unwrap(), &config);
        assert_eq!(provider.endpoint, "https://sendgrid.test/v3/mail/send");

        let body = provider.body(&outgoing("alice@example.com"));
        assert_eq!(body["personalizations"][0]["to"][0]["email"], "alice@example.com");
        assert_eq!(body["personalizations"][0]["to"][0]["name"], "Alice");
        assert_eq!(body["reply_to"]["email"], "support@postbox.example");
        assert_eq!(body["custom_args"]["job_id"], "job-1");
    }

    #[test]
    fn test_smtp_rejects_invalid_recipient_permanently() {
        let config = email_config(ProviderKind::Smtp);
        let provider = SmtpProvider::new(config.smtp.as_ref().unwrap(), &config).unwrap();

        let err = provider.build_message(&outgoing("not-an-address")).unwrap_err();
        assert!(!err.is_retryable());
        assert!(provider.build_message(&outgoing("alice@example.com")).is_ok());
    }

    #[test]
    fn test_build_provider_requires_settings() {
        let mut config = email_config(ProviderKind::Smtp);
        config.smtp = None;
        assert!(matches!(build_provider(&config), Err(AppError::Config(_))));

        let config = email_config(ProviderKind::Log);
        assert_eq!(build_provider(&config).unwrap().name(), "log");
    }

    #[tokio::test]
    async fn test_log_provider_always_accepts() {
        let receipt = LogProvider.send(&outgoing("alice@example.com")).await.unwrap();
        assert!(receipt.message_id.unwrap().starts_with("log-"));
    }
}
