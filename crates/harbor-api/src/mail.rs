use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

/// Delivery capability for registration codes. Failure is surfaced to the
/// caller; the pending registration survives for a retry.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_verification_code(&self, email: &str, code: &str) -> anyhow::Result<()>;
}

/// Sends through a transactional-email provider's HTTP API.
pub struct HttpMailer {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    from_name: String,
    from_email: String,
}

const DEFAULT_ENDPOINT: &str = "https://api.brevo.com/v3/smtp/email";

impl HttpMailer {
    pub fn new(api_key: String, from_name: String, from_email: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key,
            from_name,
            from_email,
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send_verification_code(&self, email: &str, code: &str) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "sender": { "name": self.from_name, "email": self.from_email },
            "to": [{ "email": email }],
            "subject": format!("{} verification code", self.from_name),
            "htmlContent": format!(
                "<p>Your verification code is</p>\
                 <p style=\"font-size:28px;font-weight:700;letter-spacing:6px\">{}</p>\
                 <p>It expires in 5 minutes. If you did not request it, ignore this email.</p>",
                code
            ),
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        if let Err(e) = resp.error_for_status_ref() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            warn!("mail provider returned {}: {}", status, detail);
            return Err(e.into());
        }

        info!("verification code sent to {}", email);
        Ok(())
    }
}

/// Dev fallback when no mail API key is configured: logs the code instead
/// of sending anything.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_verification_code(&self, email: &str, code: &str) -> anyhow::Result<()> {
        info!("verification code for {}: {} (mail delivery disabled)", email, code);
        Ok(())
    }
}
