use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailerError {
    #[error("Email provider request failed: {0}")]
    Transport(String),
    #[error("Email provider rejected the message with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub text: String,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeliveryReceipt {
    pub id: String,
}

/// Transactional email delivery. Implemented over HTTPS in production and by
/// recording fakes in tests.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    fn from_address(&self) -> &str;

    async fn send(&self, email: &OutboundEmail) -> Result<DeliveryReceipt, MailerError>;
}

#[derive(Serialize)]
struct SendPayload<'a> {
    from: &'a str,
    to: &'a [String],
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    bcc: &'a [String],
    subject: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
}

#[derive(Clone)]
pub struct HttpMailer {
    client: Client,
    endpoint: String,
    api_key: String,
    from: String,
}

impl HttpMailer {
    pub fn new(endpoint: &str, api_key: &str, from: &str, timeout: Duration) -> anyhow::Result<Self> {
        assert!(!endpoint.is_empty(), "Email API endpoint must be provided");
        assert!(
            timeout >= Duration::from_millis(100),
            "Timeout below 100ms is unsafe"
        );

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| anyhow::anyhow!("Failed to build email client for {endpoint}: {err}"))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            from: from.to_string(),
        })
    }
}

#[async_trait]
impl EmailTransport for HttpMailer {
    fn from_address(&self) -> &str {
        &self.from
    }

    async fn send(&self, email: &OutboundEmail) -> Result<DeliveryReceipt, MailerError> {
        assert!(
            !email.to.is_empty() || !email.bcc.is_empty(),
            "Email must have at least one recipient"
        );
        let payload = SendPayload {
            from: &self.from,
            to: &email.to,
            bcc: &email.bcc,
            subject: &email.subject,
            text: &email.text,
            reply_to: email.reply_to.as_deref(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| MailerError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailerError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<DeliveryReceipt>()
            .await
            .map_err(|err| MailerError::Transport(err.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;

    /// Records every message; addresses in `failing` make the send fail.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub(crate) sent: Mutex<Vec<OutboundEmail>>,
        pub(crate) failing: HashSet<String>,
    }

    impl RecordingTransport {
        pub(crate) fn failing_for(addresses: &[&str]) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                failing: addresses.iter().map(|a| a.to_string()).collect(),
            }
        }

        pub(crate) fn sent(&self) -> Vec<OutboundEmail> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EmailTransport for RecordingTransport {
        fn from_address(&self) -> &str {
            "noreply@james-square.com"
        }

        async fn send(&self, email: &OutboundEmail) -> Result<DeliveryReceipt, MailerError> {
            if email
                .to
                .iter()
                .chain(email.bcc.iter())
                .any(|address| self.failing.contains(address))
            {
                return Err(MailerError::Rejected {
                    status: 422,
                    body: "rejected".to_string(),
                });
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push(email.clone());
            Ok(DeliveryReceipt {
                id: format!("msg-{}", sent.len()),
            })
        }
    }
}
