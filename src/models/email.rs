use serde::{Deserialize, Serialize};

/// Accepts either `to` (single address or list) or `recipients`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEmailRequest {
    #[serde(default)]
    pub to: Option<Recipients>,
    #[serde(default)]
    pub recipients: Option<Vec<String>>,
    pub subject: String,
    pub message: String,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Recipients {
    One(String),
    Many(Vec<String>),
}

impl SendEmailRequest {
    pub fn raw_recipients(&self) -> Vec<String> {
        let mut all = Vec::new();
        match &self.to {
            Some(Recipients::One(address)) => all.push(address.clone()),
            Some(Recipients::Many(addresses)) => all.extend(addresses.iter().cloned()),
            None => {}
        }
        if let Some(extra) = &self.recipients {
            all.extend(extra.iter().cloned());
        }
        all
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEmailResponse {
    pub ok: bool,
    pub recipients: usize,
    pub batches: usize,
    pub remaining_today: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_accepts_string_or_list_and_merges_recipients() {
        let single: SendEmailRequest = serde_json::from_value(serde_json::json!({
            "to": "a@example.com",
            "recipients": ["b@example.com"],
            "subject": "s",
            "message": "m"
        }))
        .unwrap();
        assert_eq!(
            single.raw_recipients(),
            vec!["a@example.com".to_string(), "b@example.com".to_string()]
        );

        let many: SendEmailRequest = serde_json::from_value(serde_json::json!({
            "to": ["a@example.com", "c@example.com"],
            "subject": "s",
            "message": "m"
        }))
        .unwrap();
        assert_eq!(many.raw_recipients().len(), 2);
    }
}
