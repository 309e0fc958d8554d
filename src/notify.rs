use crate::errors::CommandError;
use serde::Serialize;

#[derive(Serialize)]
struct SlackMessage<'a> {
    text: &'a str,
}

/// Posts the run summary to a Slack-style incoming webhook. Failures are
/// the caller's to decide on; this client never retries.
pub struct SlackNotifier {
    webhook_url: String,
    http: reqwest::blocking::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        SlackNotifier {
            webhook_url,
            http: reqwest::blocking::Client::new(),
        }
    }

    pub fn post(&self, summary: &str) -> Result<(), CommandError> {
        let response = self
            .http
            .post(&self.webhook_url)
            .json(&SlackMessage { text: summary })
            .send()
            .map_err(|e| CommandError::new("failed to reach the notification webhook".to_string(), Some(e.to_string())))?;

        if !response.status().is_success() {
            return Err(CommandError::new_from_safe_message(format!(
                "notification webhook returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}
