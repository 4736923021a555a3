use std::{path::Path, time::Duration};

use async_trait::async_trait;
use chargeback_data::notify::{failure_message, success_message, Notifier, FAILURE_SUBJECT, SUCCESS_SUBJECT};
use color_eyre::{eyre::Context as _, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

/// JSON body posted to the webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookPayload {
    pub subject: &'static str,
    pub message: String,
    /// `None` on failure
    pub inserted: Option<usize>,
    /// Content of the run's log file.
    pub log: String,
}

impl WebhookPayload {
    pub fn success(inserted: usize, log: String) -> Self {
        WebhookPayload {
            subject: SUCCESS_SUBJECT,
            message: success_message(inserted),
            inserted: Some(inserted),
            log,
        }
    }

    pub fn failure(log: String) -> Self {
        WebhookPayload {
            subject: FAILURE_SUBJECT,
            message: failure_message(),
            inserted: None,
            log,
        }
    }
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("building the webhook HTTP client")?;
        Ok(WebhookNotifier { client, url })
    }

    #[instrument(skip_all, fields(subject = payload.subject), err)]
    async fn post(&self, payload: &WebhookPayload) -> Result<()> {
        self.client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .wrap_err_with(|| format!("posting notification to {}", self.url))?;
        info!("Successfully sent notification");
        Ok(())
    }
}

/// Whatever made it into the log file so far. A run that failed early may not have one.
pub async fn read_log(log: &Path) -> String {
    match tokio::fs::read(log).await {
        Ok(content) => String::from_utf8_lossy(&content).into_owned(),
        Err(e) => {
            warn!("Failed to read log file {log:?}: {e}");
            format!("(log file {} unavailable: {e})", log.display())
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send_success(&self, log: &Path, inserted: usize) -> Result<()> {
        self.post(&WebhookPayload::success(inserted, read_log(log).await)).await
    }

    async fn send_failure(&self, log: &Path) -> Result<()> {
        self.post(&WebhookPayload::failure(read_log(log).await)).await
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn WebhookPayload__json() {
        let json = serde_json::to_value(WebhookPayload::success(5, "line 1\nline 2\n".to_owned())).unwrap();
        assert_eq!(json["subject"], "Slurm Chargeback Success");
        assert_eq!(json["inserted"], 5);
        assert_eq!(json["log"], "line 1\nline 2\n");

        let json = serde_json::to_value(WebhookPayload::failure(String::new())).unwrap();
        assert_eq!(json["subject"], "Slurm Chargeback Failure");
        assert!(json["inserted"].is_null());
    }

    #[tokio::test]
    async fn read_log__existing_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("run.log");
        std::fs::write(&log, "INFO done\n").unwrap();
        assert_eq!(read_log(&log).await, "INFO done\n");
        assert!(read_log(&dir.path().join("missing.log")).await.contains("unavailable"));
    }

    #[test_log::test(tokio::test)]
    async fn WebhookNotifier__unreachable_url_is_an_error() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook".to_owned(), Duration::from_millis(500)).unwrap();
        assert!(notifier.send_failure(Path::new("/nonexistent.log")).await.is_err());
    }
}
