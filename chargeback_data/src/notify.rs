use std::path::Path;

use async_trait::async_trait;
use color_eyre::Result;
use tracing::{error, info};

pub const SUCCESS_SUBJECT: &str = "Slurm Chargeback Success";
pub const FAILURE_SUBJECT: &str = "Slurm Chargeback Failure";

pub fn success_message(inserted: usize) -> String {
    format!(
        "The Slurm chargeback process ran successfully and inserted '{inserted}' jobs.\nSee attached log for details."
    )
}

pub fn failure_message() -> String {
    "The Slurm chargeback process failed to complete. See attached log for details.".to_owned()
}

/// End-of-run notification. `log` is the log file of the run, to be attached if the sink can.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_success(&self, log: &Path, inserted: usize) -> Result<()>;
    async fn send_failure(&self, log: &Path) -> Result<()>;
}

/// Used when nothing else is configured: the notification only ends up in the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_success(&self, log: &Path, inserted: usize) -> Result<()> {
        info!(log = %log.display(), "{SUCCESS_SUBJECT}: {}", success_message(inserted));
        Ok(())
    }

    async fn send_failure(&self, log: &Path) -> Result<()> {
        error!(log = %log.display(), "{FAILURE_SUBJECT}: {}", failure_message());
        Ok(())
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_message__contains_count() {
        assert!(success_message(12).contains("'12'"));
    }

    #[test_log::test(tokio::test)]
    async fn LogNotifier__never_fails() {
        let log = Path::new("/nonexistent/run.log");
        assert!(LogNotifier.send_success(log, 3).await.is_ok());
        assert!(LogNotifier.send_failure(log).await.is_ok());
    }
}
