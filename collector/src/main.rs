mod cli;
mod logging;
mod notify;

use std::path::{Path, PathBuf};

use chargeback_data::{
    ingest::{IngestOutcome, Ingestor},
    notify::{LogNotifier, Notifier},
    settings::{Settings, DEFAULT_LOG_FILE},
};
use chrono::Local;
use clap::Parser as _;
use cli::Args;
use color_eyre::{eyre::Context as _, Result};
use database::{ChargebackDb, SlurmDb};
use notify::WebhookNotifier;
use tracing::{error, info, instrument, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let settings = load_settings(&args);

    let log_path = settings
        .as_ref()
        .map_or_else(|_| PathBuf::from(DEFAULT_LOG_FILE), |settings| settings.notification.log_file.clone());
    let (log_file, log_error) = match logging::open_log_file(&log_path) {
        Ok(file) => (Some(file), None),
        Err(e) => (None, Some(e)),
    };
    logging::init(args.log_level(), log_file);
    if let Some(e) = log_error {
        warn!("Logging to stdout only: {e:#}");
    }

    let (notifier, settings) = with_notifier(settings);
    info!("Starting Slurm chargeback run");
    start(settings, &*notifier, &log_path).await.map(|_| ())
}

fn load_settings(args: &Args) -> Result<Settings> {
    let mut settings = Settings::new(args.config.as_deref())?;
    if let Some(days) = args.days {
        settings.slurm.job_prev_days = days;
    }
    Ok(settings)
}

/// Without usable settings there is no webhook to use, failures then only reach the log.
fn with_notifier(settings: Result<Settings>) -> (Box<dyn Notifier>, Result<Settings>) {
    match settings.and_then(|settings| Ok((notifier(&settings)?, settings))) {
        Ok((notifier, settings)) => (notifier, Ok(settings)),
        Err(e) => (Box::new(LogNotifier) as Box<dyn Notifier>, Err(e)),
    }
}

fn notifier(settings: &Settings) -> Result<Box<dyn Notifier>> {
    Ok(match &settings.notification.webhook_url {
        Some(url) => Box::new(WebhookNotifier::new(url.clone(), settings.timeout())?),
        None => {
            info!("No webhook configured, notifications only go to the log");
            Box::new(LogNotifier)
        }
    })
}

/// Runs the ingestion if the setup worked. Either way exactly one notification goes out.
async fn start(settings: Result<Settings>, notifier: &dyn Notifier, log: &Path) -> Result<IngestOutcome> {
    let result = match settings {
        Ok(settings) => run(&settings).await,
        Err(e) => Err(e.wrap_err("setting up the chargeback run")),
    };
    finish(notifier, log, result).await
}

/// Opens both DBs, runs the ingestion and closes the DBs again, whatever happened in between.
#[instrument(skip_all)]
async fn run(settings: &Settings) -> Result<IngestOutcome> {
    let timeout = settings.timeout();
    let slurm_url = settings.slurm_database_url()?;
    let chargeback_url = settings.chargeback_database_url()?;

    let slurm = SlurmDb::connect(slurm_url, &settings.slurm.cluster_name, timeout)
        .await
        .wrap_err("setting up the Slurm accounting DB")?;
    let chargeback = match ChargebackDb::connect(chargeback_url, &settings.chargeback.table_name, timeout).await {
        Ok(chargeback) => chargeback,
        Err(e) => {
            slurm.close().await;
            return Err(e).wrap_err("setting up the chargeback DB");
        }
    };

    let result = ingest(&slurm, &chargeback, settings).await;

    chargeback.close().await;
    slurm.close().await;
    result
}

async fn ingest(slurm: &SlurmDb, chargeback: &ChargebackDb, settings: &Settings) -> Result<IngestOutcome> {
    chargeback.init_schema().await.wrap_err("creating the chargeback table")?;
    let identity = settings
        .identity
        .connect(settings.timeout())
        .await
        .wrap_err("setting up the identity lookup")?;

    let ingestor = Ingestor {
        source: slurm,
        store: chargeback,
        identity: &*identity,
    };
    ingestor.run(&settings.ingest_options(), &Local::now()).await
}

/// Exactly one notification per run. A notification that can't be sent doesn't change the outcome.
async fn finish(notifier: &dyn Notifier, log: &Path, result: Result<IngestOutcome>) -> Result<IngestOutcome> {
    match result {
        Ok(outcome) => {
            info!("Completed Slurm chargeback run, inserted {} jobs", outcome.inserted_count());
            if let Err(e) = notifier.send_success(log, outcome.inserted_count()).await {
                error!("Failed to send success notification: {e:#}");
            }
            Ok(outcome)
        }
        Err(e) => {
            error!("Slurm chargeback run failed: {e:#}");
            if let Err(notify_error) = notifier.send_failure(log).await {
                error!("Failed to send failure notification: {notify_error:#}");
            }
            Err(e)
        }
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use super::*;
    use chargeback_data::{
        identity::AssocBackend,
        ingest::IngestOptions,
        testing::{identity, raw_job, MemorySource, MemoryStore, Notification, RecordingNotifier},
    };
    use color_eyre::eyre::eyre;

    fn options() -> IngestOptions {
        IngestOptions {
            lookback_days: 3,
            partition_filter: String::new(),
            assoc_backend: AssocBackend::EtcGroup,
        }
    }

    #[test_log::test(tokio::test)]
    async fn finish__success_sends_count() {
        let notifier = RecordingNotifier::default();
        let log = Path::new("/var/log/chargeback.log");

        let mut job = raw_job(1);
        job.time_end = Local::now().timestamp() - 24 * 3600;
        job.time_start = job.time_end - 600;
        let source = MemorySource::new(vec![job]);
        let store = MemoryStore::default();
        let identity = identity();
        let ingestor = Ingestor {
            source: &source,
            store: &store,
            identity: &identity,
        };
        let result = ingestor.run(&options(), &Local::now()).await;

        let outcome = finish(&notifier, log, result).await.unwrap();
        assert_eq!(outcome.inserted_count(), 1);
        assert_eq!(
            notifier.sent().await,
            [Notification::Success {
                log: log.to_owned(),
                inserted: 1
            }]
        );
    }

    #[test_log::test(tokio::test)]
    async fn finish__setup_failure_sends_failure_once() {
        let notifier = RecordingNotifier::default();
        let log = Path::new("/var/log/chargeback.log");

        let source = MemorySource::failing();
        let store = MemoryStore::default();
        let identity = identity();
        let ingestor = Ingestor {
            source: &source,
            store: &store,
            identity: &identity,
        };
        let result = ingestor.run(&options(), &Local::now()).await;

        assert!(finish(&notifier, log, result).await.is_err());
        assert_eq!(notifier.sent().await, [Notification::Failure { log: log.to_owned() }]);
        assert!(store.records().await.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn start__bad_settings_send_failure_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("chargeback.toml");
        std::fs::write(
            &config,
            "[slurm]\nassoc_backend = \"ldap\"\n\n[notification]\nwebhook_url = \"http://127.0.0.1:9/hook\"\n",
        )
        .unwrap();
        let args = Args {
            config: Some(config),
            days: None,
            verbose: 0,
        };
        let settings = load_settings(&args);
        assert!(settings.is_err());

        let (fallback, settings) = with_notifier(settings);
        assert!(settings.is_err());
        assert!(fallback.send_failure(Path::new("/nonexistent.log")).await.is_ok());

        let notifier = RecordingNotifier::default();
        let log = Path::new("/var/log/chargeback.log");
        let error = start(settings, &notifier, log).await.unwrap_err();
        assert!(format!("{error:#}").contains("ldap"));
        assert_eq!(notifier.sent().await, [Notification::Failure { log: log.to_owned() }]);
    }

    #[test_log::test(tokio::test)]
    async fn finish__store_failure_sends_failure() {
        let notifier = RecordingNotifier::default();
        let log = Path::new("/var/log/chargeback.log");

        let jobs = (1..=3)
            .map(|id| {
                let mut job = raw_job(id);
                job.time_end = Local::now().timestamp() - 24 * 3600;
                job.time_start = job.time_end - 600;
                job
            })
            .collect();
        let source = MemorySource::new(jobs);
        let store = MemoryStore::default();
        for id in 1..=3 {
            store.fail_inserts_of(id).await;
        }
        let identity = identity();
        let ingestor = Ingestor {
            source: &source,
            store: &store,
            identity: &identity,
        };
        let result = ingestor.run(&options(), &Local::now()).await;

        assert!(finish(&notifier, log, result).await.is_err());
        assert_eq!(notifier.sent().await, [Notification::Failure { log: log.to_owned() }]);
    }

    #[test_log::test(tokio::test)]
    async fn finish__error_survives_notification_failure() {
        let timeout = std::time::Duration::from_millis(200);
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook".to_owned(), timeout).unwrap();
        let result = finish(&notifier, Path::new("/nonexistent.log"), Err(eyre!("accounting DB down"))).await;
        assert!(result.unwrap_err().to_string().contains("accounting DB down"));
    }
}
