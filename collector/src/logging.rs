use std::{
    fs::{self, File},
    path::Path,
    sync::Mutex,
};

use color_eyre::{eyre::Context as _, Result};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer as _};

/// Opens (truncates) the log file of this run, which is what gets sent along with the notification.
pub fn open_log_file(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir).wrap_err_with(|| format!("creating log directory {dir:?}"))?;
    }
    File::create(path).wrap_err_with(|| format!("creating log file {path:?}"))
}

/// stdout, plus the run log file if there is one.
pub fn init(level: LevelFilter, log_file: Option<File>) {
    let stdout = tracing_subscriber::fmt::layer().with_filter(level);
    let file = log_file.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .with_filter(level)
    });
    tracing_subscriber::registry().with(stdout).with(file).init();
}
