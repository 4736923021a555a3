pub mod data;

use std::{fmt::Display, path::PathBuf, sync::Arc};

use chargeback_data::{
    report::{ReportTarget, Reporter},
    settings::Settings,
};
use clap::Parser;
use color_eyre::{eyre::Context as _, Result};
use data::{GroupName, SlurmUser, DEFAULT_JOB_LIMIT};
use database::ChargebackDb;
use poem::{http::StatusCode, listener::TcpListener, Endpoint, EndpointExt as _, Route, Server};
use poem_openapi::{
    param::{Path, Query},
    payload::Json,
    OpenApi, OpenApiService,
};
use serde::Serialize;
use tracing::{debug, error, info, level_filters::LevelFilter};

/// GPU usage and cost of Slurm jobs, from the chargeback table.
struct Api {
    reporter: Reporter,
}

#[OpenApi]
impl Api {
    fn err_into_500(error: impl Display) -> poem::Error {
        error!("Error generated during API call: {error:#}");
        poem::Error::from_string(format!("{error:#}"), StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn return_json<T, E>(data: Result<T, E>) -> Result<Json<serde_json::Value>, poem::Error>
    where
        T: Serialize,
        E: Display,
    {
        let json = serde_json::to_value(&data.map_err(Self::err_into_500)?).map_err(Self::err_into_500)?;
        Ok(Json(json))
    }

    /// GPU usage report of one user.
    ///
    /// Covers the jobs that ended in the last `months` months (default from the server settings).
    /// By default these are all jobs that ran at least the configured minimum duration; with
    /// `completed_only=true` only `COMPLETED` jobs, regardless of duration.
    ///
    /// Minutes, hours and cost are decimal strings with exactly 3 decimals.
    #[oai(path = "/report/users/:username", method = "get")]
    async fn user_report(
        &self,
        username: Path<SlurmUser>,
        months: Query<Option<u32>>,
        completed_only: Query<Option<bool>>,
    ) -> Result<Json<serde_json::Value>, poem::Error> {
        let query = self.reporter.query(months.0, completed_only.0.unwrap_or(false));
        let target = ReportTarget::user(username.0);
        Self::return_json(self.reporter.report(&target, query).await)
    }

    /// GPU usage report of one billing group. Same parameters as the user report.
    #[oai(path = "/report/groups/:groupname", method = "get")]
    async fn group_report(
        &self,
        groupname: Path<GroupName>,
        months: Query<Option<u32>>,
        completed_only: Query<Option<bool>>,
    ) -> Result<Json<serde_json::Value>, poem::Error> {
        let query = self.reporter.query(months.0, completed_only.0.unwrap_or(false));
        let target = ReportTarget::group(groupname.0);
        Self::return_json(self.reporter.report(&target, query).await)
    }

    /// GPU usage report of the group `username` was billed to most recently.
    ///
    /// Users without any job get an empty report for group `UNKNOWN`.
    #[oai(path = "/report/users/:username/group", method = "get")]
    async fn users_group_report(
        &self,
        username: Path<SlurmUser>,
        months: Query<Option<u32>>,
        completed_only: Query<Option<bool>>,
    ) -> Result<Json<serde_json::Value>, poem::Error> {
        let query = self.reporter.query(months.0, completed_only.0.unwrap_or(false));
        Self::return_json(self.reporter.group_report_of_user(&username.0, query).await)
    }

    /// The `limit` (default 10) most recently finished jobs.
    #[oai(path = "/jobs", method = "get")]
    async fn recent_jobs(&self, limit: Query<Option<usize>>) -> Result<Json<serde_json::Value>, poem::Error> {
        Self::return_json(self.reporter.store().recent_jobs(limit.0.unwrap_or(DEFAULT_JOB_LIMIT)).await)
    }

    /// Completed jobs of a user that ended in the last `months` months, newest first.
    #[oai(path = "/jobs/users/:username", method = "get")]
    async fn user_jobs(
        &self,
        username: Path<SlurmUser>,
        months: Query<Option<u32>>,
    ) -> Result<Json<serde_json::Value>, poem::Error> {
        let months = self.reporter.query(months.0, true).months();
        Self::return_json(self.reporter.store().jobs_for_user(&username.0, months).await)
    }
}

fn app(reporter: Reporter, server_url: &str) -> impl Endpoint {
    let api_service =
        OpenApiService::new(Api { reporter }, "Slurm GPU chargeback", env!("CARGO_PKG_VERSION")).server(server_url);
    let ui = api_service.swagger_ui();
    Route::new().nest("/", api_service).nest("/docs", ui).around(|route, request| async move {
        // request logging middleware
        debug!(?request, "received request");
        route.call(request).await
    })
}

#[derive(Debug, Clone, clap::Parser)]
pub struct Args {
    /// Settings file, replaces `config/default.toml` and `config/$RUN_MODE.toml`
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// `-v` debug, `-vv` trace
    #[arg(long, short, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// `worker_threads`: only workers for async tasks (tokio::spawn, main). spawn_blocking spawns extra threads
#[tokio::main(worker_threads = 4)]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt::fmt().with_max_level(level).init();

    let settings = Settings::new(args.config.as_deref())?;
    let db = Arc::new(
        ChargebackDb::connect(
            settings.chargeback_database_url()?,
            &settings.chargeback.table_name,
            settings.timeout(),
        )
        .await
        .wrap_err("connecting to the chargeback DB")?,
    );
    let reporter = Reporter::new(db.clone(), settings.report.clone());

    let addr = &settings.api.listen_addr;
    info!("Listening on {addr}, API docs at http://{addr}/docs");
    let server_result = Server::new(TcpListener::bind(addr)).run(app(reporter, &format!("http://{addr}"))).await;
    db.close().await;
    server_result.wrap_err_with(|| format!("serving on {addr}"))
}
