mod cli;
mod render;

use chargeback_data::report::UsageReport;
use clap::Parser as _;
use cli::{current_user, Args};
use color_eyre::{
    eyre::{eyre, Context as _},
    Result,
};
use tracing::{debug, level_filters::LevelFilter};

const TITLE: &str = "Estimated Usage Report";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt::fmt().with_max_level(LevelFilter::WARN).init();
    let args = Args::parse();

    let current = current_user().ok_or_else(|| eyre!("Can't tell who you are: neither LOGNAME nor USER is set"))?;
    let username = args.report_user(&current)?;
    if username != current {
        println!("You are root. Run report as user: '{username}'");
    }

    let report = fetch_report(&args.api_url, &args.endpoint(&username)).await?;
    println!("{}", render::NOTICE);
    println!("{}", render_report(&report));
    Ok(())
}

async fn fetch_report(api_url: &str, endpoint: &str) -> Result<UsageReport> {
    let url = format!("{}{endpoint}", api_url.trim_end_matches('/'));
    debug!(%url, "fetching report");
    reqwest::get(&url)
        .await
        .and_then(|response| response.error_for_status())
        .wrap_err_with(|| format!("requesting {url}"))?
        .json::<UsageReport>()
        .await
        .wrap_err_with(|| format!("parsing the report from {url}"))
}

fn render_report(report: &UsageReport) -> String {
    render::table(TITLE, &report.rows())
}
