use clap::Parser;
use color_eyre::{eyre::bail, Result};

pub const DEFAULT_API_URL: &str = "http://localhost:30800";

/// Estimated GPU usage and charges of the current user or their billing group.
///
/// Non-root users can only see their own charges (`-u`) or their group's (`-g`). Root has to name
/// the user with `-U`.
#[derive(Debug, Clone, PartialEq, Parser)]
#[command(name = "charges", version)]
#[command(group = clap::ArgGroup::new("target").required(true).args(["user", "group"]))]
pub struct Args {
    /// Report on the jobs of the user
    #[arg(short = 'u')]
    pub user: bool,

    /// Report on the jobs of the user's billing group
    #[arg(short = 'g')]
    pub group: bool,

    /// Months to report on, counted back from today (default: server setting)
    #[arg(short = 'm', long)]
    pub months: Option<u32>,

    /// Run the report as this user. Only available to root
    #[arg(short = 'U')]
    pub as_user: Option<String>,

    #[arg(long, env = "CHARGES_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,
}

/// Login name of whoever runs the CLI, like `getpass.getuser()`.
pub fn current_user() -> Option<String> {
    ["LOGNAME", "USER", "LNAME", "USERNAME"]
        .into_iter()
        .find_map(|var| std::env::var(var).ok().filter(|name| !name.is_empty()))
}

impl Args {
    /// The user to report on. `current` is the login name of the caller.
    pub fn report_user(&self, current: &str) -> Result<String> {
        match (current, &self.as_user) {
            ("root", Some(user)) => Ok(user.clone()),
            ("root", None) => bail!("When running as root, you must specify a username to query with -U"),
            (_, Some(_)) => bail!("The -U option is only available to root"),
            (current, None) => Ok(current.to_owned()),
        }
    }

    /// Path (and query) of the report endpoint for `username`.
    pub fn endpoint(&self, username: &str) -> String {
        let path = if self.group {
            format!("/report/users/{username}/group")
        } else {
            format!("/report/users/{username}")
        };
        match self.months {
            Some(months) => format!("{path}?months={months}"),
            None => path,
        }
    }
}
