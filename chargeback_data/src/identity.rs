//! uid → username and username → billing group.
//!
//! Two ways to ask the system who a uid is: a snapshot of `/etc/passwd` + `/etc/group` copied from a
//! login node ([`IdentitySnapshot`]), or running `id` there ([`CommandIdentity`]). Which *group* a
//! user is billed to is decided by the [`AssocBackend`].
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use color_eyre::{eyre::Context as _, Result};
use itertools::Itertools as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{process::Command, sync::Mutex};
use tracing::{debug, error, instrument};

use crate::UNKNOWN;

/// Group name suffix of billing groups in `/etc/group`.
pub const BILLING_GROUP_SUFFIX: &str = "-G";

#[derive(Debug, Error)]
pub enum IdentityLookupError {
    #[error("no user with uid {0}")]
    UnknownUid(u32),
    #[error("no user named `{0}`")]
    UnknownUser(String),
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("running `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn username(&self, uid: u32) -> Result<String, IdentityLookupError>;

    /// All groups `username` is a member of, primary group first (like `id -Gn`).
    async fn groups(&self, username: &str) -> Result<Vec<String>, IdentityLookupError>;
}

/// Where a user's billing group comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssocBackend {
    /// Membership in a `*-G` group in `/etc/group`.
    #[serde(rename = "etc_group")]
    EtcGroup,
    /// The job's account, or the user's (default) association in `slurm_acct_db`.
    #[serde(rename = "slurm_acctdb")]
    SlurmAcctdb,
}

/// A row of `<cluster>_assoc_table`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAssociation {
    pub user: String,
    pub account: Option<String>,
    pub is_default: bool,
}

/// [`IdentityResolver::username`], falling back to [`UNKNOWN`].
pub async fn resolve_username(identity: &dyn IdentityResolver, uid: u32) -> String {
    match identity.username(uid).await {
        Ok(name) => name,
        Err(e) => {
            error!("Failed to map UID {uid} to username: {e}");
            UNKNOWN.to_owned()
        }
    }
}

/// Billing group of `username`, [`UNKNOWN`] if there is none.
pub async fn resolve_group_name(
    account_name: Option<&str>,
    username: &str,
    backend: AssocBackend,
    associations: &[AccountAssociation],
    identity: &dyn IdentityResolver,
) -> String {
    match backend {
        AssocBackend::SlurmAcctdb => match account_name.filter(|account| !account.is_empty()) {
            Some(account) => account.to_owned(),
            None => association_account(associations, username),
        },
        AssocBackend::EtcGroup => {
            let groups = identity.groups(username).await.unwrap_or_else(|e| {
                error!("Failed to get group list of user `{username}`: {e}");
                Vec::new()
            });
            match groups.into_iter().find(|group| is_billing_group(group)) {
                Some(group) => group,
                None => {
                    error!("Failed to map user `{username}` to a group ending in `{BILLING_GROUP_SUFFIX}`");
                    UNKNOWN.to_owned()
                }
            }
        }
    }
}

/// `^.+-G$`
pub fn is_billing_group(group: &str) -> bool {
    group.len() > BILLING_GROUP_SUFFIX.len() && group.ends_with(BILLING_GROUP_SUFFIX)
}

/// Account of the user's association. With several associations only the default one(s) count.
pub fn association_account(associations: &[AccountAssociation], username: &str) -> String {
    let mut matched = associations.iter().filter(|assoc| assoc.user == username).collect_vec();
    if matched.len() > 1 {
        debug!("Found {} associations for `{username}`, filtering to default", matched.len());
        matched.retain(|assoc| assoc.is_default);
    }

    match matched.first() {
        Some(AccountAssociation { account: Some(account), .. }) if !account.is_empty() => account.clone(),
        Some(_) => {
            error!("Failed to map user `{username}` to Slurm association account: match found, but account was empty");
            UNKNOWN.to_owned()
        }
        None => {
            error!("Failed to map user `{username}` to Slurm association account: no match in association table");
            UNKNOWN.to_owned()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PasswdEntry {
    name: String,
    primary_gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GroupEntry {
    name: String,
    gid: u32,
    members: Vec<String>,
}

/// Pre-fetched `/etc/passwd` and `/etc/group` of the cluster.
#[derive(Debug, Clone, Default)]
pub struct IdentitySnapshot {
    users: HashMap<u32, PasswdEntry>,
    groups: Vec<GroupEntry>,
}

impl IdentitySnapshot {
    /// Unparsable lines (comments, NIS `+` entries, …) are skipped.
    pub fn parse(passwd: &str, group: &str) -> Self {
        let mut users: HashMap<u32, PasswdEntry> = HashMap::new();
        for line in passwd.lines() {
            // name:password:uid:gid:gecos:home:shell
            let fields = line.split(':').collect_vec();
            if let [name, _, uid, gid, ..] = fields.as_slice() {
                if let (Ok(uid), Ok(primary_gid)) = (uid.parse(), gid.parse()) {
                    // first entry wins, same as getpwuid
                    users.entry(uid).or_insert_with(|| PasswdEntry {
                        name: name.to_string(),
                        primary_gid,
                    });
                }
            }
        }

        let groups = group
            .lines()
            .filter_map(|line| {
                // name:password:gid:member,member
                let fields = line.split(':').collect_vec();
                match fields.as_slice() {
                    [name, _, gid, members] => Some(GroupEntry {
                        name: name.to_string(),
                        gid: gid.parse().ok()?,
                        members: members
                            .split(',')
                            .map(str::trim)
                            .filter(|m| !m.is_empty())
                            .map(String::from)
                            .collect(),
                    }),
                    _ => None,
                }
            })
            .collect();

        IdentitySnapshot { users, groups }
    }

    #[instrument(err)]
    pub async fn load(passwd_file: &Path, group_file: &Path) -> Result<Self> {
        let passwd = tokio::fs::read_to_string(passwd_file)
            .await
            .wrap_err_with(|| format!("reading passwd snapshot {passwd_file:?}"))?;
        let group = tokio::fs::read_to_string(group_file)
            .await
            .wrap_err_with(|| format!("reading group snapshot {group_file:?}"))?;
        let snapshot = Self::parse(&passwd, &group);
        debug!(users = snapshot.users.len(), groups = snapshot.groups.len(), "identity snapshot loaded");
        Ok(snapshot)
    }
}

#[async_trait]
impl IdentityResolver for IdentitySnapshot {
    async fn username(&self, uid: u32) -> Result<String, IdentityLookupError> {
        self.users
            .get(&uid)
            .map(|user| user.name.clone())
            .ok_or(IdentityLookupError::UnknownUid(uid))
    }

    async fn groups(&self, username: &str) -> Result<Vec<String>, IdentityLookupError> {
        let user = self
            .users
            .values()
            .find(|user| user.name == username)
            .ok_or_else(|| IdentityLookupError::UnknownUser(username.to_owned()))?;

        let primary = self.groups.iter().find(|group| group.gid == user.primary_gid);
        let supplementary = self
            .groups
            .iter()
            .filter(|group| group.gid != user.primary_gid && group.members.iter().any(|m| m == username));

        Ok(primary.into_iter().chain(supplementary).map(|group| group.name.clone()).unique().collect())
    }
}

/// Asks the system via `id`, optionally on another host through `ssh`. Answers are cached for the
/// lifetime of the resolver (one ingestion run), failed lookups as `None` so a missing user costs
/// one `id` call per run and not one per job.
#[derive(Debug)]
pub struct CommandIdentity {
    ssh_host: Option<String>,
    timeout: Duration,
    usernames: Mutex<HashMap<u32, Option<String>>>,
    groups: Mutex<HashMap<String, Option<Vec<String>>>>,
}

impl CommandIdentity {
    pub fn new(ssh_host: Option<String>, timeout: Duration) -> Self {
        CommandIdentity {
            ssh_host,
            timeout,
            usernames: Mutex::default(),
            groups: Mutex::default(),
        }
    }

    /// Fails if `id` can't be run at all, so a broken ssh setup aborts the run before any job is
    /// processed.
    pub async fn check(&self) -> Result<()> {
        self.id(&["-nu"]).await.wrap_err("checking that `id` can be run")?;
        Ok(())
    }

    fn command_line(&self, args: &[&str]) -> Vec<String> {
        let id = std::iter::once("id").chain(args.iter().copied()).map(String::from);
        match &self.ssh_host {
            Some(host) => ["ssh", "-o", "BatchMode=yes", host.as_str()]
                .into_iter()
                .map(String::from)
                .chain(id)
                .collect(),
            None => id.collect(),
        }
    }

    #[instrument(skip(self))]
    async fn id(&self, args: &[&str]) -> Result<String, IdentityLookupError> {
        let command_line = self.command_line(args);
        let command = command_line.join(" ");
        let (program, args) = command_line.split_first().ok_or_else(|| IdentityLookupError::Command {
            command: command.clone(),
            stderr: "empty command line".to_owned(),
        })?;

        let output = tokio::time::timeout(self.timeout, Command::new(program).args(args).kill_on_drop(true).output())
            .await
            .map_err(|_| IdentityLookupError::Timeout {
                command: command.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| IdentityLookupError::Io {
                command: command.clone(),
                source,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        if !output.status.success() || !stderr.is_empty() {
            return Err(IdentityLookupError::Command { command, stderr });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }
}

#[async_trait]
impl IdentityResolver for CommandIdentity {
    async fn username(&self, uid: u32) -> Result<String, IdentityLookupError> {
        if let Some(cached) = self.usernames.lock().await.get(&uid) {
            return cached.clone().ok_or(IdentityLookupError::UnknownUid(uid));
        }
        let name = self
            .id(&["-nu", &uid.to_string()])
            .await
            .and_then(|name| if name.is_empty() { Err(IdentityLookupError::UnknownUid(uid)) } else { Ok(name) });
        self.usernames.lock().await.insert(uid, name.as_ref().ok().cloned());
        name
    }

    async fn groups(&self, username: &str) -> Result<Vec<String>, IdentityLookupError> {
        if let Some(cached) = self.groups.lock().await.get(username) {
            return cached.clone().ok_or_else(|| IdentityLookupError::UnknownUser(username.to_owned()));
        }
        let groups = self
            .id(&["-Gn", username])
            .await
            .map(|groups| groups.split_whitespace().map(String::from).collect_vec());
        self.groups.lock().await.insert(username.to_owned(), groups.as_ref().ok().cloned());
        groups
    }
}

/// Which [`IdentityResolver`] to build, see `identity` in the settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentitySource {
    Snapshot { passwd_file: PathBuf, group_file: PathBuf },
    Command { ssh_host: Option<String> },
}

impl IdentitySource {
    /// Any failure here is a setup failure of the ingestion run.
    pub async fn connect(&self, timeout: Duration) -> Result<Box<dyn IdentityResolver>> {
        Ok(match self {
            IdentitySource::Snapshot { passwd_file, group_file } => {
                Box::new(IdentitySnapshot::load(passwd_file, group_file).await?)
            }
            IdentitySource::Command { ssh_host } => {
                let identity = CommandIdentity::new(ssh_host.clone(), timeout);
                identity.check().await?;
                Box::new(identity)
            }
        })
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use super::*;

    const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
alice:x:1001:2001:Alice:/home/alice:/bin/bash
bob:x:1002:100:Bob:/home/bob:/bin/zsh
# a comment
+::::::
carol:x:1003:100::/home/carol:/bin/bash
";

    const GROUP: &str = "\
root:x:0:
users:x:100:
alice:x:2001:
physics-G:x:3001:alice,bob
chemistry-G:x:3002:alice
-G:x:3003:carol
docker:x:999:bob
";

    fn snapshot() -> IdentitySnapshot {
        IdentitySnapshot::parse(PASSWD, GROUP)
    }

    fn assoc(user: &str, account: &str, is_default: bool) -> AccountAssociation {
        AccountAssociation {
            user: user.to_owned(),
            account: Some(account.to_owned()),
            is_default,
        }
    }

    #[tokio::test]
    async fn IdentitySnapshot__username() {
        let snapshot = snapshot();
        assert_eq!(snapshot.username(1001).await.unwrap(), "alice");
        assert_eq!(snapshot.username(0).await.unwrap(), "root");
        assert!(matches!(snapshot.username(4242).await, Err(IdentityLookupError::UnknownUid(4242))));
    }

    #[tokio::test]
    async fn IdentitySnapshot__groups__primary_first() {
        let snapshot = snapshot();
        assert_eq!(snapshot.groups("alice").await.unwrap(), ["alice", "physics-G", "chemistry-G"]);
        assert_eq!(snapshot.groups("bob").await.unwrap(), ["users", "physics-G", "docker"]);
        assert!(snapshot.groups("mallory").await.is_err());
    }

    #[tokio::test]
    async fn IdentitySnapshot__load__from_files() {
        let dir = tempfile::tempdir().unwrap();
        let passwd = dir.path().join("passwd");
        let group = dir.path().join("group");
        std::fs::write(&passwd, PASSWD).unwrap();
        std::fs::write(&group, GROUP).unwrap();

        let snapshot = IdentitySnapshot::load(&passwd, &group).await.unwrap();
        assert_eq!(snapshot.username(1003).await.unwrap(), "carol");

        assert!(IdentitySnapshot::load(&dir.path().join("nope"), &group).await.is_err());
    }

    #[test]
    fn is_billing_group__suffix() {
        assert!(is_billing_group("physics-G"));
        assert!(is_billing_group("x-G"));
        assert!(!is_billing_group("-G"));
        assert!(!is_billing_group("physics-g"));
        assert!(!is_billing_group("physics-G-old"));
    }

    #[test]
    fn association_account__default_wins() {
        let table = [
            assoc("alice", "physics", false),
            assoc("alice", "chemistry", true),
            assoc("bob", "biology", false),
        ];
        assert_eq!(association_account(&table, "alice"), "chemistry");
        assert_eq!(association_account(&table, "bob"), "biology");
    }

    #[test]
    fn association_account__single_non_default_match() {
        let table = [assoc("alice", "physics", false)];
        assert_eq!(association_account(&table, "alice"), "physics");
    }

    #[test]
    fn association_account__missing() {
        let table = [assoc("alice", "physics", true)];
        assert_eq!(association_account(&table, "bob"), UNKNOWN);
        assert_eq!(association_account(&[], "alice"), UNKNOWN);

        let no_default = [assoc("carol", "a", false), assoc("carol", "b", false)];
        assert_eq!(association_account(&no_default, "carol"), UNKNOWN);

        let null_account = [AccountAssociation {
            user: "dave".to_owned(),
            account: None,
            is_default: true,
        }];
        assert_eq!(association_account(&null_account, "dave"), UNKNOWN);
    }

    #[tokio::test]
    async fn resolve_group_name__acctdb_prefers_job_account() {
        let snapshot = snapshot();
        let table = [assoc("alice", "physics", true)];
        let group = resolve_group_name(Some("astro"), "alice", AssocBackend::SlurmAcctdb, &table, &snapshot).await;
        assert_eq!(group, "astro");
        let group = resolve_group_name(Some(""), "alice", AssocBackend::SlurmAcctdb, &table, &snapshot).await;
        assert_eq!(group, "physics");
        let group = resolve_group_name(None, "alice", AssocBackend::SlurmAcctdb, &table, &snapshot).await;
        assert_eq!(group, "physics");
    }

    #[tokio::test]
    async fn resolve_group_name__etc_group() {
        let snapshot = snapshot();
        let group = resolve_group_name(None, "alice", AssocBackend::EtcGroup, &[], &snapshot).await;
        assert_eq!(group, "physics-G");
        // `-G` alone doesn't count
        let group = resolve_group_name(None, "carol", AssocBackend::EtcGroup, &[], &snapshot).await;
        assert_eq!(group, UNKNOWN);
        let group = resolve_group_name(None, "mallory", AssocBackend::EtcGroup, &[], &snapshot).await;
        assert_eq!(group, UNKNOWN);
    }

    #[tokio::test]
    async fn resolve_username__falls_back_to_unknown() {
        let snapshot = snapshot();
        assert_eq!(resolve_username(&snapshot, 1002).await, "bob");
        assert_eq!(resolve_username(&snapshot, 31337).await, UNKNOWN);
    }

    #[test]
    fn CommandIdentity__command_line() {
        let local = CommandIdentity::new(None, Duration::from_secs(1));
        assert_eq!(local.command_line(&["-nu", "1001"]), ["id", "-nu", "1001"]);

        let remote = CommandIdentity::new(Some("login01".to_owned()), Duration::from_secs(1));
        assert_eq!(
            remote.command_line(&["-Gn", "alice"]),
            ["ssh", "-o", "BatchMode=yes", "login01", "id", "-Gn", "alice"]
        );
    }

    #[tokio::test]
    async fn CommandIdentity__failed_lookups_are_cached() {
        let identity = CommandIdentity::new(None, Duration::from_secs(5));

        // the first miss comes from `id` itself (or from not finding `id`), the second from the cache
        let uid = 4_000_000_000;
        assert!(identity.username(uid).await.is_err());
        assert!(matches!(identity.username(uid).await, Err(IdentityLookupError::UnknownUid(u)) if u == uid));

        let user = "no-such-user-4000000000";
        assert!(identity.groups(user).await.is_err());
        assert!(matches!(identity.groups(user).await, Err(IdentityLookupError::UnknownUser(u)) if u == user));
    }

    #[test]
    fn AssocBackend__deserialize() {
        let backend: AssocBackend = serde_json::from_str("\"etc_group\"").unwrap();
        assert_eq!(backend, AssocBackend::EtcGroup);
        let backend: AssocBackend = serde_json::from_str("\"slurm_acctdb\"").unwrap();
        assert_eq!(backend, AssocBackend::SlurmAcctdb);
        assert!(serde_json::from_str::<AssocBackend>("\"ldap\"").is_err());
    }
}
