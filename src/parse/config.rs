use crate::error::{HarnessError, Result};
use crate::parse::endpoint::{parse_members, ClusterEndpoint};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use std::fs;

pub const DEFAULT_INIT_TIMEOUT_MS: u64 = 25_000;
pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

/// Ordered replica-set members. The first one is the node bound locally.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(try_from = "OneOrMany<String>")]
pub struct Members(Vec<ClusterEndpoint>);

impl Members {
    pub fn new(members: Vec<ClusterEndpoint>) -> Result<Self> {
        if members.is_empty() {
            return Err(HarnessError::Config("replica-set member list is empty".into()));
        }
        Ok(Self(members))
    }

    pub fn primary(&self) -> &ClusterEndpoint {
        &self.0[0]
    }

    pub fn all(&self) -> &[ClusterEndpoint] {
        &self.0
    }
}

impl TryFrom<OneOrMany<String>> for Members {
    type Error = HarnessError;

    fn try_from(raw: OneOrMany<String>) -> Result<Self> {
        let joined = match raw {
            OneOrMany::One(s) => s,
            OneOrMany::Many(v) => v.join(","),
        };
        Members::new(parse_members(&joined)?)
    }
}

impl Default for Members {
    fn default() -> Self {
        Self(vec![ClusterEndpoint::new("localhost", 37017)])
    }
}

/// Where an embedded service keeps its files.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(from = "Option<String>")]
pub enum DataDirectory {
    /// Fresh temporary directory, owned and removed by the controller.
    #[default]
    Ephemeral,
    Path(PathBuf),
}

impl From<Option<String>> for DataDirectory {
    fn from(raw: Option<String>) -> Self {
        match raw {
            None => DataDirectory::Ephemeral,
            Some(s) if s.trim().is_empty() => DataDirectory::Ephemeral,
            Some(s) if s.eq_ignore_ascii_case("ephemeral") || s == "TMP" => DataDirectory::Ephemeral,
            Some(s) => DataDirectory::Path(PathBuf::from(s)),
        }
    }
}

/// A role granted to the application user: either a bare role name or a
/// role scoped to another database.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum Role {
    Named(String),
    Scoped { db: String, role: String },
}

impl Role {
    pub fn named(role: impl Into<String>) -> Self {
        Role::Named(role.into())
    }

    pub fn scoped(db: impl Into<String>, role: impl Into<String>) -> Self {
        Role::Scoped { db: db.into(), role: role.into() }
    }
}

fn default_true() -> bool { true }
fn default_database() -> String { "test".into() }
fn default_admin() -> String { "admin".into() }
fn default_roles() -> Vec<Role> { vec![Role::named("readWrite")] }
fn default_mongod_bin() -> PathBuf { PathBuf::from("mongod") }
fn default_shell_bin() -> PathBuf { PathBuf::from("mongo") }
fn default_init_timeout() -> u64 { DEFAULT_INIT_TIMEOUT_MS }
fn default_stop_timeout() -> u64 { DEFAULT_STOP_TIMEOUT_MS }
fn default_ready_token() -> String { "waiting for connections".into() }
fn default_primary_token() -> String { "replSet PRIMARY".into() }
fn default_user_added_token() -> String { "Successfully added user".into() }

/// Output markers the database controller waits on.
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseTokens {
    #[serde(default = "default_ready_token")]
    pub ready: String,
    #[serde(default = "default_primary_token")]
    pub primary: String,
    #[serde(default = "default_user_added_token")]
    pub user_added: String,
}

impl Default for DatabaseTokens {
    fn default() -> Self {
        Self {
            ready: default_ready_token(),
            primary: default_primary_token(),
            user_added: default_user_added_token(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub replica_set: Members,
    #[serde(default)]
    pub replica_set_name: Option<String>,
    #[serde(default)]
    pub data_directory: DataDirectory,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_admin")]
    pub admin_username: String,
    #[serde(default = "default_admin")]
    pub admin_password: String,
    #[serde(default = "default_roles")]
    pub roles: Vec<Role>,
    #[serde(default = "default_true")]
    pub auth: bool,
    #[serde(default = "default_mongod_bin")]
    pub mongod_bin: PathBuf,
    #[serde(default)]
    pub mongod_args: Vec<String>,
    #[serde(default = "default_shell_bin")]
    pub shell_bin: PathBuf,
    #[serde(default)]
    pub shell_args: Vec<String>,
    #[serde(default = "default_init_timeout")]
    pub init_timeout_ms: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
    #[serde(default)]
    pub tokens: DatabaseTokens,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            replica_set: Members::default(),
            replica_set_name: None,
            data_directory: DataDirectory::Ephemeral,
            database: default_database(),
            username: String::new(),
            password: String::new(),
            admin_username: default_admin(),
            admin_password: default_admin(),
            roles: default_roles(),
            auth: true,
            mongod_bin: default_mongod_bin(),
            mongod_args: Vec::new(),
            shell_bin: default_shell_bin(),
            shell_args: Vec::new(),
            init_timeout_ms: DEFAULT_INIT_TIMEOUT_MS,
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
            tokens: DatabaseTokens::default(),
        }
    }
}

/// Replica-set settings; absent means a single non-replicated node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSetConfig {
    pub replica_set_name: String,
    pub data_directory: DataDirectory,
    pub seed_members: Vec<ClusterEndpoint>,
}

/// Accounts created once the database is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningSpec {
    pub admin_username: String,
    pub admin_password: String,
    pub app_username: String,
    pub app_password: String,
    pub target_database: String,
    pub roles: Vec<Role>,
}

/// Connection details the search engine connector uses to reach the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDatabase {
    pub servers: Vec<ClusterEndpoint>,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl DatabaseConfig {
    pub fn endpoint(&self) -> &ClusterEndpoint {
        self.replica_set.primary()
    }

    pub fn replica_set(&self) -> Option<ReplicaSetConfig> {
        self.replica_set_name.as_ref().map(|name| ReplicaSetConfig {
            replica_set_name: name.clone(),
            data_directory: self.data_directory.clone(),
            seed_members: self.replica_set.all().to_vec(),
        })
    }

    pub fn provisioning(&self) -> ProvisioningSpec {
        let mut roles: Vec<Role> = Vec::with_capacity(self.roles.len());
        for role in &self.roles {
            if !roles.contains(role) {
                roles.push(role.clone());
            }
        }
        ProvisioningSpec {
            admin_username: self.admin_username.clone(),
            admin_password: self.admin_password.clone(),
            app_username: self.username.clone(),
            app_password: self.password.clone(),
            target_database: self.database.clone(),
            roles,
        }
    }

    pub fn source(&self) -> SourceDatabase {
        SourceDatabase {
            servers: self.replica_set.all().to_vec(),
            database: self.database.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

fn default_search_bin() -> PathBuf { PathBuf::from("elasticsearch") }
fn default_http_port() -> u16 { 9200 }
fn default_cluster_name() -> String { "embedded-harness".into() }
fn default_started_token() -> String { "started".into() }
fn default_bulk_size() -> u32 { 1000 }
fn default_bulk_timeout() -> u32 { 30 }

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_search_bin")]
    pub bin: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub data_directory: DataDirectory,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    #[serde(default = "default_started_token")]
    pub ready_token: String,
    #[serde(default = "default_init_timeout")]
    pub init_timeout_ms: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_bulk_size")]
    pub bulk_size: u32,
    #[serde(default = "default_bulk_timeout")]
    pub bulk_timeout_secs: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bin: default_search_bin(),
            args: Vec::new(),
            data_directory: DataDirectory::Ephemeral,
            http_port: default_http_port(),
            cluster_name: default_cluster_name(),
            ready_token: default_started_token(),
            init_timeout_ms: DEFAULT_INIT_TIMEOUT_MS,
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
            bulk_size: default_bulk_size(),
            bulk_timeout_secs: default_bulk_timeout(),
        }
    }
}

impl SearchConfig {
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

fn default_log_dir() -> String { "logs".into() }
fn default_log_file() -> String { "harness.log".into() }
fn default_log_level() -> String { "info".into() }

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub directory: String,
    #[serde(default = "default_log_file")]
    pub file: String,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_dir(),
            file: default_log_file(),
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Collections registered with the search engine at start-up.
    #[serde(default)]
    pub collections: Vec<String>,
}



/*
    @@@
    @parser();
    . Reads the YAML config at `path`; I/O errors come back as HarnessError::Io.
    . Hands the text to serde_yaml; malformed YAML or a bad member list is a HarnessError::Config.
*/
pub fn parser(path: &str) -> Result<Config> {
    let yaml_file = fs::read_to_string(path)?;
    from_yaml(&yaml_file)
}

pub fn from_yaml(text: &str) -> Result<Config> {
    let parsed_config: Config = serde_yaml::from_str(text)?;
    Ok(parsed_config)
}
