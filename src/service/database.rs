use crate::error::Result;
use crate::parse::{
    ClusterEndpoint, DatabaseConfig, ProvisioningSpec, ReplicaSetConfig, SourceDatabase,
};
use crate::process::SpawnSpec;
use crate::script::ScriptRunner;
use crate::service::{EmbeddedService, LifecycleState, ResolvedDataDir, ServiceCore};
use crate::teardown::TeardownRegistry;
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Left in the data directory by a mongod that did not shut down cleanly.
pub const LOCK_FILE: &str = "mongod.lock";

const ADMIN_DB: &str = "admin";

/// Embedded `mongod` with optional replica set and provisioned accounts.
#[derive(Clone)]
pub struct DatabaseClusterController {
    core: Arc<ServiceCore>,
    config: Arc<DatabaseConfig>,
}

impl DatabaseClusterController {
    pub fn new(config: DatabaseConfig) -> Self {
        Self::with_registry(config, TeardownRegistry::global())
    }

    pub fn with_registry(config: DatabaseConfig, registry: &'static TeardownRegistry) -> Self {
        let core = ServiceCore::new("mongod", config.stop_timeout(), registry);
        Self {
            core,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn instance_id(&self) -> u64 {
        self.core.id()
    }

    /// Bound endpoint; only available while running.
    pub fn endpoint(&self) -> Result<ClusterEndpoint> {
        if self.core.state() != LifecycleState::Running {
            return Err(self.core.invalid("report an endpoint"));
        }
        Ok(self.config.endpoint().clone())
    }

    /// What a search connector needs to read from this database.
    pub fn source(&self) -> SourceDatabase {
        self.config.source()
    }

    pub async fn data_dir(&self) -> Option<PathBuf> {
        self.core.data_dir().await
    }

    /// Process id of the running mongod, if one was spawned.
    pub async fn pid(&self) -> Option<u32> {
        self.core.pid().await
    }

    pub async fn recent_output(&self) -> Vec<String> {
        self.core.recent_output().await
    }

    fn mongod_spec(&self, endpoint: &ClusterEndpoint, dbpath: &Path, replica: Option<&ReplicaSetConfig>) -> SpawnSpec {
        let mut spec = SpawnSpec::new(self.core.name(), &self.config.mongod_bin).args([
            "--bind_ip".to_string(),
            endpoint.host.clone(),
            "--port".to_string(),
            endpoint.port.to_string(),
            "--dbpath".to_string(),
            dbpath.display().to_string(),
        ]);
        if self.config.auth {
            spec = spec.arg("--auth");
        }
        if let Some(rs) = replica {
            spec = spec.args(["--replSet".to_string(), rs.replica_set_name.clone()]);
        }
        spec.args(self.config.mongod_args.iter().cloned())
    }

    /*
        @@@
        @launch();
        . Resolves the data directory, clears a stale lock file in replica-set mode, spawns mongod.
        . Waits for mongod to accept connections, then initiates the replica set and waits for PRIMARY.
        . Runs the provisioning script and waits for the user-added token.
    */
    async fn launch(&self) -> Result<()> {
        let endpoint = self.config.endpoint().clone();
        let replica = self.config.replica_set();
        let timeout = self.config.init_timeout();
        let tokens = &self.config.tokens;

        info!(
            replica_set = ?self.config.source().servers.iter().map(ToString::to_string).collect::<Vec<_>>(),
            replica_set_name = ?self.config.replica_set_name,
            data_directory = ?self.config.data_directory,
            "Starting embedded MongoDB instance"
        );

        let data_dir = ResolvedDataDir::resolve(&self.config.data_directory, "mongo-data")?;
        if replica.is_some() {
            remove_stale_lock(data_dir.path());
        }
        let spec = self.mongod_spec(&endpoint, data_dir.path(), replica.as_ref());
        let output = self
            .core
            .launch(data_dir, spec, &[tokens.ready.as_str(), tokens.primary.as_str()])
            .await?;
        output.wait_for(&tokens.ready, timeout).await?;

        let shell = ScriptRunner::for_endpoint(&self.config.shell_bin, &endpoint)
            .named("mongo-shell")
            .args(self.config.shell_args.iter().cloned());

        if let Some(rs) = &replica {
            shell.run(&initiate_script(rs, &endpoint), None, timeout).await?;
            output.wait_for(&tokens.primary, timeout).await?;
            info!(replica_set_name = %rs.replica_set_name, "Replica set initiated");
        }

        shell
            .run(
                &provisioning_script(&self.config.provisioning()),
                Some(&tokens.user_added),
                timeout,
            )
            .await?;
        info!(database = %self.config.database, "Users provisioned");
        Ok(())
    }
}

#[async_trait]
impl EmbeddedService for DatabaseClusterController {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn state(&self) -> LifecycleState {
        self.core.state()
    }

    async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            debug!("Embedded MongoDB disabled, not starting");
            return Ok(());
        }
        self.core.begin_start()?;
        match self.launch().await {
            Ok(()) => {
                if self.core.mark_running() {
                    info!(endpoint = %self.config.endpoint(), "Embedded MongoDB is running");
                    Ok(())
                } else {
                    let err = self.core.invalid("finish starting");
                    self.core.shutdown().await;
                    Err(err)
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to startup embedded MongoDB");
                Err(e)
            }
        }
    }

    async fn stop(&self) {
        if !self.config.enabled {
            return;
        }
        self.core.shutdown().await;
    }
}

fn remove_stale_lock(dbpath: &Path) {
    let lock = dbpath.join(LOCK_FILE);
    match std::fs::remove_file(&lock) {
        Ok(()) => info!(path = %lock.display(), "Removed stale lock file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %lock.display(), error = %e, "Lock file removal failed"),
    }
}

/// `rs.initiate` with the locally bound node as the only member.
pub fn initiate_script(rs: &ReplicaSetConfig, endpoint: &ClusterEndpoint) -> String {
    let config = json!({
        "_id": rs.replica_set_name,
        "members": [{ "_id": 0, "host": endpoint.to_string() }],
    });
    format!("rs.initiate({config});\nrs.slaveOk();\nrs.status();\n")
}

/// Creates the administrative account, authenticates as it, then creates the
/// application account in the target database.
pub fn provisioning_script(spec: &ProvisioningSpec) -> String {
    let admin = json!({
        "user": spec.admin_username,
        "pwd": spec.admin_password,
        "roles": [
            "dbAdminAnyDatabase",
            "clusterAdmin",
            "dbOwner",
            "userAdminAnyDatabase",
            { "db": "local", "role": "dbAdmin" },
        ],
    });
    let mut script = format!(
        "db = db.getSiblingDB({admin_db});\ndb.createUser({admin});\ndb.auth({user}, {pwd});\n",
        admin_db = json!(ADMIN_DB),
        user = json!(spec.admin_username),
        pwd = json!(spec.admin_password),
    );
    if !spec.app_username.is_empty() {
        let app = json!({
            "user": spec.app_username,
            "pwd": spec.app_password,
            "roles": spec.roles,
        });
        script.push_str(&format!(
            "db = db.getSiblingDB({db});\ndb.createUser({app});\ndb.getUser({user});\n",
            db = json!(spec.target_database),
            user = json!(spec.app_username),
        ));
    }
    script
}
