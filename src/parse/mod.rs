mod config;
mod endpoint;

pub use config::{
    from_yaml, parser, Config, DataDirectory, DatabaseConfig, DatabaseTokens, LoggingConfig,
    Members, OneOrMany, ProvisioningSpec, ReplicaSetConfig, Role, SearchConfig, SourceDatabase,
    DEFAULT_INIT_TIMEOUT_MS, DEFAULT_STOP_TIMEOUT_MS,
};
pub use endpoint::{parse_members, ClusterEndpoint};
