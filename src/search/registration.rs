use crate::error::{HarnessError, Result};
use crate::parse::{ClusterEndpoint, SourceDatabase};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Connector flavour understood by the engine's river endpoint.
pub const SOURCE_TYPE: &str = "mongodb";

/// Database the connector reads the replication stream (oplog) from.
pub const REPLICATION_DB: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Credential {
    pub db: String,
    pub auth: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollingOptions {
    pub secondary_read_preference: bool,
    pub drop_collection: bool,
    pub is_mongos: bool,
}

impl Default for PollingOptions {
    fn default() -> Self {
        Self {
            secondary_read_preference: false,
            drop_collection: true,
            is_mongos: false,
        }
    }
}

/// One change-data-capture connector, keyed by its source collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRegistration {
    pub source_collection: String,
    pub target_index_name: String,
    pub bulk_size: u32,
    pub bulk_timeout_seconds: u32,
    pub servers: Vec<ClusterEndpoint>,
    pub connection_credentials: Vec<Credential>,
    pub polling_options: PollingOptions,
}

#[derive(Debug, Serialize)]
struct ServerAddress<'a> {
    host: &'a str,
    port: u16,
}

#[derive(Debug, Serialize)]
struct MongoSource<'a> {
    servers: Vec<ServerAddress<'a>>,
    credentials: &'a [Credential],
    db: &'a str,
    collection: &'a str,
    gridfs: bool,
    options: PollingOptions,
}

#[derive(Debug, Serialize)]
struct IndexTarget<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    bulk_size: u32,
    bulk_timeout: u32,
}

/// The meta document stored under `_river/<collection>/_meta`.
#[derive(Debug, Serialize)]
pub struct RiverDocument<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    mongodb: MongoSource<'a>,
    index: IndexTarget<'a>,
}

impl IndexRegistration {
    /*
        @@@
        @for_collection();
        . Describes a connector from `source` into an index named after the source database.
        . Two credentials are needed: one to tail the replication stream in `local`, one to read the collection.
        . Rejects empty or path-unsafe collection names and an empty server list.
    */
    pub fn for_collection(
        source: &SourceDatabase,
        collection: &str,
        bulk_size: u32,
        bulk_timeout_seconds: u32,
    ) -> Result<Self> {
        let invalid = |reason: &str| HarnessError::IndexRegistration {
            collection: collection.to_string(),
            reason: reason.to_string(),
        };
        if collection.trim().is_empty() {
            return Err(invalid("collection name is empty"));
        }
        if collection.contains(['/', '?', '#', ' ']) {
            return Err(invalid("collection name must not contain '/', '?', '#' or spaces"));
        }
        if source.servers.is_empty() {
            return Err(invalid("no database servers to read from"));
        }

        let credential = |db: &str| Credential {
            db: db.to_string(),
            auth: source.database.clone(),
            user: source.username.clone(),
            password: source.password.clone(),
        };

        Ok(Self {
            source_collection: collection.to_string(),
            target_index_name: source.database.clone(),
            bulk_size,
            bulk_timeout_seconds,
            servers: source.servers.clone(),
            connection_credentials: vec![credential(REPLICATION_DB), credential(&source.database)],
            polling_options: PollingOptions::default(),
        })
    }

    pub fn document(&self) -> RiverDocument<'_> {
        RiverDocument {
            kind: SOURCE_TYPE,
            mongodb: MongoSource {
                servers: self
                    .servers
                    .iter()
                    .map(|s| ServerAddress { host: &s.host, port: s.port })
                    .collect(),
                credentials: &self.connection_credentials,
                db: &self.target_index_name,
                collection: &self.source_collection,
                gridfs: false,
                options: self.polling_options,
            },
            index: IndexTarget {
                name: &self.target_index_name,
                kind: &self.source_collection,
                bulk_size: self.bulk_size,
                bulk_timeout: self.bulk_timeout_seconds,
            },
        }
    }

    pub fn to_json(&self) -> Result<Value> {
        serde_json::to_value(self.document()).map_err(|e| HarnessError::IndexRegistration {
            collection: self.source_collection.clone(),
            reason: e.to_string(),
        })
    }
}

/// One ranked hit, surfaced as `{id, score, source}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResultRecord {
    #[serde(rename = "id")]
    pub document_id: String,
    #[serde(rename = "score")]
    pub relevance_score: f64,
    #[serde(rename = "source")]
    pub source_fields: Map<String, Value>,
}
