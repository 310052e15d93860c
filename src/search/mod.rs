mod client;
mod registration;

pub use client::SearchEngineClient;
pub use registration::{
    Credential, IndexRegistration, PollingOptions, RiverDocument, SearchResultRecord,
    REPLICATION_DB, SOURCE_TYPE,
};
