/* src/lib.rs */

// Re-export modules for both binary and tests
pub mod error;
pub mod logger;
pub mod parse;
pub mod process;
pub mod script;
pub mod search;
pub mod service;
pub mod shell;
pub mod teardown;
pub mod watcher;

pub use error::{HarnessError, Result};
pub use parse::{ClusterEndpoint, Config, DataDirectory, DatabaseConfig, SearchConfig};
pub use search::{IndexRegistration, SearchResultRecord};
pub use service::{
    DatabaseClusterController, EmbeddedService, LifecycleState, SearchEngineController,
};
pub use teardown::TeardownRegistry;
