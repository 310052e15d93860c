use crate::error::Result;
use crate::parse::{SearchConfig, SourceDatabase};
use crate::process::SpawnSpec;
use crate::search::{IndexRegistration, SearchEngineClient, SearchResultRecord};
use crate::service::{EmbeddedService, LifecycleState, ResolvedDataDir, ServiceCore};
use crate::teardown::TeardownRegistry;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info};

/// Loopback only; the engine never listens on an external interface.
pub const LOCAL_HOST: &str = "127.0.0.1";

/// Embedded search engine that indexes database collections through a
/// connector. A disabled controller turns every operation into a no-op.
#[derive(Clone)]
pub struct SearchEngineController {
    core: Arc<ServiceCore>,
    config: Arc<SearchConfig>,
    source: Arc<SourceDatabase>,
    client: Arc<Mutex<Option<SearchEngineClient>>>,
    registrations: Arc<Mutex<BTreeMap<String, IndexRegistration>>>,
}

impl SearchEngineController {
    pub fn new(config: SearchConfig, source: SourceDatabase) -> Self {
        Self::with_registry(config, source, TeardownRegistry::global())
    }

    pub fn with_registry(
        config: SearchConfig,
        source: SourceDatabase,
        registry: &'static TeardownRegistry,
    ) -> Self {
        let core = ServiceCore::new("elasticsearch", config.stop_timeout(), registry);
        Self {
            core,
            config: Arc::new(config),
            source: Arc::new(source),
            client: Arc::new(Mutex::new(None)),
            registrations: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /*
        @@@
        @connect();
        . Uses an engine that is already running at `base_url` instead of launching one.
        . The controller is Running at once; stop() only forgets the engine, nothing is killed.
    */
    pub fn connect(
        config: SearchConfig,
        source: SourceDatabase,
        base_url: &str,
        registry: &'static TeardownRegistry,
    ) -> Result<Self> {
        let controller = Self::with_registry(config, source, registry);
        if controller.config.enabled {
            let client = SearchEngineClient::new(base_url, controller.config.init_timeout())?;
            controller.core.begin_start()?;
            controller.set_client(Some(client));
            controller.core.mark_running();
        }
        Ok(controller)
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn instance_id(&self) -> u64 {
        self.core.id()
    }

    pub async fn data_dir(&self) -> Option<PathBuf> {
        self.core.data_dir().await
    }

    pub async fn pid(&self) -> Option<u32> {
        self.core.pid().await
    }

    pub fn base_url(&self) -> Option<String> {
        self.client().map(|c| c.base_url().to_string())
    }

    /// Active connector per collection.
    pub fn registrations(&self) -> BTreeMap<String, IndexRegistration> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn client(&self) -> Option<SearchEngineClient> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_client(&self, client: Option<SearchEngineClient>) {
        *self.client.lock().unwrap_or_else(PoisonError::into_inner) = client;
    }

    fn running_client(&self, operation: &'static str) -> Result<SearchEngineClient> {
        match self.client() {
            Some(client) if self.core.state() == LifecycleState::Running => Ok(client),
            _ => Err(self.core.invalid(operation)),
        }
    }

    fn engine_spec(&self, data_path: &Path) -> SpawnSpec {
        let setting = |key: &str, value: &str| format!("-Des.{key}={value}");
        SpawnSpec::new(self.core.name(), &self.config.bin)
            .args([
                setting("path.data", &data_path.display().to_string()),
                setting("http.host", LOCAL_HOST),
                setting("http.port", &self.config.http_port.to_string()),
                setting("network.host", LOCAL_HOST),
                setting("node.local", "true"),
                setting("discovery.zen.ping.multicast.enabled", "false"),
                setting("cluster.name", &self.config.cluster_name),
            ])
            .args(self.config.args.iter().cloned())
    }

    async fn launch(&self) -> Result<()> {
        let timeout = self.config.init_timeout();
        let data_dir = ResolvedDataDir::resolve(&self.config.data_directory, "elastic-data")?;
        let spec = self.engine_spec(data_dir.path());
        let output = self
            .core
            .launch(data_dir, spec, &[self.config.ready_token.as_str()])
            .await?;
        output.wait_for(&self.config.ready_token, timeout).await?;

        let client = SearchEngineClient::new(
            format!("http://{}:{}", LOCAL_HOST, self.config.http_port),
            timeout,
        )?;
        client.wait_for_health("yellow", timeout).await?;
        self.set_client(Some(client));
        Ok(())
    }

    /*
        @@@
        @register_source();
        . Describes a connector from `collection` in the source database and hands it to the engine.
        . Replaces any earlier connector for the same collection, locally and in the engine.
        . Disabled: nothing happens.
    */
    pub async fn register_source(&self, collection: &str) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        debug!(collection, "Adding collection to the embedded search index...");
        let client = self.running_client("register a source")?;
        let registration = IndexRegistration::for_collection(
            &self.source,
            collection,
            self.config.bulk_size,
            self.config.bulk_timeout_secs,
        )?;
        client.register(&registration).await?;
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(collection.to_string(), registration);
        Ok(())
    }

    /*
        @@@
        @search();
        . Counts the matches first and asks for exactly that many hits, ranked by descending score.
        . Disabled: always an empty list.
    */
    pub async fn search(&self, collection: &str, query: &str) -> Result<Vec<SearchResultRecord>> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }
        debug!(collection, query, "Searching...");
        let client = self.running_client("search")?;
        let index = &self.source.database;
        let count = client.count(index, collection, query).await?;
        let results = if count == 0 {
            Vec::new()
        } else {
            client.search(index, collection, query, count).await?
        };
        debug!(collection, query, hits = results.len(), "Search finished");
        Ok(results)
    }
}

#[async_trait]
impl EmbeddedService for SearchEngineController {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn state(&self) -> LifecycleState {
        self.core.state()
    }

    async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        info!("Starting the embedded search engine...");
        self.core.begin_start()?;
        match self.launch().await {
            Ok(()) if self.core.mark_running() => {
                info!(url = ?self.base_url(), "Embedded search engine is running");
                Ok(())
            }
            Ok(()) => {
                let err = self.core.invalid("finish starting");
                self.core.shutdown().await;
                Err(err)
            }
            Err(e) => {
                error!(error = %e, "Failed to start embedded search engine");
                Err(e)
            }
        }
    }

    async fn stop(&self) {
        if !self.config.enabled {
            return;
        }
        self.core.shutdown().await;
        self.set_client(None);
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarnessError;
    use crate::parse::ClusterEndpoint;
    use mockito::Matcher;
    use serde_json::json;

    fn registry() -> &'static TeardownRegistry {
        Box::leak(Box::new(TeardownRegistry::new()))
    }

    fn source() -> SourceDatabase {
        SourceDatabase {
            servers: vec![ClusterEndpoint::new("localhost", 37017)],
            database: "mongolastic".into(),
            username: "user".into(),
            password: "pass".into(),
        }
    }

    #[tokio::test]
    async fn disabled_mode_never_fails() {
        let es = SearchEngineController::with_registry(SearchConfig::disabled(), source(), registry());
        es.start().await.unwrap();
        es.register_source("post").await.unwrap();
        assert!(es.search("post", "body:keyword").await.unwrap().is_empty());
        es.stop().await;
        es.stop().await;
        assert!(es.registrations().is_empty());
        assert!(es.data_dir().await.is_none());
    }

    #[tokio::test]
    async fn enabled_but_not_started_is_invalid_state() {
        let es = SearchEngineController::with_registry(SearchConfig::default(), source(), registry());
        let err = es.search("post", "x").await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidState { .. }));
        let err = es.register_source("post").await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidState { .. }));
    }

    #[test]
    fn engine_listens_on_loopback_only() {
        let es = SearchEngineController::with_registry(SearchConfig::default(), source(), registry());
        let spec = es.engine_spec(Path::new("/data/es"));
        assert!(spec.args.contains(&"-Des.path.data=/data/es".to_string()));
        assert!(spec.args.contains(&"-Des.http.host=127.0.0.1".to_string()));
        assert!(spec.args.contains(&"-Des.network.host=127.0.0.1".to_string()));
        assert!(spec.args.contains(&"-Des.node.local=true".to_string()));
    }

    #[tokio::test]
    async fn re_registration_keeps_one_connector() {
        let mut server = mockito::Server::new_async().await;
        let dropped = server
            .mock("DELETE", "/_river/post")
            .with_status(200)
            .expect(2)
            .create_async()
            .await;
        let stored = server
            .mock("PUT", "/_river/post/_meta")
            .with_status(201)
            .expect(2)
            .create_async()
            .await;

        let es = SearchEngineController::connect(SearchConfig::default(), source(), &server.url(), registry())
            .unwrap();
        es.register_source("post").await.unwrap();
        es.register_source("post").await.unwrap();

        dropped.assert_async().await;
        stored.assert_async().await;
        let active = es.registrations();
        assert_eq!(active.len(), 1);
        assert_eq!(active["post"].target_index_name, "mongolastic");
    }

    #[tokio::test]
    async fn stop_forgets_registrations() {
        let mut server = mockito::Server::new_async().await;
        server.mock("DELETE", "/_river/post").with_status(404).create_async().await;
        server.mock("PUT", "/_river/post/_meta").with_status(201).create_async().await;

        let es = SearchEngineController::connect(SearchConfig::default(), source(), &server.url(), registry())
            .unwrap();
        es.register_source("post").await.unwrap();
        assert!(es.registrations().contains_key("post"));

        es.stop().await;
        assert!(es.registrations().is_empty());
    }

    #[tokio::test]
    async fn search_counts_then_fetches() {
        let mut server = mockito::Server::new_async().await;
        let count = server
            .mock("POST", "/mongolastic/post/_count")
            .with_status(200)
            .with_body(r#"{"count":2}"#)
            .create_async()
            .await;
        let search = server
            .mock("POST", "/mongolastic/post/_search")
            .match_body(Matcher::PartialJson(json!({"size": 2})))
            .with_status(200)
            .with_body(
                json!({"hits": {"hits": [
                    {"_id": "p1", "_score": 0.3, "_source": {"body": "with keyword"}},
                    {"_id": "p3", "_score": 0.9, "_source": {"body": "the required keyword"}}
                ]}})
                .to_string(),
            )
            .create_async()
            .await;

        let es = SearchEngineController::connect(SearchConfig::default(), source(), &server.url(), registry())
            .unwrap();
        let hits = es.search("post", "body:keyword").await.unwrap();
        count.assert_async().await;
        search.assert_async().await;

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document_id, "p3");
        assert!(hits.iter().all(|h| h.relevance_score > 0.0));
    }

    #[tokio::test]
    async fn zero_count_skips_search() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/mongolastic/post/_count")
            .with_status(200)
            .with_body(r#"{"count":0}"#)
            .create_async()
            .await;
        let search = server
            .mock("POST", "/mongolastic/post/_search")
            .expect(0)
            .create_async()
            .await;

        let es = SearchEngineController::connect(SearchConfig::default(), source(), &server.url(), registry())
            .unwrap();
        assert!(es.search("post", "nothing").await.unwrap().is_empty());
        search.assert_async().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_disconnects() {
        let reg = registry();
        let server = mockito::Server::new_async().await;
        let es = SearchEngineController::connect(SearchConfig::default(), source(), &server.url(), reg).unwrap();
        assert_eq!(es.state(), LifecycleState::Running);
        assert!(reg.is_registered(es.instance_id()));

        es.stop().await;
        es.stop().await;
        assert_eq!(es.state(), LifecycleState::Stopped);
        assert!(es.base_url().is_none());
        assert!(reg.is_empty());
        assert!(matches!(es.start().await, Err(HarnessError::InvalidState { .. })));
    }
}
