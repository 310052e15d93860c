use anyhow::Context;
use embedded_harness::logger::logs_tracing;
use embedded_harness::parse::{parser, Config};
use embedded_harness::shell::run_shell;
use embedded_harness::teardown::{spawn_signal_listener, TeardownRegistry};
use embedded_harness::{DatabaseClusterController, EmbeddedService, SearchEngineController};
use tracing::{error, info};

const DEFAULT_CONFIG: &str = "config/harness.yml";
const HISTORY: &str = "logs/history.txt";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let cfg: Config = parser(&path).with_context(|| format!("loading `{path}`"))?;
    let _guard = logs_tracing(&cfg.logging).context("installing log subscriber")?;
    let listener = spawn_signal_listener().context("installing signal handlers")?;
    tokio::spawn(async move {
        if let Ok(signal) = listener.await {
            info!(signal, "Stopped by signal");
            std::process::exit(128 + signal);
        }
    });

    let db = DatabaseClusterController::new(cfg.database.clone());
    let es = SearchEngineController::new(cfg.search.clone(), cfg.database.source());

    let outcome = bring_up(&db, &es, &cfg).await;
    if let Err(e) = &outcome {
        error!(error = %e, "Start-up failed");
        eprintln!("Start-up failed: {e:#}");
    } else {
        println!("Embedded services are up; type `exit` to tear them down.");
        let (st_db, st_es) = (db.clone(), es.clone());
        let ep_db = db.clone();
        let reg_es = es.clone();
        let q_es = es.clone();
        let res = run_shell(
            HISTORY,
            move || {
                let (db, es) = (st_db.clone(), st_es.clone());
                async move {
                    println!("{}: {}", db.name(), db.state());
                    println!("{}: {}", es.name(), es.state());
                    for name in es.registrations().keys() {
                        println!("  indexed collection `{}`", name);
                    }
                }
            },
            move || {
                let db = ep_db.clone();
                async move {
                    match db.endpoint() {
                        Ok(endpoint) => println!("{}", endpoint),
                        Err(e) => println!("{}", e),
                    }
                }
            },
            move |collection: &str| {
                let (es, collection) = (reg_es.clone(), collection.to_string());
                async move {
                    match es.register_source(&collection).await {
                        Ok(()) => println!("registered `{}`", collection),
                        Err(e) => println!("{}", e),
                    }
                }
            },
            move |collection: &str, query: &str| {
                let (es, collection, query) = (q_es.clone(), collection.to_string(), query.to_string());
                async move {
                    match es.search(&collection, &query).await {
                        Ok(hits) => {
                            println!("{} hit(s)", hits.len());
                            for hit in hits {
                                println!("{:>8.4}  {}  {}", hit.relevance_score, hit.document_id,
                                    serde_json::Value::Object(hit.source_fields));
                            }
                        }
                        Err(e) => println!("{}", e),
                    }
                }
            },
        )
        .await;
        if let Err(e) = res {
            error!(error = %e, "Shell failed");
        }
    }

    es.stop().await;
    db.stop().await;
    TeardownRegistry::global().run_all().await;
    outcome
}

async fn bring_up(
    db: &DatabaseClusterController,
    es: &SearchEngineController,
    cfg: &Config,
) -> anyhow::Result<()> {
    db.start().await.context("starting embedded database")?;
    es.start().await.context("starting embedded search engine")?;
    for collection in &cfg.collections {
        es.register_source(collection)
            .await
            .with_context(|| format!("registering `{collection}`"))?;
        info!(collection = %collection, "Collection registered for indexing");
    }
    Ok(())
}
