use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use pennant_core::authoring::{AuthoringStore, NewToken, Trust};
use pennant_core::cache::InMemorySnapshotCache;
use pennant_core::token::{self, TokenScope};
use pennant_edge::exposure::{EventForwarder, EventQueues, ForwarderConfig};
use pennant_edge::sink::{HttpEventSink, LogEventSink};
use pennant_edge::store::SqliteStore;
use pennant_edge::{routes, AppState};

/// Pennant edge evaluator.
#[derive(Debug, Parser)]
#[command(name = "pennant-edge", version, about)]
struct Options {
    /// Address to serve on.
    #[arg(long, default_value = "127.0.0.1:8787")]
    listen: SocketAddr,

    /// Path to the authoring store database.
    #[arg(long, default_value = "pennant.db")]
    db: PathBuf,

    /// Event Sink ingestion base URL. Without it, event batches are logged
    /// and discarded.
    #[arg(long)]
    sink_url: Option<String>,

    /// Seconds between stream heartbeats.
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Create the named environment (if missing) plus a write-scope token,
    /// print the token once, and continue serving.
    #[arg(long, value_name = "ENV_KEY")]
    bootstrap_env: Option<String>,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let options = Options::parse();

    if let Err(err) = run(options).await {
        log::error!(target: "pennant_edge", error:display = err; "edge evaluator exited with error");
        std::process::exit(1);
    }
}

async fn run(options: Options) -> pennant_core::Result<()> {
    let store = Arc::new(SqliteStore::open(&options.db)?);

    if let Some(env_key) = &options.bootstrap_env {
        bootstrap(&store, env_key)?;
    }

    let forwarder_config = ForwarderConfig::default();
    let queues = Arc::new(EventQueues::new(&forwarder_config));
    let sink: Arc<dyn pennant_core::events::EventSink> = match &options.sink_url {
        Some(url) => Arc::new(HttpEventSink::new(url.clone())),
        None => Arc::new(LogEventSink),
    };
    let forwarder = EventForwarder::start(queues.clone(), sink, forwarder_config)?;

    let state = AppState::new(
        store,
        Arc::new(InMemorySnapshotCache::new()),
        queues,
        Duration::from_secs(options.heartbeat_secs),
    );
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(options.listen).await?;
    log::info!(target: "pennant_edge",
               listen:display = options.listen;
               "edge evaluator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain queued events once before exiting.
    forwarder.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::error!(target: "pennant_edge", error:display = err; "failed to listen for ctrl-c");
        return;
    }
    log::info!(target: "pennant_edge", "shutdown signal received");
}

/// One-shot operator convenience: make sure an environment exists and mint
/// a write token for it. The plain token is shown exactly once.
fn bootstrap(store: &SqliteStore, env_key: &str) -> pennant_core::Result<()> {
    let environment = match store.create_environment(env_key) {
        Ok(environment) => environment,
        Err(pennant_core::Error::Conflict(_)) => store.environment_by_key(env_key)?,
        Err(err) => return Err(err),
    };

    let plain = token::generate();
    let record = store.create_token(NewToken {
        env_id: environment.env_id,
        scope: TokenScope::Write,
        hashed_secret: token::hash_secret(&plain.token)?,
        prefix: plain.prefix.clone(),
        expires_at: None,
    })?;

    println!("environment: {} (id {})", environment.env_key, environment.env_id);
    println!("token:       {}  <- shown once, store it now", plain.token);
    println!("prefix:      {} (id {})", record.prefix, record.token_id);
    Ok(())
}
