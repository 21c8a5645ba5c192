//! kaiwa server: realtime voice-chat gateway for embedded toys.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod auth;
mod gateway;
mod state;
mod store;
mod workers;

use kaiwa_core::config::ModuleParams;
use kaiwa_modules::{providers, MetricsRecorder, ModuleCatalog, ModuleRegistry, PricingTable};
use kaiwa_pipeline::LlmSummarizer;

use auth::AuthKeys;
use state::AppState;
use store::Store;

#[derive(Debug, Parser)]
#[command(
    name = "kaiwa-server",
    about = "Realtime voice-chat gateway for embedded toys and browser clients",
    version = env!("CARGO_PKG_VERSION")
)]
struct ServerArgs {
    /// Host to bind to
    #[arg(short = 'H', long, env = "KAIWA_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "KAIWA_PORT")]
    port: Option<u16>,

    /// SQLite database path
    #[arg(long, env = "KAIWA_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Directory for stored user utterance audio
    #[arg(long, env = "KAIWA_AUDIO_DIR")]
    audio_dir: Option<PathBuf>,

    /// Module catalog (services.json)
    #[arg(long, env = "KAIWA_SERVICES")]
    services: Option<PathBuf>,

    /// Provider pricing table (pricing.json)
    #[arg(long, env = "KAIWA_PRICING")]
    pricing: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BindConfig {
    host: String,
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kaiwa_server=info,kaiwa_pipeline=info,kaiwa_modules=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting kaiwa server");

    let data_dir = default_data_dir();
    let db_path = args.db_path.unwrap_or_else(|| data_dir.join("kaiwa.sqlite3"));
    let audio_dir = args.audio_dir.unwrap_or_else(|| data_dir.join("audio"));
    info!("Database: {}", db_path.display());

    let store = Store::initialize(db_path, audio_dir)?;

    // Module registry: built-in factories, catalog from disk.
    let mut registry = ModuleRegistry::new();
    providers::register_builtin(&mut registry);
    let registry = Arc::new(registry);

    let catalog = load_catalog(args.services.as_deref());
    registry
        .load(&catalog)
        .await
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    registry.init_all().await;
    info!("Module registry initialized ({} services)", catalog.services.len());

    // Metrics: bounded queue, batched flush into ai_metrics.
    let pricing = load_pricing(args.pricing.as_deref());
    let metrics = MetricsRecorder::new(pricing, 10_000);
    let flusher = metrics.spawn_flusher(Arc::new(store.clone()), 100, Duration::from_secs(5));

    let jwt_secret = std::env::var("KAIWA_JWT_SECRET").unwrap_or_else(|_| {
        warn!("KAIWA_JWT_SECRET not set, using an ephemeral secret (tokens die with the process)");
        uuid::Uuid::new_v4().to_string()
    });
    let state = AppState::new(store, registry.clone(), metrics, AuthKeys::new(&jwt_secret));

    // Background workers.
    let summarizer = Arc::new(LlmSummarizer::new(registry, ModuleParams::default()));
    let summary_worker = workers::summary::spawn(state.clone(), summarizer);
    let analysis_worker = workers::analysis::spawn(state.clone());

    let app = api::create_router(state);

    let bind = resolve_bind_config(args.host, args.port);
    let addr = format!("{}:{}", bind.host, bind.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    info!("Server ready. Press Ctrl+C to stop.");
    server.await?;

    flusher.abort();
    summary_worker.abort();
    analysis_worker.abort();
    Ok(())
}

fn default_data_dir() -> PathBuf {
    if let Some(mut dir) = dirs::data_local_dir() {
        dir.push("kaiwa");
        return dir;
    }
    PathBuf::from("data")
}

fn load_catalog(path: Option<&std::path::Path>) -> ModuleCatalog {
    let path = path.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("services.json"));
    match ModuleCatalog::load(&path) {
        Ok(catalog) => catalog,
        Err(err) => {
            warn!(
                "No usable module catalog at {} ({err}); falling back to in-process modules only",
                path.display()
            );
            fallback_catalog()
        }
    }
}

/// Minimal catalog so the process comes up without provider credentials:
/// the in-process VAD and memory modules, nothing that needs the network.
fn fallback_catalog() -> ModuleCatalog {
    serde_json::from_value(serde_json::json!({
        "services": [
            { "kind": "vad", "code": "packet", "is_default": true },
            { "kind": "memory", "code": "agent_memory", "is_default": true }
        ]
    }))
    .expect("fallback catalog is valid")
}

fn load_pricing(path: Option<&std::path::Path>) -> PricingTable {
    let Some(path) = path else {
        return PricingTable::default();
    };
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(value) => PricingTable::from_json(&value),
            Err(err) => {
                warn!("Invalid pricing table {}: {err}", path.display());
                PricingTable::default()
            }
        },
        Err(err) => {
            warn!("Cannot read pricing table {}: {err}", path.display());
            PricingTable::default()
        }
    }
}

fn resolve_bind_config(host: Option<String>, port: Option<u16>) -> BindConfig {
    BindConfig {
        host: host.unwrap_or_else(|| "0.0.0.0".to_string()),
        port: port.unwrap_or(8000),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_defaults_apply() {
        let bind = resolve_bind_config(None, None);
        assert_eq!(bind.host, "0.0.0.0");
        assert_eq!(bind.port, 8000);
    }

    #[test]
    fn explicit_bind_wins() {
        let bind = resolve_bind_config(Some("127.0.0.1".to_string()), Some(9000));
        assert_eq!(bind.host, "127.0.0.1");
        assert_eq!(bind.port, 9000);
    }

    #[test]
    fn fallback_catalog_is_offline_safe() {
        let catalog = fallback_catalog();
        catalog.validate().expect("valid");
        assert!(catalog.services.iter().all(|s| matches!(
            s.kind,
            kaiwa_modules::ModuleKind::Vad | kaiwa_modules::ModuleKind::Memory
        )));
    }

    #[test]
    fn missing_pricing_file_yields_empty_table() {
        let table = load_pricing(Some(std::path::Path::new("/nonexistent/pricing.json")));
        assert_eq!(table.cost("any", "model", 1000, 1000), (0.0, 0.0));
    }
}
