//! DIDComm Agent Service
//!
//! Receives packed envelopes over HTTP and hands them to the packet router.
//! Each request is journaled before it is acknowledged and processed in the
//! background.

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode, Uri},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use dca::{
    Agent, AgentConfig, AgentParts, HttpTransport, HttpTransportConfig, IdentityKey, PacketRouter,
    Store, Wallet,
};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dca-agent")]
#[command(about = "DIDComm agent HTTP transport service")]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "DCA_PORT", default_value = "8080")]
    port: u16,

    /// Public base URL peers use to reach this service
    #[arg(long, env = "DCA_HOST_ADDR", default_value = "http://localhost:8080")]
    host_addr: String,

    /// First path segment of every agent endpoint
    #[arg(long, env = "DCA_SERVICE_NAME", default_value = "a2a")]
    service_name: String,

    /// State store file; the agent key is kept next to it
    #[arg(long, env = "DCA_DB_PATH", default_value = "dca-agent.db")]
    db_path: PathBuf,

    /// Timeout for outbound sends
    #[arg(long, env = "DCA_SEND_TIMEOUT_SECS", default_value = "30")]
    send_timeout_secs: u64,

    /// Answer protocol steps without waiting for the user
    #[arg(long, env = "DCA_AUTO_PERMISSION", default_value = "true", action = clap::ArgAction::Set)]
    auto_permission: bool,
}

#[derive(Clone)]
struct AppState {
    router: Arc<PacketRouter>,
    agent: Arc<Agent>,
    service_name: String,
}

const ERROR_BODY: &str = "500 - Error";

/// Accept one packed envelope.
async fn receive(State(state): State<AppState>, uri: Uri, body: Bytes) -> impl IntoResponse {
    let path = uri.path();
    let service = path.trim_start_matches('/').split('/').next().unwrap_or_default();
    if service != state.service_name {
        return StatusCode::NOT_FOUND.into_response();
    }

    match state.router.deliver(path, body.to_vec()) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            warn!(path, error = %e, "envelope rejected");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                ERROR_BODY,
            )
                .into_response()
        }
    }
}

async fn version() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ready",
        "did": state.agent.did(),
        "endpoint": state.agent.endpoint().endp,
        "connections": state.agent.connection_ids().len(),
    }))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/version", get(version))
        .route("/:service/*rest", post(receive))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Load the agent key kept at `path`, creating it on first start.
fn load_or_create_key(path: &Path) -> anyhow::Result<IdentityKey> {
    if path.exists() {
        let seed_hex = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let bytes = hex::decode(seed_hex.trim()).with_context(|| format!("decoding {}", path.display()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("{} does not hold a 32 byte key", path.display()))?;
        return Ok(IdentityKey::from_bytes(&bytes));
    }
    let key = IdentityKey::generate();
    std::fs::write(path, hex::encode(key.to_bytes())).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), did = %key.did(), "created agent key");
    Ok(key)
}

fn key_path(db_path: &Path) -> PathBuf {
    let mut path = db_path.as_os_str().to_owned();
    path.push(".key");
    PathBuf::from(path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let (processors, reps) = dca::registries();
    let store = Arc::new(
        Store::open(&args.db_path, reps)
            .with_context(|| format!("opening store {}", args.db_path.display()))?,
    );
    let transport = HttpTransport::new(HttpTransportConfig {
        timeout: Duration::from_secs(args.send_timeout_secs),
    })?;

    let agent = Agent::new(
        AgentConfig {
            service_name: args.service_name.clone(),
            host_addr: args.host_addr.clone(),
            auto_permission: args.auto_permission,
        },
        load_or_create_key(&key_path(&args.db_path))?,
        AgentParts {
            // Pairwise keys come back from the store in restore_pipes.
            wallet: Arc::new(Wallet::new()),
            store,
            processors: processors.clone(),
            transport: Arc::new(transport),
        },
    );
    let router = Arc::new(PacketRouter::new(processors));
    router.register(agent.clone());

    let pipes = agent.restore_pipes()?;
    let pending = router.recover_pending().await?;
    let resent = agent.resend_pending().await?;
    info!(did = %agent.did(), pipes, pending, resent, "agent restored");

    let state = AppState {
        router,
        agent: agent.clone(),
        service_name: args.service_name,
    };
    let app = build_router(state);

    let listen_addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding {}", listen_addr))?;
    info!(endpoint = %agent.endpoint().endp, "DIDComm agent listening on {}", listen_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
