//! SFU Controller
//!
//! Session orchestration server for a WebRTC selective forwarding unit.
//!
//! # Servers
//!
//! - WebSocket signaling server (default: 0.0.0.0:3000, `GET /ws`)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect to Redis (identity, permissions, membership)
//! 4. Start the media worker pool and its load sampler
//! 5. Spawn the room registry actor
//! 6. Start health and signaling servers, then mark ready
//! 7. Wait for a shutdown signal or a fatal worker death

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;

use secrecy::ExposeSecret;
use sfu_controller::actors::{ActorMetrics, RoomRegistryActor};
use sfu_controller::config::Config;
use sfu_controller::engine::mediasoup::MediasoupEngine;
use sfu_controller::observability::{health_router, init_metrics_recorder, HealthState};
use sfu_controller::signaling::{signaling_router, SignalingGateway, SignalingState};
use sfu_controller::stores::{IdentityStore, MembershipStore, RedisStore};
use sfu_controller::workers::{PoolSettings, WorkerPool};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_controller=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SFU Controller");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        num_workers = config.num_workers,
        webrtc_port_base = config.webrtc_port_base,
        max_connections = config.max_connections,
        allow_produce = config.allow_produce,
        allow_consume = config.allow_consume,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());
    let root_token = CancellationToken::new();

    info!("Connecting to Redis...");
    let store = Arc::new(
        RedisStore::connect(config.redis_url.expose_secret())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to Redis");
                e
            })?,
    );
    info!("Redis connection established");

    info!(workers = config.num_workers, "Starting media worker pool...");
    let pool = WorkerPool::create(
        Arc::new(MediasoupEngine::new()),
        PoolSettings::from_config(&config),
        root_token.child_token(),
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Failed to start media worker pool");
        e
    })?;
    let sampler_handle =
        pool.spawn_load_sampler(config.load_sample_interval, root_token.child_token());
    info!(workers = pool.len(), "Media worker pool started");

    let actor_metrics = ActorMetrics::new();
    let (registry, registry_task) = RoomRegistryActor::spawn(
        config.instance_id.clone(),
        Arc::clone(&pool),
        Arc::clone(&store) as Arc<dyn MembershipStore>,
        Arc::clone(&actor_metrics),
        root_token.child_token(),
    );
    info!("Room registry started");

    // Both listeners are bound before anything is served so a bad address
    // fails startup instead of a background task
    let health_listener = bind("health", &config.health_bind_address).await?;
    let signaling_listener = bind("signaling", &config.signaling_bind_address).await?;

    // Health outlives signaling so probes answer during drain
    let health_token = CancellationToken::new();
    let health_task = spawn_server(
        "health",
        health_listener,
        health_router(Arc::clone(&health_state), Some(prometheus_handle)),
        health_token.clone(),
    );

    let signaling_token = root_token.child_token();
    let gateway = Arc::new(SignalingGateway::new(
        registry.clone(),
        Arc::clone(&store) as Arc<dyn IdentityStore>,
        config.allow_produce,
        config.allow_consume,
    ));
    let signaling_app = signaling_router(SignalingState::new(
        gateway,
        config.max_connections,
        config.max_message_bytes,
        signaling_token.clone(),
    ));
    let signaling_task = spawn_server(
        "signaling",
        signaling_listener,
        signaling_app,
        signaling_token.clone(),
    );

    health_state.set_ready();
    info!("SFU Controller running - press Ctrl+C to shutdown");

    tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
        }
        death = pool.fatal() => {
            health_state.set_not_live();
            if let Some(death) = death {
                error!(
                    worker = death.index,
                    reason = %death.reason,
                    "Media worker died, exiting"
                );
            }
            std::process::exit(1);
        }
    }

    // Mark as not ready immediately so load balancers stop sending traffic
    health_state.set_not_ready();

    signaling_token.cancel();
    if let Err(e) = signaling_task.await {
        warn!(error = %e, "Signaling server task failed");
    }

    if let Err(e) = registry.shutdown(config.shutdown_timeout).await {
        warn!(error = %e, "Room registry shutdown error");
    }
    registry.cancel();
    if tokio::time::timeout(config.shutdown_timeout, registry_task)
        .await
        .is_err()
    {
        warn!("Room registry did not stop within the shutdown timeout");
    }

    // Stops the sampler and the worker death watchers
    root_token.cancel();
    let _ = sampler_handle.await;

    health_token.cancel();
    let _ = health_task.await;

    info!("SFU Controller shutdown complete");
    Ok(())
}

async fn bind(
    name: &'static str,
    address: &str,
) -> Result<tokio::net::TcpListener, Box<dyn std::error::Error>> {
    let addr: SocketAddr = address.parse().map_err(|e| {
        error!(server = name, error = %e, addr = %address, "Invalid bind address");
        format!("invalid {name} bind address {address}: {e}")
    })?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(server = name, error = %e, addr = %addr, "Failed to bind listener");
        format!("failed to bind {name} server to {addr}: {e}")
    })?;
    Ok(listener)
}

/// Serve `app` until `stop` is cancelled, then finish in-flight requests.
fn spawn_server(
    name: &'static str,
    listener: tokio::net::TcpListener,
    app: axum::Router,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            info!(server = name, addr = %addr, "Listening");
        }
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await;
        match served {
            Ok(()) => info!(server = name, "Server stopped"),
            Err(e) => error!(server = name, error = %e, "Server failed"),
        }
    })
}

/// Resolves on the first of SIGINT or SIGTERM. If a handler cannot be
/// installed that source is ignored and only the other one counts.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
}
