//! waygate — programmable HTTP reverse proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────┐
//!                    │                    WAYGATE                       │
//!                    │                                                  │
//!   Client Request   │  ┌────────┐   ┌─────────┐   ┌────────────────┐  │
//!   ─────────────────┼─▶│  http  │──▶│ routing │──▶│ request filters │  │
//!                    │  │ server │   │ lookup  │   └───────┬────────┘  │
//!                    │  └────────┘   └─────────┘           │           │
//!                    │                                     ▼           │
//!                    │              ┌───────────────────────────────┐  │
//!                    │              │ backend dispatch              │  │
//!                    │              │ shunt │ loop │ lb │ static    │  │
//!                    │              └───────────────┬───────────────┘  │
//!                    │                              │                  │
//!   Client Response  │  ┌──────────┐   ┌────────────▼─────────────┐    │
//!   ◀────────────────┼──│ response │◀──│ response filters (rev.)  │    │
//!                    │  │ streamer │   └──────────────────────────┘    │
//!                    │  └──────────┘                                   │
//!                    │                                                  │
//!                    │  Cross-cutting: rate limits, circuit breakers,   │
//!                    │  tracing spans, metrics, access log, lifecycle   │
//!                    └──────────────────────────────────────────────────┘
//! ```

use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use waygate::config::{self, ProxyConfig};
use waygate::proxy::{Params, Proxy};
use waygate::security::RatelimitRegistry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration first so its log level configures the subscriber.
    let config = match std::env::args().nth(1) {
        Some(path) => config::load_config(Path::new(&path))?,
        None => ProxyConfig::default(),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("waygate={},access=info", config.observability.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        bind_address = %config.listener.bind_address,
        routes = config.routes.len(),
        "configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => waygate::observability::metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "failed to parse metrics address"
            ),
        }
    }

    let route_table = config::build_route_table(&config.routes)?;
    let limiters = config
        .rate_limit
        .to_settings()
        .map(|settings| Arc::new(RatelimitRegistry::new(Some(settings))));

    let flags = config.flags.to_flags();
    let proxy = Proxy::with_params(Params {
        route_lookup: Arc::new(route_table),
        flags,
        access_log_disabled: config.observability.access_log_disabled,
        default_http_status: config.limits.default_http_status,
        max_loopbacks: config.limits.max_loopbacks,
        limiters,
        transport: config.transport.to_options(flags.insecure),
        ..Default::default()
    });

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    waygate::run(proxy, listener).await?;

    tracing::info!("shutdown complete");
    Ok(())
}
