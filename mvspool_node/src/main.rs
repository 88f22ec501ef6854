// Copyright (C) 2024, 2025 MVSPool Developers (see AUTHORS)
//
// This file is part of MVSPool
//
// MVSPool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// MVSPool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// MVSPool. If not, see <https://www.gnu.org/licenses/>.

mod pow;

use clap::Parser;
use mvsdrpc::{UpstreamClient, UpstreamRpc};
use mvspool_lib::config::Config;
use mvspool_lib::logging::setup_logging;
use mvspool_lib::policy::AllowAllPolicy;
use mvspool_lib::proxy::http::start_http_endpoint;
use mvspool_lib::proxy::stratum::{listen_tier, start_broadcaster};
use mvspool_lib::proxy::{register_mining_account, start_state_publisher, ProxyServer};
use mvspool_lib::storage::MemoryBackend;
use mvspool_lib::unlocker::BlockUnlocker;
use mvspool_lib::upstream::{start_health_checker, UpstreamPool};
use mvspool_lib::work::subscriber::subscribe_block_update;
use mvspool_lib::work::{start_refresher, template_channel, RecentHeaders};
use std::sync::Arc;
use tracing::{error, info};

/// Buffered push notifications between the subscriber and the refresher.
const REFRESH_CHANNEL_SIZE: usize = 8;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("failed to load config: {e}");
            return Err(format!("failed to load config: {e}"));
        }
    };

    let _guard = match setup_logging(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to set up logging: {e}");
            return Err(format!("failed to set up logging: {e}"));
        }
    };
    info!("starting {}", config.name);

    let mut upstreams: Vec<Arc<dyn UpstreamRpc>> = Vec::new();
    for upstream in &config.upstreams {
        let client = UpstreamClient::new(
            &upstream.name,
            &upstream.url,
            &config.account,
            &config.password,
            upstream.timeout,
        )
        .map_err(|e| format!("failed to build upstream {}: {e}", upstream.name))?;
        info!("upstream: {} => {}", upstream.name, upstream.url);
        upstreams.push(Arc::new(client));
    }
    let pool = Arc::new(UpstreamPool::new(upstreams));
    info!("default upstream: {}", pool.active().name());

    let backend = Arc::new(MemoryBackend::new());
    let (template_tx, template_rx) = template_channel();
    let recent_headers = Arc::new(RecentHeaders::default());
    let (refresh_tx, refresh_rx) = tokio::sync::mpsc::channel(REFRESH_CHANNEL_SIZE);

    let server = Arc::new(ProxyServer::new(
        config.clone(),
        backend.clone(),
        Arc::new(AllowAllPolicy),
        Arc::new(pow::Sha256dPow),
        pool.clone(),
        template_rx,
        recent_headers.clone(),
        refresh_tx.clone(),
    ));

    register_mining_account(&server).await;

    if let Some(endpoint) = config.proxy.websocket.clone() {
        tokio::spawn(subscribe_block_update(endpoint, refresh_tx));
    }
    tokio::spawn(start_refresher(
        pool.clone(),
        template_tx,
        recent_headers,
        config.proxy.block_refresh_interval,
        refresh_rx,
    ));
    tokio::spawn(start_health_checker(
        pool.clone(),
        config.upstream_check_interval,
    ));
    tokio::spawn(start_state_publisher(server.clone()));
    tokio::spawn(start_broadcaster(server.clone()));

    for (tier_index, tier) in config.proxy.stratums.iter().enumerate() {
        if !tier.enabled {
            continue;
        }
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = listen_tier(server, tier_index).await {
                error!("stratum tier {} failed: {}", tier_index, e);
            }
        });
    }

    if config.unlocker.enabled {
        let daemon = UpstreamClient::new(
            "BlockUnlocker",
            &config.unlocker.daemon,
            &config.account,
            &config.password,
            config.unlocker.timeout,
        )
        .map_err(|e| format!("failed to build unlocker daemon client: {e}"))?;
        let unlocker = BlockUnlocker::new(
            config.unlocker.clone(),
            Arc::new(daemon),
            backend.clone(),
        )
        .map_err(|e| format!("failed to start unlocker: {e}"))?;
        tokio::spawn(unlocker.run());
    }

    let (http_shutdown_tx, http_shutdown_rx) = tokio::sync::oneshot::channel();
    let http_server = server.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = start_http_endpoint(http_server, http_shutdown_rx).await {
            error!("HTTP work endpoint failed: {e}");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to listen for shutdown signal: {e}"))?;
    info!("shutting down");
    let _ = http_shutdown_tx.send(());
    let _ = http_task.await;
    Ok(())
}
