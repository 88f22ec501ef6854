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

pub mod handlers;
pub mod http;
pub mod messages;
pub mod session;
pub mod stratum;
pub mod validator;

use crate::config::Config;
use crate::policy::Policy;
use crate::storage::Backend;
use crate::upstream::UpstreamPool;
use crate::util::get_target_hex;
use crate::work::{BlockTemplate, RecentHeaders, TemplateReceiver};
use num_bigint::BigUint;
use regex::Regex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tracing::{error, info};
use validator::{PowVerifier, ShareValidator};

/// EVM-style logins: 0x followed by 40 hex characters.
fn evm_login_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^0x[0-9a-fA-F]{40}$").unwrap())
}

/// Base58-style logins, matching the routing contract (length check only;
/// checksums are the payout layer's concern).
fn base58_login_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[0-9a-zA-Z]{27,34}$").unwrap())
}

/// Worker names: 1 to 8 of `[0-9a-zA-Z-_]`.
fn worker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[0-9a-zA-Z-_]{1,8}$").unwrap())
}

pub fn valid_login(login: &str) -> bool {
    evm_login_pattern().is_match(login) || base58_login_pattern().is_match(login)
}

pub fn valid_worker(worker: &str) -> bool {
    worker_pattern().is_match(worker)
}

/// One difficulty band. Each stratum listener port is bound to exactly one
/// tier; HTTP sessions use tier 0.
pub struct StratumTier {
    pub config: crate::config::StratumTierConfig,
    pub target_hex: String,
    pub target: BigUint,
    pub connections: stratum::ConnectionsHandle,
}

/// Shared state of the work-distribution service: the template cell, the
/// difficulty tiers with their live sessions, and the collaborator handles.
pub struct ProxyServer {
    pub config: Arc<Config>,
    pub backend: Arc<dyn Backend>,
    pub policy: Arc<dyn Policy>,
    pub pool: Arc<UpstreamPool>,
    pub validator: ShareValidator,
    pub tiers: Vec<StratumTier>,
    template_rx: TemplateReceiver,
    /// Nudges the refresher, e.g. right after we found a block.
    refresh_tx: mpsc::Sender<()>,
    fails_count: AtomicI64,
}

impl ProxyServer {
    pub fn new(
        config: Arc<Config>,
        backend: Arc<dyn Backend>,
        policy: Arc<dyn Policy>,
        pow: Arc<dyn PowVerifier>,
        pool: Arc<UpstreamPool>,
        template_rx: TemplateReceiver,
        recent_headers: Arc<RecentHeaders>,
        refresh_tx: mpsc::Sender<()>,
    ) -> Self {
        let tiers = config
            .proxy
            .stratums
            .iter()
            .map(|tier_config| {
                let target_hex = get_target_hex(tier_config.difficulty);
                let target = BigUint::from_bytes_be(
                    &hex::decode(target_hex.trim_start_matches("0x")).unwrap_or_default(),
                );
                StratumTier {
                    config: tier_config.clone(),
                    target_hex,
                    target,
                    connections: stratum::spawn_connections(),
                }
            })
            .collect();

        Self {
            config,
            backend,
            policy,
            pool,
            validator: ShareValidator::new(recent_headers, pow),
            tiers,
            template_rx,
            refresh_tx,
            fails_count: AtomicI64::new(0),
        }
    }

    /// Whole-value template load; `None` until the first refresh lands.
    pub fn current_template(&self) -> Option<Arc<BlockTemplate>> {
        self.template_rx.borrow().clone()
    }

    /// A fresh watcher over the template cell, for broadcast listeners.
    pub fn subscribe_templates(&self) -> TemplateReceiver {
        self.template_rx.clone()
    }

    pub(crate) fn trigger_refresh(&self) {
        let _ = self.refresh_tx.try_send(());
    }

    pub fn mark_sick(&self) {
        self.fails_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_ok(&self) {
        self.fails_count.store(0, Ordering::Relaxed);
    }

    /// True once repeated backend failures cross the configured threshold.
    /// A sick proxy stops handing out work.
    pub fn is_sick(&self) -> bool {
        let fails = self.fails_count.load(Ordering::Relaxed);
        self.config.proxy.health_check && fails >= self.config.proxy.max_fails
    }
}

/// Publishes `(instance, height, difficulty)` to storage on a fixed interval
/// so dashboards can tell a stalled pool from a stalled chain.
pub async fn start_state_publisher(server: Arc<ProxyServer>) {
    let mut interval = tokio::time::interval(server.config.proxy.state_update_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        publish_node_state(&server).await;
    }
}

async fn publish_node_state(server: &ProxyServer) {
    let Some(template) = server.current_template() else {
        return;
    };
    let write = server
        .backend
        .write_node_state(
            server.config.name.clone(),
            template.height,
            template.difficulty.clone(),
        )
        .await;
    match write {
        Ok(()) => server.mark_ok(),
        Err(e) => {
            error!("failed to write node state to backend: {}", e);
            server.mark_sick();
        }
    }
}

/// Registers the pool's coinbase address with the active daemon so freshly
/// mined blocks pay the pool.
pub async fn register_mining_account(server: &ProxyServer) {
    let rpc = server.pool.active();
    match rpc
        .set_mining_account(server.config.unlocker.address.clone())
        .await
    {
        Ok(reply) => info!("mining account registered with {}: {}", rpc.name(), reply),
        Err(e) => error!("failed to register mining account: {}", e),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::Config;
    use crate::policy::AllowAllPolicy;
    use crate::storage::MemoryBackend;
    use crate::work::template_channel;
    use mvsdrpc::MockUpstreamRpc;
    use num_traits::One;

    pub const SAMPLE_CONFIG: &str = r#"
name = "test-pool"
account = "pool"
password = "secret"
upstream_check_interval = "5s"

[[upstreams]]
name = "local"
url = "http://127.0.0.1:8820/rpc/v2"
timeout = "10s"

[proxy]
listen = "127.0.0.1:0"
limit_body_size = 256
block_refresh_interval = "120ms"
state_update_interval = "3s"
hashrate_expiration = "3h"
health_check = true
max_fails = 100

[[proxy.stratums]]
enabled = true
listen = "127.0.0.1:0"
difficulty = 2000000
timeout = "120s"

[unlocker]
enabled = false
pool_fee = 1.0
depth = 32
immature_depth = 16
interval = "10m"
daemon = "http://127.0.0.1:8820/rpc/v2"
timeout = "10s"
address = "MMceYZEzb5LBq1797Nou4iNyWgcATCAfXJ"
"#;

    pub fn test_config() -> Arc<Config> {
        Arc::new(
            config::Config::builder()
                .add_source(config::File::from_str(
                    SAMPLE_CONFIG,
                    config::FileFormat::Toml,
                ))
                .build()
                .unwrap()
                .try_deserialize()
                .unwrap(),
        )
    }

    pub struct TestProxy {
        pub server: Arc<ProxyServer>,
        pub backend: Arc<MemoryBackend>,
        pub template_tx: crate::work::TemplateSender,
        pub recent_headers: Arc<RecentHeaders>,
    }

    /// Proxy wired with a memory backend, allow-all policy, the provided pow
    /// verifier, and one mock upstream.
    pub fn build_proxy(pow: Arc<dyn PowVerifier>, upstream: MockUpstreamRpc) -> TestProxy {
        build_proxy_with_policy(pow, upstream, Arc::new(AllowAllPolicy))
    }

    pub fn build_proxy_with_policy(
        pow: Arc<dyn PowVerifier>,
        upstream: MockUpstreamRpc,
        policy: Arc<dyn crate::policy::Policy>,
    ) -> TestProxy {
        let config = test_config();
        let backend = Arc::new(MemoryBackend::new());
        let pool = Arc::new(UpstreamPool::new(vec![Arc::new(upstream)]));
        let (template_tx, template_rx) = template_channel();
        let recent_headers = Arc::new(RecentHeaders::default());
        let (refresh_tx, _refresh_rx) = mpsc::channel(8);

        let server = Arc::new(ProxyServer::new(
            config,
            backend.clone(),
            policy,
            pow,
            pool,
            template_rx,
            recent_headers.clone(),
            refresh_tx,
        ));
        TestProxy {
            server,
            backend,
            template_tx,
            recent_headers,
        }
    }

    /// Publishes a template at `height` and registers its header in the
    /// recent window. Network difficulty 50M against the 2M test tier, so
    /// the block target sits well below the tier target.
    pub fn publish_template(proxy: &TestProxy, height: u64, header: &str) {
        let template = BlockTemplate {
            height,
            header: header.to_string(),
            seed: "0xseed".to_string(),
            target: (BigUint::one() << 256u32) / BigUint::from(50_000_000u64),
            difficulty: BigUint::from(50_000_000u64),
        };
        proxy.recent_headers.register(header, height);
        proxy.template_tx.send_replace(Some(Arc::new(template)));
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{build_proxy, publish_template, test_config};
    use super::validator::MockPowVerifier;
    use super::*;
    use crate::policy::AllowAllPolicy;
    use crate::storage::{MockBackend, StorageError};
    use crate::work::template_channel;
    use mvsdrpc::MockUpstreamRpc;

    #[test]
    fn test_login_patterns() {
        assert!(valid_login("0x00a329c0648769a73afac7f9381e08fb43dbea72"));
        assert!(valid_login("MX1ycRPFcDNMMj122J81zKBd7PSFy8e632"));
        assert!(!valid_login("0x00a329c0648769a73afac7f9381e08fb43dbea7"));
        assert!(!valid_login("tooshort"));
        assert!(!valid_login(""));

        assert!(valid_worker("rig-01"));
        assert!(valid_worker("a"));
        assert!(!valid_worker("way_too_long_worker"));
        assert!(!valid_worker(""));
        assert!(!valid_worker("bad space"));
    }

    #[tokio::test]
    async fn test_fails_counter_thresholds() {
        let proxy = build_proxy(Arc::new(MockPowVerifier::new()), MockUpstreamRpc::new());
        let server = &proxy.server;

        // max_fails is 100 in the test config
        assert!(!server.is_sick());
        for _ in 0..99 {
            server.mark_sick();
        }
        assert!(!server.is_sick());
        server.mark_sick();
        assert!(server.is_sick());
        server.mark_ok();
        assert!(!server.is_sick());
    }

    #[tokio::test]
    async fn test_sick_proxy_stops_handing_out_work() {
        let proxy = build_proxy(Arc::new(MockPowVerifier::new()), MockUpstreamRpc::new());
        publish_template(&proxy, 1200, "0xheader");
        for _ in 0..100 {
            proxy.server.mark_sick();
        }

        let mut session = session::Session::new("1.2.3.4".to_string(), 0);
        session.login = Some("miner-a".to_string());
        assert!(proxy.server.handle_get_work(&mut session).is_err());
    }

    #[tokio::test]
    async fn test_state_publisher_writes_and_recovers_fail_counter() {
        let mut backend = MockBackend::new();
        backend
            .expect_write_node_state()
            .withf(|name, height, _| name == "test-pool" && *height == 777)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let (template_tx, template_rx) = template_channel();
        let (refresh_tx, _refresh_rx) = mpsc::channel(1);
        let recent_headers = Arc::new(RecentHeaders::default());
        let server = ProxyServer::new(
            test_config(),
            Arc::new(backend),
            Arc::new(AllowAllPolicy),
            Arc::new(MockPowVerifier::new()),
            Arc::new(UpstreamPool::new(vec![Arc::new(MockUpstreamRpc::new())])),
            template_rx,
            recent_headers.clone(),
            refresh_tx,
        );

        // No template yet: nothing written (the mock would reject a call).
        server.mark_sick();
        publish_node_state(&server).await;
        assert_eq!(server.fails_count.load(Ordering::Relaxed), 1);

        let template = BlockTemplate {
            height: 777,
            header: "0xh".to_string(),
            seed: "0xs".to_string(),
            target: BigUint::from(1u8),
            difficulty: BigUint::from(1u8),
        };
        template_tx.send_replace(Some(Arc::new(template)));
        publish_node_state(&server).await;
        assert_eq!(server.fails_count.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_state_publisher_marks_sick_on_storage_failure() {
        let mut backend = MockBackend::new();
        backend
            .expect_write_node_state()
            .returning(|_, _, _| Err(StorageError("disk full".to_string())));

        let (template_tx, template_rx) = template_channel();
        let (refresh_tx, _refresh_rx) = mpsc::channel(1);
        let server = ProxyServer::new(
            test_config(),
            Arc::new(backend),
            Arc::new(AllowAllPolicy),
            Arc::new(MockPowVerifier::new()),
            Arc::new(UpstreamPool::new(vec![Arc::new(MockUpstreamRpc::new())])),
            template_rx,
            Arc::new(RecentHeaders::default()),
            refresh_tx,
        );

        let template = BlockTemplate {
            height: 1,
            header: "0xh".to_string(),
            seed: "0xs".to_string(),
            target: BigUint::from(1u8),
            difficulty: BigUint::from(1u8),
        };
        template_tx.send_replace(Some(Arc::new(template)));

        publish_node_state(&server).await;
        publish_node_state(&server).await;
        assert_eq!(server.fails_count.load(Ordering::Relaxed), 2);
    }
}
