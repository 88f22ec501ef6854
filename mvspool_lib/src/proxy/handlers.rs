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

use super::messages::{ErrorReply, JsonRpcRequest, JsonRpcResponse};
use super::session::Session;
use super::validator::ShareStatus;
use super::ProxyServer;
use crate::storage::BlockCandidate;
use crate::util::{make_timestamp, to_hex};
use serde_json::json;
use tracing::{info, warn};

impl ProxyServer {
    /// Shared dispatch for both wire surfaces. `None` means the request was
    /// malformed enough to drop without a reply (missing id).
    pub async fn handle_message(
        &self,
        session: &mut Session,
        req: &JsonRpcRequest,
    ) -> Option<JsonRpcResponse> {
        if req.id.is_none() {
            warn!("missing RPC id from {}", session.ip);
            self.policy.apply_malformed_policy(&session.ip);
            return None;
        }

        let login = session.login.clone().unwrap_or_default();
        if !self.policy.apply_login_policy(&login, &session.ip) {
            let error = ErrorReply::new(-1, "You are blacklisted");
            return Some(JsonRpcResponse::error(req.id.clone(), error));
        }

        let response = match req.method.as_str() {
            "eth_getWork" => match self.handle_get_work(session) {
                Ok(reply) => JsonRpcResponse::result(req.id.clone(), json!(reply)),
                Err(error) => JsonRpcResponse::error(req.id.clone(), error),
            },
            "eth_submitWork" => match req.string_params() {
                Some(params) if params.len() >= 3 => {
                    match self.handle_submit_work(session, &login, &params).await {
                        Ok(accepted) => JsonRpcResponse::result(req.id.clone(), json!(accepted)),
                        Err(error) => JsonRpcResponse::error(req.id.clone(), error),
                    }
                }
                _ => {
                    warn!("malformed eth_submitWork params from {}", session.ip);
                    self.policy.apply_malformed_policy(&session.ip);
                    let error = ErrorReply::new(-1, "Malformed request");
                    JsonRpcResponse::error(req.id.clone(), error)
                }
            },
            "eth_getBlockByNumber" => {
                JsonRpcResponse::result(req.id.clone(), self.handle_get_block_by_number())
            }
            "eth_submitHashrate" => JsonRpcResponse::result(req.id.clone(), json!(true)),
            unknown => {
                let error = self.handle_unknown_rpc(&session.ip, unknown);
                JsonRpcResponse::error(req.id.clone(), error)
            }
        };
        Some(response)
    }

    /// Current work for the session's tier:
    /// `[header_hash, seed_hash, tier_target_hex, height_hex]`.
    pub fn handle_get_work(&self, session: &mut Session) -> Result<Vec<String>, ErrorReply> {
        let tier = self
            .tiers
            .get(session.tier)
            .ok_or_else(|| ErrorReply::new(-1, "Work not ready"))?;
        let template = self
            .current_template()
            .filter(|_| !self.is_sick())
            .ok_or_else(|| ErrorReply::new(-1, "Work not ready"))?;

        session.last_header = Some(template.header.clone());
        Ok(vec![
            template.header.clone(),
            template.seed.clone(),
            tier.target_hex.clone(),
            to_hex(template.height),
        ])
    }

    /// Validates `[nonce, pow_hash, mix_digest]` against the session tier.
    /// Returns whether the share was accepted; block-level solutions are
    /// forwarded upstream and recorded as candidates.
    pub async fn handle_submit_work(
        &self,
        session: &Session,
        login: &str,
        params: &[String],
    ) -> Result<bool, ErrorReply> {
        let tier = self
            .tiers
            .get(session.tier)
            .ok_or_else(|| ErrorReply::new(-1, "Work not ready"))?;
        let template = self
            .current_template()
            .ok_or_else(|| ErrorReply::new(-1, "Work not ready"))?;

        let status = self.validator.judge(
            login,
            params,
            &template.seed,
            &tier.target,
            &template.target,
        );
        match status {
            ShareStatus::Stale => {
                info!("stale share from {}@{}", login, session.ip);
                Ok(false)
            }
            ShareStatus::Duplicate => {
                warn!("duplicate share {} from {}@{}", params[0], login, session.ip);
                Ok(false)
            }
            ShareStatus::Invalid => {
                warn!("invalid share from {}@{}", login, session.ip);
                Ok(false)
            }
            ShareStatus::Valid { .. } => {
                let write = self
                    .backend
                    .write_share(login.to_string(), session.worker.clone())
                    .await;
                if let Err(e) = write {
                    warn!("failed to insert share: {}", e);
                    return Ok(false);
                }
                Ok(true)
            }
            ShareStatus::BlockSolution { height } => {
                self.process_block_solution(session, login, params, height, &template.difficulty)
                    .await;
                Ok(true)
            }
        }
    }

    async fn process_block_solution(
        &self,
        session: &Session,
        login: &str,
        params: &[String],
        height: u64,
        difficulty: &num_bigint::BigUint,
    ) {
        let rpc = self.pool.active();
        match rpc.submit_work(params.to_vec()).await {
            Err(e) => {
                warn!("block submission failure at height {}: {}", height, e);
            }
            Ok(false) => {
                warn!("block rejected at height {}", height);
            }
            Ok(true) => {
                self.trigger_refresh();
                let share_write = self
                    .backend
                    .write_share(login.to_string(), session.worker.clone())
                    .await;
                if let Err(e) = share_write {
                    warn!("failed to insert share: {}", e);
                    return;
                }
                let candidate = BlockCandidate {
                    round_height: height,
                    height,
                    nonce: params[0].clone(),
                    pow_hash: params[1].clone(),
                    mix_digest: params[2].clone(),
                    timestamp: make_timestamp(),
                    difficulty: difficulty.to_string(),
                    ..Default::default()
                };
                match self.backend.write_block_candidate(candidate).await {
                    Ok(()) => {
                        info!("block found by {}@{} at height {}", login, session.ip, height);
                    }
                    Err(e) => warn!("failed to insert block candidate: {}", e),
                }
            }
        }
    }

    /// Compatibility stub for clients that poll `eth_getBlockByNumber`.
    pub fn handle_get_block_by_number(&self) -> serde_json::Value {
        match self.current_template() {
            Some(template) => json!({
                "number": to_hex(template.height),
                "bits": template.difficulty.to_string(),
            }),
            None => serde_json::Value::Null,
        }
    }

    pub fn handle_unknown_rpc(&self, ip: &str, method: &str) -> ErrorReply {
        warn!("unknown request method {} from {}", method, ip);
        self.policy.apply_malformed_policy(ip);
        ErrorReply::new(-3, "Method not found")
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{build_proxy, publish_template};
    use super::super::validator::{MockPowVerifier, PowOutput};
    use super::*;
    use crate::proxy::messages::Id;
    use crate::storage::Backend;
    use mvsdrpc::MockUpstreamRpc;
    use num_bigint::BigUint;
    use std::sync::Arc;

    fn request(method: &str, params: serde_json::Value) -> JsonRpcRequest {
        JsonRpcRequest {
            id: Some(Id::Number(1)),
            method: method.to_string(),
            params: Some(params),
            worker: None,
        }
    }

    fn pow_with_result(result: u64) -> Arc<dyn super::super::validator::PowVerifier> {
        let mut pow = MockPowVerifier::new();
        pow.expect_verify().returning(move |_, _, _| {
            Some(PowOutput {
                mix_digest: "0xmix".to_string(),
                result: BigUint::from(result),
            })
        });
        Arc::new(pow)
    }

    fn idle_upstream() -> MockUpstreamRpc {
        MockUpstreamRpc::new()
    }

    #[tokio::test]
    async fn test_get_work_returns_template_and_tier_target() {
        let proxy = build_proxy(pow_with_result(1), idle_upstream());
        publish_template(&proxy, 1200, "0xheader");

        let mut session = Session::new("1.2.3.4".to_string(), 0);
        session.login = Some("miner-a".to_string());
        let req = request("eth_getWork", serde_json::json!([]));

        let resp = proxy.server.handle_message(&mut session, &req).await.unwrap();
        let work: Vec<String> = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert_eq!(work[0], "0xheader");
        assert_eq!(work[1], "0xseed");
        assert_eq!(work[2], proxy.server.tiers[0].target_hex);
        assert_eq!(work[3], "0x04b0");
        assert_eq!(session.last_header.as_deref(), Some("0xheader"));
    }

    #[tokio::test]
    async fn test_get_work_before_first_template_errors() {
        let proxy = build_proxy(pow_with_result(1), idle_upstream());
        let mut session = Session::new("1.2.3.4".to_string(), 0);
        session.login = Some("miner-a".to_string());
        let req = request("eth_getWork", serde_json::json!([]));

        let resp = proxy.server.handle_message(&mut session, &req).await.unwrap();
        assert_eq!(resp.error.unwrap(), ErrorReply::new(-1, "Work not ready"));
    }

    #[tokio::test]
    async fn test_share_above_tier_target_rejected() {
        // Result above the 2M tier target (difficulty below 2M).
        let weak = (BigUint::from(1u8) << 256u32) / BigUint::from(1_000_000u64);
        let mut pow = MockPowVerifier::new();
        pow.expect_verify().returning(move |_, _, _| {
            Some(PowOutput {
                mix_digest: "0xmix".to_string(),
                result: weak.clone(),
            })
        });

        let proxy = build_proxy(Arc::new(pow), idle_upstream());
        publish_template(&proxy, 1200, "0xheader");

        let mut session = Session::new("1.2.3.4".to_string(), 0);
        session.login = Some("miner-a".to_string());
        let req = request(
            "eth_submitWork",
            serde_json::json!(["0x10", "0xheader", "0xmix"]),
        );

        let resp = proxy.server.handle_message(&mut session, &req).await.unwrap();
        assert_eq!(resp.result.unwrap(), serde_json::json!(false));
    }

    #[tokio::test]
    async fn test_submit_share_between_targets_counts_without_upstream() {
        // Between the 2M tier target and the 50M block target: a plain
        // share. No upstream expectation is set, so a submit would panic.
        let share_result = (BigUint::from(1u8) << 256u32) / BigUint::from(3_000_000u64);
        let mut pow = MockPowVerifier::new();
        pow.expect_verify().returning(move |_, _, _| {
            Some(PowOutput {
                mix_digest: "0xmix".to_string(),
                result: share_result.clone(),
            })
        });

        let proxy = build_proxy(Arc::new(pow), idle_upstream());
        publish_template(&proxy, 1200, "0xheader");

        let mut session = Session::new("1.2.3.4".to_string(), 0);
        session.login = Some("miner-a".to_string());
        let req = request(
            "eth_submitWork",
            serde_json::json!(["0x10", "0xheader", "0xmix"]),
        );

        let resp = proxy.server.handle_message(&mut session, &req).await.unwrap();
        assert_eq!(resp.result.unwrap(), serde_json::json!(true));
    }

    #[tokio::test]
    async fn test_submit_block_solution_records_candidate() {
        let mut upstream = idle_upstream();
        upstream.expect_submit_work().returning(|_| Ok(true));

        // Result below both targets.
        let proxy = build_proxy(pow_with_result(1), upstream);
        publish_template(&proxy, 1200, "0xheader");

        let mut session = Session::new("1.2.3.4".to_string(), 0);
        session.login = Some("miner-a".to_string());
        let req = request(
            "eth_submitWork",
            serde_json::json!(["0x10", "0xheader", "0xmix"]),
        );

        let resp = proxy.server.handle_message(&mut session, &req).await.unwrap();
        assert_eq!(resp.result.unwrap(), serde_json::json!(true));

        let candidates = proxy.backend.get_candidates(u64::MAX).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].round_height, 1200);
        assert_eq!(candidates[0].nonce, "0x10");
        assert_eq!(candidates[0].total_shares, 1);

        let shares = proxy
            .backend
            .get_round_shares(1200, "0x10".to_string())
            .await
            .unwrap();
        assert_eq!(shares["miner-a"], 1);
    }

    #[tokio::test]
    async fn test_rejected_block_still_replies_true_without_candidate() {
        let mut upstream = idle_upstream();
        upstream.expect_submit_work().returning(|_| Ok(false));

        let proxy = build_proxy(pow_with_result(1), upstream);
        publish_template(&proxy, 1200, "0xheader");

        let mut session = Session::new("1.2.3.4".to_string(), 0);
        session.login = Some("miner-a".to_string());
        let req = request(
            "eth_submitWork",
            serde_json::json!(["0x10", "0xheader", "0xmix"]),
        );

        let resp = proxy.server.handle_message(&mut session, &req).await.unwrap();
        assert_eq!(resp.result.unwrap(), serde_json::json!(true));
        assert!(proxy.backend.get_candidates(u64::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_id_drops_request() {
        let proxy = build_proxy(pow_with_result(1), idle_upstream());
        let mut session = Session::new("1.2.3.4".to_string(), 0);
        session.login = Some("miner-a".to_string());
        let req = JsonRpcRequest {
            id: None,
            method: "eth_getWork".to_string(),
            params: None,
            worker: None,
        };
        assert!(proxy.server.handle_message(&mut session, &req).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_method_error() {
        let proxy = build_proxy(pow_with_result(1), idle_upstream());
        let mut session = Session::new("1.2.3.4".to_string(), 0);
        session.login = Some("miner-a".to_string());
        let req = request("eth_strangeCall", serde_json::json!([]));

        let resp = proxy.server.handle_message(&mut session, &req).await.unwrap();
        assert_eq!(resp.error.unwrap(), ErrorReply::new(-3, "Method not found"));
    }

    #[tokio::test]
    async fn test_submit_hashrate_accepted() {
        let proxy = build_proxy(pow_with_result(1), idle_upstream());
        let mut session = Session::new("1.2.3.4".to_string(), 0);
        session.login = Some("miner-a".to_string());
        let req = request("eth_submitHashrate", serde_json::json!(["0x1000", "0xid"]));

        let resp = proxy.server.handle_message(&mut session, &req).await.unwrap();
        assert_eq!(resp.result.unwrap(), serde_json::json!(true));
    }
}
