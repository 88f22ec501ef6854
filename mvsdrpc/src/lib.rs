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

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, error};

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

/// A client is latched sick once this many consecutive failures accumulate,
/// and recovers only after the same number of consecutive successes.
const SICK_THRESHOLD: u32 = 5;

/// JSON-RPC 2.0 request structure (MVS daemon format)
#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: serde_json::Value,
    id: u64,
}

/// JSON-RPC 2.0 response. The daemon sets exactly one of `result` and
/// `error`; a null `result` with a null `error` is a valid "not found" reply
/// for lookup methods such as `getblock`.
#[derive(Deserialize, Debug)]
struct JsonRpcResponse {
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Error type for the upstream RPC client
#[derive(Debug)]
pub enum RpcClientError {
    /// Network-level failure reaching the daemon
    Transport(String),
    /// The daemon replied but the body could not be decoded
    Parse(String),
    /// Structured error reply; the daemon's message is surfaced verbatim
    Rpc { code: i64, message: String },
}

impl Error for RpcClientError {}

impl fmt::Display for RpcClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcClientError::Transport(message) => write!(f, "transport error: {message}"),
            RpcClientError::Parse(message) => write!(f, "parse error: {message}"),
            RpcClientError::Rpc { code, message } => write!(f, "rpc error {code}: {message}"),
        }
    }
}

/// One output of an MVS transaction.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TxOutput {
    pub address: String,
    /// Satoshi-denominated
    pub value: i64,
}

/// An MVS transaction as reported inside a `getblock` reply. Only the fields
/// the pool consumes are decoded.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MvsTx {
    pub hash: String,
    #[serde(default)]
    pub outputs: Vec<TxOutput>,
}

/// Full `getblock` reply.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GetBlockReply {
    #[serde(rename = "bits")]
    pub difficulty: String,
    pub hash: String,
    #[serde(default)]
    pub merkle_tree_hash: String,
    /// The daemon reports the winning nonce as a decimal string.
    pub nonce: String,
    #[serde(default)]
    pub previous_block_hash: String,
    #[serde(default)]
    pub time_stamp: u32,
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub mixhash: String,
    pub number: u64,
    #[serde(default)]
    pub transaction_count: i32,
    #[serde(default)]
    pub transactions: Vec<MvsTx>,
}

/// Partial header reply from `fetchheaderext`, enough for height tracking.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GetBlockReplyPart {
    pub number: u64,
    #[serde(rename = "bits", default)]
    pub difficulty: String,
}

/// Receipt for a broadcast transaction, from `gettx`.
#[derive(Debug, Clone, Deserialize)]
pub struct TxReceipt {
    pub hash: String,
    #[serde(default)]
    pub height: u64,
}

impl TxReceipt {
    pub fn confirmed(&self) -> bool {
        self.height != 0
    }

    /// Always true: the MVS `gettx` reply carries no execution status field,
    /// so a confirmed transaction is assumed to have succeeded.
    pub fn successful(&self) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct GetBalanceReply {
    unspent: i64,
    frozen: i64,
}

#[derive(Debug, Deserialize)]
struct GetPeerInfoReply {
    peers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SignRawTxReply {
    #[allow(dead_code)]
    hash: String,
    rawtx: String,
}

#[derive(Debug, Default)]
struct Health {
    sick: bool,
    sick_rate: u32,
    success_rate: u32,
}

/// The subset of the daemon surface the pool core consumes. The concrete
/// [`UpstreamClient`] implements it; tests mock it.
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait UpstreamRpc: Send + Sync {
    fn name(&self) -> String;
    fn url(&self) -> String;
    async fn get_work(&self) -> Result<Vec<String>, RpcClientError>;
    async fn submit_work(&self, params: Vec<String>) -> Result<bool, RpcClientError>;
    async fn get_height(&self) -> Result<u64, RpcClientError>;
    async fn get_pending_block(&self) -> Result<Option<GetBlockReplyPart>, RpcClientError>;
    async fn get_block_by_height(
        &self,
        height: u64,
    ) -> Result<Option<GetBlockReply>, RpcClientError>;
    async fn set_mining_account(&self, address: String) -> Result<String, RpcClientError>;
    /// Probes the daemon with `getwork` and returns whether the client is
    /// currently considered healthy.
    async fn check(&self) -> bool;
    fn is_sick(&self) -> bool;
}

/// JSON-RPC over HTTP POST client for one MVS daemon.
///
/// Every transport, decode, or structured-error failure bumps the sickness
/// counters; failures never propagate into share handling directly.
#[derive(Debug)]
pub struct UpstreamClient {
    name: String,
    url: String,
    account: String,
    password: String,
    client: reqwest::Client,
    health: RwLock<Health>,
}

impl UpstreamClient {
    pub fn new(
        name: &str,
        url: &str,
        account: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, RpcClientError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcClientError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            account: account.to_string(),
            password: password.to_string(),
            client,
            health: RwLock::new(Health::default()),
        })
    }

    /// Posts one JSON-RPC request and returns the raw `result` value.
    ///
    /// `Ok(None)` means the daemon replied with a null result and no error,
    /// which lookup methods use for "not found".
    async fn do_post(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<serde_json::Value>, RpcClientError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 0,
        };

        let response = match self.client.post(&self.url).json(&request).send().await {
            Ok(resp) => resp,
            Err(e) => {
                self.mark_sick();
                error!("HTTP request to {} failed: {}", self.name, e);
                return Err(RpcClientError::Transport(e.to_string()));
            }
        };

        let rpc_response: JsonRpcResponse = match response.json().await {
            Ok(decoded) => decoded,
            Err(e) => {
                self.mark_sick();
                return Err(RpcClientError::Parse(format!(
                    "failed to decode response: {e}"
                )));
            }
        };

        if let Some(err) = rpc_response.error {
            self.mark_sick();
            debug!("{} returned rpc error {}: {}", self.name, err.code, err.message);
            return Err(RpcClientError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        Ok(rpc_response.result)
    }

    /// Posts a request and decodes a non-null result into `T`.
    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, RpcClientError> {
        match self.do_post(method, params).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| RpcClientError::Parse(format!("unexpected {method} result: {e}"))),
            None => Err(RpcClientError::Parse(format!(
                "{method} returned null result"
            ))),
        }
    }

    /// Like [`request`](Self::request), but a null result maps to `None`.
    async fn request_opt<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, RpcClientError> {
        match self.do_post(method, params).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| RpcClientError::Parse(format!("unexpected {method} result: {e}"))),
            None => Ok(None),
        }
    }

    /// Current unspendable balance for an address: unspent minus frozen.
    pub async fn get_balance(&self, address: &str) -> Result<i64, RpcClientError> {
        let reply: GetBalanceReply = self
            .request("getaddressetp", serde_json::json!([address]))
            .await?;
        Ok(reply.unspent - reply.frozen)
    }

    pub async fn get_tx_receipt(&self, hash: &str) -> Result<Option<TxReceipt>, RpcClientError> {
        self.request_opt("gettx", serde_json::json!([hash])).await
    }

    pub async fn get_block_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<GetBlockReply>, RpcClientError> {
        self.request_opt("getblock", serde_json::json!([hash])).await
    }

    pub async fn get_peer_count(&self) -> Result<u64, RpcClientError> {
        let reply: GetPeerInfoReply = self.request("getpeerinfo", serde_json::json!([])).await?;
        Ok(reply.peers.len() as u64)
    }

    pub async fn send_transaction(
        &self,
        from: &str,
        to: &str,
        value: &str,
    ) -> Result<String, RpcClientError> {
        let tx: MvsTx = self
            .request(
                "sendfrom",
                serde_json::json!([self.account, self.password, from, to, value]),
            )
            .await?;
        Ok(tx.hash)
    }

    /// Builds an unsigned transfer transaction. `receivers` entries are
    /// `address:amount` strings; `mychange` routes change back to the sender.
    async fn create_raw_tx(
        &self,
        tx_type: u16,
        senders: &[String],
        receivers: &[String],
        mychange: &str,
        fee: u64,
    ) -> Result<String, RpcClientError> {
        let mut optional = serde_json::Map::new();
        optional.insert("type".into(), tx_type.into());
        optional.insert("senders".into(), serde_json::json!(senders));
        optional.insert("receivers".into(), serde_json::json!(receivers));
        if !mychange.is_empty() {
            optional.insert("mychange".into(), mychange.into());
        }
        if fee != 0 {
            optional.insert("fee".into(), fee.into());
        }
        self.request("createrawtx", serde_json::json!([optional]))
            .await
    }

    async fn sign_raw_tx(&self, transaction: &str) -> Result<String, RpcClientError> {
        let reply: SignRawTxReply = self
            .request(
                "signrawtx",
                serde_json::json!([self.account, self.password, transaction, {}]),
            )
            .await?;
        Ok(reply.rawtx)
    }

    async fn send_raw_tx(&self, transaction: &str, fee: u64) -> Result<String, RpcClientError> {
        let mut optional = serde_json::Map::new();
        if fee != 0 {
            optional.insert("fee".into(), fee.into());
        }
        self.request("sendrawtx", serde_json::json!([transaction, optional]))
            .await
    }

    /// One payout transaction with many receivers. Returns the broadcast
    /// transaction hash.
    pub async fn send_more(
        &self,
        from: &str,
        receivers: &HashMap<String, i64>,
    ) -> Result<String, RpcClientError> {
        const PAYOUT_FEE: u64 = 10_000;
        let receivers: Vec<String> = receivers
            .iter()
            .map(|(login, amount)| format!("{login}:{amount}"))
            .collect();
        let senders = vec![from.to_string()];
        let rawtx = self
            .create_raw_tx(0, &senders, &receivers, from, PAYOUT_FEE)
            .await?;
        let signed = self.sign_raw_tx(&rawtx).await?;
        self.send_raw_tx(&signed, PAYOUT_FEE).await
    }

    fn mark_sick(&self) {
        let mut health = self.health.write().unwrap();
        health.sick_rate += 1;
        health.success_rate = 0;
        if health.sick_rate >= SICK_THRESHOLD {
            health.sick = true;
        }
    }

    fn mark_alive(&self) {
        let mut health = self.health.write().unwrap();
        health.success_rate += 1;
        if health.success_rate >= SICK_THRESHOLD {
            health.sick = false;
            health.sick_rate = 0;
            health.success_rate = 0;
        }
    }
}

#[async_trait]
impl UpstreamRpc for UpstreamClient {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    /// Current work as `[header_hash, seed_hash, target_hex]`.
    async fn get_work(&self) -> Result<Vec<String>, RpcClientError> {
        self.request("getwork", serde_json::json!([])).await
    }

    /// Forwards a solved share. The daemon replies with the string "false"
    /// when the block is rejected; anything else counts as accepted.
    async fn submit_work(&self, params: Vec<String>) -> Result<bool, RpcClientError> {
        let result = self.do_post("submitwork", serde_json::json!(params)).await?;
        Ok(!matches!(result, Some(serde_json::Value::String(s)) if s == "false"))
    }

    async fn get_height(&self) -> Result<u64, RpcClientError> {
        self.request("fetch-height", serde_json::json!([])).await
    }

    /// Pending (not yet sealed) header, used as the authoritative head for
    /// maturity-depth calculations.
    async fn get_pending_block(&self) -> Result<Option<GetBlockReplyPart>, RpcClientError> {
        self.request_opt(
            "fetchheaderext",
            serde_json::json!([self.account, self.password, "pending"]),
        )
        .await
    }

    async fn get_block_by_height(
        &self,
        height: u64,
    ) -> Result<Option<GetBlockReply>, RpcClientError> {
        self.request_opt("getblock", serde_json::json!([height])).await
    }

    async fn set_mining_account(&self, address: String) -> Result<String, RpcClientError> {
        self.request(
            "setminingaccount",
            serde_json::json!([self.account, self.password, address]),
        )
        .await
    }

    async fn check(&self) -> bool {
        if self.get_work().await.is_err() {
            return false;
        }
        self.mark_alive();
        !self.is_sick()
    }

    fn is_sick(&self) -> bool {
        self.health.read().unwrap().sick
    }
}
