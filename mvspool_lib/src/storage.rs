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
use num_bigint::{BigInt, BigUint};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone, thiserror::Error)]
#[error("storage error: {0}")]
pub struct StorageError(pub String);

/// A block the pool believes it found, moving through
/// `pending -> {immature, orphan} -> {matured, orphan}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockCandidate {
    /// Pool-local height at the moment of discovery. Advisory: the chain may
    /// place the block a few heights away.
    pub round_height: u64,
    /// Authoritative height, filled in on reconciliation.
    pub height: u64,
    /// Winning nonce, hex with optional 0x prefix.
    pub nonce: String,
    pub pow_hash: String,
    pub mix_digest: String,
    pub timestamp: i64,
    pub difficulty: String,
    /// Sum of share weights in the round; must be positive before crediting.
    pub total_shares: i64,
    /// Chain block hash, filled in after reconciliation.
    pub hash: String,
    pub orphan: bool,
    /// Satoshi. Filled in after reward computation.
    pub reward: Option<BigInt>,
    /// Satoshi kept by the pool when tx fees are withheld from miners.
    pub extra_reward: Option<BigInt>,
}

impl BlockCandidate {
    /// Identifies the round this block closed.
    pub fn round_key(&self) -> String {
        format!("{}:{}", self.round_height, self.nonce)
    }

    /// Colon-delimited storage encoding:
    /// `height:nonce:powHash:mixDigest:timestamp:diff:totalShares`
    pub fn to_record(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.round_height,
            self.nonce,
            self.pow_hash,
            self.mix_digest,
            self.timestamp,
            self.difficulty,
            self.total_shares
        )
    }

    pub fn from_record(record: &str) -> Result<Self, StorageError> {
        let fields: Vec<&str> = record.split(':').collect();
        if fields.len() != 7 {
            return Err(StorageError(format!(
                "malformed candidate record `{record}`"
            )));
        }
        let round_height: u64 = fields[0]
            .parse()
            .map_err(|e| StorageError(format!("bad height in `{record}`: {e}")))?;
        Ok(Self {
            round_height,
            height: round_height,
            nonce: fields[1].to_string(),
            pow_hash: fields[2].to_string(),
            mix_digest: fields[3].to_string(),
            timestamp: fields[4]
                .parse()
                .map_err(|e| StorageError(format!("bad timestamp in `{record}`: {e}")))?,
            difficulty: fields[5].to_string(),
            total_shares: fields[6]
                .parse()
                .map_err(|e| StorageError(format!("bad shares in `{record}`: {e}")))?,
            ..Default::default()
        })
    }
}

/// Persistence contract required by the core.
///
/// The write methods that carry a rewards map must atomically move the
/// candidate between state buckets and apply the credits; partial failure is
/// forbidden.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// All pending candidates with `round_height <= max_height`.
    async fn get_candidates(&self, max_height: u64) -> Result<Vec<BlockCandidate>, StorageError>;
    /// All immature blocks with `round_height <= max_height`.
    async fn get_immature_blocks(
        &self,
        max_height: u64,
    ) -> Result<Vec<BlockCandidate>, StorageError>;
    /// Share counts per login for the round identified by `(round_height, nonce)`.
    async fn get_round_shares(
        &self,
        round_height: u64,
        nonce: String,
    ) -> Result<HashMap<String, i64>, StorageError>;
    /// Counts one accepted share for the current round.
    async fn write_share(&self, login: String, worker: String) -> Result<(), StorageError>;
    /// Records a found block: snapshots the current round's shares under the
    /// candidate's round key and opens a fresh round.
    async fn write_block_candidate(
        &self,
        candidate: BlockCandidate,
    ) -> Result<(), StorageError>;
    async fn write_pending_orphans(
        &self,
        blocks: Vec<BlockCandidate>,
    ) -> Result<(), StorageError>;
    async fn write_orphan(&self, block: BlockCandidate) -> Result<(), StorageError>;
    async fn write_immature_block(
        &self,
        block: BlockCandidate,
        rewards: HashMap<String, i64>,
    ) -> Result<(), StorageError>;
    async fn write_matured_block(
        &self,
        block: BlockCandidate,
        rewards: HashMap<String, i64>,
    ) -> Result<(), StorageError>;
    async fn write_node_state(
        &self,
        name: String,
        height: u64,
        difficulty: BigUint,
    ) -> Result<(), StorageError>;
}

#[derive(Default)]
struct MemoryInner {
    current_round: HashMap<String, i64>,
    round_shares: HashMap<String, HashMap<String, i64>>,
    pending: Vec<BlockCandidate>,
    immature: Vec<BlockCandidate>,
    matured: Vec<BlockCandidate>,
    orphans: Vec<BlockCandidate>,
    /// Credited satoshi per login, immature and matured combined.
    balances: HashMap<String, i64>,
    node_state: HashMap<String, (u64, BigUint)>,
}

/// In-memory [`Backend`] used by the development binary and tests.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<MemoryInner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn balance(&self, login: &str) -> i64 {
        self.inner
            .lock()
            .await
            .balances
            .get(login)
            .copied()
            .unwrap_or_default()
    }

    pub async fn matured_blocks(&self) -> Vec<BlockCandidate> {
        self.inner.lock().await.matured.clone()
    }

    pub async fn orphaned_blocks(&self) -> Vec<BlockCandidate> {
        self.inner.lock().await.orphans.clone()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get_candidates(&self, max_height: u64) -> Result<Vec<BlockCandidate>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .pending
            .iter()
            .filter(|c| c.round_height <= max_height)
            .cloned()
            .collect())
    }

    async fn get_immature_blocks(
        &self,
        max_height: u64,
    ) -> Result<Vec<BlockCandidate>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .immature
            .iter()
            .filter(|c| c.round_height <= max_height)
            .cloned()
            .collect())
    }

    async fn get_round_shares(
        &self,
        round_height: u64,
        nonce: String,
    ) -> Result<HashMap<String, i64>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .round_shares
            .get(&format!("{round_height}:{nonce}"))
            .cloned()
            .unwrap_or_default())
    }

    async fn write_share(&self, login: String, _worker: String) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        *inner.current_round.entry(login).or_default() += 1;
        Ok(())
    }

    async fn write_block_candidate(
        &self,
        mut candidate: BlockCandidate,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        let shares = std::mem::take(&mut inner.current_round);
        candidate.total_shares = shares.values().sum();
        inner.round_shares.insert(candidate.round_key(), shares);
        inner.pending.push(candidate);
        Ok(())
    }

    async fn write_pending_orphans(
        &self,
        blocks: Vec<BlockCandidate>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        for block in blocks {
            inner.pending.retain(|c| c.round_key() != block.round_key());
            inner.orphans.push(block);
        }
        Ok(())
    }

    async fn write_orphan(&self, block: BlockCandidate) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.immature.retain(|c| c.round_key() != block.round_key());
        inner.orphans.push(block);
        Ok(())
    }

    async fn write_immature_block(
        &self,
        block: BlockCandidate,
        rewards: HashMap<String, i64>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.pending.retain(|c| c.round_key() != block.round_key());
        for (login, amount) in rewards {
            *inner.balances.entry(login).or_default() += amount;
        }
        inner.immature.push(block);
        Ok(())
    }

    async fn write_matured_block(
        &self,
        block: BlockCandidate,
        rewards: HashMap<String, i64>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.immature.retain(|c| c.round_key() != block.round_key());
        // Immature credits were provisional; matured credits replace them.
        for (login, amount) in rewards {
            inner.balances.insert(login, amount);
        }
        inner.matured.push(block);
        Ok(())
    }

    async fn write_node_state(
        &self,
        name: String,
        height: u64,
        difficulty: BigUint,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.node_state.insert(name, (height, difficulty));
        Ok(())
    }
}
