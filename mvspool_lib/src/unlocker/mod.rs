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

pub mod rewards;

use crate::config::UnlockerConfig;
use crate::storage::{Backend, BlockCandidate, StorageError};
use crate::util::is_valid_mvs_address;
use mvsdrpc::{GetBlockReply, UpstreamRpc};
use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::Zero;
use rewards::{charge_fee, const_reward, rewards_for_shares, truncate_satoshi};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum UnlockError {
    #[error("unable to get current blockchain height from node: {0}")]
    PendingBlock(String),
    #[error("error while retrieving block {0} from node: {1}")]
    Rpc(u64, String),
    #[error("error while retrieving block {0} from node, wrong node height")]
    MissingBlock(u64),
    #[error("coinbase invalid output length")]
    CoinbaseOutputs,
    #[error("coinbase value {coinbase} must be >= base reward {base}")]
    CoinbaseBelowBaseReward { coinbase: BigInt, base: BigInt },
    #[error("round {0} has no shares to credit")]
    NoRoundShares(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("invalid pool fee address {0}")]
    InvalidFeeAddress(String),
}

struct UnlockResult {
    matured_blocks: Vec<BlockCandidate>,
    orphaned_blocks: Vec<BlockCandidate>,
}

/// Periodic pipeline walking found blocks through
/// `pending -> immature -> matured | orphan` against the authoritative
/// chain, and crediting miners.
///
/// Any reconciliation-fatal error latches `halt`: silent drift of credit
/// state is worse than pausing the pool, so only an operator restart clears
/// it.
pub struct BlockUnlocker<R, B> {
    config: UnlockerConfig,
    rpc: Arc<R>,
    backend: Arc<B>,
    halt: bool,
    last_fail: Option<String>,
}

impl<R: UpstreamRpc, B: Backend> BlockUnlocker<R, B> {
    pub fn new(
        config: UnlockerConfig,
        rpc: Arc<R>,
        backend: Arc<B>,
    ) -> Result<Self, UnlockError> {
        if !config.pool_fee_address.is_empty() && !is_valid_mvs_address(&config.pool_fee_address) {
            return Err(UnlockError::InvalidFeeAddress(
                config.pool_fee_address.clone(),
            ));
        }
        Ok(Self {
            config,
            rpc,
            backend,
            halt: false,
            last_fail: None,
        })
    }

    /// The safety interlock, exposed for health reporting.
    pub fn halted(&self) -> bool {
        self.halt
    }

    pub fn last_fail(&self) -> Option<&str> {
        self.last_fail.as_deref()
    }

    /// Runs the unlocker until the task is dropped. Unlocks immediately on
    /// start, then on every interval tick.
    pub async fn run(mut self) {
        info!(
            "starting block unlocker, interval {:?}",
            self.config.interval
        );
        self.tick().await;

        let mut timer = tokio::time::interval(self.config.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await;
        loop {
            timer.tick().await;
            self.tick().await;
        }
    }

    /// One pass: promote pending candidates to immature, then immature
    /// blocks to matured. Phases are serialized; a halt stops both.
    pub async fn tick(&mut self) {
        self.unlock_pending_blocks().await;
        self.unlock_and_credit_miners().await;
    }

    async fn unlock_pending_blocks(&mut self) {
        if self.halt {
            warn!(
                "unlocking suspended due to last critical error: {:?}",
                self.last_fail
            );
            return;
        }
        if let Err(e) = self.run_phase(Phase::Pending).await {
            self.halt = true;
            self.last_fail = Some(e.to_string());
            error!("failed to unlock pending blocks: {}", e);
        }
    }

    async fn unlock_and_credit_miners(&mut self) {
        if self.halt {
            warn!(
                "unlocking suspended due to last critical error: {:?}",
                self.last_fail
            );
            return;
        }
        if let Err(e) = self.run_phase(Phase::Matured).await {
            self.halt = true;
            self.last_fail = Some(e.to_string());
            error!("failed to credit miners: {}", e);
        }
    }

    async fn run_phase(&self, phase: Phase) -> Result<(), UnlockError> {
        let pending = self
            .rpc
            .get_pending_block()
            .await
            .map_err(|e| UnlockError::PendingBlock(e.to_string()))?
            .ok_or_else(|| UnlockError::PendingBlock("empty pending header".to_string()))?;
        let current_height = pending.number;

        let (depth, label) = match phase {
            Phase::Pending => (self.config.immature_depth, "immature"),
            Phase::Matured => (self.config.depth, "matured"),
        };
        let max_height = current_height.saturating_sub(depth);
        let candidates = match phase {
            Phase::Pending => self.backend.get_candidates(max_height).await?,
            Phase::Matured => self.backend.get_immature_blocks(max_height).await?,
        };
        if candidates.is_empty() {
            info!("no blocks to unlock in {} phase", label);
            return Ok(());
        }

        let result = self.unlock_candidates(candidates).await?;
        info!(
            "{} phase: {} blocks, {} orphans",
            label,
            result.matured_blocks.len(),
            result.orphaned_blocks.len()
        );

        match phase {
            Phase::Pending => {
                self.backend
                    .write_pending_orphans(result.orphaned_blocks)
                    .await?;
            }
            Phase::Matured => {
                for orphan in result.orphaned_blocks {
                    self.backend.write_orphan(orphan).await?;
                }
            }
        }

        let mut total_revenue = BigRational::zero();
        let mut total_miners_profit = BigRational::zero();
        let mut total_pool_profit = BigRational::zero();

        for block in result.matured_blocks {
            let (revenue, miners_profit, pool_profit, round_rewards) =
                self.calculate_rewards(&block).await?;
            let round_key = block.round_key();
            for (login, reward) in &round_rewards {
                info!("reward {}: {}: {} satoshi", round_key, login, reward);
            }
            match phase {
                Phase::Pending => {
                    self.backend
                        .write_immature_block(block, round_rewards)
                        .await?;
                }
                Phase::Matured => {
                    self.backend
                        .write_matured_block(block, round_rewards)
                        .await?;
                }
            }
            total_revenue += revenue;
            total_miners_profit += miners_profit;
            total_pool_profit += pool_profit;
        }

        info!(
            "{} session: revenue {}, miners profit {}, pool profit {}",
            label,
            truncate_satoshi(&total_revenue),
            truncate_satoshi(&total_miners_profit),
            truncate_satoshi(&total_pool_profit),
        );
        Ok(())
    }

    /// Reconciles each candidate against the chain block at its height.
    /// Mismatches are orphans; a missing block or a bad coinbase is fatal
    /// for the whole tick.
    async fn unlock_candidates(
        &self,
        candidates: Vec<BlockCandidate>,
    ) -> Result<UnlockResult, UnlockError> {
        let mut result = UnlockResult {
            matured_blocks: Vec::new(),
            orphaned_blocks: Vec::new(),
        };

        for mut candidate in candidates {
            let height = candidate.height;
            let block = self
                .rpc
                .get_block_by_height(height)
                .await
                .map_err(|e| UnlockError::Rpc(height, e.to_string()))?
                .ok_or(UnlockError::MissingBlock(height))?;

            if self.match_candidate(&block, &candidate) {
                self.handle_block(&block, &mut candidate)?;
                info!(
                    "mature block {} hash {}",
                    candidate.height,
                    &candidate.hash[..candidate.hash.len().min(10)]
                );
                result.matured_blocks.push(candidate);
            } else {
                candidate.orphan = true;
                info!("orphaned block {}:{}", candidate.round_height, candidate.nonce);
                result.orphaned_blocks.push(candidate);
            }
        }
        Ok(result)
    }

    /// A chain block matches a candidate when its coinbase pays the pool,
    /// any previously recorded hash still agrees, and the nonces compare
    /// equal as integers. The chain reports nonces in decimal while
    /// candidates record hex.
    fn match_candidate(&self, block: &GetBlockReply, candidate: &BlockCandidate) -> bool {
        let coinbase_address = block
            .transactions
            .first()
            .and_then(|tx| tx.outputs.first())
            .map(|output| output.address.as_str());
        match coinbase_address {
            Some(address) if address == self.config.address => {}
            _ => {
                info!(
                    "orphaned block {}:{} for coinbase address mismatch",
                    candidate.round_height, candidate.nonce
                );
                return false;
            }
        }

        if !candidate.hash.is_empty() && !candidate.hash.eq_ignore_ascii_case(&block.hash) {
            return false;
        }

        let block_nonce = block.nonce.parse::<i64>().unwrap_or_default();
        let candidate_nonce =
            i64::from_str_radix(&candidate.nonce.replace("0x", ""), 16).unwrap_or_default();
        block_nonce == candidate_nonce
    }

    /// Fills in the authoritative height, hash and reward split for a
    /// matched block.
    fn handle_block(
        &self,
        block: &GetBlockReply,
        candidate: &mut BlockCandidate,
    ) -> Result<(), UnlockError> {
        candidate.height = block.number;
        let base_reward = const_reward(candidate.height);

        let coinbase_value = coinbase_value(block)?;
        if coinbase_value < base_reward {
            return Err(UnlockError::CoinbaseBelowBaseReward {
                coinbase: coinbase_value,
                base: base_reward,
            });
        }
        let extra = &coinbase_value - &base_reward;

        if self.config.keep_tx_fees {
            candidate.reward = Some(base_reward);
            candidate.extra_reward = Some(extra);
        } else {
            candidate.reward = Some(base_reward + extra);
            candidate.extra_reward = None;
        }

        candidate.orphan = false;
        candidate.hash = block.hash.clone();
        Ok(())
    }

    /// Splits a matured block's reward between miners, the pool fee address
    /// and the optional donation, in exact rationals with final truncation.
    async fn calculate_rewards(
        &self,
        block: &BlockCandidate,
    ) -> Result<(BigRational, BigRational, BigRational, HashMap<String, i64>), UnlockError> {
        let reward = block.reward.clone().unwrap_or_default();
        let mut revenue = BigRational::from_integer(reward);
        let (miners_profit, mut pool_profit) = charge_fee(&revenue, self.config.pool_fee);

        if block.total_shares <= 0 {
            return Err(UnlockError::NoRoundShares(block.round_key()));
        }
        let shares = self
            .backend
            .get_round_shares(block.round_height, block.nonce.clone())
            .await?;

        let mut round_rewards = rewards_for_shares(&shares, block.total_shares, &miners_profit);

        if let Some(extra) = &block.extra_reward {
            let extra = BigRational::from_integer(extra.clone());
            pool_profit += &extra;
            revenue += extra;
        }

        if self.config.donate {
            let (kept, donation) = charge_fee(&pool_profit, rewards::DONATION_FEE);
            pool_profit = kept;
            *round_rewards
                .entry(rewards::DONATION_ACCOUNT.to_lowercase())
                .or_insert(0) += truncate_satoshi(&donation);
        }

        if !self.config.pool_fee_address.is_empty() {
            *round_rewards
                .entry(self.config.pool_fee_address.clone())
                .or_insert(0) += truncate_satoshi(&pool_profit);
        }

        Ok((revenue, miners_profit, pool_profit, round_rewards))
    }
}

#[derive(Clone, Copy)]
enum Phase {
    Pending,
    Matured,
}

fn coinbase_value(block: &GetBlockReply) -> Result<BigInt, UnlockError> {
    let coinbase = block.transactions.first().ok_or(UnlockError::CoinbaseOutputs)?;
    if coinbase.outputs.len() != 1 {
        return Err(UnlockError::CoinbaseOutputs);
    }
    Ok(BigInt::from(coinbase.outputs[0].value))
}
