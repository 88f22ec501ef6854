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

pub mod subscriber;

use crate::upstream::UpstreamPool;
use crate::util::target_hex_to_diff;
use num_bigint::BigUint;
use num_traits::Zero;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

/// Heights a header hash stays recognized after a newer template replaces it.
const HEADER_WINDOW: u64 = 2;

#[derive(Debug)]
pub struct WorkError {
    pub message: String,
}

impl fmt::Display for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "work error: {}", self.message)
    }
}

impl std::error::Error for WorkError {}

/// The current mining job. Immutable; replaced wholesale on refresh and
/// shared as an `Arc`, so readers never observe a torn
/// `(header, seed, target)` triple.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockTemplate {
    pub height: u64,
    pub header: String,
    pub seed: String,
    pub target: BigUint,
    pub difficulty: BigUint,
}

/// Template cache endpoints: single writer (the refresher), many readers.
pub type TemplateSender = watch::Sender<Option<Arc<BlockTemplate>>>;
pub type TemplateReceiver = watch::Receiver<Option<Arc<BlockTemplate>>>;

pub fn template_channel() -> (TemplateSender, TemplateReceiver) {
    watch::channel(None)
}

/// Header hashes of recently issued templates, mapped to their heights.
///
/// A submission is judged against this window: once a header falls out, any
/// share against it is stale.
#[derive(Default)]
pub struct RecentHeaders {
    headers: RwLock<HashMap<String, u64>>,
}

impl RecentHeaders {
    pub fn register(&self, header: &str, height: u64) {
        let mut headers = self.headers.write().unwrap();
        headers.insert(header.to_string(), height);
        headers.retain(|_, h| *h + HEADER_WINDOW >= height);
    }

    /// The height the header was issued at, if still recognized.
    pub fn lookup(&self, header: &str) -> Option<u64> {
        self.headers.read().unwrap().get(header).copied()
    }
}

/// Fetches current work from the active upstream and assembles a template.
pub async fn fetch_block_template(pool: &UpstreamPool) -> Result<BlockTemplate, WorkError> {
    let rpc = pool.active();
    let work = rpc.get_work().await.map_err(|e| WorkError {
        message: format!("getwork on {} failed: {e}", rpc.name()),
    })?;
    if work.len() < 3 {
        return Err(WorkError {
            message: format!("getwork returned {} fields, want 3", work.len()),
        });
    }
    let height = rpc.get_height().await.map_err(|e| WorkError {
        message: format!("fetch-height on {} failed: {e}", rpc.name()),
    })?;

    let target_hex = &work[2];
    let difficulty = target_hex_to_diff(target_hex);
    if difficulty.is_zero() {
        return Err(WorkError {
            message: format!("unusable block target `{target_hex}`"),
        });
    }
    let target = hex::decode(target_hex.trim_start_matches("0x"))
        .map(|bytes| BigUint::from_bytes_be(&bytes))
        .map_err(|e| WorkError {
            message: format!("bad block target `{target_hex}`: {e}"),
        })?;

    Ok(BlockTemplate {
        height,
        header: work[0].clone(),
        seed: work[1].clone(),
        target,
        difficulty,
    })
}

/// Refresher task: reloads the template on a fixed interval and on every
/// push notification. Push notifications reset the interval so a quiet
/// period after a burst does not double-fetch.
///
/// The template is only swapped when the header actually changed, so
/// downstream broadcast listeners wake exactly once per new job.
pub async fn start_refresher(
    pool: Arc<UpstreamPool>,
    template_tx: TemplateSender,
    recent_headers: Arc<RecentHeaders>,
    refresh_interval: Duration,
    mut push_rx: mpsc::Receiver<()>,
) {
    let mut interval = tokio::time::interval(refresh_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                refresh(&pool, &template_tx, &recent_headers).await;
            }
            notification = push_rx.recv() => {
                match notification {
                    Some(()) => {
                        info!("new block push notification");
                        refresh(&pool, &template_tx, &recent_headers).await;
                        interval.reset();
                    }
                    // Subscriber is gone; the timer keeps refreshes going.
                    None => {
                        interval.tick().await;
                        refresh(&pool, &template_tx, &recent_headers).await;
                    }
                }
            }
        }
    }
}

async fn refresh(
    pool: &UpstreamPool,
    template_tx: &TemplateSender,
    recent_headers: &RecentHeaders,
) {
    let template = match fetch_block_template(pool).await {
        Ok(template) => template,
        Err(e) => {
            error!("failed to refresh block template: {}", e);
            return;
        }
    };

    let stale = {
        let current = template_tx.borrow();
        match current.as_ref() {
            Some(current) => current.header != template.header,
            None => true,
        }
    };
    if stale {
        info!(
            "new block to mine at height {} / diff {}",
            template.height, template.difficulty
        );
        recent_headers.register(&template.header, template.height);
        template_tx.send_replace(Some(Arc::new(template)));
    }
}
