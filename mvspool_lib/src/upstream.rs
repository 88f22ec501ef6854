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

use mvsdrpc::UpstreamRpc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Ordered set of upstream daemons with a sticky, priority-by-position
/// leader. The first healthy upstream in configuration order is the active
/// one; the leader only changes when a health sweep elects a different
/// candidate.
pub struct UpstreamPool {
    upstreams: Vec<Arc<dyn UpstreamRpc>>,
    active: AtomicUsize,
}

impl UpstreamPool {
    pub fn new(upstreams: Vec<Arc<dyn UpstreamRpc>>) -> Self {
        assert!(!upstreams.is_empty(), "upstream pool cannot be empty");
        Self {
            upstreams,
            active: AtomicUsize::new(0),
        }
    }

    /// The currently active upstream.
    pub fn active(&self) -> Arc<dyn UpstreamRpc> {
        let i = self.active.load(Ordering::Acquire);
        Arc::clone(&self.upstreams[i])
    }

    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// One health sweep: probes every upstream in order and elects the first
    /// healthy one. Not round-robin; index 0 reclaims leadership as soon as
    /// it recovers.
    pub async fn check_upstreams(&self) {
        let mut candidate = 0usize;
        let mut elected = false;

        for (i, upstream) in self.upstreams.iter().enumerate() {
            if upstream.check().await && !elected {
                candidate = i;
                elected = true;
            }
        }

        if self.active.load(Ordering::Acquire) != candidate {
            info!("switching to {} upstream", self.upstreams[candidate].name());
            self.active.store(candidate, Ordering::Release);
        }
    }
}

/// Periodic health checker task.
pub async fn start_health_checker(pool: Arc<UpstreamPool>, check_interval: Duration) {
    let mut interval = tokio::time::interval(check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        pool.check_upstreams().await;
    }
}
