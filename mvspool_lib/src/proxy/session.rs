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

use rand::Rng;

/// Per-connection miner state. Owned by the connection's task; all socket
/// writes happen on that task, which keeps sends serialized without a lock.
pub struct Session {
    /// Random connection id, used in logs.
    pub id: String,
    pub ip: String,
    /// Index into the configured difficulty tiers. Fixed for the session
    /// lifetime.
    pub tier: usize,
    /// Payout address; set from the URL on HTTP, by eth_submitLogin on
    /// stratum.
    pub login: Option<String>,
    pub worker: String,
    /// Header hash of the last job sent, to skip redundant pushes.
    pub last_header: Option<String>,
}

impl Session {
    pub fn new(ip: String, tier: usize) -> Self {
        let id: u32 = rand::thread_rng().gen();
        Self {
            id: format!("{id:08x}"),
            ip,
            tier,
            login: None,
            worker: String::new(),
            last_header: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session() {
        let session = Session::new("10.0.0.1".to_string(), 2);
        assert_eq!(session.id.len(), 8);
        assert_eq!(session.ip, "10.0.0.1");
        assert_eq!(session.tier, 2);
        assert!(session.login.is_none());
        assert!(session.last_header.is_none());
    }
}
