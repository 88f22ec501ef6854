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

use tracing::debug;

/// Banning/abuse policy contract. The pool core only reports events and asks
/// questions; scoring and ban storage live behind this trait.
#[cfg_attr(test, mockall::automock)]
pub trait Policy: Send + Sync {
    fn is_banned(&self, ip: &str) -> bool;
    /// Charges the address for a malformed request (bad JSON, missing id,
    /// oversize body).
    fn apply_malformed_policy(&self, ip: &str);
    /// Returns false when the login must be refused for this address.
    fn apply_login_policy(&self, login: &str, ip: &str) -> bool;
}

/// Policy that admits everyone. Used by the development binary and tests.
#[derive(Debug, Default)]
pub struct AllowAllPolicy;

impl Policy for AllowAllPolicy {
    fn is_banned(&self, _ip: &str) -> bool {
        false
    }

    fn apply_malformed_policy(&self, ip: &str) {
        debug!("malformed request from {}", ip);
    }

    fn apply_login_policy(&self, _login: &str, _ip: &str) -> bool {
        true
    }
}
