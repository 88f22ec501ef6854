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

use num_bigint::BigUint;
use num_traits::{One, Zero};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Mainnet payout addresses: `M` followed by 33 base58 characters.
fn address_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^M[1-9A-HJ-NP-Za-km-z]{33}$").unwrap())
}

fn zero_hash_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^0?x?0+$").unwrap())
}

fn pow256() -> BigUint {
    BigUint::one() << 256
}

fn sha256d(input: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(input);
    let second = Sha256::digest(first);
    second.into()
}

/// Validates a base58check MVS address: format `M` + 33 base58 chars, with
/// the trailing four decoded bytes equal to the double-SHA256 checksum of the
/// preceding payload.
pub fn is_valid_mvs_address(s: &str) -> bool {
    if !address_pattern().is_match(s) {
        return false;
    }
    let decoded = match bs58::decode(s).into_vec() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    if decoded.len() <= 4 {
        return false;
    }
    let (payload, checksum) = decoded.split_at(decoded.len() - 4);
    sha256d(payload)[..4] == *checksum
}

/// Hex-encoded share target for a difficulty: `2^256 / difficulty`.
pub fn get_target_hex(diff: u64) -> String {
    let target = pow256() / BigUint::from(diff.max(1));
    format!("0x{}", hex::encode(target.to_bytes_be()))
}

/// Inverse of [`get_target_hex`]: recovers the difficulty from a target.
pub fn target_hex_to_diff(target_hex: &str) -> BigUint {
    let stripped = target_hex.trim_start_matches("0x");
    let bytes = match hex::decode(stripped) {
        Ok(bytes) => bytes,
        Err(_) => return BigUint::zero(),
    };
    let target = BigUint::from_bytes_be(&bytes);
    if target.is_zero() {
        return BigUint::zero();
    }
    pow256() / target
}

pub fn is_zero_hash(s: &str) -> bool {
    zero_hash_pattern().is_match(s)
}

/// Millisecond unix timestamp.
pub fn make_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Height formatting used on the miner-facing wire.
pub fn to_hex(n: u64) -> String {
    format!("0x0{n:x}")
}
