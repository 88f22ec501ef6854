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

use mvspool_lib::proxy::validator::{PowOutput, PowVerifier};
use num_bigint::BigUint;
use sha2::{Digest, Sha256};

/// Double-SHA256 stand-in for the chain's sealing hash, used on development
/// deployments. Production builds plug the chain's Ethash-family verifier in
/// through the same trait.
pub struct Sha256dPow;

impl PowVerifier for Sha256dPow {
    fn verify(&self, header: &str, seed: &str, nonce: u64) -> Option<PowOutput> {
        let mut input = hex::decode(header.trim_start_matches("0x")).ok()?;
        input.extend_from_slice(&hex::decode(seed.trim_start_matches("0x")).ok()?);
        input.extend_from_slice(&nonce.to_le_bytes());

        let mix: [u8; 32] = Sha256::digest(&input).into();
        let result: [u8; 32] = Sha256::digest(mix).into();
        Some(PowOutput {
            mix_digest: format!("0x{}", hex::encode(mix)),
            result: BigUint::from_bytes_be(&result),
        })
    }
}
