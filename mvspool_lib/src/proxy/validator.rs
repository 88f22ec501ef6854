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

use crate::work::RecentHeaders;
use num_bigint::BigUint;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Result of the chain's sealing-hash function for one `(header, nonce)`
/// pair.
#[derive(Debug, Clone)]
pub struct PowOutput {
    /// Hex mix digest the miner must have echoed back.
    pub mix_digest: String,
    /// 256-bit PoW result compared against share and block targets.
    pub result: BigUint,
}

/// The chain's proof-of-work function. Ethash-family; supplied by the
/// embedder, pure from the validator's point of view.
#[cfg_attr(test, mockall::automock)]
pub trait PowVerifier: Send + Sync {
    /// `None` means the nonce does not produce a well-formed solution at all.
    fn verify(&self, header: &str, seed: &str, nonce: u64) -> Option<PowOutput>;
}

/// How a submitted share was judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareStatus {
    /// Header no longer in the recent window.
    Stale,
    /// Same (job, nonce, login) already accepted this round.
    Duplicate,
    /// PoW failed, mix mismatch, or above the tier target.
    Invalid,
    /// Counts toward the round.
    Valid { height: u64 },
    /// Also beats the network target: submit upstream.
    BlockSolution { height: u64 },
}

/// Stateless-per-share judge over shared windows: the recent-headers map fed
/// by the refresher and the per-round duplicate set.
pub struct ShareValidator {
    recent_headers: Arc<RecentHeaders>,
    pow: Arc<dyn PowVerifier>,
    /// (pow_hash, nonce, login) -> issue height, pruned alongside the header
    /// window.
    submitted: Mutex<HashMap<(String, String, String), u64>>,
}

impl ShareValidator {
    pub fn new(recent_headers: Arc<RecentHeaders>, pow: Arc<dyn PowVerifier>) -> Self {
        Self {
            recent_headers,
            pow,
            submitted: Mutex::new(HashMap::new()),
        }
    }

    /// Judges one submission against the tier and block targets.
    ///
    /// `params` are the miner's `[nonce, pow_hash, mix_digest]`. Accepted
    /// shares are remembered for duplicate detection until their header
    /// leaves the recent window.
    pub fn judge(
        &self,
        login: &str,
        params: &[String],
        seed: &str,
        tier_target: &BigUint,
        block_target: &BigUint,
    ) -> ShareStatus {
        let (nonce_hex, pow_hash, mix_digest) = (&params[0], &params[1], &params[2]);

        let height = match self.recent_headers.lookup(pow_hash) {
            Some(height) => height,
            None => return ShareStatus::Stale,
        };

        let nonce = match u64::from_str_radix(nonce_hex.trim_start_matches("0x"), 16) {
            Ok(nonce) => nonce,
            Err(_) => return ShareStatus::Invalid,
        };

        let key = (pow_hash.clone(), nonce_hex.clone(), login.to_string());
        {
            let submitted = self.submitted.lock().unwrap();
            if submitted.contains_key(&key) {
                return ShareStatus::Duplicate;
            }
        }

        let output = match self.pow.verify(pow_hash, seed, nonce) {
            Some(output) => output,
            None => return ShareStatus::Invalid,
        };
        if !output.mix_digest.eq_ignore_ascii_case(mix_digest) {
            return ShareStatus::Invalid;
        }
        if output.result > *tier_target {
            return ShareStatus::Invalid;
        }

        {
            let mut submitted = self.submitted.lock().unwrap();
            submitted.insert(key, height);
            submitted.retain(|_, h| *h + 2 >= height);
        }

        if output.result <= *block_target {
            ShareStatus::BlockSolution { height }
        } else {
            ShareStatus::Valid { height }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::One;

    fn params(nonce: &str) -> Vec<String> {
        vec![
            nonce.to_string(),
            "0xheader".to_string(),
            "0xmix".to_string(),
        ]
    }

    fn verifier_returning(result: u64) -> Arc<dyn PowVerifier> {
        let mut pow = MockPowVerifier::new();
        pow.expect_verify().returning(move |_, _, _| {
            Some(PowOutput {
                mix_digest: "0xmix".to_string(),
                result: BigUint::from(result),
            })
        });
        Arc::new(pow)
    }

    fn validator_with(pow: Arc<dyn PowVerifier>) -> ShareValidator {
        let headers = Arc::new(RecentHeaders::default());
        headers.register("0xheader", 100);
        ShareValidator::new(headers, pow)
    }

    #[test]
    fn test_stale_header_rejected() {
        let validator = validator_with(verifier_returning(1));
        let mut stale = params("0x1");
        stale[1] = "0xunknown".to_string();
        let status = validator.judge(
            "miner-a",
            &stale,
            "0xseed",
            &BigUint::from(u64::MAX),
            &BigUint::one(),
        );
        assert_eq!(status, ShareStatus::Stale);
    }

    #[test]
    fn test_share_below_tier_target_is_valid() {
        let validator = validator_with(verifier_returning(500));
        let status = validator.judge(
            "miner-a",
            &params("0x1"),
            "0xseed",
            &BigUint::from(1000u64),
            &BigUint::from(10u64),
        );
        assert_eq!(status, ShareStatus::Valid { height: 100 });
    }

    #[test]
    fn test_share_below_block_target_is_block_solution() {
        let validator = validator_with(verifier_returning(5));
        let status = validator.judge(
            "miner-a",
            &params("0x1"),
            "0xseed",
            &BigUint::from(1000u64),
            &BigUint::from(10u64),
        );
        assert_eq!(status, ShareStatus::BlockSolution { height: 100 });
    }

    #[test]
    fn test_share_above_tier_target_is_invalid() {
        let validator = validator_with(verifier_returning(5000));
        let status = validator.judge(
            "miner-a",
            &params("0x1"),
            "0xseed",
            &BigUint::from(1000u64),
            &BigUint::from(10u64),
        );
        assert_eq!(status, ShareStatus::Invalid);
    }

    #[test]
    fn test_duplicate_rejected_but_other_login_accepted() {
        let validator = validator_with(verifier_returning(500));
        let tier = BigUint::from(1000u64);
        let block = BigUint::from(10u64);

        let first = validator.judge("miner-a", &params("0x1"), "0xseed", &tier, &block);
        assert_eq!(first, ShareStatus::Valid { height: 100 });

        let dup = validator.judge("miner-a", &params("0x1"), "0xseed", &tier, &block);
        assert_eq!(dup, ShareStatus::Duplicate);

        // Same nonce from a different login is its own tuple.
        let other = validator.judge("miner-b", &params("0x1"), "0xseed", &tier, &block);
        assert_eq!(other, ShareStatus::Valid { height: 100 });

        // Different nonce from the first login is fine too.
        let next = validator.judge("miner-a", &params("0x2"), "0xseed", &tier, &block);
        assert_eq!(next, ShareStatus::Valid { height: 100 });
    }

    #[test]
    fn test_mix_digest_mismatch_rejected() {
        let validator = validator_with(verifier_returning(1));
        let mut bad = params("0x1");
        bad[2] = "0xwrong".to_string();
        let status = validator.judge(
            "miner-a",
            &bad,
            "0xseed",
            &BigUint::from(1000u64),
            &BigUint::from(10u64),
        );
        assert_eq!(status, ShareStatus::Invalid);
    }

    #[test]
    fn test_malformed_nonce_rejected() {
        let validator = validator_with(verifier_returning(1));
        let status = validator.judge(
            "miner-a",
            &params("0xzz"),
            "0xseed",
            &BigUint::from(1000u64),
            &BigUint::from(10u64),
        );
        assert_eq!(status, ShareStatus::Invalid);
    }

    #[test]
    fn test_failed_pow_rejected() {
        let mut pow = MockPowVerifier::new();
        pow.expect_verify().returning(|_, _, _| None);
        let validator = validator_with(Arc::new(pow));
        let status = validator.judge(
            "miner-a",
            &params("0x1"),
            "0xseed",
            &BigUint::from(1000u64),
            &BigUint::from(10u64),
        );
        assert_eq!(status, ShareStatus::Invalid);
    }
}
