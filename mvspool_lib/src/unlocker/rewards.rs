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

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{FromPrimitive, ToPrimitive, Zero};
use std::collections::HashMap;

/// Donate 10% from pool fees to developers
pub const DONATION_FEE: f64 = 10.0;
pub const DONATION_ACCOUNT: &str = "0xb85150eb365e7df0941f0cf08235f987ba91506a";

/// Base block subsidy in satoshi: 300 ETP decayed by 5% every 500 000
/// blocks. The height is divided down first, so the subsidy is constant
/// within each step.
pub fn const_reward(height: u64) -> BigInt {
    let steps = (height / 500_000) as f64;
    BigInt::from((300_000_000f64 * 0.95f64.powf(steps)) as i64)
}

/// Splits `value` into `(value - fee, fee)` for a percent fee.
///
/// The percent is lifted into an exact rational before any multiplication,
/// so the two parts always sum back to `value` exactly.
pub fn charge_fee(value: &BigRational, fee_percent: f64) -> (BigRational, BigRational) {
    let percent = BigRational::from_f64(fee_percent).unwrap_or_else(BigRational::zero)
        / BigRational::from_integer(BigInt::from(100));
    let fee_value = value * percent;
    (value - &fee_value, fee_value)
}

/// Satoshi truncation toward zero. The credited sum may fall short of the
/// revenue; the remainder stays with the pool implicitly.
pub fn truncate_satoshi(value: &BigRational) -> i64 {
    value.to_integer().to_i64().unwrap_or(0)
}

/// Splits `reward` across logins proportionally to their share counts,
/// truncating each credit.
pub fn rewards_for_shares(
    shares: &HashMap<String, i64>,
    total: i64,
    reward: &BigRational,
) -> HashMap<String, i64> {
    let mut rewards = HashMap::new();
    let total = BigRational::from_integer(BigInt::from(total));
    for (login, n) in shares {
        let percent = BigRational::from_integer(BigInt::from(*n)) / &total;
        let worker_reward = reward * percent;
        *rewards.entry(login.clone()).or_insert(0) += truncate_satoshi(&worker_reward);
    }
    rewards
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rational(n: i64) -> BigRational {
        BigRational::from_integer(BigInt::from(n))
    }

    #[test]
    fn test_const_reward_genesis() {
        assert_eq!(const_reward(0), BigInt::from(300_000_000i64));
    }

    #[test]
    fn test_const_reward_decay_steps() {
        assert_eq!(const_reward(500_000), BigInt::from(285_000_000i64));
        assert_eq!(const_reward(1_000_000), BigInt::from(270_750_000i64));
    }

    #[test]
    fn test_const_reward_constant_within_step() {
        assert_eq!(const_reward(1), const_reward(499_999));
        assert_eq!(const_reward(500_000), const_reward(999_999));
    }

    #[test]
    fn test_const_reward_monotone_non_increasing() {
        let mut previous = const_reward(0);
        for step in 1..40u64 {
            let current = const_reward(step * 500_000);
            assert!(current < previous, "subsidy must drop at step {step}");
            previous = current;
        }
    }

    #[test]
    fn test_charge_fee_partitions_exactly() {
        for fee in [0.0, 1.0, 2.5, 10.0, 33.3] {
            let value = rational(1_000_000_000);
            let (kept, charged) = charge_fee(&value, fee);
            assert_eq!(&kept + &charged, value, "fee {fee} must partition");
        }
    }

    #[test]
    fn test_charge_fee_one_percent() {
        let value = rational(1_000_000_000);
        let (kept, charged) = charge_fee(&value, 1.0);
        assert_eq!(kept, rational(990_000_000));
        assert_eq!(charged, rational(10_000_000));
    }

    #[test]
    fn test_rewards_for_shares_proportional_split() {
        let mut shares = HashMap::new();
        shares.insert("a".to_string(), 3i64);
        shares.insert("b".to_string(), 1i64);

        let rewards = rewards_for_shares(&shares, 4, &rational(990_000_000));
        assert_eq!(rewards["a"], 742_500_000);
        assert_eq!(rewards["b"], 247_500_000);
    }

    #[test]
    fn test_rewards_truncate_toward_zero() {
        let mut shares = HashMap::new();
        shares.insert("a".to_string(), 1i64);
        shares.insert("b".to_string(), 1i64);
        shares.insert("c".to_string(), 1i64);

        // 100 / 3 = 33.33..., each credit truncates to 33.
        let rewards = rewards_for_shares(&shares, 3, &rational(100));
        let credited: i64 = rewards.values().sum();
        assert_eq!(rewards["a"], 33);
        assert_eq!(credited, 99);
    }

    #[test]
    fn test_truncate_satoshi() {
        let value = BigRational::new(BigInt::from(7), BigInt::from(2));
        assert_eq!(truncate_satoshi(&value), 3);
        assert_eq!(truncate_satoshi(&rational(0)), 0);
    }
}
