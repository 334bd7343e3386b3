//! Compact difficulty targets and the retarget arithmetic.
//!
//! A header's `bits` field encodes a 256-bit target as a base-256 float:
//! the top byte is the length in bytes, the low 23 bits the mantissa, bit 23
//! the sign (never valid for a target). A header satisfies its own target when
//! its hash, read as a little-endian 256-bit integer, does not exceed it.
//!
//! Tree-dependent parts of the rule (walking back a retarget window, the
//! testnet minimum-difficulty exception) live with the block index; this
//! module only does the arithmetic.

use primitive_types::{U256, U512};

use crate::error::CompactError;
use crate::params::ConsensusParams;
use crate::types::Hash256;

/// Decode compact `bits` into a 256-bit target.
pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;

    if bits & 0x0080_0000 != 0 && word != 0 {
        return Err(CompactError::Negative);
    }

    let value = if word == 0 {
        U256::zero()
    } else if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        if word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32)) {
            return Err(CompactError::Overflow);
        }
        U256::from(word) << (8 * (size - 3))
    };
    Ok(value)
}

/// Encode a 256-bit target in compact form, rounding towards zero.
pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };

    // The mantissa is signed; move a set top bit into the exponent.
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    (size << 24) | (compact & 0x007f_ffff)
}

/// Whether `hash` meets the target encoded in `bits`, which itself must be a
/// valid, positive target no easier than `pow_limit`.
pub fn check_proof_of_work(hash: &Hash256, bits: u32, pow_limit: &U256) -> bool {
    let target = match compact_to_u256(bits) {
        Ok(t) if !t.is_zero() && t <= *pow_limit => t,
        _ => return false,
    };
    U256::from_little_endian(hash.as_bytes()) <= target
}

/// Expected number of hashes to meet `bits`: `2^256 / (target + 1)`.
///
/// Invalid or zero targets contribute no work.
pub fn block_proof(bits: u32) -> U256 {
    match compact_to_u256(bits) {
        Ok(target) if !target.is_zero() => (!target / (target + U256::one())) + U256::one(),
        _ => U256::zero(),
    }
}

/// Difficulty relative to the minimum target `0x1d00ffff`, for reporting.
pub fn difficulty(bits: u32) -> f64 {
    let mantissa = bits & 0x00ff_ffff;
    if mantissa == 0 {
        return 0.0;
    }
    let mut shift = (bits >> 24) & 0xff;
    let mut diff = f64::from(0x0000_ffff_u32) / f64::from(mantissa);
    while shift < 29 {
        diff *= 256.0;
        shift += 1;
    }
    while shift > 29 {
        diff /= 256.0;
        shift -= 1;
    }
    diff
}

/// New compact target at a retarget boundary.
///
/// `actual_timespan` is the time the last window took. It is clamped to
/// `[timespan / 4, timespan * 4]`, the previous target is scaled by
/// `actual / timespan`, and the result is capped at the pow limit.
pub fn retarget(prev_bits: u32, actual_timespan: i64, params: &ConsensusParams) -> u32 {
    let timespan = params.target_timespan as i64;
    let factor = crate::constants::MAX_ADJUSTMENT_FACTOR as i64;
    let clamped = actual_timespan.clamp(timespan / factor, timespan * factor) as u64;

    let prev = compact_to_u256(prev_bits).unwrap_or(params.pow_limit);
    let scaled = prev.full_mul(U256::from(clamped)) / U512::from(params.target_timespan);
    let next = match U256::try_from(scaled) {
        Ok(v) if v <= params.pow_limit => v,
        _ => params.pow_limit,
    };
    u256_to_compact(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn compact_round_trip_mainnet_limit() {
        let target = compact_to_u256(0x1d00ffff).unwrap();
        assert_eq!(target, U256::from(0xffffu64) << 208u32);
        assert_eq!(u256_to_compact(target), 0x1d00ffff);
    }

    #[test]
    fn compact_small_sizes() {
        assert_eq!(compact_to_u256(0x01003456).unwrap(), U256::zero());
        assert_eq!(compact_to_u256(0x02123456).unwrap(), U256::from(0x1234u64));
        assert_eq!(compact_to_u256(0x03123456).unwrap(), U256::from(0x123456u64));
        assert_eq!(compact_to_u256(0x04123456).unwrap(), U256::from(0x12345600u64));
    }

    #[test]
    fn compact_negative_rejected() {
        assert_eq!(compact_to_u256(0x04923456), Err(CompactError::Negative));
    }

    #[test]
    fn compact_overflow_rejected() {
        assert_eq!(compact_to_u256(0xff123456), Err(CompactError::Overflow));
    }

    #[test]
    fn compact_encoding_moves_sign_bit_into_exponent() {
        assert_eq!(u256_to_compact(U256::from(0x80u64)), 0x02008000);
    }

    #[test]
    fn pow_check_against_limit() {
        let limit = ConsensusParams::regtest().pow_limit;
        assert!(check_proof_of_work(&Hash256::ZERO, 0x207fffff, &limit));
        assert!(!check_proof_of_work(&Hash256([0xff; 32]), 0x207fffff, &limit));
        // Target easier than the limit is refused even for a zero hash.
        let mainnet = ConsensusParams::mainnet().pow_limit;
        assert!(!check_proof_of_work(&Hash256::ZERO, 0x207fffff, &mainnet));
    }

    #[test]
    fn block_proof_grows_with_difficulty() {
        assert!(block_proof(0x1c00ffff) > block_proof(0x1d00ffff));
        assert_eq!(block_proof(0), U256::zero());
        // 2^256 / 2^224 = 2^32, give or take the +1 terms.
        let p = block_proof(0x1d00ffff);
        assert!(p > U256::from(0xffff_ffffu64) && p < U256::from(0x1_0001_0002u64));
    }

    #[test]
    fn difficulty_of_limit_is_one() {
        assert!((difficulty(0x1d00ffff) - 1.0).abs() < f64::EPSILON);
        assert!(difficulty(0x1b0404cb) > 16_000.0);
    }

    #[test]
    fn retarget_on_schedule_is_stable() {
        let params = ConsensusParams::mainnet();
        let bits = 0x1b0404cb;
        assert_eq!(retarget(bits, params.target_timespan as i64, &params), bits);
    }

    #[test]
    fn retarget_caps_at_pow_limit() {
        let params = ConsensusParams::mainnet();
        let slow = params.target_timespan as i64 * 10;
        assert_eq!(retarget(0x1d00ffff, slow, &params), 0x1d00ffff);
    }

    #[test]
    fn retarget_clamps_fast_window_to_quarter() {
        let params = ConsensusParams::mainnet();
        let quarter = retarget(0x1c00ffff, params.target_timespan as i64 / 4, &params);
        let instant = retarget(0x1c00ffff, 1, &params);
        assert_eq!(quarter, instant);
        assert_eq!(quarter, 0x1b3fffc0);
    }

    proptest! {
        #[test]
        fn retarget_stays_within_factor_four(actual in 1i64..20_000_000) {
            let params = ConsensusParams::mainnet();
            let prev_bits = 0x1b0404cb;
            let prev = compact_to_u256(prev_bits).unwrap();
            let next = compact_to_u256(retarget(prev_bits, actual, &params)).unwrap();
            prop_assert!(next <= prev * U256::from(4u64));
            let floor = compact_to_u256(u256_to_compact(prev / U256::from(4u64))).unwrap();
            prop_assert!(next >= floor);
        }
    }
}
