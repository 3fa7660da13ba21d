//! # 2-of-3 Secret Sharing
//!
//! Shamir's scheme over GF(2^8) (AES field, `x^8 + x^4 + x^3 + x + 1`),
//! fixed at threshold 2 and three shares. Each role evaluates the random
//! polynomial at its own [`ShardRole::share_index`], so any two roles
//! interpolate the seed at `x = 0` and can also re-derive the third role's
//! share at its `x`.
//!
//! Only the in-process collaborator and the recovery orchestrator's local
//! re-derivation touch this module. Nothing here allocates outside a
//! `Zeroizing` buffer or a [`ShardSecret`].

use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

use super::{ShardRole, ShardSecret};
use crate::config::{SHARD_COUNT, SHARD_THRESHOLD};

#[derive(Debug, Error)]
pub enum SharingError {
    #[error("secret must not be empty")]
    EmptySecret,

    #[error("need {needed} distinct shards, got {got}")]
    NotEnoughShards { needed: usize, got: usize },

    #[error("duplicate shard role: {0}")]
    DuplicateRole(ShardRole),

    #[error("share lengths differ: expected {expected}, got {got}")]
    InconsistentLengths { expected: usize, got: usize },
}

mod gf256 {
    const MODULUS: u16 = 0x11B;

    const fn build_exp_table() -> [u8; 512] {
        let mut table = [0u8; 512];
        let mut val: u16 = 1;
        let mut i = 0;
        while i < 255 {
            table[i] = val as u8;
            table[i + 255] = val as u8;
            // generator 3: val * 2 + val
            val = (val << 1) ^ val;
            if val >= 256 {
                val ^= MODULUS;
            }
            i += 1;
        }
        table[510] = table[0];
        table[511] = table[1];
        table
    }

    const fn build_log_table() -> [u8; 256] {
        let exp = build_exp_table();
        let mut table = [0u8; 256];
        let mut i = 0;
        while i < 255 {
            table[exp[i] as usize] = i as u8;
            i += 1;
        }
        table
    }

    static EXP: [u8; 512] = build_exp_table();
    static LOG: [u8; 256] = build_log_table();

    #[inline]
    pub fn mul(a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }
        EXP[LOG[a as usize] as usize + LOG[b as usize] as usize]
    }

    /// `b` must be non-zero; callers only divide by differences of distinct
    /// share indices.
    #[inline]
    pub fn div(a: u8, b: u8) -> u8 {
        debug_assert!(b != 0, "division by zero in GF(256)");
        if a == 0 || b == 0 {
            return 0;
        }
        EXP[255 + LOG[a as usize] as usize - LOG[b as usize] as usize]
    }

    /// Horner evaluation; `coefficients[0]` is the constant term.
    pub fn eval_polynomial(coefficients: &[u8], x: u8) -> u8 {
        coefficients
            .iter()
            .rev()
            .fold(0u8, |acc, &coeff| mul(acc, x) ^ coeff)
    }

    /// Lagrange interpolation of the points `(xs[i], ys[i])` at `at`.
    ///
    /// Subtraction is XOR in characteristic 2, so `at - x_j` is `at ^ x_j`.
    pub fn interpolate_at(xs: &[u8], ys: &[u8], at: u8) -> u8 {
        let mut value = 0u8;
        for i in 0..xs.len() {
            let mut numerator = 1u8;
            let mut denominator = 1u8;
            for j in 0..xs.len() {
                if i == j {
                    continue;
                }
                numerator = mul(numerator, at ^ xs[j]);
                denominator = mul(denominator, xs[i] ^ xs[j]);
            }
            value ^= mul(ys[i], div(numerator, denominator));
        }
        value
    }

}

/// Split a seed into the three role shares.
pub fn split_seed(seed: &[u8]) -> Result<Vec<ShardSecret>, SharingError> {
    if seed.is_empty() {
        return Err(SharingError::EmptySecret);
    }

    let mut shares: Vec<Zeroizing<Vec<u8>>> = (0..SHARD_COUNT)
        .map(|_| Zeroizing::new(Vec::with_capacity(seed.len())))
        .collect();

    let mut rng = rand::rngs::OsRng;
    let mut coefficients = Zeroizing::new(vec![0u8; SHARD_THRESHOLD as usize]);

    for &secret_byte in seed {
        coefficients[0] = secret_byte;
        rng.fill_bytes(&mut coefficients[1..]);
        for (share, role) in shares.iter_mut().zip(ShardRole::ALL) {
            share.push(gf256::eval_polynomial(&coefficients, role.share_index()));
        }
    }

    Ok(shares
        .into_iter()
        .zip(ShardRole::ALL)
        .map(|(mut data, role)| ShardSecret::new(role, std::mem::take(&mut *data)))
        .collect())
}

fn check_shards(shards: &[&ShardSecret]) -> Result<usize, SharingError> {
    let needed = SHARD_THRESHOLD as usize;
    if shards.len() < needed {
        return Err(SharingError::NotEnoughShards {
            needed,
            got: shards.len(),
        });
    }
    let expected = shards[0].len();
    for (i, shard) in shards.iter().enumerate() {
        if shards[..i].iter().any(|s| s.role() == shard.role()) {
            return Err(SharingError::DuplicateRole(shard.role()));
        }
        if shard.len() != expected {
            return Err(SharingError::InconsistentLengths {
                expected,
                got: shard.len(),
            });
        }
    }
    if expected == 0 {
        return Err(SharingError::EmptySecret);
    }
    Ok(expected)
}

fn interpolate(shards: &[&ShardSecret], at: u8) -> Result<Zeroizing<Vec<u8>>, SharingError> {
    let length = check_shards(shards)?;
    let xs: Vec<u8> = shards.iter().map(|s| s.role().share_index()).collect();
    let mut ys = Zeroizing::new(vec![0u8; shards.len()]);
    let mut out = Zeroizing::new(Vec::with_capacity(length));
    for byte in 0..length {
        for (y, shard) in ys.iter_mut().zip(shards) {
            *y = shard.expose()[byte];
        }
        out.push(gf256::interpolate_at(&xs, &ys, at));
    }
    Ok(out)
}

/// Reconstruct the seed from two or more distinct shards.
pub fn combine_shards(shards: &[&ShardSecret]) -> Result<Zeroizing<Vec<u8>>, SharingError> {
    interpolate(shards, 0)
}

/// Re-derive the share for `role` from two or more other shards.
///
/// Used when recovery rebuilds the Device shard without materializing the
/// seed.
pub fn derive_share(shards: &[&ShardSecret], role: ShardRole) -> Result<ShardSecret, SharingError> {
    let mut data = interpolate(shards, role.share_index())?;
    Ok(ShardSecret::new(role, std::mem::take(&mut *data)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: [u8; 32] = *b"an ed25519 seed of 32 bytes long";

    fn pick<'a>(shards: &'a [ShardSecret], roles: &[ShardRole]) -> Vec<&'a ShardSecret> {
        roles
            .iter()
            .map(|r| shards.iter().find(|s| s.role() == *r).unwrap())
            .collect()
    }

    #[test]
    fn test_split_assigns_roles() {
        let shards = split_seed(&SEED).unwrap();
        assert_eq!(shards.len(), 3);
        for (shard, role) in shards.iter().zip(ShardRole::ALL) {
            assert_eq!(shard.role(), role);
            assert_eq!(shard.len(), SEED.len());
        }
    }

    #[test]
    fn test_every_pair_recovers_seed() {
        let shards = split_seed(&SEED).unwrap();
        let pairs = [
            [ShardRole::Device, ShardRole::ServerAssisted],
            [ShardRole::Device, ShardRole::BackupOwner],
            [ShardRole::ServerAssisted, ShardRole::BackupOwner],
        ];
        for pair in pairs {
            let recovered = combine_shards(&pick(&shards, &pair)).unwrap();
            assert_eq!(recovered.as_slice(), &SEED, "pair {:?}", pair);
        }
    }

    #[test]
    fn test_all_three_recover_seed() {
        let shards = split_seed(&SEED).unwrap();
        let recovered = combine_shards(&pick(&shards, &ShardRole::ALL)).unwrap();
        assert_eq!(recovered.as_slice(), &SEED);
    }

    #[test]
    fn test_single_shard_rejected() {
        let shards = split_seed(&SEED).unwrap();
        assert!(matches!(
            combine_shards(&pick(&shards, &[ShardRole::Device])),
            Err(SharingError::NotEnoughShards { needed: 2, got: 1 })
        ));
    }

    #[test]
    fn test_duplicate_role_rejected() {
        let shards = split_seed(&SEED).unwrap();
        let twice = pick(&shards, &[ShardRole::BackupOwner, ShardRole::BackupOwner]);
        assert!(matches!(
            combine_shards(&twice),
            Err(SharingError::DuplicateRole(ShardRole::BackupOwner))
        ));
    }

    #[test]
    fn test_derive_missing_share() {
        let shards = split_seed(&SEED).unwrap();
        let rebuilt = derive_share(
            &pick(&shards, &[ShardRole::ServerAssisted, ShardRole::BackupOwner]),
            ShardRole::Device,
        )
        .unwrap();
        assert_eq!(rebuilt.role(), ShardRole::Device);
        assert_eq!(rebuilt.expose(), shards[0].expose());
    }

    #[test]
    fn test_splits_are_randomized() {
        let a = split_seed(&SEED).unwrap();
        let b = split_seed(&SEED).unwrap();
        assert_ne!(a[0].expose(), b[0].expose());
    }

    #[test]
    fn test_empty_seed_rejected() {
        assert!(matches!(split_seed(&[]), Err(SharingError::EmptySecret)));
    }
}
