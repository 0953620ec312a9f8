//! Exact integer polynomial multiplication.
//!
//! Coefficients are multiplied modulo up to three NTT-friendly 32-bit primes and recombined
//! with Garner's CRT. The caller passes an upper bound on every output coefficient, which
//! decides how many primes are needed. Small inputs take the quadratic loop.

use rayon::prelude::*;

use crate::error::ShapeError;

/// `(modulus, primitive root)`; each modulus admits transforms up to `2^23`.
const MODULI: [(u32, u32); 3] = [(998_244_353, 3), (167_772_161, 3), (469_762_049, 3)];

/// Largest supported transform length.
pub const MAX_TRANSFORM_LEN: usize = 1 << 23;

/// Below this many coefficient products the schoolbook loop wins.
const NAIVE_LIMIT: usize = 1 << 12;

#[inline]
fn mul_mod(a: u32, b: u32, m: u32) -> u32 {
    ((a as u64 * b as u64) % m as u64) as u32
}

#[inline]
fn add_mod(a: u32, b: u32, m: u32) -> u32 {
    let s = a as u64 + b as u64;
    (if s >= m as u64 { s - m as u64 } else { s }) as u32
}

#[inline]
fn sub_mod(a: u32, b: u32, m: u32) -> u32 {
    if a >= b { a - b } else { a + (m - b) }
}

fn pow_mod(mut a: u32, mut e: u64, m: u32) -> u32 {
    let mut r: u32 = 1;
    while e > 0 {
        if e & 1 == 1 {
            r = mul_mod(r, a, m);
        }
        a = mul_mod(a, a, m);
        e >>= 1;
    }
    r
}

#[inline]
fn inv_mod(a: u32, m: u32) -> u32 {
    // m is prime
    pow_mod(a, (m - 2) as u64, m)
}

fn bit_reverse_permute(a: &mut [u32]) {
    let n = a.len();
    let mut j = 0usize;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j ^= bit;
        if i < j {
            a.swap(i, j);
        }
    }
}

fn ntt(a: &mut [u32], invert: bool, modulus: u32, primitive_root: u32) {
    let n = a.len();
    bit_reverse_permute(a);

    let root = pow_mod(primitive_root, ((modulus - 1) / n as u32) as u64, modulus);
    let root = if invert { inv_mod(root, modulus) } else { root };

    let mut len = 2usize;
    while len <= n {
        let wlen = pow_mod(root, (n / len) as u64, modulus);
        let half = len / 2;
        for start in (0..n).step_by(len) {
            let mut w: u32 = 1;
            for j in 0..half {
                let u = a[start + j];
                let v = mul_mod(a[start + j + half], w, modulus);
                a[start + j] = add_mod(u, v, modulus);
                a[start + j + half] = sub_mod(u, v, modulus);
                w = mul_mod(w, wlen, modulus);
            }
        }
        len <<= 1;
    }

    if invert {
        let n_inv = inv_mod(n as u32 % modulus, modulus);
        for x in a.iter_mut() {
            *x = mul_mod(*x, n_inv, modulus);
        }
    }
}

fn convolve_mod(a: &[u64], b: &[u64], out_len: usize, size: usize, modulus: u32, root: u32) -> Vec<u32> {
    let mut fa = vec![0u32; size];
    let mut fb = vec![0u32; size];
    for (dst, &v) in fa.iter_mut().zip(a) {
        *dst = (v % modulus as u64) as u32;
    }
    for (dst, &v) in fb.iter_mut().zip(b) {
        *dst = (v % modulus as u64) as u32;
    }
    ntt(&mut fa, false, modulus, root);
    ntt(&mut fb, false, modulus, root);
    for (x, y) in fa.iter_mut().zip(&fb) {
        *x = mul_mod(*x, *y, modulus);
    }
    ntt(&mut fa, true, modulus, root);
    fa.truncate(out_len);
    fa
}

/// Number of leading moduli whose product exceeds `bound`.
fn moduli_needed(bound: u128) -> usize {
    let mut product: u128 = 1;
    for (i, &(m, _)) in MODULI.iter().enumerate() {
        product *= m as u128;
        if product > bound {
            return i + 1;
        }
    }
    MODULI.len()
}

/// Garner reconstruction of `x` from its residues modulo the leading moduli.
fn crt(residues: &[u32]) -> u128 {
    let m0 = MODULI[0].0 as u64;
    let r0 = residues[0] as u64;
    if residues.len() == 1 {
        return r0 as u128;
    }
    let m1 = MODULI[1].0 as u64;
    let r1 = residues[1] as u64;
    let inv01 = inv_mod((m0 % m1) as u32, m1 as u32) as u64;
    let t1 = ((r1 + m1 - r0 % m1) % m1) * inv01 % m1;
    if residues.len() == 2 {
        return r0 as u128 + m0 as u128 * t1 as u128;
    }
    let m2 = MODULI[2].0 as u64;
    let r2 = residues[2] as u64;
    let m01 = (m0 % m2) * (m1 % m2) % m2;
    let inv012 = inv_mod(m01 as u32, m2 as u32) as u64;
    let partial = (r0 % m2 + (m0 % m2) * t1 % m2) % m2;
    let t2 = ((r2 + m2 - partial) % m2) * inv012 % m2;
    r0 as u128 + m0 as u128 * t1 as u128 + (m0 as u128 * m1 as u128) * t2 as u128
}

/// Exact product of two coefficient vectors.
///
/// `bound` must be at least as large as every output coefficient; it only selects how many
/// primes take part, so an overestimate costs time but never correctness.
pub fn multiply(a: &[u64], b: &[u64], bound: u128) -> Result<Vec<u64>, ShapeError> {
    if a.is_empty() || b.is_empty() {
        return Ok(Vec::new());
    }
    if bound > u64::MAX as u128 {
        return Err(ShapeError::CoefficientOverflow { bound });
    }
    let out_len = a.len() + b.len() - 1;

    if a.len().saturating_mul(b.len()) <= NAIVE_LIMIT {
        let mut out = vec![0u64; out_len];
        for (i, &x) in a.iter().enumerate() {
            if x == 0 {
                continue;
            }
            for (j, &y) in b.iter().enumerate() {
                out[i + j] = out[i + j].wrapping_add(x.wrapping_mul(y));
            }
        }
        return Ok(out);
    }

    let size = out_len.next_power_of_two();
    if size > MAX_TRANSFORM_LEN {
        return Err(ShapeError::TooLarge { len: size, limit: MAX_TRANSFORM_LEN });
    }

    let k = moduli_needed(bound);
    let residues: Vec<Vec<u32>> = MODULI[..k]
        .par_iter()
        .map(|&(modulus, root)| convolve_mod(a, b, out_len, size, modulus, root))
        .collect();

    let out = (0..out_len)
        .into_par_iter()
        .map(|i| {
            let mut r = [0u32; 3];
            for (slot, res) in r.iter_mut().zip(&residues) {
                *slot = res[i];
            }
            crt(&r[..k]) as u64
        })
        .collect();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_xoshiro::{Xoshiro256PlusPlus, rand_core::{RngCore, SeedableRng}};

    fn naive(a: &[u64], b: &[u64]) -> Vec<u64> {
        let mut out = vec![0u64; a.len() + b.len() - 1];
        for (i, &x) in a.iter().enumerate() {
            for (j, &y) in b.iter().enumerate() {
                out[i + j] += x * y;
            }
        }
        out
    }

    fn random_vec(rng: &mut Xoshiro256PlusPlus, len: usize, max: u64) -> Vec<u64> {
        (0..len).map(|_| rng.next_u64() % (max + 1)).collect()
    }

    #[test]
    fn crt_roundtrip() {
        for &x in &[0u128, 1, 998_244_352, 998_244_353, 1 << 40, 1 << 57, (1u128 << 64) - 1] {
            let k = moduli_needed(x);
            let residues: Vec<u32> = MODULI[..k].iter().map(|&(m, _)| (x % m as u128) as u32).collect();
            assert_eq!(crt(&residues), x, "x={x}");
        }
    }

    #[test]
    fn moduli_selection() {
        assert_eq!(moduli_needed(0), 1);
        assert_eq!(moduli_needed(998_244_352), 1);
        assert_eq!(moduli_needed(998_244_353), 2);
        assert_eq!(moduli_needed(1 << 60), 3);
    }

    #[test]
    fn small_inputs_use_schoolbook() {
        assert_eq!(multiply(&[1, 2], &[3, 4, 5], 100).unwrap(), vec![3, 10, 13, 10]);
        assert!(multiply(&[], &[1], 1).unwrap().is_empty());
    }

    #[test]
    fn transform_matches_naive_single_prime() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(5);
        let a = random_vec(&mut rng, 300, 1);
        let b = random_vec(&mut rng, 500, 1);
        assert_eq!(multiply(&a, &b, 300).unwrap(), naive(&a, &b));
    }

    #[test]
    fn transform_matches_naive_all_primes() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(6);
        let a = random_vec(&mut rng, 700, 1 << 40);
        let b = random_vec(&mut rng, 400, 1);
        let expected = naive(&a, &b);
        let bound = a.iter().map(|&x| x as u128).sum::<u128>();
        assert_eq!(moduli_needed(bound), 2);
        assert_eq!(multiply(&a, &b, bound).unwrap(), expected);
        // A loose bound pulls in the third prime without changing the result.
        assert_eq!(multiply(&a, &b, u64::MAX as u128).unwrap(), expected);
    }

    #[test]
    fn rejects_unbounded_coefficients() {
        let err = multiply(&[1], &[1], 1u128 << 64).unwrap_err();
        assert_eq!(err, ShapeError::CoefficientOverflow { bound: 1u128 << 64 });
    }
}
