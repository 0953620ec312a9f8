//! Polynomials over GF(2) and the extension fields GF(2^m) they define.
//!
//! A polynomial is stored as a bit pattern: bit `i` is the coefficient of `x^i`.
//! Polynomials of degree up to 63 live in a `u64`; unreduced products need a `u128`.

use std::collections::HashMap;
use std::ops::{Add, Mul};

use bitvec::prelude::*;

use crate::error::FieldError;
use crate::util::low_mask;

/// Largest supported field degree `m`; the modulus needs `m + 1` bits.
pub const MAX_DEGREE: u32 = 63;

/// The polynomial `x`.
const X: u64 = 0b10;

/// Degree of `p`, or -1 for the zero polynomial.
#[inline]
pub fn degree(p: u128) -> i32 {
    127 - p.leading_zeros() as i32
}

/// Schoolbook shift-and-XOR product, no reduction.
pub fn multiply(a: u64, b: u64) -> u128 {
    let mut result = 0u128;
    let mut a = a as u128;
    let mut b = b;
    while b != 0 {
        if b & 1 == 1 {
            result ^= a;
        }
        a <<= 1;
        b >>= 1;
    }
    result
}

/// `poly mod modulus`.
///
/// # Panics
///
/// If `modulus` is the zero polynomial.
pub fn reduce(poly: u128, modulus: u64) -> u64 {
    assert!(modulus != 0, "reduction modulo the zero polynomial");
    let dm = degree(modulus as u128);
    let wide = modulus as u128;
    let mut p = poly;
    let mut dp = degree(p);
    while dp >= dm {
        p ^= wide << (dp - dm);
        dp = degree(p);
    }
    p as u64
}

/// Euclid's algorithm with `reduce` as the division step.
pub fn gcd(a: u64, b: u64) -> u64 {
    let (mut a, mut b) = (a, b);
    while b != 0 {
        let r = reduce(a as u128, b);
        a = b;
        b = r;
    }
    a
}

/// `base^exponent mod modulus` by square-and-multiply.
///
/// # Panics
///
/// If `modulus` is the zero polynomial, as in [`reduce`].
pub fn pow_mod(base: u64, exponent: u64, modulus: u64) -> u64 {
    let mut result = reduce(1, modulus);
    let mut base = reduce(base as u128, modulus);
    let mut e = exponent;
    while e > 0 {
        if e & 1 == 1 {
            result = reduce(multiply(result, base), modulus);
        }
        base = reduce(multiply(base, base), modulus);
        e >>= 1;
    }
    result
}

fn proper_divisors(m: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let mut d = 2;
    while d * d <= m {
        if m % d == 0 {
            out.push(d);
            if d != m / d {
                out.push(m / d);
            }
        }
        d += 1;
    }
    out.sort_unstable();
    out
}

/// Rabin's irreducibility test for a polynomial of degree exactly `m`.
pub fn is_irreducible(poly: u64, m: u32) -> bool {
    if m == 0 || m > MAX_DEGREE || degree(poly as u128) != m as i32 || poly & 1 == 0 {
        return false;
    }
    // x itself is reduced so that the degree-1 case compares like with like.
    let x = reduce(X as u128, poly);
    if pow_mod(X, 1u64 << m, poly) != x {
        return false;
    }
    for d in proper_divisors(m) {
        let xp = pow_mod(X, 1u64 << (m / d), poly);
        if gcd(poly, xp ^ x) != 1 {
            return false;
        }
    }
    true
}

/// First irreducible of degree `m` in ascending order among `x^m + ... + 1`.
pub fn find_irreducible(m: u32) -> Result<u64, FieldError> {
    if m == 0 || m > MAX_DEGREE {
        return Err(FieldError::DegreeOutOfRange { degree: m, max: MAX_DEGREE });
    }
    let start = (1u64 << m) | 1;
    let end = (1u64 << m) | low_mask(m);
    (start..=end)
        .step_by(2)
        .find(|&p| is_irreducible(p, m))
        .ok_or(FieldError::NoIrreducible { degree: m })
}

/// Memo of `find_irreducible`, owned by whoever builds fields repeatedly.
#[derive(Debug, Clone, Default)]
pub struct IrreducibleCache {
    found: HashMap<u32, u64>,
}

impl IrreducibleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_find(&mut self, m: u32) -> Result<u64, FieldError> {
        if let Some(&p) = self.found.get(&m) {
            return Ok(p);
        }
        let p = find_irreducible(m)?;
        self.found.insert(m, p);
        Ok(p)
    }

    pub fn len(&self) -> usize {
        self.found.len()
    }

    pub fn is_empty(&self) -> bool {
        self.found.is_empty()
    }
}

/// GF(2^m) as polynomials reduced modulo a fixed irreducible of degree `m`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gf2mField {
    modulus: u64,
    degree: u32,
}

impl Gf2mField {
    pub fn with_degree(m: u32, cache: &mut IrreducibleCache) -> Result<Self, FieldError> {
        let modulus = cache.get_or_find(m)?;
        Ok(Self { modulus, degree: m })
    }

    pub fn from_modulus(modulus: u64) -> Result<Self, FieldError> {
        let d = degree(modulus as u128);
        if d < 1 {
            return Err(FieldError::DegreeOutOfRange { degree: 0, max: MAX_DEGREE });
        }
        let m = d as u32;
        if !is_irreducible(modulus, m) {
            return Err(FieldError::Reducible { modulus });
        }
        Ok(Self { modulus, degree: m })
    }

    #[inline]
    pub fn modulus(&self) -> u64 {
        self.modulus
    }

    #[inline]
    pub fn degree(&self) -> u32 {
        self.degree
    }

    /// Number of elements minus one, i.e. the largest element value.
    #[inline]
    pub fn max_value(&self) -> u64 {
        low_mask(self.degree)
    }

    pub fn element(&self, value: u64) -> Result<Gf2mElement<'_>, FieldError> {
        if value > self.max_value() {
            return Err(FieldError::NotAnElement { value, degree: self.degree });
        }
        Ok(Gf2mElement { value, field: self })
    }

    pub fn one(&self) -> Gf2mElement<'_> {
        Gf2mElement { value: reduce(1, self.modulus), field: self }
    }

    #[inline]
    pub fn mul_values(&self, a: u64, b: u64) -> u64 {
        reduce(multiply(a, b), self.modulus)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Gf2mElement<'f> {
    value: u64,
    field: &'f Gf2mField,
}

impl PartialEq for Gf2mElement<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.field == other.field
    }
}

impl Eq for Gf2mElement<'_> {}

impl<'f> Gf2mElement<'f> {
    #[inline]
    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn pow(self, exponent: u64) -> Self {
        Self { value: pow_mod(self.value, exponent, self.field.modulus), field: self.field }
    }

    /// The `m` coefficients, highest degree first.
    pub fn to_bits(&self) -> BitVec<u64, Lsb0> {
        let m = self.field.degree;
        let mut bits: BitVec<u64, Lsb0> = BitVec::with_capacity(m as usize);
        for i in (0..m).rev() {
            bits.push((self.value >> i) & 1 == 1);
        }
        bits
    }

    /// Mod-2 dot product of the two coefficient vectors.
    #[inline]
    pub fn dot(&self, other: &Self) -> bool {
        debug_assert_eq!(self.field, other.field);
        (self.value & other.value).count_ones() & 1 == 1
    }
}

impl<'f> Add for Gf2mElement<'f> {
    type Output = Gf2mElement<'f>;

    fn add(self, rhs: Self) -> Self::Output {
        debug_assert_eq!(self.field, rhs.field);
        Gf2mElement { value: self.value ^ rhs.value, field: self.field }
    }
}

impl<'f> Mul for Gf2mElement<'f> {
    type Output = Gf2mElement<'f>;

    fn mul(self, rhs: Self) -> Self::Output {
        debug_assert_eq!(self.field, rhs.field);
        Gf2mElement { value: self.field.mul_values(self.value, rhs.value), field: self.field }
    }
}
