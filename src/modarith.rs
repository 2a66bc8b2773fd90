//! # Modarith — Modular Arithmetic Kernels
//!
//! The per-prime arithmetic the shipped sieve tasks are built on:
//!
//! 1. **Modular exponentiation** (`pow_mod`) with u128 intermediates,
//!    used to seed b^n₀ mod p at the start of an exponent range.
//! 2. **Montgomery multiplication** ([`MontgomeryCtx`]) for the stepping
//!    loop itself: with a fixed odd modulus p, each step becomes a
//!    multiply-and-shift (4–6 cycles) instead of a u128 division
//!    (35–90 cycles). See Montgomery, "Modular Multiplication Without
//!    Trial Division", Mathematics of Computation 44(170), 1985.
//!
//! Montgomery form represents a as ā = a·R mod p with R = 2^64. REDC
//! computes t·R⁻¹ mod p without ever dividing by p.

/// Modular exponentiation: base^exp mod modulus, u128 intermediates.
pub fn pow_mod(mut base: u64, mut exp: u64, modulus: u64) -> u64 {
    if modulus == 1 {
        return 0;
    }
    let mut result: u64 = 1;
    base %= modulus;
    while exp > 0 {
        if exp & 1 == 1 {
            result = (result as u128 * base as u128 % modulus as u128) as u64;
        }
        exp >>= 1;
        base = (base as u128 * base as u128 % modulus as u128) as u64;
    }
    result
}

/// Montgomery multiplication context for a fixed odd modulus p > 1.
#[derive(Clone, Copy, Debug)]
pub struct MontgomeryCtx {
    /// The modulus (odd, > 1).
    pub p: u64,
    /// -p⁻¹ mod 2^64, via Hensel lifting.
    p_prime: u64,
    /// R mod p — the Montgomery form of 1.
    r_mod_p: u64,
    /// R² mod p, for converting into Montgomery form.
    r2_mod_p: u64,
}

impl MontgomeryCtx {
    pub fn new(p: u64) -> Self {
        debug_assert!(p > 1 && p & 1 == 1, "Montgomery requires odd modulus > 1");

        // Hensel lifting doubles the valid bits each round: 6 rounds take
        // p⁻¹ from mod 2 to mod 2^64.
        let mut inv: u64 = 1;
        for _ in 0..6 {
            inv = inv.wrapping_mul(2u64.wrapping_sub(p.wrapping_mul(inv)));
        }
        let p_prime = inv.wrapping_neg();

        let r_mod_p = ((1u128 << 64) % p as u128) as u64;
        let r2_mod_p = ((r_mod_p as u128 * r_mod_p as u128) % p as u128) as u64;

        MontgomeryCtx {
            p,
            p_prime,
            r_mod_p,
            r2_mod_p,
        }
    }

    /// a → ā = a·R mod p.
    #[inline]
    pub fn to_mont(&self, a: u64) -> u64 {
        self.mul(a % self.p, self.r2_mod_p)
    }

    /// ā → a = ā·R⁻¹ mod p.
    #[inline]
    pub fn from_mont(&self, a: u64) -> u64 {
        self.reduce(a as u128)
    }

    /// REDC: t·R⁻¹ mod p.
    #[inline]
    fn reduce(&self, t: u128) -> u64 {
        let m = (t as u64).wrapping_mul(self.p_prime);
        let u = t + (m as u128) * (self.p as u128);
        let r = (u >> 64) as u64;
        if r >= self.p {
            r - self.p
        } else {
            r
        }
    }

    /// ā·b̄·R⁻¹ mod p — multiplication in Montgomery form.
    #[inline]
    pub fn mul(&self, a: u64, b: u64) -> u64 {
        self.reduce((a as u128) * (b as u128))
    }

    /// The Montgomery form of 1.
    #[inline]
    pub fn one(&self) -> u64 {
        self.r_mod_p
    }

    /// The Montgomery form of p − 1 (that is, −1 mod p).
    #[inline]
    pub fn minus_one(&self) -> u64 {
        self.p - self.r_mod_p
    }
}
