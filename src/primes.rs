//! # Primes — Work-Unit Generation
//!
//! The engine's work units are sieve primes, produced in strictly
//! ascending order by a [`PrimeSource`]. The source is deliberately
//! restartable per call — "give me the next N units after X" — rather
//! than a persistent stream, so the scheduling loop can materialize a
//! chunk for whichever worker is ready without any generator state being
//! tied to a worker.
//!
//! Two implementations:
//!
//! - [`PrimeStream`]: a segmented sieve of Eratosthenes. Base primes up to
//!   √(segment end) are kept and regrown on demand; each call sieves odd
//!   candidates in 2^16-wide segments starting just above `after`. No
//!   state depends on previous calls, so a rebuild that moves the
//!   high-water mark backward needs nothing special from the source.
//! - [`IntegerStream`]: every positive integer is a unit. Used by tests
//!   and calibration runs where the unit values must be dense and exact.

use crate::terms::TermBitmap;

/// Ordered work-unit generator. `next_units` returns up to `count` units
/// strictly greater than `after`, ascending.
pub trait PrimeSource: Send {
    fn next_units(&mut self, after: u64, count: u32) -> Vec<u64>;
}

/// Width of one sieving segment (odd candidates only, so 2^15 bits).
const SEGMENT_SPAN: u64 = 1 << 16;

/// Segmented, restartable prime generator.
pub struct PrimeStream {
    base: Vec<u64>,
    base_limit: u64,
}

impl PrimeStream {
    pub fn new() -> Self {
        PrimeStream {
            base: Vec::new(),
            base_limit: 0,
        }
    }

    /// Grow the base-prime table to cover marking up to `limit`.
    fn ensure_base(&mut self, limit: u64) {
        if limit <= self.base_limit {
            return;
        }
        let limit = limit.next_power_of_two().max(1 << 8);
        self.base = simple_sieve(limit);
        self.base_limit = limit;
    }
}

impl Default for PrimeStream {
    fn default() -> Self {
        PrimeStream::new()
    }
}

impl PrimeSource for PrimeStream {
    fn next_units(&mut self, after: u64, count: u32) -> Vec<u64> {
        let want = count as usize;
        let mut out = Vec::with_capacity(want);
        if want == 0 {
            return out;
        }
        if after < 2 {
            out.push(2);
        }

        // First odd candidate strictly above max(after, 2).
        let mut lo = if after < 3 { 3 } else { after + 1 };
        if lo % 2 == 0 {
            lo += 1;
        }

        while out.len() < want {
            let hi = lo + SEGMENT_SPAN; // exclusive; lo odd, span even
            self.ensure_base(isqrt(hi - 1) + 1);

            // Bit i ↔ odd candidate lo + 2i.
            let m = (SEGMENT_SPAN / 2) as usize;
            let mut bits = TermBitmap::new_all_set(m);
            for &p in self.base.iter().skip(1) {
                if p * p >= hi {
                    break;
                }
                // First odd multiple of p in [lo, hi) that is >= p².
                let mut c = p * p;
                if c < lo {
                    c = lo.div_ceil(p) * p;
                    if c % 2 == 0 {
                        c += p;
                    }
                }
                while c < hi {
                    bits.clear(((c - lo) / 2) as usize);
                    c += 2 * p;
                }
            }

            for i in bits.iter_set() {
                out.push(lo + 2 * i as u64);
                if out.len() == want {
                    break;
                }
            }
            lo = hi;
        }
        out
    }
}

/// Dense unit source: every positive integer. The engine's behavior is
/// unit-agnostic, so tests use this to make chunk boundaries exact.
pub struct IntegerStream;

impl PrimeSource for IntegerStream {
    fn next_units(&mut self, after: u64, count: u32) -> Vec<u64> {
        (1..=count as u64).map(|i| after + i).collect()
    }
}

/// Odds-only sieve of Eratosthenes for the base-prime table.
fn simple_sieve(limit: u64) -> Vec<u64> {
    if limit < 2 {
        return Vec::new();
    }
    let mut primes = vec![2u64];
    if limit < 3 {
        return primes;
    }
    // Bit i ↔ odd 2i + 3.
    let m = ((limit - 3) / 2 + 1) as usize;
    let mut bits = TermBitmap::new_all_set(m);
    let mut i = 0usize;
    loop {
        let p = 2 * i as u64 + 3;
        if p * p > limit {
            break;
        }
        if bits.get(i) {
            let mut c = p * p;
            while c <= limit {
                bits.clear(((c - 3) / 2) as usize);
                c += 2 * p;
            }
        }
        i += 1;
    }
    primes.extend(bits.iter_set().map(|i| 2 * i as u64 + 3));
    primes
}

/// Integer square root, exact.
fn isqrt(n: u64) -> u64 {
    let mut r = (n as f64).sqrt() as u64;
    while (r as u128) * (r as u128) > n as u128 {
        r -= 1;
    }
    while ((r + 1) as u128) * ((r + 1) as u128) <= n as u128 {
        r += 1;
    }
    r
}
