//! # Kbn — Factor Sieve for k·b^n ± 1
//!
//! The reference [`SieveTask`]: maintains one surviving-term store per
//! side (+1 / −1) for n in `[min_n, max_n]`, and tests every chunk of
//! sieve primes against both.
//!
//! ## Kernel
//!
//! For a prime p, k·b^n ≡ −1 (mod p) means p divides k·b^n + 1, and
//! k·b^n ≡ +1 (mod p) means p divides k·b^n − 1. While the stores are
//! dense, the kernel walks the whole exponent range once per prime,
//! stepping r ← r·b in Montgomery form (one multiply-and-shift per
//! exponent). Once the stores have been compacted to sparse lists, it
//! evaluates k·b^n mod p per surviving term instead — at that point the
//! survivors are far fewer than the range is wide.
//!
//! p = 2 is pure parity: k·b^n is odd exactly when k and b are both odd,
//! and then both k·b^n ± 1 are even.
//!
//! ## Locking
//!
//! One `RwLock` guards all search state. Chunk scans take the read lock;
//! factor verification, removal and the factor log take the write lock;
//! checkpoints take the read lock, which serializes them with reporting.
//! Below the engine's single-worker threshold only one worker scans at a
//! time anyway, so the dense phase never contends here.
//!
//! ## Factor verification
//!
//! Every hit is re-verified with `rug` exact arithmetic before the term
//! is removed. A hit that fails verification is a kernel bug and aborts
//! the run — a single silently-wrong removal would poison the whole
//! surviving-term file.

use crate::checkpoint::{self, Checkpoint};
use crate::modarith::{pow_mod, MontgomeryCtx};
use crate::terms::TermStore;
use crate::{EngineRequest, MiniChunkWindow, SieveTask, StatusReport, WorkerKind};
use anyhow::{bail, ensure, Result};
use rug::ops::Pow;
use rug::Integer;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Primes per chunk when the engine config does not say otherwise.
const DEFAULT_CHUNK_SIZE: u32 = 10_000;

/// Below this prime, chunks run as mini batches: low primes eliminate
/// terms so fast that coarse chunks would leave the progress counters
/// stale for seconds.
const MINI_CHUNK_HIGH: u64 = 1 << 16;
const MINI_CHUNK_BATCH: u32 = 1_000;

/// Survivor density below which on_status asks for a rebuild to sparse
/// term lists.
const COMPACT_THRESHOLD: f64 = 0.05;

#[derive(Clone, Copy, Debug)]
pub struct KbnParams {
    pub k: u64,
    pub base: u32,
    pub min_n: u64,
    pub max_n: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Side {
    Plus,
    Minus,
}

impl Side {
    fn symbol(self) -> char {
        match self {
            Side::Plus => '+',
            Side::Minus => '-',
        }
    }
}

/// Everything behind the single search-state lock.
struct KbnState {
    plus: TermStore,
    minus: TermStore,
    factors_found: u64,
    factor_log: Option<File>,
}

pub struct KbnSieve {
    params: KbnParams,
    checkpoint_path: PathBuf,
    state: RwLock<KbnState>,
}

impl KbnSieve {
    /// Build the sieve, resuming from the checkpoint file when it holds a
    /// matching search. Returns the sieve and the mark sieving should
    /// resume above (0 for a fresh start).
    pub fn new(
        params: KbnParams,
        checkpoint_path: PathBuf,
        factor_log: Option<PathBuf>,
    ) -> Result<(KbnSieve, u64)> {
        if params.k == 0 {
            bail!("k must be at least 1");
        }
        if params.base < 2 {
            bail!("base must be at least 2");
        }
        if params.min_n == 0 || params.max_n < params.min_n {
            bail!(
                "bad exponent range: min_n={}, max_n={}",
                params.min_n,
                params.max_n
            );
        }

        let (plus, minus, factors_found, resume_mark) = match checkpoint::load(&checkpoint_path) {
            Some(Checkpoint::Kbn {
                k,
                base,
                min_n,
                max_n,
                sieved_to,
                factors_found,
                plus_terms,
                minus_terms,
            }) if k == params.k
                && base == params.base
                && min_n == params.min_n
                && max_n == params.max_n =>
            {
                info!(
                    sieved_to,
                    survivors = plus_terms.len() + minus_terms.len(),
                    "resuming kbn sieve from checkpoint"
                );
                (
                    TermStore::dense_from_terms(min_n, max_n, &plus_terms),
                    TermStore::dense_from_terms(min_n, max_n, &minus_terms),
                    factors_found,
                    sieved_to,
                )
            }
            Some(_) => {
                warn!("checkpoint does not match this search; starting fresh");
                (
                    TermStore::dense(params.min_n, params.max_n),
                    TermStore::dense(params.min_n, params.max_n),
                    0,
                    0,
                )
            }
            None => (
                TermStore::dense(params.min_n, params.max_n),
                TermStore::dense(params.min_n, params.max_n),
                0,
                0,
            ),
        };

        let factor_log = match factor_log {
            Some(path) => Some(OpenOptions::new().create(true).append(true).open(path)?),
            None => None,
        };

        Ok((
            KbnSieve {
                params,
                checkpoint_path,
                state: RwLock::new(KbnState {
                    plus,
                    minus,
                    factors_found,
                    factor_log,
                }),
            },
            resume_mark,
        ))
    }

    pub fn params(&self) -> KbnParams {
        self.params
    }

    pub fn survivors(&self) -> (usize, usize) {
        let state = self.state.read().unwrap();
        (state.plus.survivors(), state.minus.survivors())
    }

    pub fn factors_found(&self) -> u64 {
        self.state.read().unwrap().factors_found
    }

    /// Scan phase: find (prime, n, side) hits without mutating anything.
    fn scan(&self, state: &KbnState, primes: &[u64], hits: &mut Vec<(u64, u64, Side)>) {
        let KbnParams {
            k,
            base,
            min_n,
            max_n,
        } = self.params;
        let b = base as u64;

        for &p in primes {
            if p == 2 {
                // Parity: both sides are even exactly when k·b^n is odd.
                if k % 2 == 1 && b % 2 == 1 {
                    for n in state.plus.surviving_terms() {
                        hits.push((2, n, Side::Plus));
                    }
                    for n in state.minus.surviving_terms() {
                        hits.push((2, n, Side::Minus));
                    }
                }
                continue;
            }

            if let (Some(plus_terms), Some(minus_terms)) =
                (state.plus.sparse_terms(), state.minus.sparse_terms())
            {
                // Sparse: evaluate k·b^n mod p per surviving term.
                for &n in plus_terms {
                    let r = (k as u128 * pow_mod(b, n, p) as u128 % p as u128) as u64;
                    if r == p - 1 {
                        hits.push((p, n, Side::Plus));
                    }
                }
                for &n in minus_terms {
                    let r = (k as u128 * pow_mod(b, n, p) as u128 % p as u128) as u64;
                    if r == 1 {
                        hits.push((p, n, Side::Minus));
                    }
                }
            } else {
                // Dense: one Montgomery step per exponent across the range.
                let ctx = MontgomeryCtx::new(p);
                let b_mont = ctx.to_mont(b);
                let one = ctx.one();
                let minus_one = ctx.minus_one();
                let r0 = (k as u128 * pow_mod(b, min_n, p) as u128 % p as u128) as u64;
                let mut r = ctx.to_mont(r0);
                for n in min_n..=max_n {
                    if r == minus_one && state.plus.contains(n) {
                        hits.push((p, n, Side::Plus));
                    }
                    if r == one && state.minus.contains(n) {
                        hits.push((p, n, Side::Minus));
                    }
                    r = ctx.mul(r, b_mont);
                }
            }
        }
    }

    /// Report phase: verify each hit exactly and remove the term, all
    /// under the write lock.
    fn report_hits(&self, hits: Vec<(u64, u64, Side)>) -> Result<()> {
        if hits.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().unwrap();
        for (p, n, side) in hits {
            let store = match side {
                Side::Plus => &state.plus,
                Side::Minus => &state.minus,
            };
            if !store.contains(n) {
                // Another prime in this or a concurrent chunk got it first.
                continue;
            }

            let expr = format!(
                "{}*{}^{}{}1",
                self.params.k,
                self.params.base,
                n,
                side.symbol()
            );
            let mut term = Integer::from(self.params.k)
                * Integer::from(self.params.base).pow(n as u32);
            match side {
                Side::Plus => term += 1u32,
                Side::Minus => term -= 1u32,
            }
            ensure!(
                term.is_divisible(&Integer::from(p)),
                "kernel reported {} as a factor of {}, but it does not divide it",
                p,
                expr
            );
            if term == p {
                // The term IS this prime; that is a prime found, not a
                // factor — the term survives.
                info!(term = %expr, "term is itself prime");
                continue;
            }

            match side {
                Side::Plus => state.plus.remove(n),
                Side::Minus => state.minus.remove(n),
            };
            state.factors_found += 1;
            debug!(factor = p, term = %expr, "factor found");
            if let Some(log) = state.factor_log.as_mut() {
                writeln!(log, "{} | {}", p, expr)?;
            }
        }
        Ok(())
    }
}

impl SieveTask for KbnSieve {
    fn name(&self) -> &'static str {
        "kbn"
    }

    fn preferred_chunk_size(&self) -> u32 {
        DEFAULT_CHUNK_SIZE
    }

    fn mini_chunk_window(&self) -> Option<MiniChunkWindow> {
        Some(MiniChunkWindow {
            low: 0,
            high: MINI_CHUNK_HIGH,
            batch: MINI_CHUNK_BATCH,
        })
    }

    fn process_chunk(&self, _kind: WorkerKind, primes: &[u64]) -> Result<u64> {
        let mut hits = Vec::new();
        {
            let state = self.state.read().unwrap();
            self.scan(&state, primes, &mut hits);
        }
        self.report_hits(hits)?;
        Ok(*primes.last().unwrap())
    }

    fn checkpoint(&self, sieved_to: u64) -> Result<()> {
        let state = self.state.read().unwrap();
        checkpoint::save(
            &self.checkpoint_path,
            &Checkpoint::Kbn {
                k: self.params.k,
                base: self.params.base,
                min_n: self.params.min_n,
                max_n: self.params.max_n,
                sieved_to,
                factors_found: state.factors_found,
                plus_terms: state.plus.surviving_terms(),
                minus_terms: state.minus.surviving_terms(),
            },
        )
    }

    fn rebuild(&self, sieved_to: u64) -> Result<u64> {
        let mut state = self.state.write().unwrap();
        if !state.plus.is_sparse() {
            state.plus = state.plus.compacted();
            state.minus = state.minus.compacted();
            info!(
                survivors = state.plus.survivors() + state.minus.survivors(),
                sieved_to, "term stores compacted to sparse lists"
            );
        }
        Ok(sieved_to)
    }

    fn on_status(&self, _report: &StatusReport) -> EngineRequest {
        let state = self.state.read().unwrap();
        if !state.plus.is_sparse() {
            let density = (state.plus.density() + state.minus.density()) / 2.0;
            if density < COMPACT_THRESHOLD {
                return EngineRequest::Rebuild;
            }
        }
        EngineRequest::None
    }

    fn status_suffix(&self) -> Option<String> {
        let state = self.state.read().unwrap();
        Some(format!(
            "terms={} factors={}",
            state.plus.survivors() + state.minus.survivors(),
            state.factors_found
        ))
    }
}

#[cfg(test)]
mod tests {
    //! Kernel correctness against naive big-integer arithmetic.
    //!
    //! Every test compares the Montgomery/stepping kernel's removals with
    //! a direct "does p divide k·b^n ± 1" computation over the same range
    //! — the kernel has no value of its own beyond agreeing with that.

    use super::*;
    use crate::primes::{PrimeSource, PrimeStream};

    fn naive_survivors(params: KbnParams, primes: &[u64], side: Side) -> Vec<u64> {
        (params.min_n..=params.max_n)
            .filter(|&n| {
                let mut term =
                    Integer::from(params.k) * Integer::from(params.base).pow(n as u32);
                match side {
                    Side::Plus => term += 1u32,
                    Side::Minus => term -= 1u32,
                }
                !primes
                    .iter()
                    .any(|&p| term.is_divisible(&Integer::from(p)) && term != p)
            })
            .collect()
    }

    fn fresh(params: KbnParams) -> KbnSieve {
        let dir = tempfile::tempdir().unwrap();
        // The tempdir is dropped here; the checkpoint path is only used
        // when checkpoint() is called, which these kernel tests don't do.
        let path = dir.path().join("kbn.checkpoint");
        KbnSieve::new(params, path, None).unwrap().0
    }

    // ── Kernel vs naive ─────────────────────────────────────────────

    /// Dense kernel agrees with exact arithmetic for 5·2^n ± 1 over the
    /// first 100 odd primes.
    #[test]
    fn dense_kernel_matches_naive() {
        let params = KbnParams {
            k: 5,
            base: 2,
            min_n: 2,
            max_n: 60,
        };
        let primes: Vec<u64> = PrimeStream::new().next_units(2, 100);
        let sieve = fresh(params);
        sieve.process_chunk(WorkerKind::Cpu, &primes).unwrap();

        let state = sieve.state.read().unwrap();
        assert_eq!(
            state.plus.surviving_terms(),
            naive_survivors(params, &primes, Side::Plus)
        );
        assert_eq!(
            state.minus.surviving_terms(),
            naive_survivors(params, &primes, Side::Minus)
        );
        assert!(state.factors_found > 0);
    }

    /// The sparse kernel (after a rebuild) removes exactly what the dense
    /// kernel would have removed for the same primes.
    #[test]
    fn sparse_kernel_matches_dense() {
        let params = KbnParams {
            k: 7,
            base: 6,
            min_n: 1,
            max_n: 50,
        };
        let first: Vec<u64> = PrimeStream::new().next_units(2, 40);
        let second: Vec<u64> = PrimeStream::new().next_units(*first.last().unwrap(), 60);

        // Dense all the way.
        let dense = fresh(params);
        dense.process_chunk(WorkerKind::Cpu, &first).unwrap();
        dense.process_chunk(WorkerKind::Cpu, &second).unwrap();

        // Rebuild to sparse between the chunks.
        let sparse = fresh(params);
        sparse.process_chunk(WorkerKind::Cpu, &first).unwrap();
        sparse.rebuild(*first.last().unwrap()).unwrap();
        assert!(sparse.state.read().unwrap().plus.is_sparse());
        sparse.process_chunk(WorkerKind::Cpu, &second).unwrap();

        let d = dense.state.read().unwrap();
        let s = sparse.state.read().unwrap();
        assert_eq!(d.plus.surviving_terms(), s.plus.surviving_terms());
        assert_eq!(d.minus.surviving_terms(), s.minus.surviving_terms());
        assert_eq!(d.factors_found, s.factors_found);
    }

    /// p = 2 eliminates every term when k and b are both odd, and none
    /// otherwise.
    #[test]
    fn parity_rule_for_two() {
        // k, b odd: all terms even.
        let params = KbnParams {
            k: 3,
            base: 3,
            min_n: 2,
            max_n: 10,
        };
        let sieve = fresh(params);
        sieve.process_chunk(WorkerKind::Cpu, &[2]).unwrap();
        let (p, m) = sieve.survivors();
        assert_eq!((p, m), (0, 0));

        // b even: no factor of 2 ever.
        let params = KbnParams {
            k: 3,
            base: 2,
            min_n: 2,
            max_n: 10,
        };
        let sieve = fresh(params);
        sieve.process_chunk(WorkerKind::Cpu, &[2]).unwrap();
        let (p, m) = sieve.survivors();
        assert_eq!((p, m), (9, 9));
    }

    /// A term equal to the tested prime is a prime, not a factor hit —
    /// it must survive. 1·2^2 + 1 = 5 survives the prime 5.
    #[test]
    fn term_equal_to_prime_survives() {
        let params = KbnParams {
            k: 1,
            base: 2,
            min_n: 2,
            max_n: 4,
        };
        let sieve = fresh(params);
        sieve.process_chunk(WorkerKind::Cpu, &[3, 5, 7]).unwrap();
        let state = sieve.state.read().unwrap();
        // 2^2+1=5 (is the prime 5), 2^3+1=9=3·3 (removed), 2^4+1=17 (survives).
        assert_eq!(state.plus.surviving_terms(), vec![2, 4]);
        // 2^2-1=3 (is the prime 3), 2^3-1=7 (is the prime 7), 2^4-1=15=3·5 (removed).
        assert_eq!(state.minus.surviving_terms(), vec![2, 3]);
    }

    // ── Persistence ─────────────────────────────────────────────────

    /// Checkpoint and reload: the resumed sieve carries the same
    /// survivors, factor count and mark.
    #[test]
    fn checkpoint_resume_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kbn.checkpoint");
        let params = KbnParams {
            k: 5,
            base: 2,
            min_n: 2,
            max_n: 40,
        };

        let (sieve, resume) = KbnSieve::new(params, path.clone(), None).unwrap();
        assert_eq!(resume, 0);
        let primes: Vec<u64> = PrimeStream::new().next_units(2, 50);
        sieve.process_chunk(WorkerKind::Cpu, &primes).unwrap();
        let before = {
            let s = sieve.state.read().unwrap();
            (
                s.plus.surviving_terms(),
                s.minus.surviving_terms(),
                s.factors_found,
            )
        };
        sieve.checkpoint(*primes.last().unwrap()).unwrap();

        let (resumed, resume) = KbnSieve::new(params, path, None).unwrap();
        assert_eq!(resume, *primes.last().unwrap());
        let after = {
            let s = resumed.state.read().unwrap();
            (
                s.plus.surviving_terms(),
                s.minus.surviving_terms(),
                s.factors_found,
            )
        };
        assert_eq!(before, after);
    }

    /// A checkpoint for different parameters is ignored, not misapplied.
    #[test]
    fn mismatched_checkpoint_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kbn.checkpoint");
        let (sieve, _) = KbnSieve::new(
            KbnParams {
                k: 5,
                base: 2,
                min_n: 2,
                max_n: 40,
            },
            path.clone(),
            None,
        )
        .unwrap();
        sieve.process_chunk(WorkerKind::Cpu, &[3, 5, 7]).unwrap();
        sieve.checkpoint(7).unwrap();

        let (other, resume) = KbnSieve::new(
            KbnParams {
                k: 7,
                base: 2,
                min_n: 2,
                max_n: 40,
            },
            path,
            None,
        )
        .unwrap();
        assert_eq!(resume, 0);
        let (p, m) = other.survivors();
        assert_eq!((p, m), (39, 39));
    }

    // ── Engine-facing behavior ──────────────────────────────────────

    /// on_status stays quiet while the store is dense and healthy, and
    /// requests a rebuild once density falls under the threshold.
    #[test]
    fn on_status_requests_rebuild_at_low_density() {
        let params = KbnParams {
            k: 5,
            base: 2,
            min_n: 1,
            max_n: 100,
        };
        let sieve = fresh(params);
        let report = StatusReport {
            cpu_time: std::time::Duration::ZERO,
            wall_time: std::time::Duration::ZERO,
            sieved_to_no_gaps: 0,
            sieved_to_overall: 0,
            primes_per_sec: 0.0,
            primes_tested: 0,
        };
        assert_eq!(sieve.on_status(&report), EngineRequest::None);

        // Remove enough terms to push density below the threshold.
        {
            let mut state = sieve.state.write().unwrap();
            for n in 1..=98u64 {
                state.plus.remove(n);
                state.minus.remove(n);
            }
        }
        assert_eq!(sieve.on_status(&report), EngineRequest::Rebuild);

        // Once sparse, no further rebuilds are requested.
        sieve.rebuild(1000).unwrap();
        assert_eq!(sieve.on_status(&report), EngineRequest::None);
    }

    /// Bad parameters are rejected before any state exists.
    #[test]
    fn parameter_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kbn.checkpoint");
        let bad = [
            KbnParams {
                k: 0,
                base: 2,
                min_n: 1,
                max_n: 10,
            },
            KbnParams {
                k: 5,
                base: 1,
                min_n: 1,
                max_n: 10,
            },
            KbnParams {
                k: 5,
                base: 2,
                min_n: 10,
                max_n: 9,
            },
        ];
        for params in bad {
            assert!(
                KbnSieve::new(params, path.clone(), None).is_err(),
                "{:?} should be rejected",
                params
            );
        }
    }
}
