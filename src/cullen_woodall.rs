//! # Cullen/Woodall — Factor Sieve for n·2^n ± 1
//!
//! Second shipped [`SieveTask`]: Cullen terms n·2^n + 1 and Woodall terms
//! n·2^n − 1 over one exponent range. Structurally a sibling of the kbn
//! sieve, with a different stepping recurrence: with t = 2^n and
//! v = n·2^n (both mod p),
//!
//! ```text
//! v' = (n+1)·2^(n+1) = 2·(v + t),   t' = 2·t
//! ```
//!
//! so the dense kernel advances both sides with two modular doublings per
//! exponent — no Montgomery setup needed. p = 2 never divides either side
//! (n·2^n is even for n ≥ 1, so n·2^n ± 1 is odd).

use crate::checkpoint::{self, Checkpoint};
use crate::modarith::pow_mod;
use crate::terms::TermStore;
use crate::{EngineRequest, SieveTask, StatusReport, WorkerKind};
use anyhow::{bail, ensure, Result};
use rug::Integer;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, info, warn};

const DEFAULT_CHUNK_SIZE: u32 = 10_000;
const COMPACT_THRESHOLD: f64 = 0.05;

#[derive(Clone, Copy, Debug)]
pub struct CullenWoodallParams {
    pub min_n: u64,
    pub max_n: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Side {
    Cullen,
    Woodall,
}

struct CwState {
    cullen: TermStore,
    woodall: TermStore,
    factors_found: u64,
    factor_log: Option<File>,
}

pub struct CullenWoodallSieve {
    params: CullenWoodallParams,
    checkpoint_path: PathBuf,
    state: RwLock<CwState>,
}

impl CullenWoodallSieve {
    /// Build the sieve, resuming from a matching checkpoint. Returns the
    /// sieve and the mark sieving resumes above (0 for a fresh start).
    pub fn new(
        params: CullenWoodallParams,
        checkpoint_path: PathBuf,
        factor_log: Option<PathBuf>,
    ) -> Result<(CullenWoodallSieve, u64)> {
        if params.min_n == 0 || params.max_n < params.min_n {
            bail!(
                "bad exponent range: min_n={}, max_n={}",
                params.min_n,
                params.max_n
            );
        }

        let (cullen, woodall, factors_found, resume_mark) =
            match checkpoint::load(&checkpoint_path) {
                Some(Checkpoint::CullenWoodall {
                    min_n,
                    max_n,
                    sieved_to,
                    factors_found,
                    cullen_terms,
                    woodall_terms,
                }) if min_n == params.min_n && max_n == params.max_n => {
                    info!(
                        sieved_to,
                        survivors = cullen_terms.len() + woodall_terms.len(),
                        "resuming cullen/woodall sieve from checkpoint"
                    );
                    (
                        TermStore::dense_from_terms(min_n, max_n, &cullen_terms),
                        TermStore::dense_from_terms(min_n, max_n, &woodall_terms),
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
            CullenWoodallSieve {
                params,
                checkpoint_path,
                state: RwLock::new(CwState {
                    cullen,
                    woodall,
                    factors_found,
                    factor_log,
                }),
            },
            resume_mark,
        ))
    }

    pub fn survivors(&self) -> (usize, usize) {
        let state = self.state.read().unwrap();
        (state.cullen.survivors(), state.woodall.survivors())
    }

    fn scan(&self, state: &CwState, primes: &[u64], hits: &mut Vec<(u64, u64, Side)>) {
        let CullenWoodallParams { min_n, max_n } = self.params;

        for &p in primes {
            if p == 2 {
                continue;
            }

            if let (Some(cullen_terms), Some(woodall_terms)) =
                (state.cullen.sparse_terms(), state.woodall.sparse_terms())
            {
                for &n in cullen_terms {
                    let v = (n % p) as u128 * pow_mod(2, n, p) as u128 % p as u128;
                    if v as u64 == p - 1 {
                        hits.push((p, n, Side::Cullen));
                    }
                }
                for &n in woodall_terms {
                    let v = (n % p) as u128 * pow_mod(2, n, p) as u128 % p as u128;
                    if v as u64 == 1 {
                        hits.push((p, n, Side::Woodall));
                    }
                }
            } else {
                let mut t = pow_mod(2, min_n, p);
                let mut v = ((min_n % p) as u128 * t as u128 % p as u128) as u64;
                for n in min_n..=max_n {
                    if v == p - 1 && state.cullen.contains(n) {
                        hits.push((p, n, Side::Cullen));
                    }
                    if v == 1 && state.woodall.contains(n) {
                        hits.push((p, n, Side::Woodall));
                    }
                    v = ((v as u128 + t as u128) * 2 % p as u128) as u64;
                    t = (t as u128 * 2 % p as u128) as u64;
                }
            }
        }
    }

    fn report_hits(&self, hits: Vec<(u64, u64, Side)>) -> Result<()> {
        if hits.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().unwrap();
        for (p, n, side) in hits {
            let store = match side {
                Side::Cullen => &state.cullen,
                Side::Woodall => &state.woodall,
            };
            if !store.contains(n) {
                continue;
            }

            let (symbol, offset) = match side {
                Side::Cullen => ('+', 1i32),
                Side::Woodall => ('-', -1i32),
            };
            let expr = format!("{}*2^{}{}1", n, n, symbol);
            let term = Integer::from(n) * (Integer::from(1u32) << n as u32) + offset;
            ensure!(
                term.is_divisible(&Integer::from(p)),
                "kernel reported {} as a factor of {}, but it does not divide it",
                p,
                expr
            );
            if term == p {
                info!(term = %expr, "term is itself prime");
                continue;
            }

            match side {
                Side::Cullen => state.cullen.remove(n),
                Side::Woodall => state.woodall.remove(n),
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

impl SieveTask for CullenWoodallSieve {
    fn name(&self) -> &'static str {
        "cullen-woodall"
    }

    fn preferred_chunk_size(&self) -> u32 {
        DEFAULT_CHUNK_SIZE
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
            &Checkpoint::CullenWoodall {
                min_n: self.params.min_n,
                max_n: self.params.max_n,
                sieved_to,
                factors_found: state.factors_found,
                cullen_terms: state.cullen.surviving_terms(),
                woodall_terms: state.woodall.surviving_terms(),
            },
        )
    }

    fn rebuild(&self, sieved_to: u64) -> Result<u64> {
        let mut state = self.state.write().unwrap();
        if !state.cullen.is_sparse() {
            state.cullen = state.cullen.compacted();
            state.woodall = state.woodall.compacted();
            info!(
                survivors = state.cullen.survivors() + state.woodall.survivors(),
                sieved_to, "term stores compacted to sparse lists"
            );
        }
        Ok(sieved_to)
    }

    fn on_status(&self, _report: &StatusReport) -> EngineRequest {
        let state = self.state.read().unwrap();
        if !state.cullen.is_sparse() {
            let density = (state.cullen.density() + state.woodall.density()) / 2.0;
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
            state.cullen.survivors() + state.woodall.survivors(),
            state.factors_found
        ))
    }
}
