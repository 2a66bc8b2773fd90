//! # Checkpoint — Resumable Sieve State Persistence
//!
//! Saves and loads sieve progress as JSON with SHA-256 integrity
//! verification and generational backups. Each shipped task has its own
//! `Checkpoint` variant storing the minimal state needed to resume:
//! the search parameters, the gap-aware sieved-to mark, and the list of
//! surviving terms.
//!
//! ## Atomic Writes
//!
//! Files are written to a `.tmp` sibling and renamed into place, so a
//! crash mid-write never leaves a truncated checkpoint.
//!
//! ## Integrity and Generations
//!
//! A SHA-256 digest of the serialized payload rides in an envelope next
//! to the data. On load the digest is re-verified; a corrupt file is
//! skipped and the most recent of 3 rotated generations is used instead.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Backup generations kept alongside the current file.
const GENERATIONS: usize = 3;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum Checkpoint {
    Kbn {
        k: u64,
        base: u32,
        min_n: u64,
        max_n: u64,
        /// Every prime at or below this mark has been fully tested.
        sieved_to: u64,
        factors_found: u64,
        /// Surviving n for k·b^n + 1.
        plus_terms: Vec<u64>,
        /// Surviving n for k·b^n − 1.
        minus_terms: Vec<u64>,
    },
    CullenWoodall {
        min_n: u64,
        max_n: u64,
        sieved_to: u64,
        factors_found: u64,
        /// Surviving n for n·2^n + 1.
        cullen_terms: Vec<u64>,
        /// Surviving n for n·2^n − 1.
        woodall_terms: Vec<u64>,
    },
}

/// On-disk wrapper: payload plus its digest and a write timestamp.
#[derive(Serialize, Deserialize)]
struct Envelope {
    checksum: String,
    saved_at: String,
    data: serde_json::Value,
}

fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Path of generation `gen` (0 = current, 1 = `.1`, 2 = `.2`).
fn generation_path(base: &Path, gen: usize) -> PathBuf {
    if gen == 0 {
        base.to_path_buf()
    } else {
        let mut p = base.as_os_str().to_os_string();
        p.push(format!(".{}", gen));
        PathBuf::from(p)
    }
}

/// Save with checksum and rotating generations: current → .1 → .2, the
/// oldest discarded. The write itself is tmp-then-rename.
pub fn save(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    for gen in (1..GENERATIONS).rev() {
        let src = generation_path(path, gen - 1);
        let dst = generation_path(path, gen);
        if src.exists() {
            let _ = fs::rename(&src, &dst);
        }
    }

    let data = serde_json::to_value(checkpoint)?;
    let data_str = serde_json::to_string_pretty(&data)?;
    let envelope = Envelope {
        checksum: sha256_hex(&data_str),
        saved_at: Utc::now().to_rfc3339(),
        data,
    };
    let json = serde_json::to_string_pretty(&envelope)?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load the newest checkpoint whose digest verifies, falling back through
/// older generations on corruption. `None` when no usable file exists.
pub fn load(path: &Path) -> Option<Checkpoint> {
    for gen in 0..GENERATIONS {
        let p = generation_path(path, gen);
        if let Some(cp) = load_single(&p) {
            if gen > 0 {
                warn!(
                    generation = gen,
                    path = %p.display(),
                    "recovered checkpoint from backup generation"
                );
            }
            return Some(cp);
        }
    }
    None
}

fn load_single(path: &Path) -> Option<Checkpoint> {
    let raw = fs::read_to_string(path).ok()?;
    let envelope: Envelope = serde_json::from_str(&raw).ok()?;

    let data_str = serde_json::to_string_pretty(&envelope.data).ok()?;
    let expected = sha256_hex(&data_str);
    if expected != envelope.checksum {
        warn!(
            path = %path.display(),
            "checkpoint integrity check failed; trying older generation"
        );
        return None;
    }
    serde_json::from_value(envelope.data).ok()
}

/// Remove the current file, every generation, and any stale tmp file.
pub fn clear(path: &Path) {
    for gen in 0..GENERATIONS {
        let _ = fs::remove_file(generation_path(path, gen));
    }
    let _ = fs::remove_file(path.with_extension("tmp"));
}
