//! Staged file naming (`{kind}_{index}_{n}.json`) and suffix allocation.
//!
//! Suffixes come from an explicit counter per `(kind, index)`, seeded once
//! from the highest suffix already on disk. Counting files and writing
//! `count` lets two writers pick the same name; the counter never hands out
//! the same suffix twice within a process, and cross-process collisions are
//! caught by the no-clobber publish in [`super::staging`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagedKind {
    Block,
    Receipt,
}

impl StagedKind {
    pub fn prefix(self) -> &'static str {
        match self {
            StagedKind::Block => "block",
            StagedKind::Receipt => "receipt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedFileName {
    pub kind: StagedKind,
    pub index: u64,
    pub seq: u64,
}

impl StagedFileName {
    pub fn new(kind: StagedKind, index: u64, seq: u64) -> Self {
        Self { kind, index, seq }
    }

    pub fn file_name(&self) -> String {
        format!("{}_{}_{}.json", self.kind.prefix(), self.index, self.seq)
    }

    /// Parses `block_7_2.json` / `receipt_7_2.json`. Anything else, including
    /// in-flight temp files, yields `None`.
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".json")?;
        let mut parts = stem.split('_');
        let kind = match parts.next()? {
            "block" => StagedKind::Block,
            "receipt" => StagedKind::Receipt,
            _ => return None,
        };
        let index = parse_canonical(parts.next()?)?;
        let seq = parse_canonical(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { kind, index, seq })
    }
}

/// Plain decimal with no sign or leading zeros, so each number has exactly
/// one file name.
fn parse_canonical(part: &str) -> Option<u64> {
    let value: u64 = part.parse().ok()?;
    (value.to_string() == part).then_some(value)
}

/// Staged files of `kind` for `index` in `dir`, ordered by suffix.
pub fn scan(dir: &Path, kind: StagedKind, index: u64) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(parsed) = name.to_str().and_then(StagedFileName::parse) else {
            continue;
        };
        if parsed.kind == kind && parsed.index == index {
            found.push((parsed.seq, entry.path()));
        }
    }
    found.sort_by_key(|(seq, _)| *seq);
    Ok(found)
}

#[derive(Debug, Default)]
pub struct SequenceAllocator {
    next: Mutex<HashMap<(StagedKind, u64), u64>>,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out the next suffix for `(kind, index)`.
    pub fn next(&self, kind: StagedKind, index: u64, dir: &Path) -> io::Result<u64> {
        let mut next = self.next.lock();
        let slot = match next.entry((kind, index)) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let seed = scan(dir, kind, index)?
                    .last()
                    .map_or(0, |(seq, _)| seq + 1);
                e.insert(seed)
            }
        };
        let seq = *slot;
        *slot += 1;
        Ok(seq)
    }

    /// Drops counters for indexes above `index` so they re-seed from disk.
    pub fn forget_above(&self, index: u64) {
        self.next.lock().retain(|(_, i), _| *i <= index);
    }
}
