//! File-addressed Staging Store.
//!
//! Staged blocks live in one directory and receipts in another, each file
//! named `{kind}_{index}_{n}.json`. Every write goes through a temp file in
//! the same directory and an atomic rename, so a reader never sees a partial
//! file.

use super::sequence::{self, SequenceAllocator, StagedFileName, StagedKind};
use super::StagedBlock;
use crate::error::{LedgerError, Result};
use crate::transaction::Receipt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// How many suffixes a single publish tries before giving up.
const MAX_PUBLISH_ATTEMPTS: usize = 64;

pub struct StagingStore {
    blocks_dir: PathBuf,
    receipts_dir: PathBuf,
    sequence: SequenceAllocator,
    /// Serializes read-modify-write passes over staged blocks in this process.
    rewrite_lock: Mutex<()>,
}

impl StagingStore {
    pub fn open(blocks_dir: impl Into<PathBuf>, receipts_dir: impl Into<PathBuf>) -> Result<Self> {
        let blocks_dir = blocks_dir.into();
        let receipts_dir = receipts_dir.into();
        fs::create_dir_all(&blocks_dir)?;
        fs::create_dir_all(&receipts_dir)?;

        Ok(Self {
            blocks_dir,
            receipts_dir,
            sequence: SequenceAllocator::new(),
            rewrite_lock: Mutex::new(()),
        })
    }

    pub fn blocks_dir(&self) -> &Path {
        &self.blocks_dir
    }

    pub fn receipts_dir(&self) -> &Path {
        &self.receipts_dir
    }

    fn dir(&self, kind: StagedKind) -> &Path {
        match kind {
            StagedKind::Block => &self.blocks_dir,
            StagedKind::Receipt => &self.receipts_dir,
        }
    }

    /// Persists a staged block as `block_{index}_{n}.json` and returns its path.
    pub fn store_block(&self, block: &StagedBlock) -> Result<PathBuf> {
        self.publish(StagedKind::Block, block.index, block)
    }

    /// Persists a receipt as `receipt_{index}_{n}.json` under its target index.
    pub fn store_receipt(&self, receipt: &Receipt) -> Result<PathBuf> {
        self.publish(StagedKind::Receipt, receipt.block_index(), receipt)
    }

    /// Snapshot of every receipt staged for `index`, in suffix order. A fresh
    /// call re-reads the directory.
    pub fn list_receipts_for_block(&self, index: u64) -> Result<Vec<Receipt>> {
        Ok(self
            .load_all::<Receipt>(StagedKind::Receipt, index)?
            .into_iter()
            .map(|(_, receipt)| receipt)
            .collect())
    }

    /// Every staged block candidate for `index` with the file it came from.
    pub fn list_blocks_for_index(&self, index: u64) -> Result<Vec<(PathBuf, StagedBlock)>> {
        self.load_all(StagedKind::Block, index)
    }

    /// Appends `receipt` to every staged candidate for its target index that
    /// does not already hold a receipt from the same signer, persists those
    /// candidates and returns them.
    ///
    /// All candidates are loaded before any is rewritten: a corrupt candidate
    /// fails the pass with nothing modified and the file left in place.
    pub fn append_receipt_to_all_candidates(&self, receipt: &Receipt) -> Result<Vec<StagedBlock>> {
        let _guard = self.rewrite_lock.lock();
        let index = receipt.block_index();
        let candidates = self.load_all::<StagedBlock>(StagedKind::Block, index)?;

        let mut modified = Vec::new();
        for (path, mut block) in candidates {
            if !block.append_receipt(receipt.clone()) {
                continue;
            }
            write_atomic(&path, &block)?;
            modified.push(block);
        }

        debug!(
            block_index = index,
            public_key = %receipt.public_key,
            modified = modified.len(),
            "receipt appended to staged candidates"
        );
        Ok(modified)
    }

    /// Deletes staged blocks and receipts whose index is above `index`.
    /// Returns how many files were removed. Safe to repeat.
    pub fn prune_above(&self, index: u64) -> Result<usize> {
        let _guard = self.rewrite_lock.lock();
        let mut removed = 0;
        for dir in [&self.blocks_dir, &self.receipts_dir] {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(parsed) = name.to_str().and_then(StagedFileName::parse) else {
                    continue;
                };
                if parsed.index <= index {
                    continue;
                }
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        self.sequence.forget_above(index);

        if removed > 0 {
            info!(above = index, removed, "pruned staged files");
        }
        Ok(removed)
    }

    fn load_all<T: DeserializeOwned>(&self, kind: StagedKind, index: u64) -> Result<Vec<(PathBuf, T)>> {
        let mut loaded = Vec::new();
        for (_, path) in sequence::scan(self.dir(kind), kind, index)? {
            let value = read_staged(&path)?;
            loaded.push((path, value));
        }
        Ok(loaded)
    }

    fn publish<T: Serialize>(&self, kind: StagedKind, index: u64, value: &T) -> Result<PathBuf> {
        let dir = self.dir(kind);
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut tmp, value)?;
        tmp.as_file().sync_all()?;

        for _ in 0..MAX_PUBLISH_ATTEMPTS {
            let seq = self.sequence.next(kind, index, dir)?;
            let path = dir.join(StagedFileName::new(kind, index, seq).file_name());
            match tmp.persist_noclobber(&path) {
                Ok(_) => {
                    debug!(path = %path.display(), "staged file written");
                    return Ok(path);
                }
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                    warn!(path = %path.display(), "staged file name taken by another writer, retrying");
                    tmp = e.file;
                }
                Err(e) => return Err(e.error.into()),
            }
        }

        Err(LedgerError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "no free {} slot for index {} after {} attempts",
                kind.prefix(),
                index,
                MAX_PUBLISH_ATTEMPTS
            ),
        )))
    }
}

fn read_staged<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|e| LedgerError::corruption(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| LedgerError::corruption(path, e))
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, value)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
