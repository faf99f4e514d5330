//! Node orchestrator: wires configuration, the ledger, the staging store and
//! the propagation layer, and owns the cross-store operations.

use crate::config::Config;
use crate::error::{LedgerError, Result};
use crate::ledger::Ledger;
use crate::mempool::StagingStore;
use crate::peers::PeerBook;
use crate::propagation::Propagator;
use crate::replay::RevertReport;
use crate::transaction::{BasicValidator, Receipt, SignedTransaction, TransactionValidator};
use parking_lot::RwLock;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Booting,
    Recovering,
    Ready,
}

pub struct Node {
    pub config: Config,
    pub ledger: Arc<Ledger>,
    pub staging: Arc<StagingStore>,
    pub peers: Arc<PeerBook>,
    pub propagator: Propagator,
    validator: Arc<dyn TransactionValidator>,
    state: RwLock<NodeState>,
    /// Shared by staging writes, exclusive for a revert and its prune.
    staging_gate: RwLock<()>,
}

impl Node {
    /// Opens every store named by `config`, creating directories as needed.
    pub fn init(config: Config) -> Result<Self> {
        config.validate()?;
        info!(public_key = %config.node.public_key, "initializing ledger node");

        let db_path = Path::new(&config.storage.database_path);
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let ledger = Ledger::open(&config.storage.database_path)?;
        let staging = StagingStore::open(config.staging_dir(), config.mempool_dir())?;
        let peers = PeerBook::from_bootstrap(&config.network.bootstrap_peers)?;

        Self::new(
            config,
            Arc::new(ledger),
            Arc::new(staging),
            Arc::new(peers),
            Arc::new(BasicValidator),
        )
    }

    pub fn new(
        config: Config,
        ledger: Arc<Ledger>,
        staging: Arc<StagingStore>,
        peers: Arc<PeerBook>,
        validator: Arc<dyn TransactionValidator>,
    ) -> Result<Self> {
        let propagator = Propagator::from_config(&config, peers.clone())?;
        Ok(Self {
            config,
            ledger,
            staging,
            peers,
            propagator,
            validator,
            state: RwLock::new(NodeState::Booting),
            staging_gate: RwLock::new(()),
        })
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    /// Finishes a staged-file prune left behind by an interrupted revert.
    /// Returns the number of files removed.
    pub fn recover(&self) -> Result<usize> {
        *self.state.write() = NodeState::Recovering;

        let removed = {
            let _gate = self.staging_gate.write();
            match self.ledger.pending_staging_prune()? {
                Some(target) => {
                    warn!(target_index = target, "resuming interrupted staging prune");
                    self.finish_prune(target)?
                }
                None => 0,
            }
        };

        *self.state.write() = NodeState::Ready;
        Ok(removed)
    }

    /// Validates `signed` and fans it out to every known peer. Returns the
    /// number of sends dispatched.
    pub async fn submit_transaction(&self, signed: &SignedTransaction) -> Result<usize> {
        self.validator.validate(signed)?;
        let dispatched = self.propagator.propagate(signed).await?;
        info!(
            transaction_code = %signed.transaction.transaction_code,
            dispatched,
            "transaction submitted"
        );
        Ok(dispatched)
    }

    /// Receiving side of the peer wire call: validates `signed`, stages a
    /// receipt signed by this node and attaches it to every candidate block
    /// for the transaction's target index.
    pub fn receive_transaction(&self, signed: &SignedTransaction) -> Result<Receipt> {
        self.validator.validate(signed)?;

        let receipt = Receipt::for_transaction(&self.config.node.public_key, &signed.transaction)?;
        let _gate = self.staging_gate.read();
        let path = self.staging.store_receipt(&receipt)?;
        let candidates = self.staging.append_receipt_to_all_candidates(&receipt)?;

        info!(
            transaction_code = %signed.transaction.transaction_code,
            block_index = receipt.block_index(),
            path = %path.display(),
            candidates = candidates.len(),
            "receipt staged"
        );
        Ok(receipt)
    }

    /// Reverts the ledger to `target_index`, then prunes staged files above it.
    ///
    /// Receipts are not staged between the ledger commit and the prune.
    pub fn revert_chain(&self, target_index: u64) -> Result<RevertReport> {
        let _gate = self.staging_gate.write();
        let report = self.ledger.revert(target_index)?;
        self.finish_prune(target_index)?;
        Ok(report)
    }

    /// Non-blocking variant; fails with `LedgerConcurrency` if the ledger or
    /// the staging store is busy.
    pub fn try_revert_chain(&self, target_index: u64) -> Result<RevertReport> {
        let _gate = self.staging_gate.try_write().ok_or(LedgerError::LedgerConcurrency)?;
        let report = self.ledger.try_revert(target_index)?;
        self.finish_prune(target_index)?;
        Ok(report)
    }

    /// Caller holds `staging_gate` for writing.
    fn finish_prune(&self, target_index: u64) -> Result<usize> {
        let removed = self.staging.prune_above(target_index)?;
        if !self.ledger.clear_staging_prune_marker(target_index)? {
            warn!(target_index, "prune marker moved on; leaving it for its own revert");
        }
        info!(target_index, removed, "staged files above revert target pruned");
        Ok(removed)
    }

    /// Recovers, then serves the HTTP API until the listener fails.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        self.recover()?;
        info!(
            api_port = self.config.node.api_port,
            peers = self.peers.len(),
            "ledger node ready"
        );
        Self::start_api(self).await
    }

    #[cfg(feature = "api")]
    async fn start_api(node: Arc<Self>) -> Result<()> {
        crate::api::run_api_server(node).await
    }

    #[cfg(not(feature = "api"))]
    async fn start_api(_node: Arc<Self>) -> Result<()> {
        Err(crate::error::LedgerError::Config(
            "API feature not enabled in this build".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::StagedBlock;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_node(dir: &TempDir) -> Node {
        let mut config = Config::default();
        config.node.public_key = "node-pk".to_string();
        config.storage.database_path = dir.path().join("db/ledger.db").to_string_lossy().into_owned();
        config.storage.staging_dir = dir.path().join("tmp").to_string_lossy().into_owned();
        config.storage.mempool_dir = dir.path().join("mempool").to_string_lossy().into_owned();
        Node::init(config).unwrap()
    }

    fn signed(block_index: u64) -> SignedTransaction {
        serde_json::from_value(json!({
            "transaction": {
                "transaction_code": "tx-1",
                "block_index": block_index,
                "timestamp": "2024-01-01 00:00:00",
                "type": 6,
                "specific_data": {"address1": "a", "address2": "b", "new_score": 1.0}
            },
            "signatures": [{"wallet_address": "a", "msgsign": "sig"}]
        }))
        .unwrap()
    }

    #[test]
    fn test_receive_stages_receipt_and_signs_candidates() {
        let dir = TempDir::new().unwrap();
        let node = test_node(&dir);
        node.staging.store_block(&StagedBlock::new(3)).unwrap();
        node.staging.store_block(&StagedBlock::new(3)).unwrap();

        let receipt = node.receive_transaction(&signed(3)).unwrap();
        assert_eq!(receipt.public_key, "node-pk");

        assert_eq!(node.staging.list_receipts_for_block(3).unwrap().len(), 1);
        for (_, block) in node.staging.list_blocks_for_index(3).unwrap() {
            assert!(block.has_signer("node-pk"));
        }

        // same signer again leaves the candidates alone
        node.receive_transaction(&signed(3)).unwrap();
        for (_, block) in node.staging.list_blocks_for_index(3).unwrap() {
            assert_eq!(block.receipts.len(), 1);
        }
    }

    #[test]
    fn test_receive_rejects_invalid() {
        let dir = TempDir::new().unwrap();
        let node = test_node(&dir);
        let mut bad = signed(1);
        bad.transaction.transaction_code.clear();

        assert!(node.receive_transaction(&bad).is_err());
        assert!(node.staging.list_receipts_for_block(1).unwrap().is_empty());
    }

    #[test]
    fn test_recover_finishes_pending_prune() {
        let dir = TempDir::new().unwrap();
        let node = test_node(&dir);
        node.staging.store_block(&StagedBlock::new(5)).unwrap();
        node.staging.store_block(&StagedBlock::new(2)).unwrap();

        // revert committed but the process died before pruning
        node.ledger.revert(2).unwrap();
        assert_eq!(node.ledger.pending_staging_prune().unwrap(), Some(2));

        assert_eq!(node.recover().unwrap(), 1);
        assert_eq!(node.state(), NodeState::Ready);
        assert_eq!(node.ledger.pending_staging_prune().unwrap(), None);
        assert!(node.staging.list_blocks_for_index(5).unwrap().is_empty());
        assert_eq!(node.staging.list_blocks_for_index(2).unwrap().len(), 1);
    }

    #[test]
    fn test_revert_chain_clears_marker() {
        let dir = TempDir::new().unwrap();
        let node = test_node(&dir);
        node.staging.store_block(&StagedBlock::new(9)).unwrap();

        let report = node.revert_chain(0).unwrap();
        assert_eq!(report.target_index, 0);
        assert_eq!(node.ledger.pending_staging_prune().unwrap(), None);
        assert!(node.staging.list_blocks_for_index(9).unwrap().is_empty());
    }
}
