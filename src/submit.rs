//! Signed submission of classic transactions under the per-account queue.

use crate::error::SettlementError;
use crate::keys::SigningSecret;
use crate::ledger::{
    LedgerClient, Memo, Operation, SubmitResponse, TransactionBuilder, TransactionEnvelope,
};
use crate::sequence::{SequenceCache, SequenceLease};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

/// Builds, signs and submits transactions, one at a time per source account.
///
/// A `SequenceConflict` triggers one sequence refresh and one resubmission.
/// Any other failure drops the cached sequence so the next transaction reloads it.
#[derive(Clone)]
pub struct Submitter {
    client: LedgerClient,
    sequences: Arc<SequenceCache>,
}

impl Submitter {
    /// Submitter sharing `sequences` with every other submitter of the process.
    pub fn new(client: LedgerClient, sequences: Arc<SequenceCache>) -> Self {
        Self { client, sequences }
    }

    /// Underlying ledger client.
    pub fn client(&self) -> &LedgerClient {
        &self.client
    }

    /// Shared sequence cache.
    pub fn sequences(&self) -> &Arc<SequenceCache> {
        &self.sequences
    }

    /// Submits `operations` from the account behind `secret`, waiting up to `wait`.
    pub async fn submit(
        &self,
        secret: &SigningSecret,
        operations: Vec<Operation>,
        memo: Memo,
        wait: Duration,
    ) -> Result<SubmitResponse, SettlementError> {
        let source = secret.identity();
        let lease = self.sequences.lease(&source).await?;
        let mut sequence = lease.current(&self.client).await?;
        let mut refreshed = false;
        loop {
            let envelope = self.sign(&lease, sequence, &operations, &memo, secret, wait)?;
            let consumed = envelope.tx.sequence;
            info!(
                evt = "TX_SUBMIT",
                source = %source,
                sequence = consumed,
                ops = operations.len(),
                "submitting transaction"
            );
            match self.client.submit(&envelope, wait).await {
                Ok(response) => {
                    lease.commit(consumed);
                    info!(evt = "TX_APPLIED", hash = %response.hash, ledger = response.ledger, "transaction applied");
                    return Ok(response);
                }
                Err(SettlementError::SequenceConflict(_)) if !refreshed => {
                    refreshed = true;
                    warn!(evt = "TX_BAD_SEQ", source = %source, sequence = consumed, "stale sequence, refreshing once");
                    sequence = lease.refresh(&self.client).await?;
                }
                Err(err) => {
                    lease.invalidate();
                    warn!(evt = "TX_FAILED", source = %source, code = err.code(), error = %err, "transaction not applied");
                    return Err(err);
                }
            }
        }
    }

    fn sign(
        &self,
        lease: &SequenceLease,
        sequence: i64,
        operations: &[Operation],
        memo: &Memo,
        secret: &SigningSecret,
        wait: Duration,
    ) -> Result<TransactionEnvelope, SettlementError> {
        let tx = operations
            .iter()
            .cloned()
            .fold(
                TransactionBuilder::with_sequence(lease.account().clone(), sequence),
                TransactionBuilder::operation,
            )
            .memo(memo.clone())
            .timeout(wait)
            .build();
        Ok(TransactionEnvelope::sign(tx, self.client.passphrase(), secret)?)
    }
}
