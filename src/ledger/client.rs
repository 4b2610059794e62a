//! Deadline- and retry-wrapped ledger client.

use super::{
    Account, HistoryPage, HistoryQuery, InvocationStatus, LedgerError, LedgerNetwork,
    SendResponse, SimulationOutcome, SubmitResponse, Transaction, TransactionEnvelope,
    TransactionRecord, TxHash,
};
use crate::config::{RetryPolicy, SettlementConfig, Timeouts};
use crate::error::SettlementError;
use crate::keys::AccountId;
use rand::Rng;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Retrying, deadline-bounded access to a [`LedgerNetwork`].
///
/// Reads and simulations are retried with exponential backoff on transient
/// failures. Submissions are attempted exactly once: a submission that fails
/// without a verdict reports [`SettlementError::Timeout`] carrying the hash so the
/// caller can reconcile instead of resubmitting.
#[derive(Clone)]
pub struct LedgerClient {
    network: Arc<dyn LedgerNetwork>,
    passphrase: String,
    timeouts: Timeouts,
    retry: RetryPolicy,
}

impl LedgerClient {
    /// Client over `network` using the deadlines and retry policy in `config`.
    pub fn new(network: Arc<dyn LedgerNetwork>, config: &SettlementConfig) -> Self {
        Self {
            network,
            passphrase: config.network.passphrase().to_string(),
            timeouts: config.timeouts,
            retry: config.retry,
        }
    }

    /// Network passphrase used for hashing and signing.
    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    /// Configured deadlines.
    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Loads an account.
    pub async fn load_account(&self, id: &AccountId) -> Result<Account, SettlementError> {
        self.with_retry("load_account", || self.network.load_account(id))
            .await
            .map_err(|err| match err {
                LedgerError::NotFound(_) => SettlementError::NotFound {
                    kind: "account",
                    id: id.to_string(),
                },
                other => other.into(),
            })
    }

    /// Looks up a transaction; `None` when the ledger has no record of it.
    pub async fn transaction_by_hash(
        &self,
        hash: &TxHash,
    ) -> Result<Option<TransactionRecord>, SettlementError> {
        match self
            .with_retry("transaction_by_hash", || self.network.transaction_by_hash(hash))
            .await
        {
            Ok(record) => Ok(Some(record)),
            Err(LedgerError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Fetches one history page.
    pub async fn account_history(
        &self,
        id: &AccountId,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, SettlementError> {
        self.with_retry("account_history", || self.network.account_history(id, query))
            .await
            .map_err(SettlementError::from)
    }

    /// Dry-runs a contract call. Safe to retry.
    pub async fn simulate(&self, tx: &Transaction) -> Result<SimulationOutcome, SettlementError> {
        self.with_retry("simulate_transaction", || self.network.simulate_transaction(tx))
            .await
            .map_err(SettlementError::from)
    }

    /// Submits a signed classic transaction once and waits up to `wait` for inclusion.
    pub async fn submit(
        &self,
        envelope: &TransactionEnvelope,
        wait: Duration,
    ) -> Result<SubmitResponse, SettlementError> {
        let hash = envelope.hash(&self.passphrase)?;
        let outcome = time::timeout(wait, self.network.submit_transaction(envelope)).await;
        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(LedgerError::Rejected(codes))) if codes.is_duplicate() => {
                debug!(evt = "SUBMIT_DUPLICATE", hash = %hash, "transaction already known");
                match self.transaction_by_hash(&hash).await? {
                    Some(record) if record.successful => Ok(SubmitResponse {
                        hash,
                        ledger: record.ledger,
                    }),
                    Some(record) => Err(record
                        .result_codes
                        .map(|codes| codes.to_error(&envelope.tx.source))
                        .unwrap_or_else(|| SettlementError::NetworkRejected("transaction failed".into()))),
                    None => Err(SettlementError::Timeout {
                        hash: Some(hash.to_string()),
                    }),
                }
            }
            Ok(Err(LedgerError::Rejected(codes))) => Err(codes.to_error(&envelope.tx.source)),
            Ok(Err(err @ (LedgerError::Malformed(_) | LedgerError::NotFound(_)))) => Err(err.into()),
            Ok(Err(err)) => {
                warn!(evt = "SUBMIT_UNKNOWN", hash = %hash, error = %err, "submission outcome unknown");
                Err(SettlementError::Timeout {
                    hash: Some(hash.to_string()),
                })
            }
            Err(_) => {
                warn!(evt = "SUBMIT_TIMEOUT", hash = %hash, wait_ms = wait.as_millis() as u64, "confirmation wait expired");
                Err(SettlementError::Timeout {
                    hash: Some(hash.to_string()),
                })
            }
        }
    }

    /// Sends an assembled contract transaction once.
    pub async fn send(&self, envelope: &TransactionEnvelope) -> Result<SendResponse, SettlementError> {
        let hash = envelope.hash(&self.passphrase)?;
        match time::timeout(self.timeouts.request, self.network.send_transaction(envelope)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(LedgerError::Rejected(codes))) => Err(codes.to_error(&envelope.tx.source)),
            Ok(Err(err @ LedgerError::Malformed(_))) => Err(err.into()),
            Ok(Err(_)) | Err(_) => Err(SettlementError::Timeout {
                hash: Some(hash.to_string()),
            }),
        }
    }

    /// Polls a sent contract transaction once.
    pub async fn invocation_status(&self, hash: &TxHash) -> Result<InvocationStatus, SettlementError> {
        match time::timeout(self.timeouts.request, self.network.transaction_status(hash)).await {
            Ok(result) => result.map_err(SettlementError::from),
            Err(_) => Err(SettlementError::Timeout { hash: None }),
        }
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let mut backoff = self.retry.backoff;
        let mut attempt = 1;
        loop {
            let result = match time::timeout(self.timeouts.request, call()).await {
                Ok(result) => result,
                Err(_) => Err(LedgerError::Timeout),
            };
            match result {
                Err(err) if err.is_transient() && attempt < self.retry.attempts => {
                    let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
                    let delay = backoff + Duration::from_millis(jitter_ms);
                    debug!(evt = "LEDGER_RETRY", op, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying ledger read");
                    time::sleep(delay).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Asset;
    use crate::config::Network;
    use crate::keys::KeyManager;
    use crate::ledger::{HistoryPage, MemoryLedger, Operation, TransactionBuilder};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyLedger {
        inner: MemoryLedger,
        failures_left: AtomicUsize,
        loads: AtomicUsize,
    }

    #[async_trait]
    impl LedgerNetwork for FlakyLedger {
        async fn load_account(&self, id: &AccountId) -> Result<Account, LedgerError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(LedgerError::Transport("connection reset".into()));
            }
            self.inner.load_account(id).await
        }
        async fn submit_transaction(
            &self,
            envelope: &TransactionEnvelope,
        ) -> Result<SubmitResponse, LedgerError> {
            self.inner.submit_transaction(envelope).await
        }
        async fn transaction_by_hash(&self, hash: &TxHash) -> Result<TransactionRecord, LedgerError> {
            self.inner.transaction_by_hash(hash).await
        }
        async fn account_history(
            &self,
            id: &AccountId,
            query: &HistoryQuery,
        ) -> Result<HistoryPage, LedgerError> {
            self.inner.account_history(id, query).await
        }
        async fn simulate_transaction(&self, tx: &Transaction) -> Result<SimulationOutcome, LedgerError> {
            self.inner.simulate_transaction(tx).await
        }
        async fn send_transaction(
            &self,
            envelope: &TransactionEnvelope,
        ) -> Result<SendResponse, LedgerError> {
            self.inner.send_transaction(envelope).await
        }
        async fn transaction_status(&self, hash: &TxHash) -> Result<InvocationStatus, LedgerError> {
            self.inner.transaction_status(hash).await
        }
    }

    fn config() -> SettlementConfig {
        let issuer = KeyManager::new(Network::Testnet).create_wallet();
        SettlementConfig::new(Network::Testnet, Asset::new("FUEL", issuer.identity().clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn transient_reads_are_retried_within_budget() {
        let config = config();
        let inner = MemoryLedger::new(config.network.passphrase());
        let wallet = KeyManager::new(Network::Testnet).create_wallet();
        inner.create_account(wallet.identity());
        let flaky = Arc::new(FlakyLedger {
            inner,
            failures_left: AtomicUsize::new(2),
            loads: AtomicUsize::new(0),
        });
        let client = LedgerClient::new(flaky.clone(), &config);
        let account = client.load_account(wallet.identity()).await.unwrap();
        assert_eq!(&account.id, wallet.identity());
        assert_eq!(flaky.loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_give_up_after_the_configured_attempts() {
        let config = config();
        let wallet = KeyManager::new(Network::Testnet).create_wallet();
        let flaky = Arc::new(FlakyLedger {
            inner: MemoryLedger::new(config.network.passphrase()),
            failures_left: AtomicUsize::new(10),
            loads: AtomicUsize::new(0),
        });
        let client = LedgerClient::new(flaky.clone(), &config);
        let err = client.load_account(wallet.identity()).await.unwrap_err();
        assert_eq!(err.code(), "TRANSPORT_ERROR");
        assert_eq!(flaky.loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unknown_accounts_are_not_found() {
        let config = config();
        let client = LedgerClient::new(Arc::new(MemoryLedger::new(config.network.passphrase())), &config);
        let wallet = KeyManager::new(Network::Testnet).create_wallet();
        let err = client.load_account(wallet.identity()).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn resubmitting_an_applied_transaction_reports_its_ledger() {
        let config = config();
        let ledger = Arc::new(MemoryLedger::new(config.network.passphrase()));
        let client = LedgerClient::new(ledger.clone(), &config);
        let wallet = KeyManager::new(Network::Testnet).create_wallet();
        ledger.create_account(wallet.identity());
        ledger.create_account(&config.asset.issuer);
        let account = client.load_account(wallet.identity()).await.unwrap();
        let tx = TransactionBuilder::new(&account)
            .operation(Operation::ChangeTrust {
                asset: config.asset.clone(),
                limit: config.holding_ceiling,
            })
            .build();
        let envelope = TransactionEnvelope::sign(tx, client.passphrase(), wallet.secret()).unwrap();
        let first = client.submit(&envelope, Duration::from_secs(5)).await.unwrap();
        let second = client.submit(&envelope, Duration::from_secs(5)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(ledger.transaction_count(), 1);
    }
}
