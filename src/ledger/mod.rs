//! Ledger network access.
//!
//! [`LedgerNetwork`] is the seam to the external ledger: account loads, classic
//! submission, transaction lookup, paged history and the contract
//! simulate/send/status calls. [`LedgerClient`] wraps any implementation with
//! deadlines and bounded read retries. [`MemoryLedger`] is the in-process
//! implementation; `HorizonTransport` (feature `net`) talks HTTP.

pub mod client;
#[cfg(feature = "net")]
pub mod horizon;
pub mod memory;
pub mod tx;

pub use client::LedgerClient;
#[cfg(feature = "net")]
pub use horizon::HorizonTransport;
pub use memory::{ContractCallContext, MemoryLedger, StallMode};
pub use tx::{
    ContractId, ContractValue, Memo, Operation, ResourceFootprint, Transaction,
    TransactionBuilder, TransactionEnvelope, TxHash,
};

use crate::asset::{Amount, Asset, Balance};
use crate::error::SettlementError;
use crate::keys::AccountId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Network-observed projection of a wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account identity.
    pub id: AccountId,
    /// Last consumed sequence number.
    pub sequence: i64,
    /// Non-native balances, one per authorization record.
    pub balances: Vec<Balance>,
}

impl Account {
    /// Balance entry for `asset`.
    pub fn balance_of(&self, asset: &Asset) -> Option<&Balance> {
        self.balances.iter().find(|b| &b.asset == asset)
    }

    /// Spendable amount of `asset` (zero without an authorization record).
    pub fn available(&self, asset: &Asset) -> Amount {
        self.balance_of(asset).map(|b| b.amount).unwrap_or(Amount::ZERO)
    }

    /// True when the account may hold `asset`.
    pub fn is_authorized_for(&self, asset: &Asset) -> bool {
        self.balance_of(asset).is_some()
    }
}

/// Result codes of a refused transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultCodes {
    /// Transaction-level code, e.g. `tx_bad_seq` or `tx_failed`.
    pub tx_code: String,
    /// Per-operation codes, e.g. `op_underfunded`.
    pub op_codes: Vec<String>,
}

impl ResultCodes {
    /// Transaction-level refusal with no operation codes.
    pub fn tx(code: &str) -> Self {
        Self {
            tx_code: code.to_string(),
            op_codes: Vec::new(),
        }
    }

    /// `tx_failed` with the given operation codes.
    pub fn failed(op_codes: Vec<String>) -> Self {
        Self {
            tx_code: "tx_failed".to_string(),
            op_codes,
        }
    }

    fn has(&self, codes: &[&str]) -> bool {
        codes.contains(&self.tx_code.as_str())
            || self.op_codes.iter().any(|code| codes.contains(&code.as_str()))
    }

    /// True when the ledger already holds this exact transaction.
    pub fn is_duplicate(&self) -> bool {
        self.tx_code == "tx_duplicate"
    }

    /// Maps the codes onto the caller-facing taxonomy.
    pub fn to_error(&self, source: &AccountId) -> SettlementError {
        if self.tx_code == "tx_bad_seq" {
            return SettlementError::SequenceConflict(source.to_string());
        }
        if self.has(&["op_underfunded", "tx_insufficient_balance"]) {
            return SettlementError::InsufficientBalance(self.to_string());
        }
        if self.has(&[
            "op_no_trust",
            "op_not_authorized",
            "op_no_destination",
            "op_src_no_trust",
            "op_src_not_authorized",
        ]) {
            return SettlementError::UnauthorizedAsset(self.to_string());
        }
        SettlementError::NetworkRejected(self.to_string())
    }
}

impl fmt::Display for ResultCodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.op_codes.is_empty() {
            f.write_str(&self.tx_code)
        } else {
            write!(f, "{} [{}]", self.tx_code, self.op_codes.join(", "))
        }
    }
}

/// Failure reported by a [`LedgerNetwork`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("transport failure: {0}")]
    /// Connection-level failure.
    Transport(String),
    #[error("request timed out")]
    /// Deadline exceeded.
    Timeout,
    #[error("ledger unavailable: {0}")]
    /// Gateway is up but cannot serve (rate limit, maintenance).
    Unavailable(String),
    #[error("{0} not found")]
    /// Unknown account or transaction.
    NotFound(String),
    #[error("transaction refused: {0}")]
    /// The ledger evaluated and refused the transaction.
    Rejected(ResultCodes),
    #[error("malformed ledger payload: {0}")]
    /// Response or request could not be decoded.
    Malformed(String),
}

impl LedgerError {
    /// True for failures where repeating a read may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::Transport(_) | LedgerError::Timeout | LedgerError::Unavailable(_)
        )
    }
}

impl From<LedgerError> for SettlementError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Transport(detail) | LedgerError::Unavailable(detail) => {
                SettlementError::Transport(detail)
            }
            LedgerError::Timeout => SettlementError::Timeout { hash: None },
            LedgerError::NotFound(id) => SettlementError::NotFound {
                kind: "ledger entry",
                id,
            },
            LedgerError::Rejected(codes) => SettlementError::NetworkRejected(codes.to_string()),
            LedgerError::Malformed(detail) => {
                SettlementError::NetworkRejected(format!("malformed payload: {detail}"))
            }
        }
    }
}

/// Acknowledgement of an applied classic transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// Transaction hash.
    pub hash: TxHash,
    /// Ledger that included it.
    pub ledger: u32,
}

/// Ledger record of an included transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Hash.
    pub hash: TxHash,
    /// Source account.
    pub source: AccountId,
    /// Ledger that included it.
    pub ledger: u32,
    /// False when included but its operations failed.
    pub successful: bool,
    /// Memo.
    pub memo: Memo,
    /// Cursor for history paging.
    pub paging_token: String,
    /// Close time, Unix seconds.
    pub created_at: u64,
    /// Operations.
    pub operations: Vec<Operation>,
    /// Failure codes when `successful` is false.
    pub result_codes: Option<ResultCodes>,
}

/// History ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    /// Oldest first.
    Asc,
    /// Newest first.
    #[default]
    Desc,
}

impl Order {
    /// Query-string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Order::Asc => "asc",
            Order::Desc => "desc",
        }
    }
}

/// One history page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Resume after this paging token.
    pub cursor: Option<String>,
    /// Page size.
    pub limit: usize,
    /// Ordering.
    pub order: Order,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            cursor: None,
            limit: 10,
            order: Order::Desc,
        }
    }
}

/// One history page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HistoryPage {
    /// Records in the requested order.
    pub records: Vec<TransactionRecord>,
    /// Cursor of the next page; `None` once exhausted.
    pub next_cursor: Option<String>,
}

/// Result of a non-committing contract dry-run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulationOutcome {
    /// The call would succeed.
    Ok {
        /// Value the call would return.
        result: ContractValue,
        /// Resources to attach when assembling.
        footprint: ResourceFootprint,
        /// Ledger the simulation ran against.
        latest_ledger: u32,
    },
    /// The contract or host refused the call.
    Rejected {
        /// Contract-level error detail.
        detail: String,
    },
}

/// Immediate status returned by `send_transaction`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    /// Accepted for inclusion; poll by hash.
    Pending,
    /// Already known to the network; poll by hash.
    Duplicate,
    /// Not accepted right now; nothing was queued.
    TryAgainLater,
    /// Refused before queueing.
    Error(ResultCodes),
}

/// Response to `send_transaction`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResponse {
    /// Hash of the sent transaction.
    pub hash: TxHash,
    /// Status.
    pub status: SendStatus,
}

/// Status of a sent contract transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationStatus {
    /// Not yet included (or unknown).
    NotFound,
    /// Included and succeeded.
    Success {
        /// Contract return value.
        result: ContractValue,
        /// Ledger that included it.
        ledger: u32,
    },
    /// Included and failed.
    Failed {
        /// Ledger-reported detail.
        detail: String,
    },
}

/// Operations the settlement core needs from the ledger network.
#[async_trait]
pub trait LedgerNetwork: Send + Sync {
    /// Loads an account's sequence number and balances.
    async fn load_account(&self, id: &AccountId) -> Result<Account, LedgerError>;

    /// Submits a classic transaction and waits for its inclusion.
    async fn submit_transaction(
        &self,
        envelope: &TransactionEnvelope,
    ) -> Result<SubmitResponse, LedgerError>;

    /// Looks up an included transaction.
    async fn transaction_by_hash(&self, hash: &TxHash) -> Result<TransactionRecord, LedgerError>;

    /// Pages through transactions touching `id`.
    async fn account_history(
        &self,
        id: &AccountId,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, LedgerError>;

    /// Dry-runs a contract call.
    async fn simulate_transaction(&self, tx: &Transaction) -> Result<SimulationOutcome, LedgerError>;

    /// Sends an assembled contract transaction without waiting for inclusion.
    async fn send_transaction(
        &self,
        envelope: &TransactionEnvelope,
    ) -> Result<SendResponse, LedgerError>;

    /// Polls a sent contract transaction.
    async fn transaction_status(&self, hash: &TxHash) -> Result<InvocationStatus, LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Network;
    use crate::keys::KeyManager;

    fn codes(tx: &str, ops: &[&str]) -> ResultCodes {
        ResultCodes {
            tx_code: tx.into(),
            op_codes: ops.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn result_codes_map_onto_the_taxonomy() {
        let source = KeyManager::new(Network::Testnet).create_wallet().identity().clone();
        assert_eq!(
            codes("tx_bad_seq", &[]).to_error(&source).code(),
            "SEQUENCE_CONFLICT"
        );
        assert_eq!(
            codes("tx_failed", &["op_underfunded"]).to_error(&source).code(),
            "INSUFFICIENT_BALANCE"
        );
        assert_eq!(
            codes("tx_failed", &["op_no_trust"]).to_error(&source).code(),
            "UNAUTHORIZED_ASSET"
        );
        let full = codes("tx_failed", &["op_line_full"]).to_error(&source);
        assert_eq!(full.code(), "NETWORK_REJECTED");
        assert!(full.to_string().contains("op_line_full"));
    }

    #[test]
    fn only_connectivity_failures_are_transient() {
        assert!(LedgerError::Timeout.is_transient());
        assert!(LedgerError::Unavailable("429".into()).is_transient());
        assert!(!LedgerError::NotFound("tx".into()).is_transient());
        assert!(!LedgerError::Rejected(ResultCodes::tx("tx_bad_seq")).is_transient());
    }
}
