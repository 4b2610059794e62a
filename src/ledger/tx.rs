//! Transactions, envelopes and contract call values.

use super::{Account, LedgerError};
use crate::asset::{Amount, Asset};
use crate::error::SettlementError;
use crate::keys::{encode_signature_base64, verify_signature, AccountId, KeyError, SigningSecret};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Fee charged per operation, in base units of the native asset.
pub const BASE_FEE: u32 = 100;
/// Validity window of a classic transaction.
pub const DEFAULT_TX_TIMEOUT: Duration = Duration::from_secs(30);

const ENVELOPE_TYPE_TX: &[u8] = b"ENVELOPE_TYPE_TX";

/// Identifier of a deployed contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContractId(String);

impl ContractId {
    /// Wraps a contract identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Text form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Argument or return value of a contract call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ContractValue {
    /// Unit.
    Void,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    I64(i64),
    /// Unsigned 64-bit integer.
    U64(u64),
    /// Short symbol.
    Symbol(String),
    /// Account address.
    Address(AccountId),
    /// UTF-8 string.
    Str(String),
    /// Ordered list.
    Vec(Vec<ContractValue>),
}

/// One ledger operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    /// Creates or updates the source's authorization record for `asset`.
    ChangeTrust {
        /// Asset to hold.
        asset: Asset,
        /// Holding ceiling.
        limit: Amount,
    },
    /// Moves `amount` of `asset` from the source to `destination`.
    Payment {
        /// Receiving account.
        destination: AccountId,
        /// Asset moved.
        asset: Asset,
        /// Amount moved.
        amount: Amount,
    },
    /// Calls a contract function.
    InvokeContract {
        /// Target contract.
        contract: ContractId,
        /// Function name.
        function: String,
        /// Call arguments.
        args: Vec<ContractValue>,
    },
}

/// Optional transaction memo.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Memo {
    /// No memo.
    #[default]
    None,
    /// Short text used for audit correlation.
    Text(String),
}

impl Memo {
    /// Text memo bounded by `max_bytes`.
    pub fn text(text: &str, max_bytes: usize) -> Result<Memo, SettlementError> {
        if text.len() > max_bytes {
            return Err(SettlementError::MemoTooLong { max: max_bytes });
        }
        Ok(Memo::Text(text.to_string()))
    }

    /// Memo text, if any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Memo::Text(text) => Some(text),
            Memo::None => None,
        }
    }
}

/// Resources a contract call touches, computed by simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFootprint {
    /// Entries read.
    pub read_only: Vec<String>,
    /// Entries written.
    pub read_write: Vec<String>,
    /// Instruction budget.
    pub instructions: u64,
    /// Resource fee added on top of the inclusion fee.
    pub resource_fee: u32,
}

/// Unix-second validity window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBounds {
    /// Earliest acceptance time (0 = unbounded).
    pub min_time: u64,
    /// Latest acceptance time (0 = unbounded).
    pub max_time: u64,
}

impl TimeBounds {
    /// True when `now` is inside the window.
    pub fn contains(&self, now: u64) -> bool {
        now >= self.min_time && (self.max_time == 0 || now <= self.max_time)
    }
}

/// Unsigned transaction body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Source account; its sequence number is consumed.
    pub source: AccountId,
    /// Must be exactly the account's current sequence plus one.
    pub sequence: i64,
    /// Maximum fee.
    pub fee: u32,
    /// Operations, applied atomically.
    pub operations: Vec<Operation>,
    /// Memo.
    pub memo: Memo,
    /// Validity window.
    pub time_bounds: TimeBounds,
    /// Contract resources, set only on assembled contract calls.
    pub footprint: Option<ResourceFootprint>,
}

impl Transaction {
    /// Network-bound hash of this transaction.
    pub fn hash(&self, passphrase: &str) -> Result<TxHash, LedgerError> {
        let body = serde_json::to_vec(self).map_err(|err| LedgerError::Malformed(err.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(Sha256::digest(passphrase.as_bytes()));
        hasher.update(ENVELOPE_TYPE_TX);
        hasher.update(&body);
        Ok(TxHash(hex::encode(hasher.finalize())))
    }

    /// Copy carrying the simulated footprint and its resource fee.
    pub fn assemble(mut self, footprint: ResourceFootprint) -> Transaction {
        self.fee = self.fee.saturating_add(footprint.resource_fee);
        self.footprint = Some(footprint);
        self
    }
}

/// Hex transaction hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(String);

impl TxHash {
    /// Parses a 64-character hex hash.
    pub fn parse(input: &str) -> Result<Self, SettlementError> {
        let trimmed = input.trim().to_ascii_lowercase();
        if trimmed.len() != 64 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SettlementError::MalformedIdentity(format!(
                "transaction hash {input:?}"
            )));
        }
        Ok(Self(trimmed))
    }

    /// Hex text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Signature attached to an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoratedSignature {
    /// Signer identity.
    pub signer: AccountId,
    /// Base64 ed25519 signature over the hash bytes.
    pub signature: String,
}

/// Transaction plus signatures, as submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEnvelope {
    /// Body.
    pub tx: Transaction,
    /// Signatures.
    pub signatures: Vec<DecoratedSignature>,
}

impl TransactionEnvelope {
    /// Signs `tx` with `secret`. The secret is only borrowed for this call.
    pub fn sign(
        tx: Transaction,
        passphrase: &str,
        secret: &SigningSecret,
    ) -> Result<TransactionEnvelope, LedgerError> {
        let hash = tx.hash(passphrase)?;
        let signature = secret.sign(hash.as_str().as_bytes());
        Ok(TransactionEnvelope {
            tx,
            signatures: vec![DecoratedSignature {
                signer: secret.identity(),
                signature: encode_signature_base64(&signature),
            }],
        })
    }

    /// Hash of the enclosed transaction.
    pub fn hash(&self, passphrase: &str) -> Result<TxHash, LedgerError> {
        self.tx.hash(passphrase)
    }

    /// Checks that the source account signed this transaction.
    pub fn verify(&self, passphrase: &str) -> Result<TxHash, KeyError> {
        let hash = self
            .hash(passphrase)
            .map_err(|err| KeyError::Decode(err.to_string()))?;
        let source_sig = self
            .signatures
            .iter()
            .find(|sig| sig.signer == self.tx.source)
            .ok_or_else(|| KeyError::BadSignature("missing source signature".into()))?;
        verify_signature(&self.tx.source, hash.as_str().as_bytes(), &source_sig.signature)?;
        Ok(hash)
    }

    /// Base64 wire form.
    pub fn to_base64(&self) -> Result<String, LedgerError> {
        let bytes = serde_json::to_vec(self).map_err(|err| LedgerError::Malformed(err.to_string()))?;
        Ok(BASE64.encode(bytes))
    }

    /// Parses the base64 wire form.
    pub fn from_base64(input: &str) -> Result<TransactionEnvelope, LedgerError> {
        let bytes = BASE64
            .decode(input.trim())
            .map_err(|err| LedgerError::Malformed(err.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|err| LedgerError::Malformed(err.to_string()))
    }
}

/// Builds a transaction for a loaded account.
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    source: AccountId,
    sequence: i64,
    operations: Vec<Operation>,
    memo: Memo,
    timeout: Duration,
}

impl TransactionBuilder {
    /// Starts a transaction that consumes `account.sequence + 1`.
    pub fn new(account: &Account) -> Self {
        Self::with_sequence(account.id.clone(), account.sequence)
    }

    /// Starts a transaction from a cached sequence number.
    pub fn with_sequence(source: AccountId, current_sequence: i64) -> Self {
        Self {
            source,
            sequence: current_sequence.saturating_add(1),
            operations: Vec::new(),
            memo: Memo::None,
            timeout: DEFAULT_TX_TIMEOUT,
        }
    }

    /// Appends an operation.
    pub fn operation(mut self, op: Operation) -> Self {
        self.operations.push(op);
        self
    }

    /// Sets the memo.
    pub fn memo(mut self, memo: Memo) -> Self {
        self.memo = memo;
        self
    }

    /// Sets the validity window measured from now.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Finishes the transaction.
    pub fn build(self) -> Transaction {
        let ops = u32::try_from(self.operations.len()).unwrap_or(u32::MAX);
        Transaction {
            source: self.source,
            sequence: self.sequence,
            fee: BASE_FEE.saturating_mul(ops.max(1)),
            operations: self.operations,
            memo: self.memo,
            time_bounds: TimeBounds {
                min_time: 0,
                max_time: now_secs().saturating_add(self.timeout.as_secs()),
            },
            footprint: None,
        }
    }
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Network, TESTNET_PASSPHRASE};
    use crate::keys::KeyManager;

    fn sample(source: AccountId) -> Transaction {
        let issuer = KeyManager::new(Network::Testnet).create_wallet();
        TransactionBuilder::with_sequence(source, 41)
            .operation(Operation::ChangeTrust {
                asset: Asset::new("FUEL", issuer.identity().clone()),
                limit: Amount::from_units(1_000),
            })
            .memo(Memo::Text("rd:1".into()))
            .build()
    }

    #[test]
    fn builder_consumes_next_sequence() {
        let wallet = KeyManager::new(Network::Testnet).create_wallet();
        let tx = sample(wallet.identity().clone());
        assert_eq!(tx.sequence, 42);
        assert_eq!(tx.fee, BASE_FEE);
        assert!(tx.time_bounds.max_time > now_secs());
    }

    #[test]
    fn hash_depends_on_network_passphrase() {
        let wallet = KeyManager::new(Network::Testnet).create_wallet();
        let tx = sample(wallet.identity().clone());
        let test = tx.hash(TESTNET_PASSPHRASE).unwrap();
        let other = tx.hash("Standalone Network ; February 2017").unwrap();
        assert_ne!(test, other);
        assert_eq!(test.as_str().len(), 64);
    }

    #[test]
    fn envelope_verifies_and_survives_the_wire() {
        let wallet = KeyManager::new(Network::Testnet).create_wallet();
        let tx = sample(wallet.identity().clone());
        let envelope = TransactionEnvelope::sign(tx, TESTNET_PASSPHRASE, wallet.secret()).unwrap();
        let decoded = TransactionEnvelope::from_base64(&envelope.to_base64().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert!(decoded.verify(TESTNET_PASSPHRASE).is_ok());

        let mut tampered = decoded;
        tampered.tx.sequence += 1;
        assert!(tampered.verify(TESTNET_PASSPHRASE).is_err());
    }

    #[test]
    fn envelope_signed_by_another_key_is_refused() {
        let manager = KeyManager::new(Network::Testnet);
        let owner = manager.create_wallet();
        let intruder = manager.create_wallet();
        let tx = sample(owner.identity().clone());
        let envelope = TransactionEnvelope::sign(tx, TESTNET_PASSPHRASE, intruder.secret()).unwrap();
        assert!(envelope.verify(TESTNET_PASSPHRASE).is_err());
    }

    #[test]
    fn memo_text_is_bounded() {
        assert!(Memo::text("short", 28).is_ok());
        assert_eq!(
            Memo::text(&"x".repeat(29), 28).unwrap_err(),
            SettlementError::MemoTooLong { max: 28 }
        );
    }

    #[test]
    fn assembling_adds_resource_fee() {
        let wallet = KeyManager::new(Network::Testnet).create_wallet();
        let tx = sample(wallet.identity().clone()).assemble(ResourceFootprint {
            read_only: vec!["c".into()],
            read_write: vec![],
            instructions: 10,
            resource_fee: 5_000,
        });
        assert_eq!(tx.fee, BASE_FEE + 5_000);
        assert!(tx.footprint.is_some());
    }
}
