//! Credits from external (mobile-money) payments.

use crate::asset::Amount;
use crate::error::SettlementError;
use crate::keys::AccountId;
use crate::ledger::tx::now_secs;
use crate::ledger::TxHash;
use crate::sequence::KeyedLocks;
use crate::store::SettlementStore;
use crate::transfer::{TransferEngine, TransferStatus};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

/// Whether the credit for a payment is known to have applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CreditStatus {
    /// Mint applied.
    Credited {
        /// Ledger that included it.
        ledger: u32,
    },
    /// Mint submitted with no verdict yet.
    Unconfirmed,
}

/// Journal entry of one processed external payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditReceipt {
    /// External reference; unique per payment.
    pub reference: String,
    /// Payer identity as reported by the gateway.
    pub payer: String,
    /// Wallet credited.
    pub wallet: AccountId,
    /// Amount paid, in gateway units.
    pub paid: Amount,
    /// Settlement amount minted.
    pub credited: Amount,
    /// Mint transaction hash.
    pub tx_hash: String,
    /// Mint status.
    pub status: CreditStatus,
    /// Unix seconds.
    pub recorded_at: u64,
}

/// Turns confirmed external payments into settlement credit, once per reference.
pub struct PaymentIngress {
    store: Arc<dyn SettlementStore>,
    transfers: TransferEngine,
    rate: Amount,
    references: KeyedLocks<String>,
}

impl PaymentIngress {
    /// Ingress converting at `rate` settlement units per payment unit.
    pub fn new(store: Arc<dyn SettlementStore>, transfers: TransferEngine, rate: Amount) -> Self {
        Self {
            store,
            transfers,
            rate,
            references: KeyedLocks::new(),
        }
    }

    /// Mints credit for a confirmed payment.
    ///
    /// A reference seen before returns its original receipt without minting.
    /// One whose mint timed out is looked up first; `ReconciliationRequired`
    /// while the ledger still has no record of it.
    pub async fn credit_from_external_payment(
        &self,
        payer: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<CreditReceipt, SettlementError> {
        let amount = amount.require_positive()?;
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(SettlementError::MalformedIdentity("empty payment reference".into()));
        }
        let _guard = self.references.lock(&reference.to_string()).await?;

        if let Some(existing) = self.store.credit_receipt(reference).await? {
            match self.settle_previous(existing).await? {
                Some(receipt) => return Ok(receipt),
                None => warn!(evt = "INGRESS_REMINT", reference, "previous mint failed, minting again"),
            }
        }

        let wallet = self
            .store
            .resolve_payer(payer)
            .await?
            .ok_or_else(|| SettlementError::NotFound {
                kind: "payer",
                id: payer.to_string(),
            })?;
        let credited = amount
            .scale(self.rate)
            .ok_or_else(|| SettlementError::InvalidAmount("credit overflows".into()))?
            .require_positive()?;
        let mut receipt = CreditReceipt {
            reference: reference.to_string(),
            payer: payer.to_string(),
            wallet: wallet.clone(),
            paid: amount,
            credited,
            tx_hash: String::new(),
            status: CreditStatus::Unconfirmed,
            recorded_at: now_secs(),
        };
        match self
            .transfers
            .mint_with_memo(&wallet, credited, Some(&reference_memo(reference)))
            .await
        {
            Ok(minted) => {
                receipt.tx_hash = minted.hash.to_string();
                receipt.status = CreditStatus::Credited { ledger: minted.ledger };
                self.store.record_credit(&receipt).await?;
                info!(evt = "INGRESS_CREDITED", reference, wallet = %wallet, amount = %credited, "external payment credited");
                Ok(receipt)
            }
            Err(err) => {
                if let Some(hash) = err.unresolved_hash() {
                    receipt.tx_hash = hash.to_string();
                    self.store.record_credit(&receipt).await?;
                    warn!(evt = "INGRESS_UNCONFIRMED", reference, hash, "mint outcome unknown");
                }
                Err(err)
            }
        }
    }

    async fn settle_previous(&self, mut existing: CreditReceipt) -> Result<Option<CreditReceipt>, SettlementError> {
        if let CreditStatus::Credited { .. } = existing.status {
            info!(evt = "INGRESS_REPLAY", reference = %existing.reference, "reference already credited");
            return Ok(Some(existing));
        }
        match confirm_mint(&self.transfers, &existing).await? {
            Some(ledger) => {
                existing.status = CreditStatus::Credited { ledger };
                self.store.record_credit(&existing).await?;
                Ok(Some(existing))
            }
            None => Ok(None),
        }
    }
}

/// Ledger of an unconfirmed mint once it applied; `None` when it failed.
///
/// `ReconciliationRequired` while the ledger has no record of it.
pub(crate) async fn confirm_mint(
    transfers: &TransferEngine,
    receipt: &CreditReceipt,
) -> Result<Option<u32>, SettlementError> {
    let hash = TxHash::parse(&receipt.tx_hash)?;
    match transfers.lookup(&hash).await? {
        TransferStatus::Applied { ledger, .. } => Ok(Some(ledger)),
        TransferStatus::Failed { .. } => Ok(None),
        TransferStatus::Unknown => Err(SettlementError::ReconciliationRequired {
            hash: receipt.tx_hash.clone(),
        }),
    }
}

/// Memo tagging a mint with its payment reference (`in:` + 16 hex digits).
pub fn reference_memo(reference: &str) -> String {
    let digest = Sha256::digest(reference.as_bytes());
    format!("in:{}", hex::encode(&digest[..8]))
}
