//! Minting and transfer of the settlement asset.

use crate::asset::{Amount, Asset};
use crate::config::SettlementConfig;
use crate::error::SettlementError;
use crate::keys::{AccountId, SigningSecret};
use crate::ledger::{LedgerClient, Memo, Operation, TxHash};
use crate::submit::Submitter;
use std::time::Duration;
use tracing::info;

/// Confirmation of an applied payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    /// Transaction hash.
    pub hash: TxHash,
    /// Ledger that included it.
    pub ledger: u32,
    /// Paying account.
    pub from: AccountId,
    /// Receiving account.
    pub to: AccountId,
    /// Amount moved.
    pub amount: Amount,
    /// Memo attached, if any.
    pub memo: Option<String>,
}

/// Ledger view of a previously submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// Included and applied.
    Applied {
        /// Ledger that included it.
        ledger: u32,
        /// Memo it carried.
        memo: Option<String>,
    },
    /// Included but its operations failed.
    Failed {
        /// Ledger-reported detail.
        detail: String,
    },
    /// The ledger has no record of it.
    Unknown,
}

/// Builds, signs, submits and confirms payments of the settlement asset.
#[derive(Clone)]
pub struct TransferEngine {
    submitter: Submitter,
    asset: Asset,
    distributor: Option<SigningSecret>,
    confirm: Duration,
    memo_max_bytes: usize,
}

impl TransferEngine {
    /// Engine configured from `config`. Mints need `config.distributor_secret`.
    pub fn new(submitter: Submitter, config: &SettlementConfig) -> Self {
        Self {
            submitter,
            asset: config.asset.clone(),
            distributor: config.distributor_secret.clone(),
            confirm: config.timeouts.confirm,
            memo_max_bytes: config.memo_max_bytes,
        }
    }

    /// Settlement asset moved by this engine.
    pub fn asset(&self) -> &Asset {
        &self.asset
    }

    /// Ledger client behind the submitter.
    pub fn client(&self) -> &LedgerClient {
        self.submitter.client()
    }

    /// How long a payment waits for confirmation; also its validity window.
    pub fn validity(&self) -> Duration {
        self.confirm
    }

    /// Identity of the distributor wallet, when configured.
    pub fn distributor(&self) -> Option<AccountId> {
        self.distributor.as_ref().map(SigningSecret::identity)
    }

    /// Spendable settlement balance of `identity`.
    pub async fn balance_of(&self, identity: &AccountId) -> Result<Amount, SettlementError> {
        let account = self.submitter.client().load_account(identity).await?;
        Ok(account.available(&self.asset))
    }

    /// Pays `amount` from the account behind `from` to `to`.
    ///
    /// A `Timeout` error carries the transaction hash: the payment may still have
    /// applied and must be looked up before any retry.
    pub async fn transfer(
        &self,
        from: &SigningSecret,
        to: &AccountId,
        amount: Amount,
        memo: Option<&str>,
    ) -> Result<TransferReceipt, SettlementError> {
        let amount = amount.require_positive()?;
        let memo_value = match memo {
            Some(text) => Memo::text(text, self.memo_max_bytes)?,
            None => Memo::None,
        };
        let source = from.identity();
        let response = self
            .submitter
            .submit(
                from,
                vec![Operation::Payment {
                    destination: to.clone(),
                    asset: self.asset.clone(),
                    amount,
                }],
                memo_value,
                self.confirm,
            )
            .await?;
        info!(
            evt = "TRANSFER_CONFIRMED",
            hash = %response.hash,
            from = %source,
            to = %to,
            amount = %amount,
            "payment applied"
        );
        Ok(TransferReceipt {
            hash: response.hash,
            ledger: response.ledger,
            from: source,
            to: to.clone(),
            amount,
            memo: memo.map(str::to_string),
        })
    }

    /// Issues `amount` to `to` from the distributor wallet.
    pub async fn mint(&self, to: &AccountId, amount: Amount) -> Result<TransferReceipt, SettlementError> {
        self.mint_with_memo(to, amount, None).await
    }

    /// [`TransferEngine::mint`] with an audit memo.
    pub async fn mint_with_memo(
        &self,
        to: &AccountId,
        amount: Amount,
        memo: Option<&str>,
    ) -> Result<TransferReceipt, SettlementError> {
        let distributor = self
            .distributor
            .as_ref()
            .ok_or_else(|| SettlementError::Config("no distributor secret configured".into()))?;
        info!(evt = "MINT_SUBMIT", to = %to, amount = %amount, "minting settlement asset");
        self.transfer(distributor, to, amount, memo).await
    }

    /// Looks up a submitted transaction by hash.
    pub async fn lookup(&self, hash: &TxHash) -> Result<TransferStatus, SettlementError> {
        Ok(match self.submitter.client().transaction_by_hash(hash).await? {
            Some(record) if record.successful => TransferStatus::Applied {
                ledger: record.ledger,
                memo: record.memo.as_text().map(str::to_string),
            },
            Some(record) => TransferStatus::Failed {
                detail: record
                    .result_codes
                    .map(|codes| codes.to_string())
                    .unwrap_or_else(|| "transaction failed".into()),
            },
            None => TransferStatus::Unknown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorizer::AssetAuthorizer;
    use crate::config::Network;
    use crate::keys::{KeyManager, Wallet};
    use crate::ledger::{LedgerClient, MemoryLedger, StallMode};
    use crate::sequence::SequenceCache;
    use std::sync::Arc;

    struct Harness {
        ledger: Arc<MemoryLedger>,
        engine: TransferEngine,
        authorizer: AssetAuthorizer,
        keys: KeyManager,
    }

    fn harness(confirm: Duration) -> Harness {
        let keys = KeyManager::new(Network::Testnet);
        let issuer = keys.create_wallet();
        let mut config = SettlementConfig::new(Network::Testnet, Asset::new("FUEL", issuer.identity().clone()))
            .with_distributor(issuer.secret().clone());
        config.timeouts.confirm = confirm;
        let ledger = Arc::new(MemoryLedger::new(config.network.passphrase()));
        ledger.create_account(issuer.identity());
        let submitter = Submitter::new(LedgerClient::new(ledger.clone(), &config), Arc::new(SequenceCache::new()));
        Harness {
            authorizer: AssetAuthorizer::new(
                submitter.clone(),
                config.asset.clone(),
                config.holding_ceiling,
                confirm,
            ),
            engine: TransferEngine::new(submitter, &config),
            ledger,
            keys,
        }
    }

    async fn holder(h: &Harness) -> Wallet {
        let wallet = h.keys.create_wallet();
        h.ledger.create_account(wallet.identity());
        h.authorizer.authorize(&wallet, None).await.unwrap();
        wallet
    }

    #[tokio::test]
    async fn mint_then_full_transfer_is_ordered() {
        let h = harness(Duration::from_secs(30));
        let fleet = holder(&h).await;
        let driver = holder(&h).await;
        let amount = Amount::from_units(250);

        let minted = h.engine.mint(fleet.identity(), amount).await.unwrap();
        let moved = h
            .engine
            .transfer(fleet.secret(), driver.identity(), amount, Some("alloc"))
            .await
            .unwrap();
        assert!(moved.ledger > minted.ledger);
        assert_eq!(h.ledger.balance(fleet.identity(), h.engine.asset()), Amount::ZERO);
        assert_eq!(h.ledger.balance(driver.identity(), h.engine.asset()), amount);
    }

    #[tokio::test]
    async fn concurrent_transfers_from_one_wallet_queue() {
        let h = harness(Duration::from_secs(30));
        let payer = holder(&h).await;
        let payee = holder(&h).await;
        h.engine.mint(payer.identity(), Amount::from_units(10)).await.unwrap();

        let transfers = (0..5).map(|_| {
            h.engine
                .transfer(payer.secret(), payee.identity(), Amount::from_units(2), None)
        });
        let results = futures::future::join_all(transfers).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(h.ledger.balance(payee.identity(), h.engine.asset()), Amount::from_units(10));
    }

    #[tokio::test]
    async fn underfunded_and_unauthorized_payments_are_classified() {
        let h = harness(Duration::from_secs(30));
        let payer = holder(&h).await;
        let stranger = h.keys.create_wallet();
        h.ledger.create_account(stranger.identity());

        let err = h
            .engine
            .transfer(payer.secret(), stranger.identity(), Amount::from_units(1), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_BALANCE");

        h.engine.mint(payer.identity(), Amount::from_units(5)).await.unwrap();
        let err = h
            .engine
            .transfer(payer.secret(), stranger.identity(), Amount::from_units(1), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED_ASSET");
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_submission() {
        let h = harness(Duration::from_secs(30));
        let payer = holder(&h).await;
        let before = h.ledger.submissions();
        let err = h
            .engine
            .transfer(payer.secret(), payer.identity(), Amount::ZERO, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");
        let err = h
            .engine
            .transfer(payer.secret(), payer.identity(), Amount::from_units(1), Some(&"m".repeat(40)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MEMO_TOO_LONG");
        assert_eq!(h.ledger.submissions(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_carry_a_hash_that_can_be_looked_up() {
        let h = harness(Duration::from_secs(30));
        let driver = holder(&h).await;
        h.ledger.stall_submissions(Some(StallMode::ApplyThenHang));
        let err = h.engine.mint(driver.identity(), Amount::from_units(3)).await.unwrap_err();
        let hash = TxHash::parse(err.unresolved_hash().expect("hash on timeout")).unwrap();
        assert_eq!(err.code(), "TIMEOUT");
        h.ledger.stall_submissions(None);
        assert!(matches!(h.engine.lookup(&hash).await.unwrap(), TransferStatus::Applied { .. }));

        // The cache was dropped on timeout, so the next mint reloads the sequence.
        h.engine.mint(driver.identity(), Amount::from_units(1)).await.unwrap();
        assert_eq!(h.ledger.balance(driver.identity(), h.engine.asset()), Amount::from_units(4));
    }

    #[tokio::test]
    async fn mint_requires_a_distributor() {
        let keys = KeyManager::new(Network::Testnet);
        let issuer = keys.create_wallet();
        let config = SettlementConfig::new(Network::Testnet, Asset::new("FUEL", issuer.identity().clone()));
        let ledger = Arc::new(MemoryLedger::new(config.network.passphrase()));
        let submitter = Submitter::new(LedgerClient::new(ledger, &config), Arc::new(SequenceCache::new()));
        let engine = TransferEngine::new(submitter, &config);
        let err = engine.mint(issuer.identity(), Amount::from_units(1)).await.unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
