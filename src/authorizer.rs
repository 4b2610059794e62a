//! Authorization records for the settlement asset.

use crate::asset::{Amount, Asset};
use crate::error::SettlementError;
use crate::keys::{AccountId, Wallet};
use crate::ledger::{Memo, Operation};
use crate::submit::Submitter;
use std::time::Duration;
use tracing::info;

/// Outcome of [`AssetAuthorizer::authorize`]. Both variants mean the account can
/// now hold the settlement asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationReceipt {
    /// A new or updated authorization record was applied.
    Established {
        /// Transaction hash.
        hash: String,
        /// Ledger that included it.
        ledger: u32,
        /// Holding ceiling applied.
        limit: Amount,
    },
    /// The account already held an authorization record with this ceiling.
    AlreadyAuthorized {
        /// Existing ceiling.
        limit: Amount,
    },
}

/// Establishes and checks authorization to hold the settlement asset.
#[derive(Clone)]
pub struct AssetAuthorizer {
    submitter: Submitter,
    asset: Asset,
    ceiling: Amount,
    confirm: Duration,
}

impl AssetAuthorizer {
    /// Authorizer for `asset`, capping every record at `ceiling`.
    pub fn new(submitter: Submitter, asset: Asset, ceiling: Amount, confirm: Duration) -> Self {
        Self {
            submitter,
            asset,
            ceiling,
            confirm,
        }
    }

    /// Creates the authorization record for `wallet`.
    ///
    /// `max_holding` lowers the configured ceiling for this holder. Re-authorizing
    /// with an unchanged ceiling is a no-op.
    pub async fn authorize(
        &self,
        wallet: &Wallet,
        max_holding: Option<Amount>,
    ) -> Result<AuthorizationReceipt, SettlementError> {
        let limit = match max_holding {
            Some(requested) => requested.require_positive()?.min(self.ceiling),
            None => self.ceiling,
        };
        let account = self.submitter.client().load_account(wallet.identity()).await?;
        if let Some(existing) = account.balance_of(&self.asset) {
            if existing.limit == limit {
                info!(evt = "AUTH_EXISTS", account = %wallet.identity(), "already authorized");
                return Ok(AuthorizationReceipt::AlreadyAuthorized { limit });
            }
        }
        let response = self
            .submitter
            .submit(
                wallet.secret(),
                vec![Operation::ChangeTrust {
                    asset: self.asset.clone(),
                    limit,
                }],
                Memo::None,
                self.confirm,
            )
            .await?;
        info!(evt = "AUTH_ESTABLISHED", account = %wallet.identity(), hash = %response.hash, limit = %limit, "authorization record applied");
        Ok(AuthorizationReceipt::Established {
            hash: response.hash.to_string(),
            ledger: response.ledger,
            limit,
        })
    }

    /// True when `identity` holds an authorization record for the settlement asset.
    pub async fn is_authorized(&self, identity: &AccountId) -> Result<bool, SettlementError> {
        let account = self.submitter.client().load_account(identity).await?;
        Ok(account.is_authorized_for(&self.asset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Network, SettlementConfig};
    use crate::keys::KeyManager;
    use crate::ledger::{LedgerClient, MemoryLedger, ResultCodes};
    use crate::sequence::SequenceCache;
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryLedger>, AssetAuthorizer, KeyManager) {
        let keys = KeyManager::new(Network::Testnet);
        let issuer = keys.create_wallet();
        let config = SettlementConfig::new(Network::Testnet, Asset::new("FUEL", issuer.identity().clone()));
        let ledger = Arc::new(MemoryLedger::new(config.network.passphrase()));
        ledger.create_account(issuer.identity());
        let submitter = Submitter::new(LedgerClient::new(ledger.clone(), &config), Arc::new(SequenceCache::new()));
        let authorizer = AssetAuthorizer::new(
            submitter,
            config.asset.clone(),
            config.holding_ceiling,
            config.timeouts.confirm,
        );
        (ledger, authorizer, keys)
    }

    #[tokio::test]
    async fn authorizing_twice_is_harmless() {
        let (ledger, authorizer, keys) = setup();
        let wallet = keys.create_wallet();
        ledger.create_account(wallet.identity());
        assert!(!authorizer.is_authorized(wallet.identity()).await.unwrap());

        let first = authorizer.authorize(&wallet, None).await.unwrap();
        assert!(matches!(first, AuthorizationReceipt::Established { .. }));
        let second = authorizer.authorize(&wallet, None).await.unwrap();
        assert_eq!(
            second,
            AuthorizationReceipt::AlreadyAuthorized {
                limit: Amount::from_units(1_000_000_000)
            }
        );
        assert!(authorizer.is_authorized(wallet.identity()).await.unwrap());
        assert_eq!(ledger.submissions(), 1);
    }

    #[tokio::test]
    async fn requested_ceiling_never_exceeds_configuration() {
        let (ledger, authorizer, keys) = setup();
        let wallet = keys.create_wallet();
        ledger.create_account(wallet.identity());
        let receipt = authorizer
            .authorize(&wallet, Some(Amount::from_units(5_000_000_000)))
            .await
            .unwrap();
        assert!(matches!(
            receipt,
            AuthorizationReceipt::Established { limit, .. } if limit == Amount::from_units(1_000_000_000)
        ));
    }

    #[tokio::test]
    async fn stale_sequence_is_refreshed_once() {
        let (ledger, authorizer, keys) = setup();
        let wallet = keys.create_wallet();
        ledger.create_account(wallet.identity());
        ledger.inject_submit_failure(ResultCodes::tx("tx_bad_seq"));
        let receipt = authorizer.authorize(&wallet, None).await.unwrap();
        assert!(matches!(receipt, AuthorizationReceipt::Established { .. }));
        assert_eq!(ledger.submissions(), 2);
    }

    #[tokio::test]
    async fn repeated_sequence_conflicts_surface() {
        let (ledger, authorizer, keys) = setup();
        let wallet = keys.create_wallet();
        ledger.create_account(wallet.identity());
        ledger.inject_submit_failure(ResultCodes::tx("tx_bad_seq"));
        ledger.inject_submit_failure(ResultCodes::tx("tx_bad_seq"));
        let err = authorizer.authorize(&wallet, None).await.unwrap_err();
        assert_eq!(err.code(), "SEQUENCE_CONFLICT");
        assert_eq!(ledger.submissions(), 2);
    }

    #[tokio::test]
    async fn missing_accounts_are_reported() {
        let (_ledger, authorizer, keys) = setup();
        let wallet = keys.create_wallet();
        let err = authorizer.authorize(&wallet, None).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
