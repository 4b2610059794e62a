//! Fleet purchases and allocation to drivers.

use crate::asset::Amount;
use crate::error::SettlementError;
use crate::ingress::{confirm_mint, reference_memo, CreditReceipt, CreditStatus};
use crate::ledger::tx::now_secs;
use crate::limits::{DenialReason, FleetBudget};
use crate::model::{DriverId, Fleet, FleetId};
use crate::sequence::KeyedLocks;
use crate::store::SettlementStore;
use crate::transfer::{TransferEngine, TransferReceipt};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Memo attached to allocations.
pub const ALLOCATION_MEMO: &str = "alloc";

/// Result of [`FleetFunding::purchase`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetPurchase {
    /// Journal entry of the mint into the fleet wallet.
    pub receipt: CreditReceipt,
    /// Budget after crediting.
    pub budget: FleetBudget,
}

/// Result of [`FleetFunding::distribute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distribution {
    /// Transfer to the driver wallet.
    pub receipt: TransferReceipt,
    /// True when the budget was charged now rather than at redemption.
    pub charged: bool,
    /// Budget after the allocation.
    pub budget: FleetBudget,
}

/// Buys settlement credit for fleets and hands it to drivers.
pub struct FleetFunding {
    store: Arc<dyn SettlementStore>,
    transfers: TransferEngine,
    fleets: Arc<KeyedLocks<FleetId>>,
}

impl FleetFunding {
    /// Funding service over `store`.
    pub fn new(store: Arc<dyn SettlementStore>, transfers: TransferEngine) -> Self {
        Self {
            store,
            transfers,
            fleets: Arc::new(KeyedLocks::new()),
        }
    }

    /// Per-fleet locks guarding budget changes.
    ///
    /// Hand them to [`RedemptionCoordinator::with_fleet_locks`] so allocations
    /// and redemptions of one fleet never interleave.
    ///
    /// [`RedemptionCoordinator::with_fleet_locks`]: crate::redemption::RedemptionCoordinator::with_fleet_locks
    pub fn fleet_locks(&self) -> Arc<KeyedLocks<FleetId>> {
        Arc::clone(&self.fleets)
    }

    async fn fleet(&self, id: &FleetId) -> Result<Fleet, SettlementError> {
        self.store.load_fleet(id).await?.ok_or_else(|| SettlementError::NotFound {
            kind: "fleet",
            id: id.to_string(),
        })
    }

    /// Mints `amount` into the fleet wallet, then credits the fleet budget.
    ///
    /// The budget grows only once the mint is confirmed, and at most once per
    /// `reference`. A repeated reference returns the journaled purchase. One
    /// whose mint timed out is looked up first: credited when it applied,
    /// minted again when it failed, `ReconciliationRequired` while the ledger
    /// has no record of it.
    pub async fn purchase(
        &self,
        fleet_id: &FleetId,
        amount: Amount,
        reference: &str,
    ) -> Result<FleetPurchase, SettlementError> {
        let amount = amount.require_positive()?;
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(SettlementError::MalformedIdentity("empty purchase reference".into()));
        }
        let _guard = self.fleets.lock(fleet_id).await?;
        let fleet = self.fleet(fleet_id).await?;
        let key = purchase_key(fleet_id, reference);

        if let Some(mut existing) = self.store.credit_receipt(&key).await? {
            match existing.status {
                CreditStatus::Credited { .. } => {
                    info!(evt = "FLEET_PURCHASE_REPLAY", fleet = %fleet_id, reference, "purchase already credited");
                    return Ok(FleetPurchase {
                        receipt: existing,
                        budget: fleet.budget,
                    });
                }
                CreditStatus::Unconfirmed => match confirm_mint(&self.transfers, &existing).await? {
                    Some(ledger) => {
                        existing.status = CreditStatus::Credited { ledger };
                        return self.credit(fleet_id, existing).await;
                    }
                    None => warn!(evt = "FLEET_PURCHASE_REMINT", fleet = %fleet_id, reference, "previous mint failed, minting again"),
                },
            }
        }

        let mut receipt = CreditReceipt {
            reference: key,
            payer: fleet_id.to_string(),
            wallet: fleet.wallet.clone(),
            paid: amount,
            credited: amount,
            tx_hash: String::new(),
            status: CreditStatus::Unconfirmed,
            recorded_at: now_secs(),
        };
        match self
            .transfers
            .mint_with_memo(&fleet.wallet, amount, Some(&reference_memo(reference)))
            .await
        {
            Ok(minted) => {
                receipt.tx_hash = minted.hash.to_string();
                receipt.status = CreditStatus::Credited { ledger: minted.ledger };
                self.credit(fleet_id, receipt).await
            }
            Err(err) => {
                if let Some(hash) = err.unresolved_hash() {
                    receipt.tx_hash = hash.to_string();
                    self.store.record_credit(&receipt).await?;
                    warn!(evt = "FLEET_PURCHASE_UNCONFIRMED", fleet = %fleet_id, reference, hash, "mint outcome unknown");
                }
                Err(err)
            }
        }
    }

    async fn credit(&self, fleet_id: &FleetId, receipt: CreditReceipt) -> Result<FleetPurchase, SettlementError> {
        let budget = self.store.apply_fleet_purchase(fleet_id, &receipt).await?;
        info!(
            evt = "FLEET_PURCHASE",
            fleet = %fleet_id,
            amount = %receipt.credited,
            remaining = %budget.remaining(),
            hash = %receipt.tx_hash,
            "fleet budget credited"
        );
        Ok(FleetPurchase { receipt, budget })
    }

    /// Moves `amount` from the fleet wallet to a driver.
    ///
    /// Drivers attached to the fleet are charged against the budget when they
    /// redeem; anyone else is charged here.
    pub async fn distribute(
        &self,
        fleet_id: &FleetId,
        driver_id: &DriverId,
        amount: Amount,
    ) -> Result<Distribution, SettlementError> {
        let amount = amount.require_positive()?;
        let _guard = self.fleets.lock(fleet_id).await?;
        let fleet = self.fleet(fleet_id).await?;
        let driver = self
            .store
            .load_driver(driver_id)
            .await?
            .ok_or_else(|| SettlementError::NotFound {
                kind: "driver",
                id: driver_id.to_string(),
            })?;
        if !driver.active {
            return Err(SettlementError::DriverInactive(driver_id.to_string()));
        }
        if amount > fleet.budget.remaining() {
            return Err(SettlementError::Denied(DenialReason::ExceedsFleetBudget));
        }
        let secret = self
            .store
            .signing_secret(&fleet.wallet)
            .await?
            .ok_or_else(|| SettlementError::Key(format!("no signing secret for fleet {fleet_id}")))?;
        let receipt = self
            .transfers
            .transfer(&secret, &driver.wallet, amount, Some(ALLOCATION_MEMO))
            .await?;
        drop(secret);

        let attached = driver.fleet.as_ref() == Some(fleet_id);
        let budget = if attached {
            fleet.budget
        } else {
            match self.store.charge_fleet_budget(fleet_id, amount).await {
                Ok(budget) => budget,
                Err(err) => {
                    error!(evt = "FLEET_CHARGE_FAILED", fleet = %fleet_id, hash = %receipt.hash, error = %err, "allocation applied but budget not charged");
                    return Err(err);
                }
            }
        };
        info!(
            evt = "FLEET_DISTRIBUTE",
            fleet = %fleet_id,
            driver = %driver_id,
            amount = %amount,
            charged = !attached,
            "allocation applied"
        );
        Ok(Distribution {
            receipt,
            charged: !attached,
            budget,
        })
    }
}

/// Journal key of a fleet purchase; references are unique per fleet.
fn purchase_key(fleet_id: &FleetId, reference: &str) -> String {
    format!("fleet:{fleet_id}:{reference}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Asset;
    use crate::authorizer::AssetAuthorizer;
    use crate::config::{Network, SettlementConfig};
    use crate::keys::{KeyManager, Wallet};
    use crate::ledger::{LedgerClient, MemoryLedger, StallMode};
    use crate::limits::DriverLimits;
    use crate::model::DriverProfile;
    use crate::sequence::SequenceCache;
    use crate::store::{CreditJournal, FleetRepository, MemoryStore};
    use crate::submit::Submitter;

    struct Harness {
        ledger: Arc<MemoryLedger>,
        funding: FleetFunding,
        store: Arc<MemoryStore>,
        authorizer: AssetAuthorizer,
        keys: KeyManager,
        asset: Asset,
        fleet: FleetId,
    }

    async fn holder(h: &Harness) -> Wallet {
        let wallet = h.keys.create_wallet();
        h.ledger.create_account(wallet.identity());
        h.authorizer.authorize(&wallet, None).await.unwrap();
        wallet
    }

    async fn harness() -> Harness {
        let keys = KeyManager::new(Network::Testnet);
        let issuer = keys.create_wallet();
        let config = SettlementConfig::new(Network::Testnet, Asset::new("FUEL", issuer.identity().clone()))
            .with_distributor(issuer.secret().clone());
        let ledger = Arc::new(MemoryLedger::new(config.network.passphrase()));
        ledger.create_account(issuer.identity());
        let submitter = Submitter::new(LedgerClient::new(ledger.clone(), &config), Arc::new(SequenceCache::new()));
        let store = Arc::new(MemoryStore::new());
        let h = Harness {
            authorizer: AssetAuthorizer::new(
                submitter.clone(),
                config.asset.clone(),
                config.holding_ceiling,
                config.timeouts.confirm,
            ),
            funding: FleetFunding::new(store.clone(), TransferEngine::new(submitter, &config)),
            ledger,
            store,
            keys,
            asset: config.asset.clone(),
            fleet: FleetId::new("fl-1"),
        };
        let wallet = holder(&h).await;
        h.store
            .insert_fleet(Fleet {
                id: h.fleet.clone(),
                name: "Boda Riders".into(),
                wallet: wallet.identity().clone(),
                budget: FleetBudget::new(),
            })
            .unwrap();
        h.store.insert_wallet(wallet).unwrap();
        h
    }

    async fn driver(h: &Harness, id: &str, fleet: Option<FleetId>) -> DriverId {
        let wallet = holder(h).await;
        let id = DriverId::new(id);
        h.store
            .insert_driver(DriverProfile {
                id: id.clone(),
                wallet: wallet.identity().clone(),
                fleet,
                limits: DriverLimits::from_daily(Amount::from_units(100), Amount::from_units(500)),
                allowed_stations: Vec::new(),
                active: true,
            })
            .unwrap();
        id
    }

    #[tokio::test]
    async fn purchases_credit_the_budget_after_the_mint() {
        let h = harness().await;
        let purchase = h.funding.purchase(&h.fleet, Amount::from_units(1_000), "INV-7").await.unwrap();
        assert_eq!(purchase.budget.total_funded(), Amount::from_units(1_000));
        assert_eq!(purchase.budget.remaining(), Amount::from_units(1_000));
        let fleet = h.store.load_fleet(&h.fleet).await.unwrap().unwrap();
        assert_eq!(h.ledger.balance(&fleet.wallet, &h.asset), Amount::from_units(1_000));
    }

    #[tokio::test]
    async fn repeated_references_credit_once() {
        let h = harness().await;
        let first = h.funding.purchase(&h.fleet, Amount::from_units(100), "INV-11").await.unwrap();
        let submissions = h.ledger.submissions();
        let again = h.funding.purchase(&h.fleet, Amount::from_units(100), " INV-11 ").await.unwrap();
        assert_eq!(again.receipt, first.receipt);
        assert_eq!(again.budget.total_funded(), Amount::from_units(100));
        assert_eq!(h.ledger.submissions(), submissions);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_purchase_is_credited_on_replay_without_a_second_mint() {
        let h = harness().await;
        h.ledger.stall_submissions(Some(StallMode::ApplyThenHang));
        let err = h
            .funding
            .purchase(&h.fleet, Amount::from_units(100), "INV-12")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");
        let journal = h.store.credit_receipt("fleet:fl-1:INV-12").await.unwrap().unwrap();
        assert_eq!(journal.status, CreditStatus::Unconfirmed);
        let budget = h.store.load_fleet_budget(&h.fleet).await.unwrap().unwrap();
        assert_eq!(budget.total_funded(), Amount::ZERO);

        h.ledger.stall_submissions(None);
        let purchase = h.funding.purchase(&h.fleet, Amount::from_units(100), "INV-12").await.unwrap();
        assert!(matches!(purchase.receipt.status, CreditStatus::Credited { .. }));
        assert_eq!(purchase.budget.total_funded(), Amount::from_units(100));
        let fleet = h.store.load_fleet(&h.fleet).await.unwrap().unwrap();
        assert_eq!(h.ledger.balance(&fleet.wallet, &h.asset), Amount::from_units(100));
    }

    #[tokio::test]
    async fn attached_drivers_are_charged_at_redemption_others_now() {
        let h = harness().await;
        h.funding.purchase(&h.fleet, Amount::from_units(300), "INV-8").await.unwrap();
        let own = driver(&h, "dr-own", Some(h.fleet.clone())).await;
        let guest = driver(&h, "dr-guest", None).await;

        let to_own = h.funding.distribute(&h.fleet, &own, Amount::from_units(100)).await.unwrap();
        assert!(!to_own.charged);
        assert_eq!(to_own.budget.remaining(), Amount::from_units(300));

        let to_guest = h.funding.distribute(&h.fleet, &guest, Amount::from_units(50)).await.unwrap();
        assert!(to_guest.charged);
        assert_eq!(to_guest.budget.remaining(), Amount::from_units(250));
    }

    #[tokio::test]
    async fn allocations_beyond_the_budget_are_denied_before_submission() {
        let h = harness().await;
        h.funding.purchase(&h.fleet, Amount::from_units(10), "INV-9").await.unwrap();
        let own = driver(&h, "dr-own", Some(h.fleet.clone())).await;
        let before = h.ledger.submissions();
        let err = h.funding.distribute(&h.fleet, &own, Amount::from_units(11)).await.unwrap_err();
        assert_eq!(err.code(), "EXCEEDS_FLEET_BUDGET");
        assert_eq!(h.ledger.submissions(), before);
    }

    #[tokio::test]
    async fn unknown_fleets_are_reported() {
        let h = harness().await;
        let err = h
            .funding
            .purchase(&FleetId::new("fl-404"), Amount::from_units(1), "INV-10")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
