//! Station redemptions: geofence, limits, transfer, bookkeeping.
//!
//! Every attempt leaves at least one [`Redemption`] in the log. A payment whose
//! confirmation timed out is logged `Indeterminate` and blocks the driver until
//! [`RedemptionCoordinator::reconcile`] appends the resolving record.

use crate::asset::Amount;
use crate::contract::CreditScoreHook;
use crate::error::SettlementError;
use crate::geo::GeoPoint;
use crate::history::find_by_memo;
use crate::keys::AccountId;
use crate::ledger::tx::now_secs;
use crate::ledger::TxHash;
use crate::limits::{LimitEnforcer, SpendSnapshot};
use crate::model::{
    DriverId, DriverProfile, FleetId, Redemption, RedemptionId, RedemptionOutcome, RedemptionRequest,
    StationId,
};
use crate::sequence::KeyedLocks;
use crate::store::SettlementStore;
use crate::transfer::{TransferEngine, TransferStatus};
use std::{
    collections::HashSet,
    mem,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::OwnedMutexGuard, task::JoinHandle};
use tracing::{error, info, warn};

/// History pages scanned for a redemption memo during reconciliation.
pub const DEFAULT_MEMO_SCAN_PAGES: usize = 4;

/// One attempt as it moves through the gates.
struct Attempt {
    id: RedemptionId,
    request: RedemptionRequest,
    driver: Option<DriverId>,
    price_per_liter: Option<Amount>,
    location: Option<GeoPoint>,
    submitted: bool,
}

impl Attempt {
    fn new(request: RedemptionRequest) -> Self {
        Self {
            id: RedemptionId::generate(),
            request,
            driver: None,
            price_per_liter: None,
            location: None,
            submitted: false,
        }
    }

    fn record(&self, outcome: RedemptionOutcome) -> Redemption {
        Redemption {
            id: self.id.clone(),
            station: self.request.station.clone(),
            driver: self.driver.clone(),
            driver_wallet: self.request.driver_wallet.clone(),
            fuel_type: self.request.fuel_type,
            amount: self.request.amount,
            liters: self.request.liters,
            price_per_liter: self.price_per_liter,
            location: self.location,
            vehicle_id: self.request.vehicle_id.clone(),
            timestamp: now_secs(),
            outcome,
            supersedes: None,
        }
    }
}

/// Runs redemptions end to end, one at a time per driver and per fleet.
///
/// Locks are taken driver first, then fleet.
pub struct RedemptionCoordinator {
    store: Arc<dyn SettlementStore>,
    transfers: TransferEngine,
    drivers: KeyedLocks<AccountId>,
    fleets: Arc<KeyedLocks<FleetId>>,
    enforcer: LimitEnforcer,
    credit_hook: Option<CreditScoreHook>,
    credit_updates: Mutex<Vec<JoinHandle<()>>>,
    settle_grace: Duration,
    memo_scan_pages: usize,
}

impl RedemptionCoordinator {
    /// Coordinator over `store` paying through `transfers`.
    pub fn new(store: Arc<dyn SettlementStore>, transfers: TransferEngine) -> Self {
        let settle_grace = transfers.validity();
        Self {
            store,
            transfers,
            drivers: KeyedLocks::new(),
            fleets: Arc::new(KeyedLocks::new()),
            enforcer: LimitEnforcer,
            credit_hook: None,
            credit_updates: Mutex::default(),
            settle_grace,
            memo_scan_pages: DEFAULT_MEMO_SCAN_PAGES,
        }
    }

    /// How long past its validity window a missing payment is still waited for.
    pub fn with_settle_grace(mut self, grace: Duration) -> Self {
        self.settle_grace = grace;
        self
    }

    /// Shares per-fleet locks with [`FleetFunding`](crate::fleet::FleetFunding).
    pub fn with_fleet_locks(mut self, fleets: Arc<KeyedLocks<FleetId>>) -> Self {
        self.fleets = fleets;
        self
    }

    /// Records completed purchases on the credit-score contract.
    pub fn with_credit_hook(mut self, hook: CreditScoreHook) -> Self {
        self.credit_hook = Some(hook);
        self
    }

    /// Redeems fuel at a station.
    ///
    /// Returns the `Completed` record, or an `Indeterminate` one when the payment
    /// was submitted but not confirmed in time. Any other failure appends a
    /// `Rejected` record and is returned as the error.
    pub async fn redeem(&self, request: RedemptionRequest) -> Result<Redemption, SettlementError> {
        let mut attempt = Attempt::new(request);
        match self.run(&mut attempt).await {
            Ok(record) => Ok(record),
            Err(err) => {
                if !attempt.submitted {
                    let rejected = attempt.record(RedemptionOutcome::Rejected {
                        code: err.code().to_string(),
                        detail: err.to_string(),
                    });
                    if let Err(store_err) = self.store.append_redemption(&rejected).await {
                        error!(evt = "REDEEM_AUDIT_FAILED", id = %attempt.id, error = %store_err, "rejected attempt not logged");
                    }
                }
                warn!(
                    evt = "REDEEM_REJECTED",
                    id = %attempt.id,
                    station = %attempt.request.station,
                    code = err.code(),
                    error = %err,
                    "redemption refused"
                );
                Err(err)
            }
        }
    }

    async fn run(&self, attempt: &mut Attempt) -> Result<Redemption, SettlementError> {
        let request = attempt.request.clone();
        let amount = request.amount.require_positive()?;
        if !request.liters.is_finite() || request.liters <= 0.0 {
            return Err(SettlementError::InvalidAmount(format!("liters {}", request.liters)));
        }
        let location = GeoPoint::new(request.latitude, request.longitude)?;
        attempt.location = Some(location);

        let station = self
            .store
            .load_station(&request.station)
            .await?
            .ok_or_else(|| not_found("station", request.station.to_string()))?;
        if !station.active {
            return Err(SettlementError::StationInactive(station.id.to_string()));
        }
        station.geofence()?.check(&location)?;
        attempt.price_per_liter = Some(station.price_for(request.fuel_type)?);

        let _guard = self.drivers.lock(&request.driver_wallet).await?;
        // Everything below reads state only this guard's holder may change.
        let driver = self.driver(&request.driver_wallet).await?;
        attempt.driver = Some(driver.id.clone());
        driver.check_station(&station.id)?;
        if let Some(pending) = self.store.unresolved_for_driver(&driver.wallet).await?.first() {
            return Err(SettlementError::ReconciliationRequired {
                hash: pending_hash(pending),
            });
        }

        // Held until the bookkeeping below has charged the pool.
        let _fleet_guard = self.lock_fleet(&driver).await?;
        let snapshot = self.snapshot(&driver).await?;
        self.enforcer.evaluate(amount, &snapshot).into_result()?;

        let secret = self
            .store
            .signing_secret(&driver.wallet)
            .await?
            .ok_or_else(|| SettlementError::Key(format!("no signing secret for driver {}", driver.id)))?;
        let started = now_secs();
        attempt.submitted = true;
        let paid = self
            .transfers
            .transfer(&secret, &station.wallet, amount, Some(&attempt.id.memo()))
            .await;
        drop(secret);

        match paid {
            Ok(receipt) => {
                let record = attempt.record(RedemptionOutcome::Completed {
                    tx_hash: receipt.hash.to_string(),
                    ledger: receipt.ledger,
                });
                self.settle(&record, &driver).await?;
                info!(
                    evt = "REDEEM_COMPLETED",
                    id = %record.id,
                    station = %station.id,
                    driver = %driver.id,
                    amount = %amount,
                    hash = %receipt.hash,
                    "redemption completed"
                );
                Ok(record)
            }
            Err(err) => match err.unresolved_hash() {
                Some(hash) => {
                    let valid_until = now_secs().max(started.saturating_add(self.transfers.validity().as_secs()));
                    let record = attempt.record(RedemptionOutcome::Indeterminate {
                        tx_hash: hash.to_string(),
                        valid_until,
                    });
                    self.store.append_redemption(&record).await?;
                    warn!(
                        evt = "REDEEM_INDETERMINATE",
                        id = %record.id,
                        driver = %driver.id,
                        hash,
                        valid_until,
                        "payment outcome unknown; reconcile before retrying"
                    );
                    Ok(record)
                }
                None => {
                    attempt.submitted = false;
                    Err(err)
                }
            },
        }
    }

    /// Bookkeeping for a confirmed payment, then the credit-score update.
    async fn settle(&self, record: &Redemption, driver: &DriverProfile) -> Result<(), SettlementError> {
        if let Err(err) = self
            .store
            .apply_redemption(record, &driver.id, driver.fleet.as_ref())
            .await
        {
            // The payment stands; keep it in the audit trail even though the
            // accumulators could not be updated.
            error!(evt = "REDEEM_BOOKKEEPING_FAILED", id = %record.id, error = %err, "payment applied but bookkeeping failed");
            self.store.append_redemption(record).await?;
            return Err(err);
        }
        if let Some(hook) = &self.credit_hook {
            let station_count = self.completed_station_count(&driver.wallet).await?;
            if let Some(task) = hook.spawn_record(driver.wallet.clone(), record.amount, station_count, record.timestamp) {
                if let Ok(mut tasks) = self.credit_updates.lock() {
                    tasks.retain(|task| !task.is_finished());
                    tasks.push(task);
                }
            }
        }
        Ok(())
    }

    /// Waits for every background credit-score update started so far.
    ///
    /// Failed updates are logged by the hook; a task that panicked is logged
    /// here. Neither affects the redemption it belongs to.
    pub async fn drain_credit_updates(&self) -> usize {
        let tasks = match self.credit_updates.lock() {
            Ok(mut tasks) => mem::take(&mut *tasks),
            Err(_) => return 0,
        };
        let count = tasks.len();
        for task in tasks {
            if let Err(err) = task.await {
                error!(evt = "CREDIT_SCORE_TASK_FAILED", error = %err, "credit-score update aborted");
            }
        }
        count
    }

    async fn lock_fleet(&self, driver: &DriverProfile) -> Result<Option<OwnedMutexGuard<()>>, SettlementError> {
        Ok(match &driver.fleet {
            Some(id) => Some(self.fleets.lock(id).await?),
            None => None,
        })
    }

    async fn snapshot(&self, driver: &DriverProfile) -> Result<SpendSnapshot, SettlementError> {
        let fleet = match &driver.fleet {
            Some(id) => Some(
                self.store
                    .load_fleet_budget(id)
                    .await?
                    .ok_or_else(|| not_found("fleet", id.to_string()))?,
            ),
            None => None,
        };
        Ok(SpendSnapshot {
            limits: driver.limits.clone(),
            fleet,
            chain_balance: self.transfers.balance_of(&driver.wallet).await?,
        })
    }

    /// Largest amount the driver behind `wallet` could redeem right now.
    pub async fn remaining_allowance(&self, wallet: &AccountId) -> Result<Amount, SettlementError> {
        let driver = self.driver(wallet).await?;
        let snapshot = self.snapshot(&driver).await?;
        Ok(self.enforcer.remaining(&snapshot))
    }

    /// Blocks further redemptions by `id`. Waits for one in progress.
    pub async fn deactivate_driver(&self, id: &DriverId) -> Result<(), SettlementError> {
        self.set_driver_active(id, false).await
    }

    /// Lets `id` redeem again.
    pub async fn reactivate_driver(&self, id: &DriverId) -> Result<(), SettlementError> {
        self.set_driver_active(id, true).await
    }

    async fn set_driver_active(&self, id: &DriverId, active: bool) -> Result<(), SettlementError> {
        let driver = self
            .store
            .load_driver(id)
            .await?
            .ok_or_else(|| not_found("driver", id.to_string()))?;
        let _guard = self.drivers.lock(&driver.wallet).await?;
        if !self.store.set_driver_active(id, active).await? {
            return Err(not_found("driver", id.to_string()));
        }
        info!(evt = "DRIVER_ACTIVE_SET", driver = %id, active, "driver status changed");
        Ok(())
    }

    async fn completed_station_count(&self, wallet: &AccountId) -> Result<u32, SettlementError> {
        let records = self.store.redemptions_for_driver(wallet).await?;
        let stations: HashSet<&StationId> = records
            .iter()
            .filter(|r| matches!(r.outcome, RedemptionOutcome::Completed { .. }))
            .map(|r| &r.station)
            .collect();
        Ok(u32::try_from(stations.len()).unwrap_or(u32::MAX))
    }

    async fn driver(&self, wallet: &AccountId) -> Result<DriverProfile, SettlementError> {
        self.store
            .driver_by_wallet(wallet)
            .await?
            .ok_or_else(|| not_found("driver", wallet.to_string()))
    }

    /// Resolves an `Indeterminate` redemption against the ledger.
    ///
    /// Looks the payment up by hash, then by memo in the driver's history. An
    /// applied payment appends a `Completed` record and runs the bookkeeping; a
    /// failed one, or one still missing after its validity window and the grace
    /// period, appends `Abandoned`. Anything else is `ReconciliationRequired`.
    /// Already resolved redemptions return their latest record.
    pub async fn reconcile(&self, id: &RedemptionId) -> Result<Redemption, SettlementError> {
        let wallet = self
            .store
            .redemption(id)
            .await?
            .first()
            .map(|r| r.driver_wallet.clone())
            .ok_or_else(|| not_found("redemption", id.to_string()))?;
        let _guard = self.drivers.lock(&wallet).await?;

        let mut records = self.store.redemption(id).await?;
        let Some(latest) = records.pop() else {
            return Err(not_found("redemption", id.to_string()));
        };
        let (tx_hash, valid_until) = match &latest.outcome {
            RedemptionOutcome::Indeterminate { tx_hash, valid_until } => (tx_hash.clone(), *valid_until),
            _ => return Ok(latest),
        };

        let applied = match self.transfers.lookup(&TxHash::parse(&tx_hash)?).await? {
            TransferStatus::Applied { ledger, .. } => Some((tx_hash.clone(), ledger)),
            TransferStatus::Failed { detail } => {
                return self
                    .abandon(&latest, &tx_hash, format!("payment failed on the ledger: {detail}"))
                    .await;
            }
            TransferStatus::Unknown => {
                find_by_memo(self.transfers.client(), &wallet, &id.memo(), self.memo_scan_pages)
                    .await?
                    .filter(|found| found.successful)
                    .map(|found| (found.hash.to_string(), found.ledger))
            }
        };

        match applied {
            Some((hash, ledger)) => {
                let mut record = latest.clone();
                record.outcome = RedemptionOutcome::Completed { tx_hash: hash, ledger };
                record.supersedes = Some(latest.id.clone());
                record.timestamp = now_secs();
                let driver = self.driver(&wallet).await?;
                let _fleet_guard = self.lock_fleet(&driver).await?;
                self.settle(&record, &driver).await?;
                info!(evt = "REDEEM_RECONCILED", id = %id, ledger, outcome = "completed", "indeterminate redemption applied");
                Ok(record)
            }
            None => {
                let deadline = valid_until.saturating_add(self.settle_grace.as_secs());
                if now_secs() > deadline {
                    self.abandon(&latest, &tx_hash, "payment never reached the ledger".into())
                        .await
                } else {
                    Err(SettlementError::ReconciliationRequired { hash: tx_hash })
                }
            }
        }
    }

    async fn abandon(
        &self,
        pending: &Redemption,
        tx_hash: &str,
        detail: String,
    ) -> Result<Redemption, SettlementError> {
        let mut record = pending.clone();
        record.outcome = RedemptionOutcome::Abandoned {
            tx_hash: tx_hash.to_string(),
            detail,
        };
        record.supersedes = Some(pending.id.clone());
        record.timestamp = now_secs();
        self.store.append_redemption(&record).await?;
        info!(evt = "REDEEM_RECONCILED", id = %record.id, outcome = "abandoned", "indeterminate redemption released");
        Ok(record)
    }

    /// Unresolved redemptions of `wallet`.
    pub async fn pending(&self, wallet: &AccountId) -> Result<Vec<Redemption>, SettlementError> {
        Ok(self.store.unresolved_for_driver(wallet).await?)
    }
}

fn pending_hash(record: &Redemption) -> String {
    match &record.outcome {
        RedemptionOutcome::Indeterminate { tx_hash, .. } => tx_hash.clone(),
        _ => record.id.to_string(),
    }
}

fn not_found(kind: &'static str, id: String) -> SettlementError {
    SettlementError::NotFound { kind, id }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Asset;
    use crate::authorizer::AssetAuthorizer;
    use crate::config::{Network, SettlementConfig};
    use crate::contract::ContractInvoker;
    use crate::keys::KeyManager;
    use crate::ledger::{ContractCallContext, ContractId, LedgerClient, MemoryLedger, StallMode};
    use crate::limits::{DriverLimits, FleetBudget};
    use crate::model::{Fleet, FuelPrice, FuelType, Station};
    use crate::sequence::SequenceCache;
    use crate::store::{DriverRepository, FleetRepository, MemoryStore, RedemptionLog, StationRepository};
    use crate::submit::Submitter;

    const LAT: f64 = -1.2833;
    const LNG: f64 = 36.8167;

    struct Harness {
        ledger: Arc<MemoryLedger>,
        store: Arc<MemoryStore>,
        coordinator: RedemptionCoordinator,
        keys: KeyManager,
        authorizer: AssetAuthorizer,
        submitter: Submitter,
        engine: TransferEngine,
        station: Station,
        driver: DriverProfile,
        fleet: FleetId,
        asset: Asset,
    }

    async fn harness() -> Harness {
        let keys = KeyManager::new(Network::Testnet);
        let issuer = keys.create_wallet();
        let config = SettlementConfig::new(Network::Testnet, Asset::new("FUEL", issuer.identity().clone()))
            .with_distributor(issuer.secret().clone());
        let ledger = Arc::new(MemoryLedger::new(config.network.passphrase()).with_yield_points());
        ledger.create_account(issuer.identity());
        let submitter = Submitter::new(LedgerClient::new(ledger.clone(), &config), Arc::new(SequenceCache::new()));
        let authorizer = AssetAuthorizer::new(
            submitter.clone(),
            config.asset.clone(),
            config.holding_ceiling,
            config.timeouts.confirm,
        );
        let engine = TransferEngine::new(submitter.clone(), &config);

        let station_wallet = keys.create_wallet();
        let driver_wallet = keys.create_wallet();
        for wallet in [&station_wallet, &driver_wallet] {
            ledger.create_account(wallet.identity());
            authorizer.authorize(wallet, None).await.unwrap();
        }
        engine.mint(driver_wallet.identity(), Amount::from_units(500)).await.unwrap();

        let mut station = Station::new(
            StationId::new("st-1"),
            "Moi Avenue",
            station_wallet.identity().clone(),
            GeoPoint::new(LAT, LNG).unwrap(),
        );
        station.fuel_prices.push(FuelPrice {
            fuel_type: FuelType::Diesel,
            price_per_liter: Amount::from_units(2),
        });
        let mut budget = FleetBudget::new();
        budget.fund(Amount::from_units(1_000)).unwrap();
        let fleet = Fleet {
            id: FleetId::new("fl-1"),
            name: "Nairobi Haulage".into(),
            wallet: keys.create_wallet().identity().clone(),
            budget,
        };
        let driver = DriverProfile {
            id: DriverId::new("dr-1"),
            wallet: driver_wallet.identity().clone(),
            fleet: Some(fleet.id.clone()),
            limits: DriverLimits::from_daily(Amount::from_units(100), Amount::from_units(100)),
            allowed_stations: Vec::new(),
            active: true,
        };

        let store = Arc::new(MemoryStore::new());
        store.insert_station(station.clone()).unwrap();
        store.insert_fleet(fleet.clone()).unwrap();
        store.insert_driver(driver.clone()).unwrap();
        store.insert_wallet(driver_wallet).unwrap();

        Harness {
            coordinator: RedemptionCoordinator::new(store.clone(), engine.clone()),
            ledger,
            store,
            keys,
            authorizer,
            submitter,
            engine,
            station,
            driver,
            fleet: fleet.id,
            asset: config.asset,
        }
    }

    fn request(h: &Harness, amount: i64, lat: f64, lng: f64) -> RedemptionRequest {
        RedemptionRequest {
            station: h.station.id.clone(),
            driver_wallet: h.driver.wallet.clone(),
            fuel_type: FuelType::Diesel,
            amount: Amount::from_units(amount),
            liters: 20.0,
            latitude: lat,
            longitude: lng,
            vehicle_id: Some("KDA 123X".into()),
        }
    }

    fn request_by(h: &Harness, wallet: &AccountId, amount: i64) -> RedemptionRequest {
        RedemptionRequest {
            driver_wallet: wallet.clone(),
            ..request(h, amount, LAT, LNG)
        }
    }

    async fn fleet_driver(h: &Harness, id: &str, funds: i64) -> DriverProfile {
        let wallet = h.keys.create_wallet();
        h.ledger.create_account(wallet.identity());
        h.authorizer.authorize(&wallet, None).await.unwrap();
        h.engine.mint(wallet.identity(), Amount::from_units(funds)).await.unwrap();
        let driver = DriverProfile {
            id: DriverId::new(id),
            wallet: wallet.identity().clone(),
            fleet: Some(h.fleet.clone()),
            limits: DriverLimits::from_daily(Amount::from_units(100), Amount::from_units(100)),
            allowed_stations: Vec::new(),
            active: true,
        };
        h.store.insert_driver(driver.clone()).unwrap();
        h.store.insert_wallet(wallet).unwrap();
        driver
    }

    async fn daily_spent(h: &Harness) -> Amount {
        h.store.load_driver_limits(&h.driver.id).await.unwrap().unwrap().daily_spent
    }

    async fn fleet_remaining(h: &Harness) -> Amount {
        h.store.load_fleet_budget(&h.fleet).await.unwrap().unwrap().remaining()
    }

    #[tokio::test]
    async fn completed_redemption_moves_exactly_the_amount() {
        let h = harness().await;
        let record = h.coordinator.redeem(request(&h, 40, LAT, LNG)).await.unwrap();

        assert_eq!(record.outcome.label(), "completed");
        assert_eq!(record.price_per_liter, Some(Amount::from_units(2)));
        assert_eq!(daily_spent(&h).await, Amount::from_units(40));
        assert_eq!(fleet_remaining(&h).await, Amount::from_units(960));
        assert_eq!(h.ledger.balance(&h.station.wallet, &h.asset), Amount::from_units(40));
        let station = h.store.load_station(&h.station.id).await.unwrap().unwrap();
        assert_eq!(station.total_redemptions, 1);
        assert_eq!(station.total_volume, 20.0);
    }

    #[tokio::test]
    async fn outside_the_geofence_nothing_moves() {
        let h = harness().await;
        let before = h.ledger.submissions();
        // 0.009 degrees of latitude is roughly 1000m.
        let err = h
            .coordinator
            .redeem(request(&h, 40, LAT + 0.009, LNG))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "OUT_OF_GEOFENCE");
        assert_eq!(h.ledger.submissions(), before);
        assert_eq!(fleet_remaining(&h).await, Amount::from_units(1_000));
        assert_eq!(daily_spent(&h).await, Amount::ZERO);
        let log = h.store.redemptions_for_driver(&h.driver.wallet).await.unwrap();
        assert_eq!(log.len(), 1);
        assert!(matches!(&log[0].outcome, RedemptionOutcome::Rejected { code, .. } if code == "OUT_OF_GEOFENCE"));
    }

    #[tokio::test]
    async fn concurrent_redemptions_cannot_both_pass_the_daily_limit() {
        let h = harness().await;
        let (a, b) = tokio::join!(
            h.coordinator.redeem(request(&h, 60, LAT, LNG)),
            h.coordinator.redeem(request(&h, 60, LAT, LNG)),
        );
        let results = [a, b];
        let completed = results.iter().filter(|r| r.is_ok()).count();
        let denied: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
        assert_eq!(completed, 1);
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].code(), "EXCEEDS_DAILY_LIMIT");
        assert_eq!(daily_spent(&h).await, Amount::from_units(60));
        assert_eq!(h.ledger.balance(&h.station.wallet, &h.asset), Amount::from_units(60));
    }

    #[tokio::test]
    async fn drivers_of_one_fleet_cannot_overdraw_its_budget() {
        let h = harness().await;
        let mut budget = FleetBudget::new();
        budget.fund(Amount::from_units(50)).unwrap();
        h.store.save_fleet_budget(&h.fleet, &budget).await.unwrap();
        let other = fleet_driver(&h, "dr-2", 100).await;

        let (a, b) = tokio::join!(
            h.coordinator.redeem(request(&h, 40, LAT, LNG)),
            h.coordinator.redeem(request_by(&h, &other.wallet, 40)),
        );
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let denied: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].code(), "EXCEEDS_FLEET_BUDGET");
        assert_eq!(h.ledger.balance(&h.station.wallet, &h.asset), Amount::from_units(40));
        assert_eq!(fleet_remaining(&h).await, Amount::from_units(10));
        let other_spent = h.store.load_driver_limits(&other.id).await.unwrap().unwrap().daily_spent;
        assert_eq!(daily_spent(&h).await.saturating_add(other_spent), Amount::from_units(40));
    }

    #[tokio::test]
    async fn remaining_allowance_shrinks_with_spend() {
        let h = harness().await;
        let allowance = h.coordinator.remaining_allowance(&h.driver.wallet).await.unwrap();
        assert_eq!(allowance, Amount::from_units(100));
        h.coordinator.redeem(request(&h, 40, LAT, LNG)).await.unwrap();
        let allowance = h.coordinator.remaining_allowance(&h.driver.wallet).await.unwrap();
        assert_eq!(allowance, Amount::from_units(60));
    }

    #[tokio::test]
    async fn deactivated_drivers_are_refused_until_reactivated() {
        let h = harness().await;
        h.coordinator.deactivate_driver(&h.driver.id).await.unwrap();
        let err = h.coordinator.redeem(request(&h, 10, LAT, LNG)).await.unwrap_err();
        assert_eq!(err.code(), "DRIVER_INACTIVE");

        h.coordinator.reactivate_driver(&h.driver.id).await.unwrap();
        let record = h.coordinator.redeem(request(&h, 10, LAT, LNG)).await.unwrap();
        assert_eq!(record.outcome.label(), "completed");

        let err = h
            .coordinator
            .deactivate_driver(&DriverId::new("dr-404"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn failed_credit_score_update_leaves_the_redemption_completed() {
        let h = harness().await;
        let contract = ContractId::new("CREDITSCORE");
        h.ledger.register_contract(contract.clone(), |_: &ContractCallContext| {
            Err("score contract paused".into())
        });
        let signer = h.keys.create_wallet();
        h.ledger.create_account(signer.identity());
        let hook = CreditScoreHook::new(ContractInvoker::new(h.submitter.clone()), contract, signer.secret().clone());
        let coordinator = RedemptionCoordinator::new(h.store.clone(), h.engine.clone()).with_credit_hook(hook);

        let record = coordinator.redeem(request(&h, 40, LAT, LNG)).await.unwrap();
        assert_eq!(coordinator.drain_credit_updates().await, 1);
        assert_eq!(record.outcome.label(), "completed");
        assert_eq!(h.store.redemptions_for_driver(&h.driver.wallet).await.unwrap(), vec![record]);
        assert_eq!(daily_spent(&h).await, Amount::from_units(40));
        assert_eq!(h.ledger.sends(), 0);
    }

    #[tokio::test]
    async fn inactive_parties_are_refused() {
        let h = harness().await;
        let mut driver = h.driver.clone();
        driver.active = false;
        h.store.insert_driver(driver).unwrap();
        let err = h.coordinator.redeem(request(&h, 10, LAT, LNG)).await.unwrap_err();
        assert_eq!(err.code(), "DRIVER_INACTIVE");

        let mut station = h.station.clone();
        station.active = false;
        h.store.insert_station(station).unwrap();
        let err = h.coordinator.redeem(request(&h, 10, LAT, LNG)).await.unwrap_err();
        assert_eq!(err.code(), "STATION_INACTIVE");
    }

    #[tokio::test]
    async fn unpriced_fuel_and_bad_input_are_validation_errors() {
        let h = harness().await;
        let mut req = request(&h, 10, LAT, LNG);
        req.fuel_type = FuelType::Premium;
        assert_eq!(h.coordinator.redeem(req).await.unwrap_err().code(), "UNKNOWN_FUEL_TYPE");
        let err = h.coordinator.redeem(request(&h, 10, 91.0, LNG)).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_LOCATION");
        let err = h.coordinator.redeem(request(&h, 0, LAT, LNG)).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_payment_is_indeterminate_until_reconciled() {
        let h = harness().await;
        h.ledger.stall_submissions(Some(StallMode::ApplyThenHang));
        let pending = h.coordinator.redeem(request(&h, 30, LAT, LNG)).await.unwrap();
        assert_eq!(pending.outcome.label(), "indeterminate");
        assert_eq!(daily_spent(&h).await, Amount::ZERO);
        h.ledger.stall_submissions(None);

        let submissions = h.ledger.submissions();
        let err = h.coordinator.redeem(request(&h, 5, LAT, LNG)).await.unwrap_err();
        assert_eq!(err.code(), "RECONCILIATION_REQUIRED");
        assert_eq!(h.ledger.submissions(), submissions);

        let resolved = h.coordinator.reconcile(&pending.id).await.unwrap();
        assert_eq!(resolved.outcome.label(), "completed");
        assert_eq!(resolved.supersedes.as_ref(), Some(&pending.id));
        assert_eq!(daily_spent(&h).await, Amount::from_units(30));
        assert_eq!(fleet_remaining(&h).await, Amount::from_units(970));
        assert!(h.coordinator.pending(&h.driver.wallet).await.unwrap().is_empty());

        // Reconciling again returns the resolution without applying twice.
        let again = h.coordinator.reconcile(&pending.id).await.unwrap();
        assert_eq!(again, resolved);
        assert_eq!(daily_spent(&h).await, Amount::from_units(30));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_payment_stays_unresolved_inside_its_window() {
        let h = harness().await;
        h.ledger.stall_submissions(Some(StallMode::Drop));
        let pending = h.coordinator.redeem(request(&h, 30, LAT, LNG)).await.unwrap();
        h.ledger.stall_submissions(None);

        let err = h.coordinator.reconcile(&pending.id).await.unwrap_err();
        assert_eq!(err.code(), "RECONCILIATION_REQUIRED");
        assert_eq!(h.coordinator.pending(&h.driver.wallet).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_missing_payment_is_abandoned_and_releases_the_driver() {
        let h = harness().await;
        let stale = Redemption {
            id: RedemptionId::generate(),
            station: h.station.id.clone(),
            driver: Some(h.driver.id.clone()),
            driver_wallet: h.driver.wallet.clone(),
            fuel_type: FuelType::Diesel,
            amount: Amount::from_units(30),
            liters: 15.0,
            price_per_liter: Some(Amount::from_units(2)),
            location: None,
            vehicle_id: None,
            timestamp: 1,
            outcome: RedemptionOutcome::Indeterminate {
                tx_hash: "cd".repeat(32),
                valid_until: 1,
            },
            supersedes: None,
        };
        h.store.append_redemption(&stale).await.unwrap();

        let resolved = h.coordinator.reconcile(&stale.id).await.unwrap();
        assert_eq!(resolved.outcome.label(), "abandoned");
        assert_eq!(daily_spent(&h).await, Amount::ZERO);

        let record = h.coordinator.redeem(request(&h, 10, LAT, LNG)).await.unwrap();
        assert_eq!(record.outcome.label(), "completed");
    }
}
