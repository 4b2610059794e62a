//! Repository interfaces and the in-process store.
//!
//! Business logic only sees the traits. Every method is individually atomic;
//! [`RedemptionLog::apply_redemption`] performs the whole post-payment
//! bookkeeping of a redemption as one step.

use crate::asset::Amount;
use crate::error::SettlementError;
use crate::ingress::{CreditReceipt, CreditStatus};
use crate::keys::{AccountId, SigningSecret, Wallet};
use crate::limits::{DriverLimits, FleetBudget, Period};
use crate::model::{
    DriverId, DriverProfile, Fleet, FleetId, Redemption, RedemptionId, RedemptionOutcome, Station,
    StationId,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    path::Path,
    sync::{Mutex, MutexGuard},
};
use thiserror::Error;

/// Repository failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("state lock poisoned")]
    /// A writer panicked while holding the state lock.
    Poisoned,
    #[error("io: {0}")]
    /// Reading or writing the backing file failed.
    Io(String),
    #[error("codec: {0}")]
    /// Stored state could not be encoded or decoded.
    Codec(String),
}

impl From<StoreError> for SettlementError {
    fn from(err: StoreError) -> Self {
        SettlementError::Store(err.to_string())
    }
}

/// Drivers and their spend accumulators.
#[async_trait]
pub trait DriverRepository: Send + Sync {
    /// Full driver profile.
    async fn load_driver(&self, id: &DriverId) -> Result<Option<DriverProfile>, StoreError>;

    /// Driver owning `wallet`.
    async fn driver_by_wallet(&self, wallet: &AccountId) -> Result<Option<DriverProfile>, StoreError>;

    /// Caps and running totals.
    async fn load_driver_limits(&self, id: &DriverId) -> Result<Option<DriverLimits>, StoreError>;

    /// Replaces caps and running totals.
    async fn save_driver_limits(&self, id: &DriverId, limits: &DriverLimits) -> Result<(), StoreError>;

    /// Inserts or replaces a driver profile.
    async fn save_driver(&self, driver: &DriverProfile) -> Result<(), StoreError>;

    /// Sets the active flag; `false` when no such driver exists.
    async fn set_driver_active(&self, id: &DriverId, active: bool) -> Result<bool, StoreError>;

    /// Zeroes the accumulators of `period` for every driver.
    async fn reset_period(&self, period: Period) -> Result<usize, StoreError>;
}

/// Fleets and their allocation pools.
#[async_trait]
pub trait FleetRepository: Send + Sync {
    /// Full fleet record.
    async fn load_fleet(&self, id: &FleetId) -> Result<Option<Fleet>, StoreError>;

    /// Allocation pool.
    async fn load_fleet_budget(&self, id: &FleetId) -> Result<Option<FleetBudget>, StoreError>;

    /// Replaces the allocation pool.
    async fn save_fleet_budget(&self, id: &FleetId, budget: &FleetBudget) -> Result<(), StoreError>;

    /// Credits a confirmed purchase in one step.
    async fn credit_fleet_budget(&self, id: &FleetId, amount: Amount) -> Result<FleetBudget, SettlementError>;

    /// Charges the pool in one step; refuses overdrafts.
    async fn charge_fleet_budget(&self, id: &FleetId, amount: Amount) -> Result<FleetBudget, SettlementError>;

    /// Credits `receipt.credited` and journals `receipt` in one step.
    ///
    /// A reference already journaled as credited leaves the pool unchanged.
    async fn apply_fleet_purchase(&self, id: &FleetId, receipt: &CreditReceipt) -> Result<FleetBudget, SettlementError>;
}

/// Stations.
#[async_trait]
pub trait StationRepository: Send + Sync {
    /// Station record.
    async fn load_station(&self, id: &StationId) -> Result<Option<Station>, StoreError>;

    /// Inserts or replaces a station.
    async fn save_station(&self, station: &Station) -> Result<(), StoreError>;
}

/// Append-only redemption audit trail.
#[async_trait]
pub trait RedemptionLog: Send + Sync {
    /// Appends one record.
    async fn append_redemption(&self, record: &Redemption) -> Result<(), StoreError>;

    /// Records paid from `wallet`, oldest first.
    async fn redemptions_for_driver(&self, wallet: &AccountId) -> Result<Vec<Redemption>, StoreError>;

    /// Records with `id`, oldest first. Reconciliation appends a second one.
    async fn redemption(&self, id: &RedemptionId) -> Result<Vec<Redemption>, StoreError>;

    /// Applies the bookkeeping of a confirmed redemption and appends `record`.
    ///
    /// Adds the amount to the driver's accumulators, charges `fleet` when set,
    /// counts the litres on the station. Nothing changes if any part fails.
    async fn apply_redemption(
        &self,
        record: &Redemption,
        driver: &DriverId,
        fleet: Option<&FleetId>,
    ) -> Result<(), SettlementError>;

    /// Indeterminate records of `wallet` that no later record resolves.
    async fn unresolved_for_driver(&self, wallet: &AccountId) -> Result<Vec<Redemption>, StoreError> {
        let records = self.redemptions_for_driver(wallet).await?;
        let resolved: HashSet<&RedemptionId> = records
            .iter()
            .filter_map(|r| r.supersedes.as_ref())
            .collect();
        Ok(records
            .iter()
            .filter(|r| matches!(r.outcome, RedemptionOutcome::Indeterminate { .. }))
            .filter(|r| !resolved.contains(&r.id))
            .cloned()
            .collect())
    }
}

/// Maps external payer references to wallets.
#[async_trait]
pub trait WalletDirectory: Send + Sync {
    /// Wallet credited for `payer`.
    async fn resolve_payer(&self, payer: &str) -> Result<Option<AccountId>, StoreError>;
}

/// Encrypted-at-rest signing secrets, keyed by identity.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Secret of `identity`; dropped (and zeroed) by the caller after signing.
    async fn signing_secret(&self, identity: &AccountId) -> Result<Option<SigningSecret>, StoreError>;
}

/// Processed external payments, keyed by their reference.
#[async_trait]
pub trait CreditJournal: Send + Sync {
    /// Receipt of an already processed reference.
    async fn credit_receipt(&self, reference: &str) -> Result<Option<CreditReceipt>, StoreError>;

    /// Records a processed reference.
    async fn record_credit(&self, receipt: &CreditReceipt) -> Result<(), StoreError>;
}

/// Every repository the settlement core uses.
pub trait SettlementStore:
    DriverRepository
    + FleetRepository
    + StationRepository
    + RedemptionLog
    + WalletDirectory
    + SecretStore
    + CreditJournal
{
}

impl<T> SettlementStore for T where
    T: DriverRepository
        + FleetRepository
        + StationRepository
        + RedemptionLog
        + WalletDirectory
        + SecretStore
        + CreditJournal
{
}

/// Serializable state of a [`MemoryStore`]. Secrets are never part of it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Book {
    stations: BTreeMap<StationId, Station>,
    drivers: BTreeMap<DriverId, DriverProfile>,
    fleets: BTreeMap<FleetId, Fleet>,
    redemptions: Vec<Redemption>,
    payers: BTreeMap<String, AccountId>,
    credits: BTreeMap<String, CreditReceipt>,
}

/// In-process store backed by one mutex.
#[derive(Default)]
pub struct MemoryStore {
    book: Mutex<Book>,
    secrets: Mutex<HashMap<AccountId, SigningSecret>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from JSON; missing file -> empty store.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = fs::read(path).map_err(|e| StoreError::Io(e.to_string()))?;
        let book: Book = serde_json::from_slice(&bytes).map_err(|e| StoreError::Codec(e.to_string()))?;
        Ok(Self {
            book: Mutex::new(book),
            secrets: Mutex::default(),
        })
    }

    /// Persist to JSON.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let data = {
            let book = self.book()?;
            serde_json::to_vec_pretty(&*book).map_err(|e| StoreError::Codec(e.to_string()))?
        };
        fs::write(path, data).map_err(|e| StoreError::Io(e.to_string()))
    }

    fn book(&self) -> Result<MutexGuard<'_, Book>, StoreError> {
        self.book.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Inserts or replaces a driver.
    pub fn insert_driver(&self, driver: DriverProfile) -> Result<(), StoreError> {
        self.book()?.drivers.insert(driver.id.clone(), driver);
        Ok(())
    }

    /// Inserts or replaces a fleet.
    pub fn insert_fleet(&self, fleet: Fleet) -> Result<(), StoreError> {
        self.book()?.fleets.insert(fleet.id.clone(), fleet);
        Ok(())
    }

    /// Inserts or replaces a station.
    pub fn insert_station(&self, station: Station) -> Result<(), StoreError> {
        self.book()?.stations.insert(station.id.clone(), station);
        Ok(())
    }

    /// Keeps the signing secret of `wallet`.
    pub fn insert_wallet(&self, wallet: Wallet) -> Result<(), StoreError> {
        let (identity, secret) = wallet.into_parts();
        self.secrets
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .insert(identity, secret);
        Ok(())
    }

    /// Routes external payments from `payer` to `wallet`.
    pub fn link_payer(&self, payer: impl Into<String>, wallet: AccountId) -> Result<(), StoreError> {
        self.book()?.payers.insert(payer.into(), wallet);
        Ok(())
    }

    /// Number of audit records.
    pub fn redemption_count(&self) -> usize {
        self.book().map(|book| book.redemptions.len()).unwrap_or(0)
    }
}

#[async_trait]
impl DriverRepository for MemoryStore {
    async fn load_driver(&self, id: &DriverId) -> Result<Option<DriverProfile>, StoreError> {
        Ok(self.book()?.drivers.get(id).cloned())
    }

    async fn driver_by_wallet(&self, wallet: &AccountId) -> Result<Option<DriverProfile>, StoreError> {
        Ok(self
            .book()?
            .drivers
            .values()
            .find(|driver| &driver.wallet == wallet)
            .cloned())
    }

    async fn load_driver_limits(&self, id: &DriverId) -> Result<Option<DriverLimits>, StoreError> {
        Ok(self.book()?.drivers.get(id).map(|driver| driver.limits.clone()))
    }

    async fn save_driver_limits(&self, id: &DriverId, limits: &DriverLimits) -> Result<(), StoreError> {
        if let Some(driver) = self.book()?.drivers.get_mut(id) {
            driver.limits = limits.clone();
        }
        Ok(())
    }

    async fn save_driver(&self, driver: &DriverProfile) -> Result<(), StoreError> {
        self.book()?.drivers.insert(driver.id.clone(), driver.clone());
        Ok(())
    }

    async fn set_driver_active(&self, id: &DriverId, active: bool) -> Result<bool, StoreError> {
        Ok(match self.book()?.drivers.get_mut(id) {
            Some(driver) => {
                driver.active = active;
                true
            }
            None => false,
        })
    }

    async fn reset_period(&self, period: Period) -> Result<usize, StoreError> {
        let mut book = self.book()?;
        for driver in book.drivers.values_mut() {
            driver.limits.reset(period);
        }
        Ok(book.drivers.len())
    }
}

#[async_trait]
impl FleetRepository for MemoryStore {
    async fn load_fleet(&self, id: &FleetId) -> Result<Option<Fleet>, StoreError> {
        Ok(self.book()?.fleets.get(id).cloned())
    }

    async fn load_fleet_budget(&self, id: &FleetId) -> Result<Option<FleetBudget>, StoreError> {
        Ok(self.book()?.fleets.get(id).map(|fleet| fleet.budget))
    }

    async fn save_fleet_budget(&self, id: &FleetId, budget: &FleetBudget) -> Result<(), StoreError> {
        if let Some(fleet) = self.book()?.fleets.get_mut(id) {
            fleet.budget = *budget;
        }
        Ok(())
    }

    async fn credit_fleet_budget(&self, id: &FleetId, amount: Amount) -> Result<FleetBudget, SettlementError> {
        let mut book = self.book()?;
        let fleet = book.fleets.get_mut(id).ok_or_else(|| SettlementError::NotFound {
            kind: "fleet",
            id: id.to_string(),
        })?;
        fleet.budget.fund(amount)?;
        Ok(fleet.budget)
    }

    async fn charge_fleet_budget(&self, id: &FleetId, amount: Amount) -> Result<FleetBudget, SettlementError> {
        let mut book = self.book()?;
        let fleet = book.fleets.get_mut(id).ok_or_else(|| SettlementError::NotFound {
            kind: "fleet",
            id: id.to_string(),
        })?;
        fleet.budget.charge(amount)?;
        Ok(fleet.budget)
    }

    async fn apply_fleet_purchase(&self, id: &FleetId, receipt: &CreditReceipt) -> Result<FleetBudget, SettlementError> {
        let mut book = self.book()?;
        let mut budget = book
            .fleets
            .get(id)
            .map(|fleet| fleet.budget)
            .ok_or_else(|| SettlementError::NotFound {
                kind: "fleet",
                id: id.to_string(),
            })?;
        let credited = matches!(
            book.credits.get(&receipt.reference).map(|r| &r.status),
            Some(CreditStatus::Credited { .. })
        );
        if credited {
            return Ok(budget);
        }
        budget.fund(receipt.credited)?;
        if let Some(fleet) = book.fleets.get_mut(id) {
            fleet.budget = budget;
        }
        book.credits.insert(receipt.reference.clone(), receipt.clone());
        Ok(budget)
    }
}

#[async_trait]
impl StationRepository for MemoryStore {
    async fn load_station(&self, id: &StationId) -> Result<Option<Station>, StoreError> {
        Ok(self.book()?.stations.get(id).cloned())
    }

    async fn save_station(&self, station: &Station) -> Result<(), StoreError> {
        self.book()?.stations.insert(station.id.clone(), station.clone());
        Ok(())
    }
}

#[async_trait]
impl RedemptionLog for MemoryStore {
    async fn append_redemption(&self, record: &Redemption) -> Result<(), StoreError> {
        self.book()?.redemptions.push(record.clone());
        Ok(())
    }

    async fn redemptions_for_driver(&self, wallet: &AccountId) -> Result<Vec<Redemption>, StoreError> {
        Ok(self
            .book()?
            .redemptions
            .iter()
            .filter(|r| &r.driver_wallet == wallet)
            .cloned()
            .collect())
    }

    async fn redemption(&self, id: &RedemptionId) -> Result<Vec<Redemption>, StoreError> {
        Ok(self
            .book()?
            .redemptions
            .iter()
            .filter(|r| &r.id == id)
            .cloned()
            .collect())
    }

    async fn apply_redemption(
        &self,
        record: &Redemption,
        driver: &DriverId,
        fleet: Option<&FleetId>,
    ) -> Result<(), SettlementError> {
        let mut book = self.book()?;
        let not_found = |kind: &'static str, id: String| SettlementError::NotFound { kind, id };

        // Stage every change before touching the book.
        let mut limits = book
            .drivers
            .get(driver)
            .map(|d| d.limits.clone())
            .ok_or_else(|| not_found("driver", driver.to_string()))?;
        limits.record_spend(record.amount)?;
        let budget = match fleet {
            Some(id) => {
                let mut budget = book
                    .fleets
                    .get(id)
                    .map(|f| f.budget)
                    .ok_or_else(|| not_found("fleet", id.to_string()))?;
                budget.charge(record.amount)?;
                Some((id, budget))
            }
            None => None,
        };
        let mut station = book
            .stations
            .get(&record.station)
            .cloned()
            .ok_or_else(|| not_found("station", record.station.to_string()))?;
        station.record_redemption(record.liters);

        if let Some(d) = book.drivers.get_mut(driver) {
            d.limits = limits;
        }
        if let Some((id, budget)) = budget {
            if let Some(f) = book.fleets.get_mut(id) {
                f.budget = budget;
            }
        }
        book.stations.insert(station.id.clone(), station);
        book.redemptions.push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl WalletDirectory for MemoryStore {
    async fn resolve_payer(&self, payer: &str) -> Result<Option<AccountId>, StoreError> {
        Ok(self.book()?.payers.get(payer).cloned())
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn signing_secret(&self, identity: &AccountId) -> Result<Option<SigningSecret>, StoreError> {
        Ok(self
            .secrets
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .get(identity)
            .cloned())
    }
}

#[async_trait]
impl CreditJournal for MemoryStore {
    async fn credit_receipt(&self, reference: &str) -> Result<Option<CreditReceipt>, StoreError> {
        Ok(self.book()?.credits.get(reference).cloned())
    }

    async fn record_credit(&self, receipt: &CreditReceipt) -> Result<(), StoreError> {
        self.book()?
            .credits
            .insert(receipt.reference.clone(), receipt.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Network;
    use crate::geo::GeoPoint;
    use crate::keys::KeyManager;
    use crate::limits::DenialReason;
    use crate::model::{FuelType, RedemptionOutcome};

    struct Fixture {
        store: MemoryStore,
        driver: DriverProfile,
        fleet: Fleet,
        station: Station,
    }

    fn fixture() -> Fixture {
        let keys = KeyManager::new(Network::Testnet);
        let location = GeoPoint::new(-1.2921, 36.8219).unwrap();
        let mut budget = FleetBudget::new();
        budget.fund(Amount::from_units(100)).unwrap();
        let fleet = Fleet {
            id: FleetId::new("fl-1"),
            name: "Matatu Co".into(),
            wallet: keys.create_wallet().identity().clone(),
            budget,
        };
        let driver = DriverProfile {
            id: DriverId::new("dr-1"),
            wallet: keys.create_wallet().identity().clone(),
            fleet: Some(fleet.id.clone()),
            limits: DriverLimits::from_daily(Amount::from_units(50), Amount::from_units(80)),
            allowed_stations: Vec::new(),
            active: true,
        };
        let station = Station::new(
            StationId::new("st-1"),
            "Kenyatta Ave",
            keys.create_wallet().identity().clone(),
            location,
        );
        let store = MemoryStore::new();
        store.insert_driver(driver.clone()).unwrap();
        store.insert_fleet(fleet.clone()).unwrap();
        store.insert_station(station.clone()).unwrap();
        Fixture {
            store,
            driver,
            fleet,
            station,
        }
    }

    fn record(fx: &Fixture, amount: i64, outcome: RedemptionOutcome) -> Redemption {
        Redemption {
            id: RedemptionId::generate(),
            station: fx.station.id.clone(),
            driver: Some(fx.driver.id.clone()),
            driver_wallet: fx.driver.wallet.clone(),
            fuel_type: FuelType::Diesel,
            amount: Amount::from_units(amount),
            liters: 12.5,
            price_per_liter: None,
            location: Some(fx.station.location),
            vehicle_id: None,
            timestamp: 1,
            outcome,
            supersedes: None,
        }
    }

    fn completed() -> RedemptionOutcome {
        RedemptionOutcome::Completed {
            tx_hash: "00".repeat(32),
            ledger: 2,
        }
    }

    #[tokio::test]
    async fn apply_redemption_updates_every_party() {
        let fx = fixture();
        let rec = record(&fx, 30, completed());
        fx.store
            .apply_redemption(&rec, &fx.driver.id, Some(&fx.fleet.id))
            .await
            .unwrap();

        let limits = fx.store.load_driver_limits(&fx.driver.id).await.unwrap().unwrap();
        assert_eq!(limits.daily_spent, Amount::from_units(30));
        assert_eq!(limits.weekly_spent, Amount::from_units(30));
        let budget = fx.store.load_fleet_budget(&fx.fleet.id).await.unwrap().unwrap();
        assert_eq!(budget.remaining(), Amount::from_units(70));
        let station = fx.store.load_station(&fx.station.id).await.unwrap().unwrap();
        assert_eq!(station.total_redemptions, 1);
        assert_eq!(station.total_volume, 12.5);
        assert_eq!(fx.store.redemptions_for_driver(&fx.driver.wallet).await.unwrap(), vec![rec]);
    }

    #[tokio::test]
    async fn failed_bookkeeping_changes_nothing() {
        let fx = fixture();
        let rec = record(&fx, 150, completed());
        let err = fx
            .store
            .apply_redemption(&rec, &fx.driver.id, Some(&fx.fleet.id))
            .await
            .unwrap_err();
        assert_eq!(err, SettlementError::Denied(DenialReason::ExceedsFleetBudget));
        let limits = fx.store.load_driver_limits(&fx.driver.id).await.unwrap().unwrap();
        assert_eq!(limits.daily_spent, Amount::ZERO);
        assert_eq!(fx.store.redemption_count(), 0);
    }

    #[tokio::test]
    async fn superseded_indeterminate_records_are_resolved() {
        let fx = fixture();
        let pending = record(
            &fx,
            5,
            RedemptionOutcome::Indeterminate {
                tx_hash: "ab".repeat(32),
                valid_until: 10,
            },
        );
        fx.store.append_redemption(&pending).await.unwrap();
        assert_eq!(fx.store.unresolved_for_driver(&fx.driver.wallet).await.unwrap().len(), 1);

        let mut resolution = record(
            &fx,
            5,
            RedemptionOutcome::Abandoned {
                tx_hash: "ab".repeat(32),
                detail: "expired".into(),
            },
        );
        resolution.id = pending.id.clone();
        resolution.supersedes = Some(pending.id.clone());
        fx.store.append_redemption(&resolution).await.unwrap();
        assert!(fx.store.unresolved_for_driver(&fx.driver.wallet).await.unwrap().is_empty());
        assert_eq!(fx.store.redemption(&pending.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn drivers_can_be_toggled_and_replaced() {
        let fx = fixture();
        assert!(fx.store.set_driver_active(&fx.driver.id, false).await.unwrap());
        assert!(!fx.store.load_driver(&fx.driver.id).await.unwrap().unwrap().active);
        assert!(!fx.store.set_driver_active(&DriverId::new("dr-404"), false).await.unwrap());

        let mut driver = fx.driver.clone();
        driver.allowed_stations = vec![fx.station.id.clone()];
        fx.store.save_driver(&driver).await.unwrap();
        assert_eq!(fx.store.load_driver(&fx.driver.id).await.unwrap(), Some(driver));
    }

    #[tokio::test]
    async fn fleet_purchases_are_credited_once_per_reference() {
        let fx = fixture();
        let receipt = CreditReceipt {
            reference: "fleet:fl-1:INV-1".into(),
            payer: fx.fleet.id.to_string(),
            wallet: fx.fleet.wallet.clone(),
            paid: Amount::from_units(25),
            credited: Amount::from_units(25),
            tx_hash: "ef".repeat(32),
            status: CreditStatus::Credited { ledger: 4 },
            recorded_at: 1,
        };
        let budget = fx.store.apply_fleet_purchase(&fx.fleet.id, &receipt).await.unwrap();
        assert_eq!(budget.remaining(), Amount::from_units(125));
        let again = fx.store.apply_fleet_purchase(&fx.fleet.id, &receipt).await.unwrap();
        assert_eq!(again, budget);
        assert_eq!(fx.store.credit_receipt("fleet:fl-1:INV-1").await.unwrap(), Some(receipt));
    }

    #[tokio::test]
    async fn period_resets_zero_accumulators() {
        let fx = fixture();
        let mut limits = fx.driver.limits.clone();
        limits.record_spend(Amount::from_units(20)).unwrap();
        fx.store.save_driver_limits(&fx.driver.id, &limits).await.unwrap();
        assert_eq!(fx.store.reset_period(Period::Daily).await.unwrap(), 1);
        let after = fx.store.load_driver_limits(&fx.driver.id).await.unwrap().unwrap();
        assert_eq!(after.daily_spent, Amount::ZERO);
        assert_eq!(after.weekly_spent, Amount::from_units(20));
    }

    #[tokio::test]
    async fn book_survives_a_json_round_trip_without_secrets() {
        let fx = fixture();
        let wallet = KeyManager::new(Network::Testnet).create_wallet();
        let identity = wallet.identity().clone();
        fx.store.insert_wallet(wallet).unwrap();
        fx.store.link_payer("+254700000001", identity.clone()).unwrap();

        let dir = std::env::temp_dir().join(format!("fuel-anchor-store-{}", RedemptionId::generate()));
        let path = dir.join("book.json");
        fx.store.save(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let loaded = MemoryStore::load(&path).unwrap();
        let _ = fs::remove_dir_all(&dir);

        assert_eq!(loaded.load_station(&fx.station.id).await.unwrap(), Some(fx.station.clone()));
        assert_eq!(loaded.resolve_payer("+254700000001").await.unwrap(), Some(identity.clone()));
        assert!(loaded.signing_secret(&identity).await.unwrap().is_none());
        assert!(fx.store.signing_secret(&identity).await.unwrap().is_some());
        assert!(!text.contains("secret"));
    }

    #[test]
    fn missing_file_is_an_empty_store() {
        let store = MemoryStore::load(Path::new("/nonexistent/fuel-anchor/book.json")).unwrap();
        assert_eq!(store.redemption_count(), 0);
    }
}
