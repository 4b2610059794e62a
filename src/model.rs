//! Stations, drivers, fleets and the redemption audit record.

use crate::asset::Amount;
use crate::error::SettlementError;
use crate::geo::{GeoPoint, Geofence, DEFAULT_GEOFENCE_RADIUS_M};
use crate::keys::AccountId;
use crate::limits::{DriverLimits, FleetBudget};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Text form.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Station identifier.
    StationId
);
string_id!(
    /// Driver identifier.
    DriverId
);
string_id!(
    /// Fleet identifier.
    FleetId
);
string_id!(
    /// Redemption identifier; short enough to ride in a transaction memo.
    RedemptionId
);

impl RedemptionId {
    /// Fresh random identifier (16 hex characters).
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Memo that tags the redemption's payment on the ledger.
    pub fn memo(&self) -> String {
        format!("rd:{}", self.0)
    }
}

/// Fuel grades sold at stations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FuelType {
    /// Regular petrol.
    Petrol,
    /// Diesel.
    Diesel,
    /// Premium petrol.
    Premium,
}

impl FromStr for FuelType {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "petrol" => Ok(FuelType::Petrol),
            "diesel" => Ok(FuelType::Diesel),
            "premium" => Ok(FuelType::Premium),
            other => Err(SettlementError::UnknownFuelType(other.to_string())),
        }
    }
}

impl fmt::Display for FuelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FuelType::Petrol => "petrol",
            FuelType::Diesel => "diesel",
            FuelType::Premium => "premium",
        })
    }
}

/// Price of one fuel grade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FuelPrice {
    /// Grade.
    pub fuel_type: FuelType,
    /// Settlement units per litre.
    pub price_per_liter: Amount,
}

/// Fuel station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    /// Identifier.
    pub id: StationId,
    /// Display name.
    pub name: String,
    /// Wallet receiving redemptions.
    pub wallet: AccountId,
    /// Pump location.
    pub location: GeoPoint,
    /// Geofence radius in metres.
    pub geofence_radius_m: f64,
    /// Price list.
    pub fuel_prices: Vec<FuelPrice>,
    /// Accepting redemptions.
    pub active: bool,
    /// Vetted by an operator.
    pub verified: bool,
    /// Completed redemptions.
    pub total_redemptions: u64,
    /// Litres dispensed through completed redemptions.
    pub total_volume: f64,
}

impl Station {
    /// Active, unverified station with the default geofence and no sales.
    pub fn new(id: StationId, name: impl Into<String>, wallet: AccountId, location: GeoPoint) -> Self {
        Self {
            id,
            name: name.into(),
            wallet,
            location,
            geofence_radius_m: DEFAULT_GEOFENCE_RADIUS_M,
            fuel_prices: Vec::new(),
            active: true,
            verified: false,
            total_redemptions: 0,
            total_volume: 0.0,
        }
    }

    /// Geofence around the pump.
    pub fn geofence(&self) -> Result<Geofence, SettlementError> {
        Geofence::new(self.location, self.geofence_radius_m)
    }

    /// Listed price for `fuel_type`.
    pub fn price_for(&self, fuel_type: FuelType) -> Result<Amount, SettlementError> {
        self.fuel_prices
            .iter()
            .find(|p| p.fuel_type == fuel_type)
            .map(|p| p.price_per_liter)
            .ok_or_else(|| SettlementError::UnknownFuelType(fuel_type.to_string()))
    }

    /// Counts one completed redemption.
    pub fn record_redemption(&mut self, liters: f64) {
        self.total_redemptions = self.total_redemptions.saturating_add(1);
        self.total_volume += liters;
    }
}

/// Driver and the limits their fleet set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverProfile {
    /// Identifier.
    pub id: DriverId,
    /// Driver wallet.
    pub wallet: AccountId,
    /// Funding fleet, if any.
    pub fleet: Option<FleetId>,
    /// Caps and running totals.
    pub limits: DriverLimits,
    /// Stations the driver may use; empty means any.
    pub allowed_stations: Vec<StationId>,
    /// Enabled by the fleet operator.
    pub active: bool,
}

impl DriverProfile {
    /// Rejects inactive drivers and stations outside the allow-list.
    pub fn check_station(&self, station: &StationId) -> Result<(), SettlementError> {
        if !self.active {
            return Err(SettlementError::DriverInactive(self.id.to_string()));
        }
        if !self.allowed_stations.is_empty() && !self.allowed_stations.contains(station) {
            return Err(SettlementError::StationNotAllowed {
                driver: self.id.to_string(),
                station: station.to_string(),
            });
        }
        Ok(())
    }
}

/// Fleet operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fleet {
    /// Identifier.
    pub id: FleetId,
    /// Display name.
    pub name: String,
    /// Wallet that buys and distributes credit.
    pub wallet: AccountId,
    /// Allocation pool.
    pub budget: FleetBudget,
}

/// Final or pending state of a redemption attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RedemptionOutcome {
    /// Payment applied and bookkeeping done.
    Completed {
        /// Payment hash.
        tx_hash: String,
        /// Ledger that included it.
        ledger: u32,
    },
    /// Refused before any payment was submitted, or refused by the ledger.
    Rejected {
        /// Stable error code.
        code: String,
        /// Human-readable detail.
        detail: String,
    },
    /// Payment submitted but its outcome is unknown.
    Indeterminate {
        /// Payment hash.
        tx_hash: String,
        /// Unix second after which the payment can no longer apply.
        valid_until: u64,
    },
    /// Reconciled: the payment never applied.
    Abandoned {
        /// Payment hash.
        tx_hash: String,
        /// What reconciliation found.
        detail: String,
    },
}

impl RedemptionOutcome {
    /// Short status label.
    pub fn label(&self) -> &'static str {
        match self {
            RedemptionOutcome::Completed { .. } => "completed",
            RedemptionOutcome::Rejected { .. } => "rejected",
            RedemptionOutcome::Indeterminate { .. } => "indeterminate",
            RedemptionOutcome::Abandoned { .. } => "abandoned",
        }
    }
}

/// Immutable audit record of one redemption attempt.
///
/// Reconciliation never edits a record; it appends a new one that names the
/// record it resolves in `supersedes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Redemption {
    /// Attempt identifier.
    pub id: RedemptionId,
    /// Station.
    pub station: StationId,
    /// Driver, when the wallet resolved to one.
    pub driver: Option<DriverId>,
    /// Paying wallet.
    pub driver_wallet: AccountId,
    /// Grade.
    pub fuel_type: FuelType,
    /// Settlement amount.
    pub amount: Amount,
    /// Litres dispensed.
    pub liters: f64,
    /// Listed price at the time, when the station prices this grade.
    pub price_per_liter: Option<Amount>,
    /// Reported driver location, when it was valid.
    pub location: Option<GeoPoint>,
    /// Vehicle reference.
    pub vehicle_id: Option<String>,
    /// Unix seconds.
    pub timestamp: u64,
    /// Outcome.
    pub outcome: RedemptionOutcome,
    /// Earlier record this one resolves.
    pub supersedes: Option<RedemptionId>,
}

/// Input to [`crate::redemption::RedemptionCoordinator::redeem`].
#[derive(Debug, Clone, PartialEq)]
pub struct RedemptionRequest {
    /// Station redeemed at.
    pub station: StationId,
    /// Paying wallet.
    pub driver_wallet: AccountId,
    /// Grade.
    pub fuel_type: FuelType,
    /// Settlement amount.
    pub amount: Amount,
    /// Litres dispensed.
    pub liters: f64,
    /// Reported latitude.
    pub latitude: f64,
    /// Reported longitude.
    pub longitude: f64,
    /// Vehicle reference.
    pub vehicle_id: Option<String>,
}
