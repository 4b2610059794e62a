#![deny(missing_docs)]

//! # fuel_anchor
//!
//! **fuel_anchor** is the settlement core of a fuel-credit network. Fleets buy a
//! ledger-issued settlement asset, hand it to their drivers under spending
//! limits, and drivers spend it at stations once their reported position is
//! inside the station geofence.
//!
//! The crate covers the parts with real ordering and failure handling:
//!
//! * **Keys and authorization**: [`KeyManager`] provisions ed25519 wallets and
//!   [`AssetAuthorizer`] opens the holding record every holder needs.
//! * **Transfers**: [`TransferEngine`] mints and moves the asset. Submissions
//!   from one account are serialized through the [`SequenceCache`]; a timed-out
//!   submission reports its hash so it can be reconciled instead of retried.
//! * **Contract calls**: [`ContractInvoker`] simulates, assembles, signs, sends
//!   and polls smart-contract invocations, failing fast on duplicates.
//! * **Redemption**: [`RedemptionCoordinator`] checks the station, geofence and
//!   [`LimitEnforcer`] verdict under a per-driver lock, pays the station and
//!   applies the bookkeeping as one store operation.
//! * **Funding**: [`FleetFunding`] and [`PaymentIngress`] turn purchases and
//!   external payments into settlement credit exactly once.
//!
//! The ledger is reached through [`LedgerNetwork`]; [`MemoryLedger`] implements
//! it in process and `HorizonTransport` (feature `net`) over HTTP. Persistence
//! sits behind the repository traits in [`store`].
//!
//! ```rust
//! use fuel_anchor::{haversine_distance_m, GeoPoint};
//!
//! let pump = GeoPoint::new(-1.2833, 36.8167).unwrap();
//! let driver = GeoPoint::new(-1.2834, 36.8167).unwrap();
//! assert!(haversine_distance_m(&pump, &driver) < 100.0);
//! ```

pub mod asset;
pub mod authorizer;
pub mod config;
pub mod contract;
pub mod error;
pub mod faucet;
pub mod fleet;
pub mod geo;
pub mod history;
pub mod ingress;
pub mod keys;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod redemption;
pub mod sequence;
pub mod store;
pub mod submit;
pub mod transfer;

pub use asset::{Amount, Asset, Balance};
pub use authorizer::AssetAuthorizer;
pub use config::{ConfigError, Network, RetryPolicy, SettlementConfig, Timeouts};
pub use contract::{
    ContractCall, ContractInvoker, CreditScoreHook, InvocationKey, InvocationOutcome,
    InvocationState, Resolution,
};
pub use error::{ErrorClass, SettlementError};
pub use faucet::{Faucet, FaucetError};
#[cfg(feature = "net")]
pub use faucet::FriendbotFaucet;
pub use fleet::{Distribution, FleetFunding, FleetPurchase};
pub use geo::{haversine_distance_m, GeoPoint, Geofence, DEFAULT_GEOFENCE_RADIUS_M};
pub use history::{find_by_memo, HistoryPager, HistoryWatcher};
pub use ingress::{CreditReceipt, CreditStatus, PaymentIngress};
pub use keys::{AccountId, KeyManager, SigningSecret, Wallet};
#[cfg(feature = "net")]
pub use ledger::HorizonTransport;
pub use ledger::{LedgerClient, LedgerNetwork, MemoryLedger, TxHash};
pub use limits::{Decision, DenialReason, DriverLimits, FleetBudget, LimitEnforcer, Period, SpendSnapshot};
pub use model::{
    DriverId, DriverProfile, Fleet, FleetId, FuelPrice, FuelType, Redemption, RedemptionId,
    RedemptionOutcome, RedemptionRequest, Station, StationId,
};
pub use redemption::RedemptionCoordinator;
pub use sequence::{KeyedLocks, SequenceCache};
pub use store::{MemoryStore, SettlementStore, StoreError};
pub use submit::Submitter;
pub use transfer::{TransferEngine, TransferReceipt, TransferStatus};
