//! Caller-facing error taxonomy.
//!
//! Every failure that leaves the settlement core is a [`SettlementError`]. Each
//! variant carries a stable machine-readable code ([`SettlementError::code`]) and
//! a class ([`ErrorClass`]) that tells the caller whether a retry can ever help.

use crate::limits::DenialReason;
use thiserror::Error;

/// Broad retry/reporting class of a [`SettlementError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Malformed input, rejected before any network call. Never retried.
    Validation,
    /// Business rule refusal (geofence, limits, inactive parties). Never retried.
    Policy,
    /// Connectivity or deadline failure. Reads and simulations may be retried;
    /// submitted transactions must be reconciled by hash first.
    NetworkTransient,
    /// The ledger evaluated the request and refused it.
    NetworkTerminal,
    /// A previous attempt has an unknown outcome that must be resolved first.
    Reconciliation,
    /// Local configuration, key or storage failure.
    Internal,
}

/// Structured failure reported by every settlement operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SettlementError {
    #[error("invalid location: {0}")]
    /// Latitude/longitude out of range or not finite.
    InvalidLocation(String),
    #[error("invalid amount: {0}")]
    /// Zero, negative or unparsable amount.
    InvalidAmount(String),
    #[error("memo exceeds {max} bytes")]
    /// Transaction memo longer than the configured bound.
    MemoTooLong {
        /// Configured byte bound.
        max: usize,
    },
    #[error("station does not price fuel type {0}")]
    /// Station has no price entry for the requested fuel type.
    UnknownFuelType(String),
    #[error("malformed identity: {0}")]
    /// Account or contract identity failed to decode.
    MalformedIdentity(String),

    #[error("station {0} is not active")]
    /// Station is deactivated.
    StationInactive(String),
    #[error("driver {0} is not active")]
    /// Driver is deactivated by the fleet operator.
    DriverInactive(String),
    #[error("station {station} is not in the allowed list of driver {driver}")]
    /// Driver is restricted to a set of stations that excludes this one.
    StationNotAllowed {
        /// Driver identifier.
        driver: String,
        /// Station identifier.
        station: String,
    },
    #[error("location is {distance_m:.1}m from the station, geofence radius is {radius_m:.1}m")]
    /// Driver is outside the station geofence.
    OutOfGeofence {
        /// Great-circle distance in metres.
        distance_m: f64,
        /// Station geofence radius in metres.
        radius_m: f64,
    },
    #[error("spend denied: {0}")]
    /// Limit enforcement refused the amount.
    Denied(DenialReason),
    #[error("test network funding is disabled on a production network")]
    /// Faucet funding requested against a production network.
    ProductionFundingDisabled,
    #[error("secret export is disabled on a production network")]
    /// Wallet secret export requested against a production network.
    SecretExportDisabled,

    #[error("{kind} {id} not found")]
    /// A referenced entity does not exist.
    NotFound {
        /// Entity kind (`station`, `driver`, `account`, ...).
        kind: &'static str,
        /// Identifier that failed to resolve.
        id: String,
    },

    #[error("ledger request timed out{}", hash_suffix(.hash))]
    /// Deadline exceeded. When `hash` is set the transaction was submitted and may
    /// still apply.
    Timeout {
        /// Hash of the submitted transaction, if submission happened.
        hash: Option<String>,
    },
    #[error("ledger transport error: {0}")]
    /// Connection-level failure talking to the ledger.
    Transport(String),

    #[error("sequence conflict on account {0}")]
    /// The ledger rejected the transaction sequence number.
    SequenceConflict(String),
    #[error("insufficient balance: {0}")]
    /// Source account cannot cover the amount.
    InsufficientBalance(String),
    #[error("account {0} is not authorized to hold the settlement asset")]
    /// Destination lacks an authorization record for the settlement asset.
    UnauthorizedAsset(String),
    #[error("ledger rejected transaction: {0}")]
    /// Any other ledger-side refusal.
    NetworkRejected(String),
    #[error("contract simulation rejected the call: {0}")]
    /// Contract simulation failed; nothing was submitted.
    InvocationRejected(String),

    #[error("an identical invocation is already {0}")]
    /// Same contract call is still being processed.
    InvocationInFlight(String),
    #[error("transaction {hash} has an unknown outcome; reconcile before retrying")]
    /// A previous attempt timed out and must be reconciled by hash.
    ReconciliationRequired {
        /// Hash of the unresolved transaction.
        hash: String,
    },

    #[error("key error: {0}")]
    /// Key decoding or signing failure.
    Key(String),
    #[error("store error: {0}")]
    /// Repository failure.
    Store(String),
    #[error("configuration error: {0}")]
    /// Missing or invalid configuration.
    Config(String),
}

fn hash_suffix(hash: &Option<String>) -> String {
    match hash {
        Some(hash) => format!(" (transaction {hash})"),
        None => String::new(),
    }
}

impl SettlementError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidLocation(_) => "INVALID_LOCATION",
            Self::InvalidAmount(_) => "INVALID_AMOUNT",
            Self::MemoTooLong { .. } => "MEMO_TOO_LONG",
            Self::UnknownFuelType(_) => "UNKNOWN_FUEL_TYPE",
            Self::MalformedIdentity(_) => "MALFORMED_IDENTITY",
            Self::StationInactive(_) => "STATION_INACTIVE",
            Self::DriverInactive(_) => "DRIVER_INACTIVE",
            Self::StationNotAllowed { .. } => "STATION_NOT_ALLOWED",
            Self::OutOfGeofence { .. } => "OUT_OF_GEOFENCE",
            Self::Denied(reason) => reason.code(),
            Self::ProductionFundingDisabled => "PRODUCTION_FUNDING_DISABLED",
            Self::SecretExportDisabled => "SECRET_EXPORT_DISABLED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::SequenceConflict(_) => "SEQUENCE_CONFLICT",
            Self::InsufficientBalance(_) => "INSUFFICIENT_BALANCE",
            Self::UnauthorizedAsset(_) => "UNAUTHORIZED_ASSET",
            Self::NetworkRejected(_) => "NETWORK_REJECTED",
            Self::InvocationRejected(_) => "INVOCATION_REJECTED",
            Self::InvocationInFlight(_) => "INVOCATION_IN_FLIGHT",
            Self::ReconciliationRequired { .. } => "RECONCILIATION_REQUIRED",
            Self::Key(_) => "KEY_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Retry/reporting class.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidLocation(_)
            | Self::InvalidAmount(_)
            | Self::MemoTooLong { .. }
            | Self::UnknownFuelType(_)
            | Self::MalformedIdentity(_) => ErrorClass::Validation,
            Self::StationInactive(_)
            | Self::DriverInactive(_)
            | Self::StationNotAllowed { .. }
            | Self::OutOfGeofence { .. }
            | Self::Denied(_)
            | Self::ProductionFundingDisabled
            | Self::SecretExportDisabled
            | Self::NotFound { .. } => ErrorClass::Policy,
            Self::Timeout { .. } | Self::Transport(_) => ErrorClass::NetworkTransient,
            Self::SequenceConflict(_)
            | Self::InsufficientBalance(_)
            | Self::UnauthorizedAsset(_)
            | Self::NetworkRejected(_)
            | Self::InvocationRejected(_) => ErrorClass::NetworkTerminal,
            Self::InvocationInFlight(_) | Self::ReconciliationRequired { .. } => {
                ErrorClass::Reconciliation
            }
            Self::Key(_) | Self::Store(_) | Self::Config(_) => ErrorClass::Internal,
        }
    }

    /// True when repeating the same read-only request (or simulation) may succeed.
    ///
    /// A timeout that carries a transaction hash is never retryable: the
    /// transaction may have applied.
    pub fn is_retryable_read(&self) -> bool {
        match self {
            Self::Timeout { hash } => hash.is_none(),
            Self::Transport(_) => true,
            _ => false,
        }
    }

    /// Hash of a submitted transaction whose outcome is unknown.
    pub fn unresolved_hash(&self) -> Option<&str> {
        match self {
            Self::Timeout { hash: Some(hash) } => Some(hash),
            Self::ReconciliationRequired { hash } => Some(hash),
            _ => None,
        }
    }
}
