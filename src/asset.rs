//! Fixed-point amounts and the settlement asset.

use crate::config::SettlementConfig;
use crate::error::SettlementError;
use crate::keys::AccountId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of decimal places carried by ledger amounts.
pub const DECIMALS: u32 = 7;
/// Base units in one whole unit of an asset.
pub const BASE_UNITS_PER_UNIT: i64 = 10_000_000;

/// Signed count of base units (seven implied decimal places).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    /// Zero.
    pub const ZERO: Amount = Amount(0);
    /// Largest representable amount.
    pub const MAX: Amount = Amount(i64::MAX);

    /// Wraps a raw base-unit count.
    pub const fn from_base_units(units: i64) -> Self {
        Self(units)
    }

    /// Whole units, saturating at the representable range.
    pub fn from_units(units: i64) -> Self {
        Self(units.saturating_mul(BASE_UNITS_PER_UNIT))
    }

    /// Raw base-unit count.
    pub const fn base_units(self) -> i64 {
        self.0
    }

    /// Strictly greater than zero.
    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Checked addition.
    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// Checked subtraction.
    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Saturating addition.
    pub fn saturating_add(self, other: Amount) -> Amount {
        Amount(self.0.saturating_add(other.0))
    }

    /// Saturating subtraction.
    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    /// Multiplies by a fixed-point rate (`rate` is itself an [`Amount`], so a
    /// rate of `Amount::from_units(1)` is the identity).
    pub fn scale(self, rate: Amount) -> Option<Amount> {
        let product = i128::from(self.0).checked_mul(i128::from(rate.0))?;
        i64::try_from(product / i128::from(BASE_UNITS_PER_UNIT))
            .ok()
            .map(Amount)
    }

    /// Rejects zero and negative amounts.
    pub fn require_positive(self) -> Result<Amount, SettlementError> {
        if self.is_positive() {
            Ok(self)
        } else {
            Err(SettlementError::InvalidAmount(format!(
                "amount must be positive, got {self}"
            )))
        }
    }

    /// Parses a decimal string such as `"12.5"` or `"-0.0000001"`.
    pub fn parse(input: &str) -> Result<Amount, SettlementError> {
        let invalid = || SettlementError::InvalidAmount(format!("cannot parse {input:?}"));
        let trimmed = input.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (whole, fraction) = match digits.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (digits, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        if fraction.len() > DECIMALS as usize
            || !whole.chars().all(|c| c.is_ascii_digit())
            || !fraction.chars().all(|c| c.is_ascii_digit())
        {
            return Err(invalid());
        }
        let whole_units: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let mut fraction_units: i64 = 0;
        for (idx, digit) in fraction.bytes().enumerate() {
            let weight = 10_i64.pow(DECIMALS - 1 - idx as u32);
            fraction_units += i64::from(digit - b'0') * weight;
        }
        let magnitude = whole_units
            .checked_mul(BASE_UNITS_PER_UNIT)
            .and_then(|v| v.checked_add(fraction_units))
            .ok_or_else(invalid)?;
        Ok(Amount(if negative { -magnitude } else { magnitude }))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let magnitude = self.0.unsigned_abs();
        let per_unit = BASE_UNITS_PER_UNIT as u64;
        write!(
            f,
            "{sign}{}.{:07}",
            magnitude / per_unit,
            magnitude % per_unit
        )
    }
}

impl FromStr for Amount {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::parse(s)
    }
}

/// Asset identified by code and issuing account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Asset {
    /// Short asset code, e.g. `FUEL`.
    pub code: String,
    /// Issuing account.
    pub issuer: AccountId,
}

impl Asset {
    /// Builds an asset descriptor.
    pub fn new(code: impl Into<String>, issuer: AccountId) -> Self {
        Self {
            code: code.into(),
            issuer,
        }
    }

    /// True when both code and issuer match `other`.
    pub fn matches(&self, code: &str, issuer: &AccountId) -> bool {
        self.code == code && &self.issuer == issuer
    }

    /// True when this is the configured settlement asset.
    pub fn is_settlement(&self, config: &SettlementConfig) -> bool {
        self.matches(&config.asset.code, &config.asset.issuer)
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.code, self.issuer)
    }
}

/// Holding of one asset on an account, together with its authorized ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Asset held.
    pub asset: Asset,
    /// Current balance.
    pub amount: Amount,
    /// Holding ceiling of the authorization record.
    pub limit: Amount,
}
