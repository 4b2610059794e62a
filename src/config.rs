//! Deployment configuration.
//!
//! Values come from `FUEL_*` environment variables. [`SettlementConfig::from_lookup`]
//! takes any key lookup so configuration parsing can be exercised without touching
//! the process environment.

use crate::asset::{Amount, Asset};
use crate::error::SettlementError;
use crate::keys::{AccountId, SigningSecret};
use crate::ledger::tx::ContractId;
use std::{env, fmt, time::Duration};
use thiserror::Error;

/// Passphrase of the public test network.
pub const TESTNET_PASSPHRASE: &str = "Test SDF Network ; September 2015";
/// Passphrase of the public production network.
pub const MAINNET_PASSPHRASE: &str = "Public Global Stellar Network ; September 2015";

const DEFAULT_ASSET_CODE: &str = "FUEL";
const DEFAULT_HOLDING_CEILING_UNITS: i64 = 1_000_000_000;
const DEFAULT_CONFIRM_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_POLL_DEADLINE_MS: u64 = 30_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 250;
const DEFAULT_MEMO_MAX_BYTES: usize = 28;

/// Configuration failure naming the offending variable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required variable {0}")]
    /// Required variable is unset or empty.
    Missing(&'static str),
    #[error("invalid value for {var}: {detail}")]
    /// Variable is set but does not parse.
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Parse failure detail. Never contains secret material.
        detail: String,
    },
}

impl From<ConfigError> for SettlementError {
    fn from(err: ConfigError) -> Self {
        SettlementError::Config(err.to_string())
    }
}

/// Ledger network the deployment runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Network {
    /// Public test network. Faucet funding and secret export are permitted.
    Testnet,
    /// Public production network.
    Mainnet,
    /// Private or standalone network.
    Custom {
        /// Network passphrase mixed into every transaction hash.
        passphrase: String,
        /// Whether the network carries real value.
        production: bool,
    },
}

impl Network {
    /// Passphrase mixed into transaction hashes.
    pub fn passphrase(&self) -> &str {
        match self {
            Network::Testnet => TESTNET_PASSPHRASE,
            Network::Mainnet => MAINNET_PASSPHRASE,
            Network::Custom { passphrase, .. } => passphrase,
        }
    }

    /// True for networks that carry real value.
    pub fn is_production(&self) -> bool {
        match self {
            Network::Testnet => false,
            Network::Mainnet => true,
            Network::Custom { production, .. } => *production,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Testnet => f.write_str("testnet"),
            Network::Mainnet => f.write_str("mainnet"),
            Network::Custom { .. } => f.write_str("custom"),
        }
    }
}

/// Network deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Wait for a submitted payment to confirm.
    pub confirm: Duration,
    /// Interval between contract status polls.
    pub poll_interval: Duration,
    /// Overall deadline of the contract poll loop.
    pub poll_deadline: Duration,
    /// Per-request timeout for reads and simulations.
    pub request: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            confirm: Duration::from_millis(DEFAULT_CONFIRM_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            poll_deadline: Duration::from_millis(DEFAULT_POLL_DEADLINE_MS),
            request: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

/// Bounded retry for read-only calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Base backoff, doubled per attempt.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }
}

/// Process-wide settlement configuration.
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Target network.
    pub network: Network,
    /// REST gateway for accounts, transactions and history.
    pub horizon_url: Option<String>,
    /// JSON-RPC gateway for contract calls.
    pub rpc_url: Option<String>,
    /// Test faucet endpoint.
    pub friendbot_url: Option<String>,
    /// The settlement asset.
    pub asset: Asset,
    /// Distributor secret used for mints.
    pub distributor_secret: Option<SigningSecret>,
    /// Credit-score contract notified after completed redemptions.
    pub credit_score_contract: Option<ContractId>,
    /// Authorization ceiling for holders.
    pub holding_ceiling: Amount,
    /// Network deadlines.
    pub timeouts: Timeouts,
    /// Read retry policy.
    pub retry: RetryPolicy,
    /// Upper bound for text memos, in bytes.
    pub memo_max_bytes: usize,
    /// Settlement units credited per external payment unit.
    pub payment_rate: Amount,
}

impl SettlementConfig {
    /// Configuration with defaults for everything but the network and asset.
    pub fn new(network: Network, asset: Asset) -> Self {
        let (horizon_url, rpc_url, friendbot_url) = default_endpoints(&network);
        Self {
            network,
            horizon_url,
            rpc_url,
            friendbot_url,
            asset,
            distributor_secret: None,
            credit_score_contract: None,
            holding_ceiling: Amount::from_units(DEFAULT_HOLDING_CEILING_UNITS),
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            memo_max_bytes: DEFAULT_MEMO_MAX_BYTES,
            payment_rate: Amount::from_units(1),
        }
    }

    /// Sets the distributor secret.
    pub fn with_distributor(mut self, secret: SigningSecret) -> Self {
        self.distributor_secret = Some(secret);
        self
    }

    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads configuration through `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let network = match get("FUEL_NETWORK").as_deref() {
            None | Some("testnet") => Network::Testnet,
            Some("mainnet") => Network::Mainnet,
            Some("custom") => Network::Custom {
                passphrase: get("FUEL_NETWORK_PASSPHRASE")
                    .ok_or(ConfigError::Missing("FUEL_NETWORK_PASSPHRASE"))?,
                production: get("FUEL_NETWORK_PRODUCTION")
                    .map(|v| parse_flag(&v))
                    .unwrap_or(false),
            },
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "FUEL_NETWORK",
                    detail: format!("unknown network {other:?}"),
                })
            }
        };

        let issuer_text = get("FUEL_ASSET_ISSUER").ok_or(ConfigError::Missing("FUEL_ASSET_ISSUER"))?;
        let issuer = AccountId::parse(&issuer_text).map_err(|err| ConfigError::Invalid {
            var: "FUEL_ASSET_ISSUER",
            detail: err.to_string(),
        })?;
        let code = get("FUEL_ASSET_CODE").unwrap_or_else(|| DEFAULT_ASSET_CODE.to_string());
        if code.is_empty() || code.len() > 12 || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError::Invalid {
                var: "FUEL_ASSET_CODE",
                detail: "expected 1-12 ASCII alphanumerics".into(),
            });
        }

        let mut config = Self::new(network, Asset::new(code, issuer));
        if let Some(url) = get("FUEL_HORIZON_URL") {
            config.horizon_url = Some(url);
        }
        if let Some(url) = get("FUEL_RPC_URL") {
            config.rpc_url = Some(url);
        }
        if let Some(url) = get("FUEL_FRIENDBOT_URL") {
            config.friendbot_url = Some(url);
        }
        if let Some(secret) = get("FUEL_DISTRIBUTOR_SECRET") {
            // The decode error is dropped so secret bytes never reach a log line.
            let secret = SigningSecret::from_encoded(&secret).map_err(|_| ConfigError::Invalid {
                var: "FUEL_DISTRIBUTOR_SECRET",
                detail: "not a valid signing secret".into(),
            })?;
            config.distributor_secret = Some(secret);
        }
        if let Some(contract) = get("FUEL_CREDIT_SCORE_CONTRACT") {
            config.credit_score_contract = Some(ContractId::new(contract));
        }
        if let Some(ceiling) = get("FUEL_HOLDING_CEILING") {
            config.holding_ceiling = parse_amount("FUEL_HOLDING_CEILING", &ceiling)?;
        }
        if let Some(rate) = get("FUEL_PAYMENT_RATE") {
            config.payment_rate = parse_amount("FUEL_PAYMENT_RATE", &rate)?;
        }
        config.timeouts = Timeouts {
            confirm: parse_millis(&get, "FUEL_CONFIRM_TIMEOUT_MS", config.timeouts.confirm)?,
            poll_interval: parse_millis(&get, "FUEL_POLL_INTERVAL_MS", config.timeouts.poll_interval)?,
            poll_deadline: parse_millis(&get, "FUEL_POLL_DEADLINE_MS", config.timeouts.poll_deadline)?,
            request: parse_millis(&get, "FUEL_REQUEST_TIMEOUT_MS", config.timeouts.request)?,
        };
        config.retry = RetryPolicy {
            attempts: parse_number(&get, "FUEL_RETRY_ATTEMPTS", config.retry.attempts)?.max(1),
            backoff: parse_millis(&get, "FUEL_RETRY_BACKOFF_MS", config.retry.backoff)?,
        };
        config.memo_max_bytes = parse_number(&get, "FUEL_MEMO_MAX_BYTES", config.memo_max_bytes)?;
        Ok(config)
    }

    /// Authorization ceiling for a holder, capped by `requested` when given.
    pub fn ceiling_for(&self, requested: Option<Amount>) -> Amount {
        match requested {
            Some(requested) if requested.is_positive() => requested.min(self.holding_ceiling),
            _ => self.holding_ceiling,
        }
    }
}

fn default_endpoints(network: &Network) -> (Option<String>, Option<String>, Option<String>) {
    match network {
        Network::Testnet => (
            Some("https://horizon-testnet.stellar.org".to_string()),
            Some("https://soroban-testnet.stellar.org".to_string()),
            Some("https://friendbot.stellar.org".to_string()),
        ),
        Network::Mainnet => (Some("https://horizon.stellar.org".to_string()), None, None),
        Network::Custom { .. } => (None, None, None),
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_amount(var: &'static str, value: &str) -> Result<Amount, ConfigError> {
    let amount = Amount::parse(value).map_err(|err| ConfigError::Invalid {
        var,
        detail: err.to_string(),
    })?;
    if !amount.is_positive() {
        return Err(ConfigError::Invalid {
            var,
            detail: "must be positive".into(),
        });
    }
    Ok(amount)
}

fn parse_number<G, T>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.parse::<T>().map_err(|err| ConfigError::Invalid {
            var,
            detail: err.to_string(),
        }),
    }
}

fn parse_millis<G>(get: &G, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let millis: u64 = parse_number(get, var, default.as_millis() as u64)?;
    if millis == 0 {
        return Err(ConfigError::Invalid {
            var,
            detail: "must be greater than zero".into(),
        });
    }
    Ok(Duration::from_millis(millis))
}
