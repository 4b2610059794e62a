//! Test-network account funding.

use crate::keys::AccountId;
use async_trait::async_trait;
use thiserror::Error;

/// Faucet failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FaucetError {
    #[error("faucet request failed: {0}")]
    /// Connection or timeout failure.
    Transport(String),
    #[error("faucet returned status {status}: {body}")]
    /// Non-success HTTP status.
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },
}

/// Funds freshly created accounts on a test network.
#[async_trait]
pub trait Faucet: Send + Sync {
    /// Requests starter funds for `identity`.
    async fn fund(&self, identity: &AccountId) -> Result<(), FaucetError>;
}

#[cfg(feature = "net")]
pub use friendbot::FriendbotFaucet;

#[cfg(feature = "net")]
mod friendbot {
    use super::{Faucet, FaucetError};
    use crate::keys::AccountId;
    use async_trait::async_trait;
    use reqwest::Client;
    use std::time::Duration;

    const MAX_BODY_CHARS: usize = 256;

    /// HTTP faucet that funds `GET {base}?addr={identity}`.
    #[derive(Debug, Clone)]
    pub struct FriendbotFaucet {
        base_url: String,
        client: Client,
    }

    impl FriendbotFaucet {
        /// Builds a faucet client with a request timeout.
        pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FaucetError> {
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|err| FaucetError::Transport(err.to_string()))?;
            Ok(Self {
                base_url: base_url.into(),
                client,
            })
        }
    }

    #[async_trait]
    impl Faucet for FriendbotFaucet {
        async fn fund(&self, identity: &AccountId) -> Result<(), FaucetError> {
            let response = self
                .client
                .get(&self.base_url)
                .query(&[("addr", identity.as_str())])
                .send()
                .await
                .map_err(|err| FaucetError::Transport(err.to_string()))?;
            let status = response.status();
            if status.is_success() {
                return Ok(());
            }
            let body = response.text().await.unwrap_or_default();
            Err(FaucetError::Status {
                status: status.as_u16(),
                body: body.chars().take(MAX_BODY_CHARS).collect(),
            })
        }
    }
}
