//! Wallet key material and the key manager.
//!
//! Identities are base64-encoded ed25519 verifying keys. Signing secrets live in
//! [`SigningSecret`], which zeroizes its bytes on drop, redacts itself in `Debug`
//! output and has no `Display` or `Serialize` implementation.

use crate::config::Network;
use crate::error::SettlementError;
use crate::faucet::Faucet;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Errors reported while decoding key material or checking signatures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key decode error: {0}")]
    /// Base64, hex, or ed25519 parsing failure.
    Decode(String),
    #[error("unexpected key length: {0}")]
    /// Buffer did not match the expected key length.
    InvalidLength(usize),
    #[error("signature verification failed: {0}")]
    /// Signature did not verify against the identity.
    BadSignature(String),
}

impl From<KeyError> for SettlementError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::Decode(_) | KeyError::InvalidLength(_) => {
                SettlementError::MalformedIdentity(err.to_string())
            }
            KeyError::BadSignature(_) => SettlementError::Key(err.to_string()),
        }
    }
}

/// Public identity of a ledger account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    /// Parses and validates a base64 ed25519 public key.
    pub fn parse(input: &str) -> Result<Self, KeyError> {
        let verifying = decode_public_key_base64(input.trim())?;
        Ok(Self::from_verifying_key(&verifying))
    }

    /// Identity of a verifying key.
    pub fn from_verifying_key(verifying: &VerifyingKey) -> Self {
        Self(BASE64.encode(verifying.to_bytes()))
    }

    /// Base64 text form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decodes the verifying key behind this identity.
    pub fn verifying_key(&self) -> Result<VerifyingKey, KeyError> {
        decode_public_key_base64(&self.0)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AccountId {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        AccountId::parse(&value)
    }
}

impl From<AccountId> for String {
    fn from(value: AccountId) -> Self {
        value.0
    }
}

/// Opaque ed25519 signing secret. Zeroized on drop.
#[derive(Clone)]
pub struct SigningSecret(Zeroizing<[u8; SECRET_KEY_LENGTH]>);

impl SigningSecret {
    fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self(Zeroizing::new(signing.to_bytes()))
    }

    /// Decodes a secret from base64 or hex text.
    pub fn from_encoded(input: &str) -> Result<Self, KeyError> {
        let trimmed = input.trim();
        let bytes = if trimmed.len() == SECRET_KEY_LENGTH * 2
            && trimmed.chars().all(|c| c.is_ascii_hexdigit())
        {
            Zeroizing::new(hex::decode(trimmed).map_err(|err| KeyError::Decode(err.to_string()))?)
        } else {
            Zeroizing::new(
                BASE64
                    .decode(trimmed)
                    .map_err(|err| KeyError::Decode(err.to_string()))?,
            )
        };
        if bytes.len() != SECRET_KEY_LENGTH {
            return Err(KeyError::InvalidLength(bytes.len()));
        }
        let mut secret = Zeroizing::new([0u8; SECRET_KEY_LENGTH]);
        secret.copy_from_slice(&bytes);
        Ok(Self(secret))
    }

    /// Identity that verifies this secret's signatures.
    pub fn identity(&self) -> AccountId {
        AccountId::from_verifying_key(&self.signing_key().verifying_key())
    }

    /// Signs `payload`.
    pub fn sign(&self, payload: &[u8]) -> Signature {
        self.signing_key().sign(payload)
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.0)
    }

    fn encode(&self) -> Zeroizing<String> {
        Zeroizing::new(BASE64.encode(self.0.as_slice()))
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSecret(<redacted>)")
    }
}

impl PartialEq for SigningSecret {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

/// Key pair minted for one driver, station, fleet or operator account.
#[derive(Debug, Clone)]
pub struct Wallet {
    identity: AccountId,
    secret: SigningSecret,
}

impl Wallet {
    /// Wraps an existing secret.
    pub fn from_secret(secret: SigningSecret) -> Self {
        Self {
            identity: secret.identity(),
            secret,
        }
    }

    /// Public identity.
    pub fn identity(&self) -> &AccountId {
        &self.identity
    }

    /// Signing secret handle.
    pub fn secret(&self) -> &SigningSecret {
        &self.secret
    }

    /// Splits into identity and secret so the secret can move into a secret store.
    pub fn into_parts(self) -> (AccountId, SigningSecret) {
        (self.identity, self.secret)
    }

    /// Exports the secret as text. Only permitted on non-production networks.
    pub fn reveal_secret(&self, network: &Network) -> Result<Zeroizing<String>, SettlementError> {
        if network.is_production() {
            return Err(SettlementError::SecretExportDisabled);
        }
        Ok(self.secret.encode())
    }
}

/// Creates wallets and, on test networks, funds them through a faucet.
#[derive(Clone)]
pub struct KeyManager {
    network: Network,
    faucet: Option<Arc<dyn Faucet>>,
}

impl KeyManager {
    /// Key manager without a faucet.
    pub fn new(network: Network) -> Self {
        Self {
            network,
            faucet: None,
        }
    }

    /// Attaches the faucet used by [`KeyManager::fund_on_test_network`].
    pub fn with_faucet(mut self, faucet: Arc<dyn Faucet>) -> Self {
        self.faucet = Some(faucet);
        self
    }

    /// Network this manager provisions for.
    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Generates a fresh random key pair (256 bits of OS entropy).
    pub fn create_wallet(&self) -> Wallet {
        Wallet::from_secret(SigningSecret::generate())
    }

    /// Requests faucet funding for `identity`.
    pub async fn fund_on_test_network(&self, identity: &AccountId) -> Result<(), SettlementError> {
        if self.network.is_production() {
            return Err(SettlementError::ProductionFundingDisabled);
        }
        let faucet = self
            .faucet
            .as_ref()
            .ok_or_else(|| SettlementError::Config("no faucet configured".into()))?;
        faucet
            .fund(identity)
            .await
            .map_err(|err| SettlementError::Transport(err.to_string()))?;
        info!(evt = "FAUCET_FUNDED", account = %identity, "test account funded");
        Ok(())
    }

    /// Creates a wallet and, on a test network, funds it in the background.
    ///
    /// Funding failures are logged and never fail provisioning. Returns the
    /// funding task handle when one was spawned.
    pub fn provision_wallet(&self) -> (Wallet, Option<JoinHandle<()>>) {
        let wallet = self.create_wallet();
        if self.network.is_production() || self.faucet.is_none() {
            return (wallet, None);
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(evt = "FAUCET_SKIPPED", account = %wallet.identity(), "no async runtime for funding");
            return (wallet, None);
        };
        let manager = self.clone();
        let identity = wallet.identity().clone();
        let handle = runtime.spawn(async move {
            if let Err(err) = manager.fund_on_test_network(&identity).await {
                warn!(evt = "FAUCET_FAILED", account = %identity, error = %err, "test funding failed");
            }
        });
        (wallet, Some(handle))
    }
}

/// Encodes a signature as base64.
pub fn encode_signature_base64(sig: &Signature) -> String {
    BASE64.encode(sig.to_bytes())
}

/// Decodes a base64 signature.
pub fn decode_signature_base64(input: &str) -> Result<Signature, KeyError> {
    let bytes = BASE64
        .decode(input)
        .map_err(|err| KeyError::Decode(err.to_string()))?;
    Signature::from_slice(&bytes).map_err(|err| KeyError::Decode(err.to_string()))
}

/// Decodes a base64 public key.
pub fn decode_public_key_base64(input: &str) -> Result<VerifyingKey, KeyError> {
    let bytes = BASE64
        .decode(input)
        .map_err(|err| KeyError::Decode(err.to_string()))?;
    if bytes.len() != 32 {
        return Err(KeyError::InvalidLength(bytes.len()));
    }
    VerifyingKey::try_from(bytes.as_slice()).map_err(|err| KeyError::Decode(err.to_string()))
}

/// Checks a base64 signature over `payload` against `identity`.
pub fn verify_signature(
    identity: &AccountId,
    payload: &[u8],
    signature_b64: &str,
) -> Result<(), KeyError> {
    let verifying = identity.verifying_key()?;
    let signature = decode_signature_base64(signature_b64)?;
    verifying
        .verify(payload, &signature)
        .map_err(|err| KeyError::BadSignature(err.to_string()))
}
