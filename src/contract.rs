//! Contract invocation: simulate, assemble, sign, send, poll.
//!
//! Every call in flight is tracked by an [`InvocationKey`]. An identical call
//! cannot start while another is in progress, and a call that timed out stays
//! tracked until [`ContractInvoker::reconcile`] learns what happened to it.

use crate::asset::Amount;
use crate::error::SettlementError;
use crate::keys::{AccountId, SigningSecret};
use crate::ledger::tx::now_secs;
use crate::ledger::{
    ContractId, ContractValue, InvocationStatus, LedgerError, Operation, SendStatus,
    SimulationOutcome, Transaction, TransactionBuilder, TransactionEnvelope, TxHash,
};
use crate::submit::Submitter;
use blake2::digest::{consts::U32, Digest};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{runtime::Handle, task::JoinHandle, time};
use tracing::{debug, info, warn};

type Blake2b256 = blake2::Blake2b<U32>;

/// Function recorded on the credit-score contract after each purchase.
pub const RECORD_TRANSACTION_FN: &str = "record_transaction";

/// Lifecycle of one contract call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationState {
    /// Registered, nothing sent.
    Init,
    /// Dry-run in progress.
    Simulating,
    /// Footprint attached.
    Assembled,
    /// Envelope signed.
    Signed,
    /// Handed to the network.
    Submitted,
    /// Accepted, waiting for inclusion.
    Pending,
    /// Included and succeeded.
    Success,
    /// Included and failed.
    Failed,
    /// Deadline passed with no verdict.
    TimedOut,
}

impl InvocationState {
    /// Lower-case label.
    pub fn label(&self) -> &'static str {
        match self {
            InvocationState::Init => "init",
            InvocationState::Simulating => "simulating",
            InvocationState::Assembled => "assembled",
            InvocationState::Signed => "signed",
            InvocationState::Submitted => "submitted",
            InvocationState::Pending => "pending",
            InvocationState::Success => "success",
            InvocationState::Failed => "failed",
            InvocationState::TimedOut => "timed out",
        }
    }
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A contract function call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractCall {
    /// Target contract.
    pub contract: ContractId,
    /// Function name.
    pub function: String,
    /// Arguments.
    pub args: Vec<ContractValue>,
}

impl ContractCall {
    /// Call of `function` on `contract`.
    pub fn new(contract: ContractId, function: impl Into<String>, args: Vec<ContractValue>) -> Self {
        Self {
            contract,
            function: function.into(),
            args,
        }
    }

    fn operation(&self) -> Operation {
        Operation::InvokeContract {
            contract: self.contract.clone(),
            function: self.function.clone(),
            args: self.args.clone(),
        }
    }
}

/// BLAKE2b-256 digest identifying a call by signer, contract, function and arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvocationKey([u8; 32]);

impl InvocationKey {
    /// Key of `call` signed by `signer`.
    pub fn new(signer: &AccountId, call: &ContractCall) -> Result<Self, SettlementError> {
        let args = serde_json::to_vec(&call.args).map_err(|e| LedgerError::Malformed(e.to_string()))?;
        let mut hasher = Blake2b256::new();
        for part in [
            signer.as_str().as_bytes(),
            call.contract.as_str().as_bytes(),
            call.function.as_bytes(),
            args.as_slice(),
        ] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&hasher.finalize());
        Ok(Self(key))
    }
}

impl fmt::Display for InvocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Terminal result of [`ContractInvoker::invoke`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// The call applied.
    Success {
        /// Transaction hash.
        hash: TxHash,
        /// Contract return value.
        result: ContractValue,
        /// Ledger that included it.
        ledger: u32,
    },
    /// The call was included and failed.
    Failed {
        /// Transaction hash.
        hash: TxHash,
        /// Ledger-reported detail.
        detail: String,
    },
    /// No verdict before the deadline. The call may still apply; reconcile
    /// before retrying.
    TimedOut {
        /// Transaction hash to reconcile.
        hash: TxHash,
    },
}

/// What [`ContractInvoker::reconcile`] found for a timed-out call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// It applied after all.
    Applied {
        /// Contract return value.
        result: ContractValue,
        /// Ledger that included it.
        ledger: u32,
    },
    /// It was included and failed.
    Failed {
        /// Ledger-reported detail.
        detail: String,
    },
    /// Its validity window closed without inclusion.
    NeverApplied,
}

#[derive(Debug, Clone)]
struct Tracked {
    state: InvocationState,
    hash: Option<TxHash>,
    valid_until: u64,
}

type Registry = Arc<Mutex<HashMap<InvocationKey, Tracked>>>;

struct Registration {
    registry: Registry,
    key: InvocationKey,
    keep: bool,
}

impl Registration {
    fn update(&self, apply: impl FnOnce(&mut Tracked)) {
        if let Ok(mut map) = self.registry.lock() {
            if let Some(tracked) = map.get_mut(&self.key) {
                apply(tracked);
            }
        }
    }

    fn advance(&self, state: InvocationState) {
        debug!(evt = "INVOKE_STATE", key = %self.key, state = state.label(), "invocation advanced");
        self.update(|tracked| tracked.state = state);
    }

    fn submitted(&self, hash: TxHash, valid_until: u64) {
        self.advance(InvocationState::Submitted);
        self.update(|tracked| {
            tracked.hash = Some(hash);
            tracked.valid_until = valid_until;
        });
    }

    fn timed_out(mut self) {
        self.advance(InvocationState::TimedOut);
        self.keep = true;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Ok(mut map) = self.registry.lock() {
            map.remove(&self.key);
        }
    }
}

/// Runs contract calls through the simulate/send/poll state machine.
#[derive(Clone)]
pub struct ContractInvoker {
    submitter: Submitter,
    poll_interval: Duration,
    poll_deadline: Duration,
    registry: Registry,
}

impl ContractInvoker {
    /// Invoker sharing the sequence queue of `submitter`, polling with the
    /// client's configured interval and deadline.
    pub fn new(submitter: Submitter) -> Self {
        let timeouts = submitter.client().timeouts();
        Self {
            submitter,
            poll_interval: timeouts.poll_interval,
            poll_deadline: timeouts.poll_deadline,
            registry: Arc::default(),
        }
    }

    /// State of a tracked call; `None` once it reached a verdict.
    pub fn state_of(&self, key: &InvocationKey) -> Option<InvocationState> {
        self.registry.lock().ok()?.get(key).map(|tracked| tracked.state)
    }

    fn register(&self, key: InvocationKey) -> Result<Registration, SettlementError> {
        let mut map = self
            .registry
            .lock()
            .map_err(|_| SettlementError::Store("invocation registry poisoned".into()))?;
        if let Some(existing) = map.get(&key) {
            return Err(match (&existing.state, &existing.hash) {
                (InvocationState::TimedOut, Some(hash)) => SettlementError::ReconciliationRequired {
                    hash: hash.to_string(),
                },
                (state, _) => SettlementError::InvocationInFlight(state.to_string()),
            });
        }
        map.insert(
            key,
            Tracked {
                state: InvocationState::Init,
                hash: None,
                valid_until: 0,
            },
        );
        Ok(Registration {
            registry: Arc::clone(&self.registry),
            key,
            keep: false,
        })
    }

    /// Runs `call` signed by `secret`.
    ///
    /// A simulation failure is reported as `InvocationRejected` and nothing is
    /// sent. Errors before sending leave no trace; a `TimedOut` outcome keeps
    /// the call tracked until reconciled.
    pub async fn invoke(
        &self,
        secret: &SigningSecret,
        call: &ContractCall,
    ) -> Result<InvocationOutcome, SettlementError> {
        let signer = secret.identity();
        let key = InvocationKey::new(&signer, call)?;
        let registration = self.register(key)?;
        let client = self.submitter.client();
        info!(evt = "INVOKE_START", key = %key, contract = %call.contract, function = %call.function, "contract call");

        let lease = self.submitter.sequences().lease(&signer).await?;
        let mut sequence = lease.current(client).await?;
        registration.advance(InvocationState::Simulating);
        let footprint = match client.simulate(&self.transaction(&signer, sequence, call)).await? {
            SimulationOutcome::Ok { footprint, .. } => footprint,
            SimulationOutcome::Rejected { detail } => {
                warn!(evt = "INVOKE_SIM_REJECTED", key = %key, detail = %detail, "simulation failed");
                return Err(SettlementError::InvocationRejected(detail));
            }
        };

        let mut refreshed = false;
        let (envelope, hash) = loop {
            registration.advance(InvocationState::Assembled);
            let tx = self.transaction(&signer, sequence, call).assemble(footprint.clone());
            let envelope = TransactionEnvelope::sign(tx, client.passphrase(), secret)?;
            let hash = envelope.hash(client.passphrase())?;
            registration.advance(InvocationState::Signed);

            registration.submitted(hash.clone(), envelope.tx.time_bounds.max_time);
            let response = match client.send(&envelope).await {
                Ok(response) => response,
                Err(err) if err.unresolved_hash().is_some() => {
                    lease.invalidate();
                    warn!(evt = "INVOKE_SEND_UNKNOWN", key = %key, hash = %hash, "send outcome unknown");
                    registration.timed_out();
                    return Ok(InvocationOutcome::TimedOut { hash });
                }
                Err(err) => {
                    lease.invalidate();
                    return Err(err);
                }
            };
            match response.status {
                SendStatus::Pending | SendStatus::Duplicate => break (envelope, hash),
                SendStatus::TryAgainLater => {
                    lease.invalidate();
                    return Err(SettlementError::Transport("ledger asked to try again later".into()));
                }
                SendStatus::Error(codes) => match codes.to_error(&signer) {
                    SettlementError::SequenceConflict(_) if !refreshed => {
                        refreshed = true;
                        warn!(evt = "INVOKE_BAD_SEQ", key = %key, sequence = envelope.tx.sequence, "stale sequence, refreshing once");
                        sequence = lease.refresh(client).await?;
                    }
                    err => {
                        lease.invalidate();
                        return Err(err);
                    }
                },
            }
        };

        registration.advance(InvocationState::Pending);
        match time::timeout(self.poll_deadline, self.poll(&hash)).await {
            Ok(InvocationStatus::Success { result, ledger }) => {
                lease.commit(envelope.tx.sequence);
                registration.advance(InvocationState::Success);
                info!(evt = "INVOKE_SUCCESS", key = %key, hash = %hash, ledger, "contract call applied");
                Ok(InvocationOutcome::Success { hash, result, ledger })
            }
            Ok(InvocationStatus::Failed { detail }) => {
                lease.commit(envelope.tx.sequence);
                registration.advance(InvocationState::Failed);
                warn!(evt = "INVOKE_FAILED", key = %key, hash = %hash, detail = %detail, "contract call failed");
                Ok(InvocationOutcome::Failed { hash, detail })
            }
            Ok(InvocationStatus::NotFound) | Err(_) => {
                lease.invalidate();
                warn!(
                    evt = "INVOKE_TIMEOUT",
                    key = %key,
                    hash = %hash,
                    deadline_ms = self.poll_deadline.as_millis() as u64,
                    "no verdict before deadline"
                );
                registration.timed_out();
                Ok(InvocationOutcome::TimedOut { hash })
            }
        }
    }

    fn transaction(&self, signer: &AccountId, sequence: i64, call: &ContractCall) -> Transaction {
        TransactionBuilder::with_sequence(signer.clone(), sequence)
            .operation(call.operation())
            .timeout(self.poll_deadline)
            .build()
    }

    async fn poll(&self, hash: &TxHash) -> InvocationStatus {
        let mut ticker = time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            match self.submitter.client().invocation_status(hash).await {
                Ok(InvocationStatus::NotFound) => {}
                Ok(status) => return status,
                Err(err) => debug!(evt = "INVOKE_POLL_ERR", hash = %hash, error = %err, "status poll failed"),
            }
        }
    }

    /// Resolves a timed-out call by querying its transaction hash.
    ///
    /// Still unknown inside its validity window → `ReconciliationRequired`.
    pub async fn reconcile(&self, key: &InvocationKey) -> Result<Resolution, SettlementError> {
        let (hash, valid_until) = {
            let map = self
                .registry
                .lock()
                .map_err(|_| SettlementError::Store("invocation registry poisoned".into()))?;
            match map.get(key) {
                None => {
                    return Err(SettlementError::NotFound {
                        kind: "invocation",
                        id: key.to_string(),
                    })
                }
                Some(Tracked {
                    state: InvocationState::TimedOut,
                    hash: Some(hash),
                    valid_until,
                }) => (hash.clone(), *valid_until),
                Some(tracked) => return Err(SettlementError::InvocationInFlight(tracked.state.to_string())),
            }
        };
        let resolution = match self.submitter.client().invocation_status(&hash).await? {
            InvocationStatus::Success { result, ledger } => Resolution::Applied { result, ledger },
            InvocationStatus::Failed { detail } => Resolution::Failed { detail },
            InvocationStatus::NotFound if now_secs() > valid_until => Resolution::NeverApplied,
            InvocationStatus::NotFound => {
                return Err(SettlementError::ReconciliationRequired {
                    hash: hash.to_string(),
                })
            }
        };
        if let Ok(mut map) = self.registry.lock() {
            map.remove(key);
        }
        info!(evt = "INVOKE_RECONCILED", key = %key, hash = %hash, resolution = ?resolution, "timed-out call resolved");
        Ok(resolution)
    }
}

/// Records completed purchases on the credit-score contract.
#[derive(Clone)]
pub struct CreditScoreHook {
    invoker: ContractInvoker,
    contract: ContractId,
    signer: SigningSecret,
}

impl CreditScoreHook {
    /// Hook calling `contract`, signed by `signer`.
    pub fn new(invoker: ContractInvoker, contract: ContractId, signer: SigningSecret) -> Self {
        Self {
            invoker,
            contract,
            signer,
        }
    }

    /// The `record_transaction(user, amount, station_count, timestamp)` call.
    pub fn call_for(&self, user: &AccountId, amount: Amount, station_count: u32, timestamp: u64) -> ContractCall {
        ContractCall::new(
            self.contract.clone(),
            RECORD_TRANSACTION_FN,
            vec![
                ContractValue::Address(user.clone()),
                ContractValue::I64(amount.base_units()),
                ContractValue::U64(u64::from(station_count)),
                ContractValue::U64(timestamp),
            ],
        )
    }

    /// Records one purchase and waits for the verdict.
    pub async fn record(
        &self,
        user: &AccountId,
        amount: Amount,
        station_count: u32,
        timestamp: u64,
    ) -> Result<InvocationOutcome, SettlementError> {
        let call = self.call_for(user, amount, station_count, timestamp);
        self.invoker.invoke(&self.signer, &call).await
    }

    /// Records one purchase in the background. Failures are logged only.
    pub fn spawn_record(
        &self,
        user: AccountId,
        amount: Amount,
        station_count: u32,
        timestamp: u64,
    ) -> Option<JoinHandle<()>> {
        let Ok(handle) = Handle::try_current() else {
            warn!(evt = "CREDIT_SCORE_SKIPPED", user = %user, "no runtime for background credit-score update");
            return None;
        };
        let hook = self.clone();
        Some(handle.spawn(async move {
            match hook.record(&user, amount, station_count, timestamp).await {
                Ok(InvocationOutcome::Success { hash, .. }) => {
                    info!(evt = "CREDIT_SCORE_RECORDED", user = %user, hash = %hash, "purchase recorded")
                }
                Ok(other) => warn!(evt = "CREDIT_SCORE_UNRESOLVED", user = %user, outcome = ?other, "purchase not recorded"),
                Err(err) => warn!(evt = "CREDIT_SCORE_FAILED", user = %user, code = err.code(), error = %err, "purchase not recorded"),
            }
        }))
    }
}
