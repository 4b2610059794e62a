//! In-process ledger.
//!
//! Applies the same acceptance rules as the real network: source signatures,
//! strictly increasing sequence numbers, validity windows, authorization
//! records with holding ceilings, and balances. The asset issuer pays from an
//! unlimited supply. Contract calls are served by registered handlers and
//! resolve after a configurable number of status polls.
//!
//! Faults can be injected to exercise timeout and reconciliation paths.

use super::{
    tx::now_secs, Account, HistoryPage, HistoryQuery, InvocationStatus, LedgerError,
    LedgerNetwork, Operation, Order, ResourceFootprint, ResultCodes, SendResponse, SendStatus,
    SimulationOutcome, SubmitResponse, Transaction, TransactionEnvelope, TransactionRecord, TxHash,
};
use crate::asset::{Amount, Asset, Balance};
use crate::keys::AccountId;
use crate::ledger::tx::{ContractId, ContractValue};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tracing::debug;

const SIMULATED_INSTRUCTIONS: u64 = 1_000_000;
const SIMULATED_RESOURCE_FEE: u32 = 5_000;

/// Arguments handed to a registered contract handler.
#[derive(Debug, Clone)]
pub struct ContractCallContext {
    /// Contract called.
    pub contract: ContractId,
    /// Function name.
    pub function: String,
    /// Arguments.
    pub args: Vec<ContractValue>,
    /// Transaction source.
    pub invoker: AccountId,
}

type ContractHandler = Arc<dyn Fn(&ContractCallContext) -> Result<ContractValue, String> + Send + Sync>;

/// How a stalled submission behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallMode {
    /// Never applies and never answers.
    Drop,
    /// Applies the transaction, then never answers.
    ApplyThenHang,
}

#[derive(Debug, Clone, Default)]
struct Trustline {
    balance: Amount,
    limit: Amount,
}

#[derive(Debug, Clone)]
struct AccountState {
    sequence: i64,
    trustlines: BTreeMap<Asset, Trustline>,
}

struct PendingInvocation {
    polls_left: u32,
    tx: Transaction,
    outcome: InvocationStatus,
}

#[derive(Default)]
struct LedgerState {
    latest_ledger: u32,
    next_paging: u64,
    accounts: HashMap<AccountId, AccountState>,
    txs: HashMap<TxHash, TransactionRecord>,
    history: HashMap<AccountId, Vec<TxHash>>,
    contracts: HashMap<ContractId, ContractHandler>,
    pending: HashMap<TxHash, PendingInvocation>,
    resolved: HashMap<TxHash, InvocationStatus>,
    injected: VecDeque<ResultCodes>,
    stall_submissions: Option<StallMode>,
    stall_invocations: bool,
    throttle_sends: bool,
}

/// In-process [`LedgerNetwork`].
pub struct MemoryLedger {
    passphrase: String,
    confirm_polls: u32,
    yield_points: bool,
    state: Mutex<LedgerState>,
    submissions: AtomicUsize,
    sends: AtomicUsize,
    simulations: AtomicUsize,
}

impl MemoryLedger {
    /// Empty ledger for `passphrase`.
    pub fn new(passphrase: &str) -> Self {
        Self {
            passphrase: passphrase.to_string(),
            confirm_polls: 1,
            yield_points: false,
            state: Mutex::new(LedgerState {
                latest_ledger: 1,
                ..LedgerState::default()
            }),
            submissions: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
            simulations: AtomicUsize::new(0),
        }
    }

    /// Number of `NotFound` polls before a sent invocation resolves.
    pub fn with_confirm_polls(mut self, polls: u32) -> Self {
        self.confirm_polls = polls;
        self
    }

    /// Yields to the scheduler once at the start of every network call, the
    /// way a remote ledger suspends the caller.
    pub fn with_yield_points(mut self) -> Self {
        self.yield_points = true;
        self
    }

    async fn suspend(&self) {
        if self.yield_points {
            tokio::task::yield_now().await;
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Unavailable("ledger state lock poisoned".into()))
    }

    /// Opens an account with no balances. No-op when it already exists.
    pub fn create_account(&self, id: &AccountId) {
        if let Ok(mut state) = self.lock() {
            let start = i64::from(state.latest_ledger) << 32;
            state.accounts.entry(id.clone()).or_insert(AccountState {
                sequence: start,
                trustlines: BTreeMap::new(),
            });
        }
    }

    /// Overrides an account's sequence number.
    pub fn set_sequence(&self, id: &AccountId, sequence: i64) {
        if let Ok(mut state) = self.lock() {
            if let Some(account) = state.accounts.get_mut(id) {
                account.sequence = sequence;
            }
        }
    }

    /// Current sequence of `id`.
    pub fn sequence(&self, id: &AccountId) -> Option<i64> {
        self.lock().ok()?.accounts.get(id).map(|a| a.sequence)
    }

    /// Balance of `asset` held by `id` (zero when absent).
    pub fn balance(&self, id: &AccountId, asset: &Asset) -> Amount {
        self.lock()
            .ok()
            .and_then(|state| {
                state
                    .accounts
                    .get(id)
                    .and_then(|a| a.trustlines.get(asset))
                    .map(|t| t.balance)
            })
            .unwrap_or(Amount::ZERO)
    }

    /// Registers a contract handler.
    pub fn register_contract<F>(&self, contract: ContractId, handler: F)
    where
        F: Fn(&ContractCallContext) -> Result<ContractValue, String> + Send + Sync + 'static,
    {
        if let Ok(mut state) = self.lock() {
            state.contracts.insert(contract, Arc::new(handler));
        }
    }

    /// Refuses the next submission with `codes` without touching state.
    pub fn inject_submit_failure(&self, codes: ResultCodes) {
        if let Ok(mut state) = self.lock() {
            state.injected.push_back(codes);
        }
    }

    /// Stalls every following submission; `None` restores normal behaviour.
    pub fn stall_submissions(&self, mode: Option<StallMode>) {
        if let Ok(mut state) = self.lock() {
            state.stall_submissions = mode;
        }
    }

    /// Keeps sent invocations pending forever while set.
    pub fn stall_invocations(&self, stalled: bool) {
        if let Ok(mut state) = self.lock() {
            state.stall_invocations = stalled;
        }
    }

    /// Answers every following send with `TryAgainLater` while set.
    pub fn throttle_sends(&self, throttled: bool) {
        if let Ok(mut state) = self.lock() {
            state.throttle_sends = throttled;
        }
    }

    /// Number of `submit_transaction` calls.
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Number of `send_transaction` calls.
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// Number of `simulate_transaction` calls.
    pub fn simulations(&self) -> usize {
        self.simulations.load(Ordering::SeqCst)
    }

    /// Number of included transactions.
    pub fn transaction_count(&self) -> usize {
        self.lock().map(|state| state.txs.len()).unwrap_or(0)
    }

    /// Latest closed ledger.
    pub fn latest_ledger(&self) -> u32 {
        self.lock().map(|state| state.latest_ledger).unwrap_or(0)
    }

    fn admit(
        &self,
        state: &LedgerState,
        envelope: &TransactionEnvelope,
    ) -> Result<TxHash, LedgerError> {
        let hash = envelope
            .verify(&self.passphrase)
            .map_err(|_| LedgerError::Rejected(ResultCodes::tx("tx_bad_auth")))?;
        let tx = &envelope.tx;
        let account = state
            .accounts
            .get(&tx.source)
            .ok_or_else(|| LedgerError::Rejected(ResultCodes::tx("tx_no_account")))?;
        if tx.sequence != account.sequence.saturating_add(1) {
            return Err(LedgerError::Rejected(ResultCodes::tx("tx_bad_seq")));
        }
        if !tx.time_bounds.contains(now_secs()) {
            return Err(LedgerError::Rejected(ResultCodes::tx("tx_too_late")));
        }
        if tx.operations.is_empty() {
            return Err(LedgerError::Rejected(ResultCodes::tx("tx_missing_operation")));
        }
        Ok(hash)
    }

    fn apply_submission(
        &self,
        envelope: &TransactionEnvelope,
    ) -> (Result<SubmitResponse, LedgerError>, Option<StallMode>) {
        let mut state = match self.lock() {
            Ok(state) => state,
            Err(err) => return (Err(err), None),
        };
        let stall = state.stall_submissions;
        if stall == Some(StallMode::Drop) {
            return (Err(LedgerError::Timeout), stall);
        }
        if let Ok(hash) = envelope.hash(&self.passphrase) {
            if let Some(record) = state.txs.get(&hash) {
                let response = if record.successful {
                    Ok(SubmitResponse {
                        hash,
                        ledger: record.ledger,
                    })
                } else {
                    Err(LedgerError::Rejected(ResultCodes::tx("tx_duplicate")))
                };
                return (response, stall);
            }
        }
        if let Some(codes) = state.injected.pop_front() {
            return (Err(LedgerError::Rejected(codes)), stall);
        }
        let hash = match self.admit(&state, envelope) {
            Ok(hash) => hash,
            Err(err) => return (Err(err), stall),
        };
        let tx = &envelope.tx;
        if tx
            .operations
            .iter()
            .any(|op| matches!(op, Operation::InvokeContract { .. }))
        {
            return (
                Err(LedgerError::Rejected(ResultCodes::tx("tx_malformed"))),
                stall,
            );
        }

        let mut staged = state.accounts.clone();
        let mut op_codes = Vec::with_capacity(tx.operations.len());
        let mut failed = false;
        for op in &tx.operations {
            match apply_operation(&mut staged, &tx.source, op) {
                Ok(()) => op_codes.push("op_success".to_string()),
                Err(code) => {
                    op_codes.push(code.to_string());
                    failed = true;
                    break;
                }
            }
        }

        // Included either way: the sequence number is consumed.
        let codes = failed.then(|| ResultCodes::failed(op_codes));
        if !failed {
            state.accounts = staged;
        }
        if let Some(account) = state.accounts.get_mut(&tx.source) {
            account.sequence = tx.sequence;
        }
        let ledger = record_transaction(&mut state, hash.clone(), tx, codes.clone());
        debug!(evt = "MEMLEDGER_APPLY", hash = %hash, ledger, ok = !failed, "transaction included");
        let response = match codes {
            None => Ok(SubmitResponse { hash, ledger }),
            Some(codes) => Err(LedgerError::Rejected(codes)),
        };
        (response, stall)
    }

    fn apply_send(&self, envelope: &TransactionEnvelope) -> Result<SendResponse, LedgerError> {
        let mut state = self.lock()?;
        let hash = envelope.hash(&self.passphrase)?;
        if state.pending.contains_key(&hash) || state.resolved.contains_key(&hash) {
            return Ok(SendResponse {
                hash,
                status: SendStatus::Duplicate,
            });
        }
        if state.throttle_sends {
            return Ok(SendResponse {
                hash,
                status: SendStatus::TryAgainLater,
            });
        }
        if let Err(err) = self.admit(&state, envelope) {
            let codes = match err {
                LedgerError::Rejected(codes) => codes,
                other => ResultCodes::tx(&other.to_string()),
            };
            return Ok(SendResponse {
                hash,
                status: SendStatus::Error(codes),
            });
        }
        let tx = &envelope.tx;
        let malformed = || SendStatus::Error(ResultCodes::tx("tx_malformed"));
        if tx.footprint.is_none() {
            return Ok(SendResponse {
                hash,
                status: malformed(),
            });
        }
        let context = match single_invocation(tx) {
            Some(context) => context,
            None => {
                return Ok(SendResponse {
                    hash,
                    status: malformed(),
                })
            }
        };
        if let Some(account) = state.accounts.get_mut(&tx.source) {
            account.sequence = tx.sequence;
        }
        let outcome = match state.contracts.get(&context.contract) {
            None => InvocationStatus::Failed {
                detail: format!("contract {} not found", context.contract),
            },
            Some(handler) => match handler(&context) {
                Ok(result) => InvocationStatus::Success {
                    result,
                    ledger: state.latest_ledger.saturating_add(1),
                },
                Err(detail) => InvocationStatus::Failed { detail },
            },
        };
        state.pending.insert(
            hash.clone(),
            PendingInvocation {
                polls_left: self.confirm_polls,
                tx: tx.clone(),
                outcome,
            },
        );
        Ok(SendResponse {
            hash,
            status: SendStatus::Pending,
        })
    }
}

fn single_invocation(tx: &Transaction) -> Option<ContractCallContext> {
    match tx.operations.as_slice() {
        [Operation::InvokeContract {
            contract,
            function,
            args,
        }] => Some(ContractCallContext {
            contract: contract.clone(),
            function: function.clone(),
            args: args.clone(),
            invoker: tx.source.clone(),
        }),
        _ => None,
    }
}

fn apply_operation(
    accounts: &mut HashMap<AccountId, AccountState>,
    source: &AccountId,
    op: &Operation,
) -> Result<(), &'static str> {
    match op {
        Operation::ChangeTrust { asset, limit } => {
            if &asset.issuer == source || limit.base_units() < 0 {
                return Err("op_malformed");
            }
            if !accounts.contains_key(&asset.issuer) {
                return Err("op_no_issuer");
            }
            let account = accounts.get_mut(source).ok_or("op_no_account")?;
            match account.trustlines.get_mut(asset) {
                Some(line) if *limit < line.balance => Err("op_invalid_limit"),
                Some(_) if *limit == Amount::ZERO => {
                    account.trustlines.remove(asset);
                    Ok(())
                }
                Some(line) => {
                    line.limit = *limit;
                    Ok(())
                }
                None if *limit == Amount::ZERO => Err("op_invalid_limit"),
                None => {
                    account.trustlines.insert(
                        asset.clone(),
                        Trustline {
                            balance: Amount::ZERO,
                            limit: *limit,
                        },
                    );
                    Ok(())
                }
            }
        }
        Operation::Payment {
            destination,
            asset,
            amount,
        } => {
            if !amount.is_positive() {
                return Err("op_malformed");
            }
            if !accounts.contains_key(destination) {
                return Err("op_no_destination");
            }
            if &asset.issuer != source {
                let line = accounts
                    .get_mut(source)
                    .and_then(|a| a.trustlines.get_mut(asset))
                    .ok_or("op_src_no_trust")?;
                if line.balance < *amount {
                    return Err("op_underfunded");
                }
                line.balance = line.balance.saturating_sub(*amount);
            }
            if &asset.issuer != destination {
                let line = accounts
                    .get_mut(destination)
                    .and_then(|a| a.trustlines.get_mut(asset))
                    .ok_or("op_no_trust")?;
                let credited = line.balance.checked_add(*amount).ok_or("op_line_full")?;
                if credited > line.limit {
                    return Err("op_line_full");
                }
                line.balance = credited;
            }
            Ok(())
        }
        Operation::InvokeContract { .. } => Err("op_not_supported"),
    }
}

fn record_transaction(
    state: &mut LedgerState,
    hash: TxHash,
    tx: &Transaction,
    codes: Option<ResultCodes>,
) -> u32 {
    state.latest_ledger = state.latest_ledger.saturating_add(1);
    state.next_paging = state.next_paging.saturating_add(1);
    let record = TransactionRecord {
        hash: hash.clone(),
        source: tx.source.clone(),
        ledger: state.latest_ledger,
        successful: codes.is_none(),
        memo: tx.memo.clone(),
        paging_token: format!("{:020}", state.next_paging),
        created_at: now_secs(),
        operations: tx.operations.clone(),
        result_codes: codes,
    };
    let mut touched = vec![tx.source.clone()];
    for op in &tx.operations {
        if let Operation::Payment { destination, .. } = op {
            if !touched.contains(destination) {
                touched.push(destination.clone());
            }
        }
    }
    for account in touched {
        state.history.entry(account).or_default().push(hash.clone());
    }
    state.txs.insert(hash, record);
    state.latest_ledger
}

#[async_trait]
impl LedgerNetwork for MemoryLedger {
    async fn load_account(&self, id: &AccountId) -> Result<Account, LedgerError> {
        self.suspend().await;
        let state = self.lock()?;
        let account = state
            .accounts
            .get(id)
            .ok_or_else(|| LedgerError::NotFound(format!("account {id}")))?;
        Ok(Account {
            id: id.clone(),
            sequence: account.sequence,
            balances: account
                .trustlines
                .iter()
                .map(|(asset, line)| Balance {
                    asset: asset.clone(),
                    amount: line.balance,
                    limit: line.limit,
                })
                .collect(),
        })
    }

    async fn submit_transaction(
        &self,
        envelope: &TransactionEnvelope,
    ) -> Result<SubmitResponse, LedgerError> {
        self.suspend().await;
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let (response, stall) = self.apply_submission(envelope);
        if stall.is_some() {
            std::future::pending::<()>().await;
        }
        response
    }

    async fn transaction_by_hash(&self, hash: &TxHash) -> Result<TransactionRecord, LedgerError> {
        self.suspend().await;
        self.lock()?
            .txs
            .get(hash)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {hash}")))
    }

    async fn account_history(
        &self,
        id: &AccountId,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, LedgerError> {
        self.suspend().await;
        let state = self.lock()?;
        let cursor = match &query.cursor {
            Some(cursor) => Some(
                cursor
                    .parse::<u64>()
                    .map_err(|_| LedgerError::Malformed(format!("cursor {cursor:?}")))?,
            ),
            None => None,
        };
        let hashes = state.history.get(id).map(Vec::as_slice).unwrap_or(&[]);
        let mut records: Vec<&TransactionRecord> =
            hashes.iter().filter_map(|h| state.txs.get(h)).collect();
        if query.order == Order::Desc {
            records.reverse();
        }
        let limit = query.limit.max(1);
        let page: Vec<TransactionRecord> = records
            .into_iter()
            .filter(|record| {
                let token = record.paging_token.parse::<u64>().unwrap_or(0);
                match (cursor, query.order) {
                    (None, _) => true,
                    (Some(c), Order::Desc) => token < c,
                    (Some(c), Order::Asc) => token > c,
                }
            })
            .take(limit)
            .cloned()
            .collect();
        let next_cursor = if page.len() == limit {
            page.last().map(|record| record.paging_token.clone())
        } else {
            None
        };
        Ok(HistoryPage {
            records: page,
            next_cursor,
        })
    }

    async fn simulate_transaction(&self, tx: &Transaction) -> Result<SimulationOutcome, LedgerError> {
        self.suspend().await;
        self.simulations.fetch_add(1, Ordering::SeqCst);
        let state = self.lock()?;
        let Some(context) = single_invocation(tx) else {
            return Ok(SimulationOutcome::Rejected {
                detail: "expected exactly one contract call".into(),
            });
        };
        let Some(handler) = state.contracts.get(&context.contract) else {
            return Ok(SimulationOutcome::Rejected {
                detail: format!("contract {} not found", context.contract),
            });
        };
        Ok(match handler(&context) {
            Ok(result) => SimulationOutcome::Ok {
                result,
                footprint: ResourceFootprint {
                    read_only: vec![context.contract.to_string()],
                    read_write: vec![context.invoker.to_string()],
                    instructions: SIMULATED_INSTRUCTIONS,
                    resource_fee: SIMULATED_RESOURCE_FEE,
                },
                latest_ledger: state.latest_ledger,
            },
            Err(detail) => SimulationOutcome::Rejected { detail },
        })
    }

    async fn send_transaction(
        &self,
        envelope: &TransactionEnvelope,
    ) -> Result<SendResponse, LedgerError> {
        self.suspend().await;
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.apply_send(envelope)
    }

    async fn transaction_status(&self, hash: &TxHash) -> Result<InvocationStatus, LedgerError> {
        self.suspend().await;
        let mut state = self.lock()?;
        if let Some(status) = state.resolved.get(hash) {
            return Ok(status.clone());
        }
        if state.stall_invocations {
            return Ok(InvocationStatus::NotFound);
        }
        let ready = match state.pending.get_mut(hash) {
            None => return Ok(InvocationStatus::NotFound),
            Some(pending) if pending.polls_left > 0 => {
                pending.polls_left -= 1;
                false
            }
            Some(_) => true,
        };
        if !ready {
            return Ok(InvocationStatus::NotFound);
        }
        let Some(pending) = state.pending.remove(hash) else {
            return Ok(InvocationStatus::NotFound);
        };
        let codes = match &pending.outcome {
            InvocationStatus::Failed { detail } => Some(ResultCodes::failed(vec![detail.clone()])),
            _ => None,
        };
        let ledger = record_transaction(&mut state, hash.clone(), &pending.tx, codes);
        let outcome = match pending.outcome {
            InvocationStatus::Success { result, .. } => InvocationStatus::Success { result, ledger },
            other => other,
        };
        state.resolved.insert(hash.clone(), outcome.clone());
        Ok(outcome)
    }
}
