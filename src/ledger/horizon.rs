#![cfg(feature = "net")]

//! HTTP transport: REST gateway for accounts, transactions and history, JSON-RPC
//! gateway for contract simulation, sending and status.

use super::{
    Account, HistoryPage, HistoryQuery, InvocationStatus, LedgerError, LedgerNetwork, Memo,
    Operation, ResourceFootprint, ResultCodes, SendResponse, SendStatus, SimulationOutcome,
    SubmitResponse, Transaction, TransactionEnvelope, TransactionRecord, TxHash,
};
use crate::asset::{Amount, Asset, Balance};
use crate::config::SettlementConfig;
use crate::keys::AccountId;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const MAX_ERROR_BODY_CHARS: usize = 512;

/// [`LedgerNetwork`] over HTTP.
#[derive(Debug, Clone)]
pub struct HorizonTransport {
    client: Client,
    horizon_url: String,
    rpc_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountJson {
    id: String,
    sequence: String,
    #[serde(default)]
    balances: Vec<BalanceJson>,
}

#[derive(Debug, Deserialize)]
struct BalanceJson {
    asset_type: String,
    #[serde(default)]
    asset_code: Option<String>,
    #[serde(default)]
    asset_issuer: Option<String>,
    balance: String,
    #[serde(default)]
    limit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmitJson {
    hash: String,
    ledger: u32,
}

#[derive(Debug, Deserialize)]
struct ProblemJson {
    #[serde(default)]
    title: String,
    #[serde(default)]
    extras: Option<ProblemExtras>,
}

#[derive(Debug, Deserialize)]
struct ProblemExtras {
    result_codes: Option<ResultCodesJson>,
}

#[derive(Debug, Deserialize)]
struct ResultCodesJson {
    transaction: String,
    #[serde(default)]
    operations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionJson {
    hash: String,
    source_account: String,
    ledger: u32,
    successful: bool,
    #[serde(default)]
    memo_type: Option<String>,
    #[serde(default)]
    memo: Option<String>,
    paging_token: String,
    #[serde(default)]
    created_at_unix: Option<u64>,
    #[serde(default)]
    envelope_b64: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddedRecords {
    _embedded: RecordsJson,
}

#[derive(Debug, Deserialize)]
struct RecordsJson {
    records: Vec<TransactionJson>,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorJson>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorJson {
    code: i64,
    message: String,
}

impl HorizonTransport {
    /// Transport for the gateways named in `config`.
    pub fn new(config: &SettlementConfig) -> Result<Self, LedgerError> {
        let horizon_url = config
            .horizon_url
            .clone()
            .ok_or_else(|| LedgerError::Malformed("no REST gateway configured".into()))?;
        Self::with_endpoints(horizon_url, config.rpc_url.clone(), config.timeouts.request)
    }

    /// Transport for explicit endpoints.
    pub fn with_endpoints(
        horizon_url: impl Into<String>,
        rpc_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| LedgerError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            horizon_url: horizon_url.into().trim_end_matches('/').to_string(),
            rpc_url: rpc_url.map(|url| url.trim_end_matches('/').to_string()),
        })
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T, LedgerError> {
        let response = request.send().await.map_err(map_reqwest)?;
        let status = response.status();
        let body = response.text().await.map_err(map_reqwest)?;
        if status.is_success() {
            return serde_json::from_str(&body).map_err(|err| LedgerError::Malformed(err.to_string()));
        }
        Err(map_status(status, &body, what))
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let url = self
            .rpc_url
            .as_deref()
            .ok_or_else(|| LedgerError::Unavailable("no JSON-RPC gateway configured".into()))?;
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        debug!(evt = "RPC_CALL", method, "json-rpc request");
        let envelope: RpcEnvelope = self.fetch(self.client.post(url).json(&payload), method).await?;
        if let Some(err) = envelope.error {
            return Err(LedgerError::Unavailable(format!("rpc error {}: {}", err.code, err.message)));
        }
        envelope
            .result
            .ok_or_else(|| LedgerError::Malformed(format!("{method} returned no result")))
    }
}

fn map_reqwest(err: reqwest::Error) -> LedgerError {
    if err.is_timeout() {
        LedgerError::Timeout
    } else {
        LedgerError::Transport(err.to_string())
    }
}

fn map_status(status: StatusCode, body: &str, what: &str) -> LedgerError {
    match status {
        StatusCode::NOT_FOUND => LedgerError::NotFound(what.to_string()),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
            LedgerError::Unavailable(status.to_string())
        }
        StatusCode::GATEWAY_TIMEOUT => LedgerError::Timeout,
        _ => {
            let problem: Option<ProblemJson> = serde_json::from_str(body).ok();
            match problem.and_then(|p| p.extras.map(|e| (p.title, e))) {
                Some((_, ProblemExtras { result_codes: Some(codes) })) => {
                    LedgerError::Rejected(ResultCodes {
                        tx_code: codes.transaction,
                        op_codes: codes.operations,
                    })
                }
                Some((title, _)) => LedgerError::Malformed(title),
                None => LedgerError::Malformed(format!(
                    "{status}: {}",
                    body.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>()
                )),
            }
        }
    }
}

fn parse_account(json: AccountJson) -> Result<Account, LedgerError> {
    let id = AccountId::parse(&json.id).map_err(|err| LedgerError::Malformed(err.to_string()))?;
    let sequence = json
        .sequence
        .parse::<i64>()
        .map_err(|err| LedgerError::Malformed(format!("sequence: {err}")))?;
    let mut balances = Vec::new();
    for entry in json.balances {
        if entry.asset_type == "native" {
            continue;
        }
        let (Some(code), Some(issuer)) = (entry.asset_code, entry.asset_issuer) else {
            continue;
        };
        let issuer = AccountId::parse(&issuer).map_err(|err| LedgerError::Malformed(err.to_string()))?;
        let amount = Amount::parse(&entry.balance).map_err(|err| LedgerError::Malformed(err.to_string()))?;
        let limit = match entry.limit {
            Some(limit) => Amount::parse(&limit).map_err(|err| LedgerError::Malformed(err.to_string()))?,
            None => Amount::MAX,
        };
        balances.push(Balance {
            asset: Asset::new(code, issuer),
            amount,
            limit,
        });
    }
    Ok(Account {
        id,
        sequence,
        balances,
    })
}

fn parse_record(json: TransactionJson) -> Result<TransactionRecord, LedgerError> {
    let hash = TxHash::parse(&json.hash).map_err(|err| LedgerError::Malformed(err.to_string()))?;
    let source =
        AccountId::parse(&json.source_account).map_err(|err| LedgerError::Malformed(err.to_string()))?;
    let memo = match (json.memo_type.as_deref(), json.memo) {
        (Some("text"), Some(text)) => Memo::Text(text),
        _ => Memo::None,
    };
    let operations: Vec<Operation> = match json.envelope_b64 {
        Some(b64) => TransactionEnvelope::from_base64(&b64)?.tx.operations,
        None => Vec::new(),
    };
    Ok(TransactionRecord {
        hash,
        source,
        ledger: json.ledger,
        successful: json.successful,
        memo,
        paging_token: json.paging_token,
        created_at: json.created_at_unix.unwrap_or(0),
        operations,
        result_codes: None,
    })
}

fn parse_footprint(value: &Value) -> Result<ResourceFootprint, LedgerError> {
    serde_json::from_value(value.clone()).map_err(|err| LedgerError::Malformed(format!("footprint: {err}")))
}

#[async_trait]
impl LedgerNetwork for HorizonTransport {
    async fn load_account(&self, id: &AccountId) -> Result<Account, LedgerError> {
        let url = format!("{}/accounts/{}", self.horizon_url, urlencode(id.as_str()));
        let json: AccountJson = self.fetch(self.client.get(url), "account").await?;
        parse_account(json)
    }

    async fn submit_transaction(
        &self,
        envelope: &TransactionEnvelope,
    ) -> Result<SubmitResponse, LedgerError> {
        let url = format!("{}/transactions", self.horizon_url);
        let body = envelope.to_base64()?;
        let json: SubmitJson = self
            .fetch(self.client.post(url).form(&[("tx", body)]), "transaction")
            .await?;
        Ok(SubmitResponse {
            hash: TxHash::parse(&json.hash).map_err(|err| LedgerError::Malformed(err.to_string()))?,
            ledger: json.ledger,
        })
    }

    async fn transaction_by_hash(&self, hash: &TxHash) -> Result<TransactionRecord, LedgerError> {
        let url = format!("{}/transactions/{}", self.horizon_url, hash);
        let json: TransactionJson = self.fetch(self.client.get(url), "transaction").await?;
        parse_record(json)
    }

    async fn account_history(
        &self,
        id: &AccountId,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, LedgerError> {
        let url = format!("{}/accounts/{}/transactions", self.horizon_url, urlencode(id.as_str()));
        let mut params = vec![
            ("limit", query.limit.max(1).to_string()),
            ("order", query.order.as_str().to_string()),
        ];
        if let Some(cursor) = &query.cursor {
            params.push(("cursor", cursor.clone()));
        }
        let json: EmbeddedRecords = self
            .fetch(self.client.get(url).query(&params), "account")
            .await?;
        let records = json
            ._embedded
            .records
            .into_iter()
            .map(parse_record)
            .collect::<Result<Vec<_>, _>>()?;
        let next_cursor = if records.len() >= query.limit.max(1) {
            records.last().map(|r| r.paging_token.clone())
        } else {
            None
        };
        Ok(HistoryPage {
            records,
            next_cursor,
        })
    }

    async fn simulate_transaction(&self, tx: &Transaction) -> Result<SimulationOutcome, LedgerError> {
        let body = serde_json::to_vec(tx).map_err(|err| LedgerError::Malformed(err.to_string()))?;
        let result = self
            .rpc(
                "simulateTransaction",
                json!({ "transaction": base64_encode(&body) }),
            )
            .await?;
        if let Some(detail) = result.get("error").and_then(Value::as_str) {
            return Ok(SimulationOutcome::Rejected {
                detail: detail.to_string(),
            });
        }
        let value = result
            .get("result")
            .cloned()
            .ok_or_else(|| LedgerError::Malformed("simulation returned no result".into()))?;
        let footprint = parse_footprint(
            result
                .get("footprint")
                .ok_or_else(|| LedgerError::Malformed("simulation returned no footprint".into()))?,
        )?;
        Ok(SimulationOutcome::Ok {
            result: serde_json::from_value(value).map_err(|err| LedgerError::Malformed(err.to_string()))?,
            footprint,
            latest_ledger: result
                .get("latestLedger")
                .and_then(Value::as_u64)
                .and_then(|l| u32::try_from(l).ok())
                .unwrap_or(0),
        })
    }

    async fn send_transaction(
        &self,
        envelope: &TransactionEnvelope,
    ) -> Result<SendResponse, LedgerError> {
        let result = self
            .rpc("sendTransaction", json!({ "transaction": envelope.to_base64()? }))
            .await?;
        let hash = result
            .get("hash")
            .and_then(Value::as_str)
            .ok_or_else(|| LedgerError::Malformed("sendTransaction returned no hash".into()))?;
        let hash = TxHash::parse(hash).map_err(|err| LedgerError::Malformed(err.to_string()))?;
        let status = match result.get("status").and_then(Value::as_str) {
            Some("PENDING") => SendStatus::Pending,
            Some("DUPLICATE") => SendStatus::Duplicate,
            Some("TRY_AGAIN_LATER") => SendStatus::TryAgainLater,
            Some(other) => SendStatus::Error(ResultCodes::tx(
                result
                    .get("errorResult")
                    .and_then(Value::as_str)
                    .unwrap_or(other),
            )),
            None => return Err(LedgerError::Malformed("sendTransaction returned no status".into())),
        };
        Ok(SendResponse { hash, status })
    }

    async fn transaction_status(&self, hash: &TxHash) -> Result<InvocationStatus, LedgerError> {
        let result = self
            .rpc("getTransaction", json!({ "hash": hash.as_str() }))
            .await?;
        match result.get("status").and_then(Value::as_str) {
            Some("SUCCESS") => {
                let value = result.get("returnValue").cloned().unwrap_or(Value::Null);
                let value = if value.is_null() {
                    super::ContractValue::Void
                } else {
                    serde_json::from_value(value).map_err(|err| LedgerError::Malformed(err.to_string()))?
                };
                Ok(InvocationStatus::Success {
                    result: value,
                    ledger: result
                        .get("ledger")
                        .and_then(Value::as_u64)
                        .and_then(|l| u32::try_from(l).ok())
                        .unwrap_or(0),
                })
            }
            Some("FAILED") => Ok(InvocationStatus::Failed {
                detail: result
                    .get("resultXdr")
                    .and_then(Value::as_str)
                    .unwrap_or("transaction failed")
                    .to_string(),
            }),
            Some("NOT_FOUND") | None => Ok(InvocationStatus::NotFound),
            Some(other) => Err(LedgerError::Malformed(format!("unknown status {other}"))),
        }
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    BASE64.encode(bytes)
}

fn urlencode(segment: &str) -> String {
    segment
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => (b as char).to_string(),
            other => format!("%{other:02X}"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_documents_become_result_codes() {
        let body = r#"{"title":"Transaction Failed","extras":{"result_codes":{"transaction":"tx_failed","operations":["op_underfunded"]}}}"#;
        let err = map_status(StatusCode::BAD_REQUEST, body, "transaction");
        assert_eq!(
            err,
            LedgerError::Rejected(ResultCodes::failed(vec!["op_underfunded".into()]))
        );
    }

    #[test]
    fn throttling_is_transient() {
        assert!(map_status(StatusCode::TOO_MANY_REQUESTS, "", "account").is_transient());
        assert_eq!(
            map_status(StatusCode::NOT_FOUND, "", "account"),
            LedgerError::NotFound("account".into())
        );
    }

    #[test]
    fn base64_identities_are_path_escaped() {
        assert_eq!(urlencode("ab+/="), "ab%2B%2F%3D");
    }

    #[test]
    fn native_balances_are_skipped() {
        let id = crate::keys::KeyManager::new(crate::config::Network::Testnet)
            .create_wallet()
            .identity()
            .to_string();
        let json: AccountJson = serde_json::from_value(json!({
            "id": id,
            "sequence": "4294967296",
            "balances": [
                {"asset_type": "native", "balance": "100.0000000"},
                {"asset_type": "credit_alphanum4", "asset_code": "FUEL", "asset_issuer": id,
                 "balance": "12.5000000", "limit": "1000.0000000"}
            ]
        }))
        .unwrap();
        let account = parse_account(json).unwrap();
        assert_eq!(account.sequence, 1 << 32);
        assert_eq!(account.balances.len(), 1);
        assert_eq!(account.balances[0].amount, Amount::parse("12.5").unwrap());
    }
}
