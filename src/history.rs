//! Account transaction history: paging, memo search and a polling watcher.

use crate::error::SettlementError;
use crate::keys::AccountId;
use crate::ledger::{HistoryQuery, LedgerClient, Order, TransactionRecord};
use std::time::Duration;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

/// Pages through an account's transactions with a cursor.
pub struct HistoryPager {
    client: LedgerClient,
    account: AccountId,
    query: HistoryQuery,
    exhausted: bool,
}

impl HistoryPager {
    /// Newest-first pager over `account`.
    pub fn new(client: LedgerClient, account: AccountId, page_size: usize) -> Self {
        Self::with_order(client, account, page_size, Order::Desc)
    }

    /// Pager with an explicit ordering.
    pub fn with_order(client: LedgerClient, account: AccountId, page_size: usize, order: Order) -> Self {
        Self {
            client,
            account,
            query: HistoryQuery {
                cursor: None,
                limit: page_size.max(1),
                order,
            },
            exhausted: false,
        }
    }

    /// Resumes after `cursor`.
    pub fn starting_after(mut self, cursor: impl Into<String>) -> Self {
        self.query.cursor = Some(cursor.into());
        self
    }

    /// Next page; `None` once the history is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<TransactionRecord>>, SettlementError> {
        if self.exhausted {
            return Ok(None);
        }
        let page = self.client.account_history(&self.account, &self.query).await?;
        match page.next_cursor {
            Some(cursor) => self.query.cursor = Some(cursor),
            None => self.exhausted = true,
        }
        if page.records.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }
        Ok(Some(page.records))
    }
}

/// Newest transaction of `account` whose memo is `memo`, searching at most `max_pages`.
pub async fn find_by_memo(
    client: &LedgerClient,
    account: &AccountId,
    memo: &str,
    max_pages: usize,
) -> Result<Option<TransactionRecord>, SettlementError> {
    let mut pager = HistoryPager::new(client.clone(), account.clone(), 50);
    for _ in 0..max_pages {
        let Some(records) = pager.next_page().await? else {
            break;
        };
        if let Some(found) = records.into_iter().find(|r| r.memo.as_text() == Some(memo)) {
            debug!(evt = "HISTORY_MEMO_HIT", account = %account, memo, hash = %found.hash, "memo found");
            return Ok(Some(found));
        }
    }
    Ok(None)
}

/// Streams new transactions of one account on a bounded channel.
pub struct HistoryWatcher {
    client: LedgerClient,
    account: AccountId,
    interval: Duration,
    capacity: usize,
}

impl HistoryWatcher {
    /// Watcher polling every `interval`, buffering at most `capacity` records.
    pub fn new(client: LedgerClient, account: AccountId, interval: Duration, capacity: usize) -> Self {
        Self {
            client,
            account,
            interval,
            capacity: capacity.max(1),
        }
    }

    /// Starts polling from the newest existing transaction.
    ///
    /// Best effort: poll failures are logged and retried on the next tick. The
    /// task ends when the receiver is dropped.
    pub fn spawn(self) -> (JoinHandle<()>, mpsc::Receiver<TransactionRecord>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let handle = tokio::spawn(self.run(tx));
        (handle, rx)
    }

    async fn run(self, sink: mpsc::Sender<TransactionRecord>) {
        let mut cursor = self.latest_token().await;
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(evt = "HISTORY_WATCH", account = %self.account, cursor = ?cursor, "watching history");
        loop {
            ticker.tick().await;
            if sink.is_closed() {
                break;
            }
            let mut pager = HistoryPager::with_order(self.client.clone(), self.account.clone(), 50, Order::Asc);
            if let Some(token) = &cursor {
                pager = pager.starting_after(token.clone());
            }
            loop {
                match pager.next_page().await {
                    Ok(Some(records)) => {
                        for record in records {
                            cursor = Some(record.paging_token.clone());
                            if sink.send(record).await.is_err() {
                                debug!(evt = "HISTORY_WATCH_END", account = %self.account, "receiver dropped");
                                return;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(evt = "HISTORY_POLL_FAILED", account = %self.account, error = %err, "history poll failed");
                        break;
                    }
                }
            }
        }
    }

    async fn latest_token(&self) -> Option<String> {
        let query = HistoryQuery {
            cursor: None,
            limit: 1,
            order: Order::Desc,
        };
        match self.client.account_history(&self.account, &query).await {
            Ok(page) => page.records.first().map(|r| r.paging_token.clone()),
            Err(err) => {
                warn!(evt = "HISTORY_POLL_FAILED", account = %self.account, error = %err, "could not read history head");
                None
            }
        }
    }
}
