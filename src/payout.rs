//! Payout queue
//!
//! Payouts are rows in the repository, so the queue survives restarts.
//! A drain claims each row with `Pending → Processing`, sends the remaining
//! amount in chunks and settles it to `Completed`, back to `Pending`, or to
//! terminal `Failed` once attempts are exhausted.
//!
//! Progress is persisted after every chunk. A retry only sends what is left.
//! Before each chunk the worker re-checks its claim and refreshes
//! `heartbeat_at`; the stale sweep only reclaims rows whose heartbeat is old.
//! A chunk that reached the chain is recorded even if the claim was lost
//! while it was in flight.

use crate::config::PayoutConfig;
use crate::db::{PayoutQuery, Repository, StorageError};
use crate::notify::{DrawEvent, Notifier, OperatorAlert};
use crate::sender::{SendError, TransactionSender};
use crate::types::{now, Payout, PayoutId, PayoutStatus, Ticket};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum PayoutError {
    #[error("insufficient {currency} balance: need {required}, have {available}")]
    InsufficientBalance { currency: String, required: u64, available: u64 },
    #[error("payout {id} is {status:?}, only pending payouts can be cancelled")]
    NotCancellable { id: PayoutId, status: PayoutStatus },
    #[error("payout {id} is {status:?}, only failed payouts can be retried")]
    NotRetryable { id: PayoutId, status: PayoutStatus },
    #[error("balance query failed: {0}")]
    Balance(#[from] SendError),
    #[error("payout worker failed: {0}")]
    Worker(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Outcome of one drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Another drain was running, nothing was done
    pub skipped: bool,
    pub attempted: usize,
    pub completed: usize,
    /// Failed this attempt, back to pending
    pub retrying: usize,
    /// Exhausted attempts, terminal
    pub failed: usize,
}

impl DrainReport {
    pub fn skipped() -> Self {
        Self { skipped: true, ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.attempted == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Retrying,
    Failed,
    /// Claimed by someone else, or the claim was swept
    Lost,
}

/// Create the payout for a winning ticket.
///
/// The ticket id is the idempotency key: a second call for the same ticket
/// returns `None` and writes nothing.
pub fn enqueue(repo: &dyn Repository, ticket: &Ticket) -> Result<Option<Payout>, StorageError> {
    if repo.payout_for_ticket(ticket.id)?.is_some() {
        return Ok(None);
    }

    let at = now();
    let payout = Payout {
        id: repo.next_id()?,
        ticket_id: ticket.id,
        draw_id: ticket.draw_id,
        wallet_address: ticket.wallet_address.clone(),
        amount: ticket.prize_amount,
        currency: ticket.currency.clone(),
        status: PayoutStatus::Pending,
        attempts: 0,
        tx_hash: None,
        tx_hashes: Vec::new(),
        amount_sent: 0,
        last_error: None,
        created_at: at,
        updated_at: at,
        processing_started_at: None,
        heartbeat_at: None,
    };

    if repo.insert_payout_if_absent(&payout)? {
        debug!("Payout {} queued: {} {} for ticket {}", payout.id, payout.amount, payout.currency, ticket.id);
        Ok(Some(payout))
    } else {
        Ok(None)
    }
}

pub struct PayoutQueue<S: TransactionSender> {
    repo: Arc<dyn Repository>,
    sender: Arc<S>,
    notifier: Arc<dyn Notifier>,
    config: PayoutConfig,
    drain_lock: Mutex<()>,
}

impl<S: TransactionSender> PayoutQueue<S> {
    pub fn new(
        repo: Arc<dyn Repository>,
        sender: Arc<S>,
        notifier: Arc<dyn Notifier>,
        config: PayoutConfig,
    ) -> Self {
        Self {
            repo,
            sender,
            notifier,
            config,
            drain_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &PayoutConfig {
        &self.config
    }

    pub fn enqueue(&self, ticket: &Ticket) -> Result<Option<Payout>, PayoutError> {
        Ok(enqueue(self.repo.as_ref(), ticket)?)
    }

    /// Process one batch of pending payouts.
    ///
    /// If the payout wallet cannot cover the whole batch in some currency,
    /// nothing is sent and no row is touched.
    pub async fn drain_pending(&self) -> Result<DrainReport, PayoutError> {
        let Ok(_drain) = self.drain_lock.try_lock() else {
            debug!("Payout drain already running");
            return Ok(DrainReport::skipped());
        };

        let batch = self.repo.list_payouts(&PayoutQuery {
            status: Some(PayoutStatus::Pending),
            attempts_below: Some(self.config.max_attempts),
            limit: Some(self.config.batch_size),
            ..Default::default()
        })?;
        if batch.is_empty() {
            return Ok(DrainReport::default());
        }

        self.check_balances(&batch).await?;

        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut set = JoinSet::new();
        for payout in batch {
            let worker = Worker {
                repo: Arc::clone(&self.repo),
                sender: Arc::clone(&self.sender),
                notifier: Arc::clone(&self.notifier),
                config: self.config.clone(),
            };
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| PayoutError::Worker(e.to_string()))?;
                worker.process(payout).await
            });
        }

        let mut report = DrainReport::default();
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let outcome = match joined {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    error!("Payout worker error: {}", e);
                    first_error.get_or_insert(e);
                    continue;
                }
                Err(e) => {
                    error!("Payout worker panicked: {}", e);
                    first_error.get_or_insert(PayoutError::Worker(e.to_string()));
                    continue;
                }
            };
            match outcome {
                Outcome::Completed => report.completed += 1,
                Outcome::Retrying => report.retrying += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::Lost => continue,
            }
            report.attempted += 1;
        }

        if !report.is_empty() {
            info!(
                "Payout drain: {} attempted | {} completed | {} retrying | {} failed",
                report.attempted, report.completed, report.retrying, report.failed
            );
        }
        match first_error {
            Some(e) if report.is_empty() => Err(e),
            _ => Ok(report),
        }
    }

    async fn check_balances(&self, batch: &[Payout]) -> Result<(), PayoutError> {
        let mut required: BTreeMap<&str, u64> = BTreeMap::new();
        for p in batch {
            let total = required.entry(p.currency.as_str()).or_insert(0);
            *total = total.saturating_add(p.remaining());
        }

        for (currency, required) in required {
            let available = self.sender.balance(currency).await?;
            if available < required {
                warn!(
                    "Payout batch aborted: {} balance {} below required {}",
                    currency, available, required
                );
                self.notifier.alert(OperatorAlert::InsufficientBalance {
                    currency: currency.to_string(),
                    required,
                    available,
                });
                return Err(PayoutError::InsufficientBalance {
                    currency: currency.to_string(),
                    required,
                    available,
                });
            }
        }
        Ok(())
    }

    /// Return `Processing` rows abandoned by a crashed or hung worker.
    ///
    /// Staleness is measured from the last heartbeat. Rows with attempts left
    /// go back to `Pending`, the rest become `Failed`.
    pub fn recover_stale(&self, at: DateTime<Utc>, stale_after: Duration) -> Result<usize, PayoutError> {
        let cutoff = at - stale_after;
        let max_attempts = self.config.max_attempts;
        let stale = self.repo.list_payouts(&PayoutQuery {
            status: Some(PayoutStatus::Processing),
            ..Default::default()
        })?;

        let mut recovered = 0;
        for payout in stale {
            let last_seen = payout
                .heartbeat_at
                .or(payout.processing_started_at)
                .unwrap_or(payout.updated_at);
            if last_seen > cutoff {
                continue;
            }
            let updated = self.repo.update_payout_if(
                payout.id,
                &|p| {
                    p.status == PayoutStatus::Processing
                        && p.processing_started_at == payout.processing_started_at
                        && p.heartbeat_at == payout.heartbeat_at
                },
                &mut |p| {
                    p.status = if p.attempts >= max_attempts { PayoutStatus::Failed } else { PayoutStatus::Pending };
                    p.last_error = Some("processing interrupted".into());
                    p.processing_started_at = None;
                    p.heartbeat_at = None;
                    p.updated_at = at;
                },
            )?;
            let Some(p) = updated else { continue };

            warn!("Payout {} silent since {}, now {:?}", p.id, last_seen, p.status);
            if p.status == PayoutStatus::Failed {
                self.notifier.alert(OperatorAlert::PayoutFailed {
                    payout_id: p.id,
                    attempts: p.attempts,
                    error: "processing interrupted".into(),
                });
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Cancel a payout nobody has claimed yet
    pub fn cancel(&self, id: PayoutId) -> Result<Payout, PayoutError> {
        let updated = self.repo.update_payout_if(
            id,
            &|p| p.status == PayoutStatus::Pending,
            &mut |p| {
                p.status = PayoutStatus::Cancelled;
                p.updated_at = now();
            },
        )?;
        match updated {
            Some(p) => {
                info!("Payout {} cancelled", id);
                Ok(p)
            }
            None => Err(PayoutError::NotCancellable { id, status: self.repo.get_payout(id)?.status }),
        }
    }

    /// Put a failed payout back in the queue with a fresh attempt budget
    pub fn retry(&self, id: PayoutId) -> Result<Payout, PayoutError> {
        let updated = self.repo.update_payout_if(
            id,
            &|p| p.status == PayoutStatus::Failed,
            &mut |p| {
                p.status = PayoutStatus::Pending;
                p.attempts = 0;
                p.last_error = None;
                p.updated_at = now();
            },
        )?;
        match updated {
            Some(p) => {
                info!("Payout {} requeued, {} of {} already sent", id, p.amount_sent, p.amount);
                Ok(p)
            }
            None => Err(PayoutError::NotRetryable { id, status: self.repo.get_payout(id)?.status }),
        }
    }
}

/// Everything one payout task needs, owned
struct Worker<S> {
    repo: Arc<dyn Repository>,
    sender: Arc<S>,
    notifier: Arc<dyn Notifier>,
    config: PayoutConfig,
}

impl<S: TransactionSender> Worker<S> {
    async fn process(&self, payout: Payout) -> Result<Outcome, PayoutError> {
        let max_attempts = self.config.max_attempts;
        let started = now();
        let claimed = self.repo.update_payout_if(
            payout.id,
            &|p| p.status == PayoutStatus::Pending && p.attempts < max_attempts,
            &mut |p| {
                p.status = PayoutStatus::Processing;
                p.attempts += 1;
                p.processing_started_at = Some(started);
                p.heartbeat_at = Some(started);
                p.updated_at = started;
            },
        )?;
        let Some(mut payout) = claimed else {
            debug!("Payout {} claimed elsewhere", payout.id);
            return Ok(Outcome::Lost);
        };

        let mut first_chunk = true;
        while payout.remaining() > 0 {
            if !first_chunk {
                tokio::time::sleep(self.config.inter_transaction_delay()).await;
            }
            first_chunk = false;

            // Never send on a claim the sweep has taken back
            let beat = now();
            let alive = self.repo.update_payout_if(
                payout.id,
                &|p| p.status == PayoutStatus::Processing && p.processing_started_at == Some(started),
                &mut |p| p.heartbeat_at = Some(beat),
            )?;
            let Some(alive) = alive else {
                warn!("Payout {} claim lost before sending, {} of {} sent", payout.id, payout.amount_sent, payout.amount);
                return Ok(Outcome::Lost);
            };
            payout = alive;

            let chunk = payout.remaining().min(self.config.max_per_transaction);
            let tx_hash = match self.send(&payout, chunk).await {
                Ok(hash) => hash,
                Err(e) => return self.fail(&payout, started, &e.to_string()),
            };

            // Money moved: record it whoever holds the claim now
            let recorded = self.repo.update_payout_if(
                payout.id,
                &|_| true,
                &mut |p| {
                    p.amount_sent = p.amount_sent.saturating_add(chunk);
                    p.tx_hashes.push(tx_hash.clone());
                    p.tx_hash = Some(tx_hash.clone());
                    p.updated_at = now();
                },
            )?;
            let Some(recorded) = recorded else {
                return Err(PayoutError::Storage(StorageError::NotFound { kind: "payout", id: payout.id }));
            };
            if recorded.status != PayoutStatus::Processing || recorded.processing_started_at != Some(started) {
                error!("Payout {} lost its claim while sending {} (tx {})", payout.id, chunk, tx_hash);
                return Ok(Outcome::Lost);
            }
            payout = recorded;
        }

        self.complete(&payout, started)
    }

    async fn send(&self, payout: &Payout, amount: u64) -> Result<String, SendError> {
        let timeout = self.config.send_timeout();
        let send = self.sender.send(&payout.wallet_address, amount, &payout.currency);
        match tokio::time::timeout(timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout(timeout.as_secs())),
        }
    }

    fn complete(&self, payout: &Payout, started: DateTime<Utc>) -> Result<Outcome, PayoutError> {
        let done = self.repo.update_payout_if(
            payout.id,
            &|p| p.status == PayoutStatus::Processing && p.processing_started_at == Some(started),
            &mut |p| {
                p.status = PayoutStatus::Completed;
                p.last_error = None;
                p.processing_started_at = None;
                p.heartbeat_at = None;
                p.updated_at = now();
            },
        )?;
        let Some(done) = done else {
            return Ok(Outcome::Lost);
        };

        self.repo
            .update_ticket_if(done.ticket_id, &|t| !t.prize_claimed, &mut |t| t.prize_claimed = true)?;

        let tx_hash = done.tx_hash.clone().unwrap_or_default();
        info!("Payout {} completed: {} {} to {}", done.id, done.amount, done.currency, done.wallet_address);
        self.notifier.publish(DrawEvent::PayoutCompleted {
            draw_id: done.draw_id,
            payout_id: done.id,
            ticket_id: done.ticket_id,
            tx_hash,
        });
        Ok(Outcome::Completed)
    }

    fn fail(&self, payout: &Payout, started: DateTime<Utc>, reason: &str) -> Result<Outcome, PayoutError> {
        let max_attempts = self.config.max_attempts;
        let updated = self.repo.update_payout_if(
            payout.id,
            &|p| p.status == PayoutStatus::Processing && p.processing_started_at == Some(started),
            &mut |p| {
                p.status = if p.attempts >= max_attempts { PayoutStatus::Failed } else { PayoutStatus::Pending };
                p.last_error = Some(reason.to_string());
                p.processing_started_at = None;
                p.heartbeat_at = None;
                p.updated_at = now();
            },
        )?;
        let Some(p) = updated else {
            return Ok(Outcome::Lost);
        };

        if p.status == PayoutStatus::Failed {
            error!("Payout {} failed after {} attempts: {}", p.id, p.attempts, reason);
            self.notifier.alert(OperatorAlert::PayoutFailed {
                payout_id: p.id,
                attempts: p.attempts,
                error: reason.to_string(),
            });
            Ok(Outcome::Failed)
        } else {
            warn!("Payout {} attempt {}/{} failed: {}", p.id, p.attempts, max_attempts, reason);
            Ok(Outcome::Retrying)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStorage;

    fn winning_ticket(id: u64, prize: u64) -> Ticket {
        let mut ticket = Ticket::new(id, 7, vec![1, 2, 3, 4, 5], "EQwinner", "TON", 1_000);
        ticket.prize_amount = prize;
        ticket
    }

    #[test]
    fn test_enqueue_is_idempotent_per_ticket() {
        let repo = MemoryStorage::new();
        let ticket = winning_ticket(1, 500);

        let first = enqueue(&repo, &ticket).unwrap().unwrap();
        assert_eq!(first.amount, 500);
        assert_eq!(first.draw_id, 7);
        assert_eq!(first.status, PayoutStatus::Pending);
        assert_eq!(first.attempts, 0);

        assert!(enqueue(&repo, &ticket).unwrap().is_none());
        assert_eq!(repo.list_payouts(&PayoutQuery::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_drain_report_skipped() {
        let report = DrainReport::skipped();
        assert!(report.skipped);
        assert!(report.is_empty());
    }
}
