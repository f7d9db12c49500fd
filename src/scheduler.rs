//! Draw phase scheduler
//!
//! ```text
//! scheduled_at - commit_lead       commit seed hash
//! scheduled_at - close_sales_lead  close ticket sales
//! scheduled_at - finalize_lead     snapshot tickets and prize pool
//! scheduled_at                     execute
//! every payout_interval            drain payouts
//! every sweep_interval             recover stale claims
//! ```
//!
//! Each phase runs on its own interval and is safe to overlap with itself,
//! with the others and with other processes: every transition is a guarded
//! update and a lost race is simply skipped.

use crate::config::ScheduleConfig;
use crate::db::{DrawQuery, Repository, StorageError};
use crate::engine::DrawEngine;
use crate::notify::{DrawEvent, Notifier};
use crate::payout::{PayoutError, PayoutQueue};
use crate::randomness::{generate_seed, hash_seed};
use crate::sender::TransactionSender;
use crate::types::{now, Draw};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-tick counts for one phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl PhaseReport {
    pub fn is_empty(&self) -> bool {
        self.processed == 0 && self.skipped == 0 && self.failed == 0
    }

    fn log(&self, phase: &str) {
        if !self.is_empty() {
            info!(
                "{} phase: {} processed | {} skipped | {} failed",
                phase, self.processed, self.skipped, self.failed
            );
        }
    }
}

pub struct Scheduler<S: TransactionSender> {
    repo: Arc<dyn Repository>,
    engine: Arc<DrawEngine>,
    payouts: Arc<PayoutQueue<S>>,
    notifier: Arc<dyn Notifier>,
    config: ScheduleConfig,
}

impl<S: TransactionSender> Scheduler<S> {
    pub fn new(
        engine: Arc<DrawEngine>,
        payouts: Arc<PayoutQueue<S>>,
        config: ScheduleConfig,
    ) -> Self {
        Self {
            repo: Arc::clone(engine.repo()),
            notifier: Arc::clone(engine.notifier()),
            engine,
            payouts,
            config,
        }
    }

    fn due(&self, before: DateTime<Utc>) -> Result<Vec<Draw>, StorageError> {
        self.repo.list_draws(&DrawQuery {
            scheduled_before: Some(before),
            ..DrawQuery::scheduled()
        })
    }

    /// Generate, seal and publish the seed hash for draws entering the commit window
    pub fn run_commit_phase(&self, at: DateTime<Utc>) -> Result<PhaseReport, StorageError> {
        let mut report = PhaseReport::default();

        for draw in self.due(at + self.config.commit_lead())? {
            if draw.seed_hash.is_some() {
                continue;
            }
            if !draw.ticket_sales_open {
                // Commitment must precede the sales close
                warn!("Draw #{} closed sales without a seed commitment", draw.id);
                report.skipped += 1;
                continue;
            }

            let seed = generate_seed();
            let seed_hash = hash_seed(&seed);
            let sealed = match self.engine.vault().seal(draw.id, &seed) {
                Ok(sealed) => sealed,
                Err(e) => {
                    error!("Draw #{} seed seal failed: {}", draw.id, e);
                    report.failed += 1;
                    continue;
                }
            };

            let published_at = now();
            let updated = self.repo.update_draw_if(
                draw.id,
                &|d| d.is_scheduled() && d.seed_hash.is_none() && d.ticket_sales_open,
                &mut |d| {
                    d.seed_hash = Some(seed_hash.clone());
                    d.sealed_seed = Some(sealed.clone());
                    d.seed_hash_published_at = Some(published_at);
                },
            );
            match updated {
                Ok(Some(_)) => {
                    info!("Draw #{} seed committed: {}", draw.id, seed_hash);
                    self.notifier.publish(DrawEvent::SeedCommitted { draw_id: draw.id, seed_hash });
                    report.processed += 1;
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    warn!("Draw #{} seed commit failed: {}", draw.id, e);
                    report.failed += 1;
                }
            }
        }

        report.log("Commit");
        Ok(report)
    }

    pub fn run_close_sales_phase(&self, at: DateTime<Utc>) -> Result<PhaseReport, StorageError> {
        let mut report = PhaseReport::default();

        for draw in self.due(at + self.config.close_sales_lead())? {
            if !draw.ticket_sales_open {
                continue;
            }
            if draw.seed_hash.is_none() {
                debug!("Draw #{} sales stay open until its seed is committed", draw.id);
                report.skipped += 1;
                continue;
            }
            let updated = self.repo.update_draw_if(
                draw.id,
                &|d| d.is_scheduled() && d.ticket_sales_open && d.seed_hash.is_some(),
                &mut |d| {
                    d.ticket_sales_open = false;
                    d.ticket_sales_closed_at = Some(now());
                },
            );
            match updated {
                Ok(Some(_)) => {
                    info!("Draw #{} ticket sales closed", draw.id);
                    self.notifier.publish(DrawEvent::SalesClosed { draw_id: draw.id });
                    report.processed += 1;
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    warn!("Draw #{} close sales failed: {}", draw.id, e);
                    report.failed += 1;
                }
            }
        }

        report.log("Close sales");
        Ok(report)
    }

    /// Snapshot ticket count, revenue and prize pool once sales are closed
    pub fn run_finalize_phase(&self, at: DateTime<Utc>) -> Result<PhaseReport, StorageError> {
        let mut report = PhaseReport::default();

        for draw in self.due(at + self.config.finalize_lead())? {
            if draw.ticket_sales_open || draw.data_finalized || draw.seed_hash.is_none() {
                continue;
            }
            match self.finalize(&draw) {
                Ok(true) => report.processed += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!("Draw #{} finalize failed: {}", draw.id, e);
                    report.failed += 1;
                }
            }
        }

        report.log("Finalize");
        Ok(report)
    }

    fn finalize(&self, draw: &Draw) -> Result<bool, StorageError> {
        let lottery = self.repo.get_lottery(draw.lottery_id)?;
        let tickets = self.repo.tickets_for_draw(draw.id)?;
        let total_tickets = tickets.len() as u64;
        let total_revenue = tickets.iter().fold(0u64, |acc, t| acc.saturating_add(t.price));
        let total_prize_pool = lottery.financial.split(total_revenue).prize_fund;

        let updated = self.repo.update_draw_if(
            draw.id,
            &|d| d.is_scheduled() && !d.ticket_sales_open && !d.data_finalized && d.seed_hash.is_some(),
            &mut |d| {
                d.total_tickets = total_tickets;
                d.total_revenue = total_revenue;
                d.total_prize_pool = total_prize_pool;
                d.data_finalized = true;
                d.data_finalized_at = Some(now());
            },
        )?;
        if updated.is_none() {
            return Ok(false);
        }

        info!(
            "Draw #{} finalized: {} tickets | revenue {} | prize pool {}",
            draw.id, total_tickets, total_revenue, total_prize_pool
        );
        self.notifier.publish(DrawEvent::DataFinalized {
            draw_id: draw.id,
            total_tickets,
            total_prize_pool,
        });
        Ok(true)
    }

    pub async fn run_execute_phase(&self, at: DateTime<Utc>) -> Result<PhaseReport, StorageError> {
        let mut report = PhaseReport::default();

        for draw in self.due(at)? {
            if draw.seed_hash.is_none() || !draw.data_finalized || draw.execution_claimed_at.is_some() {
                continue;
            }
            match self.engine.execute_draw(draw.id).await {
                Ok(_) => report.processed += 1,
                Err(e) if e.is_skip() => {
                    debug!("Draw #{} skipped: {}", draw.id, e);
                    report.skipped += 1;
                }
                Err(e) => {
                    error!("Draw #{} execution failed: {}", draw.id, e);
                    report.failed += 1;
                }
            }
        }

        report.log("Execute");
        Ok(report)
    }

    pub async fn run_payout_phase(&self) -> Result<PhaseReport, PayoutError> {
        let drain = self.payouts.drain_pending().await?;
        let report = PhaseReport {
            processed: drain.completed,
            skipped: usize::from(drain.skipped) + drain.retrying,
            failed: drain.failed,
        };
        report.log("Payout");
        Ok(report)
    }

    pub fn run_sweep_phase(&self, at: DateTime<Utc>) -> Result<PhaseReport, PayoutError> {
        let mut report = PhaseReport::default();

        report.processed += self
            .payouts
            .recover_stale(at, self.payouts.config().stale_processing_after())?;

        match self
            .engine
            .recover_stale_executions(at, self.engine.stale_execution_after())
        {
            Ok(n) => report.processed += n,
            Err(e) => {
                error!("Stale execution sweep failed: {}", e);
                report.failed += 1;
            }
        }

        report.log("Sweep");
        Ok(report)
    }
}

impl<S: TransactionSender> Scheduler<S> {
    /// One task per phase. All stop when `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let c = &self.config;
        let periods = [
            c.commit_interval_secs,
            c.close_sales_interval_secs,
            c.finalize_interval_secs,
            c.execute_interval_secs,
            c.payout_interval_secs,
            c.sweep_interval_secs,
        ];

        vec![
            every("commit", periods[0], shutdown.clone(), {
                let s = Arc::clone(&self);
                move || {
                    let s = Arc::clone(&s);
                    async move { s.run_commit_phase(now()).map(|_| ()).map_err(|e| e.to_string()) }
                }
            }),
            every("close-sales", periods[1], shutdown.clone(), {
                let s = Arc::clone(&self);
                move || {
                    let s = Arc::clone(&s);
                    async move { s.run_close_sales_phase(now()).map(|_| ()).map_err(|e| e.to_string()) }
                }
            }),
            every("finalize", periods[2], shutdown.clone(), {
                let s = Arc::clone(&self);
                move || {
                    let s = Arc::clone(&s);
                    async move { s.run_finalize_phase(now()).map(|_| ()).map_err(|e| e.to_string()) }
                }
            }),
            every("execute", periods[3], shutdown.clone(), {
                let s = Arc::clone(&self);
                move || {
                    let s = Arc::clone(&s);
                    async move { s.run_execute_phase(now()).await.map(|_| ()).map_err(|e| e.to_string()) }
                }
            }),
            every("payout", periods[4], shutdown.clone(), {
                let s = Arc::clone(&self);
                move || {
                    let s = Arc::clone(&s);
                    async move { s.run_payout_phase().await.map(|_| ()).map_err(|e| e.to_string()) }
                }
            }),
            every("sweep", periods[5], shutdown, {
                let s = Arc::clone(&self);
                move || {
                    let s = Arc::clone(&s);
                    async move { s.run_sweep_phase(now()).map(|_| ()).map_err(|e| e.to_string()) }
                }
            }),
        ]
    }
}

fn every<F, Fut>(name: &'static str, secs: u64, shutdown: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = tick().await {
                        error!("{} phase error: {}", name, e);
                    }
                }
            }
        }
        debug!("{} phase stopped", name);
    })
}
