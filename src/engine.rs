//! Draw execution — reveal, derive, settle, enqueue
//!
//! ```text
//! Scheduled ──claim──▶ (executing) ──commit──▶ Completed ──settle──▶ payouts
//!                          │                       │
//!                          └────── any error ──────┴──▶ Failed (terminal)
//! ```
//!
//! The claim is a conditional update on `execution_claimed_at`. Only one
//! caller wins it, whether the other is an overlapping poller tick, an admin
//! trigger or another process. A failed execution is never retried: deriving
//! numbers again after partial settlement would break the commitment.

use crate::config::EngineConfig;
use crate::db::{DrawQuery, Guard, Repository, StorageError};
use crate::notify::{DrawEvent, Notifier, OperatorAlert};
use crate::payout;
use crate::prize::{validate_lottery, PrizeCalculator, PrizeError, RevenueBreakdown};
use crate::randomness::{generate_winning_numbers, verify_seed_hash, RandomnessError, Seed};
use crate::seal::{SealError, SeedVault};
use crate::types::{
    now, Draw, DrawId, DrawStatus, LedgerEntry, LedgerKind, Lottery, LotteryId, Ticket, TicketId,
    TicketStatus,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Re-evaluations allowed when another draw moves the jackpot balance
const JACKPOT_CAS_ATTEMPTS: usize = 8;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("draw {0} already settled")]
    AlreadySettled(DrawId),
    #[error("draw {0} is already executing")]
    AlreadyExecuting(DrawId),
    #[error("draw {0} has no published seed hash")]
    SeedNotCommitted(DrawId),
    #[error("draw {0} data not finalized")]
    NotFinalized(DrawId),
    #[error("draw {0} has no sealed seed")]
    SealedSeedMissing(DrawId),
    #[error("draw {0} seed hash was published after ticket sales closed")]
    LateCommitment(DrawId),
    #[error("draw {0} revealed seed does not match its commitment")]
    VerificationMismatch(DrawId),
    #[error("draw {0} changed during execution")]
    Conflict(DrawId),
    #[error("settlement worker failed: {0}")]
    Worker(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Seal(#[from] SealError),
    #[error(transparent)]
    Randomness(#[from] RandomnessError),
    #[error(transparent)]
    Prize(#[from] PrizeError),
}

impl EngineError {
    /// Expected outcome of a lost race, not a failure
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::AlreadySettled(_) | Self::AlreadyExecuting(_))
    }
}

/// Outcome of one successful execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub draw_id: DrawId,
    pub winning_numbers: Vec<u8>,
    pub total_tickets: u64,
    pub winners_by_tier: BTreeMap<u8, u64>,
    pub total_paid: u64,
    pub jackpot_paid: u64,
    pub payouts_enqueued: usize,
}

/// Match result for one ticket, computed before any write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Evaluation {
    ticket_id: TicketId,
    matched: u8,
    prize: u64,
}

/// Tickets priced against one observed jackpot balance
struct Priced {
    lottery: Lottery,
    evaluations: Vec<Evaluation>,
    winners_by_tier: BTreeMap<u8, u64>,
    prize_by_tier: BTreeMap<u8, u64>,
    jackpot_paid: u64,
}

/// Matched count, or `None` for a malformed ticket
/// (wrong length, out of range or repeated numbers).
pub fn match_count(numbers: &[u8], winning: &[u8], count: u8, max: u8) -> Option<u8> {
    if numbers.len() != count as usize {
        return None;
    }
    let mut seen = HashSet::with_capacity(numbers.len());
    for &n in numbers {
        if n == 0 || n > max || !seen.insert(n) {
            return None;
        }
    }
    Some(winning.iter().filter(|n| seen.contains(n)).count() as u8)
}

pub struct DrawEngine {
    repo: Arc<dyn Repository>,
    vault: SeedVault,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
}

impl DrawEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        vault: SeedVault,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self { repo, vault, notifier, config }
    }

    pub fn repo(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub fn vault(&self) -> &SeedVault {
        &self.vault
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// Execute one draw end to end.
    ///
    /// Returns `AlreadySettled` / `AlreadyExecuting` when another caller got
    /// there first. Any other error after the claim leaves the draw `Failed`.
    pub async fn execute_draw(&self, draw_id: DrawId) -> Result<ExecutionSummary, EngineError> {
        let draw = self.repo.get_draw(draw_id)?;
        if let Err(e) = check_preconditions(&draw) {
            if matches!(e, EngineError::LateCommitment(_)) {
                let unclaimed = |d: &Draw| d.is_scheduled() && d.execution_claimed_at.is_none();
                self.mark_failed(draw_id, &unclaimed, &e.to_string());
            }
            return Err(e);
        }

        let claim = now();
        let claimed = self.repo.update_draw_if(
            draw_id,
            &|d| d.is_scheduled() && d.execution_claimed_at.is_none(),
            &mut |d| d.execution_claimed_at = Some(claim),
        )?;
        let draw = match claimed {
            Some(d) => d,
            None => {
                let current = self.repo.get_draw(draw_id)?;
                return Err(if current.is_scheduled() {
                    EngineError::AlreadyExecuting(draw_id)
                } else {
                    EngineError::AlreadySettled(draw_id)
                });
            }
        };

        info!("Executing draw #{} (lottery {}, number {})", draw.id, draw.lottery_id, draw.draw_number);

        match self.run(draw, claim).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!("Draw #{} execution failed: {}", draw_id, e);
                let ours = |d: &Draw| d.status != DrawStatus::Failed && d.execution_claimed_at == Some(claim);
                self.mark_failed(draw_id, &ours, &e.to_string());
                Err(e)
            }
        }
    }

    async fn run(&self, draw: Draw, claim: DateTime<Utc>) -> Result<ExecutionSummary, EngineError> {
        let lottery = self.repo.get_lottery(draw.lottery_id)?;
        validate_lottery(&lottery)?;

        // Reveal
        let seed = self.reveal(&draw)?;
        let revealed_at = now();
        let seed_hex = seed.to_hex();

        // Derive
        let winning = generate_winning_numbers(&seed, lottery.numbers_count, lottery.max_number)?;
        let breakdown = lottery.financial.split(draw.total_revenue);

        // Commit results in one conditional write
        let still_ours = |d: &Draw| d.is_scheduled() && d.execution_claimed_at == Some(claim);
        self.repo
            .update_draw_if(draw.id, &still_ours, &mut |d| {
                d.seed = Some(seed_hex.clone());
                d.seed_revealed_at = Some(revealed_at);
                d.sealed_seed = None;
                d.winning_numbers = winning.clone();
                d.payout_pool = breakdown.payout_pool;
                d.executed_at = Some(now());
                d.status = DrawStatus::Completed;
            })?
            .ok_or(EngineError::Conflict(draw.id))?;

        self.notifier.publish(DrawEvent::SeedRevealed { draw_id: draw.id, seed: seed_hex.clone() });
        self.notifier.publish(DrawEvent::NumbersGenerated {
            draw_id: draw.id,
            winning_numbers: winning.clone(),
        });
        info!("Draw #{} numbers: {:?}", draw.id, winning);

        // This draw's jackpot contribution is in the pot before it is paid out
        self.repo
            .update_lottery_if(lottery.id, &|_| true, &mut |l| {
                l.jackpot_balance = l.jackpot_balance.saturating_add(breakdown.jackpot_contribution);
            })?
            .ok_or(EngineError::Conflict(draw.id))?;

        // Evaluate every ticket before any write: tier shares need final counts
        let tickets = self.repo.tickets_for_draw(draw.id)?;
        let Priced { lottery, evaluations, winners_by_tier, prize_by_tier, jackpot_paid } =
            self.evaluate_and_take_jackpot(draw.id, lottery.id, &tickets, &winning, breakdown.payout_pool)?;

        // Settle in parallel, join before aggregating
        let settled = self.settle(evaluations).await?;
        let total_paid: u64 = settled.iter().map(|t| t.prize_amount).sum();

        let completed = |d: &Draw| d.status == DrawStatus::Completed && d.execution_claimed_at == Some(claim);
        self.repo
            .update_draw_if(draw.id, &completed, &mut |d| {
                d.winners_by_tier = winners_by_tier.clone();
                d.total_paid = total_paid;
                d.jackpot_paid = jackpot_paid;
            })?
            .ok_or(EngineError::Conflict(draw.id))?;

        self.record_ledger(&lottery, &draw, &breakdown, &winners_by_tier, &prize_by_tier, jackpot_paid)?;

        let mut payouts_enqueued = 0;
        for ticket in settled.iter().filter(|t| t.prize_amount > 0) {
            if payout::enqueue(self.repo.as_ref(), ticket)?.is_some() {
                payouts_enqueued += 1;
            }
        }

        self.repo
            .update_draw_if(draw.id, &completed, &mut |d| d.settled_at = Some(now()))?
            .ok_or(EngineError::Conflict(draw.id))?;

        self.notifier.publish(DrawEvent::ResultsAnnounced {
            draw_id: draw.id,
            winners_by_tier: winners_by_tier.clone(),
            total_paid,
        });
        info!(
            "Draw #{} completed: {} tickets | winners {:?} | paid {} | {} payouts queued",
            draw.id,
            tickets.len(),
            winners_by_tier,
            total_paid,
            payouts_enqueued
        );

        Ok(ExecutionSummary {
            draw_id: draw.id,
            winning_numbers: winning,
            total_tickets: tickets.len() as u64,
            winners_by_tier,
            total_paid,
            jackpot_paid,
            payouts_enqueued,
        })
    }

    /// Unseal and check the seed against its published hash
    fn reveal(&self, draw: &Draw) -> Result<Seed, EngineError> {
        let sealed = draw.sealed_seed.as_ref().ok_or(EngineError::SealedSeedMissing(draw.id))?;
        let seed_hash = draw.seed_hash.as_deref().ok_or(EngineError::SeedNotCommitted(draw.id))?;
        let seed = self.vault.unseal(draw.id, sealed)?;

        if !verify_seed_hash(&seed, seed_hash) {
            self.notifier.alert(OperatorAlert::VerificationMismatch {
                draw_id: draw.id,
                detail: "unsealed seed does not hash to the published commitment".into(),
            });
            return Err(EngineError::VerificationMismatch(draw.id));
        }
        Ok(seed)
    }

    async fn settle(&self, evaluations: Vec<Evaluation>) -> Result<Vec<Ticket>, EngineError> {
        if evaluations.is_empty() {
            return Ok(Vec::new());
        }

        let workers = self.config.settle_workers.max(1);
        let chunk_size = evaluations.len().div_ceil(workers);
        let mut set = JoinSet::new();
        for chunk in evaluations.chunks(chunk_size) {
            let chunk = chunk.to_vec();
            let repo = Arc::clone(&self.repo);
            set.spawn_blocking(move || settle_chunk(repo.as_ref(), &chunk));
        }

        let mut settled = Vec::with_capacity(evaluations.len());
        while let Some(joined) = set.join_next().await {
            let tickets = joined.map_err(|e| EngineError::Worker(e.to_string()))??;
            settled.extend(tickets);
        }
        Ok(settled)
    }

    /// Price every ticket against the current jackpot and, when the jackpot
    /// was won, reset it in the same conditional write that checks the balance
    /// the prize was computed from. Another draw of the same lottery moving
    /// the balance in between forces a re-evaluation.
    fn evaluate_and_take_jackpot(
        &self,
        draw_id: DrawId,
        lottery_id: LotteryId,
        tickets: &[Ticket],
        winning: &[u8],
        payout_pool: u64,
    ) -> Result<Priced, EngineError> {
        for _ in 0..JACKPOT_CAS_ATTEMPTS {
            let lottery = self.repo.get_lottery(lottery_id)?;
            let (evaluations, winners_by_tier, prize_by_tier) = evaluate(&lottery, tickets, winning, payout_pool);
            let jackpot_winners = winners_by_tier.get(&lottery.numbers_count).copied().unwrap_or(0);
            let jackpot_paid = prize_by_tier.get(&lottery.numbers_count).copied().unwrap_or(0) * jackpot_winners;
            let priced = |lottery: Lottery| Priced { lottery, evaluations, winners_by_tier, prize_by_tier, jackpot_paid };
            if jackpot_paid == 0 {
                return Ok(priced(lottery));
            }

            // Reset to the configured seed. Rounding dust from a split jackpot stays.
            let observed = lottery.jackpot_balance;
            let reset_to = lottery.jackpot_seed.saturating_add(observed.saturating_sub(jackpot_paid));
            let taken = self.repo.update_lottery_if(
                lottery_id,
                &|l| l.jackpot_balance == observed,
                &mut |l| l.jackpot_balance = reset_to,
            )?;
            if taken.is_some() {
                info!("Lottery {} jackpot of {} won, reset to {}", lottery_id, jackpot_paid, reset_to);
                return Ok(priced(lottery));
            }
            debug!("Draw #{} jackpot balance moved, re-evaluating", draw_id);
        }
        Err(EngineError::Conflict(draw_id))
    }

    fn record_ledger(
        &self,
        lottery: &Lottery,
        draw: &Draw,
        breakdown: &RevenueBreakdown,
        winners_by_tier: &BTreeMap<u8, u64>,
        prize_by_tier: &BTreeMap<u8, u64>,
        jackpot_paid: u64,
    ) -> Result<(), EngineError> {
        let mut entries = vec![
            (LedgerKind::JackpotContribution, breakdown.jackpot_contribution),
            (LedgerKind::PayoutPool, breakdown.payout_pool),
            (LedgerKind::Reserve, breakdown.reserve),
            (LedgerKind::PlatformRevenue, breakdown.net_revenue),
        ];
        for (&matches, &winners) in winners_by_tier {
            if matches == lottery.numbers_count {
                continue;
            }
            let prize = prize_by_tier.get(&matches).copied().unwrap_or(0);
            entries.push((LedgerKind::TierPayout { matches }, prize * winners));
        }
        if jackpot_paid > 0 {
            entries.push((LedgerKind::JackpotPayout, jackpot_paid));
            entries.push((LedgerKind::JackpotReset, lottery.jackpot_seed));
        }

        let recorded_at = now();
        for (kind, amount) in entries {
            self.repo.append_ledger(&LedgerEntry {
                id: self.repo.next_id()?,
                lottery_id: lottery.id,
                draw_id: draw.id,
                kind,
                amount,
                recorded_at,
            })?;
        }
        Ok(())
    }

    /// Terminal failure for the claim holder. Never retried automatically.
    fn mark_failed(&self, draw_id: DrawId, guard: Guard<'_, Draw>, reason: &str) -> bool {
        let result = self.repo.update_draw_if(draw_id, guard, &mut |d| {
            d.status = DrawStatus::Failed;
            d.failure_reason = Some(reason.to_string());
        });
        match result {
            Ok(Some(_)) => {
                self.notifier.publish(DrawEvent::DrawFailed { draw_id, reason: reason.to_string() });
                self.notifier.alert(OperatorAlert::DrawFailed { draw_id, reason: reason.to_string() });
                true
            }
            Ok(None) => {
                warn!("Draw #{} changed before it could be marked failed", draw_id);
                false
            }
            Err(e) => {
                error!("Draw #{} could not be marked failed: {}", draw_id, e);
                false
            }
        }
    }

    /// Fail draws whose executor stopped before finishing (crashed process).
    ///
    /// Covers claims that never committed results and committed draws whose
    /// settlement never completed. Both are terminal and raise an alert.
    pub fn recover_stale_executions(&self, at: DateTime<Utc>, stale_after: Duration) -> Result<usize, EngineError> {
        let cutoff = at - stale_after;
        let mut recovered = 0;

        for draw in self.repo.list_draws(&DrawQuery::scheduled())? {
            let Some(claim) = draw.execution_claimed_at else { continue };
            if claim > cutoff {
                continue;
            }
            warn!("Draw #{} execution claim from {} is stale", draw.id, claim);
            let stale = |d: &Draw| d.is_scheduled() && d.execution_claimed_at == Some(claim);
            if self.mark_failed(draw.id, &stale, "execution interrupted") {
                recovered += 1;
            }
        }

        let completed = DrawQuery { status: Some(DrawStatus::Completed), ..Default::default() };
        for draw in self.repo.list_draws(&completed)? {
            if draw.settled_at.is_some() {
                continue;
            }
            let Some(claim) = draw.execution_claimed_at else { continue };
            if claim > cutoff {
                continue;
            }
            let pending = self
                .repo
                .tickets_for_draw(draw.id)?
                .iter()
                .filter(|t| t.status == TicketStatus::Pending)
                .count();
            warn!("Draw #{} completed at {} but never settled ({} tickets pending)", draw.id, claim, pending);

            let unsettled = |d: &Draw| {
                d.status == DrawStatus::Completed && d.settled_at.is_none() && d.execution_claimed_at == Some(claim)
            };
            let reason = format!("settlement interrupted with {} tickets pending", pending);
            if self.mark_failed(draw.id, &unsettled, &reason) {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    pub fn stale_execution_after(&self) -> Duration {
        self.config.stale_execution_after()
    }
}

fn check_preconditions(draw: &Draw) -> Result<(), EngineError> {
    if !draw.is_scheduled() {
        return Err(EngineError::AlreadySettled(draw.id));
    }
    if draw.seed_hash.is_none() {
        return Err(EngineError::SeedNotCommitted(draw.id));
    }
    if draw.ticket_sales_open || !draw.data_finalized {
        return Err(EngineError::NotFinalized(draw.id));
    }
    if !draw.committed_before_close() {
        return Err(EngineError::LateCommitment(draw.id));
    }
    if draw.sealed_seed.is_none() {
        return Err(EngineError::SealedSeedMissing(draw.id));
    }
    Ok(())
}

/// Match every ticket, count winners per tier, then price each tier.
fn evaluate(
    lottery: &Lottery,
    tickets: &[Ticket],
    winning: &[u8],
    payout_pool: u64,
) -> (Vec<Evaluation>, BTreeMap<u8, u64>, BTreeMap<u8, u64>) {
    let min_tier = PrizeCalculator::minimum_prize_tier(lottery);
    let mut matched = Vec::with_capacity(tickets.len());
    let mut winners_by_tier: BTreeMap<u8, u64> = BTreeMap::new();

    for ticket in tickets {
        let m = match match_count(&ticket.numbers, winning, lottery.numbers_count, lottery.max_number) {
            Some(m) => m,
            None => {
                warn!("Ticket {} is malformed ({:?}), settling as lost", ticket.id, ticket.numbers);
                0
            }
        };
        if m >= min_tier {
            *winners_by_tier.entry(m).or_insert(0) += 1;
        }
        matched.push((ticket, m));
    }

    let mut prize_by_tier = PrizeCalculator::tier_prizes(lottery, &winners_by_tier, payout_pool);
    if let Some(&winners) = winners_by_tier.get(&lottery.numbers_count) {
        // Jackpot winners share the balance evenly
        let jackpot = PrizeCalculator::dynamic_prize(lottery, lottery.numbers_count, &winners_by_tier, payout_pool);
        prize_by_tier.insert(lottery.numbers_count, jackpot / winners.max(1));
    }

    let evaluations = matched
        .into_iter()
        .filter(|(t, _)| t.status == TicketStatus::Pending)
        .map(|(t, m)| Evaluation {
            ticket_id: t.id,
            matched: m,
            prize: if m >= min_tier { prize_by_tier.get(&m).copied().unwrap_or(0) } else { 0 },
        })
        .collect();

    (evaluations, winners_by_tier, prize_by_tier)
}

/// Write outcomes for one chunk. Already-settled tickets are left alone.
fn settle_chunk(repo: &dyn Repository, chunk: &[Evaluation]) -> Result<Vec<Ticket>, EngineError> {
    let mut settled = Vec::with_capacity(chunk.len());
    for e in chunk {
        let updated = repo.update_ticket_if(
            e.ticket_id,
            &|t| t.status == TicketStatus::Pending,
            &mut |t| {
                t.matched_numbers = e.matched;
                t.prize_amount = e.prize;
                t.status = if e.prize > 0 { TicketStatus::Won } else { TicketStatus::Lost };
            },
        )?;
        match updated {
            Some(ticket) => settled.push(ticket),
            None => debug!("Ticket {} already settled", e.ticket_id),
        }
    }
    Ok(settled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_count() {
        let winning = [3, 7, 12, 20, 33];
        assert_eq!(match_count(&[3, 7, 12, 20, 33], &winning, 5, 36), Some(5));
        assert_eq!(match_count(&[33, 20, 1, 2, 3], &winning, 5, 36), Some(3));
        assert_eq!(match_count(&[1, 2, 4, 5, 6], &winning, 5, 36), Some(0));
    }

    #[test]
    fn test_match_count_rejects_malformed() {
        let winning = [3, 7, 12, 20, 33];
        assert_eq!(match_count(&[3, 7, 12, 20], &winning, 5, 36), None);
        assert_eq!(match_count(&[3, 7, 12, 20, 37], &winning, 5, 36), None);
        assert_eq!(match_count(&[3, 3, 12, 20, 33], &winning, 5, 36), None);
        assert_eq!(match_count(&[0, 7, 12, 20, 33], &winning, 5, 36), None);
    }

    #[test]
    fn test_preconditions() {
        let mut draw = Draw::new(1, 1, 1, now());
        assert!(matches!(check_preconditions(&draw), Err(EngineError::SeedNotCommitted(1))));

        draw.seed_hash = Some("ab".into());
        draw.seed_hash_published_at = Some(now() - Duration::hours(1));
        assert!(matches!(check_preconditions(&draw), Err(EngineError::NotFinalized(1))));

        draw.ticket_sales_open = false;
        draw.data_finalized = true;
        draw.ticket_sales_closed_at = Some(now());
        assert!(matches!(check_preconditions(&draw), Err(EngineError::SealedSeedMissing(1))));

        draw.ticket_sales_closed_at = Some(now() - Duration::hours(2));
        assert!(matches!(check_preconditions(&draw), Err(EngineError::LateCommitment(1))));
        draw.ticket_sales_closed_at = Some(now());

        draw.status = DrawStatus::Completed;
        assert!(matches!(check_preconditions(&draw), Err(EngineError::AlreadySettled(1))));
    }
}
