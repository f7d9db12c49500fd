//! Operator actions and public draw verification

use crate::db::{DrawQuery, Repository, StorageError};
use crate::engine::{DrawEngine, EngineError, ExecutionSummary};
use crate::notify::{Notifier, OperatorAlert};
use crate::payout::{PayoutError, PayoutQueue};
use crate::randomness::{verify_numbers, verify_seed_hash, Seed};
use crate::sender::TransactionSender;
use crate::types::{DrawId, DrawStatus, LotteryId, Payout, PayoutId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum AdminError {
    #[error("lottery {0} has no scheduled draw")]
    NoScheduledDraw(LotteryId),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Payout(#[from] PayoutError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Public proof that a draw's numbers follow from its committed seed.
///
/// Before reveal `seed` is absent and both checks are false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub draw_id: DrawId,
    pub seed_hash: Option<String>,
    pub seed: Option<String>,
    pub winning_numbers: Vec<u8>,
    pub seed_hash_valid: bool,
    pub numbers_valid: bool,
    pub verified: bool,
}

/// Recompute a draw from its revealed seed.
///
/// A completed draw that fails is reported to the operator as a mismatch.
pub fn verify_draw(
    repo: &dyn Repository,
    notifier: &dyn Notifier,
    draw_id: DrawId,
) -> Result<VerificationReport, StorageError> {
    let draw = repo.get_draw(draw_id)?;
    let lottery = repo.get_lottery(draw.lottery_id)?;

    let seed = draw.seed.as_deref().and_then(|s| Seed::from_hex(s).ok());
    let (seed_hash_valid, numbers_valid) = match (&seed, &draw.seed_hash) {
        (Some(seed), Some(hash)) => (
            verify_seed_hash(seed, hash),
            verify_numbers(seed, &draw.winning_numbers, lottery.numbers_count, lottery.max_number),
        ),
        _ => (false, false),
    };
    let verified = seed_hash_valid && numbers_valid;

    if draw.status == DrawStatus::Completed && !verified {
        let detail = format!("seed_hash_valid={} numbers_valid={}", seed_hash_valid, numbers_valid);
        error!("Draw #{} failed verification: {}", draw_id, detail);
        notifier.alert(OperatorAlert::VerificationMismatch { draw_id, detail });
    }

    Ok(VerificationReport {
        draw_id,
        seed_hash: draw.seed_hash,
        seed: draw.seed,
        winning_numbers: draw.winning_numbers,
        seed_hash_valid,
        numbers_valid,
        verified,
    })
}

pub struct Admin<S: TransactionSender> {
    engine: Arc<DrawEngine>,
    payouts: Arc<PayoutQueue<S>>,
}

impl<S: TransactionSender> Admin<S> {
    pub fn new(engine: Arc<DrawEngine>, payouts: Arc<PayoutQueue<S>>) -> Self {
        Self { engine, payouts }
    }

    /// Execute the lottery's earliest scheduled draw now.
    ///
    /// Same preconditions as a scheduled execution: the seed must be
    /// committed and the data finalized.
    pub async fn execute_draw_now(&self, lottery_id: LotteryId) -> Result<ExecutionSummary, AdminError> {
        let next = self
            .engine
            .repo()
            .list_draws(&DrawQuery {
                lottery_id: Some(lottery_id),
                ..DrawQuery::scheduled()
            })?
            .into_iter()
            .next()
            .ok_or(AdminError::NoScheduledDraw(lottery_id))?;

        info!("Manual execution of draw #{} (lottery {})", next.id, lottery_id);
        Ok(self.engine.execute_draw(next.id).await?)
    }

    pub fn cancel_payout(&self, id: PayoutId) -> Result<Payout, AdminError> {
        Ok(self.payouts.cancel(id)?)
    }

    pub fn retry_payout(&self, id: PayoutId) -> Result<Payout, AdminError> {
        Ok(self.payouts.retry(id)?)
    }

    pub fn verify_draw(&self, draw_id: DrawId) -> Result<VerificationReport, AdminError> {
        Ok(verify_draw(
            self.engine.repo().as_ref(),
            self.engine.notifier().as_ref(),
            draw_id,
        )?)
    }
}
