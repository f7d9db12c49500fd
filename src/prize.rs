//! Prize calculation — revenue split, jackpot and per-tier prizes
//!
//! ```text
//! ticket revenue ─┬─ prize fund (prize_fund_bps) ─┬─ jackpot contribution (jackpot_bps)
//!                 │                               └─ payout pool (remainder)
//!                 └─ platform share (remainder) ──┬─ reserve (reserve_bps)
//!                                                 └─ net revenue (remainder)
//! ```
//!
//! Everything here is pure. Balance updates and ledger entries are the
//! caller's job.

use crate::types::{Lottery, TierPrize, BPS_DENOMINATOR, MAX_NUMBERS_COUNT, RevenueSplit};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrizeError {
    #[error("invalid game: {count} of {max}")]
    InvalidGame { count: u8, max: u8 },
    #[error("basis points out of range: {0}")]
    InvalidBps(u64),
    #[error("percentage tiers sum to {0} bps (max 10000)")]
    PoolOverAllocated(u64),
    #[error("invalid tier: {0} matches")]
    InvalidTier(u8),
    #[error("duplicate tier: {0} matches")]
    DuplicateTier(u8),
}

/// `amount * bps / 10000` without intermediate overflow
pub fn apply_bps(amount: u64, bps: u64) -> u64 {
    ((amount as u128 * bps as u128) / BPS_DENOMINATOR as u128) as u64
}

/// Result of splitting ticket revenue. Parts always sum to the input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevenueBreakdown {
    pub prize_fund: u64,
    pub jackpot_contribution: u64,
    pub payout_pool: u64,
    pub platform_share: u64,
    pub reserve: u64,
    pub net_revenue: u64,
}

impl RevenueSplit {
    pub fn validate(&self) -> Result<(), PrizeError> {
        for bps in [self.prize_fund_bps, self.jackpot_bps, self.reserve_bps] {
            if bps > BPS_DENOMINATOR {
                return Err(PrizeError::InvalidBps(bps));
            }
        }
        Ok(())
    }

    pub fn split(&self, revenue: u64) -> RevenueBreakdown {
        let prize_fund = apply_bps(revenue, self.prize_fund_bps);
        let platform_share = revenue - prize_fund;
        let jackpot_contribution = apply_bps(prize_fund, self.jackpot_bps);
        let reserve = apply_bps(platform_share, self.reserve_bps);
        RevenueBreakdown {
            prize_fund,
            jackpot_contribution,
            payout_pool: prize_fund - jackpot_contribution,
            platform_share,
            reserve,
            net_revenue: platform_share - reserve,
        }
    }
}

/// Validate a lottery's game rules and prize distribution
pub fn validate_lottery(lottery: &Lottery) -> Result<(), PrizeError> {
    let (k, n) = (lottery.numbers_count, lottery.max_number);
    if k == 0 || k > n || k > MAX_NUMBERS_COUNT {
        return Err(PrizeError::InvalidGame { count: k, max: n });
    }
    lottery.financial.validate()?;

    let mut seen = HashSet::new();
    let mut allocated = 0u64;
    for tier in &lottery.prize_tiers {
        if tier.matches == 0 || tier.matches >= k {
            return Err(PrizeError::InvalidTier(tier.matches));
        }
        if !seen.insert(tier.matches) {
            return Err(PrizeError::DuplicateTier(tier.matches));
        }
        if let TierPrize::Percentage(bps) = tier.prize {
            allocated = allocated.saturating_add(bps);
        }
    }
    if allocated > BPS_DENOMINATOR {
        return Err(PrizeError::PoolOverAllocated(allocated));
    }
    Ok(())
}

/// Stateless prize rules over a lottery's configuration
pub struct PrizeCalculator;

impl PrizeCalculator {
    /// Lowest match count that pays anything. The jackpot tier always pays.
    pub fn minimum_prize_tier(lottery: &Lottery) -> u8 {
        lottery
            .prize_tiers
            .iter()
            .map(|t| t.matches)
            .min()
            .unwrap_or(lottery.numbers_count)
    }

    /// Prize for one ticket in `match_tier`.
    ///
    /// The jackpot tier returns the whole current jackpot balance.
    /// Percentage tiers split their share of the pool between the tier's winners.
    pub fn dynamic_prize(
        lottery: &Lottery,
        match_tier: u8,
        winners_by_tier: &BTreeMap<u8, u64>,
        payout_pool: u64,
    ) -> u64 {
        if match_tier == lottery.numbers_count {
            return lottery.jackpot_balance;
        }

        match lottery.tier(match_tier).map(|t| t.prize) {
            Some(TierPrize::Fixed(amount)) => amount,
            Some(TierPrize::Percentage(bps)) => {
                let winners = winners_by_tier.get(&match_tier).copied().unwrap_or(0);
                if winners == 0 {
                    return 0;
                }
                apply_bps(payout_pool, bps) / winners
            }
            None => 0,
        }
    }

    /// Per-ticket prize for every non-jackpot tier that has winners.
    ///
    /// Percentage tiers are priced first. Fixed tiers share what is left of
    /// the pool and are scaled down pro rata when their full amounts would
    /// overspend it, so the tiers together never pay more than `payout_pool`.
    pub fn tier_prizes(
        lottery: &Lottery,
        winners_by_tier: &BTreeMap<u8, u64>,
        payout_pool: u64,
    ) -> BTreeMap<u8, u64> {
        let mut prizes = BTreeMap::new();
        let mut percentage_paid = 0u64;
        let mut fixed_total = 0u128;

        for (&tier, &winners) in winners_by_tier {
            if tier == lottery.numbers_count || winners == 0 {
                continue;
            }
            let prize = Self::dynamic_prize(lottery, tier, winners_by_tier, payout_pool);
            match lottery.tier(tier).map(|t| t.prize) {
                Some(TierPrize::Fixed(_)) => fixed_total += prize as u128 * winners as u128,
                _ => percentage_paid = percentage_paid.saturating_add(prize.saturating_mul(winners)),
            }
            prizes.insert(tier, prize);
        }

        let budget = payout_pool.saturating_sub(percentage_paid) as u128;
        if fixed_total > budget {
            for (tier, prize) in prizes.iter_mut() {
                if let Some(TierPrize::Fixed(_)) = lottery.tier(*tier).map(|t| t.prize) {
                    *prize = (*prize as u128 * budget / fixed_total) as u64;
                }
            }
        }
        prizes
    }
}
