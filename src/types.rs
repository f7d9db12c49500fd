// Drawkeeper — Domain Types
// Distributed under the MIT software license.

//! Lotteries, draws, tickets, payouts and ledger entries.
//!
//! All money values are `u64` in the smallest unit of their currency
//! (nanoTON for TON). All percentages are basis points.

use crate::seal::SealedSeed;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// CONSTANTS
// =============================================================================

/// 100% in basis points.
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Largest supported draw size (numbers per ticket).
pub const MAX_NUMBERS_COUNT: u8 = 32;

/// Default prize fund share of ticket revenue (50%).
pub const DEFAULT_PRIZE_FUND_BPS: u64 = 5_000;

/// Default jackpot share of the prize fund (15%). Remainder is the payout pool.
pub const DEFAULT_JACKPOT_BPS: u64 = 1_500;

/// Default reserve share of the platform share (20%). Remainder is net revenue.
pub const DEFAULT_RESERVE_BPS: u64 = 2_000;

pub type LotteryId = u64;
pub type DrawId = u64;
pub type TicketId = u64;
pub type PayoutId = u64;

/// Current wall-clock time
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

// =============================================================================
// LOTTERY
// =============================================================================

/// How ticket revenue is split between prizes and the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevenueSplit {
    /// Share of each ticket price that goes to the prize fund
    pub prize_fund_bps: u64,
    /// Share of the prize fund that accumulates into the jackpot
    pub jackpot_bps: u64,
    /// Share of the platform share kept as reserve
    pub reserve_bps: u64,
}

impl Default for RevenueSplit {
    fn default() -> Self {
        Self {
            prize_fund_bps: DEFAULT_PRIZE_FUND_BPS,
            jackpot_bps: DEFAULT_JACKPOT_BPS,
            reserve_bps: DEFAULT_RESERVE_BPS,
        }
    }
}

/// Prize of one non-jackpot match tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TierPrize {
    /// Fixed amount per winning ticket
    Fixed(u64),
    /// Share of the payout pool, split evenly between the tier's winners
    Percentage(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrizeTier {
    pub matches: u8,
    pub prize: TierPrize,
}

/// Per-lottery game rules and financial configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lottery {
    pub id: LotteryId,
    pub name: String,
    /// Numbers drawn per draw (K)
    pub numbers_count: u8,
    /// Numbers are drawn from [1, max_number] (N)
    pub max_number: u8,
    pub ticket_price: u64,
    pub currency: String,
    /// Accumulated jackpot, paid in full to the top tier
    pub jackpot_balance: u64,
    /// Value the jackpot resets to after it is won
    pub jackpot_seed: u64,
    pub financial: RevenueSplit,
    pub prize_tiers: Vec<PrizeTier>,
}

impl Lottery {
    pub fn tier(&self, matches: u8) -> Option<&PrizeTier> {
        self.prize_tiers.iter().find(|t| t.matches == matches)
    }
}

// =============================================================================
// DRAW
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DrawStatus {
    Scheduled,
    Completed,
    Failed,
}

/// One scheduled lottery event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draw {
    pub id: DrawId,
    pub lottery_id: LotteryId,
    pub draw_number: u64,
    pub scheduled_at: DateTime<Utc>,

    // Commit-reveal
    pub seed_hash: Option<String>,
    pub seed_hash_published_at: Option<DateTime<Utc>>,
    /// Seed under AES-GCM until reveal. Never exposed publicly.
    pub sealed_seed: Option<SealedSeed>,
    /// Cleartext seed, only set at reveal
    pub seed: Option<String>,
    pub seed_revealed_at: Option<DateTime<Utc>>,

    // Sales control
    pub ticket_sales_open: bool,
    pub ticket_sales_closed_at: Option<DateTime<Utc>>,
    pub data_finalized: bool,
    pub data_finalized_at: Option<DateTime<Utc>>,

    // Results
    pub winning_numbers: Vec<u8>,
    pub total_tickets: u64,
    /// Gross ticket revenue at finalization
    pub total_revenue: u64,
    /// Prize fund share of `total_revenue`
    pub total_prize_pool: u64,
    pub payout_pool: u64,
    pub winners_by_tier: BTreeMap<u8, u64>,
    pub total_paid: u64,
    pub jackpot_paid: u64,

    pub status: DrawStatus,
    /// Internal critical-section marker for execution
    pub execution_claimed_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    /// Set once tickets are settled and payouts queued
    pub settled_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl Draw {
    /// New draw in `Scheduled` state, sales open, no seed fields
    pub fn new(id: DrawId, lottery_id: LotteryId, draw_number: u64, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            id,
            lottery_id,
            draw_number,
            scheduled_at,
            seed_hash: None,
            seed_hash_published_at: None,
            sealed_seed: None,
            seed: None,
            seed_revealed_at: None,
            ticket_sales_open: true,
            ticket_sales_closed_at: None,
            data_finalized: false,
            data_finalized_at: None,
            winning_numbers: Vec::new(),
            total_tickets: 0,
            total_revenue: 0,
            total_prize_pool: 0,
            payout_pool: 0,
            winners_by_tier: BTreeMap::new(),
            total_paid: 0,
            jackpot_paid: 0,
            status: DrawStatus::Scheduled,
            execution_claimed_at: None,
            executed_at: None,
            settled_at: None,
            failure_reason: None,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.status == DrawStatus::Scheduled
    }

    /// Seed hash was published while ticket sales were still open
    pub fn committed_before_close(&self) -> bool {
        match (self.seed_hash_published_at, self.ticket_sales_closed_at) {
            (Some(published), Some(closed)) => published <= closed,
            (Some(_), None) => self.ticket_sales_open,
            (None, _) => false,
        }
    }
}

// =============================================================================
// TICKET
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketStatus {
    Pending,
    Won,
    Lost,
}

/// One number selection purchased against a draw
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub draw_id: DrawId,
    pub numbers: Vec<u8>,
    pub wallet_address: String,
    pub currency: String,
    pub price: u64,
    pub purchased_at: DateTime<Utc>,

    // Set exactly once at settlement
    pub status: TicketStatus,
    pub matched_numbers: u8,
    pub prize_amount: u64,
    /// Set when the prize payout completes
    pub prize_claimed: bool,
}

impl Ticket {
    pub fn new(
        id: TicketId,
        draw_id: DrawId,
        numbers: Vec<u8>,
        wallet_address: impl Into<String>,
        currency: impl Into<String>,
        price: u64,
    ) -> Self {
        Self {
            id,
            draw_id,
            numbers,
            wallet_address: wallet_address.into(),
            currency: currency.into(),
            price,
            purchased_at: now(),
            status: TicketStatus::Pending,
            matched_numbers: 0,
            prize_amount: 0,
            prize_claimed: false,
        }
    }
}

// =============================================================================
// PAYOUT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl PayoutStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Obligation to transfer a prize to a ticket's wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub id: PayoutId,
    pub ticket_id: TicketId,
    pub draw_id: DrawId,
    pub wallet_address: String,
    pub amount: u64,
    pub currency: String,
    pub status: PayoutStatus,
    pub attempts: u32,
    /// Hash of the last successful transfer
    pub tx_hash: Option<String>,
    /// One hash per transfer chunk sent so far
    pub tx_hashes: Vec<String>,
    /// Sum of the chunks already sent
    pub amount_sent: u64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    /// Refreshed by the worker before every chunk it sends
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl Payout {
    pub fn remaining(&self) -> u64 {
        self.amount.saturating_sub(self.amount_sent)
    }
}

// =============================================================================
// LEDGER
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerKind {
    JackpotContribution,
    Reserve,
    PlatformRevenue,
    PayoutPool,
    TierPayout { matches: u8 },
    JackpotPayout,
    JackpotReset,
}

/// Financial record of how a draw's revenue was distributed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: u64,
    pub lottery_id: LotteryId,
    pub draw_id: DrawId,
    pub kind: LedgerKind,
    pub amount: u64,
    pub recorded_at: DateTime<Utc>,
}
