//! Draw execution tests
//!
//! Run with: cargo test --test engine_test

use drawkeeper::{
    Admin, AdminError, ChannelNotifier, DrawEngine, DrawEvent, DryRunSender, EngineConfig,
    EngineError, MemoryStorage, Notification, Notifier, OperatorAlert, PayoutConfig, PayoutQueue,
    PayoutQuery, Repository, Seed, SeedVault, SledStorage, hash_seed,
};
use drawkeeper::types::{
    Draw, DrawStatus, LedgerKind, Lottery, PayoutStatus, PrizeTier, RevenueSplit, Ticket,
    TicketStatus, TierPrize, now,
};
use chrono::Duration;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;

const LOTTERY: u64 = 1;
const DRAW: u64 = 100;

/// 31 zero bytes then 0x01
fn known_seed() -> Seed {
    let mut bytes = [0u8; 32];
    bytes[31] = 1;
    Seed::from_bytes(bytes)
}

/// Numbers derived from `known_seed()` for 5 of 36
const KNOWN_NUMBERS: [u8; 5] = [11, 12, 22, 31, 32];

fn lottery() -> Lottery {
    Lottery {
        id: LOTTERY,
        name: "5 of 36".into(),
        numbers_count: 5,
        max_number: 36,
        ticket_price: 1_000,
        currency: "TON".into(),
        jackpot_balance: 100_000,
        jackpot_seed: 10_000,
        financial: RevenueSplit::default(),
        prize_tiers: vec![
            PrizeTier { matches: 4, prize: TierPrize::Percentage(3_000) },
            PrizeTier { matches: 3, prize: TierPrize::Percentage(5_000) },
        ],
    }
}

struct Harness {
    repo: Arc<dyn Repository>,
    vault: SeedVault,
    engine: Arc<DrawEngine>,
    events: mpsc::Receiver<Notification>,
}

impl Harness {
    fn new(repo: Arc<dyn Repository>) -> Self {
        let vault = SeedVault::new(&[7u8; 32]);
        let (notifier, events) = ChannelNotifier::new(256);
        let notifier: Arc<dyn Notifier> = Arc::new(notifier);
        let engine = Arc::new(DrawEngine::new(
            Arc::clone(&repo),
            vault.clone(),
            notifier,
            EngineConfig { settle_workers: 3, ..Default::default() },
        ));
        repo.insert_lottery(&lottery()).unwrap();
        Self { repo, vault, engine, events }
    }

    fn memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// Committed, closed and finalized draw sealed with `seed`
    fn ready_draw(&self, id: u64, seed: &Seed, tickets: &[Vec<u8>]) {
        let mut revenue = 0;
        for numbers in tickets {
            let ticket_id = self.repo.next_id().unwrap();
            let ticket = Ticket::new(ticket_id, id, numbers.clone(), format!("EQ{}", ticket_id), "TON", 1_000);
            self.repo.insert_ticket(&ticket).unwrap();
            revenue += ticket.price;
        }

        let mut draw = Draw::new(id, LOTTERY, id, now() - Duration::minutes(1));
        draw.seed_hash = Some(hash_seed(seed));
        draw.seed_hash_published_at = Some(now() - Duration::days(1));
        draw.sealed_seed = Some(self.vault.seal(id, seed).unwrap());
        draw.ticket_sales_open = false;
        draw.ticket_sales_closed_at = Some(now() - Duration::minutes(5));
        draw.data_finalized = true;
        draw.data_finalized_at = Some(now() - Duration::minutes(4));
        draw.total_tickets = tickets.len() as u64;
        draw.total_revenue = revenue;
        draw.total_prize_pool = lottery().financial.split(revenue).prize_fund;
        self.repo.insert_draw(&draw).unwrap();
    }

    fn admin(&self) -> Admin<DryRunSender> {
        let payouts = PayoutQueue::new(
            Arc::clone(&self.repo),
            Arc::new(DryRunSender::new(HashMap::new())),
            Arc::clone(self.engine.notifier()),
            PayoutConfig::default(),
        );
        Admin::new(Arc::clone(&self.engine), Arc::new(payouts))
    }

    fn drain_events(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = self.events.try_recv() {
            out.push(n);
        }
        out
    }
}

fn scenario_tickets() -> Vec<Vec<u8>> {
    vec![
        KNOWN_NUMBERS.to_vec(),   // jackpot
        vec![11, 12, 22, 1, 2],   // 3 matches
        vec![31, 32, 11, 3, 4],   // 3 matches
        vec![1, 2, 3, 4, 5],      // nothing
        vec![11, 12],             // malformed
    ]
}

// =============================================================================
// SETTLEMENT
// =============================================================================

async fn known_seed_scenario(mut h: Harness) {
    h.ready_draw(DRAW, &known_seed(), &scenario_tickets());

    let summary = h.engine.execute_draw(DRAW).await.unwrap();
    assert_eq!(summary.winning_numbers, KNOWN_NUMBERS.to_vec());
    assert_eq!(summary.total_tickets, 5);

    // revenue 5000 → prize fund 2500 → jackpot +375, payout pool 2125
    // jackpot: 100_000 + 375, tier 3: 2125 * 50% / 2
    let jackpot = 100_375;
    let tier3 = 2_125 * 5_000 / 10_000 / 2;
    assert_eq!(summary.winners_by_tier, BTreeMap::from([(3u8, 2u64), (5u8, 1u64)]));
    assert_eq!(summary.jackpot_paid, jackpot);
    assert_eq!(summary.total_paid, jackpot + 2 * tier3);
    assert_eq!(summary.payouts_enqueued, 3);

    let tickets = h.repo.tickets_for_draw(DRAW).unwrap();
    let by_numbers = |n: &[u8]| tickets.iter().find(|t| t.numbers == n).unwrap().clone();

    let top = by_numbers(&KNOWN_NUMBERS);
    assert_eq!(top.matched_numbers, 5);
    assert_eq!(top.status, TicketStatus::Won);
    assert_eq!(top.prize_amount, jackpot);

    let three = by_numbers(&[11, 12, 22, 1, 2]);
    assert_eq!(three.matched_numbers, 3);
    assert_eq!(three.prize_amount, tier3);

    let malformed = by_numbers(&[11, 12]);
    assert_eq!(malformed.status, TicketStatus::Lost);
    assert_eq!(malformed.prize_amount, 0);

    assert!(tickets.iter().all(|t| t.status != TicketStatus::Pending));
    let sum: u64 = tickets.iter().map(|t| t.prize_amount).sum();
    assert_eq!(sum, summary.total_paid);

    // Draw carries the revealed seed and no sealed copy
    let draw = h.repo.get_draw(DRAW).unwrap();
    assert_eq!(draw.status, DrawStatus::Completed);
    assert_eq!(draw.seed, Some(known_seed().to_hex()));
    assert!(draw.sealed_seed.is_none());
    assert_eq!(draw.payout_pool, 2_125);
    assert_eq!(draw.total_paid, summary.total_paid);
    assert!(draw.settled_at.is_some());

    // Jackpot reset to its seed value
    assert_eq!(h.repo.get_lottery(LOTTERY).unwrap().jackpot_balance, 10_000);

    let ledger = h.repo.ledger_for_draw(DRAW).unwrap();
    let amount = |kind: LedgerKind| ledger.iter().find(|e| e.kind == kind).map(|e| e.amount);
    assert_eq!(amount(LedgerKind::JackpotContribution), Some(375));
    assert_eq!(amount(LedgerKind::PayoutPool), Some(2_125));
    assert_eq!(amount(LedgerKind::Reserve), Some(500));
    assert_eq!(amount(LedgerKind::PlatformRevenue), Some(2_000));
    assert_eq!(amount(LedgerKind::TierPayout { matches: 3 }), Some(2 * tier3));
    assert_eq!(amount(LedgerKind::JackpotPayout), Some(jackpot));

    let payouts = h.repo.list_payouts(&PayoutQuery::default()).unwrap();
    assert_eq!(payouts.len(), 3);
    assert!(payouts.iter().all(|p| p.status == PayoutStatus::Pending && p.attempts == 0));

    let kinds: Vec<&str> = h
        .drain_events()
        .into_iter()
        .filter_map(|n| match n {
            Notification::Event(e) => Some(e.kind()),
            Notification::Alert(_) => None,
        })
        .collect();
    assert_eq!(kinds, vec!["seed_revealed", "numbers_generated", "results_announced"]);
}

#[tokio::test]
async fn test_known_seed_scenario_memory() {
    known_seed_scenario(Harness::memory()).await;
}

#[tokio::test]
async fn test_known_seed_scenario_sled() {
    known_seed_scenario(Harness::new(Arc::new(SledStorage::temporary().unwrap()))).await;
}

#[tokio::test]
async fn test_percentage_tiers_stay_within_pool() {
    let h = Harness::memory();
    let mut tickets = Vec::new();
    for i in 0..20u8 {
        // 4 matches, fifth number varies
        tickets.push(vec![11, 12, 22, 31, 1 + (i % 10)]);
    }
    h.ready_draw(DRAW, &known_seed(), &tickets);

    let summary = h.engine.execute_draw(DRAW).await.unwrap();
    let draw = h.repo.get_draw(DRAW).unwrap();
    assert_eq!(summary.jackpot_paid, 0);
    assert!(summary.total_paid <= draw.payout_pool);
    assert_eq!(summary.winners_by_tier.get(&4), Some(&20));
}

#[tokio::test]
async fn test_fixed_tier_scaled_to_pool() {
    let h = Harness::memory();
    h.repo
        .update_lottery_if(LOTTERY, &|_| true, &mut |l| {
            l.prize_tiers = vec![
                PrizeTier { matches: 4, prize: TierPrize::Percentage(5_000) },
                PrizeTier { matches: 3, prize: TierPrize::Percentage(5_000) },
                PrizeTier { matches: 2, prize: TierPrize::Fixed(1_000) },
            ];
        })
        .unwrap();
    // Two matches each against 11 12 22 31 32
    h.ready_draw(DRAW, &known_seed(), &[vec![11, 12, 1, 2, 3], vec![22, 31, 1, 2, 3], vec![32, 11, 4, 5, 6]]);

    let summary = h.engine.execute_draw(DRAW).await.unwrap();
    let draw = h.repo.get_draw(DRAW).unwrap();

    // revenue 3000 → payout pool 1275, owed 3 x 1000
    assert_eq!(draw.payout_pool, 1_275);
    assert_eq!(summary.winners_by_tier, BTreeMap::from([(2u8, 3u64)]));
    assert_eq!(summary.total_paid, 1_275);
    assert!(h.repo.tickets_for_draw(DRAW).unwrap().iter().all(|t| t.prize_amount == 425));

    let ledger = h.repo.ledger_for_draw(DRAW).unwrap();
    let tier2 = ledger.iter().find(|e| e.kind == LedgerKind::TierPayout { matches: 2 }).unwrap();
    assert_eq!(tier2.amount, 1_275);
}

#[tokio::test]
async fn test_no_tickets_completes() {
    let h = Harness::memory();
    h.ready_draw(DRAW, &known_seed(), &[]);

    let summary = h.engine.execute_draw(DRAW).await.unwrap();
    assert_eq!(summary.total_tickets, 0);
    assert_eq!(summary.total_paid, 0);
    assert_eq!(h.repo.get_lottery(LOTTERY).unwrap().jackpot_balance, 100_000);
}

// =============================================================================
// IDEMPOTENCE AND RACES
// =============================================================================

#[tokio::test]
async fn test_second_execution_rejected() {
    let h = Harness::memory();
    h.ready_draw(DRAW, &known_seed(), &scenario_tickets());

    let first = h.engine.execute_draw(DRAW).await.unwrap();
    let second = h.engine.execute_draw(DRAW).await.unwrap_err();
    assert!(matches!(second, EngineError::AlreadySettled(DRAW)));
    assert!(second.is_skip());

    let paid: u64 = h.repo.tickets_for_draw(DRAW).unwrap().iter().map(|t| t.prize_amount).sum();
    assert_eq!(paid, first.total_paid);
    assert_eq!(h.repo.list_payouts(&PayoutQuery::default()).unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_execute_now_single_winner() {
    let h = Harness::memory();
    h.ready_draw(DRAW, &known_seed(), &scenario_tickets());
    let admin = Arc::new(h.admin());

    let a = tokio::spawn({
        let admin = Arc::clone(&admin);
        async move { admin.execute_draw_now(LOTTERY).await }
    });
    let b = tokio::spawn({
        let admin = Arc::clone(&admin);
        async move { admin.execute_draw_now(LOTTERY).await }
    });
    let results = [a.await.unwrap(), b.await.unwrap()];

    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 1);
    for r in &results {
        if let Err(e) = r {
            match e {
                AdminError::Engine(e) => assert!(e.is_skip(), "unexpected {}", e),
                // Loser ran after the draw left Scheduled
                AdminError::NoScheduledDraw(LOTTERY) => {}
                other => panic!("unexpected {}", other),
            }
        }
    }
    assert_eq!(h.repo.list_payouts(&PayoutQuery::default()).unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_draws_never_share_a_jackpot() {
    let h = Harness::memory();
    h.ready_draw(DRAW, &known_seed(), &[KNOWN_NUMBERS.to_vec()]);
    h.ready_draw(DRAW + 1, &known_seed(), &[KNOWN_NUMBERS.to_vec()]);

    let a = tokio::spawn({
        let engine = Arc::clone(&h.engine);
        async move { engine.execute_draw(DRAW).await }
    });
    let b = tokio::spawn({
        let engine = Arc::clone(&h.engine);
        async move { engine.execute_draw(DRAW + 1).await }
    });
    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();

    // One draw takes 100_000 plus contributions, the other what the reset left
    let contributions = 2 * 75;
    assert_eq!(a.jackpot_paid + b.jackpot_paid, 100_000 + contributions + 10_000);
    assert!(a.jackpot_paid.min(b.jackpot_paid) <= 10_000 + contributions);
    assert_eq!(h.repo.get_lottery(LOTTERY).unwrap().jackpot_balance, 10_000);
}

#[tokio::test]
async fn test_execute_now_without_draw() {
    let h = Harness::memory();
    let err = h.admin().execute_draw_now(LOTTERY).await.unwrap_err();
    assert!(matches!(err, AdminError::NoScheduledDraw(LOTTERY)));
}

#[tokio::test]
async fn test_execute_now_picks_earliest() {
    let h = Harness::memory();
    h.ready_draw(DRAW, &known_seed(), &[]);
    h.ready_draw(DRAW + 1, &known_seed(), &[]);
    h.repo
        .update_draw_if(DRAW + 1, &|_| true, &mut |d| d.scheduled_at = now() - Duration::hours(1))
        .unwrap();

    let summary = h.admin().execute_draw_now(LOTTERY).await.unwrap();
    assert_eq!(summary.draw_id, DRAW + 1);
}

// =============================================================================
// PRECONDITIONS AND FAILURES
// =============================================================================

#[tokio::test]
async fn test_unfinalized_draw_not_claimed() {
    let h = Harness::memory();
    h.ready_draw(DRAW, &known_seed(), &[]);
    h.repo
        .update_draw_if(DRAW, &|_| true, &mut |d| d.data_finalized = false)
        .unwrap();

    let err = h.engine.execute_draw(DRAW).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFinalized(DRAW)));

    let draw = h.repo.get_draw(DRAW).unwrap();
    assert_eq!(draw.status, DrawStatus::Scheduled);
    assert!(draw.execution_claimed_at.is_none());
}

#[tokio::test]
async fn test_uncommitted_draw_rejected() {
    let h = Harness::memory();
    h.repo.insert_draw(&Draw::new(DRAW, LOTTERY, 1, now())).unwrap();
    let err = h.engine.execute_draw(DRAW).await.unwrap_err();
    assert!(matches!(err, EngineError::SeedNotCommitted(DRAW)));
}

#[tokio::test]
async fn test_foreign_seal_fails_draw() {
    let mut h = Harness::memory();
    h.ready_draw(DRAW, &known_seed(), &scenario_tickets());
    let foreign = SeedVault::new(&[9u8; 32]).seal(DRAW, &known_seed()).unwrap();
    h.repo
        .update_draw_if(DRAW, &|_| true, &mut |d| d.sealed_seed = Some(foreign.clone()))
        .unwrap();

    let err = h.engine.execute_draw(DRAW).await.unwrap_err();
    assert!(matches!(err, EngineError::Seal(_)));

    let draw = h.repo.get_draw(DRAW).unwrap();
    assert_eq!(draw.status, DrawStatus::Failed);
    assert!(draw.failure_reason.is_some());
    assert!(draw.winning_numbers.is_empty());
    assert!(h.repo.tickets_for_draw(DRAW).unwrap().iter().all(|t| t.status == TicketStatus::Pending));

    let events = h.drain_events();
    assert!(events.contains(&Notification::Event(DrawEvent::DrawFailed {
        draw_id: DRAW,
        reason: draw.failure_reason.clone().unwrap(),
    })));
    assert!(events.iter().any(|n| matches!(n, Notification::Alert(OperatorAlert::DrawFailed { .. }))));

    // Failed is terminal
    let again = h.engine.execute_draw(DRAW).await.unwrap_err();
    assert!(matches!(again, EngineError::AlreadySettled(DRAW)));
}

#[tokio::test]
async fn test_commitment_after_sales_close_fails_draw() {
    let mut h = Harness::memory();
    h.ready_draw(DRAW, &known_seed(), &scenario_tickets());
    h.repo
        .update_draw_if(DRAW, &|_| true, &mut |d| d.seed_hash_published_at = Some(now()))
        .unwrap();

    let err = h.engine.execute_draw(DRAW).await.unwrap_err();
    assert!(matches!(err, EngineError::LateCommitment(DRAW)));

    let draw = h.repo.get_draw(DRAW).unwrap();
    assert_eq!(draw.status, DrawStatus::Failed);
    assert!(draw.winning_numbers.is_empty());
    assert!(draw.seed.is_none());
    assert!(h
        .drain_events()
        .iter()
        .any(|n| matches!(n, Notification::Alert(OperatorAlert::DrawFailed { draw_id: DRAW, .. }))));
}

#[tokio::test]
async fn test_commitment_mismatch_alerts() {
    let mut h = Harness::memory();
    h.ready_draw(DRAW, &known_seed(), &[]);
    h.repo
        .update_draw_if(DRAW, &|_| true, &mut |d| d.seed_hash = Some(hash_seed(&Seed::from_bytes([3u8; 32]))))
        .unwrap();

    let err = h.engine.execute_draw(DRAW).await.unwrap_err();
    assert!(matches!(err, EngineError::VerificationMismatch(DRAW)));
    assert_eq!(h.repo.get_draw(DRAW).unwrap().status, DrawStatus::Failed);
    assert!(h
        .drain_events()
        .iter()
        .any(|n| matches!(n, Notification::Alert(OperatorAlert::VerificationMismatch { draw_id: DRAW, .. }))));
}

#[tokio::test]
async fn test_stale_claim_recovered() {
    let h = Harness::memory();
    h.ready_draw(DRAW, &known_seed(), &[]);
    h.repo
        .update_draw_if(DRAW, &|_| true, &mut |d| d.execution_claimed_at = Some(now() - Duration::hours(2)))
        .unwrap();

    // Claimed elsewhere, so this caller backs off
    let err = h.engine.execute_draw(DRAW).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExecuting(DRAW)));

    assert_eq!(h.engine.recover_stale_executions(now(), Duration::hours(3)).unwrap(), 0);
    assert_eq!(h.engine.recover_stale_executions(now(), Duration::minutes(30)).unwrap(), 1);

    let draw = h.repo.get_draw(DRAW).unwrap();
    assert_eq!(draw.status, DrawStatus::Failed);
    assert_eq!(draw.failure_reason.as_deref(), Some("execution interrupted"));
}

#[tokio::test]
async fn test_unsettled_completed_draw_recovered() {
    let mut h = Harness::memory();
    h.ready_draw(DRAW, &known_seed(), &scenario_tickets());
    // Results committed, then the executor died before settling
    h.repo
        .update_draw_if(DRAW, &|_| true, &mut |d| {
            d.status = DrawStatus::Completed;
            d.winning_numbers = KNOWN_NUMBERS.to_vec();
            d.execution_claimed_at = Some(now() - Duration::hours(2));
            d.executed_at = Some(now() - Duration::hours(2));
        })
        .unwrap();

    // A fully settled draw with an equally old claim is left alone
    h.ready_draw(DRAW + 1, &known_seed(), &[vec![1, 2, 3, 4, 5]]);
    h.engine.execute_draw(DRAW + 1).await.unwrap();
    h.repo
        .update_draw_if(DRAW + 1, &|_| true, &mut |d| d.execution_claimed_at = Some(now() - Duration::hours(2)))
        .unwrap();
    h.drain_events();

    assert_eq!(h.engine.recover_stale_executions(now(), Duration::hours(3)).unwrap(), 0);
    assert_eq!(h.engine.recover_stale_executions(now(), Duration::minutes(30)).unwrap(), 1);

    let draw = h.repo.get_draw(DRAW).unwrap();
    assert_eq!(draw.status, DrawStatus::Failed);
    assert_eq!(draw.failure_reason.as_deref(), Some("settlement interrupted with 5 tickets pending"));
    assert_eq!(h.repo.get_draw(DRAW + 1).unwrap().status, DrawStatus::Completed);
    assert!(h
        .drain_events()
        .iter()
        .any(|n| matches!(n, Notification::Alert(OperatorAlert::DrawFailed { draw_id: DRAW, .. }))));

    // Nothing left to recover
    assert_eq!(h.engine.recover_stale_executions(now(), Duration::minutes(30)).unwrap(), 0);
}

#[tokio::test]
async fn test_completed_draw_verifies() {
    let h = Harness::memory();
    h.ready_draw(DRAW, &known_seed(), &scenario_tickets());
    h.engine.execute_draw(DRAW).await.unwrap();

    let report = h.admin().verify_draw(DRAW).unwrap();
    assert!(report.seed_hash_valid);
    assert!(report.numbers_valid);
    assert!(report.verified);
    assert_eq!(report.winning_numbers, KNOWN_NUMBERS.to_vec());
}
