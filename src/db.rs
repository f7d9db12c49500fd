//! Repository for lotteries, draws, tickets, payouts and the ledger
//!
//! Every state transition in the engine goes through an `update_*_if`
//! call: the guard is evaluated against the stored value and the mutation
//! is applied only if it still holds. Zero rows affected is reported as
//! `Ok(None)`. This is the only mutual-exclusion primitive the engine
//! relies on, so it has to hold across processes sharing one store.
//!
//! Two backends:
//! - `SledStorage`: embedded, durable, CAS via `compare_and_swap`
//! - `MemoryStorage`: process-local, for tests and ephemeral runs

use crate::types::{
    Draw, DrawId, DrawStatus, LedgerEntry, Lottery, LotteryId, Payout, PayoutId, PayoutStatus,
    Ticket, TicketId,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },
    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: u64 },
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("storage lock poisoned")]
    Poisoned,
}

/// Guard evaluated against the stored value before a conditional update
pub type Guard<'a, T> = &'a dyn Fn(&T) -> bool;

/// Mutation applied when the guard holds
pub type Mutation<'a, T> = &'a mut dyn FnMut(&mut T);

/// Draw selection filter
#[derive(Debug, Clone, Default)]
pub struct DrawQuery {
    pub status: Option<DrawStatus>,
    pub lottery_id: Option<LotteryId>,
    pub scheduled_before: Option<DateTime<Utc>>,
}

impl DrawQuery {
    pub fn scheduled() -> Self {
        Self {
            status: Some(DrawStatus::Scheduled),
            ..Default::default()
        }
    }

    pub fn matches(&self, draw: &Draw) -> bool {
        self.status.is_none_or(|s| draw.status == s)
            && self.lottery_id.is_none_or(|l| draw.lottery_id == l)
            && self.scheduled_before.is_none_or(|t| draw.scheduled_at <= t)
    }
}

/// Payout selection filter
#[derive(Debug, Clone, Default)]
pub struct PayoutQuery {
    pub status: Option<PayoutStatus>,
    pub draw_id: Option<DrawId>,
    /// Only payouts with fewer attempts than this
    pub attempts_below: Option<u32>,
    pub limit: Option<usize>,
}

impl PayoutQuery {
    pub fn matches(&self, payout: &Payout) -> bool {
        self.status.is_none_or(|s| payout.status == s)
            && self.draw_id.is_none_or(|d| payout.draw_id == d)
            && self.attempts_below.is_none_or(|a| payout.attempts < a)
    }
}

/// Storage contract consumed by the engine, scheduler and payout queue
pub trait Repository: Send + Sync {
    fn next_id(&self) -> Result<u64, StorageError>;

    fn insert_lottery(&self, lottery: &Lottery) -> Result<(), StorageError>;
    fn get_lottery(&self, id: LotteryId) -> Result<Lottery, StorageError>;
    fn update_lottery_if(
        &self,
        id: LotteryId,
        guard: Guard<'_, Lottery>,
        mutate: Mutation<'_, Lottery>,
    ) -> Result<Option<Lottery>, StorageError>;

    fn insert_draw(&self, draw: &Draw) -> Result<(), StorageError>;
    fn get_draw(&self, id: DrawId) -> Result<Draw, StorageError>;
    /// Matching draws ordered by `scheduled_at`, then id
    fn list_draws(&self, query: &DrawQuery) -> Result<Vec<Draw>, StorageError>;
    fn update_draw_if(
        &self,
        id: DrawId,
        guard: Guard<'_, Draw>,
        mutate: Mutation<'_, Draw>,
    ) -> Result<Option<Draw>, StorageError>;

    fn insert_ticket(&self, ticket: &Ticket) -> Result<(), StorageError>;
    fn get_ticket(&self, id: TicketId) -> Result<Ticket, StorageError>;
    fn tickets_for_draw(&self, draw_id: DrawId) -> Result<Vec<Ticket>, StorageError>;
    fn update_ticket_if(
        &self,
        id: TicketId,
        guard: Guard<'_, Ticket>,
        mutate: Mutation<'_, Ticket>,
    ) -> Result<Option<Ticket>, StorageError>;

    /// Insert unless a payout already exists for the same ticket.
    /// Returns false for the duplicate.
    fn insert_payout_if_absent(&self, payout: &Payout) -> Result<bool, StorageError>;
    fn get_payout(&self, id: PayoutId) -> Result<Payout, StorageError>;
    fn payout_for_ticket(&self, ticket_id: TicketId) -> Result<Option<Payout>, StorageError>;
    /// Matching payouts ordered oldest first
    fn list_payouts(&self, query: &PayoutQuery) -> Result<Vec<Payout>, StorageError>;
    fn update_payout_if(
        &self,
        id: PayoutId,
        guard: Guard<'_, Payout>,
        mutate: Mutation<'_, Payout>,
    ) -> Result<Option<Payout>, StorageError>;

    fn append_ledger(&self, entry: &LedgerEntry) -> Result<(), StorageError>;
    fn ledger_for_draw(&self, draw_id: DrawId) -> Result<Vec<LedgerEntry>, StorageError>;
}

fn sort_draws(draws: &mut [Draw]) {
    draws.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then(a.id.cmp(&b.id)));
}

fn sort_payouts(payouts: &mut Vec<Payout>, limit: Option<usize>) {
    payouts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    if let Some(limit) = limit {
        payouts.truncate(limit);
    }
}

// =============================================================================
// IN-MEMORY BACKEND
// =============================================================================

#[derive(Default)]
struct Tables {
    lotteries: BTreeMap<LotteryId, Lottery>,
    draws: BTreeMap<DrawId, Draw>,
    tickets: BTreeMap<TicketId, Ticket>,
    payouts: BTreeMap<PayoutId, Payout>,
    payout_by_ticket: BTreeMap<TicketId, PayoutId>,
    ledger: Vec<LedgerEntry>,
}

/// Process-local repository. One lock covers guard and write.
#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
    ids: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>, StorageError> {
        self.tables.lock().map_err(|_| StorageError::Poisoned)
    }
}

fn mem_insert<T: Clone>(
    map: &mut BTreeMap<u64, T>,
    kind: &'static str,
    id: u64,
    value: &T,
) -> Result<(), StorageError> {
    if map.contains_key(&id) {
        return Err(StorageError::AlreadyExists { kind, id });
    }
    map.insert(id, value.clone());
    Ok(())
}

fn mem_get<T: Clone>(map: &BTreeMap<u64, T>, kind: &'static str, id: u64) -> Result<T, StorageError> {
    map.get(&id).cloned().ok_or(StorageError::NotFound { kind, id })
}

fn mem_update_if<T: Clone>(
    map: &mut BTreeMap<u64, T>,
    kind: &'static str,
    id: u64,
    guard: Guard<'_, T>,
    mutate: Mutation<'_, T>,
) -> Result<Option<T>, StorageError> {
    let value = map.get_mut(&id).ok_or(StorageError::NotFound { kind, id })?;
    if !guard(value) {
        return Ok(None);
    }
    mutate(value);
    Ok(Some(value.clone()))
}

impl Repository for MemoryStorage {
    fn next_id(&self) -> Result<u64, StorageError> {
        Ok(self.ids.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn insert_lottery(&self, lottery: &Lottery) -> Result<(), StorageError> {
        mem_insert(&mut self.tables()?.lotteries, "lottery", lottery.id, lottery)
    }

    fn get_lottery(&self, id: LotteryId) -> Result<Lottery, StorageError> {
        mem_get(&self.tables()?.lotteries, "lottery", id)
    }

    fn update_lottery_if(
        &self,
        id: LotteryId,
        guard: Guard<'_, Lottery>,
        mutate: Mutation<'_, Lottery>,
    ) -> Result<Option<Lottery>, StorageError> {
        mem_update_if(&mut self.tables()?.lotteries, "lottery", id, guard, mutate)
    }

    fn insert_draw(&self, draw: &Draw) -> Result<(), StorageError> {
        mem_insert(&mut self.tables()?.draws, "draw", draw.id, draw)
    }

    fn get_draw(&self, id: DrawId) -> Result<Draw, StorageError> {
        mem_get(&self.tables()?.draws, "draw", id)
    }

    fn list_draws(&self, query: &DrawQuery) -> Result<Vec<Draw>, StorageError> {
        let mut draws: Vec<Draw> = self
            .tables()?
            .draws
            .values()
            .filter(|d| query.matches(d))
            .cloned()
            .collect();
        sort_draws(&mut draws);
        Ok(draws)
    }

    fn update_draw_if(
        &self,
        id: DrawId,
        guard: Guard<'_, Draw>,
        mutate: Mutation<'_, Draw>,
    ) -> Result<Option<Draw>, StorageError> {
        mem_update_if(&mut self.tables()?.draws, "draw", id, guard, mutate)
    }

    fn insert_ticket(&self, ticket: &Ticket) -> Result<(), StorageError> {
        mem_insert(&mut self.tables()?.tickets, "ticket", ticket.id, ticket)
    }

    fn get_ticket(&self, id: TicketId) -> Result<Ticket, StorageError> {
        mem_get(&self.tables()?.tickets, "ticket", id)
    }

    fn tickets_for_draw(&self, draw_id: DrawId) -> Result<Vec<Ticket>, StorageError> {
        Ok(self
            .tables()?
            .tickets
            .values()
            .filter(|t| t.draw_id == draw_id)
            .cloned()
            .collect())
    }

    fn update_ticket_if(
        &self,
        id: TicketId,
        guard: Guard<'_, Ticket>,
        mutate: Mutation<'_, Ticket>,
    ) -> Result<Option<Ticket>, StorageError> {
        mem_update_if(&mut self.tables()?.tickets, "ticket", id, guard, mutate)
    }

    fn insert_payout_if_absent(&self, payout: &Payout) -> Result<bool, StorageError> {
        let mut tables = self.tables()?;
        if tables.payout_by_ticket.contains_key(&payout.ticket_id) {
            return Ok(false);
        }
        mem_insert(&mut tables.payouts, "payout", payout.id, payout)?;
        tables.payout_by_ticket.insert(payout.ticket_id, payout.id);
        Ok(true)
    }

    fn get_payout(&self, id: PayoutId) -> Result<Payout, StorageError> {
        mem_get(&self.tables()?.payouts, "payout", id)
    }

    fn payout_for_ticket(&self, ticket_id: TicketId) -> Result<Option<Payout>, StorageError> {
        let tables = self.tables()?;
        Ok(tables
            .payout_by_ticket
            .get(&ticket_id)
            .and_then(|id| tables.payouts.get(id))
            .cloned())
    }

    fn list_payouts(&self, query: &PayoutQuery) -> Result<Vec<Payout>, StorageError> {
        let mut payouts: Vec<Payout> = self
            .tables()?
            .payouts
            .values()
            .filter(|p| query.matches(p))
            .cloned()
            .collect();
        sort_payouts(&mut payouts, query.limit);
        Ok(payouts)
    }

    fn update_payout_if(
        &self,
        id: PayoutId,
        guard: Guard<'_, Payout>,
        mutate: Mutation<'_, Payout>,
    ) -> Result<Option<Payout>, StorageError> {
        mem_update_if(&mut self.tables()?.payouts, "payout", id, guard, mutate)
    }

    fn append_ledger(&self, entry: &LedgerEntry) -> Result<(), StorageError> {
        self.tables()?.ledger.push(entry.clone());
        Ok(())
    }

    fn ledger_for_draw(&self, draw_id: DrawId) -> Result<Vec<LedgerEntry>, StorageError> {
        Ok(self
            .tables()?
            .ledger
            .iter()
            .filter(|e| e.draw_id == draw_id)
            .cloned()
            .collect())
    }
}

// =============================================================================
// SLED BACKEND
// =============================================================================

/// Durable repository on sled. Values are bincode, keys big-endian ids.
pub struct SledStorage {
    db: sled::Db,
    lotteries: sled::Tree,
    draws: sled::Tree,
    tickets: sled::Tree,
    /// draw_id ‖ ticket_id → ()
    draw_tickets: sled::Tree,
    payouts: sled::Tree,
    /// ticket_id → payout_id
    payout_by_ticket: sled::Tree,
    ledger: sled::Tree,
}

fn key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn pair_key(a: u64, b: u64) -> [u8; 16] {
    let mut k = [0u8; 16];
    k[..8].copy_from_slice(&a.to_be_bytes());
    k[8..].copy_from_slice(&b.to_be_bytes());
    k
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    Ok(bincode::deserialize(bytes)?)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    Ok(bincode::serialize(value)?)
}

fn tx_error(e: TransactionError<()>) -> StorageError {
    match e {
        TransactionError::Storage(e) => StorageError::Sled(e),
        TransactionError::Abort(()) => StorageError::Poisoned,
    }
}

impl SledStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// Storage deleted on drop
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            lotteries: db.open_tree("lotteries")?,
            draws: db.open_tree("draws")?,
            tickets: db.open_tree("tickets")?,
            draw_tickets: db.open_tree("draw_tickets")?,
            payouts: db.open_tree("payouts")?,
            payout_by_ticket: db.open_tree("payout_by_ticket")?,
            ledger: db.open_tree("ledger")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn insert_new<T: Serialize>(
        tree: &sled::Tree,
        kind: &'static str,
        id: u64,
        value: &T,
    ) -> Result<(), StorageError> {
        let bytes = encode(value)?;
        match tree.compare_and_swap(key(id), None as Option<&[u8]>, Some(bytes))? {
            Ok(()) => Ok(()),
            Err(_) => Err(StorageError::AlreadyExists { kind, id }),
        }
    }

    fn get<T: DeserializeOwned>(tree: &sled::Tree, kind: &'static str, id: u64) -> Result<T, StorageError> {
        match tree.get(key(id))? {
            Some(bytes) => decode(&bytes),
            None => Err(StorageError::NotFound { kind, id }),
        }
    }

    fn scan<T: DeserializeOwned>(tree: &sled::Tree) -> Result<Vec<T>, StorageError> {
        tree.iter()
            .values()
            .map(|v| decode(&v?))
            .collect()
    }

    /// Read, check, write-if-unchanged. Retries when another writer won the race.
    fn update_if<T: Serialize + DeserializeOwned>(
        tree: &sled::Tree,
        kind: &'static str,
        id: u64,
        guard: Guard<'_, T>,
        mutate: Mutation<'_, T>,
    ) -> Result<Option<T>, StorageError> {
        let k = key(id);
        loop {
            let current = tree.get(k)?.ok_or(StorageError::NotFound { kind, id })?;
            let mut value: T = decode(&current)?;
            if !guard(&value) {
                return Ok(None);
            }
            mutate(&mut value);
            let next = encode(&value)?;
            match tree.compare_and_swap(k, Some(&current), Some(next))? {
                Ok(()) => return Ok(Some(value)),
                Err(_) => debug!("CAS retry on {} {}", kind, id),
            }
        }
    }
}

impl Repository for SledStorage {
    fn next_id(&self) -> Result<u64, StorageError> {
        // sled ids start at 0
        Ok(self.db.generate_id()? + 1)
    }

    fn insert_lottery(&self, lottery: &Lottery) -> Result<(), StorageError> {
        Self::insert_new(&self.lotteries, "lottery", lottery.id, lottery)
    }

    fn get_lottery(&self, id: LotteryId) -> Result<Lottery, StorageError> {
        Self::get(&self.lotteries, "lottery", id)
    }

    fn update_lottery_if(
        &self,
        id: LotteryId,
        guard: Guard<'_, Lottery>,
        mutate: Mutation<'_, Lottery>,
    ) -> Result<Option<Lottery>, StorageError> {
        Self::update_if(&self.lotteries, "lottery", id, guard, mutate)
    }

    fn insert_draw(&self, draw: &Draw) -> Result<(), StorageError> {
        Self::insert_new(&self.draws, "draw", draw.id, draw)
    }

    fn get_draw(&self, id: DrawId) -> Result<Draw, StorageError> {
        Self::get(&self.draws, "draw", id)
    }

    fn list_draws(&self, query: &DrawQuery) -> Result<Vec<Draw>, StorageError> {
        let mut draws: Vec<Draw> = Self::scan::<Draw>(&self.draws)?
            .into_iter()
            .filter(|d| query.matches(d))
            .collect();
        sort_draws(&mut draws);
        Ok(draws)
    }

    fn update_draw_if(
        &self,
        id: DrawId,
        guard: Guard<'_, Draw>,
        mutate: Mutation<'_, Draw>,
    ) -> Result<Option<Draw>, StorageError> {
        Self::update_if(&self.draws, "draw", id, guard, mutate)
    }

    fn insert_ticket(&self, ticket: &Ticket) -> Result<(), StorageError> {
        let bytes = encode(ticket)?;
        let id_key = key(ticket.id);
        let index_key = pair_key(ticket.draw_id, ticket.id);

        let inserted = (&self.tickets, &self.draw_tickets)
            .transaction(|(tickets, index)| -> Result<bool, ConflictableTransactionError<()>> {
                if tickets.get(&id_key[..])?.is_some() {
                    return Ok(false);
                }
                tickets.insert(&id_key[..], bytes.as_slice())?;
                index.insert(&index_key[..], &[] as &[u8])?;
                Ok(true)
            })
            .map_err(tx_error)?;

        if !inserted {
            return Err(StorageError::AlreadyExists { kind: "ticket", id: ticket.id });
        }
        Ok(())
    }

    fn get_ticket(&self, id: TicketId) -> Result<Ticket, StorageError> {
        Self::get(&self.tickets, "ticket", id)
    }

    fn tickets_for_draw(&self, draw_id: DrawId) -> Result<Vec<Ticket>, StorageError> {
        let mut tickets = Vec::new();
        for entry in self.draw_tickets.scan_prefix(key(draw_id)) {
            let (k, _) = entry?;
            let mut id = [0u8; 8];
            id.copy_from_slice(&k[8..16]);
            tickets.push(Self::get(&self.tickets, "ticket", u64::from_be_bytes(id))?);
        }
        Ok(tickets)
    }

    fn update_ticket_if(
        &self,
        id: TicketId,
        guard: Guard<'_, Ticket>,
        mutate: Mutation<'_, Ticket>,
    ) -> Result<Option<Ticket>, StorageError> {
        Self::update_if(&self.tickets, "ticket", id, guard, mutate)
    }

    fn insert_payout_if_absent(&self, payout: &Payout) -> Result<bool, StorageError> {
        let bytes = encode(payout)?;
        let id_key = key(payout.id);
        let ticket_key = key(payout.ticket_id);

        let inserted = (&self.payouts, &self.payout_by_ticket)
            .transaction(|(payouts, index)| -> Result<bool, ConflictableTransactionError<()>> {
                if index.get(&ticket_key[..])?.is_some() || payouts.get(&id_key[..])?.is_some() {
                    return Ok(false);
                }
                index.insert(&ticket_key[..], &id_key[..])?;
                payouts.insert(&id_key[..], bytes.as_slice())?;
                Ok(true)
            })
            .map_err(tx_error)?;
        Ok(inserted)
    }

    fn get_payout(&self, id: PayoutId) -> Result<Payout, StorageError> {
        Self::get(&self.payouts, "payout", id)
    }

    fn payout_for_ticket(&self, ticket_id: TicketId) -> Result<Option<Payout>, StorageError> {
        match self.payout_by_ticket.get(key(ticket_id))? {
            Some(id) => Ok(self.payouts.get(&id)?.map(|v| decode(&v)).transpose()?),
            None => Ok(None),
        }
    }

    fn list_payouts(&self, query: &PayoutQuery) -> Result<Vec<Payout>, StorageError> {
        let mut payouts: Vec<Payout> = Self::scan::<Payout>(&self.payouts)?
            .into_iter()
            .filter(|p| query.matches(p))
            .collect();
        sort_payouts(&mut payouts, query.limit);
        Ok(payouts)
    }

    fn update_payout_if(
        &self,
        id: PayoutId,
        guard: Guard<'_, Payout>,
        mutate: Mutation<'_, Payout>,
    ) -> Result<Option<Payout>, StorageError> {
        Self::update_if(&self.payouts, "payout", id, guard, mutate)
    }

    fn append_ledger(&self, entry: &LedgerEntry) -> Result<(), StorageError> {
        Self::insert_new(&self.ledger, "ledger entry", entry.id, entry)
    }

    fn ledger_for_draw(&self, draw_id: DrawId) -> Result<Vec<LedgerEntry>, StorageError> {
        Ok(Self::scan::<LedgerEntry>(&self.ledger)?
            .into_iter()
            .filter(|e| e.draw_id == draw_id)
            .collect())
    }
}
