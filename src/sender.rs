//! Outbound transfers
//!
//! The payout queue only needs two calls from the chain: send and balance.
//! Callers bound `send` with a timeout. An implementation must not treat a
//! dropped future as success.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("transfer rejected: {0}")]
    Rejected(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("transfer timed out after {0}s")]
    Timeout(u64),
}

pub trait TransactionSender: Send + Sync + 'static {
    /// Transfer `amount` to `to`. Returns the transaction hash.
    fn send(&self, to: &str, amount: u64, currency: &str) -> impl Future<Output = Result<String, SendError>> + Send;

    /// Spendable balance of the payout wallet
    fn balance(&self, currency: &str) -> impl Future<Output = Result<u64, SendError>> + Send;
}

/// Logs transfers without touching a chain.
///
/// Hashes are SHA-256 over (sequence, recipient, amount, currency). Not for
/// production wallets.
#[derive(Debug)]
pub struct DryRunSender {
    balances: Mutex<HashMap<String, u64>>,
    sequence: AtomicU64,
}

impl DryRunSender {
    pub fn new(balances: HashMap<String, u64>) -> Self {
        Self {
            balances: Mutex::new(balances),
            sequence: AtomicU64::new(0),
        }
    }
}

impl TransactionSender for DryRunSender {
    async fn send(&self, to: &str, amount: u64, currency: &str) -> Result<String, SendError> {
        {
            let mut balances = self
                .balances
                .lock()
                .map_err(|_| SendError::Unavailable("balance lock poisoned".into()))?;
            let balance = balances.entry(currency.to_string()).or_insert(0);
            if *balance < amount {
                return Err(SendError::Rejected(format!(
                    "insufficient {} balance: {} < {}",
                    currency, balance, amount
                )));
            }
            *balance -= amount;
        }

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut hasher = Sha256::new();
        hasher.update(seq.to_be_bytes());
        hasher.update(to.as_bytes());
        hasher.update(amount.to_be_bytes());
        hasher.update(currency.as_bytes());
        let tx_hash = hex::encode(hasher.finalize());

        info!("[dry-run] sent {} {} to {} (tx {})", amount, currency, to, &tx_hash[..16]);
        Ok(tx_hash)
    }

    async fn balance(&self, currency: &str) -> Result<u64, SendError> {
        let balances = self
            .balances
            .lock()
            .map_err(|_| SendError::Unavailable("balance lock poisoned".into()))?;
        Ok(balances.get(currency).copied().unwrap_or(0))
    }
}
