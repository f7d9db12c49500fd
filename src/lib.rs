pub mod admin;
pub mod config;
pub mod db;
pub mod engine;
pub mod notify;
pub mod payout;
pub mod prize;
pub mod randomness;
pub mod scheduler;
pub mod seal;
pub mod sender;
pub mod types;

pub use admin::{verify_draw, Admin, AdminError, VerificationReport};
pub use config::{Config, ConfigError, EngineConfig, PayoutConfig, ScheduleConfig, StorageConfig};
pub use db::{DrawQuery, MemoryStorage, PayoutQuery, Repository, SledStorage, StorageError};
pub use engine::{DrawEngine, EngineError, ExecutionSummary};
pub use notify::{ChannelNotifier, DrawEvent, LogNotifier, Notification, Notifier, OperatorAlert};
pub use payout::{DrainReport, PayoutError, PayoutQueue};
pub use prize::{PrizeCalculator, PrizeError, RevenueBreakdown};
pub use randomness::{Seed, generate_seed, generate_winning_numbers, hash_seed, verify_numbers, verify_seed_hash};
pub use scheduler::{PhaseReport, Scheduler};
pub use seal::{SealError, SealedSeed, SeedVault};
pub use sender::{DryRunSender, SendError, TransactionSender};
pub use types::*;
