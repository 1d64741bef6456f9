//! # Cadence Scheduler
//!
//! Delayed-action scheduling and message coalescing for conversational
//! follow-up work. Owns timing, batching, and the persisted lifecycle of
//! scheduled work items — what a follow-up says, and how it is delivered,
//! belong to the caller-supplied callbacks.
//!
//! ## Guarantees
//! - Deferred actions execute exactly-once-in-practice across restarts and
//!   across any number of concurrent worker instances; the store's atomic
//!   claim is the only coordination.
//! - Bursts of messages for one conversation flush as a single ordered
//!   batch after a jittered quiet period, bounded by size and max-wait
//!   safety limits.
//!
//! ## Architecture
//! ```text
//! inbound messages ──▶ MessageCoalescer ──(flush, ordered batch)──▶ decision logic
//!                                                                        │
//!                                                         ActionStore.create(...)
//!                                                                        ▼
//!                                     SQLite: scheduled_actions (pending/claimed/...)
//!                                                                        ▲
//! PollingWorker(s) ── claim_due / mark_executed ────────────────────────┘
//!        │
//!        └──(execute callback)──▶ side effect (e.g. send the follow-up)
//!
//! Scheduler = stale-claim recovery + worker lifecycle + health
//! ```

pub mod action;
pub mod coalescer;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use action::{ActionKind, ActionStatus, ScheduledAction};
pub use coalescer::{BufferedMessage, FlushCallback, MessageCoalescer};
pub use scheduler::{Health, Scheduler};
pub use store::ActionStore;
pub use worker::{ExecuteCallback, PollingWorker, StatsSnapshot, WorkerStats};
