//! Port contracts: the abstract interfaces the core consumes.
//!
//! Every port is a capability, not an identity — callers hold `Arc<dyn Trait>`
//! and never downcast to a concrete adapter except through the explicit
//! capability traits below (`QueueStats`, `WhitelistInvalidate`), mirroring
//! `LlmProvider::as_any` in the reference backend's provider trait.

pub mod ai;
pub mod messaging;
pub mod noop;
pub mod rate_limit;
pub mod storage;

pub use ai::{Ai, AiError, AiReply, QueueStats, QueueStatsSnapshot};
pub use messaging::{Chat, DispatchError, Messaging};
pub use noop::{NoopAi, NoopMessaging, NoopRateLimit, NoopStorage};
pub use rate_limit::{RateLimit, RateLimitError, RateLimitOutcome};
pub use storage::{SaveUserOutcome, StorageError, StoredMessage, StoredRole, UserProfile};
