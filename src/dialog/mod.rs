//! Dialog Engine: the request-processing orchestration state
//! machine tying together rate limiting, persistence, the AI Queue, and
//! delivery.

pub mod engine;
pub mod types;

pub use engine::{DialogEngine, DialogError};
pub use types::{HandleOutcome, IncomingMessage, Response};
