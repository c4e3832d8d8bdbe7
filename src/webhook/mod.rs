//! Webhook Decoder: big-integer-safe parsing and outcome
//! classification for inbound chat-platform updates.

pub mod bigint;
pub mod decoder;

pub use bigint::quote_big_integers;
pub use decoder::{decode, DecodeError, MessageRoute, NonTextKind, WebhookOutcome};
