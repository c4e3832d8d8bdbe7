//! Admin Command Gate: command routing, whitelist, export
//! pagination, and the cooldown/telemetry glue tying them together.

pub mod export;
pub mod gate;
pub mod whitelist;

pub use export::{ExportError, ExportSource};
pub use gate::{AdminCommandGate, CommandOutcome, CommandScope};
pub use whitelist::AdminWhitelist;

/// KV key holding the JSON array of broadcast recipient chat ids, shared
/// between the `/broadcast` command (`gate.rs`) and its HTTP CRUD surface
/// (`api::http::admin`).
pub const BROADCAST_RECIPIENTS_KEY: &str = "broadcast_recipients";
