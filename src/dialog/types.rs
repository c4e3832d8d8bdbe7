//! Transient types owned by the Dialog Engine for the duration of one
//! `handle_message` invocation.

use chrono::{DateTime, Utc};

use crate::ports::messaging::Chat;
use crate::ports::storage::UserProfile;

#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub user: UserProfile,
    pub chat: Chat,
    pub text: String,
    pub message_id: Option<String>,
    pub update_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub text: String,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum HandleOutcome {
    Replied(Response),
    RateLimited,
}
