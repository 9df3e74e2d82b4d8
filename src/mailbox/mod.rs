//! Mailbox store (§4.A) — the core of the relay.

pub mod model;
pub mod snapshot;
pub mod store;

pub use model::{
    new_id, normalize_path, root_platform, validate_path, ControlType, FileRef, Message, Priority,
    RoutingMode, SendRequest, Status, MESSAGE_TTL_HOURS,
};
pub use store::{MailboxEvent, MailboxStore};
