//! Webhook ingestion.
//!
//! - [`signature`]: HMAC-SHA256 verification of deliveries
//! - [`gateway`]: the admit boundary that records events and their first job
//! - [`parser`]: typed views of stored payloads, used by workers

pub mod events;
pub mod gateway;
pub mod parser;
pub mod signature;

pub use events::{PrAction, PullRequestEvent};
pub use gateway::{Envelope, Gateway, WebhookError};
pub use parser::{ParseError, parse_event};
pub use signature::{
    compute_signature, format_signature_header, parse_signature_header, verify_signature,
};
