//! Bounty relay: turns merged pull requests into verified, confirmed
//! on-chain bounty payouts.
//!
//! Webhooks are admitted synchronously into a deduplicated event store
//! ([`webhooks`], [`store`]). Leasing workers ([`bus`]) then classify and
//! verify the merge against GitHub ([`verify`]), pay the linked bounty
//! through a chain adapter ([`payout`]), and mirror project state
//! ([`sync`]). [`server`] exposes the HTTP surface.

pub mod artifact;
pub mod bus;
pub mod config;
pub mod credentials;
pub mod github;
pub mod payout;
pub mod server;
pub mod store;
pub mod sync;
pub mod types;
pub mod verify;
pub mod webhooks;

#[cfg(test)]
pub mod test_utils;
