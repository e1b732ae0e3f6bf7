//! Core domain types for the payout pipeline.
//!
//! This module contains the identifiers, lifecycle states and persisted records
//! shared by every component.

pub mod ids;
pub mod records;
pub mod status;

pub use ids::{
    BountyId, ContentHash, DedupeKey, DeliveryId, EventId, InvalidSha, JobId, PayoutId, PrNumber,
    ProjectId, RepoId, Sha, SubmissionId, TxRef, UserId,
};
pub use records::{
    Amount, Bounty, Event, INTERNAL_SOURCE, Job, MirroredItem, NewEvent, Payout, Project, Proof,
    Submission,
};
pub use status::{BountyStatus, EventStatus, ItemKind, JobKind, JobStatus, PayoutStatus};
