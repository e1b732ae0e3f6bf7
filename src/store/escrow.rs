//! Bounty escrow and payout rows.
//!
//! Escrow `status` and `locked_amount` only change through the methods in this
//! file, and each of them is a compare-and-set on the current row state. The
//! payout worker is their only caller outside of tests.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;
use tracing::info;

use super::{Result, Store, from_millis, parse_column, to_millis};
use crate::types::{
    Amount, Bounty, BountyId, BountyStatus, JobId, Payout, PayoutId, PayoutStatus, ProjectId,
    SubmissionId, TxRef,
};

/// Escrow state conflicts. None of these are retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EscrowError {
    #[error("bounty {0} not found")]
    BountyNotFound(BountyId),

    #[error("bounty {bounty_id} is {actual}, expected {expected}")]
    InvalidState {
        bounty_id: BountyId,
        actual: BountyStatus,
        expected: BountyStatus,
    },

    #[error("amount must be positive, got {0}")]
    InvalidAmount(Amount),

    #[error("bounty {0} needs a deadline in the future to be locked")]
    InvalidDeadline(BountyId),

    #[error("refund deadline of bounty {0} has not passed")]
    DeadlineNotPassed(BountyId),

    #[error("bounty {0} has a payout in flight")]
    PayoutInFlight(BountyId),
}

/// Fields of a bounty before it is stored. New bounties start `open`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBounty {
    pub bounty_id: BountyId,
    pub project_id: ProjectId,
    pub issue_number: u64,
    pub chain: String,
    pub amount: Amount,
    pub currency: String,
    pub split_rewards: bool,
    pub split_amount: Option<Amount>,
    pub deadline: Option<DateTime<Utc>>,
}

/// Fields of a payout before it is stored. New payouts start `pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayout {
    pub submission_id: SubmissionId,
    pub bounty_id: BountyId,
    pub chain: String,
    pub amount: Amount,
    pub recipient: String,
    pub job_id: JobId,
}

/// Result of [`Store::claim_payout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutClaim {
    /// A new `pending` payout now holds the claim.
    Created(Payout),
    /// An earlier payout already holds the claim; nothing was written.
    Held(Payout),
    /// Payouts still in flight reserve the whole escrow; nothing was written.
    Reserved,
}

/// Result of applying a confirmed transaction to the escrow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The payout is now confirmed and the escrow decremented.
    Confirmed {
        locked_amount: Amount,
        released: bool,
    },
    /// The payout had already been confirmed; nothing changed.
    AlreadyConfirmed,
    /// The escrow could not absorb the payout (not locked, or short of funds).
    /// Nothing changed.
    Rejected { reason: String },
}

const BOUNTY_COLUMNS: &str = "bounty_id, project_id, issue_number, chain, amount, currency, \
     locked_amount, status, split_rewards, split_amount, deadline";

const PAYOUT_COLUMNS: &str = "id, submission_id, bounty_id, chain, amount, recipient, tx_ref, \
     status, job_id, submitted_at, created_at";

fn bounty_from_row(row: &Row<'_>) -> rusqlite::Result<Bounty> {
    let status: String = row.get(7)?;
    Ok(Bounty {
        bounty_id: BountyId(row.get(0)?),
        project_id: ProjectId(row.get(1)?),
        issue_number: row.get(2)?,
        chain: row.get(3)?,
        amount: row.get(4)?,
        currency: row.get(5)?,
        locked_amount: row.get(6)?,
        status: parse_column("bounties", &status, BountyStatus::parse)?,
        split_rewards: row.get(8)?,
        split_amount: row.get(9)?,
        deadline: row.get::<_, Option<i64>>(10)?.map(from_millis),
    })
}

fn payout_from_row(row: &Row<'_>) -> rusqlite::Result<Payout> {
    let status: String = row.get(7)?;
    Ok(Payout {
        id: PayoutId(row.get(0)?),
        submission_id: SubmissionId(row.get(1)?),
        bounty_id: BountyId(row.get(2)?),
        chain: row.get(3)?,
        amount: row.get(4)?,
        recipient: row.get(5)?,
        tx_ref: row.get::<_, Option<String>>(6)?.map(TxRef),
        status: parse_column("payouts", &status, PayoutStatus::parse)?,
        job_id: JobId(row.get(8)?),
        submitted_at: row.get::<_, Option<i64>>(9)?.map(from_millis),
        created_at: from_millis(row.get(10)?),
    })
}

fn insert_payout(
    conn: &Connection,
    new: &NewPayout,
    amount: Amount,
    now: DateTime<Utc>,
) -> rusqlite::Result<PayoutId> {
    conn.execute(
        "INSERT INTO payouts
             (submission_id, bounty_id, chain, amount, recipient, status, job_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            new.submission_id.0,
            new.bounty_id.as_str(),
            new.chain,
            amount,
            new.recipient,
            PayoutStatus::Pending.as_str(),
            new.job_id.0,
            to_millis(now),
        ],
    )?;
    Ok(PayoutId(conn.last_insert_rowid()))
}

impl Store {
    // ─── Bounties ───

    /// Registers a new bounty in the `open` state with nothing locked.
    pub fn create_bounty(&self, new: &NewBounty) -> Result<Bounty> {
        if new.amount <= 0 {
            return Err(EscrowError::InvalidAmount(new.amount).into());
        }
        match new.split_amount {
            Some(split) if split <= 0 => return Err(EscrowError::InvalidAmount(split).into()),
            _ => {}
        }
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO bounties
                     (bounty_id, project_id, issue_number, chain, amount, currency,
                      locked_amount, status, split_rewards, split_amount, deadline)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9, ?10)",
                params![
                    new.bounty_id.as_str(),
                    new.project_id.0,
                    new.issue_number,
                    new.chain,
                    new.amount,
                    new.currency,
                    BountyStatus::Open.as_str(),
                    new.split_rewards,
                    new.split_amount,
                    new.deadline.map(to_millis),
                ],
            )?;
        }
        self.require_bounty(&new.bounty_id)
    }

    pub fn get_bounty(&self, id: &BountyId) -> Result<Option<Bounty>> {
        let conn = self.lock()?;
        let bounty = conn
            .query_row(
                &format!("SELECT {BOUNTY_COLUMNS} FROM bounties WHERE bounty_id = ?1"),
                params![id.as_str()],
                bounty_from_row,
            )
            .optional()?;
        Ok(bounty)
    }

    pub fn require_bounty(&self, id: &BountyId) -> Result<Bounty> {
        self.get_bounty(id)?
            .ok_or_else(|| EscrowError::BountyNotFound(id.clone()).into())
    }

    /// The bounty on `issue_number` that can still be claimed (`open` or
    /// `locked`), if any.
    pub fn claimable_bounty_for_issue(
        &self,
        project_id: ProjectId,
        issue_number: u64,
    ) -> Result<Option<Bounty>> {
        let conn = self.lock()?;
        let bounty = conn
            .query_row(
                &format!(
                    "SELECT {BOUNTY_COLUMNS} FROM bounties
                     WHERE project_id = ?1 AND issue_number = ?2 AND status IN (?3, ?4)
                     ORDER BY bounty_id LIMIT 1"
                ),
                params![
                    project_id.0,
                    issue_number,
                    BountyStatus::Open.as_str(),
                    BountyStatus::Locked.as_str()
                ],
                bounty_from_row,
            )
            .optional()?;
        Ok(bounty)
    }

    /// Funds an open bounty: `open -> locked`, `locked_amount = amount`.
    ///
    /// The bounty must carry a deadline after `now`, since the deadline is
    /// what later allows a refund.
    pub fn lock_bounty(&self, id: &BountyId, now: DateTime<Utc>) -> Result<Bounty> {
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let bounty = tx
                .query_row(
                    &format!("SELECT {BOUNTY_COLUMNS} FROM bounties WHERE bounty_id = ?1"),
                    params![id.as_str()],
                    bounty_from_row,
                )
                .optional()?
                .ok_or_else(|| EscrowError::BountyNotFound(id.clone()))?;

            if bounty.status != BountyStatus::Open {
                return Err(EscrowError::InvalidState {
                    bounty_id: id.clone(),
                    actual: bounty.status,
                    expected: BountyStatus::Open,
                }
                .into());
            }
            if bounty.deadline.is_none_or(|deadline| deadline <= now) {
                return Err(EscrowError::InvalidDeadline(id.clone()).into());
            }

            tx.execute(
                "UPDATE bounties SET status = ?2, locked_amount = amount
                 WHERE bounty_id = ?1 AND status = ?3",
                params![
                    id.as_str(),
                    BountyStatus::Locked.as_str(),
                    BountyStatus::Open.as_str()
                ],
            )?;
            tx.commit()?;
        }
        info!(bounty_id = %id, "Bounty locked");
        self.require_bounty(id)
    }

    /// Withdraws an unfunded bounty: `open -> cancelled`.
    pub fn cancel_bounty(&self, id: &BountyId) -> Result<Bounty> {
        self.transition_bounty(
            id,
            BountyStatus::Open,
            BountyStatus::Cancelled,
            "locked_amount = 0",
        )
    }

    fn transition_bounty(
        &self,
        id: &BountyId,
        from: BountyStatus,
        to: BountyStatus,
        set: &str,
    ) -> Result<Bounty> {
        let updated = {
            let conn = self.lock()?;
            conn.execute(
                &format!(
                    "UPDATE bounties SET status = ?2, {set} WHERE bounty_id = ?1 AND status = ?3"
                ),
                params![id.as_str(), to.as_str(), from.as_str()],
            )?
        };
        let bounty = self.require_bounty(id)?;
        if updated == 0 {
            return Err(EscrowError::InvalidState {
                bounty_id: id.clone(),
                actual: bounty.status,
                expected: from,
            }
            .into());
        }
        info!(bounty_id = %id, from = %from, to = %to, "Bounty transitioned");
        Ok(bounty)
    }

    /// Returns the remaining escrow of a locked bounty to its funder.
    ///
    /// Allowed only after the deadline, and only while no payout is pending
    /// or submitted; `locked -> refunded` and `locked_amount = 0` commit together.
    pub fn refund_bounty(&self, id: &BountyId, now: DateTime<Utc>) -> Result<Bounty> {
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let bounty = tx
                .query_row(
                    &format!("SELECT {BOUNTY_COLUMNS} FROM bounties WHERE bounty_id = ?1"),
                    params![id.as_str()],
                    bounty_from_row,
                )
                .optional()?
                .ok_or_else(|| EscrowError::BountyNotFound(id.clone()))?;

            if bounty.status != BountyStatus::Locked {
                return Err(EscrowError::InvalidState {
                    bounty_id: id.clone(),
                    actual: bounty.status,
                    expected: BountyStatus::Locked,
                }
                .into());
            }
            match bounty.deadline {
                Some(deadline) if deadline <= now => {}
                _ => return Err(EscrowError::DeadlineNotPassed(id.clone()).into()),
            }

            let in_flight: i64 = tx.query_row(
                "SELECT COUNT(*) FROM payouts WHERE bounty_id = ?1 AND status IN (?2, ?3)",
                params![
                    id.as_str(),
                    PayoutStatus::Pending.as_str(),
                    PayoutStatus::Submitted.as_str()
                ],
                |row| row.get(0),
            )?;
            if in_flight > 0 {
                return Err(EscrowError::PayoutInFlight(id.clone()).into());
            }

            tx.execute(
                "UPDATE bounties SET status = ?2, locked_amount = 0
                 WHERE bounty_id = ?1 AND status = ?3",
                params![
                    id.as_str(),
                    BountyStatus::Refunded.as_str(),
                    BountyStatus::Locked.as_str()
                ],
            )?;
            tx.commit()?;
        }
        info!(bounty_id = %id, "Bounty refunded");
        self.require_bounty(id)
    }

    // ─── Payouts ───

    /// Creates a `pending` payout unless its claim on the escrow is already
    /// held.
    ///
    /// The claim is the whole bounty, or only the submission's share when the
    /// bounty splits rewards. A pending, submitted or confirmed payout holds
    /// it. The new payout's amount is capped by what in-flight payouts leave
    /// of the escrow. The check and the insert are one transaction, so
    /// concurrent claims on one bounty create at most one payout.
    pub fn claim_payout(&self, new: &NewPayout, now: DateTime<Utc>) -> Result<PayoutClaim> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let bounty = tx
            .query_row(
                &format!("SELECT {BOUNTY_COLUMNS} FROM bounties WHERE bounty_id = ?1"),
                params![new.bounty_id.as_str()],
                bounty_from_row,
            )
            .optional()?
            .ok_or_else(|| EscrowError::BountyNotFound(new.bounty_id.clone()))?;
        if bounty.status != BountyStatus::Locked {
            return Err(EscrowError::InvalidState {
                bounty_id: bounty.bounty_id,
                actual: bounty.status,
                expected: BountyStatus::Locked,
            }
            .into());
        }

        let holder = tx
            .query_row(
                &format!(
                    "SELECT {PAYOUT_COLUMNS} FROM payouts
                     WHERE bounty_id = ?1 AND status IN (?2, ?3, ?4)
                       AND (?5 = 0 OR submission_id = ?6)
                     ORDER BY id LIMIT 1"
                ),
                params![
                    new.bounty_id.as_str(),
                    PayoutStatus::Pending.as_str(),
                    PayoutStatus::Submitted.as_str(),
                    PayoutStatus::Confirmed.as_str(),
                    bounty.split_rewards,
                    new.submission_id.0,
                ],
                payout_from_row,
            )
            .optional()?;
        if let Some(holder) = holder {
            return Ok(PayoutClaim::Held(holder));
        }

        let reserved: Amount = tx.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM payouts
             WHERE bounty_id = ?1 AND status IN (?2, ?3)",
            params![
                new.bounty_id.as_str(),
                PayoutStatus::Pending.as_str(),
                PayoutStatus::Submitted.as_str()
            ],
            |row| row.get(0),
        )?;
        let amount = new.amount.min(bounty.locked_amount - reserved);
        if amount <= 0 {
            return Ok(PayoutClaim::Reserved);
        }

        let id = insert_payout(&tx, new, amount, now)?;
        let payout = tx.query_row(
            &format!("SELECT {PAYOUT_COLUMNS} FROM payouts WHERE id = ?1"),
            params![id.0],
            payout_from_row,
        )?;
        tx.commit()?;
        Ok(PayoutClaim::Created(payout))
    }

    pub fn get_payout(&self, id: PayoutId) -> Result<Option<Payout>> {
        let conn = self.lock()?;
        let payout = conn
            .query_row(
                &format!("SELECT {PAYOUT_COLUMNS} FROM payouts WHERE id = ?1"),
                params![id.0],
                payout_from_row,
            )
            .optional()?;
        Ok(payout)
    }

    /// Payouts for a bounty, oldest first.
    pub fn payouts_for_bounty(&self, bounty_id: &BountyId) -> Result<Vec<Payout>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts WHERE bounty_id = ?1 ORDER BY id"
        ))?;
        let payouts = stmt
            .query_map(params![bounty_id.as_str()], payout_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(payouts)
    }

    /// Records that a transaction for a pending payout was accepted by the chain.
    pub fn mark_payout_submitted(
        &self,
        id: PayoutId,
        tx_ref: &TxRef,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE payouts SET status = ?2, tx_ref = ?3, submitted_at = ?4
             WHERE id = ?1 AND status = ?5",
            params![
                id.0,
                PayoutStatus::Submitted.as_str(),
                tx_ref.as_str(),
                to_millis(now),
                PayoutStatus::Pending.as_str()
            ],
        )?;
        Ok(updated == 1)
    }

    /// Compare-and-set of a payout's status that leaves its transaction alone.
    pub fn transition_payout(
        &self,
        id: PayoutId,
        from: PayoutStatus,
        to: PayoutStatus,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE payouts SET status = ?2 WHERE id = ?1 AND status = ?3",
            params![id.0, to.as_str(), from.as_str()],
        )?;
        Ok(updated == 1)
    }

    /// Applies a confirmed transaction: payout `confirmed`, escrow decremented
    /// by the payout amount, bounty `released` once nothing is left locked.
    ///
    /// Both rows change in one transaction or neither does.
    pub fn finalize_payout(&self, id: PayoutId) -> Result<FinalizeOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let payout = tx.query_row(
            &format!("SELECT {PAYOUT_COLUMNS} FROM payouts WHERE id = ?1"),
            params![id.0],
            payout_from_row,
        )?;
        if payout.status == PayoutStatus::Confirmed {
            return Ok(FinalizeOutcome::AlreadyConfirmed);
        }

        let bounty = tx.query_row(
            &format!("SELECT {BOUNTY_COLUMNS} FROM bounties WHERE bounty_id = ?1"),
            params![payout.bounty_id.as_str()],
            bounty_from_row,
        )?;
        if !bounty.split_rewards {
            let confirmed: i64 = tx.query_row(
                "SELECT COUNT(*) FROM payouts WHERE bounty_id = ?1 AND status = ?2",
                params![bounty.bounty_id.as_str(), PayoutStatus::Confirmed.as_str()],
                |row| row.get(0),
            )?;
            if confirmed > 0 {
                return Ok(FinalizeOutcome::Rejected {
                    reason: format!("bounty {} already has a confirmed payout", bounty.bounty_id),
                });
            }
        }

        let confirmed = tx.execute(
            "UPDATE payouts SET status = ?2 WHERE id = ?1 AND status IN (?3, ?4)",
            params![
                id.0,
                PayoutStatus::Confirmed.as_str(),
                PayoutStatus::Submitted.as_str(),
                PayoutStatus::Failed.as_str()
            ],
        )?;
        let decremented = tx.execute(
            "UPDATE bounties
             SET locked_amount = locked_amount - ?2,
                 status = CASE WHEN locked_amount - ?2 = 0 THEN ?3 ELSE status END
             WHERE bounty_id = ?1 AND status = ?4 AND locked_amount >= ?2",
            params![
                payout.bounty_id.as_str(),
                payout.amount,
                BountyStatus::Released.as_str(),
                BountyStatus::Locked.as_str()
            ],
        )?;
        if confirmed == 0 || decremented == 0 {
            return Ok(FinalizeOutcome::Rejected {
                reason: format!(
                    "bounty {} cannot absorb payout {} of {} (status {}, locked {})",
                    bounty.bounty_id, id, payout.amount, bounty.status, bounty.locked_amount
                ),
            });
        }

        let (locked_amount, status): (Amount, String) = tx.query_row(
            "SELECT locked_amount, status FROM bounties WHERE bounty_id = ?1",
            params![payout.bounty_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        tx.commit()?;

        let released = status == BountyStatus::Released.as_str();
        info!(
            payout_id = %id,
            bounty_id = %payout.bounty_id,
            amount = payout.amount,
            locked_amount,
            released,
            "Payout finalized"
        );
        Ok(FinalizeOutcome::Confirmed {
            locked_amount,
            released,
        })
    }

    /// Sum of confirmed payout amounts for a bounty.
    pub fn confirmed_total(&self, bounty_id: &BountyId) -> Result<Amount> {
        let conn = self.lock()?;
        let total: Amount = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM payouts WHERE bounty_id = ?1 AND status = ?2",
            params![bounty_id.as_str(), PayoutStatus::Confirmed.as_str()],
            |row| row.get(0),
        )?;
        Ok(total)
    }
}
