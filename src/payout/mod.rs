//! Payout worker and escrow operations.
//!
//! A `payout` job is created once per verified submission. It drives one
//! payout row through `pending -> submitted -> confirmed | failed`, using the
//! job's lease, deferral and retry budget as the polling loop:
//!
//! - a `pending` payout without a transaction is submitted, keyed by its id so
//!   a resubmission after a crash cannot send funds twice;
//! - a `submitted` payout is polled until the chain reports finality or the
//!   confirmation timeout passes;
//! - a `failed` payout is re-confirmed before anything new is sent, and is
//!   only replaced by a fresh payout once its transaction has expired.
//!
//! The escrow decrement happens in [`Store::finalize_payout`], atomically with
//! the payout becoming `confirmed`.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::bus::{JobHandler, JobOutcome};
use crate::config::ConfirmSettings;
use crate::store::{self, EscrowError, FinalizeOutcome, NewPayout, PayoutClaim, Store, StoreError};
use crate::types::{
    Bounty, BountyId, BountyStatus, Job, JobKind, Payout, PayoutStatus, Submission, SubmissionId,
};

pub mod chain;
pub mod relayer;

pub use chain::{ChainAdapter, ChainError, ConfirmStatus, Transfer};
pub use relayer::HttpRelayerAdapter;

pub const BOUNTY_NOT_PAYABLE: &str = "bounty_not_payable";
pub const RECIPIENT_WALLET_MISSING: &str = "recipient_wallet_missing";

impl From<ChainError> for JobOutcome {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Unavailable {
                message,
                retry_after,
            } => JobOutcome::Retry {
                error: message,
                retry_after,
            },
            other => JobOutcome::failed(other.to_string()),
        }
    }
}

// ─── Escrow operations ───

/// Funds an open bounty so it can be paid out. Its deadline must lie after
/// `now`.
pub fn lock_bounty(store: &Store, id: &BountyId, now: DateTime<Utc>) -> store::Result<Bounty> {
    store.lock_bounty(id, now)
}

/// Returns a locked bounty's escrow after its deadline, provided no payout
/// is in flight.
pub fn refund_bounty(store: &Store, id: &BountyId, now: DateTime<Utc>) -> store::Result<Bounty> {
    store.refund_bounty(id, now)
}

// ─── Worker ───

pub struct PayoutHandler<C> {
    store: Store,
    chain: Arc<C>,
    confirm: ConfirmSettings,
}

impl<C: ChainAdapter> PayoutHandler<C> {
    pub fn new(store: Store, chain: Arc<C>, confirm: ConfirmSettings) -> Self {
        PayoutHandler {
            store,
            chain,
            confirm,
        }
    }

    fn load_submission(&self, job: &Job) -> Result<Submission, JobOutcome> {
        let event = self.store.require_event(job.event_id)?;
        let id = event
            .payload
            .get("submission_id")
            .and_then(Value::as_i64)
            .map(SubmissionId)
            .ok_or_else(|| JobOutcome::failed("verified_submission event has no submission_id"))?;
        Ok(self.store.require_submission(id)?)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, event_id = %job.event_id))]
    async fn pay(&self, job: &Job) -> Result<JobOutcome, JobOutcome> {
        let submission = self.load_submission(job)?;
        let bounty = self.store.require_bounty(&submission.bounty_id)?;

        // Payouts that count against this submission's claim on the escrow.
        let payouts: Vec<Payout> = self
            .store
            .payouts_for_bounty(&bounty.bounty_id)?
            .into_iter()
            .filter(|p| !bounty.split_rewards || p.submission_id == submission.id)
            .collect();

        if let Some(paid) = payouts.iter().find(|p| {
            p.status == PayoutStatus::Confirmed && p.submission_id == submission.id
        }) {
            info!(payout_id = %paid.id, "Submission already paid");
            return Ok(JobOutcome::done());
        }
        if bounty.status != BountyStatus::Locked {
            warn!(bounty_id = %bounty.bounty_id, status = %bounty.status, "Bounty is not payable");
            return Err(JobOutcome::failed(BOUNTY_NOT_PAYABLE));
        }
        if let Some(other) = payouts.iter().find(|p| {
            p.job_id != job.id
                && matches!(
                    p.status,
                    PayoutStatus::Pending | PayoutStatus::Submitted | PayoutStatus::Confirmed
                )
        }) {
            info!(
                payout_id = %other.id,
                status = %other.status,
                bounty_id = %bounty.bounty_id,
                "Bounty claim already satisfied by another payout"
            );
            return Ok(JobOutcome::done());
        }

        let Some(current) = payouts.into_iter().rev().find(|p| p.job_id == job.id) else {
            return self.start(job, &submission, &bounty).await;
        };
        match current.status {
            PayoutStatus::Confirmed => Ok(JobOutcome::done()),
            PayoutStatus::Pending => self.submit(&current, &bounty).await,
            PayoutStatus::Submitted => self.poll(&current).await,
            PayoutStatus::Failed => self.recheck(job, &submission, &bounty, &current).await,
        }
    }

    /// Creates a fresh payout for the submission and submits it.
    async fn start(
        &self,
        job: &Job,
        submission: &Submission,
        bounty: &Bounty,
    ) -> Result<JobOutcome, JobOutcome> {
        let recipient = self
            .store
            .wallet(&submission.author_identity, &bounty.chain)?
            .ok_or_else(|| JobOutcome::failed(RECIPIENT_WALLET_MISSING))?;
        let amount = bounty.payout_amount();
        if amount <= 0 {
            return Err(JobOutcome::failed(BOUNTY_NOT_PAYABLE));
        }

        let claim = self
            .store
            .claim_payout(
                &NewPayout {
                    submission_id: submission.id,
                    bounty_id: bounty.bounty_id.clone(),
                    chain: bounty.chain.clone(),
                    amount,
                    recipient,
                    job_id: job.id,
                },
                Utc::now(),
            )
            .map_err(|e| match e {
                StoreError::Escrow(EscrowError::InvalidState { .. }) => {
                    JobOutcome::failed(BOUNTY_NOT_PAYABLE)
                }
                other => other.into(),
            })?;

        match claim {
            PayoutClaim::Created(payout) => {
                info!(
                    payout_id = %payout.id,
                    bounty_id = %bounty.bounty_id,
                    amount = payout.amount,
                    "Payout created"
                );
                self.submit(&payout, bounty).await
            }
            PayoutClaim::Held(other) => {
                info!(
                    payout_id = %other.id,
                    status = %other.status,
                    bounty_id = %bounty.bounty_id,
                    "Bounty claim already satisfied by another payout"
                );
                Ok(JobOutcome::done())
            }
            PayoutClaim::Reserved => Err(JobOutcome::retry(format!(
                "escrow of bounty {} is reserved by payouts in flight",
                bounty.bounty_id
            ))),
        }
    }

    async fn submit(&self, payout: &Payout, bounty: &Bounty) -> Result<JobOutcome, JobOutcome> {
        let transfer = Transfer {
            idempotency_key: Transfer::idempotency_key_for(payout.id),
            chain: payout.chain.clone(),
            recipient: payout.recipient.clone(),
            amount: payout.amount,
            currency: bounty.currency.clone(),
            bounty_id: payout.bounty_id.clone(),
        };

        let tx = match self.chain.submit(&transfer).await {
            Ok(tx) => tx,
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                warn!(payout_id = %payout.id, error = %e, "Transfer rejected");
                self.store
                    .transition_payout(payout.id, PayoutStatus::Pending, PayoutStatus::Failed)?;
                return Err(e.into());
            }
        };

        if !self.store.mark_payout_submitted(payout.id, &tx, Utc::now())? {
            return Err(JobOutcome::retry(format!(
                "payout {} changed state during submission",
                payout.id
            )));
        }
        info!(payout_id = %payout.id, tx = %tx, "Transaction submitted");

        let submitted = self
            .store
            .get_payout(payout.id)?
            .ok_or_else(|| JobOutcome::retry(format!("payout {} vanished", payout.id)))?;
        self.poll(&submitted).await
    }

    fn expired(&self, payout: &Payout, now: DateTime<Utc>) -> bool {
        let Some(submitted_at) = payout.submitted_at else {
            return true;
        };
        TimeDelta::from_std(self.confirm.timeout)
            .ok()
            .is_some_and(|timeout| now - submitted_at >= timeout)
    }

    /// Checks a submitted transaction once.
    async fn poll(&self, payout: &Payout) -> Result<JobOutcome, JobOutcome> {
        let Some(tx) = &payout.tx_ref else {
            return Err(JobOutcome::failed(format!(
                "payout {} is submitted without a transaction",
                payout.id
            )));
        };

        match self.chain.confirm(&payout.chain, tx).await? {
            ConfirmStatus::Confirmed => self.finalize(payout),
            ConfirmStatus::Pending if !self.expired(payout, Utc::now()) => Ok(JobOutcome::Deferred {
                after: self.confirm.poll_interval,
            }),
            ConfirmStatus::Pending => {
                self.store.transition_payout(
                    payout.id,
                    PayoutStatus::Submitted,
                    PayoutStatus::Failed,
                )?;
                warn!(payout_id = %payout.id, tx = %tx, "Transaction unconfirmed past timeout");
                Err(JobOutcome::retry(format!("transaction {tx} expired unconfirmed")))
            }
            ConfirmStatus::Failed => {
                self.store.transition_payout(
                    payout.id,
                    PayoutStatus::Submitted,
                    PayoutStatus::Failed,
                )?;
                warn!(payout_id = %payout.id, tx = %tx, "Transaction failed");
                Err(JobOutcome::retry(format!("transaction {tx} failed")))
            }
        }
    }

    /// Revisits a failed payout. Its transaction is confirmed again before
    /// anything new is sent; only an expired transaction is replaced.
    async fn recheck(
        &self,
        job: &Job,
        submission: &Submission,
        bounty: &Bounty,
        payout: &Payout,
    ) -> Result<JobOutcome, JobOutcome> {
        let Some(tx) = &payout.tx_ref else {
            return self.start(job, submission, bounty).await;
        };

        let status = self.chain.confirm(&payout.chain, tx).await?;
        let expired = self.expired(payout, Utc::now());
        match status {
            ConfirmStatus::Confirmed => self.finalize(payout),
            ConfirmStatus::Pending if !expired => {
                self.store.transition_payout(
                    payout.id,
                    PayoutStatus::Failed,
                    PayoutStatus::Submitted,
                )?;
                Ok(JobOutcome::Deferred {
                    after: self.confirm.poll_interval,
                })
            }
            ConfirmStatus::Failed if !expired => Err(JobOutcome::retry(format!(
                "transaction {tx} still reported failed"
            ))),
            _ => {
                info!(
                    payout_id = %payout.id,
                    tx = %tx,
                    "Prior transaction expired, paying out again"
                );
                self.start(job, submission, bounty).await
            }
        }
    }

    fn finalize(&self, payout: &Payout) -> Result<JobOutcome, JobOutcome> {
        match self.store.finalize_payout(payout.id)? {
            FinalizeOutcome::Confirmed {
                locked_amount,
                released,
            } => {
                info!(
                    payout_id = %payout.id,
                    bounty_id = %payout.bounty_id,
                    locked_amount,
                    released,
                    "Payout confirmed"
                );
                Ok(JobOutcome::done())
            }
            FinalizeOutcome::AlreadyConfirmed => Ok(JobOutcome::done()),
            FinalizeOutcome::Rejected { reason } => {
                warn!(payout_id = %payout.id, %reason, "Escrow refused confirmed payout");
                Err(JobOutcome::failed(reason))
            }
        }
    }
}

impl<C: ChainAdapter> JobHandler for PayoutHandler<C> {
    fn kind(&self) -> JobKind {
        JobKind::Payout
    }

    async fn handle(&self, job: &Job) -> JobOutcome {
        self.pay(job).await.unwrap_or_else(|outcome| outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewBounty;
    use crate::test_utils::{
        ScriptedChain, seed_locked_bounty, seed_payout_job, seed_project, seed_submission,
    };
    use crate::types::JobId;
    use std::time::Duration;

    fn settings(timeout: Duration) -> ConfirmSettings {
        ConfirmSettings {
            poll_interval: Duration::ZERO,
            timeout,
        }
    }

    fn handler(
        store: &Store,
        chain: &Arc<ScriptedChain>,
        timeout: Duration,
    ) -> PayoutHandler<ScriptedChain> {
        PayoutHandler::new(store.clone(), Arc::clone(chain), settings(timeout))
    }

    fn paid_job(store: &Store, bounty: &str, pr: u64) -> JobId {
        let submission = seed_submission(store, bounty, pr);
        store.set_wallet("alice", "stellar", "GALICE").unwrap();
        seed_payout_job(store, submission.id)
    }

    async fn run(handler: &PayoutHandler<ScriptedChain>, store: &Store, job: JobId) -> JobOutcome {
        let job = store.get_job(job).unwrap().unwrap();
        handler.handle(&job).await
    }

    fn bounty(store: &Store) -> Bounty {
        store.require_bounty(&BountyId::new("B1")).unwrap()
    }

    #[tokio::test]
    async fn confirmed_transfer_releases_bounty() {
        let store = Store::in_memory().unwrap();
        seed_locked_bounty(&store, "B1", 100);
        let job = paid_job(&store, "B1", 42);
        let chain = Arc::new(ScriptedChain::new());
        let handler = handler(&store, &chain, Duration::from_secs(600));

        assert_eq!(run(&handler, &store, job).await, JobOutcome::done());

        let bounty = bounty(&store);
        assert_eq!(bounty.status, BountyStatus::Released);
        assert_eq!(bounty.locked_amount, 0);
        let submitted = chain.submissions();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].recipient, "GALICE");
        assert_eq!(submitted[0].amount, 100);
        assert_eq!(submitted[0].currency, "USDC");
    }

    #[tokio::test]
    async fn rerun_after_confirmation_does_not_pay_twice() {
        let store = Store::in_memory().unwrap();
        seed_locked_bounty(&store, "B1", 100);
        let job = paid_job(&store, "B1", 42);
        let chain = Arc::new(ScriptedChain::new());
        let handler = handler(&store, &chain, Duration::from_secs(600));

        run(&handler, &store, job).await;
        assert_eq!(run(&handler, &store, job).await, JobOutcome::done());
        assert_eq!(chain.transactions(), 1);
        assert_eq!(store.confirmed_total(&BountyId::new("B1")).unwrap(), 100);
    }

    #[tokio::test]
    async fn pending_transaction_defers_without_resubmitting() {
        let store = Store::in_memory().unwrap();
        seed_locked_bounty(&store, "B1", 100);
        let job = paid_job(&store, "B1", 42);
        let chain = Arc::new(ScriptedChain::with_confirms([
            ConfirmStatus::Pending,
            ConfirmStatus::Pending,
        ]));
        let handler = handler(&store, &chain, Duration::from_secs(600));

        for _ in 0..2 {
            assert!(matches!(
                run(&handler, &store, job).await,
                JobOutcome::Deferred { .. }
            ));
            let payouts = store.payouts_for_bounty(&BountyId::new("B1")).unwrap();
            assert_eq!(payouts.len(), 1);
            assert_eq!(payouts[0].status, PayoutStatus::Submitted);
            assert_eq!(bounty(&store).locked_amount, 100);
        }

        assert_eq!(run(&handler, &store, job).await, JobOutcome::done());
        assert_eq!(chain.transactions(), 1);
    }

    #[tokio::test]
    async fn failed_report_within_timeout_is_rechecked_not_resent() {
        let store = Store::in_memory().unwrap();
        seed_locked_bounty(&store, "B1", 100);
        let job = paid_job(&store, "B1", 42);
        let chain = Arc::new(ScriptedChain::with_confirms([
            ConfirmStatus::Failed,
            ConfirmStatus::Failed,
            ConfirmStatus::Confirmed,
        ]));
        let handler = handler(&store, &chain, Duration::from_secs(600));

        assert!(matches!(run(&handler, &store, job).await, JobOutcome::Retry { .. }));
        let payouts = store.payouts_for_bounty(&BountyId::new("B1")).unwrap();
        assert_eq!(payouts[0].status, PayoutStatus::Failed);

        assert!(matches!(run(&handler, &store, job).await, JobOutcome::Retry { .. }));
        assert_eq!(run(&handler, &store, job).await, JobOutcome::done());

        assert_eq!(chain.transactions(), 1);
        let payouts = store.payouts_for_bounty(&BountyId::new("B1")).unwrap();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].status, PayoutStatus::Confirmed);
    }

    #[tokio::test]
    async fn expired_transaction_is_replaced_by_new_payout() {
        let store = Store::in_memory().unwrap();
        seed_locked_bounty(&store, "B1", 100);
        let job = paid_job(&store, "B1", 42);
        let chain = Arc::new(ScriptedChain::with_confirms([
            ConfirmStatus::Failed,
            ConfirmStatus::Failed,
            ConfirmStatus::Confirmed,
        ]));
        let handler = handler(&store, &chain, Duration::ZERO);

        assert!(matches!(run(&handler, &store, job).await, JobOutcome::Retry { .. }));
        assert_eq!(run(&handler, &store, job).await, JobOutcome::done());

        assert_eq!(chain.transactions(), 2);
        let payouts = store.payouts_for_bounty(&BountyId::new("B1")).unwrap();
        let statuses: Vec<_> = payouts.iter().map(|p| p.status).collect();
        assert_eq!(statuses, vec![PayoutStatus::Failed, PayoutStatus::Confirmed]);
        assert_eq!(store.confirmed_total(&BountyId::new("B1")).unwrap(), 100);
    }

    #[tokio::test]
    async fn transient_submit_error_resubmits_same_payout() {
        let store = Store::in_memory().unwrap();
        seed_locked_bounty(&store, "B1", 100);
        let job = paid_job(&store, "B1", 42);
        let chain = Arc::new(ScriptedChain::new());
        chain.fail_next_submit(ChainError::unavailable("relayer down"));
        let handler = handler(&store, &chain, Duration::from_secs(600));

        assert!(matches!(run(&handler, &store, job).await, JobOutcome::Retry { .. }));
        let payouts = store.payouts_for_bounty(&BountyId::new("B1")).unwrap();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].status, PayoutStatus::Pending);
        assert!(payouts[0].tx_ref.is_none());

        assert_eq!(run(&handler, &store, job).await, JobOutcome::done());
        let keys: Vec<_> = chain
            .submissions()
            .into_iter()
            .map(|t| t.idempotency_key)
            .collect();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0], Transfer::idempotency_key_for(payouts[0].id));
    }

    #[tokio::test]
    async fn rejected_transfer_fails_job() {
        let store = Store::in_memory().unwrap();
        seed_locked_bounty(&store, "B1", 100);
        let job = paid_job(&store, "B1", 42);
        let chain = Arc::new(ScriptedChain::new());
        chain.fail_next_submit(ChainError::Rejected("bad address".into()));
        let handler = handler(&store, &chain, Duration::from_secs(600));

        assert!(matches!(run(&handler, &store, job).await, JobOutcome::Failed { .. }));
        let payouts = store.payouts_for_bounty(&BountyId::new("B1")).unwrap();
        assert_eq!(payouts[0].status, PayoutStatus::Failed);
        assert_eq!(bounty(&store).locked_amount, 100);
    }

    #[tokio::test]
    async fn missing_wallet_fails_without_submitting() {
        let store = Store::in_memory().unwrap();
        seed_locked_bounty(&store, "B1", 100);
        let submission = seed_submission(&store, "B1", 42);
        let job = seed_payout_job(&store, submission.id);
        let chain = Arc::new(ScriptedChain::new());
        let handler = handler(&store, &chain, Duration::from_secs(600));

        assert_eq!(
            run(&handler, &store, job).await,
            JobOutcome::failed(RECIPIENT_WALLET_MISSING)
        );
        assert!(chain.submissions().is_empty());
    }

    #[tokio::test]
    async fn unlocked_bounty_is_not_payable() {
        let store = Store::in_memory().unwrap();
        let project = seed_project(&store, "acme/widgets");
        store
            .create_bounty(&NewBounty {
                bounty_id: BountyId::new("B1"),
                project_id: project,
                issue_number: 7,
                chain: "stellar".to_string(),
                amount: 100,
                currency: "USDC".to_string(),
                split_rewards: false,
                split_amount: None,
                deadline: None,
            })
            .unwrap();
        let job = paid_job(&store, "B1", 42);
        let chain = Arc::new(ScriptedChain::new());
        let handler = handler(&store, &chain, Duration::from_secs(600));

        assert_eq!(
            run(&handler, &store, job).await,
            JobOutcome::failed(BOUNTY_NOT_PAYABLE)
        );
        assert!(chain.submissions().is_empty());
    }

    #[tokio::test]
    async fn second_submission_cannot_claim_released_bounty() {
        let store = Store::in_memory().unwrap();
        seed_locked_bounty(&store, "B1", 100);
        let first = paid_job(&store, "B1", 42);
        let second = paid_job(&store, "B1", 43);
        let chain = Arc::new(ScriptedChain::new());
        let handler = handler(&store, &chain, Duration::from_secs(600));

        assert_eq!(run(&handler, &store, first).await, JobOutcome::done());
        assert_eq!(
            run(&handler, &store, second).await,
            JobOutcome::failed(BOUNTY_NOT_PAYABLE)
        );
        assert_eq!(chain.transactions(), 1);
    }

    #[tokio::test]
    async fn in_flight_payout_satisfies_competing_claim() {
        let store = Store::in_memory().unwrap();
        seed_locked_bounty(&store, "B1", 100);
        let first = paid_job(&store, "B1", 42);
        let second = paid_job(&store, "B1", 43);
        let chain = Arc::new(ScriptedChain::with_confirms([ConfirmStatus::Pending]));
        let handler = handler(&store, &chain, Duration::from_secs(600));

        assert!(matches!(
            run(&handler, &store, first).await,
            JobOutcome::Deferred { .. }
        ));
        assert_eq!(run(&handler, &store, second).await, JobOutcome::done());
        assert_eq!(chain.transactions(), 1);
    }

    #[test]
    fn concurrent_claims_on_one_bounty_send_one_transfer() {
        use std::sync::Barrier;

        for _ in 0..20 {
            let store = Store::in_memory().unwrap();
            seed_locked_bounty(&store, "B1", 100);
            let jobs = [paid_job(&store, "B1", 42), paid_job(&store, "B1", 43)];
            let chain = Arc::new(ScriptedChain::new());
            let handler = Arc::new(handler(&store, &chain, Duration::from_secs(600)));
            let barrier = Arc::new(Barrier::new(jobs.len()));

            let threads: Vec<_> = jobs
                .into_iter()
                .map(|job| {
                    let job = store.get_job(job).unwrap().unwrap();
                    let handler = Arc::clone(&handler);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        let runtime = tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                            .unwrap();
                        barrier.wait();
                        runtime.block_on(handler.handle(&job))
                    })
                })
                .collect();
            // The loser either finds the claim held or the bounty released.
            let outcomes: Vec<JobOutcome> =
                threads.into_iter().map(|t| t.join().unwrap()).collect();
            assert!(outcomes.contains(&JobOutcome::done()));
            for outcome in &outcomes {
                assert!(
                    *outcome == JobOutcome::done()
                        || *outcome == JobOutcome::failed(BOUNTY_NOT_PAYABLE),
                    "unexpected outcome {outcome:?}"
                );
            }

            assert_eq!(chain.transactions(), 1);
            assert_eq!(store.payouts_for_bounty(&BountyId::new("B1")).unwrap().len(), 1);
            assert_eq!(store.confirmed_total(&BountyId::new("B1")).unwrap(), 100);
        }
    }

    #[tokio::test]
    async fn split_bounty_pays_each_submission() {
        let store = Store::in_memory().unwrap();
        let project = seed_project(&store, "acme/widgets");
        store
            .create_bounty(&NewBounty {
                bounty_id: BountyId::new("B1"),
                project_id: project,
                issue_number: 7,
                chain: "stellar".to_string(),
                amount: 50,
                currency: "USDC".to_string(),
                split_rewards: true,
                split_amount: Some(30),
                deadline: Some(Utc::now() + chrono::Duration::days(30)),
            })
            .unwrap();
        lock_bounty(&store, &BountyId::new("B1"), Utc::now()).unwrap();
        let first = paid_job(&store, "B1", 42);
        let second = paid_job(&store, "B1", 43);
        let chain = Arc::new(ScriptedChain::new());
        let handler = handler(&store, &chain, Duration::from_secs(600));

        assert_eq!(run(&handler, &store, first).await, JobOutcome::done());
        assert_eq!(bounty(&store).locked_amount, 20);
        assert_eq!(run(&handler, &store, second).await, JobOutcome::done());

        let bounty = bounty(&store);
        assert_eq!(bounty.locked_amount, 0);
        assert_eq!(bounty.status, BountyStatus::Released);
        let amounts: Vec<_> = chain.submissions().iter().map(|t| t.amount).collect();
        assert_eq!(amounts, vec![30, 20]);
    }

    #[test]
    fn refund_goes_through_escrow_rules() {
        let store = Store::in_memory().unwrap();
        seed_locked_bounty(&store, "B1", 100);
        let err = refund_bounty(&store, &BountyId::new("B1"), Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            store::StoreError::Escrow(store::EscrowError::DeadlineNotPassed(_))
        ));
    }
}
