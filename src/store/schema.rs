//! Table definitions. Applied on every open; every statement is idempotent.

pub(super) const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    type TEXT NOT NULL,
    dedupe_key TEXT NOT NULL UNIQUE,
    payload TEXT NOT NULL,
    received_at INTEGER NOT NULL,
    status TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL REFERENCES events(id),
    kind TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    next_attempt_at INTEGER NOT NULL,
    last_error TEXT,
    status TEXT NOT NULL,
    project_id INTEGER,
    lease_owner TEXT,
    lease_expires_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (event_id, kind)
);

CREATE INDEX IF NOT EXISTS idx_jobs_ready ON jobs(kind, status, next_attempt_at);
CREATE INDEX IF NOT EXISTS idx_jobs_project ON jobs(project_id, kind, status);

CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_user_id INTEGER NOT NULL,
    repo_full_name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS github_accounts (
    user_id INTEGER PRIMARY KEY,
    github_login TEXT NOT NULL,
    access_token_enc TEXT NOT NULL,
    scopes TEXT NOT NULL DEFAULT '',
    linked_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS wallets (
    github_login TEXT NOT NULL,
    chain TEXT NOT NULL,
    address TEXT NOT NULL,
    PRIMARY KEY (github_login, chain)
);

CREATE TABLE IF NOT EXISTS bounties (
    bounty_id TEXT PRIMARY KEY,
    project_id INTEGER NOT NULL REFERENCES projects(id),
    issue_number INTEGER NOT NULL,
    chain TEXT NOT NULL,
    amount INTEGER NOT NULL,
    currency TEXT NOT NULL,
    locked_amount INTEGER NOT NULL DEFAULT 0 CHECK (locked_amount >= 0),
    status TEXT NOT NULL,
    split_rewards INTEGER NOT NULL DEFAULT 0,
    split_amount INTEGER,
    deadline INTEGER
);

CREATE INDEX IF NOT EXISTS idx_bounties_issue ON bounties(project_id, issue_number);

CREATE TABLE IF NOT EXISTS submissions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bounty_id TEXT NOT NULL REFERENCES bounties(bounty_id),
    repo_full_name TEXT NOT NULL,
    pr_number INTEGER NOT NULL,
    author_identity TEXT NOT NULL,
    merge_commit_sha TEXT NOT NULL,
    verified_at INTEGER,
    UNIQUE (repo_full_name, pr_number)
);

CREATE TABLE IF NOT EXISTS proofs (
    submission_id INTEGER PRIMARY KEY REFERENCES submissions(id),
    content_hash TEXT NOT NULL,
    storage_uri TEXT NOT NULL,
    signature TEXT NOT NULL,
    generated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS payouts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    submission_id INTEGER NOT NULL REFERENCES submissions(id),
    bounty_id TEXT NOT NULL REFERENCES bounties(bounty_id),
    chain TEXT NOT NULL,
    amount INTEGER NOT NULL CHECK (amount > 0),
    recipient TEXT NOT NULL,
    tx_ref TEXT,
    status TEXT NOT NULL,
    job_id INTEGER NOT NULL REFERENCES jobs(id),
    submitted_at INTEGER,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_payouts_bounty ON payouts(bounty_id, status);
CREATE UNIQUE INDEX IF NOT EXISTS idx_payouts_one_confirmed
    ON payouts(bounty_id, submission_id) WHERE status = 'confirmed';

CREATE TABLE IF NOT EXISTS mirrored_items (
    project_id INTEGER NOT NULL REFERENCES projects(id),
    remote_id INTEGER NOT NULL,
    number INTEGER NOT NULL,
    kind TEXT NOT NULL,
    state TEXT NOT NULL,
    title TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    synced_at INTEGER NOT NULL,
    PRIMARY KEY (project_id, remote_id)
);
"#;
