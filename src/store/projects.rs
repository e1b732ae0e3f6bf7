//! Projects, delegated credentials, contributor wallets and mirrored items.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::{Result, Store, from_millis, parse_column, to_millis};
use crate::types::{ItemKind, MirroredItem, Project, ProjectId, UserId};

/// A user's linked GitHub account. The access token is stored encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedAccount {
    pub user_id: UserId,
    pub github_login: String,
    /// Output of [`TokenCipher::encrypt`](crate::credentials::TokenCipher::encrypt).
    pub access_token_enc: String,
    pub scopes: String,
    pub linked_at: DateTime<Utc>,
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: ProjectId(row.get(0)?),
        owner_user_id: UserId(row.get(1)?),
        repo_full_name: row.get(2)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<MirroredItem> {
    let kind: String = row.get(3)?;
    Ok(MirroredItem {
        project_id: ProjectId(row.get(0)?),
        remote_id: row.get(1)?,
        number: row.get(2)?,
        kind: parse_column("mirrored_items", &kind, ItemKind::parse)?,
        state: row.get(4)?,
        title: row.get(5)?,
        updated_at: from_millis(row.get(6)?),
    })
}

impl Store {
    // ─── Projects ───

    /// Registers `repo_full_name` for `owner`. Registering a repository twice
    /// returns the existing project.
    pub fn create_project(&self, owner: UserId, repo_full_name: &str) -> Result<Project> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO projects (owner_user_id, repo_full_name) VALUES (?1, ?2)
             ON CONFLICT (repo_full_name) DO NOTHING",
            params![owner.0, repo_full_name],
        )?;
        let project = conn.query_row(
            "SELECT id, owner_user_id, repo_full_name FROM projects WHERE repo_full_name = ?1",
            params![repo_full_name],
            project_from_row,
        )?;
        Ok(project)
    }

    pub fn get_project(&self, id: ProjectId) -> Result<Option<Project>> {
        let conn = self.lock()?;
        let project = conn
            .query_row(
                "SELECT id, owner_user_id, repo_full_name FROM projects WHERE id = ?1",
                params![id.0],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    /// Looks a project up by `owner/repo`, ignoring ASCII case as GitHub does.
    pub fn project_by_repo(&self, repo_full_name: &str) -> Result<Option<Project>> {
        let conn = self.lock()?;
        let project = conn
            .query_row(
                "SELECT id, owner_user_id, repo_full_name FROM projects
                 WHERE repo_full_name = ?1 COLLATE NOCASE",
                params![repo_full_name],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, owner_user_id, repo_full_name FROM projects ORDER BY id")?;
        let projects = stmt
            .query_map([], project_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(projects)
    }

    // ─── Linked accounts ───

    /// Stores (or replaces) the linked GitHub account of `account.user_id`.
    pub fn link_account(&self, account: &LinkedAccount) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO github_accounts
                 (user_id, github_login, access_token_enc, scopes, linked_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (user_id) DO UPDATE SET
                 github_login = excluded.github_login,
                 access_token_enc = excluded.access_token_enc,
                 scopes = excluded.scopes,
                 linked_at = excluded.linked_at",
            params![
                account.user_id.0,
                account.github_login,
                account.access_token_enc,
                account.scopes,
                to_millis(account.linked_at),
            ],
        )?;
        Ok(())
    }

    pub fn linked_account(&self, user_id: UserId) -> Result<Option<LinkedAccount>> {
        let conn = self.lock()?;
        let account = conn
            .query_row(
                "SELECT user_id, github_login, access_token_enc, scopes, linked_at
                 FROM github_accounts WHERE user_id = ?1",
                params![user_id.0],
                |row| {
                    Ok(LinkedAccount {
                        user_id: UserId(row.get(0)?),
                        github_login: row.get(1)?,
                        access_token_enc: row.get(2)?,
                        scopes: row.get(3)?,
                        linked_at: from_millis(row.get(4)?),
                    })
                },
            )
            .optional()?;
        Ok(account)
    }

    // ─── Wallets ───

    pub fn set_wallet(&self, github_login: &str, chain: &str, address: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO wallets (github_login, chain, address) VALUES (?1, ?2, ?3)
             ON CONFLICT (github_login, chain) DO UPDATE SET address = excluded.address",
            params![github_login.to_ascii_lowercase(), chain, address],
        )?;
        Ok(())
    }

    /// The payout address of a contributor on `chain`.
    pub fn wallet(&self, github_login: &str, chain: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let address = conn
            .query_row(
                "SELECT address FROM wallets WHERE github_login = ?1 AND chain = ?2",
                params![github_login.to_ascii_lowercase(), chain],
                |row| row.get(0),
            )
            .optional()?;
        Ok(address)
    }

    // ─── Mirrored items ───

    /// Upserts a mirrored item keyed by `(project_id, remote_id)`.
    ///
    /// A stored row is only overwritten by an observation that is at least as
    /// recent, so applying pages in any order converges on the same state.
    /// Returns whether the row was written.
    pub fn upsert_mirrored_item(&self, item: &MirroredItem, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let written = conn.execute(
            "INSERT INTO mirrored_items
                 (project_id, remote_id, number, kind, state, title, updated_at, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (project_id, remote_id) DO UPDATE SET
                 number = excluded.number,
                 kind = excluded.kind,
                 state = excluded.state,
                 title = excluded.title,
                 updated_at = excluded.updated_at,
                 synced_at = excluded.synced_at
             WHERE excluded.updated_at >= mirrored_items.updated_at",
            params![
                item.project_id.0,
                item.remote_id,
                item.number,
                item.kind.as_str(),
                item.state,
                item.title,
                to_millis(item.updated_at),
                to_millis(now),
            ],
        )?;
        Ok(written > 0)
    }

    pub fn mirrored_items(&self, project_id: ProjectId) -> Result<Vec<MirroredItem>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT project_id, remote_id, number, kind, state, title, updated_at
             FROM mirrored_items WHERE project_id = ?1 ORDER BY number",
        )?;
        let items = stmt
            .query_map(params![project_id.0], item_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    fn item(remote_id: u64, state: &str, updated_at: DateTime<Utc>) -> MirroredItem {
        MirroredItem {
            project_id: ProjectId(1),
            remote_id,
            number: remote_id,
            kind: ItemKind::Issue,
            state: state.to_string(),
            title: format!("item {remote_id}"),
            updated_at,
        }
    }

    #[test]
    fn registering_twice_returns_same_project() {
        let store = Store::in_memory().unwrap();
        let a = store.create_project(UserId(1), "acme/widgets").unwrap();
        let b = store.create_project(UserId(2), "acme/widgets").unwrap();
        assert_eq!(a, b);
        assert_eq!(b.owner_user_id, UserId(1));
        assert_eq!(
            store.project_by_repo("ACME/Widgets").unwrap(),
            Some(a.clone())
        );
        assert_eq!(store.list_projects().unwrap(), vec![a]);
    }

    #[test]
    fn relinking_replaces_the_token() {
        let store = Store::in_memory().unwrap();
        let mut account = LinkedAccount {
            user_id: UserId(1),
            github_login: "owner".to_string(),
            access_token_enc: "old".to_string(),
            scopes: "repo".to_string(),
            linked_at: Utc::now(),
        };
        store.link_account(&account).unwrap();
        account.access_token_enc = "new".to_string();
        store.link_account(&account).unwrap();

        let stored = store.linked_account(UserId(1)).unwrap().unwrap();
        assert_eq!(stored.access_token_enc, "new");
        assert!(store.linked_account(UserId(2)).unwrap().is_none());
    }

    #[test]
    fn wallet_lookup_ignores_login_case() {
        let store = Store::in_memory().unwrap();
        store.set_wallet("Alice", "stellar", "GALICE").unwrap();
        assert_eq!(
            store.wallet("alice", "stellar").unwrap().as_deref(),
            Some("GALICE")
        );
        assert!(store.wallet("alice", "solana").unwrap().is_none());
    }

    #[test]
    fn stale_observation_does_not_overwrite() {
        let store = Store::in_memory().unwrap();
        store.create_project(UserId(1), "acme/widgets").unwrap();
        let now = Utc::now();
        let newer = now + ChronoDuration::minutes(5);

        assert!(store.upsert_mirrored_item(&item(1, "closed", newer), now).unwrap());
        assert!(!store.upsert_mirrored_item(&item(1, "open", now), now).unwrap());

        let items = store.mirrored_items(ProjectId(1)).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].state, "closed");
    }

    proptest! {
        /// Applying the same observations in any order yields the same rows.
        #[test]
        fn upsert_is_order_independent(
            observations in prop::collection::vec((0u64..4, 0i64..100, any::<bool>()), 1..20)
        ) {
            let base = Utc::now();
            let items: Vec<MirroredItem> = observations
                .iter()
                .map(|(id, minutes, open)| {
                    let state = if *open { "open" } else { "closed" };
                    let mut i = item(*id, state, base + ChronoDuration::minutes(*minutes));
                    i.title = format!("{id}-{minutes}-{state}");
                    i
                })
                .collect();

            let apply = |order: &[MirroredItem]| {
                let store = Store::in_memory().unwrap();
                store.create_project(UserId(1), "acme/widgets").unwrap();
                for i in order {
                    store.upsert_mirrored_item(i, base).unwrap();
                }
                store
                    .mirrored_items(ProjectId(1))
                    .unwrap()
                    .into_iter()
                    .map(|i| (i.remote_id, i.updated_at))
                    .collect::<Vec<_>>()
            };

            let mut reversed = items.clone();
            reversed.reverse();
            prop_assert_eq!(apply(&items), apply(&reversed));
        }
    }
}
