use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("account not found: {0}")]
    NotFound(String),
}

/// Stored credentials and identity of one mirrored user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub remote_account_id: Option<String>,
    pub display_name: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub id: String,
    pub remote_account_id: Option<String>,
    pub display_name: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
}

/// Accounts table, sharing the sync database with the index.
#[derive(Clone)]
pub struct AccountStore {
    pool: SqlitePool,
}

impl AccountStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert_account(&self, account: &NewAccount, now: i64) -> Result<Account, AccountError> {
        sqlx::query(
            "INSERT INTO accounts (
                id, remote_account_id, display_name, access_token, refresh_token,
                expires_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT(id) DO UPDATE SET
                remote_account_id = COALESCE(excluded.remote_account_id, accounts.remote_account_id),
                display_name = COALESCE(excluded.display_name, accounts.display_name),
                access_token = excluded.access_token,
                refresh_token = COALESCE(excluded.refresh_token, accounts.refresh_token),
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at",
        )
        .bind(&account.id)
        .bind(&account.remote_account_id)
        .bind(&account.display_name)
        .bind(&account.access_token)
        .bind(&account.refresh_token)
        .bind(account.expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_account(&account.id)
            .await?
            .ok_or_else(|| AccountError::NotFound(account.id.clone()))
    }

    pub async fn get_account(&self, id: &str) -> Result<Option<Account>, AccountError> {
        let row = sqlx::query(
            "SELECT id, remote_account_id, display_name, access_token, refresh_token, expires_at, created_at, updated_at
             FROM accounts WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>, AccountError> {
        let rows = sqlx::query(
            "SELECT id, remote_account_id, display_name, access_token, refresh_token, expires_at, created_at, updated_at
             FROM accounts ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(account_from_row).collect()
    }

    /// Stores refreshed token material. A `None` refresh token keeps the
    /// stored one, since providers may omit it on refresh.
    pub async fn update_tokens(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<i64>,
        now: i64,
    ) -> Result<(), AccountError> {
        let result = sqlx::query(
            "UPDATE accounts
             SET access_token = ?1,
                 refresh_token = COALESCE(?2, refresh_token),
                 expires_at = ?3,
                 updated_at = ?4
             WHERE id = ?5",
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AccountError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

fn account_from_row(row: &SqliteRow) -> Result<Account, AccountError> {
    Ok(Account {
        id: row.try_get("id")?,
        remote_account_id: row.try_get("remote_account_id")?,
        display_name: row.try_get("display_name")?,
        access_token: row.try_get("access_token")?,
        refresh_token: row.try_get("refresh_token")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::index::SyncIndex;

    async fn make_store() -> AccountStore {
        let index = SyncIndex::open_in_memory().await.unwrap();
        AccountStore::from_pool(index.pool().clone())
    }

    fn new_account() -> NewAccount {
        NewAccount {
            id: "user-1".into(),
            remote_account_id: Some("remote-1".into()),
            display_name: Some("Alice".into()),
            access_token: "token-1".into(),
            refresh_token: Some("refresh-1".into()),
            expires_at: Some(1_000),
        }
    }

    #[tokio::test]
    async fn upsert_inserts_and_updates() {
        let store = make_store().await;
        let created = store.upsert_account(&new_account(), 10).await.unwrap();
        assert_eq!(created.created_at, 10);

        let mut again = new_account();
        again.display_name = None;
        again.refresh_token = None;
        again.access_token = "token-2".into();
        let updated = store.upsert_account(&again, 20).await.unwrap();

        assert_eq!(updated.access_token, "token-2");
        assert_eq!(updated.display_name.as_deref(), Some("Alice"));
        assert_eq!(updated.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(updated.created_at, 10);
        assert_eq!(updated.updated_at, 20);
    }

    #[tokio::test]
    async fn update_tokens_keeps_refresh_token_when_omitted() {
        let store = make_store().await;
        store.upsert_account(&new_account(), 10).await.unwrap();

        store
            .update_tokens("user-1", "token-2", None, Some(5_000), 30)
            .await
            .unwrap();

        let account = store.get_account("user-1").await.unwrap().unwrap();
        assert_eq!(account.access_token, "token-2");
        assert_eq!(account.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(account.expires_at, Some(5_000));
    }

    #[tokio::test]
    async fn update_tokens_for_missing_account_fails() {
        let store = make_store().await;
        let err = store
            .update_tokens("nobody", "t", None, None, 0)
            .await
            .expect_err("expected missing account");
        assert!(matches!(err, AccountError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_accounts_is_sorted() {
        let store = make_store().await;
        let mut second = new_account();
        second.id = "user-0".into();
        store.upsert_account(&new_account(), 1).await.unwrap();
        store.upsert_account(&second, 1).await.unwrap();

        let ids: Vec<String> = store
            .list_accounts()
            .await
            .unwrap()
            .into_iter()
            .map(|account| account.id)
            .collect();
        assert_eq!(ids, vec!["user-0".to_string(), "user-1".to_string()]);
    }
}
