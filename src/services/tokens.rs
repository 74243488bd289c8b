//! TokenIssuer - mints and redeems claim tokens for stored digests.
//!
//! Tokens live in the `image_tokens` table with an absolute expiry
//! (unix seconds). A token is single-use: redeeming it deletes the row.
//! A live token also keeps its digest out of the reclamation sweep.

use crate::models::token::ClaimToken;
use crate::services::media_store::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqlitePool, Transaction};
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone)]
pub struct TokenIssuer {
    db: SqlitePool,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(db: SqlitePool, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    /// Mint a fresh token for `sha1` if the digest is stored.
    ///
    /// Lookup and insert are one statement, so a concurrent sweep either
    /// removes the digest first (`None`) or finds it referenced.
    pub async fn mint(&self, sha1: &str) -> StoreResult<Option<ClaimToken>> {
        let (token, expires) = self.next_token();
        let result = sqlx::query(
            "INSERT INTO image_tokens (token, sha1, expires) \
             SELECT ?, sha1, ? FROM images WHERE sha1 = ?",
        )
        .bind(&token)
        .bind(expires)
        .bind(sha1)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(claim_token(token, sha1, expires)))
    }

    /// Mint a token inside a caller's transaction. The digest row must exist
    /// in that transaction.
    pub(crate) async fn mint_with<'e, E>(&self, executor: E, sha1: &str) -> StoreResult<ClaimToken>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let (token, expires) = self.next_token();
        sqlx::query("INSERT INTO image_tokens (token, sha1, expires) VALUES (?, ?, ?)")
            .bind(&token)
            .bind(sha1)
            .bind(expires)
            .execute(executor)
            .await?;
        Ok(claim_token(token, sha1, expires))
    }

    /// Drop a token without attaching it anywhere.
    pub async fn revoke(&self, token: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM image_tokens WHERE token = ?")
            .bind(token)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Redeem a token, returning the digest it was bound to.
    ///
    /// Expired and unknown tokens both yield `None`.
    #[cfg(test)]
    pub async fn consume(&self, token: &str) -> StoreResult<Option<String>> {
        let mut tx = self.db.begin().await?;
        let sha1 = consume_in(&mut tx, token).await?;
        tx.commit().await?;
        Ok(sha1)
    }

    /// Redeem a token and attach its digest to a post in one transaction.
    pub async fn claim(&self, token: &str, post_id: i64) -> StoreResult<String> {
        let mut tx = self.db.begin().await?;
        let post_exists =
            sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM posts WHERE id = ?)")
                .bind(post_id)
                .fetch_one(&mut *tx)
                .await?;
        if !post_exists {
            return Err(StoreError::PostNotFound);
        }

        let sha1 = consume_in(&mut tx, token)
            .await?
            .ok_or(StoreError::TokenNotFound)?;

        sqlx::query("INSERT INTO post_files (post_id, sha1) VALUES (?, ?)")
            .bind(post_id)
            .bind(&sha1)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(sha1)
    }

    /// Drop expired tokens, returning how many were removed.
    pub async fn expire(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM image_tokens WHERE expires <= ?")
            .bind(Utc::now().timestamp())
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }

    fn next_token(&self) -> (String, i64) {
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let expires = Utc::now().timestamp().saturating_add(ttl);
        (Uuid::new_v4().simple().to_string(), expires)
    }
}

fn claim_token(token: String, sha1: &str, expires: i64) -> ClaimToken {
    ClaimToken {
        token,
        sha1: sha1.to_string(),
        expires_at: DateTime::from_timestamp(expires, 0).unwrap_or(DateTime::<Utc>::MAX_UTC),
    }
}

async fn consume_in(tx: &mut Transaction<'_, Sqlite>, token: &str) -> StoreResult<Option<String>> {
    let sha1 = sqlx::query_scalar::<_, String>(
        "DELETE FROM image_tokens WHERE token = ? AND expires > ? RETURNING sha1",
    )
    .bind(token)
    .bind(Utc::now().timestamp())
    .fetch_optional(&mut **tx)
    .await?;
    Ok(sha1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::media_store::tests::{store_sample, temp_store};
    use crate::services::upkeep::Upkeep;

    #[tokio::test]
    async fn tokens_are_single_use() {
        let (store, _db, _assets) = temp_store().await;
        let record = store_sample(&store, b"file").await;

        let issuer = TokenIssuer::new(store.db.clone(), Duration::from_secs(60));
        let first = issuer.mint(&record.sha1).await.unwrap().unwrap();
        let second = issuer.mint(&record.sha1).await.unwrap().unwrap();
        assert_ne!(first.token, second.token);
        assert_eq!(first.sha1, record.sha1);

        assert_eq!(
            issuer.consume(&first.token).await.unwrap(),
            Some(record.sha1.clone())
        );
        assert_eq!(issuer.consume(&first.token).await.unwrap(), None);
        assert_eq!(
            issuer.consume(&second.token).await.unwrap(),
            Some(record.sha1)
        );
    }

    #[tokio::test]
    async fn expired_tokens_cannot_be_claimed_and_are_swept() {
        let (store, _db, _assets) = temp_store().await;
        let record = store_sample(&store, b"file").await;

        let issuer = TokenIssuer::new(store.db.clone(), Duration::ZERO);
        let token = issuer.mint(&record.sha1).await.unwrap().unwrap();

        assert_eq!(issuer.consume(&token.token).await.unwrap(), None);
        // One from the commit, one minted here.
        assert_eq!(issuer.expire().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn minting_for_a_reclaimed_digest_yields_nothing() {
        let (store, _db, _assets) = temp_store().await;
        let record = store_sample(&store, b"short lived").await;
        let issuer = TokenIssuer::new(store.db.clone(), Duration::from_secs(60));

        // The dedup lookup saw the row, then a sweep removed it.
        assert!(store.find_file(&record.sha1).await.unwrap().is_some());
        let upkeep = Upkeep::new(store.clone(), issuer.clone(), Duration::from_secs(60));
        assert_eq!(upkeep.delete_unused_files().await.unwrap(), 1);

        assert!(issuer.mint(&record.sha1).await.unwrap().is_none());
        let left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM image_tokens")
            .fetch_one(&store.db)
            .await
            .unwrap();
        assert_eq!(left, 0);
    }

    #[tokio::test]
    async fn huge_ttl_saturates_instead_of_wrapping() {
        let (store, _db, _assets) = temp_store().await;
        let record = store_sample(&store, b"forever").await;
        let issuer = TokenIssuer::new(store.db.clone(), Duration::from_secs(u64::MAX));

        let token = issuer.mint(&record.sha1).await.unwrap().unwrap();
        assert!(token.expires_at > Utc::now());
        assert_eq!(issuer.consume(&token.token).await.unwrap(), Some(record.sha1));
    }

    #[tokio::test]
    async fn claim_attaches_digest_to_post() {
        let (store, _db, _assets) = temp_store().await;
        let record = store_sample(&store, b"file").await;
        sqlx::query("INSERT INTO posts (id, board, time) VALUES (7, 'a', 0)")
            .execute(&store.db)
            .await
            .unwrap();

        let issuer = TokenIssuer::new(store.db.clone(), Duration::from_secs(60));
        let token = issuer.mint(&record.sha1).await.unwrap().unwrap();
        assert_eq!(issuer.claim(&token.token, 7).await.unwrap(), record.sha1);

        let refs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM post_files WHERE post_id = 7")
            .fetch_one(&store.db)
            .await
            .unwrap();
        assert_eq!(refs, 1);

        let err = issuer.claim(&token.token, 7).await.unwrap_err();
        assert!(matches!(err, StoreError::TokenNotFound));
    }

    #[tokio::test]
    async fn claim_for_missing_post_keeps_token() {
        let (store, _db, _assets) = temp_store().await;
        let record = store_sample(&store, b"file").await;
        let issuer = TokenIssuer::new(store.db.clone(), Duration::from_secs(60));
        let token = issuer.mint(&record.sha1).await.unwrap().unwrap();

        let err = issuer.claim(&token.token, 404).await.unwrap_err();
        assert!(matches!(err, StoreError::PostNotFound));
        assert_eq!(issuer.consume(&token.token).await.unwrap(), Some(record.sha1));
    }
}
