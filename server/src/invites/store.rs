//! Redis adapter for invite records and best-effort session persistence.
//!
//! The client is optional: when no store is configured (or the URL fails to
//! parse) every read reports [`StoreError::Unavailable`] and callers degrade —
//! invite validation fails closed, persistence and audit are skipped.
//!
//! Key layout:
//!
//! - `invite:<token>` → JSON [`InviteRecord`](super::InviteRecord), per-entry TTL
//! - `session:<clientId>` → JSON [`SessionRecord`], TTL = session timeout

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use super::InviteRecord;

/// One day in seconds, the floor for invite-record TTLs.
pub const MIN_TTL_SECS: i64 = 86_400;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key-value store not configured")]
    Unavailable,
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("invalid stored record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Best-effort session persistence record. Written at session start, deleted
/// at session end, never read back by the coordinator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invite_token: Option<String>,
    pub source_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub queue_wait_ms: u64,
}

/// Thin semantic wrapper around the key-value store.
///
/// Cloneable — all clones share the same underlying client.
#[derive(Clone)]
pub struct KvStore {
    client: Option<Arc<redis::Client>>,
}

impl KvStore {
    /// Open a client for `url`. A bad URL logs a warning and yields a
    /// disabled store rather than failing startup; connections are
    /// established lazily per operation.
    pub fn connect(url: &str) -> Self {
        match redis::Client::open(url) {
            Ok(client) => Self {
                client: Some(Arc::new(client)),
            },
            Err(e) => {
                warn!("Invalid redis URL {url}: {e}; store disabled");
                Self { client: None }
            }
        }
    }

    /// A store with no backing client (tests, degraded startup).
    pub fn disabled() -> Self {
        Self { client: None }
    }

    async fn conn(&self) -> Result<redis::aio::Connection, StoreError> {
        let client = self.client.as_ref().ok_or(StoreError::Unavailable)?;
        Ok(client.get_async_connection().await?)
    }

    /// Read the invite record for `token`. `Ok(None)` means the key is absent.
    pub async fn get_invite(&self, token: &str) -> Result<Option<InviteRecord>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(invite_key(token))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Write back an invite record with a fresh TTL (floored at one day).
    pub async fn put_invite(
        &self,
        token: &str,
        record: &InviteRecord,
        ttl_secs: i64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(record)?;
        redis::cmd("SET")
            .arg(invite_key(token))
            .arg(json)
            .arg("EX")
            .arg(ttl_secs.max(MIN_TTL_SECS))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Remaining TTL of an invite key in seconds. Negative values are redis's
    /// "no key" / "no expiry" sentinels; callers floor to [`MIN_TTL_SECS`].
    pub async fn invite_ttl(&self, token: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn().await?;
        let ttl: i64 = redis::cmd("TTL")
            .arg(invite_key(token))
            .query_async(&mut conn)
            .await?;
        Ok(ttl)
    }

    /// Write the best-effort `session:<clientId>` record.
    pub async fn persist_session(
        &self,
        client_id: &str,
        record: &SessionRecord,
        ttl_secs: i64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(record)?;
        redis::cmd("SET")
            .arg(session_key(client_id))
            .arg(json)
            .arg("EX")
            .arg(ttl_secs.max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Delete the `session:<clientId>` record.
    pub async fn delete_session(&self, client_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(session_key(client_id))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

fn invite_key(token: &str) -> String {
    format!("invite:{token}")
}

fn session_key(client_id: &str) -> String {
    format!("session:{client_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_carry_prefixes() {
        assert_eq!(invite_key("T1"), "invite:T1");
        assert_eq!(session_key("c-42"), "session:c-42");
    }

    #[tokio::test]
    async fn disabled_store_reports_unavailable() {
        let store = KvStore::disabled();
        let err = store.get_invite("T1").await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable));
    }

    #[test]
    fn session_record_serializes_camel_case() {
        let record = SessionRecord {
            session_id: "s1".into(),
            started_at: Utc::now(),
            expires_at: Utc::now(),
            invite_token: None,
            source_address: "10.0.0.7".into(),
            user_agent: None,
            queue_wait_ms: 1200,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("sessionId").is_some());
        assert!(json.get("queueWaitMs").is_some());
        assert!(json.get("sourceAddress").is_some());
        // Absent optionals are omitted entirely
        assert!(json.get("inviteToken").is_none());
    }
}
