use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Key-value store with per-entry TTL shared by sessions and reset tokens.
///
/// Expired entries are never returned by `get` and never reported as removed
/// by `del`; `purge_expired` reclaims their space.
#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    /// Returns true when a live entry was removed.
    async fn del(&self, key: &str) -> anyhow::Result<bool>;
    /// Removes a live entry and hands back its value with the TTL it had left.
    async fn take(&self, key: &str) -> anyhow::Result<Option<(String, Duration)>>;
    async fn purge_expired(&self) -> anyhow::Result<u64>;
}

/// Cache backed by the `cache_entries` table.
#[derive(Clone)]
pub struct PgCache {
    db: PgPool,
}

impl PgCache {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionCache for PgCache {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, expires_at)
            VALUES ($1, $2, now() + make_interval(secs => $3))
            ON CONFLICT (key)
            DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .execute(&self.db)
        .await
        .context("cache set")?;
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>(
            r#"SELECT value FROM cache_entries WHERE key = $1 AND expires_at > now()"#,
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await
        .context("cache get")?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> anyhow::Result<bool> {
        let live = sqlx::query_scalar::<_, bool>(
            r#"DELETE FROM cache_entries WHERE key = $1 RETURNING expires_at > now()"#,
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await
        .context("cache del")?;
        Ok(live.unwrap_or(false))
    }

    async fn take(&self, key: &str) -> anyhow::Result<Option<(String, Duration)>> {
        let row = sqlx::query_as::<_, (String, f64)>(
            r#"
            DELETE FROM cache_entries WHERE key = $1
            RETURNING value, EXTRACT(EPOCH FROM (expires_at - now()))::float8
            "#,
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await
        .context("cache take")?;
        Ok(row
            .filter(|(_, left)| *left > 0.0)
            .map(|(value, left)| (value, Duration::from_secs_f64(left))))
    }

    async fn purge_expired(&self) -> anyhow::Result<u64> {
        let res = sqlx::query(r#"DELETE FROM cache_entries WHERE expires_at <= now()"#)
            .execute(&self.db)
            .await
            .context("cache purge")?;
        Ok(res.rows_affected())
    }
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// Process-local cache. Sessions do not survive a restart.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl SessionCache for MemoryCache {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let expires_at = Instant::now()
            .checked_add(ttl)
            .with_context(|| format!("ttl of {}s is out of range", ttl.as_secs()))?;
        self.entries.lock().await.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone()))
    }

    async fn del(&self, key: &str) -> anyhow::Result<bool> {
        let mut entries = self.entries.lock().await;
        Ok(entries
            .remove(key)
            .is_some_and(|e| e.expires_at > Instant::now()))
    }

    async fn take(&self, key: &str) -> anyhow::Result<Option<(String, Duration)>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        Ok(entries
            .remove(key)
            .filter(|e| e.expires_at > now)
            .map(|e| (e.value, e.expires_at - now)))
    }

    async fn purge_expired(&self) -> anyhow::Result<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        Ok((before - entries.len()) as u64)
    }
}

/// Periodically drops expired entries so the table does not grow unbounded.
pub fn spawn_sweeper(
    cache: Arc<dyn SessionCache>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            match cache.purge_expired().await {
                Ok(0) => {}
                Ok(n) => debug!(purged = n, "expired cache entries removed"),
                Err(e) => error!(error = %e, "cache sweep failed"),
            }
        }
    })
}
