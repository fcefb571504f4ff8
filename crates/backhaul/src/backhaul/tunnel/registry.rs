use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("pending connection not found: {0}")]
    NotFound(String),
}

/// A public connection parked until a transfer connection claims it.
#[derive(Debug)]
pub struct PendingConnection<C> {
    pub key: String,
    pub conn: C,
    pub registered_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingSnapshot {
    pub key: String,
    pub age_ms: u64,
}

/// Key -> pending connection map.
///
/// The lock only ever guards the map mutation itself; callers do their I/O (notify,
/// piping, closing evicted sockets) after the guard has been released.
pub struct PendingRegistry<C> {
    entries: Mutex<HashMap<String, PendingConnection<C>>>,
}

impl<C> std::fmt::Debug for PendingRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRegistry").finish_non_exhaustive()
    }
}

impl<C> Default for PendingRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> PendingRegistry<C> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Stores `conn` under `key`. Returns the entry it displaced, if any; remote
    /// addresses are unique among live sockets so this only happens for stale entries.
    pub async fn put(&self, key: String, conn: C) -> Option<PendingConnection<C>> {
        let entry = PendingConnection {
            key: key.clone(),
            conn,
            registered_at: Instant::now(),
        };
        let mut entries = self.entries.lock().await;
        let prev = entries.insert(key, entry);
        metrics::gauge!("backhaul_pending_connections").set(entries.len() as f64);
        prev
    }

    /// Atomically looks up and removes `key`. At most one caller ever receives a given
    /// entry.
    pub async fn take(&self, key: &str) -> Result<PendingConnection<C>, RegistryError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .remove(key)
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        metrics::gauge!("backhaul_pending_connections").set(entries.len() as f64);
        Ok(entry)
    }

    /// Removes every entry registered more than `ttl` before `now`.
    pub async fn take_expired(&self, ttl: Duration, now: Instant) -> Vec<PendingConnection<C>> {
        let mut entries = self.entries.lock().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.registered_at) > ttl)
            .map(|(k, _)| k.clone())
            .collect();

        let mut out = Vec::with_capacity(expired.len());
        for k in expired {
            if let Some(e) = entries.remove(&k) {
                out.push(e);
            }
        }
        if !out.is_empty() {
            metrics::gauge!("backhaul_pending_connections").set(entries.len() as f64);
        }
        out
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    #[cfg(test)]
    pub async fn contains(&self, key: &str) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    pub async fn snapshot(&self) -> Vec<PendingSnapshot> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let mut out: Vec<PendingSnapshot> = entries
            .values()
            .map(|e| PendingSnapshot {
                key: e.key.clone(),
                age_ms: now.saturating_duration_since(e.registered_at).as_millis() as u64,
            })
            .collect();
        drop(entries);
        out.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn take_missing_key_has_no_side_effect() {
        let reg = PendingRegistry::new();
        reg.put("a:1".into(), 1u32).await;

        let err = reg.take("nope").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(ref k) if k == "nope"));
        assert_eq!(reg.len().await, 1);
        assert!(reg.contains("a:1").await);
    }

    #[tokio::test]
    async fn take_is_exactly_once_under_contention() {
        let reg = Arc::new(PendingRegistry::new());
        reg.put("198.51.100.4:7000".into(), 42u32).await;

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..32 {
            let reg = reg.clone();
            tasks.spawn(async move { reg.take("198.51.100.4:7000").await.ok() });
        }

        let mut winners = 0;
        while let Some(res) = tasks.join_next().await {
            if let Some(entry) = res.unwrap() {
                assert_eq!(entry.conn, 42);
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(reg.len().await, 0);
    }

    #[tokio::test]
    async fn put_replaces_stale_entry() {
        let reg = PendingRegistry::new();
        assert!(reg.put("k".into(), 1u32).await.is_none());
        let prev = reg.put("k".into(), 2u32).await.unwrap();
        assert_eq!(prev.conn, 1);
        assert_eq!(reg.take("k").await.unwrap().conn, 2);
    }

    #[tokio::test]
    async fn take_expired_only_evicts_old_entries() {
        let reg = PendingRegistry::new();
        reg.put("old".into(), 1u32).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        reg.put("fresh".into(), 2u32).await;

        let evicted = reg
            .take_expired(Duration::from_millis(20), Instant::now())
            .await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, "old");
        assert!(reg.contains("fresh").await);
        assert!(!reg.contains("old").await);
    }

    #[tokio::test]
    async fn snapshot_lists_oldest_first() {
        let reg = PendingRegistry::new();
        reg.put("first".into(), ()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        reg.put("second".into(), ()).await;

        let snap = reg.snapshot().await;
        let keys: Vec<_> = snap.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["first", "second"]);
    }
}
