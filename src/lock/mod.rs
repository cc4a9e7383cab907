//! Cross-process mutual exclusion keyed by namespace strings.
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::DEFAULT_LOCK_PREFIX;
use crate::errors::AppResult;
use crate::types::AccountIdentity;

pub mod reentrant;
pub mod sqlite;

pub use self::reentrant::{HolderId, RemoteReentrantLock};
pub use self::sqlite::SqliteLocking;

/// Client of a shared lock service.
///
/// `lock` answers `false` both when the namespace is held elsewhere and when
/// the service cannot decide right now; callers retry either way. `unlock`
/// is idempotent and never releases a hold that belongs to someone else.
#[async_trait]
pub trait Locking: Send + Sync {
    async fn lock(&self, namespace: &str) -> AppResult<bool>;

    async fn unlock(&self, namespace: &str) -> AppResult<()>;

    /// Extends the caller's hold on a lease-based service. `false` means the
    /// caller no longer holds `namespace`. Services without expiry keep the
    /// default.
    async fn renew(&self, namespace: &str) -> AppResult<bool> {
        let _ = namespace;
        Ok(true)
    }
}

/// Prefixed key in the shared lock keyspace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockNamespace(String);

impl LockNamespace {
    pub fn new(resource: &str) -> Self {
        Self::with_prefix(DEFAULT_LOCK_PREFIX, resource)
    }

    pub fn with_prefix(prefix: &str, resource: &str) -> Self {
        Self(format!("{prefix}{resource}"))
    }

    /// Namespace guarding one folder of one account.
    pub fn for_folder(prefix: &str, identity: &AccountIdentity, folder: &str) -> Self {
        let key = identity.key();
        Self::with_prefix(prefix, &format!("{}@{}/{}", key.address, key.host, folder))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Default)]
struct LockTable {
    holders: HashMap<String, String>,
    acquisitions: usize,
    releases: usize,
}

/// Lock service living in this process. Clients made with
/// [`MemoryLocking::client`] share one table but act as distinct holders,
/// which is how tests stand in for separate worker processes.
#[derive(Clone)]
pub struct MemoryLocking {
    table: Arc<Mutex<LockTable>>,
    holder: String,
}

impl Default for MemoryLocking {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLocking {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(LockTable::default())),
            holder: "local".to_string(),
        }
    }

    pub fn client(&self, holder: &str) -> Self {
        Self {
            table: Arc::clone(&self.table),
            holder: holder.to_string(),
        }
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn holder_of(&self, namespace: &str) -> Option<String> {
        self.table().holders.get(namespace).cloned()
    }

    /// Number of namespaces currently held by anyone.
    pub fn outstanding(&self) -> usize {
        self.table().holders.len()
    }

    pub fn acquisitions(&self) -> usize {
        self.table().acquisitions
    }

    pub fn releases(&self) -> usize {
        self.table().releases
    }
}

#[async_trait]
impl Locking for MemoryLocking {
    async fn lock(&self, namespace: &str) -> AppResult<bool> {
        let mut table = self.table();
        if table.holders.contains_key(namespace) {
            return Ok(false);
        }
        table
            .holders
            .insert(namespace.to_string(), self.holder.clone());
        table.acquisitions += 1;
        Ok(true)
    }

    async fn unlock(&self, namespace: &str) -> AppResult<()> {
        let mut table = self.table();
        if table.holders.get(namespace) == Some(&self.holder) {
            table.holders.remove(namespace);
            table.releases += 1;
        }
        Ok(())
    }

    async fn renew(&self, namespace: &str) -> AppResult<bool> {
        Ok(self.table().holders.get(namespace) == Some(&self.holder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Credential, Protocol};

    #[test]
    fn folder_namespace_is_prefixed_and_normalized() {
        let identity = AccountIdentity::new(
            Protocol::Imaps,
            "Mail.Example.com",
            "Bot@Example.com",
            Credential::Password("x".into()),
        );
        let ns = LockNamespace::for_folder("remotelock:", &identity, "INBOX");
        assert_eq!(ns.as_str(), "remotelock:bot@example.com@mail.example.com/INBOX");
    }

    #[tokio::test]
    async fn unlock_by_stranger_keeps_owner_hold() {
        let service = MemoryLocking::new();
        let owner = service.client("owner");
        let stranger = service.client("stranger");

        assert!(owner.lock("remotelock:a").await.unwrap());
        assert!(!stranger.lock("remotelock:a").await.unwrap());

        stranger.unlock("remotelock:a").await.unwrap();
        assert_eq!(service.holder_of("remotelock:a").as_deref(), Some("owner"));

        owner.unlock("remotelock:a").await.unwrap();
        owner.unlock("remotelock:a").await.unwrap();
        assert_eq!(service.outstanding(), 0);
        assert_eq!(service.releases(), 1);
    }
}
