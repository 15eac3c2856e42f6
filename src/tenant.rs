use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::clock::Clock;
use crate::engine::Engine;
use crate::limits::*;
use crate::reaper;

/// Per-tenant engines. Each tenant gets its own Engine, WAL file, reaper and compactor.
/// On the store server the tenant is the pgwire database name; the HTTP service uses one
/// configured tenant for its local engine.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    reap_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl TenantManager {
    /// `clock` drives the background sweep of every tenant.
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        reap_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            reap_interval,
            clock,
        }
    }

    /// Get or lazily open the engine for `tenant`.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // The name is the WAL file stem, so it must map to exactly one file
        if tenant.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }
        if !tenant
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name may only contain letters, digits, '_' and '-'",
            ));
        }

        // Two connections may race to open the same tenant; only one engine may own the WAL.
        let entry = self.engines.entry(tenant.to_string());
        let engine = match entry {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{tenant}.wal"));
                let engine = Arc::new(Engine::new(wal_path)?);
                slot.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(reaper::run_reaper(
            engine.clone(),
            self.clock.clone(),
            self.reap_interval,
        ));
        tokio::spawn(reaper::run_compactor(engine.clone(), self.compact_threshold));

        tracing::info!(tenant, "opened tenant engine");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::model::*;
    use crate::store::{ClaimOutcome, ClaimRequest};
    use std::fs;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotgate_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, Duration::from_secs(5), Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let tm = manager(test_data_dir("isolation"));
        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        let lobby = ResourceId::parse("lobby").unwrap();
        let claim = |token| ClaimRequest {
            resource_id: lobby.clone(),
            slot: 1,
            token,
            user_id: None,
            now: 0,
            expires_at: 10_000,
        };

        // Slot 1 of the same resource is independent per tenant
        let a = eng_a.claim_slot(&claim(Token::issue())).await.unwrap();
        let b = eng_b.claim_slot(&claim(Token::issue())).await.unwrap();
        assert!(matches!(a, ClaimOutcome::Claimed(_)));
        assert!(matches!(b, ClaimOutcome::Claimed(_)));

        assert_eq!(eng_a.usage(&lobby, None, 0).await.active, 1);
        assert_eq!(eng_b.usage(&lobby, None, 0).await.active, 1);
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
        assert_eq!(tm.tenant_count(), 1);
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let tm = manager(test_data_dir("same_eng"));
        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_names_outside_the_file_alphabet_are_rejected() {
        let dir = test_data_dir("reject_names");
        let tm = manager(dir.clone());

        let _eng = tm.get_or_create("ab").unwrap();
        for name in ["a.b", "../ab", "../..", "a b", ""] {
            assert!(tm.get_or_create(name).is_err(), "{name:?}");
        }
        // "ab" keeps its WAL to itself
        assert_eq!(tm.tenant_count(), 1);
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
        assert!(tm.get_or_create("Tenant_2-b").is_ok());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let tm = manager(test_data_dir("name_too_long"));
        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let tm = manager(test_data_dir("count_limit"));
        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
