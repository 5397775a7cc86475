use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::clock::SystemClock;
use crate::config::Config;
use crate::engine::{Engine, DEFAULT_WRITE_TIMEOUT};
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;
use crate::store::WalStore;

/// Per-tenant knobs shared by every engine the manager creates.
#[derive(Debug, Clone)]
pub struct TenantSettings {
    pub compact_threshold: u64,
    pub write_timeout: Duration,
    pub sweep_interval: Duration,
    pub anonymous_user: String,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            sweep_interval: Duration::from_secs(60),
            anonymous_user: "anonymous".into(),
        }
    }
}

impl From<&Config> for TenantSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            compact_threshold: cfg.compact_threshold,
            write_timeout: cfg.write_timeout,
            sweep_interval: cfg.sweep_interval,
            anonymous_user: cfg.anonymous_user.clone(),
        }
    }
}

/// One loaded tenant: its engine and the hub its booking notices go to.
#[derive(Clone)]
struct Tenant {
    engine: Arc<Engine>,
    hub: Arc<NotifyHub>,
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL +
/// completion sweep + compactor. Tenant = database name from the pgwire
/// connection.
pub struct TenantManager {
    engines: DashMap<String, Tenant>,
    data_dir: PathBuf,
    settings: TenantSettings,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: TenantSettings) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            settings,
        }
    }

    pub fn settings(&self) -> &TenantSettings {
        &self.settings
    }

    /// Get or lazily create an engine for the given tenant.
    ///
    /// Tenants are keyed by their sanitized name, which is also the WAL file
    /// name: `a.b` and `ab` share one engine rather than one file.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        Ok(self.load(tenant)?.engine)
    }

    /// The tenant's notification hub. Notices are delivered in-process only,
    /// to whatever the embedding program subscribes here; with no subscriber
    /// a submission still succeeds and reports `notified = false`.
    pub fn notify_hub(&self, tenant: &str) -> std::io::Result<Arc<NotifyHub>> {
        Ok(self.load(tenant)?.hub)
    }

    fn load(&self, tenant: &str) -> std::io::Result<Tenant> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }
        if let Some(loaded) = self.engines.get(&safe_name) {
            return Ok(loaded.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Two connections may race to open the same tenant; the entry lock
        // makes sure only one WAL writer exists per file.
        let entry = self.engines.entry(safe_name.clone());
        if let dashmap::mapref::entry::Entry::Occupied(e) = &entry {
            return Ok(e.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let store = Arc::new(WalStore::open(&wal_path)?);
        let hub = Arc::new(NotifyHub::new());
        let engine = Arc::new(
            Engine::new(store.clone(), hub.clone(), Arc::new(SystemClock))
                .with_write_timeout(self.settings.write_timeout),
        );

        let sweep_engine = engine.clone();
        let every = self.settings.sweep_interval;
        tokio::spawn(async move {
            reaper::run_completer(sweep_engine, every).await;
        });
        let threshold = self.settings.compact_threshold;
        tokio::spawn(async move {
            reaper::run_compactor(store, threshold).await;
        });

        let loaded = Tenant { engine, hub };
        entry.insert(loaded.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!(tenant, "tenant loaded");
        Ok(loaded)
    }
}
