use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EngineSettings;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::StalenessHub;
use crate::reaper;

/// Background task cadence for every tenant engine.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub reaper_interval: Duration,
    pub generation_interval: Duration,
    pub compact_threshold: u64,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            reaper_interval: Duration::from_secs(5),
            generation_interval: Duration::from_secs(3600),
            compact_threshold: 1000,
        }
    }
}

/// Manages per-tenant engines. Each tenant gets its own Engine, WAL,
/// staleness hub and background tasks.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    settings: EngineSettings,
    schedule: Schedule,
    shutdown: CancellationToken,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: EngineSettings, schedule: Schedule) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            settings,
            schedule,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get or lazily create an engine for the given tenant.
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

        // Two connections may race to open the same tenant; only one engine
        // may own the WAL.
        let entry = match self.engines.entry(tenant.to_string()) {
            dashmap::Entry::Occupied(e) => return Ok(e.get().clone()),
            dashmap::Entry::Vacant(e) => e,
        };

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(StalenessHub::new());
        let engine = Arc::new(Engine::new(wal_path, notify, self.settings.clone())?);

        let Schedule { reaper_interval, generation_interval, compact_threshold } = self.schedule;
        tokio::spawn(reaper::run_reaper(engine.clone(), reaper_interval, self.shutdown.child_token()));
        tokio::spawn(reaper::run_generator(engine.clone(), generation_interval, self.shutdown.child_token()));
        tokio::spawn(reaper::run_compactor(engine.clone(), compact_threshold, self.shutdown.child_token()));

        entry.insert(engine.clone());
        info!("opened tenant {safe_name}");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }

    /// Stop every tenant's background tasks.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
