use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;

/// Per-site engines. Each makerspace site gets its own Engine, WAL and compactor.
/// Site = database name from the pgwire connection.
pub struct SiteManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl SiteManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily open the engine for a site.
    ///
    /// Engines are keyed by the sanitized name, which is also the WAL file
    /// name, so `"north"` and `"north."` share one engine.
    pub fn get_or_open(&self, site: &str) -> std::io::Result<Arc<Engine>> {
        if site.len() > MAX_SITE_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "site name too long",
            ));
        }
        let safe_name = sanitize_site_name(site);
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty site name",
            ));
        }
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_SITES {
            return Err(std::io::Error::other("too many sites"));
        }

        // Two sessions may race to open the same site; only one engine may own the WAL.
        let engine = match self.engines.entry(safe_name.clone()) {
            dashmap::Entry::Occupied(e) => return Ok(e.get().clone()),
            dashmap::Entry::Vacant(v) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::new(wal_path)?);
                v.insert(engine.clone());
                engine
            }
        };

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        tracing::info!("site {safe_name} opened");
        metrics::gauge!(crate::observability::SITES_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    pub fn site_count(&self) -> usize {
        self.engines.len()
    }
}

/// Site names become file names.
fn sanitize_site_name(site: &str) -> String {
    site.chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}
