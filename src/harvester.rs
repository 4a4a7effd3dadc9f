use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::core::config::Config;
use crate::crawler::Crawler;
use crate::proxy::Proxy;
use crate::storage::Storage;
use crate::validator::Validator;

/// Top-level orchestrator: optional import, sequential source crawls, then
/// the validation loop until shutdown.
pub struct Harvester {
    cfg: Config,
    crawler: Crawler,
    validator: Arc<Validator>,
    storage: Arc<Storage>,
}

impl Harvester {
    pub fn new(
        cfg: Config,
        crawler: Crawler,
        validator: Arc<Validator>,
        storage: Arc<Storage>,
    ) -> Self {
        Harvester {
            cfg,
            crawler,
            validator,
            storage,
        }
    }

    /// Import (if configured), crawl every non-skipped source in order, then
    /// hand off to the validator. A hard error from any stage aborts the
    /// harvest.
    pub async fn harvest(&self) -> Result<()> {
        if let Some(path) = self
            .cfg
            .import_file_path
            .as_deref()
            .filter(|p| !p.is_empty())
        {
            self.import_from_file(path).await?;
        }

        for source in &self.cfg.source_configs {
            if source.skip {
                continue;
            }
            if source.dir.is_empty() {
                self.crawler.crawl_source_url(source).await?;
            } else {
                self.crawler.crawl_source_dir(source).await?;
            }
        }

        Arc::clone(&self.validator).start().await
    }

    /// Import a YAML list of proxy records. A decode failure is fatal; a
    /// failed row upsert is only warned about.
    pub async fn import_from_file(&self, path: &str) -> Result<()> {
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read import file {path}"))?;
        let proxies: Vec<Proxy> = serde_yaml::from_str(&data)
            .with_context(|| format!("failed to decode import file {path}"))?;
        info!("importing {} proxies from {}", proxies.len(), path);
        for proxy in &proxies {
            if let Err(e) = self.storage.save(proxy) {
                warn!("failed to import {}:{}: {e:#}", proxy.host, proxy.port);
            }
        }
        Ok(())
    }
}
