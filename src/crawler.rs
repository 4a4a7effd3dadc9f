use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use regex::Regex;
use scraper::Html;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::core::config::SourceConfig;
use crate::parser::Parser;
use crate::storage::Storage;

/// Walks configured sources and feeds every fetched page through the parser
/// into storage.
pub struct Crawler {
    http_client: reqwest::Client,
    parser: Parser,
    storage: Arc<Storage>,
}

impl Crawler {
    pub fn new(http_client: reqwest::Client, storage: Arc<Storage>) -> Self {
        Crawler {
            http_client,
            parser: Parser::new(),
            storage,
        }
    }

    /// Crawl a web source: breadth-first over same-domain links matching
    /// `follow_regexp`, at most `cfg.threads` fetches in flight, link depth
    /// bounded by `cfg.depth` (0 = unbounded). A failed root fetch aborts
    /// the source; everything downstream is logged and skipped.
    pub async fn crawl_source_url(&self, cfg: &SourceConfig) -> Result<()> {
        let follow = Regex::new(&cfg.follow_regexp)
            .with_context(|| format!("bad follow_regexp for source {}", cfg.url))?;
        let base = Url::parse(&cfg.url).with_context(|| format!("bad source url {}", cfg.url))?;
        let domain = base.host_str().unwrap_or_default().to_string();
        let parallelism = cfg.threads.max(1);

        info!(
            "Starting crawl of {} (depth: {}, threads: {})",
            cfg.url, cfg.depth, parallelism
        );

        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        visited.insert(cfg.url.clone());
        queue.push_back((cfg.url.clone(), 1));

        let mut pages = 0usize;
        let mut saved = 0usize;

        while !queue.is_empty() {
            let batch: Vec<(String, usize)> = queue.drain(..).collect();
            let fetched: Vec<(String, usize, Result<String, reqwest::Error>)> =
                stream::iter(batch)
                    .map(|(url, depth)| {
                        let client = self.http_client.clone();
                        let delay = politeness_delay(cfg);
                        async move {
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            debug!("Visiting {}", url);
                            let body = fetch(&client, &url).await;
                            (url, depth, body)
                        }
                    })
                    .buffer_unordered(parallelism)
                    .collect()
                    .await;

            // Pages are parsed one at a time: extraction and persistence stay
            // serialized even while fetches overlap.
            for (url, depth, result) in fetched {
                let body = match result {
                    Ok(body) => body,
                    Err(e) if depth == 1 => {
                        bail!("failed to fetch source root {url}: {e}");
                    }
                    Err(e) => {
                        debug!("{} - {}", url, e);
                        continue;
                    }
                };
                pages += 1;
                saved += self.scrape_page(&body, &url, cfg);
                if cfg.depth == 0 || depth < cfg.depth {
                    for link in collect_links(&body, &url, &domain, &follow) {
                        if visited.insert(link.clone()) {
                            queue.push_back((link, depth + 1));
                        }
                    }
                }
            }
        }

        info!(
            "Crawl of {} completed: {} pages visited, {} proxies saved",
            cfg.url, pages, saved
        );
        Ok(())
    }

    /// Visit every file in the parent directory of `cfg.dir`, feeding each
    /// through the same parse-and-save path. A file read failure aborts the
    /// source; parse failures are logged and skipped.
    pub async fn crawl_source_dir(&self, cfg: &SourceConfig) -> Result<()> {
        let configured = Path::new(&cfg.dir);
        let dir = match configured.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("failed to list source dir {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();

        let mut saved = 0usize;
        for path in &files {
            let url = format!("file://{}", path.display());
            debug!("Visiting {}", url);
            let body = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read source file {}", path.display()))?;
            saved += self.scrape_page(&body, &url, cfg);
        }

        info!(
            "Dir source {} completed: {} files visited, {} proxies saved",
            dir.display(),
            files.len(),
            saved
        );
        Ok(())
    }

    /// Parse one fetched page and persist every extracted proxy. Returns the
    /// number of rows saved; a save failure never aborts the crawl.
    fn scrape_page(&self, body: &str, url: &str, cfg: &SourceConfig) -> usize {
        let proxies = match self.parser.parse(body, url, cfg) {
            Ok(proxies) => proxies,
            Err(e) => {
                error!("failed to parse {}: {e:#}", url);
                return 0;
            }
        };
        let mut saved = 0;
        for proxy in &proxies {
            match self.storage.save(proxy) {
                Ok(()) => saved += 1,
                Err(e) => warn!("failed to save {}:{}: {e:#}", proxy.host, proxy.port),
            }
        }
        saved
    }
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<String, reqwest::Error> {
    let resp = client.get(url).send().await?.error_for_status()?;
    resp.text().await
}

/// `<a href>` targets on the page that match `follow` and stay on `domain`.
/// Unresolvable links are dropped with a debug log.
fn collect_links(body: &str, page_url: &str, domain: &str, follow: &Regex) -> Vec<String> {
    let Ok(base) = Url::parse(page_url) else {
        return Vec::new();
    };
    let Ok(css) = scraper::Selector::parse("a[href]") else {
        return Vec::new();
    };

    let doc = Html::parse_document(body);
    let mut links = Vec::new();
    for element in doc.select(&css) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        if !follow.is_match(href) {
            continue;
        }
        let Ok(resolved) = base.join(href) else {
            debug!("{} - unresolvable link", href);
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        if resolved.host_str() != Some(domain) {
            continue;
        }
        links.push(resolved.to_string());
    }
    links
}

fn politeness_delay(cfg: &SourceConfig) -> Duration {
    let mut delay = cfg.delay;
    if !cfg.random_delay.is_zero() {
        delay += cfg.random_delay.mul_f64(rand::random::<f64>());
    }
    delay
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{Selector, Target};
    use std::collections::BTreeMap;

    fn follow_all() -> Regex {
        Regex::new(".*").unwrap()
    }

    #[test]
    fn collect_links_follows_matching_same_domain_hrefs() {
        let body = r#"
            <a href="/list?page=2">next</a>
            <a href="https://proxies.example.com/list?page=3">3</a>
            <a href="https://elsewhere.example.net/list?page=4">offsite</a>
            <a href="/about">about</a>
            <a href="mailto:ops@example.com">mail</a>
        "#;
        let follow = Regex::new(r"/list\?page=\d+").unwrap();
        let links = collect_links(
            body,
            "https://proxies.example.com/list",
            "proxies.example.com",
            &follow,
        );
        assert_eq!(
            links,
            vec![
                "https://proxies.example.com/list?page=2".to_string(),
                "https://proxies.example.com/list?page=3".to_string(),
            ]
        );
    }

    #[test]
    fn collect_links_drops_non_http_schemes() {
        let body = r#"<a href="javascript:void(0)">x</a><a href="ftp://proxies.example.com/f">y</a>"#;
        let links = collect_links(
            body,
            "https://proxies.example.com/",
            "proxies.example.com",
            &follow_all(),
        );
        assert!(links.is_empty());
    }

    #[test]
    fn politeness_delay_stays_within_bounds() {
        let cfg = SourceConfig {
            delay: Duration::from_millis(100),
            random_delay: Duration::from_millis(50),
            ..SourceConfig::default()
        };
        for _ in 0..32 {
            let d = politeness_delay(&cfg);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }

        let fixed = SourceConfig {
            delay: Duration::from_millis(20),
            ..SourceConfig::default()
        };
        assert_eq!(politeness_delay(&fixed), Duration::from_millis(20));
    }

    #[tokio::test]
    async fn dir_source_parses_every_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("page1.html"),
            "<ul><li class=\"addr\">10.0.0.1:8080</li></ul>",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("page2.html"),
            "<ul><li class=\"addr\">10.0.0.2:3128</li></ul>",
        )
        .unwrap();

        let cfg = SourceConfig {
            dir: dir.path().join("*").display().to_string(),
            selectors: vec![Selector {
                target: Target::Address,
                enable_validation: false,
                selector: "li.addr".to_string(),
                filter_regexp: None,
                mapping: BTreeMap::new(),
                array: Vec::new(),
            }],
            ..SourceConfig::default()
        };

        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let crawler = Crawler::new(reqwest::Client::new(), Arc::clone(&storage));
        crawler.crawl_source_dir(&cfg).await.unwrap();

        assert!(storage.find("10.0.0.1", "8080").unwrap().is_some());
        assert!(storage.find("10.0.0.2", "3128").unwrap().is_some());
    }

    #[tokio::test]
    async fn dir_source_missing_directory_errors() {
        let cfg = SourceConfig {
            dir: "/nonexistent/path/*".to_string(),
            ..SourceConfig::default()
        };
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let crawler = Crawler::new(reqwest::Client::new(), storage);
        assert!(crawler.crawl_source_dir(&cfg).await.is_err());
    }
}
