use std::collections::HashMap;
use std::sync::LazyLock;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use regex::Regex;
use scraper::Html;
use tracing::{debug, info};

use crate::core::config::{Selector, SourceConfig, Target};
use crate::proxy::Proxy;

static IP_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b")
        .unwrap()
});
static PORT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([1-9]|[1-5]?[0-9]{2,4}|6[1-4][0-9]{3}|65[1-4][0-9]{2}|655[1-2][0-9]|6553[1-5])\b")
        .unwrap()
});
static ADDRESS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b:\b([1-9]|[1-5]?[0-9]{2,4}|6[1-4][0-9]{3}|65[1-4][0-9]{2}|655[1-2][0-9]|6553[1-5])\b")
        .unwrap()
});
static PROTOCOL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(socks4|socks5|https|http)").unwrap());
static CLEAN_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\t\r\n]+").unwrap());

/// Turns fetched pages into proxy records according to a source's selector
/// rules.
#[derive(Debug, Default)]
pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Parser
    }

    /// Parse a page body as HTML and extract proxies per `cfg.selectors`.
    pub fn parse(&self, body: &str, url: &str, cfg: &SourceConfig) -> Result<Vec<Proxy>> {
        let doc = Html::parse_document(body);
        self.extract_data(&doc, url, cfg)
    }

    /// Pivot the per-target string lists into one proxy record per row.
    ///
    /// `Address` entries are split on the last `:` into Host and Port lists;
    /// lists shorter than the Host list pad with empty strings, so the
    /// result length always equals the Host list length.
    pub fn extract_data(&self, doc: &Html, url: &str, cfg: &SourceConfig) -> Result<Vec<Proxy>> {
        let mut list_map: HashMap<Target, Vec<String>> = HashMap::new();
        for selector in &cfg.selectors {
            info!(
                "URL:{} Target:{:?} Selector:{} extracting...",
                url, selector.target, selector.selector
            );
            let list = self.extract_list(doc, selector)?;
            info!(
                "URL:{} Target:{:?} Selector:{} extracted {} elements",
                url,
                selector.target,
                selector.selector,
                list.len()
            );
            if selector.target == Target::Address {
                let mut hosts = Vec::with_capacity(list.len());
                let mut ports = Vec::with_capacity(list.len());
                for addr in &list {
                    let (host, port) = addr
                        .rsplit_once(':')
                        .ok_or_else(|| anyhow!("address {addr:?} has no port separator"))?;
                    hosts.push(host.to_string());
                    ports.push(port.to_string());
                }
                list_map.insert(Target::Host, hosts);
                list_map.insert(Target::Port, ports);
            } else {
                list_map.insert(selector.target, list);
            }
        }

        let length = list_map.get(&Target::Host).map_or(0, Vec::len);
        let mut proxies = Vec::with_capacity(length);
        for i in 0..length {
            let mut proxy = Proxy {
                source: cfg.url.clone(),
                created_at: Utc::now(),
                ..Proxy::default()
            };
            for (target, list) in &list_map {
                let value = list.get(i).map(String::as_str).unwrap_or_default();
                set_field(&mut proxy, *target, value);
            }
            proxies.push(proxy);
        }
        Ok(proxies)
    }

    /// Extract the string list for one selector rule: element text is
    /// trimmed, stripped of embedded line breaks, run through the mapping
    /// rules, then reduced to its first filter-regex match.
    pub fn extract_list(&self, doc: &Html, rule: &Selector) -> Result<Vec<String>> {
        let compiled;
        let filter: &Regex = match &rule.filter_regexp {
            Some(expr) => {
                compiled = Regex::new(expr).map_err(|e| {
                    anyhow!("bad filter_regexp for selector {}: {e}", rule.selector)
                })?;
                &compiled
            }
            None => default_filter(rule.target),
        };

        let mut mappers = Vec::with_capacity(rule.mapping.len());
        for (pattern, replacement) in &rule.mapping {
            let matcher = Regex::new(pattern)
                .map_err(|e| anyhow!("bad mapping pattern {pattern:?}: {e}"))?;
            mappers.push((matcher, replacement.as_str()));
        }

        let css = scraper::Selector::parse(&rule.selector)
            .map_err(|e| anyhow!("bad CSS selector {:?}: {e}", rule.selector))?;

        let mut data_list = Vec::new();
        for element in doc.select(&css) {
            let raw = element.text().collect::<String>();
            let mut text = CLEAN_REGEX.replace_all(raw.trim(), "").into_owned();
            for (matcher, replacement) in &mappers {
                if matcher.is_match(&text) {
                    text = matcher.replace_all(&text, *replacement).into_owned();
                }
            }
            debug!(
                "[target: {:?} | selector: '{}'] -> {}",
                rule.target, rule.selector, text
            );
            let matched = filter
                .find(&text)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            if !filter.is_match(&matched) {
                continue;
            }
            data_list.push(matched);
        }

        if rule.enable_validation {
            if data_list.is_empty() {
                bail!("no data found by selector {}", rule.selector);
            }
            for entry in &data_list {
                if !filter.is_match(entry) {
                    bail!("data {entry:?} does not match {}", filter.as_str());
                }
            }
        }
        Ok(data_list)
    }
}

fn default_filter(target: Target) -> &'static Regex {
    match target {
        Target::Host => &IP_REGEX,
        Target::Port => &PORT_REGEX,
        Target::Protocol => &PROTOCOL_REGEX,
        Target::Address => &ADDRESS_REGEX,
    }
}

/// Explicit stand-in for reflective field setting: a closed match from
/// extraction target to record field.
fn set_field(proxy: &mut Proxy, target: Target, value: &str) {
    match target {
        Target::Host => proxy.host = value.to_string(),
        Target::Port => proxy.port = value.to_string(),
        Target::Protocol => proxy.protocol = value.to_string(),
        // Address rows are pivoted into Host/Port before this point.
        Target::Address => {}
    }
}
