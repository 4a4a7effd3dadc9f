use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration, read once at startup from a YAML or JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Optional YAML file of proxy records to upsert before crawling.
    #[serde(default)]
    pub import_file_path: Option<String>,
    pub validator_config: ValidatorConfig,
    #[serde(default)]
    pub source_configs: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    /// Origin the probes are pointed at.
    pub host: String,
    /// URL path appended to each probe scheme.
    pub path: String,
    /// Per-probe request timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Probe requests per scheme per proxy per run.
    pub number_of_requests: usize,
    /// Global probe concurrency cap.
    pub threads: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub skip: bool,
    /// Fixed politeness delay before each request.
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    /// Upper bound of extra random jitter added to `delay`.
    #[serde(with = "humantime_serde")]
    pub random_delay: Duration,
    pub threads: usize,

    pub url: String,
    pub depth: usize,
    pub follow_regexp: String,
    pub selectors: Vec<Selector>,
    /// Non-empty selects the file-based source: every file in the parent
    /// directory of this path is visited instead of crawling `url`.
    pub dir: String,
}

/// Record field a selector feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum Target {
    Host,
    Port,
    Protocol,
    Address,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Selector {
    pub target: Target,
    /// When set, an empty or non-matching extraction is a hard error
    /// instead of a silently empty result.
    #[serde(default)]
    pub enable_validation: bool,
    /// CSS selector locating the elements to read.
    pub selector: String,
    #[serde(default)]
    pub filter_regexp: Option<String>,
    /// Replace rules (pattern -> replacement) applied to element text
    /// before filtering, in key order.
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub array: Vec<String>,
}

impl Config {
    /// Load from `path`, dispatching on the file extension
    /// (`.yml`/`.yaml` vs `.json`).
    pub fn load(path: &Path) -> Result<Config> {
        let extension = path.extension().and_then(|e| e.to_str());
        if !matches!(extension, Some("yml") | Some("yaml") | Some("json")) {
            bail!(
                "unsupported config extension {:?} for {} (expected .yml, .yaml or .json)",
                extension.unwrap_or(""),
                path.display()
            );
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let cfg = if extension == Some("json") {
            serde_json::from_str(&contents)
                .with_context(|| format!("failed to parse {} as JSON", path.display()))?
        } else {
            serde_yaml::from_str(&contents)
                .with_context(|| format!("failed to parse {} as YAML", path.display()))?
        };
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yaml_config() {
        let raw = r#"
import_file_path: seed.yml
validator_config:
  host: probe.example.com
  path: /stamp
  timeout: 10s
  number_of_requests: 2
  threads: 16
source_configs:
  - delay: 500ms
    random_delay: 1s
    threads: 4
    url: https://proxies.example.com/list
    depth: 2
    follow_regexp: "/list\\?page=\\d+"
    selectors:
      - target: Address
        enable_validation: true
        selector: "td.address"
        mapping:
          "\\s+": ""
"#;
        let cfg: Config = serde_yaml::from_str(raw).unwrap();
        assert_eq!(cfg.import_file_path.as_deref(), Some("seed.yml"));
        assert_eq!(cfg.validator_config.timeout, Duration::from_secs(10));
        assert_eq!(cfg.validator_config.number_of_requests, 2);
        assert_eq!(cfg.source_configs.len(), 1);

        let source = &cfg.source_configs[0];
        assert!(!source.skip);
        assert_eq!(source.delay, Duration::from_millis(500));
        assert_eq!(source.random_delay, Duration::from_secs(1));
        assert_eq!(source.depth, 2);

        let selector = &source.selectors[0];
        assert_eq!(selector.target, Target::Address);
        assert!(selector.enable_validation);
        assert_eq!(selector.mapping.get("\\s+").map(String::as_str), Some(""));
    }

    #[test]
    fn parses_json_config() {
        let raw = r#"{
            "validator_config": {
                "host": "probe.example.com",
                "path": "/",
                "timeout": "5s",
                "number_of_requests": 1,
                "threads": 8
            },
            "source_configs": [
                {"skip": true, "url": "https://example.com", "selectors": []}
            ]
        }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert!(cfg.import_file_path.is_none());
        assert!(cfg.source_configs[0].skip);
        assert_eq!(cfg.validator_config.threads, 8);
    }

    #[test]
    fn unknown_target_is_rejected() {
        let raw = r#"
target: Hostname
selector: "td"
"#;
        assert!(serde_yaml::from_str::<Selector>(raw).is_err());
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let err = Config::load(Path::new("config.toml")).unwrap_err();
        assert!(err.to_string().contains("unsupported config extension"));
    }
}
