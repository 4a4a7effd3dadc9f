use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use pharvest::core::config::{Config, Selector, SourceConfig, Target, ValidatorConfig};
use pharvest::proxy::{Proxy, STATUS_NEED_SCAN, STATUS_OK};
use pharvest::{Crawler, Harvester, Parser, Storage, Validator};

fn validator_cfg() -> ValidatorConfig {
    ValidatorConfig {
        host: "probe.example.com".to_string(),
        path: "/stamp".to_string(),
        timeout: Duration::from_secs(1),
        number_of_requests: 1,
        threads: 2,
    }
}

fn address_source() -> SourceConfig {
    SourceConfig {
        url: "https://proxies.example.com/list".to_string(),
        selectors: vec![Selector {
            target: Target::Address,
            enable_validation: true,
            selector: "li.addr".to_string(),
            filter_regexp: None,
            mapping: BTreeMap::new(),
            array: Vec::new(),
        }],
        ..SourceConfig::default()
    }
}

fn harvester_over(storage: &Arc<Storage>, cfg: Config) -> Harvester {
    let crawler = Crawler::new(reqwest::Client::new(), Arc::clone(storage));
    let validator = Arc::new(Validator::new(
        cfg.validator_config.clone(),
        Arc::clone(storage),
        CancellationToken::new(),
    ));
    Harvester::new(cfg, crawler, validator, Arc::clone(storage))
}

#[tokio::test]
async fn parsed_proxies_flow_through_store_and_scheduler() {
    let page = r#"
        <html><body><ul>
            <li class="addr">10.0.0.1:8080</li>
            <li class="addr">10.0.0.2:3128</li>
        </ul></body></html>
    "#;
    let cfg = address_source();
    let storage = Arc::new(Storage::open_in_memory().unwrap());

    let proxies = Parser::new().parse(page, &cfg.url, &cfg).unwrap();
    assert_eq!(proxies.len(), 2);
    for proxy in &proxies {
        assert_eq!(proxy.source, cfg.url);
        storage.save(proxy).unwrap();
    }

    // Fresh rows carry an epoch last_check, so both are immediately due.
    let due = storage.load_validation_bunch(10).unwrap();
    assert_eq!(due.len(), 2);

    // The parsed rows have no protocol column, so the first validation
    // cannot build a client and parks the proxy in NEED_SCAN.
    let validator = Validator::new(
        validator_cfg(),
        Arc::clone(&storage),
        CancellationToken::new(),
    );
    validator.validate(due[0].clone()).await;

    let parked = storage.find(&due[0].host, &due[0].port).unwrap().unwrap();
    assert_eq!(parked.status, STATUS_NEED_SCAN);
    assert_eq!(parked.check_number, 1);

    // NEED_SCAN never comes back out of the scheduler.
    let remaining = storage.load_validation_bunch(10).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_ne!(remaining[0].host, parked.host);
}

#[tokio::test]
async fn import_round_trips_persisted_fields() {
    let proxy = Proxy {
        host: "10.1.2.3".to_string(),
        port: "1080".to_string(),
        protocol: "socks5".to_string(),
        country: "NL".to_string(),
        source: "https://proxies.example.com/list".to_string(),
        score: 45,
        status: STATUS_OK,
        username: "user".to_string(),
        password: "secret".to_string(),
        last_check: Utc.timestamp_nanos(1_700_000_000_123_456_789),
        check_number: 12,
        avg_ping_timing: Duration::from_millis(35),
        avg_request_timing: Duration::from_millis(210),
        avg_response_timing: Duration::from_millis(480),
        created_at: Utc.timestamp_nanos(1_690_000_000_000_000_000),
    };

    let dir = tempfile::tempdir().unwrap();
    let import_path = dir.path().join("seed.yml");
    let raw = serde_yaml::to_string(&vec![proxy.clone()]).unwrap();
    std::fs::write(&import_path, raw).unwrap();

    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let cfg = Config {
        import_file_path: Some(import_path.display().to_string()),
        validator_config: validator_cfg(),
        source_configs: Vec::new(),
    };
    let harvester = harvester_over(&storage, cfg);
    harvester
        .import_from_file(&import_path.display().to_string())
        .await
        .unwrap();

    let stored = storage.find("10.1.2.3", "1080").unwrap().unwrap();
    assert_eq!(stored, proxy);
}

#[tokio::test]
async fn import_decode_error_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let import_path = dir.path().join("seed.yml");
    std::fs::write(&import_path, "host: not-a-list\n").unwrap();

    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let cfg = Config {
        import_file_path: Some(import_path.display().to_string()),
        validator_config: validator_cfg(),
        source_configs: Vec::new(),
    };
    let harvester = harvester_over(&storage, cfg);
    let err = harvester
        .import_from_file(&import_path.display().to_string())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to decode import file"));
}

#[tokio::test]
async fn selector_validation_failure_surfaces_from_the_parser() {
    let cfg = address_source();
    // The page has nothing the validated selector can match.
    let err = Parser::new()
        .parse("<html><body></body></html>", &cfg.url, &cfg)
        .unwrap_err();
    assert!(err.to_string().contains("li.addr"));
}
