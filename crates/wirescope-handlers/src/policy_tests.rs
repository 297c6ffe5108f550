//! Policy scenarios run against the mock input and the net/dns handlers

use serde_json::{json, Value};
use std::time::Duration;
use wirescope_core::config::parse_document;
use wirescope_core::{
    CoreError, CoreRegistry, ErrorKind, InputAttachment, Module, ModuleConfig, PluginRegistry,
    StreamHandler,
};

const POLICIES: &str = r#"
version: "1.0"

wirescope:
  taps:
    anycast:
      input_type: mock
      config:
        iface: eth0
  policies:
    default_view:
      kind: collection
      input:
        tap: anycast
        input_type: mock
        config:
          sample: value
        filter:
          bpf: "tcp or udp"
      handlers:
        window_config:
          num_periods: 5
          deep_sample_rate: 100
        modules:
          default_net:
            type: net
          default_dns:
            type: dns
          special_domain:
            type: dns
            filter:
              only_qname_suffix:
                - ".google.com"
                - ".ns1.com"
                - "slack.com"
"#;

const POLICIES_SEQUENCE: &str = r#"
version: "1.0"

wirescope:
  taps:
    anycast:
      input_type: mock
      config:
        iface: eth0
  policies:
    default_view:
      kind: collection
      input:
        tap: anycast
        input_type: mock
        config:
          sample: value
      handlers:
        window_config:
          num_periods: 5
          deep_sample_rate: 100
        modules:
          - default_dns:
            type: dns
            config:
              in_key: in_value
          - default_net:
            type: net
"#;

const POLICIES_SAME_INPUT: &str = r#"
version: "1.0"

wirescope:
  policies:
    same_input:
      kind: collection
      input:
        tap: anycast
        input_type: mock
        config:
          sample: value
        filter:
          bpf: "tcp or udp"
      handlers:
        window_config:
          num_periods: 5
          deep_sample_rate: 100
        modules:
          net:
            type: net
"#;

const TAPS_ONLY: &str = r#"
version: "1.0"

wirescope:
  taps:
    anycast:
      input_type: mock
      config:
        iface: eth0
"#;

fn registry() -> CoreRegistry {
    let mut plugins = PluginRegistry::new();
    wirescope_capture::register(&mut plugins);
    crate::register(&mut plugins);
    CoreRegistry::new(plugins)
}

/// Registry with the `anycast` tap loaded
async fn registry_with_tap() -> CoreRegistry {
    let registry = registry();
    registry.configure_from_str(TAPS_ONLY).await.unwrap();
    registry
}

fn policies_of(document: &str) -> Value {
    parse_document(document).unwrap().policies.unwrap()
}

/// A `default_view` policy on the `anycast` tap with the given input and handlers sections
fn default_view(input: Value, handlers: Value) -> Value {
    let mut policy = json!({"kind": "collection", "input": input});
    if !handlers.is_null() {
        policy["handlers"] = handlers;
    }
    json!({ "default_view": policy })
}

async fn load_err(registry: &CoreRegistry, policies: &Value) -> CoreError {
    registry
        .policy_manager()
        .load(policies)
        .await
        .unwrap_err()
}

#[tokio::test]
async fn test_happy_path() {
    let registry = registry();
    registry.configure_from_str(POLICIES).await.unwrap();

    let policies = registry.policy_manager();
    assert!(policies.module_exists("default_view"));
    let policy = policies.module_get_locked("default_view").await.unwrap();
    assert_eq!(policy.name(), "default_view");

    let input_name = policy.input_name().to_string();
    assert!(input_name.starts_with("anycast-"));
    assert_eq!(input_name.len(), "anycast-".len() + 16);
    {
        let input = policy.input_stream().lock().await;
        assert_eq!(input.name(), input_name);
        assert_eq!(input.config().get_string("bpf").as_deref(), Some("tcp or udp"));
        assert_eq!(input.config().get_string("sample").as_deref(), Some("value"));
        assert_eq!(input.config().get_string("iface").as_deref(), Some("eth0"));
        assert!(input.running());
    }

    assert_eq!(
        policy.module_names(),
        [
            "default_view-default_net".to_string(),
            "default_view-default_dns".to_string(),
            "default_view-special_domain".to_string(),
        ]
    );
    for handler in policy.modules() {
        let handler = handler.lock().await;
        assert!(handler.running());
        assert_eq!(handler.config().get_u64("num_periods"), Some(5));
    }
    let special = policy.modules()[2].lock().await;
    assert_eq!(
        special.config().get_string_list("only_qname_suffix").unwrap()[0],
        ".google.com"
    );
}

#[tokio::test]
async fn test_sequence_modules() {
    let registry = registry();
    registry.configure_from_str(POLICIES_SEQUENCE).await.unwrap();

    let policy = registry
        .policy_manager()
        .module_get_locked("default_view")
        .await
        .unwrap();
    assert!(policy.input_name().starts_with("anycast-"));
    assert_eq!(
        policy.module_names(),
        [
            "default_view-default_dns".to_string(),
            "default_view-default_net".to_string(),
        ]
    );

    let dns = policy.modules()[0].lock().await;
    assert!(dns.running());
    assert_eq!(dns.upstream(), None);
    assert_eq!(dns.config().get_string("in_key").as_deref(), Some("in_value"));
    drop(dns);

    let net = policy.modules()[1].lock().await;
    assert!(net.running());
    assert_eq!(net.upstream(), Some("default_view-default_dns"));
}

#[tokio::test]
async fn test_sequence_and_map_get_distinct_inputs() {
    let registry = registry();
    registry.configure_from_str(POLICIES).await.unwrap();

    let sequence = policies_of(POLICIES_SEQUENCE);
    let renamed = json!({"seq_view": sequence["default_view"].clone()});
    registry.policy_manager().load(&renamed).await.unwrap();

    // Different filter, different effective config
    assert_eq!(registry.input_manager().streams().len(), 2);
}

#[tokio::test]
async fn test_duplicate() {
    let registry = registry();
    registry.configure_from_str(POLICIES).await.unwrap();

    let err = load_err(&registry, &policies_of(POLICIES)).await;
    assert_eq!(err.kind(), ErrorKind::NameConflict);
    assert_eq!(err.to_string(), "policy with name 'default_view' already defined");

    let policy = registry
        .policy_manager()
        .module_get_locked("default_view")
        .await
        .unwrap();
    assert_eq!(policy.name(), "default_view");
    assert!(policy.running());
}

#[tokio::test]
async fn test_bad_config_not_a_map() {
    let registry = registry();
    let err = load_err(&registry, &json!({"missing": null})).await;
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    assert_eq!(err.to_string(), "expecting policy configuration map");

    let err = load_err(&registry, &json!(["default_view"])).await;
    assert_eq!(err.to_string(), "expecting policy configuration map");
}

#[tokio::test]
async fn test_invalid_tap() {
    let registry = registry();
    let err = load_err(
        &registry,
        &default_view(json!({"tap": "nonexist", "input_type": "mock"}), Value::Null),
    )
    .await;
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.to_string(), "tap 'nonexist' does not exist");
}

#[tokio::test]
async fn test_invalid_input_filter() {
    let registry = registry_with_tap().await;
    let err = load_err(
        &registry,
        &default_view(
            json!({"tap": "anycast", "input_type": "mock", "filter": {"bpf": {"badmap": "bad value"}}}),
            Value::Null,
        ),
    )
    .await;
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    assert_eq!(
        err.to_string(),
        "invalid input filter for tap 'anycast': invalid value for key: bpf"
    );
    assert!(registry.input_manager().streams().is_empty());
}

#[tokio::test]
async fn test_exception_on_input_start() {
    let registry = registry_with_tap().await;
    let err = load_err(
        &registry,
        &default_view(
            json!({"tap": "anycast", "input_type": "mock", "config": {"except_on_start": true}}),
            json!({"modules": {"default_net": {"type": "net"}}}),
        ),
    )
    .await;
    assert_eq!(err.kind(), ErrorKind::RuntimeStartFailure);
    assert_eq!(
        err.to_string(),
        "policy [default_view] failed to start: mock error on start"
    );
    assert!(!registry.policy_manager().module_exists("default_view"));
    assert!(registry.input_manager().streams().is_empty());
    assert!(registry.handler_manager().handlers().is_empty());
}

#[tokio::test]
async fn test_mismatched_input_type() {
    let registry = registry_with_tap().await;
    let err = load_err(
        &registry,
        &default_view(json!({"tap": "anycast", "input_type": "wrong_type"}), Value::Null),
    )
    .await;
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    assert_eq!(
        err.to_string(),
        "unable to instantiate tap 'anycast': input_type for policy specified tap 'anycast' doesn't match tap's defined input type: wrong_type/mock"
    );
}

#[tokio::test]
async fn test_bad_policy_kind() {
    let registry = registry_with_tap().await;
    let err = load_err(
        &registry,
        &json!({"default_view": {"kind": "unknown_kind", "input": {"tap": "anycast"}}}),
    )
    .await;
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    assert_eq!(err.to_string(), "unknown policy kind: unknown_kind");
}

#[tokio::test]
async fn test_unavailable_handler_type() {
    let registry = registry_with_tap().await;
    let err = load_err(
        &registry,
        &default_view(
            json!({"tap": "anycast", "input_type": "mock"}),
            json!({"window_config": {"num_periods": 5}, "modules": {"default_net": {"type": "net2"}}}),
        ),
    )
    .await;
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(
        err.to_string(),
        "Policy 'default_view' requires stream handler type 'net2' which is not available"
    );
    assert!(registry.input_manager().streams().is_empty());
}

#[tokio::test]
async fn test_handler_without_type() {
    let registry = registry_with_tap().await;
    let err = load_err(
        &registry,
        &default_view(
            json!({"tap": "anycast", "input_type": "mock"}),
            json!({"modules": {"default_net": {"type": "net"}, "default_dns": {"config": "dns"}}}),
        ),
    )
    .await;
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    assert_eq!(
        err.to_string(),
        "missing or invalid stream handler type at key 'type'"
    );
    assert!(registry.input_manager().streams().is_empty());
    assert!(registry.handler_manager().handlers().is_empty());
}

#[tokio::test]
async fn test_handler_config_not_a_map() {
    let registry = registry_with_tap().await;
    let err = load_err(
        &registry,
        &default_view(
            json!({"tap": "anycast", "input_type": "mock"}),
            json!({"modules": {
                "default_net": {"type": "net"},
                "default_dns": {"type": "dns", "config": "not_a_map"}
            }}),
        ),
    )
    .await;
    assert_eq!(err.to_string(), "stream handler configuration is not a map");
}

#[tokio::test]
async fn test_invalid_chain_order() {
    let registry = registry_with_tap().await;
    let err = load_err(
        &registry,
        &default_view(
            json!({"tap": "anycast", "input_type": "mock"}),
            json!({"modules": [
                {"default_net": null, "type": "net"},
                {"default_dns": null, "type": "dns"}
            ]}),
        ),
    )
    .await;
    assert_eq!(err.kind(), ErrorKind::ChainIncompatible);
    assert_eq!(
        err.to_string(),
        "DnsStreamHandler: unsupported upstream chained stream handler default_view-default_net"
    );
    assert!(!registry.policy_manager().module_exists("default_view"));
    assert!(registry.handler_manager().handlers().is_empty());
    assert!(registry.input_manager().streams().is_empty());
}

#[test]
fn test_mixed_modules_yaml_is_rejected() {
    let document = r#"
version: "1.0"
wirescope:
  policies:
    default_view:
      kind: collection
      handlers:
        modules:
           default_dns:
            type: dns
          - default_net:
            type: net
"#;
    assert!(parse_document(document).is_err());
}

#[tokio::test]
async fn test_roll_back() {
    let registry = registry_with_tap().await;

    // Force a roll back with a handler name the policy will want
    let attachment = InputAttachment {
        name: "mymock".to_string(),
        input_type: "mock".to_string(),
        events: wirescope_core::event_bus(),
    };
    let conflicting = registry
        .plugins()
        .handler("net")
        .unwrap()
        .instantiate("default_view-default_net", &attachment, &ModuleConfig::new(), None)
        .unwrap();
    registry
        .handler_manager()
        .handlers()
        .add(conflicting)
        .unwrap();

    let err = load_err(&registry, &policies_of(POLICIES)).await;
    assert_eq!(err.kind(), ErrorKind::NameConflict);
    assert_eq!(
        err.to_string(),
        "policy [default_view] creation failed (handler: default_view-default_net): module name 'default_view-default_net' already exists"
    );

    assert!(!registry.policy_manager().module_exists("default_view"));
    assert!(registry.input_manager().streams().is_empty());
    assert_eq!(
        registry.handler_manager().handlers().names(),
        vec!["default_view-default_net"]
    );
}

#[tokio::test]
async fn test_stop() {
    let registry = registry();
    registry.configure_from_str(POLICIES).await.unwrap();

    let mut policy = registry
        .policy_manager()
        .module_get_locked("default_view")
        .await
        .unwrap();
    assert!(policy.input_stream().lock().await.running());

    policy.stop().await.unwrap();
    assert!(!policy.running());
    assert!(!policy.input_stream().lock().await.running());
    for handler in policy.modules() {
        assert!(!handler.lock().await.running());
    }

    // Idempotent
    policy.stop().await.unwrap();
    assert!(!policy.running());
    policy.release();

    registry
        .policy_manager()
        .remove_policy("default_view")
        .await
        .unwrap();
    assert!(registry.handler_manager().handlers().is_empty());
}

#[tokio::test]
async fn test_remove_policy_and_add_again() {
    let registry = registry();
    registry.configure_from_str(POLICIES).await.unwrap();
    let policies = policies_of(POLICIES);

    let first_input = {
        let policy = registry
            .policy_manager()
            .module_get_locked("default_view")
            .await
            .unwrap();
        assert!(policy.running());
        policy.input_name().to_string()
    };

    registry
        .policy_manager()
        .remove_policy("default_view")
        .await
        .unwrap();
    assert!(!registry.policy_manager().module_exists("default_view"));
    assert!(!registry.input_manager().exists(&first_input));
    assert!(registry.handler_manager().handlers().is_empty());

    registry.policy_manager().load(&policies).await.unwrap();
    let policy = registry
        .policy_manager()
        .module_get_locked("default_view")
        .await
        .unwrap();
    assert_eq!(policy.input_name(), first_input);
    assert!(policy.input_stream().lock().await.running());
    for handler in policy.modules() {
        assert!(handler.lock().await.running());
    }
    policy.release();

    registry
        .policy_manager()
        .remove_policy("default_view")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_policies_share_input() {
    let registry = registry();
    registry.configure_from_str(POLICIES).await.unwrap();
    registry.configure_from_str(POLICIES_SAME_INPUT).await.unwrap();

    let first = registry
        .policy_manager()
        .module_get_locked("default_view")
        .await
        .unwrap()
        .input_name()
        .to_string();
    let second = registry
        .policy_manager()
        .module_get_locked("same_input")
        .await
        .unwrap()
        .input_name()
        .to_string();
    assert_eq!(first, second);
    assert_eq!(registry.input_manager().streams().len(), 1);

    // Removing one policy leaves the shared input running for the other
    registry
        .policy_manager()
        .remove_policy("default_view")
        .await
        .unwrap();
    let input = registry
        .input_manager()
        .streams()
        .get_locked(&second)
        .await
        .unwrap();
    assert!(input.running());
    assert_eq!(input.policies(), ["same_input"]);
}

#[tokio::test]
async fn test_traffic_reaches_chained_handlers() {
    let registry = registry_with_tap().await;
    registry
        .policy_manager()
        .load(&default_view(
            json!({"tap": "anycast", "config": {"interval_ms": 5}}),
            json!({"modules": [
                {"dns": {"type": "dns", "filter": {"only_qname_suffix": [".google.com"]}}},
                {"net": {"type": "net"}}
            ]}),
        ))
        .await
        .unwrap();

    let handlers = registry.handler_manager().handlers();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let net_packets = handlers
            .with_locked("default_view-net", |h| {
                h.window_json(0).unwrap()["metrics"]["packets"]["total"]
                    .as_u64()
                    .unwrap_or_default()
            })
            .await
            .unwrap();
        if net_packets > 0 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no traffic reached the net handler");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Only DNS packets for google names pass the dns handler on to net
    let info = handlers
        .with_locked("default_view-net", |h| h.info_json())
        .await
        .unwrap();
    assert_eq!(info["window"]["metrics"]["packets"]["tcp"], 0);
    let dns = handlers
        .with_locked("default_view-dns", |h| h.window_json(0).unwrap())
        .await
        .unwrap();
    let top = dns["metrics"]["top_qname"].as_array().unwrap();
    assert!(top
        .iter()
        .all(|q| q["name"].as_str().unwrap().ends_with(".google.com")));

    registry.teardown().await;
    assert!(registry.input_manager().streams().is_empty());
}

#[tokio::test]
async fn test_stopped_policy_survives_sibling_removal() {
    let registry = registry();
    registry.configure_from_str(POLICIES).await.unwrap();
    registry
        .policy_manager()
        .load(&policies_of(POLICIES_SAME_INPUT))
        .await
        .unwrap();
    assert_eq!(registry.input_manager().streams().len(), 1);

    let mut view = registry
        .policy_manager()
        .module_get_locked("default_view")
        .await
        .unwrap();
    view.stop().await.unwrap();
    let input_name = view.input_name().to_string();
    view.release();

    registry
        .policy_manager()
        .remove_policy("same_input")
        .await
        .unwrap();
    {
        let input = registry
            .input_manager()
            .streams()
            .get_locked(&input_name)
            .await
            .unwrap();
        assert!(!input.running());
        assert_eq!(input.policies(), ["default_view"]);
    }

    let mut view = registry
        .policy_manager()
        .module_get_locked("default_view")
        .await
        .unwrap();
    view.start().await.unwrap();
    view.release();

    // a policy with the same fingerprint joins the restarted instance
    registry
        .policy_manager()
        .load(&policies_of(POLICIES_SAME_INPUT))
        .await
        .unwrap();
    assert_eq!(registry.input_manager().streams().names(), vec![input_name.clone()]);
    let input = registry
        .input_manager()
        .streams()
        .get_locked(&input_name)
        .await
        .unwrap();
    assert!(input.running());
    assert_eq!(input.policies(), ["default_view", "same_input"]);
    input.release();

    registry.teardown().await;
}

#[tokio::test]
async fn test_concurrent_loads_and_removal_keep_input_consistent() {
    let registry = std::sync::Arc::new(registry());
    registry.configure_from_str(POLICIES).await.unwrap();

    let policy = |name: &str| {
        let mut policies = policies_of(POLICIES_SAME_INPUT);
        let mut config = serde_json::Map::new();
        config.insert(name.to_string(), policies["same_input"].take());
        Value::Object(config)
    };

    let mut tasks = Vec::new();
    for i in 0..4 {
        let registry = registry.clone();
        let config = policy(&format!("view_{}", i));
        tasks.push(tokio::spawn(async move {
            registry.policy_manager().load(&config).await.map(|_| ())
        }));
    }
    for _ in 0..3 {
        let registry = registry.clone();
        let config = policy("dup");
        tasks.push(tokio::spawn(async move {
            registry.policy_manager().load(&config).await.map(|_| ())
        }));
    }
    {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            registry.policy_manager().remove_policy("default_view").await
        }));
    }

    let mut failures = Vec::new();
    for task in tasks {
        if let Err(e) = task.await.unwrap() {
            failures.push(e.to_string());
        }
    }
    assert_eq!(failures, vec!["policy with name 'dup' already defined".to_string(); 2]);

    let names = registry.input_manager().streams().names();
    assert_eq!(names.len(), 1);
    let input = registry
        .input_manager()
        .streams()
        .get_locked(&names[0])
        .await
        .unwrap();
    assert!(input.running());
    let mut holders = input.policies();
    holders.sort();
    assert_eq!(holders, ["dup", "view_0", "view_1", "view_2", "view_3"]);
    input.release();

    registry.teardown().await;
    assert!(registry.input_manager().streams().is_empty());
}

#[tokio::test]
async fn test_settings_window_defaults_reach_handlers() {
    let registry = registry();
    registry
        .configure_from_str(
            r#"
version: "1.0"

wirescope:
  config:
    periods: 3
    max_deep_sample: 40
  taps:
    anycast:
      input_type: mock
  policies:
    defaults_only:
      kind: collection
      input:
        tap: anycast
      handlers:
        modules:
          net:
            type: net
    overridden:
      kind: collection
      input:
        tap: anycast
      handlers:
        window_config:
          num_periods: 2
        modules:
          net:
            type: net
"#,
        )
        .await
        .unwrap();

    let handlers = registry.handler_manager().handlers();
    let window = handlers.get_locked("defaults_only-net").await.unwrap().info_json()["window"].clone();
    assert_eq!(window["num_periods"], 3);
    assert_eq!(window["deep_sample_rate"], 40);

    let window = handlers.get_locked("overridden-net").await.unwrap().info_json()["window"].clone();
    assert_eq!(window["num_periods"], 2);
    assert_eq!(window["deep_sample_rate"], 40);

    registry.teardown().await;
}
