use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use violation_pipeline::config::PipelineConfig;
use violation_pipeline::model::BoxOrder;
use violation_pipeline::rules::RuleKind;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "VAP_CONFIG",
        "VAP_MQTT_BROKER",
        "VAP_AUDIT_DB_PATH",
        "VAP_BLOB_DIR",
        "VAP_SNAPSHOT_TOKEN",
        "VAP_LOG_ALL",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(&mut file, contents.as_bytes()).expect("write config");
    file
}

const JSON_CONFIG: &str = r#"{
    "models": {
        "Shared": {
            "confidence": 0.7,
            "allowed_classes": [1, 2],
            "timeout_ms": 1000,
            "radius_limit": 0.1
        },
        "TANK": {
            "confidence": 0.6,
            "allowed_classes": [1],
            "rules": ["Threshold", "ConfinedSpace"],
            "counted_classes": [5],
            "count_threshold": 2,
            "count_timeout_ms": 30000
        }
    },
    "classes": { "6": { "deferred": true } },
    "box_order": "ymin_xmin_ymax_xmax",
    "mqtt": { "broker": "mqtt://broker.local:1884", "topics": ["/merakimv/+/custom_analytics"] },
    "snapshot": { "url_template": "https://api.example.com/devices/{camera}/camera/generateSnapshot" },
    "notify": {
        "alert_groups": { "site-a": ["ops@example.com"] },
        "cameras": { "TANK": { "location": "Tank 3", "alert_group": "site-a" } },
        "label_map": { "5": "Worker" }
    },
    "retry": { "max_retries": 5, "base_delay_ms": 100, "max_delay_ms": 1000 },
    "eviction": { "ttl_multiplier": 4, "sweep_interval_ms": 5000 }
}"#;

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(".json", JSON_CONFIG);
    std::env::set_var("VAP_CONFIG", file.path());
    std::env::set_var("VAP_MQTT_BROKER", "10.0.0.5:1883");
    std::env::set_var("VAP_AUDIT_DB_PATH", "/var/lib/violationd/audit.db");
    std::env::set_var("VAP_LOG_ALL", "true");

    let cfg = PipelineConfig::load().expect("load config");
    clear_env();

    assert_eq!(cfg.mqtt.broker, "10.0.0.5:1883");
    assert_eq!(cfg.audit.db_path, "/var/lib/violationd/audit.db");
    assert!(cfg.audit.log_all);
    assert_eq!(cfg.box_order, BoxOrder::YminXminYmaxXmax);

    let tank = cfg.rules.camera_rule("TANK").unwrap();
    assert!(tank.runs(RuleKind::ConfinedSpace));
    assert_eq!(tank.occupancy().unwrap().required_count, 2);
    assert!(cfg.rules.resolve("CAM1", 6).unwrap().deferred);

    assert_eq!(cfg.notify.recipients("TANK"), ["ops@example.com".to_string()]);
    assert_eq!(cfg.notify.location("TANK"), "Tank 3");
    assert_eq!(cfg.notify.label_map.get(&5).map(String::as_str), Some("Worker"));

    assert_eq!(cfg.retry.max_retries, 5);
    assert_eq!(cfg.retry.base_delay, Duration::from_millis(100));
    assert_eq!(cfg.eviction.ttl_multiplier, 4);
    assert_eq!(cfg.eviction.sweep_interval, Duration::from_secs(5));

    assert!(cfg.uses("Notifier"));
    assert_eq!(cfg.topology["Inferer"], vec!["ImageRetriever", "AuditLog"]);
}

#[test]
fn loads_toml_config_with_custom_topology() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
box_order = "xmin_ymin_xmax_ymax"

[models.Shared]
confidence = 0.5
allowed_classes = [3]

[pipeline]
MqttIngest = ["Inferer"]
Inferer = ["AuditLog"]

[audit]
db_path = "audit.db"
log_all = true

[blob]
dir = "snapshots"
"#,
    );
    std::env::set_var("VAP_BLOB_DIR", "/srv/snapshots");

    let cfg = PipelineConfig::load_from(Some(file.path())).expect("load toml config");
    clear_env();

    assert_eq!(cfg.box_order, BoxOrder::XminYminXmaxYmax);
    assert_eq!(cfg.topology.len(), 2);
    assert!(!cfg.uses("ImageRetriever"));
    assert!(cfg.audit.log_all);
    assert_eq!(cfg.blob.dir, PathBuf::from("/srv/snapshots"));
    assert_eq!(cfg.mqtt.broker, "127.0.0.1:1883");
    assert_eq!(cfg.rules.camera_rule("ANY").unwrap().timeout_ms, 180_000);
}

#[test]
fn rejects_unknown_stage_names() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "models": { "Shared": { "confidence": 0.7, "allowed_classes": [1] } },
            "pipeline": { "Inferer": ["EmailNotifier"] }
        }"#,
    );
    let err = PipelineConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("EmailNotifier"), "{}", err);
}

#[test]
fn rejects_missing_snapshot_endpoint_for_default_topology() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{ "models": { "Shared": { "confidence": 0.7, "allowed_classes": [1] } } }"#,
    );
    let err = PipelineConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("url_template"), "{}", err);
}

#[test]
fn rejects_confined_space_without_counted_classes() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "models": {
                "Shared": { "confidence": 0.7, "allowed_classes": [1] },
                "TANK": {
                    "confidence": 0.6,
                    "allowed_classes": [1],
                    "rules": ["Threshold", "ConfinedSpace"],
                    "count_threshold": 2
                }
            },
            "pipeline": { "Inferer": ["AuditLog"] }
        }"#,
    );
    let err = PipelineConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("counted_classes"), "{}", err);
}

#[test]
fn rejects_bad_log_all_override() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "models": { "Shared": { "confidence": 0.7, "allowed_classes": [1] } },
            "pipeline": { "Inferer": ["AuditLog"] }
        }"#,
    );
    std::env::set_var("VAP_LOG_ALL", "sometimes");
    let result = PipelineConfig::load_from(Some(file.path()));
    clear_env();
    assert!(result.is_err());
}

#[test]
fn missing_rules_are_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let err = PipelineConfig::load_from(None).unwrap_err();
    assert!(err.to_string().contains("model rule"), "{}", err);
}
