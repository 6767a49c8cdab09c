use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dedup::EvictionPolicy;
use crate::model::BoxOrder;
use crate::pipeline::Topology;
use crate::retry::{RetryConfigFile, RetryPolicy};
use crate::rules::{ClassRule, ModelConfig, ModelRule};
use crate::stages;

const DEFAULT_MQTT_BROKER: &str = "127.0.0.1:1883";
const DEFAULT_MQTT_CLIENT_ID: &str = "violationd";
const DEFAULT_MQTT_TOPIC: &str = "/merakimv/+/custom_analytics";
const DEFAULT_CAMERA_SEGMENT: usize = 2;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
const DEFAULT_SNAPSHOT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_STROKE_WIDTH: u32 = 2;
const DEFAULT_STROKE_COLOR: [u8; 3] = [255, 0, 0];
const DEFAULT_JPEG_QUALITY: u8 = 100;
const DEFAULT_RELAY_TOPIC: &str = "violationd/mail";
const DEFAULT_SUBJECT: &str = "Violation detected on {camera} ({location})";
const DEFAULT_BODY: &str =
    "Violation detected on camera {camera} at {location}, {time}.\n{labels}\n{inference}";
const DEFAULT_BLOB_DIR: &str = "violations";
const DEFAULT_AUDIT_DB_PATH: &str = "violations.db";

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    models: Option<BTreeMap<String, ModelRule>>,
    classes: Option<BTreeMap<String, ClassRule>>,
    pipeline: Option<Topology>,
    box_order: Option<BoxOrder>,
    mqtt: Option<MqttConfigFile>,
    snapshot: Option<SnapshotConfigFile>,
    render: Option<RenderConfigFile>,
    notify: Option<NotifyConfigFile>,
    blob: Option<BlobConfigFile>,
    audit: Option<AuditConfigFile>,
    retry: Option<RetryConfigFile>,
    eviction: Option<EvictionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    client_id: Option<String>,
    topics: Option<Vec<String>>,
    camera_segment: Option<usize>,
    username: Option<String>,
    password: Option<String>,
    keep_alive_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SnapshotConfigFile {
    url_template: Option<String>,
    token: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RenderConfigFile {
    stroke_width: Option<u32>,
    color: Option<[u8; 3]>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct NotifyConfigFile {
    relay_topic: Option<String>,
    from_address: Option<String>,
    display_name: Option<String>,
    alert_groups: Option<BTreeMap<String, Vec<String>>>,
    cameras: Option<BTreeMap<String, CameraDetailsFile>>,
    label_map: Option<BTreeMap<String, String>>,
    subject_template: Option<String>,
    body_template: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraDetailsFile {
    location: Option<String>,
    alert_group: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct BlobConfigFile {
    dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct AuditConfigFile {
    db_path: Option<String>,
    log_all: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct EvictionConfigFile {
    ttl_multiplier: Option<u32>,
    sweep_interval_ms: Option<u64>,
}

/// Fully resolved daemon configuration. Read once at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub rules: ModelConfig,
    pub topology: Topology,
    pub box_order: BoxOrder,
    pub mqtt: MqttSettings,
    pub snapshot: SnapshotSettings,
    pub render: RenderSettings,
    pub notify: NotifySettings,
    pub blob: BlobSettings,
    pub audit: AuditSettings,
    pub retry: RetryPolicy,
    pub eviction: EvictionPolicy,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    /// `host:port`; the port defaults to 1883.
    pub broker: String,
    pub client_id: String,
    pub topics: Vec<String>,
    /// `/`-separated topic segment holding the camera serial.
    pub camera_segment: usize,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    /// Snapshot endpoint; `{camera}` is replaced with the camera serial.
    pub url_template: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub stroke_width: u32,
    pub color: [u8; 3],
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct CameraDetails {
    pub location: String,
    pub alert_group: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NotifySettings {
    pub relay_topic: String,
    pub from_address: String,
    pub display_name: String,
    pub alert_groups: BTreeMap<String, Vec<String>>,
    pub cameras: BTreeMap<String, CameraDetails>,
    pub label_map: BTreeMap<i32, String>,
    pub subject_template: String,
    pub body_template: String,
}

#[derive(Debug, Clone)]
pub struct BlobSettings {
    pub dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AuditSettings {
    pub db_path: String,
    /// Record every batch, not only violations.
    pub log_all: bool,
}

impl NotifySettings {
    /// Addresses for `camera`, resolved through its alert group.
    pub fn recipients(&self, camera: &str) -> &[String] {
        self.cameras
            .get(camera)
            .and_then(|details| details.alert_group.as_ref())
            .and_then(|group| self.alert_groups.get(group))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Configured location for `camera`, or the serial itself.
    pub fn location<'a>(&'a self, camera: &'a str) -> &'a str {
        self.cameras
            .get(camera)
            .map(|details| details.location.as_str())
            .unwrap_or(camera)
    }
}

impl PipelineConfig {
    /// Loads the file named by `VAP_CONFIG` (if set), then applies
    /// environment overrides and validates.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VAP_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Result<Self> {
        let rules = ModelConfig {
            models: file.models.unwrap_or_default(),
            classes: file.classes.unwrap_or_default(),
        };
        let topology = file.pipeline.unwrap_or_else(default_topology);
        let box_order = file.box_order.unwrap_or_default();

        let mqtt_file = file.mqtt.unwrap_or_default();
        let mqtt = MqttSettings {
            broker: mqtt_file
                .broker
                .unwrap_or_else(|| DEFAULT_MQTT_BROKER.to_string()),
            client_id: mqtt_file
                .client_id
                .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
            topics: mqtt_file
                .topics
                .unwrap_or_else(|| vec![DEFAULT_MQTT_TOPIC.to_string()]),
            camera_segment: mqtt_file.camera_segment.unwrap_or(DEFAULT_CAMERA_SEGMENT),
            username: mqtt_file.username,
            password: mqtt_file.password,
            keep_alive: Duration::from_secs(
                mqtt_file.keep_alive_secs.unwrap_or(DEFAULT_KEEP_ALIVE_SECS),
            ),
        };

        let snapshot_file = file.snapshot.unwrap_or_default();
        let snapshot = SnapshotSettings {
            url_template: snapshot_file.url_template.unwrap_or_default(),
            token: snapshot_file.token,
            timeout: Duration::from_millis(
                snapshot_file
                    .timeout_ms
                    .unwrap_or(DEFAULT_SNAPSHOT_TIMEOUT_MS),
            ),
        };

        let render_file = file.render.unwrap_or_default();
        let render = RenderSettings {
            stroke_width: render_file.stroke_width.unwrap_or(DEFAULT_STROKE_WIDTH),
            color: render_file.color.unwrap_or(DEFAULT_STROKE_COLOR),
            jpeg_quality: render_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        };

        let notify_file = file.notify.unwrap_or_default();
        let mut label_map = BTreeMap::new();
        for (key, label) in notify_file.label_map.unwrap_or_default() {
            let class_id: i32 = key
                .parse()
                .map_err(|_| anyhow!("label_map key '{}' is not a class id", key))?;
            label_map.insert(class_id, label);
        }
        let cameras = notify_file
            .cameras
            .unwrap_or_default()
            .into_iter()
            .map(|(serial, details)| {
                let location = details.location.unwrap_or_else(|| serial.clone());
                (
                    serial,
                    CameraDetails {
                        location,
                        alert_group: details.alert_group,
                    },
                )
            })
            .collect();
        let notify = NotifySettings {
            relay_topic: notify_file
                .relay_topic
                .unwrap_or_else(|| DEFAULT_RELAY_TOPIC.to_string()),
            from_address: notify_file.from_address.unwrap_or_default(),
            display_name: notify_file.display_name.unwrap_or_default(),
            alert_groups: notify_file.alert_groups.unwrap_or_default(),
            cameras,
            label_map,
            subject_template: notify_file
                .subject_template
                .unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
            body_template: notify_file
                .body_template
                .unwrap_or_else(|| DEFAULT_BODY.to_string()),
        };

        let blob = BlobSettings {
            dir: file
                .blob
                .and_then(|blob| blob.dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BLOB_DIR)),
        };

        let audit_file = file.audit.unwrap_or_default();
        let audit = AuditSettings {
            db_path: audit_file
                .db_path
                .unwrap_or_else(|| DEFAULT_AUDIT_DB_PATH.to_string()),
            log_all: audit_file.log_all.unwrap_or(false),
        };

        let retry = RetryPolicy::from_file(file.retry.unwrap_or_default());

        let eviction_file = file.eviction.unwrap_or_default();
        let defaults = EvictionPolicy::default();
        let eviction = EvictionPolicy {
            ttl_multiplier: eviction_file
                .ttl_multiplier
                .unwrap_or(defaults.ttl_multiplier),
            sweep_interval: eviction_file
                .sweep_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval),
        };

        Ok(Self {
            rules,
            topology,
            box_order,
            mqtt,
            snapshot,
            render,
            notify,
            blob,
            audit,
            retry,
            eviction,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(broker) = std::env::var("VAP_MQTT_BROKER") {
            if !broker.trim().is_empty() {
                self.mqtt.broker = broker;
            }
        }
        if let Ok(path) = std::env::var("VAP_AUDIT_DB_PATH") {
            if !path.trim().is_empty() {
                self.audit.db_path = path;
            }
        }
        if let Ok(dir) = std::env::var("VAP_BLOB_DIR") {
            if !dir.trim().is_empty() {
                self.blob.dir = PathBuf::from(dir);
            }
        }
        if let Ok(token) = std::env::var("VAP_SNAPSHOT_TOKEN") {
            if !token.trim().is_empty() {
                self.snapshot.token = Some(token);
            }
        }
        if let Ok(log_all) = std::env::var("VAP_LOG_ALL") {
            self.audit.log_all = parse_bool(&log_all)
                .ok_or_else(|| anyhow!("VAP_LOG_ALL must be true or false"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.rules.validate()?;
        if self.topology.is_empty() {
            return Err(anyhow!("pipeline topology must name at least one stage"));
        }
        for (name, downstream) in &self.topology {
            for stage in std::iter::once(name).chain(downstream) {
                if !stages::is_known(stage) {
                    return Err(anyhow!(
                        "unknown pipeline stage '{}'; expected one of: {}",
                        stage,
                        stages::ALL.join(", ")
                    ));
                }
            }
        }
        if self.uses(stages::MQTT_INGEST) && self.mqtt.topics.is_empty() {
            return Err(anyhow!("mqtt.topics must not be empty"));
        }
        if self.uses(stages::IMAGE_RETRIEVER) && self.snapshot.url_template.trim().is_empty() {
            return Err(anyhow!(
                "snapshot.url_template is required when {} is in the pipeline",
                stages::IMAGE_RETRIEVER
            ));
        }
        if !(1..=100).contains(&self.render.jpeg_quality) {
            return Err(anyhow!("render.jpeg_quality must be within 1 and 100"));
        }
        if self.render.stroke_width == 0 {
            return Err(anyhow!("render.stroke_width must be greater than zero"));
        }
        for (camera, details) in &self.notify.cameras {
            if let Some(group) = &details.alert_group {
                if !self.notify.alert_groups.contains_key(group) {
                    return Err(anyhow!(
                        "camera '{}' references unknown alert group '{}'",
                        camera,
                        group
                    ));
                }
            }
        }
        if self.eviction.is_enabled() && self.eviction.sweep_interval.is_zero() {
            return Err(anyhow!("eviction.sweep_interval_ms must be greater than zero"));
        }
        Ok(())
    }

    /// True when `stage` appears anywhere in the topology.
    pub fn uses(&self, stage: &str) -> bool {
        self.topology
            .iter()
            .any(|(name, downstream)| name == stage || downstream.iter().any(|d| d == stage))
    }
}

/// `MqttIngest -> Inferer -> {ImageRetriever, AuditLog}`,
/// `ImageRetriever -> Renderer -> {Notifier, BlobStore}`.
pub fn default_topology() -> Topology {
    let edges: [(&str, &[&str]); 4] = [
        (stages::MQTT_INGEST, &[stages::INFERER]),
        (stages::INFERER, &[stages::IMAGE_RETRIEVER, stages::AUDIT_LOG]),
        (stages::IMAGE_RETRIEVER, &[stages::RENDERER]),
        (stages::RENDERER, &[stages::NOTIFIER, stages::BLOB_STORE]),
    ];
    edges
        .iter()
        .map(|(name, downstream)| {
            (
                name.to_string(),
                downstream.iter().map(|d| d.to_string()).collect(),
            )
        })
        .collect()
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
