//! Stage implementations and the name-to-implementation registry used when
//! wiring a topology.

mod audit_log;
mod blob_store;
mod image_retriever;
mod inferer;
mod notifier;
mod renderer;

use anyhow::{anyhow, Result};
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::ingest::MqttIngest;
use crate::pipeline::{ProcessorStage, Stage};
use crate::rules::ModelConfig;

pub use audit_log::{AuditLog, AuditRow};
pub use blob_store::{blob_name, BlobStore};
pub use image_retriever::{snapshot_request, HttpSnapshotSource, ImageRetriever, SnapshotSource};
pub use inferer::Inferer;
pub use notifier::{
    attachment_name, MqttRelaySink, Notification, NotificationSink, Notifier,
};
pub use renderer::{draw_boxes, Renderer};

pub const MQTT_INGEST: &str = "MqttIngest";
pub const INFERER: &str = "Inferer";
pub const IMAGE_RETRIEVER: &str = "ImageRetriever";
pub const RENDERER: &str = "Renderer";
pub const NOTIFIER: &str = "Notifier";
pub const BLOB_STORE: &str = "BlobStore";
pub const AUDIT_LOG: &str = "AuditLog";

/// Every stage name a topology may use.
pub const ALL: &[&str] = &[
    MQTT_INGEST,
    INFERER,
    IMAGE_RETRIEVER,
    RENDERER,
    NOTIFIER,
    BLOB_STORE,
    AUDIT_LOG,
];

pub fn is_known(name: &str) -> bool {
    ALL.contains(&name)
}

/// Builds the implementation for one topology stage.
pub fn build_stage(
    name: &str,
    cfg: &PipelineConfig,
    rules: Arc<ModelConfig>,
) -> Result<Box<dyn Stage>> {
    let stage: Box<dyn Stage> = match name {
        MQTT_INGEST => Box::new(MqttIngest::new(name, cfg.mqtt.clone(), cfg.box_order)),
        INFERER => Box::new(ProcessorStage::new(
            name,
            Inferer::new(rules, cfg.eviction.clone(), cfg.audit.log_all),
        )),
        IMAGE_RETRIEVER => {
            let source = HttpSnapshotSource::new(&cfg.snapshot);
            Box::new(ProcessorStage::new(
                name,
                ImageRetriever::new(Box::new(source), cfg.retry.clone()),
            ))
        }
        RENDERER => Box::new(ProcessorStage::new(name, Renderer::new(cfg.render.clone()))),
        NOTIFIER => {
            let sink = MqttRelaySink::connect(&cfg.mqtt, &cfg.notify.relay_topic)?;
            Box::new(ProcessorStage::new(
                name,
                Notifier::new(Box::new(sink), cfg.notify.clone(), cfg.retry.clone()),
            ))
        }
        BLOB_STORE => Box::new(ProcessorStage::new(
            name,
            BlobStore::open(&cfg.blob.dir, cfg.retry.clone())?,
        )),
        AUDIT_LOG => Box::new(ProcessorStage::new(
            name,
            AuditLog::open(&cfg.audit.db_path, cfg.audit.log_all)?,
        )),
        other => {
            return Err(anyhow!(
                "unknown pipeline stage '{}'; expected one of: {}",
                other,
                ALL.join(", ")
            ))
        }
    };
    Ok(stage)
}
