use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Event};
use serde::Serialize;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::{MqttSettings, NotifySettings};
use crate::ingest;
use crate::model::{iso_timestamp, CameraContext};
use crate::pipeline::{Processor, ShutdownSignal};
use crate::retry::RetryPolicy;

const ATTACHMENT_CONTENT_TYPE: &str = "image/jpeg";
const RELAY_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// An alert ready for delivery.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub from_address: String,
    pub display_name: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachment_name: String,
    pub attachment: Vec<u8>,
}

/// Delivery channel for notifications.
pub trait NotificationSink: Send {
    fn deliver(&self, notification: &Notification) -> Result<()>;
}

#[derive(Serialize)]
struct RelayMessage<'a> {
    from: &'a str,
    display_name: &'a str,
    to: &'a [String],
    subject: &'a str,
    body: &'a str,
    attachment: RelayAttachment<'a>,
}

#[derive(Serialize)]
struct RelayAttachment<'a> {
    name: &'a str,
    content_type: &'a str,
    data_hex: String,
}

/// Hands notifications to a mail relay listening on an MQTT topic. The
/// attachment travels hex-encoded inside the JSON message.
pub struct MqttRelaySink {
    client: Client,
    topic: String,
    stop: ShutdownSignal,
    connection: Option<JoinHandle<()>>,
}

impl MqttRelaySink {
    pub fn connect(settings: &MqttSettings, topic: &str) -> Result<Self> {
        let client_id = format!("{}-relay", settings.client_id);
        let (client, mut connection) = ingest::connect(settings, &client_id)?;
        let stop = ShutdownSignal::new();
        let stop_thread = stop.clone();
        let handle = std::thread::Builder::new()
            .name("notify-relay".to_string())
            .spawn(move || {
                for event in connection.iter() {
                    if stop_thread.is_triggered() {
                        break;
                    }
                    match event {
                        Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                        Err(e) => {
                            log::warn!("mail relay connection error: {}", e);
                            if !stop_thread.sleep(RELAY_RECONNECT_DELAY) {
                                break;
                            }
                        }
                    }
                }
            })
            .map_err(|err| anyhow!("failed to spawn mail relay connection: {}", err))?;
        Ok(Self {
            client,
            topic: topic.to_string(),
            stop,
            connection: Some(handle),
        })
    }
}

impl NotificationSink for MqttRelaySink {
    fn deliver(&self, notification: &Notification) -> Result<()> {
        let payload = relay_payload(notification)?;
        self.client
            .try_publish(self.topic.clone(), QoS::AtLeastOnce, false, payload)
            .context("queue notification for mail relay")?;
        Ok(())
    }
}

impl Drop for MqttRelaySink {
    fn drop(&mut self) {
        self.stop.trigger();
        if let Err(err) = self.client.disconnect() {
            log::debug!("mail relay disconnect: {}", err);
        }
        if let Some(handle) = self.connection.take() {
            let _ = handle.join();
        }
    }
}

fn relay_payload(notification: &Notification) -> Result<Vec<u8>> {
    let message = RelayMessage {
        from: &notification.from_address,
        display_name: &notification.display_name,
        to: &notification.recipients,
        subject: &notification.subject,
        body: &notification.body,
        attachment: RelayAttachment {
            name: &notification.attachment_name,
            content_type: ATTACHMENT_CONTENT_TYPE,
            data_hex: hex::encode(&notification.attachment),
        },
    };
    Ok(serde_json::to_vec(&message)?)
}

/// File name of the snapshot attached to an alert.
pub fn attachment_name(camera: &str, timestamp: i64) -> String {
    format!("{}_{}.jpeg", camera, timestamp)
}

/// Sends an alert with the rendered snapshot to the camera's alert group.
pub struct Notifier {
    sink: Box<dyn NotificationSink>,
    settings: NotifySettings,
    retry: RetryPolicy,
}

impl Notifier {
    pub fn new(sink: Box<dyn NotificationSink>, settings: NotifySettings, retry: RetryPolicy) -> Self {
        Self {
            sink,
            settings,
            retry,
        }
    }

    /// Builds the alert for `ctx`. `None` when the camera has no recipients.
    pub fn compose(&self, ctx: &CameraContext) -> Result<Option<Notification>> {
        let camera = ctx.camera_serial.as_str();
        let recipients = self.settings.recipients(camera);
        if recipients.is_empty() {
            return Ok(None);
        }
        let image = ctx
            .image
            .as_ref()
            .ok_or_else(|| anyhow!("no rendered image to attach"))?;
        let location = self.settings.location(camera);
        let time = iso_timestamp(ctx.inference.timestamp)?;
        let labels = self.labels(ctx);
        let inference = serde_json::to_string(&ctx.inference)?;
        let fill = |template: &str| {
            template
                .replace("{camera}", camera)
                .replace("{location}", location)
                .replace("{time}", &time)
                .replace("{labels}", &labels)
                .replace("{inference}", &inference)
        };
        Ok(Some(Notification {
            from_address: self.settings.from_address.clone(),
            display_name: self.settings.display_name.clone(),
            recipients: recipients.to_vec(),
            subject: fill(&self.settings.subject_template),
            body: fill(&self.settings.body_template),
            attachment_name: attachment_name(camera, ctx.inference.timestamp),
            attachment: image.clone(),
        }))
    }

    /// One label per distinct class, in order of first appearance.
    fn labels(&self, ctx: &CameraContext) -> String {
        let mut seen = Vec::new();
        for detection in &ctx.inference.outputs {
            if !seen.contains(&detection.class) {
                seen.push(detection.class);
            }
        }
        seen.iter()
            .map(|class| {
                self.settings
                    .label_map
                    .get(class)
                    .cloned()
                    .unwrap_or_else(|| format!("class {}", class))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Processor for Notifier {
    fn process(
        &mut self,
        ctx: CameraContext,
        shutdown: &ShutdownSignal,
    ) -> Result<Option<CameraContext>> {
        let Some(notification) = self.compose(&ctx)? else {
            log::warn!("no notification recipients configured for {}", ctx.camera_serial);
            return Ok(Some(ctx));
        };
        let sink = &self.sink;
        self.retry
            .run("notification delivery", shutdown, || sink.deliver(&notification))?;
        log::info!(
            "sent notification for {} to {}",
            ctx.camera_serial,
            notification.recipients.join(",")
        );
        Ok(Some(ctx))
    }
}
