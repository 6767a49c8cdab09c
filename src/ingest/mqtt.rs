use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use std::time::Duration;

use super::decode::{camera_serial_from_topic, decode_inference};
use crate::config::MqttSettings;
use crate::model::{BoxOrder, CameraContext};
use crate::pipeline::{ShutdownSignal, Stage, StageIo, POLL_INTERVAL};

const DEFAULT_MQTT_PORT: u16 = 1883;
const REQUEST_CAPACITY: usize = 10;

/// Source stage: subscribes to the inference topics and feeds one
/// [`CameraContext`] per message into the pipeline.
///
/// Losing the broker connection is fatal; the stage returns an error and the
/// host shuts the pipeline down.
pub struct MqttIngest {
    name: String,
    settings: MqttSettings,
    box_order: BoxOrder,
}

impl MqttIngest {
    pub fn new(name: impl Into<String>, settings: MqttSettings, box_order: BoxOrder) -> Self {
        Self {
            name: name.into(),
            settings,
            box_order,
        }
    }
}

impl Stage for MqttIngest {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, io: StageIo, shutdown: &ShutdownSignal) -> Result<()> {
        let (client, mut connection) = connect(&self.settings, &self.settings.client_id)?;
        for topic in &self.settings.topics {
            client
                .subscribe(topic.clone(), QoS::AtMostOnce)
                .with_context(|| format!("failed to subscribe to {}", topic))?;
            log::info!("subscribed to topic {}", topic);
        }

        // The connection iterator blocks; a watcher disconnects on shutdown
        // so the loop below wakes up.
        let stopped = ShutdownSignal::new();
        let watcher = {
            let client = client.clone();
            let shutdown = shutdown.clone();
            let stopped = stopped.clone();
            std::thread::Builder::new()
                .name(format!("{}-watch", self.name))
                .spawn(move || {
                    while !shutdown.is_triggered() && !stopped.is_triggered() {
                        std::thread::sleep(POLL_INTERVAL);
                    }
                    if shutdown.is_triggered() {
                        if let Err(err) = client.disconnect() {
                            log::debug!("mqtt disconnect: {}", err);
                        }
                    }
                })
                .map_err(|err| anyhow!("failed to spawn mqtt watcher: {}", err))?
        };

        let result = self.pump(&mut connection, &io, shutdown);
        stopped.trigger();
        if watcher.join().is_err() {
            log::warn!("mqtt watcher thread panicked");
        }
        result
    }
}

impl MqttIngest {
    fn pump(
        &self,
        connection: &mut Connection,
        io: &StageIo,
        shutdown: &ShutdownSignal,
    ) -> Result<()> {
        let mut received = 0u64;
        for event in connection.iter() {
            if shutdown.is_triggered() {
                break;
            }
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(..))) => {
                    log::info!("connected to MQTT broker {}", self.settings.broker);
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let topic = match std::str::from_utf8(&publish.topic) {
                        Ok(topic) => topic,
                        Err(err) => {
                            log::warn!("skipping publish with invalid topic: {}", err);
                            continue;
                        }
                    };
                    received += 1;
                    match route_message(
                        topic,
                        &publish.payload,
                        self.settings.camera_segment,
                        self.box_order,
                    ) {
                        Ok(ctx) => {
                            log::debug!(
                                "received {} detection(s) from {} at {}",
                                ctx.inference.outputs.len(),
                                ctx.camera_serial,
                                ctx.inference.timestamp
                            );
                            io.forward(ctx);
                        }
                        Err(err) => log::error!("dropping message from {}: {:#}", topic, err),
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    if shutdown.is_triggered() {
                        break;
                    }
                    return Err(anyhow!(
                        "MQTT connection to {} lost after {} message(s): {}",
                        self.settings.broker,
                        received,
                        err
                    ));
                }
            }
        }
        log::info!("disconnected from MQTT broker after {} message(s)", received);
        Ok(())
    }
}

/// Turns one MQTT message into a unit of work.
pub fn route_message(
    topic: &str,
    payload: &[u8],
    camera_segment: usize,
    box_order: BoxOrder,
) -> Result<CameraContext> {
    let camera = camera_serial_from_topic(topic, camera_segment)?;
    let inference = decode_inference(payload, box_order)?;
    Ok(CameraContext::new(camera, inference))
}

/// Opens a client against the configured broker. Nothing is sent until the
/// returned connection is polled.
pub fn connect(settings: &MqttSettings, client_id: &str) -> Result<(Client, Connection)> {
    let (host, port) = parse_broker(&settings.broker)?;
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(settings.keep_alive.max(Duration::from_secs(5)));
    options.set_clean_start(true);
    if let Some(user) = &settings.username {
        options.set_credentials(user, settings.password.clone().unwrap_or_default());
    }
    Ok(Client::new(options, request_capacity(settings)))
}

/// Room for every subscribe request queued before the event loop is polled,
/// plus the working headroom.
fn request_capacity(settings: &MqttSettings) -> usize {
    settings.topics.len() + REQUEST_CAPACITY
}

/// Splits `host[:port]`, defaulting the port to 1883.
pub fn parse_broker(broker: &str) -> Result<(String, u16)> {
    let broker = broker
        .trim()
        .trim_start_matches("mqtt://")
        .trim_end_matches('/');
    if broker.is_empty() {
        return Err(anyhow!("mqtt broker address is empty"));
    }
    match broker.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse()
                .map_err(|_| anyhow!("invalid mqtt broker port in '{}'", broker))?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(anyhow!("invalid mqtt broker address '{}'", broker)),
        None => Ok((broker.to_string(), DEFAULT_MQTT_PORT)),
    }
}
