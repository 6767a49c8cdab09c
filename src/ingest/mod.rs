//! Inbound transport: MQTT subscription and inference payload decoding.
//!
//! The box axis order of the deployment is applied here and nowhere else.
//! Everything that leaves this module carries canonical
//! `[xmin, ymin, xmax, ymax]` boxes rounded to two decimals.

mod decode;
mod mqtt;

pub use decode::{camera_serial_from_topic, decode_inference};
pub use mqtt::{connect, parse_broker, route_message, MqttIngest};
