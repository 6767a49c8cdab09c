//! Units of work flowing through the pipeline.
//!
//! Boxes are normalized to `[0, 1]` and always carried in the canonical
//! `[xmin, ymin, xmax, ymax]` order. The deployment's wire order is applied
//! exactly once, at ingestion (see [`BoxOrder`]); nothing downstream re-guesses.

use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Number of coordinates in a bounding box.
pub const BOX_LEN: usize = 4;

/// Decimal places kept on decoded box coordinates.
pub const COORDINATE_PLACES: i32 = 2;

/// Decimal places kept on spatial midpoints.
pub const MIDPOINT_PLACES: i32 = 3;

/// Latest batch time accepted from the wire, `9999-12-31T23:59:59.999Z`.
pub const MAX_TIMESTAMP_MS: i64 = 253_402_300_799_999;

/// One object reported by upstream inference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: i32,
    #[serde(default)]
    pub id: i32,
    /// Normalized box in canonical `[xmin, ymin, xmax, ymax]` order.
    pub location: [f32; BOX_LEN],
    pub score: f32,
}

impl Detection {
    /// Centre of the box, rounded to [`MIDPOINT_PLACES`].
    pub fn midpoint(&self) -> [f32; 2] {
        let [xmin, ymin, xmax, ymax] = self.location;
        [
            round_to((xmin + xmax) / 2.0, MIDPOINT_PLACES),
            round_to((ymin + ymax) / 2.0, MIDPOINT_PLACES),
        ]
    }

    /// True when every coordinate lies in `[0, 1]`. NaN is out of bounds.
    pub fn in_bounds(&self) -> bool {
        self.location.iter().all(|c| (0.0..=1.0).contains(c))
    }
}

/// All detections for one camera frame ("inference").
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionBatch {
    pub outputs: Vec<Detection>,
    /// Frame time, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Unit of work passed between stages.
///
/// Stages add to a context (verdict flags, an attached image) but never
/// remove what an upstream stage set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CameraContext {
    pub camera_serial: String,
    pub inference: DetectionBatch,
    pub violation_detected: bool,
    /// Set when the violation came from the occupancy counter rather than
    /// from individual detections.
    pub confined_space_violation: bool,
    /// Encoded snapshot (JPEG) attached by the image retriever.
    pub image: Option<Vec<u8>>,
}

impl CameraContext {
    pub fn new(camera_serial: impl Into<String>, inference: DetectionBatch) -> Self {
        Self {
            camera_serial: camera_serial.into(),
            inference,
            ..Self::default()
        }
    }
}

/// Axis order of boxes on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoxOrder {
    #[default]
    XminYminXmaxYmax,
    YminXminYmaxXmax,
}

impl BoxOrder {
    /// Reorders a wire box into canonical `[xmin, ymin, xmax, ymax]`.
    pub fn to_canonical(self, raw: [f32; BOX_LEN]) -> [f32; BOX_LEN] {
        match self {
            BoxOrder::XminYminXmaxYmax => raw,
            BoxOrder::YminXminYmaxXmax => [raw[1], raw[0], raw[3], raw[2]],
        }
    }
}

pub fn round_to(value: f32, places: i32) -> f32 {
    let factor = 10f32.powi(places);
    (value * factor).round() / factor
}

/// A millisecond duration as a signed offset, saturating at `i64::MAX`.
pub fn millis_i64(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

/// Epoch milliseconds as ISO-8601 UTC, e.g. `2024-01-31T05:37:30.000Z`.
pub fn iso_timestamp(epoch_ms: i64) -> Result<String> {
    DateTime::<Utc>::from_timestamp_millis(epoch_ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| anyhow!("timestamp {} is out of range", epoch_ms))
}
