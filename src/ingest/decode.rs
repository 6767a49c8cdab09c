use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::model::{
    round_to, BoxOrder, Detection, DetectionBatch, BOX_LEN, COORDINATE_PLACES, MAX_TIMESTAMP_MS,
};

/// Batch as published by the inference service. Field names are matched
/// in either lower or Pascal case.
#[derive(Debug, Deserialize)]
struct WireBatch {
    #[serde(default, alias = "Outputs")]
    outputs: Option<Vec<WireDetection>>,
    #[serde(alias = "Timestamp")]
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    #[serde(alias = "Class")]
    class: i32,
    #[serde(default, alias = "Id")]
    id: i32,
    #[serde(alias = "Location")]
    location: Vec<f32>,
    #[serde(alias = "Score")]
    score: f32,
}

/// Decodes one inference payload.
///
/// Boxes are reordered from `order` into canonical `[xmin, ymin, xmax, ymax]`
/// and each coordinate is rounded to two decimal places. A box that does not
/// have exactly four values, or a timestamp before the epoch or past
/// [`MAX_TIMESTAMP_MS`], fails the whole batch.
pub fn decode_inference(payload: &[u8], order: BoxOrder) -> Result<DetectionBatch> {
    let wire: WireBatch =
        serde_json::from_slice(payload).context("inference payload is not a valid batch")?;
    if !(0..=MAX_TIMESTAMP_MS).contains(&wire.timestamp) {
        return Err(anyhow!(
            "batch timestamp {} is outside 0..={}",
            wire.timestamp,
            MAX_TIMESTAMP_MS
        ));
    }
    let mut outputs = Vec::new();
    for (index, raw) in wire.outputs.unwrap_or_default().into_iter().enumerate() {
        let location: [f32; BOX_LEN] = raw.location.as_slice().try_into().map_err(|_| {
            anyhow!(
                "output {} has {} box coordinates, expected {}",
                index,
                raw.location.len(),
                BOX_LEN
            )
        })?;
        let location = order
            .to_canonical(location)
            .map(|c| round_to(c, COORDINATE_PLACES));
        outputs.push(Detection {
            class: raw.class,
            id: raw.id,
            location,
            score: raw.score,
        });
    }
    Ok(DetectionBatch {
        outputs,
        timestamp: wire.timestamp,
    })
}

/// Camera serial carried in segment `segment` (0-based) of a `/`-separated
/// topic, e.g. segment 2 of `/merakimv/Q2UV-N5GT-HURS/custom_analytics`.
pub fn camera_serial_from_topic(topic: &str, segment: usize) -> Result<String> {
    topic
        .split('/')
        .nth(segment)
        .map(str::trim)
        .filter(|serial| !serial.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("topic '{}' has no camera serial at segment {}", topic, segment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_pascal_case_and_rounds_coordinates() {
        let payload = br#"{
            "Outputs": [{"Class": 2, "Id": 7, "Location": [0.1234, 0.2049, 0.3051, 0.4], "Score": 0.91}],
            "Timestamp": 1706679450000
        }"#;
        let batch = decode_inference(payload, BoxOrder::default()).unwrap();
        assert_eq!(batch.timestamp, 1_706_679_450_000);
        assert_eq!(batch.outputs.len(), 1);
        let d = &batch.outputs[0];
        assert_eq!((d.class, d.id), (2, 7));
        assert_eq!(d.location, [0.12, 0.2, 0.31, 0.4]);
    }

    #[test]
    fn y_first_boxes_are_reordered() {
        let payload = br#"{"outputs": [{"class": 1, "location": [0.2, 0.1, 0.4, 0.3], "score": 0.8}], "timestamp": 5}"#;
        let batch = decode_inference(payload, BoxOrder::YminXminYmaxXmax).unwrap();
        assert_eq!(batch.outputs[0].location, [0.1, 0.2, 0.3, 0.4]);
        assert_eq!(batch.outputs[0].id, 0);
    }

    #[test]
    fn null_outputs_is_an_empty_batch() {
        let batch = decode_inference(br#"{"outputs": null, "timestamp": 1}"#, BoxOrder::default())
            .unwrap();
        assert!(batch.outputs.is_empty());
    }

    #[test]
    fn wrong_box_length_and_garbage_are_rejected() {
        let short = br#"{"outputs": [{"class": 1, "location": [0.1, 0.2, 0.3], "score": 0.8}], "timestamp": 1}"#;
        assert!(decode_inference(short, BoxOrder::default()).is_err());
        assert!(decode_inference(b"not json", BoxOrder::default()).is_err());
        assert!(decode_inference(br#"{"outputs": []}"#, BoxOrder::default()).is_err());
    }

    #[test]
    fn out_of_range_timestamps_are_rejected() {
        for timestamp in ["9223372036854775807", "-9223372036854775808", "-1", "253402300800000"] {
            let payload = format!(r#"{{"outputs": [], "timestamp": {}}}"#, timestamp);
            assert!(
                decode_inference(payload.as_bytes(), BoxOrder::default()).is_err(),
                "accepted {}",
                timestamp
            );
        }
        let latest = format!(r#"{{"outputs": [], "timestamp": {}}}"#, MAX_TIMESTAMP_MS);
        assert!(decode_inference(latest.as_bytes(), BoxOrder::default()).is_ok());
    }

    #[test]
    fn serial_comes_from_the_configured_segment() {
        let topic = "/merakimv/Q2UV-N5GT-HURS/custom_analytics";
        assert_eq!(camera_serial_from_topic(topic, 2).unwrap(), "Q2UV-N5GT-HURS");
        assert!(camera_serial_from_topic(topic, 7).is_err());
        assert!(camera_serial_from_topic(topic, 0).is_err());
    }
}
