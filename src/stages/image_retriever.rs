use anyhow::{anyhow, Context, Result};
use serde_json::json;
use std::io::Read;

use crate::config::SnapshotSettings;
use crate::model::{iso_timestamp, CameraContext};
use crate::pipeline::{Processor, ShutdownSignal};
use crate::retry::{permanent, RetryPolicy};

const MAX_SNAPSHOT_BYTES: u64 = 32 * 1024 * 1024;

/// Where violation snapshots come from.
pub trait SnapshotSource: Send {
    /// Encoded image for `camera` at `timestamp`, or `None` when the camera
    /// API has no snapshot to offer.
    fn fetch(&self, camera: &str, timestamp: i64) -> Result<Option<Vec<u8>>>;
}

/// Camera-API snapshot source.
///
/// POSTs the frame time to the snapshot endpoint, reads the `url` field of
/// the JSON answer and downloads the image from it.
pub struct HttpSnapshotSource {
    agent: ureq::Agent,
    url_template: String,
    token: Option<String>,
}

impl HttpSnapshotSource {
    pub fn new(settings: &SnapshotSettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(settings.timeout)
            .build();
        Self {
            agent,
            url_template: settings.url_template.clone(),
            token: settings.token.clone(),
        }
    }

    fn snapshot_url(&self, camera: &str, timestamp: i64) -> Result<Option<String>> {
        let endpoint = self.url_template.replace("{camera}", camera);
        let body = snapshot_request(timestamp)?;
        let mut request = self
            .agent
            .post(&endpoint)
            .set("Accept", "application/json")
            .set("Content-Type", "application/json");
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("Bearer {}", token));
        }
        let response = request
            .send_string(&body.to_string())
            .map_err(classify_http_error)
            .with_context(|| format!("request snapshot for {} from {}", camera, endpoint))?;
        let raw = response.into_string().context("read snapshot response")?;
        let parsed: serde_json::Value = serde_json::from_str(&raw)
            .context("snapshot response is not json")
            .map_err(permanent)?;
        Ok(parsed
            .get("url")
            .and_then(|url| url.as_str())
            .map(str::to_string))
    }
}

impl SnapshotSource for HttpSnapshotSource {
    fn fetch(&self, camera: &str, timestamp: i64) -> Result<Option<Vec<u8>>> {
        let Some(url) = self.snapshot_url(camera, timestamp)? else {
            return Ok(None);
        };
        let response = self
            .agent
            .get(&url)
            .call()
            .map_err(classify_http_error)
            .with_context(|| format!("download snapshot for {}", camera))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_SNAPSHOT_BYTES)
            .read_to_end(&mut bytes)
            .context("read snapshot body")?;
        if bytes.is_empty() {
            return Err(permanent(anyhow!("empty snapshot for {}", camera)));
        }
        Ok(Some(bytes))
    }
}

/// Client errors other than timeouts and rate limits will not change on a
/// retry; transport errors and 5xx answers might.
pub fn classify_http_error(err: ureq::Error) -> anyhow::Error {
    match err {
        ureq::Error::Status(code, response) if code < 500 && code != 408 && code != 429 => {
            permanent(anyhow!("http {} {}", code, response.status_text()))
        }
        other => anyhow::Error::new(other),
    }
}

/// Request body for the snapshot endpoint.
pub fn snapshot_request(timestamp: i64) -> Result<serde_json::Value> {
    Ok(json!({
        "timestamp": iso_timestamp(timestamp)?,
        "fullframe": "false",
    }))
}

/// Attaches the frame snapshot to violation contexts; everything else is
/// dropped here.
pub struct ImageRetriever {
    source: Box<dyn SnapshotSource>,
    retry: RetryPolicy,
}

impl ImageRetriever {
    pub fn new(source: Box<dyn SnapshotSource>, retry: RetryPolicy) -> Self {
        log::debug!(
            "snapshot retrieval waits up to {:?} across {} retries",
            retry.total_budget(),
            retry.max_retries
        );
        Self { source, retry }
    }
}

impl Processor for ImageRetriever {
    fn process(
        &mut self,
        mut ctx: CameraContext,
        shutdown: &ShutdownSignal,
    ) -> Result<Option<CameraContext>> {
        if !ctx.violation_detected {
            return Ok(None);
        }
        let camera = ctx.camera_serial.clone();
        let timestamp = ctx.inference.timestamp;
        log::info!("downloading snapshot for {} at {}", camera, timestamp);
        let source = &self.source;
        let image = self.retry.run("snapshot retrieval", shutdown, || {
            source.fetch(&camera, timestamp)
        })?;
        match image {
            Some(bytes) => {
                ctx.image = Some(bytes);
                Ok(Some(ctx))
            }
            None => {
                log::warn!("no snapshot url returned for {} at {}", camera, timestamp);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DetectionBatch;
    use crate::retry::is_permanent;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Flaky {
        failures: usize,
        calls: Arc<AtomicUsize>,
        answer: Option<Vec<u8>>,
    }

    impl SnapshotSource for Flaky {
        fn fetch(&self, _camera: &str, _timestamp: i64) -> Result<Option<Vec<u8>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(anyhow!("503 service unavailable"));
            }
            Ok(self.answer.clone())
        }
    }

    struct Rejecting {
        calls: Arc<AtomicUsize>,
    }

    impl SnapshotSource for Rejecting {
        fn fetch(&self, _camera: &str, _timestamp: i64) -> Result<Option<Vec<u8>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(permanent(anyhow!("404 not found")))
        }
    }

    fn violation() -> CameraContext {
        let mut ctx = CameraContext::new(
            "CAM1",
            DetectionBatch {
                outputs: Vec::new(),
                timestamp: 1_706_679_450_000,
            },
        );
        ctx.violation_detected = true;
        ctx
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(2),
        }
    }

    #[test]
    fn request_body_carries_iso_time_and_fullframe_flag() {
        let body = snapshot_request(1_706_679_450_000).unwrap();
        assert_eq!(body["timestamp"], "2024-01-31T05:37:30.000Z");
        assert_eq!(body["fullframe"], "false");
    }

    #[test]
    fn transient_failures_are_retried_and_image_attached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut stage = ImageRetriever::new(
            Box::new(Flaky {
                failures: 2,
                calls: calls.clone(),
                answer: Some(vec![0xFF, 0xD8]),
            }),
            retry(),
        );
        let out = stage
            .process(violation(), &ShutdownSignal::new())
            .unwrap()
            .unwrap();
        assert_eq!(out.image.as_deref(), Some(&[0xFF, 0xD8][..]));
        assert!(out.violation_detected);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn missing_url_and_clean_batches_are_dropped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut stage = ImageRetriever::new(
            Box::new(Flaky {
                failures: 0,
                calls: calls.clone(),
                answer: None,
            }),
            retry(),
        );
        let shutdown = ShutdownSignal::new();
        assert!(stage.process(violation(), &shutdown).unwrap().is_none());

        let mut clean = violation();
        clean.violation_detected = false;
        assert!(stage.process(clean, &shutdown).unwrap().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut stage = ImageRetriever::new(
            Box::new(Rejecting {
                calls: calls.clone(),
            }),
            retry(),
        );
        assert!(stage.process(violation(), &ShutdownSignal::new()).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn client_errors_are_permanent_server_errors_are_not() {
        let status = |code: u16| {
            let response = ureq::Response::new(code, "status", "").unwrap();
            classify_http_error(ureq::Error::Status(code, response))
        };
        assert!(is_permanent(&status(400)));
        assert!(is_permanent(&status(404)));
        assert!(!is_permanent(&status(408)));
        assert!(!is_permanent(&status(429)));
        assert!(!is_permanent(&status(500)));
        assert!(!is_permanent(&status(503)));
    }

    #[test]
    fn exhausted_retries_surface_as_a_batch_error() {
        let mut stage = ImageRetriever::new(
            Box::new(Flaky {
                failures: 10,
                calls: Arc::new(AtomicUsize::new(0)),
                answer: None,
            }),
            retry(),
        );
        assert!(stage.process(violation(), &ShutdownSignal::new()).is_err());
    }
}
