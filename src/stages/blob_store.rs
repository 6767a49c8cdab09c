use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use std::path::{Path, PathBuf};

use crate::model::CameraContext;
use crate::pipeline::{Processor, ShutdownSignal};
use crate::retry::RetryPolicy;

/// Writes rendered violation snapshots into a directory.
pub struct BlobStore {
    dir: PathBuf,
    retry: RetryPolicy,
}

impl BlobStore {
    pub fn open(dir: &Path, retry: RetryPolicy) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create blob directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            retry,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Processor for BlobStore {
    fn process(
        &mut self,
        ctx: CameraContext,
        shutdown: &ShutdownSignal,
    ) -> Result<Option<CameraContext>> {
        let image = ctx
            .image
            .as_deref()
            .ok_or_else(|| anyhow!("no rendered image to store"))?;
        let path = self
            .dir
            .join(blob_name(&ctx.camera_serial, ctx.inference.timestamp));
        self.retry.run("blob write", shutdown, || {
            std::fs::write(&path, image).with_context(|| format!("write {}", path.display()))
        })?;
        log::info!("stored snapshot {}", path.display());
        Ok(Some(ctx))
    }
}

/// `{camera}_{timestamp}_{random}.jpg`. Characters outside
/// `[A-Za-z0-9_-]` in the camera serial become `_`.
pub fn blob_name(camera: &str, timestamp: i64) -> String {
    let mut suffix = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut suffix);
    let camera: String = camera
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_{}_{}.jpg", camera, timestamp, hex::encode(suffix))
}
