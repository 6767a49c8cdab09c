use anyhow::Result;
use rusqlite::{params, Connection};

use crate::model::{iso_timestamp, CameraContext};
use crate::pipeline::{Processor, ShutdownSignal};

/// One recorded detection.
#[derive(Clone, Debug, PartialEq)]
pub struct AuditRow {
    pub camera_serial: String,
    pub class: i32,
    pub detection_id: i32,
    pub score: f64,
    /// `[left, top, right, bottom]`, i.e. `[xmin, ymin, xmax, ymax]`.
    pub bbox: [f64; 4],
    pub epoch_ms: i64,
    pub detected_at: String,
    pub image_name: Option<String>,
    pub violation: bool,
    pub confined_space: bool,
}

/// SQLite audit trail of detections, one row per output.
///
/// Records violations only, or every batch when `log_all` is set.
pub struct AuditLog {
    conn: Connection,
    log_all: bool,
}

impl AuditLog {
    pub fn open(db_path: &str, log_all: bool) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let log = Self { conn, log_all };
        log.ensure_schema()?;
        Ok(log)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_serial TEXT NOT NULL,
              class INTEGER NOT NULL,
              detection_id INTEGER NOT NULL,
              score REAL NOT NULL,
              bbox_left REAL NOT NULL,
              bbox_top REAL NOT NULL,
              bbox_right REAL NOT NULL,
              bbox_bottom REAL NOT NULL,
              epoch_ms INTEGER NOT NULL,
              detected_at TEXT NOT NULL,
              image_name TEXT,
              violation INTEGER NOT NULL,
              confined_space INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_detections_camera_time
              ON detections(camera_serial, epoch_ms);
            "#,
        )?;
        Ok(())
    }

    /// Writes the batch if it qualifies. Returns the number of rows added.
    pub fn record(&mut self, ctx: &CameraContext) -> Result<usize> {
        if !(ctx.violation_detected || self.log_all) {
            return Ok(0);
        }
        let camera = ctx.camera_serial.as_str();
        let epoch_ms = ctx.inference.timestamp;
        let detected_at = iso_timestamp(epoch_ms)?;
        let image_name = ctx
            .violation_detected
            .then(|| format!("{}_{}.jpg", camera, epoch_ms));

        let tx = self.conn.transaction()?;
        for output in &ctx.inference.outputs {
            let [left, top, right, bottom] = output.location;
            tx.execute(
                r#"
                INSERT INTO detections(camera_serial, class, detection_id, score,
                  bbox_left, bbox_top, bbox_right, bbox_bottom,
                  epoch_ms, detected_at, image_name, violation, confined_space)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
                params![
                    camera,
                    output.class,
                    output.id,
                    f64::from(output.score),
                    f64::from(left),
                    f64::from(top),
                    f64::from(right),
                    f64::from(bottom),
                    epoch_ms,
                    detected_at,
                    image_name,
                    ctx.violation_detected,
                    ctx.confined_space_violation
                ],
            )?;
        }
        tx.commit()?;
        Ok(ctx.inference.outputs.len())
    }

    pub fn count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))?)
    }

    /// Rows for `camera`, oldest first.
    pub fn rows_for(&self, camera: &str) -> Result<Vec<AuditRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT camera_serial, class, detection_id, score,
                   bbox_left, bbox_top, bbox_right, bbox_bottom,
                   epoch_ms, detected_at, image_name, violation, confined_space
            FROM detections WHERE camera_serial = ?1 ORDER BY id
            "#,
        )?;
        let mut rows = stmt.query(params![camera])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(AuditRow {
                camera_serial: row.get(0)?,
                class: row.get(1)?,
                detection_id: row.get(2)?,
                score: row.get(3)?,
                bbox: [row.get(4)?, row.get(5)?, row.get(6)?, row.get(7)?],
                epoch_ms: row.get(8)?,
                detected_at: row.get(9)?,
                image_name: row.get(10)?,
                violation: row.get(11)?,
                confined_space: row.get(12)?,
            });
        }
        Ok(out)
    }
}

impl Processor for AuditLog {
    fn process(
        &mut self,
        ctx: CameraContext,
        _shutdown: &ShutdownSignal,
    ) -> Result<Option<CameraContext>> {
        let written = self.record(&ctx)?;
        if written > 0 {
            log::debug!(
                "logged {} detection(s) for {} at {}",
                written,
                ctx.camera_serial,
                ctx.inference.timestamp
            );
        }
        Ok(Some(ctx))
    }
}
