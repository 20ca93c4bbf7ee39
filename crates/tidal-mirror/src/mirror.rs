//! Reconcile a destination drive with a source drive.

use tidal_drive::{Drive, DriveBatch, DriveError};
use tracing::{debug, info};

use crate::diff::{Change, DiffOp, DiffRecord, DiffWalk};
use crate::error::{MirrorError, MirrorResult};

/// How a mirror runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MirrorOptions {
    /// Report the diff without touching the destination.
    pub dry_run: bool,
    /// Commit all records in one destination batch instead of one batch per
    /// record.
    pub batch: bool,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            batch: true,
        }
    }
}

impl MirrorOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            batch: true,
        }
    }
}

/// Outcome of one mirror run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MirrorReport {
    /// Records in the order they were produced.
    pub records: Vec<DiffRecord>,
    /// Whether the records were written to the destination.
    pub applied: bool,
    /// Destination metadata length afterwards.
    pub length: u64,
}

impl MirrorReport {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn count(&self, op: DiffOp) -> usize {
        self.records.iter().filter(|r| r.op == op).count()
    }

    pub fn bytes_added(&self) -> u64 {
        self.records.iter().map(|r| r.bytes_added).sum()
    }

    pub fn bytes_removed(&self) -> u64 {
        self.records.iter().map(|r| r.bytes_removed).sum()
    }
}

/// Mirror `src` into `dst`, calling `progress` for every record as it is
/// produced (dry run) or staged (apply).
///
/// In apply mode a failure while copying any record aborts before the batch
/// holding it is committed and is reported as [`MirrorError::MirrorFailed`].
pub async fn mirror<F>(
    src: &Drive,
    dst: &Drive,
    options: MirrorOptions,
    mut progress: F,
) -> MirrorResult<MirrorReport>
where
    F: FnMut(&DiffRecord),
{
    let walk = DiffWalk::new(src, dst).await?;
    let mut report = MirrorReport {
        applied: !options.dry_run,
        ..MirrorReport::default()
    };

    if options.dry_run {
        for change in walk {
            progress(&change.record);
            report.records.push(change.record);
        }
        report.length = dst.length();
        debug!(records = report.len(), "dry-run mirror complete");
        return Ok(report);
    }

    let changes: Vec<Change> = walk.collect();
    if options.batch {
        let mut batch = dst.batch().await?;
        for change in changes {
            stage(src, &mut batch, &change).await?;
            progress(&change.record);
            report.records.push(change.record);
        }
        report.length = batch.flush().await?;
    } else {
        for change in changes {
            let mut batch = dst.batch().await?;
            stage(src, &mut batch, &change).await?;
            report.length = batch.flush().await?;
            progress(&change.record);
            report.records.push(change.record);
        }
        report.length = report.length.max(dst.length());
    }

    info!(
        records = report.len(),
        bytes_added = report.bytes_added(),
        bytes_removed = report.bytes_removed(),
        length = report.length,
        "mirror applied"
    );
    Ok(report)
}

/// Stage one change into `batch`, copying and verifying source bytes.
async fn stage(src: &Drive, batch: &mut DriveBatch, change: &Change) -> MirrorResult<()> {
    let key = &change.record.key;
    match (&change.record.op, &change.source) {
        (DiffOp::Remove, _) => batch.del(key),
        (_, Some(value)) => {
            let data = src
                .read_value(key, value)
                .await
                .map_err(|e| failed(key, e))?;
            if data.len() as u64 != value.len() {
                return Err(MirrorError::MirrorFailed {
                    key: key.clone(),
                    reason: format!("read {} bytes, expected {}", data.len(), value.len()),
                });
            }
            batch.put(key, data).await?;
        }
        (_, None) => {
            return Err(MirrorError::MirrorFailed {
                key: key.clone(),
                reason: "no source value".into(),
            })
        }
    }
    debug!(key = %key, op = %change.record.op, "staged");
    Ok(())
}

fn failed(key: &str, err: DriveError) -> MirrorError {
    MirrorError::MirrorFailed {
        key: key.to_string(),
        reason: err.to_string(),
    }
}
