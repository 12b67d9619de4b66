//! Durable job queue storage.
//!
//! Jobs are plain JSON files in the queue directory:
//!
//! ```text
//! queue_dir/
//!   version            queue format version
//!   serial             last assigned job id
//!   drain              present while the queue refuses new jobs
//!   lock               advisory lock held by the running master
//!   job-<id>           live jobs
//!   archive/<n>/job-<id>   archived jobs, n = id / 10000
//! ```
//!
//! Every write goes through [`write_atomic`]: a temporary file in the target
//! directory is written, synced and renamed over the destination, so readers
//! see either the old or the new content.

mod jstore;

use std::fs::File;
use std::io::Write;
use std::path::Path;

pub use jstore::{JobStore, JOBS_PER_ARCHIVE_DIRECTORY, JOB_QUEUE_VERSION};

/// Replace `path` with `data` atomically and durably.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    // Make the rename itself durable.
    File::open(dir)?.sync_all()?;
    Ok(())
}
