use std::fs::{self, File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use super::write_atomic;
use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::opcodes::OpInput;
use crate::scheduler::job::{Job, JobId};

pub const JOB_QUEUE_VERSION: u32 = 1;
pub const JOBS_PER_ARCHIVE_DIRECTORY: JobId = 10_000;

const JOB_FILE_PREFIX: &str = "job-";
const VERSION_FILE: &str = "version";
const SERIAL_FILE: &str = "serial";
const DRAIN_FILE: &str = "drain";
const LOCK_FILE: &str = "lock";
const ARCHIVE_DIR: &str = "archive";

struct StoreState {
    last_serial: JobId,
    queue_size: usize,
    drained: bool,
}

/// Job files, queue metadata and the archive of one queue directory.
///
/// The directory is locked with an exclusive advisory lock for the store's
/// lifetime. Within the process a mutex serializes serial allocation and
/// directory changes; job files themselves are read without it.
pub struct JobStore {
    queue_dir: PathBuf,
    archive_dir: PathBuf,
    max_live_jobs: usize,
    state: Mutex<StoreState>,
    cache: Mutex<LruCache<JobId, Job>>,
    _lock: Flock<File>,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("queue_dir", &self.queue_dir)
            .field("max_live_jobs", &self.max_live_jobs)
            .finish()
    }
}

impl JobStore {
    /// Open (or initialize) the queue directory.
    ///
    /// Fails if another process holds the queue lock or the on-disk format
    /// version differs from [`JOB_QUEUE_VERSION`].
    pub fn open(config: &QueueConfig) -> Result<Self> {
        let queue_dir = config.queue_dir.clone();
        let archive_dir = queue_dir.join(ARCHIVE_DIR);
        fs::create_dir_all(&archive_dir)?;

        let lock = lock_queue_dir(&queue_dir)?;
        check_version(&queue_dir)?;

        let ids = scan_job_ids(&queue_dir)?;
        let mut last_serial = read_serial(&queue_dir)?;
        if let Some(&highest) = ids.last() {
            if highest > last_serial {
                tracing::warn!(
                    serial = last_serial,
                    highest,
                    "Serial file is behind existing jobs, advancing it"
                );
                last_serial = highest;
                write_atomic(&queue_dir.join(SERIAL_FILE), format!("{}\n", last_serial).as_bytes())?;
            }
        }
        let drained = queue_dir.join(DRAIN_FILE).exists();
        let cache_size = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);

        tracing::info!(
            queue_dir = %queue_dir.display(),
            live_jobs = ids.len(),
            last_serial,
            drained,
            "Opened job queue"
        );

        Ok(Self {
            queue_dir,
            archive_dir,
            max_live_jobs: config.max_live_jobs,
            state: Mutex::new(StoreState {
                last_serial,
                queue_size: ids.len(),
                drained,
            }),
            cache: Mutex::new(LruCache::new(cache_size)),
            _lock: lock,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cache(&self) -> MutexGuard<'_, LruCache<JobId, Job>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn job_path(&self, id: JobId) -> PathBuf {
        self.queue_dir.join(format!("{}{}", JOB_FILE_PREFIX, id))
    }

    pub fn archived_job_path(&self, id: JobId) -> PathBuf {
        self.archive_dir
            .join((id / JOBS_PER_ARCHIVE_DIRECTORY).to_string())
            .join(format!("{}{}", JOB_FILE_PREFIX, id))
    }

    /// Allocate the next id and write the new job. Durable on return.
    pub fn create_job(&self, inputs: Vec<OpInput>) -> Result<Job> {
        let mut state = self.lock_state();
        if state.queue_size >= self.max_live_jobs {
            return Err(QueueError::Full(state.queue_size));
        }

        let id = state.last_serial + 1;
        write_atomic(&self.queue_dir.join(SERIAL_FILE), format!("{}\n", id).as_bytes())?;
        state.last_serial = id;

        let job = Job::new(id, inputs);
        self.write_job(&job)?;
        state.queue_size += 1;
        drop(state);

        self.lock_cache().put(id, job.clone());
        Ok(job)
    }

    pub fn update_job(&self, job: &Job) -> Result<()> {
        self.write_job(job)?;
        self.lock_cache().put(job.id, job.clone());
        Ok(())
    }

    fn write_job(&self, job: &Job) -> Result<()> {
        let data = serde_json::to_vec_pretty(job)?;
        write_atomic(&self.job_path(job.id), &data)?;
        Ok(())
    }

    /// Load a job from the cache, the live directory or (optionally) the
    /// archive. Unreadable live files are moved to the archive.
    pub fn load_job(&self, id: JobId, try_archived: bool) -> Result<Option<Job>> {
        if let Some(job) = self.lock_cache().get(&id) {
            return Ok(Some(job.clone()));
        }

        let path = self.job_path(id);
        match fs::read(&path) {
            Ok(data) => match serde_json::from_slice::<Job>(&data) {
                Ok(job) => {
                    self.lock_cache().put(id, job.clone());
                    return Ok(Some(job));
                }
                Err(e) => {
                    tracing::error!(job_id = id, error = %e, "Corrupt job file, archiving it");
                    self.move_to_archive(id)?;
                    return Ok(None);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if !try_archived {
            return Ok(None);
        }
        match fs::read(self.archived_job_path(id)) {
            Ok(data) => match serde_json::from_slice::<Job>(&data) {
                Ok(job) => Ok(Some(job)),
                Err(e) => Err(QueueError::Corrupt {
                    path: self.archived_job_path(id),
                    reason: e.to_string(),
                }),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of live job files, ascending.
    pub fn job_ids(&self) -> Result<Vec<JobId>> {
        scan_job_ids(&self.queue_dir)
    }

    /// Ids of archived jobs, ascending.
    pub fn archived_job_ids(&self) -> Result<Vec<JobId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.archive_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                ids.extend(scan_job_ids(&entry.path())?);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Move a job file into the archive. Returns false if it was not live.
    pub fn archive_job(&self, job: &Job) -> Result<bool> {
        let archived = self.move_to_archive(job.id)?;
        if archived {
            tracing::debug!(job_id = job.id, "Archived job");
        }
        Ok(archived)
    }

    fn move_to_archive(&self, id: JobId) -> Result<bool> {
        let mut state = self.lock_state();
        let src = self.job_path(id);
        if !src.exists() {
            return Ok(false);
        }
        let dst = self.archived_job_path(id);
        let dst_dir = dst.parent().unwrap_or(&self.archive_dir);
        fs::create_dir_all(dst_dir)?;
        fs::rename(&src, &dst)?;
        File::open(dst_dir)?.sync_all()?;
        File::open(&self.queue_dir)?.sync_all()?;
        state.queue_size = state.queue_size.saturating_sub(1);
        drop(state);

        self.lock_cache().pop(&id);
        Ok(true)
    }

    pub fn set_drain_flag(&self, drain: bool) -> Result<()> {
        let mut state = self.lock_state();
        let path = self.queue_dir.join(DRAIN_FILE);
        if drain {
            write_atomic(&path, b"")?;
        } else {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        state.drained = drain;
        Ok(())
    }

    pub fn drain_flag(&self) -> bool {
        self.lock_state().drained
    }

    pub fn last_serial(&self) -> JobId {
        self.lock_state().last_serial
    }

    /// Number of job files in the live directory.
    pub fn queue_size(&self) -> usize {
        self.lock_state().queue_size
    }

    pub fn max_live_jobs(&self) -> usize {
        self.max_live_jobs
    }
}

fn lock_queue_dir(queue_dir: &Path) -> Result<Flock<File>> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(queue_dir.join(LOCK_FILE))?;
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => Ok(lock),
        Err((_, Errno::EWOULDBLOCK)) => Err(QueueError::QueueLocked(queue_dir.to_path_buf())),
        Err((_, errno)) => Err(std::io::Error::from(errno).into()),
    }
}

fn check_version(queue_dir: &Path) -> Result<()> {
    let path = queue_dir.join(VERSION_FILE);
    match fs::read_to_string(&path) {
        Ok(content) => {
            let found: u32 = content.trim().parse().map_err(|_| QueueError::Corrupt {
                path: path.clone(),
                reason: format!("invalid version {:?}", content.trim()),
            })?;
            if found != JOB_QUEUE_VERSION {
                return Err(QueueError::VersionMismatch {
                    found,
                    expected: JOB_QUEUE_VERSION,
                });
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            write_atomic(&path, format!("{}\n", JOB_QUEUE_VERSION).as_bytes())?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn read_serial(queue_dir: &Path) -> Result<JobId> {
    let path = queue_dir.join(SERIAL_FILE);
    match fs::read_to_string(&path) {
        Ok(content) => content.trim().parse().map_err(|_| QueueError::Corrupt {
            path,
            reason: format!("invalid serial {:?}", content.trim()),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            write_atomic(&path, b"0\n")?;
            Ok(0)
        }
        Err(e) => Err(e.into()),
    }
}

fn scan_job_ids(dir: &Path) -> Result<Vec<JobId>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(id) = name
            .strip_prefix(JOB_FILE_PREFIX)
            .and_then(|rest| rest.parse::<JobId>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::OpCode;

    fn ops() -> Vec<OpInput> {
        vec![OpInput::from(OpCode::ClusterQuery {})]
    }

    #[test]
    fn ids_are_sequential_and_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = QueueConfig::new(dir.path());
        {
            let store = JobStore::open(&config).unwrap();
            assert_eq!(store.create_job(ops()).unwrap().id, 1);
            assert_eq!(store.create_job(ops()).unwrap().id, 2);
        }
        let store = JobStore::open(&config).unwrap();
        assert_eq!(store.last_serial(), 2);
        assert_eq!(store.create_job(ops()).unwrap().id, 3);
        assert_eq!(store.job_ids().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn second_open_is_refused_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        let config = QueueConfig::new(dir.path());
        let _store = JobStore::open(&config).unwrap();
        let err = JobStore::open(&config).unwrap_err();
        assert!(matches!(err, QueueError::QueueLocked(_)));
    }

    #[test]
    fn version_mismatch_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(VERSION_FILE), "7\n").unwrap();
        let err = JobStore::open(&QueueConfig::new(dir.path())).unwrap_err();
        assert!(matches!(
            err,
            QueueError::VersionMismatch {
                found: 7,
                expected: 1
            }
        ));
    }

    #[test]
    fn capacity_is_enforced_until_archival() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(&QueueConfig::new(dir.path()).with_max_live_jobs(2)).unwrap();
        let first = store.create_job(ops()).unwrap();
        store.create_job(ops()).unwrap();
        assert!(matches!(store.create_job(ops()), Err(QueueError::Full(2))));

        assert!(store.archive_job(&first).unwrap());
        assert_eq!(store.queue_size(), 1);
        assert_eq!(store.create_job(ops()).unwrap().id, 3);
    }

    #[test]
    fn archived_jobs_load_only_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(&QueueConfig::new(dir.path())).unwrap();
        let job = store.create_job(ops()).unwrap();
        store.archive_job(&job).unwrap();

        assert!(store.archived_job_path(1).ends_with("archive/0/job-1"));
        assert!(store.load_job(1, false).unwrap().is_none());
        assert_eq!(store.load_job(1, true).unwrap().unwrap().id, 1);
        assert_eq!(store.archived_job_ids().unwrap(), vec![1]);
        assert!(!store.archive_job(&job).unwrap());
    }

    #[test]
    fn corrupt_job_file_is_moved_to_archive() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(&QueueConfig::new(dir.path())).unwrap();
        let job = store.create_job(ops()).unwrap();
        fs::write(store.job_path(job.id), b"{not json").unwrap();
        store.lock_cache().clear();

        assert!(store.load_job(job.id, false).unwrap().is_none());
        assert!(!store.job_path(job.id).exists());
        assert!(store.archived_job_path(job.id).exists());
        assert_eq!(store.queue_size(), 0);
    }

    #[test]
    fn drain_flag_is_persistent() {
        let dir = tempfile::tempdir().unwrap();
        let config = QueueConfig::new(dir.path());
        {
            let store = JobStore::open(&config).unwrap();
            assert!(!store.drain_flag());
            store.set_drain_flag(true).unwrap();
        }
        let store = JobStore::open(&config).unwrap();
        assert!(store.drain_flag());
        store.set_drain_flag(false).unwrap();
        store.set_drain_flag(false).unwrap();
        assert!(!store.drain_flag());
    }
}
