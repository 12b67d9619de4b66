//! Persistence across master restarts.


use std::time::Duration;

use opqueue::config::{HookFailurePolicy, QueueConfig};
use opqueue::error::QueueError;
use opqueue::opcodes::{OpCode, OpInput};
use opqueue::scheduler::job::OpStatus;
use opqueue::scheduler::{JobFilter, JobStatus};
use tempfile::TempDir;
use test_harness::{wait_for, FakeRpc, TestMaster};

const TIMEOUT: Duration = Duration::from_secs(10);

fn startup(instance: &str) -> OpInput {
    OpInput::from(OpCode::InstanceStartup {
        instance_name: instance.to_string(),
        force: false,
    })
}

fn shutdown(instance: &str) -> OpInput {
    OpInput::from(OpCode::InstanceShutdown {
        instance_name: instance.to_string(),
        timeout_secs: 1,
    })
}

fn master_delay(seconds: f64) -> OpInput {
    OpInput::from(OpCode::TestDelay {
        duration: seconds,
        on_master: true,
        on_nodes: vec![],
        repeat: 0,
    })
}

/// Job ids keep increasing across restarts and submitted jobs survive.
#[tokio::test]
async fn test_job_ids_survive_restart() {
    let dir = TempDir::new().unwrap();

    let master = TestMaster::open(dir.path(), FakeRpc::new(), HookFailurePolicy::Warn).await;
    let first = master.queue.submit_job(vec![startup("foo")]).unwrap();
    let second = master
        .queue
        .submit_job(vec![startup("foo"), shutdown("foo")])
        .unwrap();
    assert!(first < second);
    drop(master);

    let master = TestMaster::open(dir.path(), FakeRpc::new(), HookFailurePolicy::Warn).await;
    let third = master.queue.submit_job(vec![shutdown("foo")]).unwrap();
    assert!(third > second);

    let job = master.queue.query_job(second).unwrap();
    assert_eq!(job.ops.len(), 2);
    assert_eq!(job.ops[1].input, shutdown("foo"));
    assert_eq!(job.calc_status(), JobStatus::Queued);
    assert_eq!(master.queue.info().live_jobs, 3);
    assert_eq!(master.queue.info().ready_jobs, 3);
}

/// A job interrupted in its third opcode resumes there; finished opcodes
/// are not run again.
#[test]
fn test_restart_resumes_interrupted_opcode() {
    let dir = TempDir::new().unwrap();
    let first_rpc = FakeRpc::new();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let id = runtime.block_on(async {
        let mut master =
            TestMaster::open(dir.path(), first_rpc.clone(), HookFailurePolicy::Warn).await;
        master.start(1);
        let id = master
            .queue
            .submit_job(vec![startup("foo"), shutdown("foo"), master_delay(1.0)])
            .unwrap();
        wait_for(&master.queue, id, TIMEOUT, |job| {
            job.ops[2].status == OpStatus::Running
        })
        .await;
        // Dropping the master aborts the worker in the middle of the delay.
        drop(master);
        id
    });
    runtime.shutdown_timeout(Duration::from_secs(1));
    assert_eq!(first_rpc.count("instance_start"), 1);
    assert_eq!(first_rpc.count("instance_shutdown"), 1);

    let second_rpc = FakeRpc::new();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let mut master =
            TestMaster::open(dir.path(), second_rpc.clone(), HookFailurePolicy::Warn).await;
        let job = master.queue.query_job(id).unwrap();
        assert_eq!(job.ops[0].status, OpStatus::Success);
        assert_eq!(job.ops[1].status, OpStatus::Success);
        assert_eq!(job.ops[2].status, OpStatus::Queued);
        assert_eq!(job.calc_status(), JobStatus::Queued);

        master.start(1);
        let job = master.wait_finished(id, TIMEOUT).await;
        assert_eq!(job.calc_status(), JobStatus::Success);
        master.stop().await;
    });
    assert_eq!(second_rpc.count("instance_start"), 0);
    assert_eq!(second_rpc.count("instance_shutdown"), 0);
}

/// Finished and archived jobs stay queryable after a restart.
#[tokio::test]
async fn test_archived_jobs_survive_restart() {
    let dir = TempDir::new().unwrap();

    let mut master = TestMaster::open(dir.path(), FakeRpc::new(), HookFailurePolicy::Warn).await;
    master.start(1);
    let id = master.queue.submit_job(vec![startup("foo")]).unwrap();
    master.wait_finished(id, TIMEOUT).await;
    assert!(master.queue.archive_job(id).unwrap());
    master.stop().await;

    let master = TestMaster::open(dir.path(), FakeRpc::new(), HookFailurePolicy::Warn).await;
    let job = master.queue.query_job(id).unwrap();
    assert_eq!(job.calc_status(), JobStatus::Success);

    let live = master.queue.query_jobs(&JobFilter::default()).unwrap();
    assert!(live.iter().all(|job| job.id != id));
    let all = master
        .queue
        .query_jobs(&JobFilter {
            include_archived: true,
            ..Default::default()
        })
        .unwrap();
    assert!(all.iter().any(|job| job.id == id));
}

/// The drain flag is stored with the queue.
#[tokio::test]
async fn test_drain_flag_survives_restart() {
    let dir = TempDir::new().unwrap();

    let master = TestMaster::open(dir.path(), FakeRpc::new(), HookFailurePolicy::Warn).await;
    master.queue.set_drain_flag(true).unwrap();
    drop(master);

    let master = TestMaster::open(dir.path(), FakeRpc::new(), HookFailurePolicy::Warn).await;
    assert!(master.queue.drain_flag());
    assert!(matches!(
        master.queue.submit_job(vec![startup("foo")]),
        Err(QueueError::Drained)
    ));
    master.queue.set_drain_flag(false).unwrap();
    assert!(master.queue.submit_job(vec![startup("foo")]).is_ok());
}

/// Submissions beyond the job file limit are refused without using an id.
#[tokio::test]
async fn test_full_queue_rejects_jobs() {
    let dir = TempDir::new().unwrap();
    let config = QueueConfig::new(dir.path()).with_max_live_jobs(2);

    let master = TestMaster::open_with(config, FakeRpc::new(), HookFailurePolicy::Warn).await;
    master.queue.submit_job(vec![startup("foo")]).unwrap();
    let last = master.queue.submit_job(vec![startup("foo")]).unwrap();
    assert!(matches!(
        master.queue.submit_job(vec![startup("foo")]),
        Err(QueueError::Full(_))
    ));
    assert_eq!(master.queue.info().last_serial, last);
}
