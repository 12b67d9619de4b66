//! End-to-end tests: jobs submitted to the queue and run by the worker pool.


use std::time::Duration;

use opqueue::config::HookFailurePolicy;
use opqueue::error::QueueError;
use opqueue::opcodes::{OpCode, OpInput};
use opqueue::processor::OpErrorKind;
use opqueue::scheduler::job::{LogKind, OpResult, OpStatus, PRECEDING_FAILED_MESSAGE};
use opqueue::scheduler::JobStatus;
use tempfile::TempDir;
use test_harness::{start_master, wait_for, FakeRpc, TestMaster};

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

fn delay_on(node: &str) -> OpInput {
    OpInput::from(OpCode::TestDelay {
        duration: 0.0,
        on_master: false,
        on_nodes: vec![node.to_string()],
        repeat: 0,
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

fn jqueue(messages: &[&str]) -> OpInput {
    OpInput::from(OpCode::TestJqueue {
        log_messages: messages.iter().map(|m| m.to_string()).collect(),
        fail: false,
    })
}

/// Opcodes of a job run one after the other, in submission order.
#[tokio::test]
async fn test_opcodes_run_in_order() {
    let (_dir, master) = start_master(2).await;

    let id = master
        .queue
        .submit_job(vec![delay_on("node2"), startup("foo"), shutdown("foo")])
        .unwrap();
    let job = master.wait_finished(id, TIMEOUT).await;

    assert_eq!(job.calc_status(), JobStatus::Success);
    assert_eq!(
        master.rpc.methods(),
        vec!["test_delay", "instance_start", "instance_shutdown"]
    );
    for pair in job.ops.windows(2) {
        assert!(pair[0].end_timestamp.unwrap() <= pair[1].exec_timestamp.unwrap());
    }
    assert!(job.ops.iter().all(|op| op.status == OpStatus::Success));
    assert!(!master.cluster.snapshot().instances["foo"].admin_up);
    master.stop().await;
}

/// Two jobs needing the same instance lock never execute at the same time;
/// the second waits for the lock while the first runs.
#[tokio::test]
async fn test_exclusive_locks_serialize_jobs() {
    let (_dir, master) = start_master(4).await;
    master.rpc.set_delay("instance_start", Duration::from_millis(1000));
    master.rpc.set_delay("instance_shutdown", Duration::from_millis(300));

    let first = master.queue.submit_job(vec![startup("foo")]).unwrap();
    wait_for(&master.queue, first, TIMEOUT, |job| {
        job.ops[0].status == OpStatus::Running
    })
    .await;
    let second = master.queue.submit_job(vec![shutdown("foo")]).unwrap();
    let waiting = wait_for(&master.queue, second, TIMEOUT, |job| {
        job.ops[0].status == OpStatus::WaitLock
    })
    .await;
    assert_eq!(waiting.calc_status(), JobStatus::WaitLock);
    assert_eq!(
        master.queue.query_job(first).unwrap().calc_status(),
        JobStatus::Running
    );

    master.wait_finished(first, TIMEOUT).await;
    let job = master.wait_finished(second, TIMEOUT).await;
    assert_eq!(job.calc_status(), JobStatus::Success);

    let calls = master.rpc.op_calls();
    assert_eq!(calls.len(), 2);
    let (a, b) = (&calls[0], &calls[1]);
    assert!(
        a.finished <= b.started || b.finished <= a.started,
        "calls overlapped: {:?} / {:?}",
        a,
        b
    );
    assert!(master.locks.info().is_empty(), "all locks released");
    master.stop().await;
}

/// A failing opcode fails the job; later opcodes are not executed.
#[tokio::test]
async fn test_failed_opcode_fails_rest_of_job() {
    let (_dir, master) = start_master(1).await;
    master.rpc.fail("instance_start", "hypervisor refused");

    let id = master
        .queue
        .submit_job(vec![delay_on("node3"), startup("foo"), shutdown("foo")])
        .unwrap();
    let job = master.wait_finished(id, TIMEOUT).await;

    assert_eq!(job.calc_status(), JobStatus::Error);
    assert_eq!(job.ops[0].status, OpStatus::Success);
    assert_eq!(job.ops[1].status, OpStatus::Error);
    match &job.ops[1].result {
        Some(OpResult::Error(e)) => {
            assert_eq!(e.kind, OpErrorKind::Exec);
            assert!(e.message.contains("hypervisor refused"));
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(job.ops[2].status, OpStatus::Error);
    match &job.ops[2].result {
        Some(OpResult::Error(e)) => assert_eq!(e.message, PRECEDING_FAILED_MESSAGE),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(master.rpc.count("instance_shutdown"), 0);
    master.stop().await;
}

/// Prerequisite failures are reported without contacting any node.
#[tokio::test]
async fn test_prereq_failure_skips_execution() {
    let (_dir, master) = start_master(1).await;

    let id = master.queue.submit_job(vec![startup("missing")]).unwrap();
    let job = master.wait_finished(id, TIMEOUT).await;

    assert_eq!(job.calc_status(), JobStatus::Error);
    match &job.ops[0].result {
        Some(OpResult::Error(e)) => assert_eq!(e.kind, OpErrorKind::Prereq),
        other => panic!("unexpected result {:?}", other),
    }
    assert!(master.rpc.calls().is_empty());
    master.stop().await;
}

/// A failing pre-execution hook aborts the opcode before it runs.
#[tokio::test]
async fn test_pre_hook_failure_aborts_opcode() {
    let (_dir, master) = start_master(1).await;
    master.rpc.fail("hooks_runner", "hook script crashed");

    let id = master.queue.submit_job(vec![startup("foo")]).unwrap();
    let job = master.wait_finished(id, TIMEOUT).await;

    match &job.ops[0].result {
        Some(OpResult::Error(e)) => assert_eq!(e.kind, OpErrorKind::Hooks),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(master.rpc.count("instance_start"), 0);
    master.stop().await;
}

/// Dry runs check prerequisites only.
#[tokio::test]
async fn test_dry_run_does_not_execute() {
    let (_dir, master) = start_master(1).await;

    let mut op = startup("foo");
    op.dry_run = true;
    let id = master.queue.submit_job(vec![op]).unwrap();
    let job = master.wait_finished(id, TIMEOUT).await;

    assert_eq!(job.calc_status(), JobStatus::Success);
    assert!(master.rpc.op_calls().is_empty());
    master.stop().await;
}

/// Canceling a queued job finishes it without running anything.
#[tokio::test]
async fn test_cancel_queued_job() {
    let (_dir, mut master) = start_master(0).await;

    let id = master
        .queue
        .submit_job(vec![startup("foo"), shutdown("foo")])
        .unwrap();
    let outcome = master.queue.cancel_job(id).unwrap();
    assert!(outcome.success);

    let again = master.queue.cancel_job(id).unwrap();
    assert!(!again.success, "second cancel must be refused");

    master.start(2);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let job = master.queue.query_job(id).unwrap();
    assert_eq!(job.calc_status(), JobStatus::Canceled);
    assert!(job.ops.iter().all(|op| op.status == OpStatus::Canceled));
    assert!(master.rpc.calls().is_empty());
    master.stop().await;
}

/// Canceling a job waiting for locks stops it before it executes.
#[tokio::test]
async fn test_cancel_job_waiting_for_locks() {
    let (_dir, master) = start_master(2).await;
    master.rpc.set_delay("instance_start", Duration::from_millis(500));

    let holder = master.queue.submit_job(vec![startup("foo")]).unwrap();
    test_harness::wait_for(&master.queue, holder, TIMEOUT, |job| {
        job.calc_status() == JobStatus::Running
    })
    .await;
    let waiter = master.queue.submit_job(vec![shutdown("foo")]).unwrap();
    test_harness::wait_for(&master.queue, waiter, TIMEOUT, |job| {
        job.calc_status() == JobStatus::WaitLock
    })
    .await;

    let outcome = master.queue.cancel_job(waiter).unwrap();
    assert!(outcome.success);
    let job = master.wait_finished(waiter, TIMEOUT).await;
    assert_eq!(job.calc_status(), JobStatus::Canceled);

    let job = master.wait_finished(holder, TIMEOUT).await;
    assert_eq!(job.calc_status(), JobStatus::Success);
    assert_eq!(master.rpc.count("instance_shutdown"), 0);
    master.stop().await;
}

/// More urgent jobs are picked first.
#[tokio::test]
async fn test_priority_order_with_single_worker() {
    let (_dir, mut master) = start_master(0).await;

    let low = master.queue.submit_job(vec![jqueue(&[]).with_priority(10)]).unwrap();
    let normal = master.queue.submit_job(vec![jqueue(&[])]).unwrap();
    let high = master.queue.submit_job(vec![jqueue(&[]).with_priority(-10)]).unwrap();

    master.start(1);
    let mut order = Vec::new();
    for id in [low, normal, high] {
        let job = master.wait_finished(id, TIMEOUT).await;
        order.push((job.ops[0].exec_timestamp.unwrap(), id));
    }
    order.sort();
    let ids: Vec<_> = order.into_iter().map(|(_, id)| id).collect();
    assert_eq!(ids, vec![high, normal, low]);
    master.stop().await;
}

/// Jobs wait for their dependencies and fail when a dependency ends badly.
#[tokio::test]
async fn test_dependencies_order_and_fail_jobs() {
    let (_dir, master) = start_master(4).await;

    let results = master.queue.submit_many_jobs(vec![
        vec![master_delay(0.3)],
        vec![jqueue(&["after"]).with_dependency(-1, vec![JobStatus::Success])],
        vec![jqueue(&[]).with_dependency(-2, vec![JobStatus::Error])],
    ]);
    let ids: Vec<_> = results.into_iter().map(Result::unwrap).collect();

    let first = master.wait_finished(ids[0], TIMEOUT).await;
    let second = master.wait_finished(ids[1], TIMEOUT).await;
    let third = master.wait_finished(ids[2], TIMEOUT).await;

    assert_eq!(first.calc_status(), JobStatus::Success);
    assert_eq!(second.calc_status(), JobStatus::Success);
    assert!(first.end_timestamp.unwrap() <= second.ops[0].exec_timestamp.unwrap());
    assert_eq!(second.ops[0].log[0].kind, LogKind::JqueueTest);

    assert_eq!(third.calc_status(), JobStatus::Error);
    match &third.ops[0].result {
        Some(OpResult::Error(e)) => assert_eq!(e.kind, OpErrorKind::Dependency),
        other => panic!("unexpected result {:?}", other),
    }
    master.stop().await;
}

/// Clients waiting for a change are woken when the job moves on.
#[tokio::test]
async fn test_wait_for_job_change_sees_progress() {
    let (_dir, mut master) = start_master(0).await;

    let id = master
        .queue
        .submit_job(vec![jqueue(&["one", "two"])])
        .unwrap();
    let waiter = {
        let queue = master.queue.clone();
        tokio::spawn(async move {
            queue
                .wait_for_job_change(id, Some(JobStatus::Queued), 0, Duration::from_secs(5))
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    master.start(1);

    let change = tokio::time::timeout(TIMEOUT, waiter).await.unwrap().unwrap();
    assert!(change.changed);
    assert_ne!(change.status, JobStatus::Queued);

    let job = master.wait_finished(id, TIMEOUT).await;
    let all = master
        .queue
        .wait_for_job_change(id, None, 0, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(all.log_entries.len(), 2);
    assert_eq!(all.log_entries[1].message, "two");
    assert!(job.log_serial >= 2);
    master.stop().await;
}

/// Post-hook failures are logged under the warn policy.
#[tokio::test]
async fn test_post_hook_failure_warns() {
    let (_dir, master) = start_master(1).await;
    master.rpc.fail_hooks("post", "post hook failed");

    let id = master.queue.submit_job(vec![startup("foo")]).unwrap();
    let job = master.wait_finished(id, TIMEOUT).await;

    assert_eq!(job.calc_status(), JobStatus::Success);
    assert!(job.ops[0]
        .log
        .iter()
        .any(|entry| entry.message.contains("Post hooks failed")));
    master.stop().await;
}

/// Post-hook failures fail the opcode under the fatal policy.
#[tokio::test]
async fn test_post_hook_failure_fatal() {
    let dir = TempDir::new().unwrap();
    let rpc = FakeRpc::new();
    rpc.fail_hooks("post", "post hook failed");
    let mut master = TestMaster::open(dir.path(), rpc.clone(), HookFailurePolicy::Fatal).await;
    master.start(1);

    let id = master.queue.submit_job(vec![startup("foo")]).unwrap();
    let job = master.wait_finished(id, TIMEOUT).await;

    assert_eq!(job.calc_status(), JobStatus::Error);
    match &job.ops[0].result {
        Some(OpResult::Error(e)) => assert_eq!(e.kind, OpErrorKind::Hooks),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(rpc.count("instance_start"), 1);
    master.stop().await;
}

/// An opcode that panics fails its job with an internal error; the worker
/// keeps going and the job's locks are released.
#[tokio::test]
async fn test_panicking_opcode_fails_job_and_releases_locks() {
    let (_dir, master) = start_master(1).await;
    master.rpc.panic_on("instance_start");

    let broken = master.queue.submit_job(vec![startup("foo"), shutdown("foo")]).unwrap();
    let job = master.wait_finished(broken, TIMEOUT).await;
    assert_eq!(job.calc_status(), JobStatus::Error);
    match &job.ops[0].result {
        Some(OpResult::Error(e)) => {
            assert_eq!(e.kind, OpErrorKind::Internal);
            assert!(e.message.contains("scripted panic in instance_start"));
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(job.ops[1].status, OpStatus::Error);
    assert!(master.locks.info().is_empty(), "locks of the failed job released");

    // Same worker, same instance lock, and the BGL exclusively.
    let next = master
        .queue
        .submit_job(vec![
            shutdown("foo"),
            OpInput::from(OpCode::ClusterRename {
                name: "renamed.test".to_string(),
            }),
        ])
        .unwrap();
    let job = master.wait_finished(next, TIMEOUT).await;
    assert_eq!(job.calc_status(), JobStatus::Success);
    assert!(master.locks.info().is_empty());
    master.stop().await;
}

/// Delays that do not fit a duration are refused at submission.
#[tokio::test]
async fn test_oversized_delay_is_rejected() {
    let (_dir, master) = start_master(1).await;

    assert!(matches!(
        master.queue.submit_job(vec![master_delay(1e30)]),
        Err(QueueError::Validation(_))
    ));
    let id = master.queue.submit_job(vec![jqueue(&["after"])]).unwrap();
    let job = master.wait_finished(id, TIMEOUT).await;
    assert_eq!(job.calc_status(), JobStatus::Success);
    assert!(master.locks.info().is_empty());
    master.stop().await;
}
