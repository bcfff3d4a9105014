//! Integration tests for chains resumed on another worker thread

use crossbeam::channel;
use stackfork_core::shadow::{await_op, call};
use stackfork_core::{
    Awaiter, Completion, Exception, FrameSpec, IntoReturnValue, Oneshot, Resumption, ReturnValue,
    ShadowBackend, Suspender,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

enum Job {
    Complete(Oneshot<u32>, u32),
    Stop,
}

/// Worker that completes operations it receives
fn spawn_worker() -> (channel::Sender<Job>, thread::JoinHandle<()>) {
    let (tx, rx) = channel::unbounded::<Job>();
    let handle = thread::spawn(move || {
        while let Ok(job) = rx.recv() {
            match job {
                Job::Complete(op, value) => op.complete(value).unwrap(),
                Job::Stop => break,
            }
        }
    });
    (tx, handle)
}

#[test_log::test]
fn test_resume_on_worker_thread() {
    let suspender = Suspender::new(ShadowBackend::new());
    let (tx, worker) = spawn_worker();
    let op = Oneshot::<u32>::new();
    let ran_on = Arc::new(parking_lot::Mutex::new(None));

    let body_op = op.clone();
    let recorded = ran_on.clone();
    let completion = suspender
        .run::<u32, _>(move || {
            call(
                FrameSpec::scalar(128),
                move || Ok(await_op(body_op)?.into_return()),
                move |v| {
                    *recorded.lock() = Some(thread::current().id());
                    Ok(ReturnValue::Scalar(v.as_scalar().unwrap_or(0) + 1))
                },
            )
        })
        .unwrap();
    let future = completion.into_future().unwrap();

    tx.send(Job::Complete(op, 41)).unwrap();
    let result = future.wait_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.unwrap(), 42);

    tx.send(Job::Stop).unwrap();
    let worker_id = worker.thread().id();
    worker.join().unwrap();

    assert_eq!(*ran_on.lock(), Some(worker_id));
    assert_ne!(worker_id, thread::current().id());
    assert_eq!(suspender.live_tasklets(), 0);
}

#[test_log::test]
fn test_many_chains_resumed_concurrently() {
    let suspender = Suspender::new(ShadowBackend::new());
    let workers: Vec<_> = (0..4).map(|_| spawn_worker()).collect();

    let mut futures = Vec::new();
    let mut ops = Vec::new();
    for i in 0..64u32 {
        let op = Oneshot::<u32>::new();
        let body_op = op.clone();
        let completion = suspender
            .run::<u32, _>(move || {
                call(
                    FrameSpec::scalar(64),
                    move || Ok(await_op(body_op)?.into_return()),
                    move |v| Ok(ReturnValue::Scalar(v.as_scalar().unwrap_or(0) + i as usize)),
                )
            })
            .unwrap();
        match completion {
            Completion::Pending(future) => futures.push(future),
            Completion::Ready(_) => panic!("chain {i} did not suspend"),
        }
        ops.push(op);
    }
    assert_eq!(suspender.live_tasklets(), 128);

    for (i, op) in ops.into_iter().enumerate() {
        let (tx, _) = &workers[i % workers.len()];
        tx.send(Job::Complete(op, 1000)).unwrap();
    }

    for (i, future) in futures.iter().enumerate() {
        assert_eq!(future.wait().unwrap(), 1000 + i as u32);
    }

    for (tx, handle) in workers {
        tx.send(Job::Stop).unwrap();
        handle.join().unwrap();
    }
    assert_eq!(suspender.live_tasklets(), 0);
}

#[test_log::test]
fn test_completion_races_with_commit() {
    // The operation completes on another thread as soon as the resumption
    // registers, while the suspending thread has not committed yet.
    for _ in 0..32 {
        let suspender = Suspender::new(ShadowBackend::new());
        let (tx, worker) = spawn_worker();
        let op = Oneshot::<u32>::new();

        let body_op = op.clone();
        let completion = suspender
            .run::<u32, _>(move || {
                call(
                    FrameSpec::scalar(64),
                    move || {
                        let value = await_op(RacingOp {
                            op: body_op,
                            tx: tx.clone(),
                        })?;
                        Ok(value.into_return())
                    },
                    |v| Ok(v),
                )
            })
            .unwrap();

        let value = match completion {
            Completion::Ready(v) => v,
            Completion::Pending(future) => future
                .wait_timeout(Duration::from_secs(5))
                .unwrap()
                .unwrap(),
        };
        assert_eq!(value, 5);
        assert_eq!(suspender.live_tasklets(), 0);
        worker.join().unwrap();
    }
}

/// Forwards completion to a worker from inside registration
struct RacingOp {
    op: Oneshot<u32>,
    tx: channel::Sender<Job>,
}

impl Awaiter for RacingOp {
    type Output = u32;

    fn is_completed(&self) -> bool {
        self.op.is_completed()
    }

    fn on_completed(&self, resumption: Resumption) -> Result<(), Exception> {
        self.op.on_completed(resumption)?;
        self.tx.send(Job::Complete(self.op.clone(), 5)).unwrap();
        self.tx.send(Job::Stop).unwrap();
        Ok(())
    }

    fn result(&self) -> Result<u32, Exception> {
        self.op.result()
    }
}
