//! Integration tests for chains that suspend again while replaying

use parking_lot::Mutex;
use stackfork_core::shadow::{await_op, await_with, call};
use stackfork_core::{
    Completion, FrameSpec, IntoReturnValue, Oneshot, Phase, ReturnValue, ShadowBackend,
    SuspendFuture, Suspender,
};
use std::sync::Arc;

type Trace = Arc<Mutex<Vec<&'static str>>>;

fn pending<T>(completion: Completion<T>) -> SuspendFuture<T> {
    match completion {
        Completion::Pending(future) => future,
        Completion::Ready(_) => panic!("chain completed without suspending"),
    }
}

fn scalar(v: &ReturnValue) -> usize {
    v.as_scalar().unwrap_or(0)
}

#[test_log::test]
fn test_nested_capture_replays_newest_frames_first() {
    let suspender = Suspender::new(ShadowBackend::new());
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
    let first = Oneshot::<u32>::new();
    let second = Oneshot::<u32>::new();

    let (t_outer, t_mid, t_inner) = (trace.clone(), trace.clone(), trace.clone());
    let (body_first, body_second) = (first.clone(), second.clone());
    let future = pending(
        suspender
            .run::<u32, _>(move || {
                call(
                    FrameSpec::scalar(64),
                    move || {
                        call(
                            FrameSpec::scalar(64),
                            move || Ok(await_op(body_first)?.into_return()),
                            move |v| {
                                t_mid.lock().push("mid");
                                let base = scalar(&v);
                                let second = body_second.clone();
                                let t_inner = t_inner.clone();
                                call(
                                    FrameSpec::scalar(64),
                                    move || Ok(await_op(second)?.into_return()),
                                    move |w| {
                                        t_inner.lock().push("inner");
                                        Ok(ReturnValue::Scalar(base + scalar(&w)))
                                    },
                                )
                            },
                        )
                    },
                    move |v| {
                        t_outer.lock().push("outer");
                        Ok(ReturnValue::Scalar(scalar(&v) * 10))
                    },
                )
            })
            .unwrap(),
    );

    first.complete(1).unwrap();

    // The mid frame suspended again; its new frames sit in front of the
    // outer frame captured earlier.
    assert!(!future.is_complete());
    assert_eq!(future.phase(), Phase::Suspended);
    assert_eq!(future.pending_tasklets(), 3);
    assert_eq!(*trace.lock(), vec!["mid"]);

    second.complete(2).unwrap();

    assert_eq!(future.get_result().unwrap(), 30);
    assert_eq!(*trace.lock(), vec!["mid", "inner", "outer"]);
    assert_eq!(suspender.live_tasklets(), 0);
}

#[test_log::test]
fn test_chain_awaits_another_suspended_chain() {
    let suspender = Suspender::new(ShadowBackend::new());
    let leaf = Oneshot::<u32>::new();

    let child_runtime = suspender.clone();
    let body_leaf = leaf.clone();
    let parent = pending(
        suspender
            .run::<u32, _>(move || {
                call(
                    FrameSpec::scalar(64),
                    move || {
                        let child = child_runtime.run::<u32, _>(move || {
                            call(
                                FrameSpec::scalar(64),
                                move || Ok(await_op(body_leaf)?.into_return()),
                                |v| Ok(ReturnValue::Scalar(scalar(&v) + 1)),
                            )
                        })?;
                        match child {
                            Completion::Ready(v) => Ok(v.into_return()),
                            Completion::Pending(future) => Ok(await_op(future)?.into_return()),
                        }
                    },
                    |v| Ok(ReturnValue::Scalar(scalar(&v) * 3)),
                )
            })
            .unwrap(),
    );

    // Parent: outer + await-child. Child: its frame + await-leaf.
    assert_eq!(suspender.live_tasklets(), 4);
    assert_eq!(parent.pending_tasklets(), 2);

    leaf.complete(4).unwrap();

    assert_eq!(parent.get_result().unwrap(), 15);
    assert_eq!(suspender.live_tasklets(), 0);
}

#[test_log::test]
fn test_awaiting_completed_chain_runs_in_place() {
    let suspender = Suspender::new(ShadowBackend::new());
    let leaf = Oneshot::<u32>::new();

    let body_leaf = leaf.clone();
    let child = pending(
        suspender
            .run::<u32, _>(move || {
                call(
                    FrameSpec::scalar(64),
                    move || Ok(await_op(body_leaf)?.into_return()),
                    |v| Ok(v),
                )
            })
            .unwrap(),
    );
    leaf.complete(9).unwrap();
    assert!(child.is_complete());

    let completion = suspender
        .run::<u32, _>(move || {
            call(
                FrameSpec::scalar(64),
                move || Ok(await_op(child)?.into_return()),
                |v| Ok(ReturnValue::Scalar(scalar(&v) + 1)),
            )
        })
        .unwrap();

    assert!(matches!(completion, Completion::Ready(10)));
}

#[test_log::test]
fn test_replay_headroom_grows_monotonically() {
    let backend = ShadowBackend::new();
    let suspender = Suspender::new(backend.clone());
    let op = Oneshot::<u32>::new();

    let body_op = op.clone();
    let future = pending(
        suspender
            .run::<u32, _>(move || {
                call(
                    FrameSpec::scalar(128),
                    move || {
                        call(
                            FrameSpec::scalar(512),
                            move || Ok(await_with(FrameSpec::scalar(64), body_op)?.into_return()),
                            |v| Ok(v),
                        )
                    },
                    |v| Ok(v),
                )
            })
            .unwrap(),
    );

    op.complete(7).unwrap();

    assert_eq!(future.get_result().unwrap(), 7);
    // 64 for the await frame, grown to 512 for the middle frame, nothing
    // more for the smaller outer frame.
    assert_eq!(backend.reservations(), vec![64, 448]);
    assert_eq!(backend.reserved_total(), 512);
}
