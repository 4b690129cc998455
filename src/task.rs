//! Minimal future executor layered on a [`Scheduler`].
//!
//! A spawned future is polled once immediately, on the caller's stack. Later
//! wake-ups enqueue a re-poll on the scheduler, so async completions are
//! delivered when the host drives it.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::Poll;

use futures::future::BoxFuture;
use futures::task::{waker_ref, ArcWake};
use futures::FutureExt;
use parking_lot::Mutex;

use crate::result::Cause;
use crate::scheduler::Scheduler;

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;
const NOTIFIED: u8 = 3;
const COMPLETE: u8 = 4;

pub(crate) struct Spawned {
    state: AtomicU8,
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    scheduler: Arc<dyn Scheduler>,
}

impl Spawned {
    /// Polls `future` once now and keeps it alive until it completes.
    pub(crate) fn spawn(scheduler: Arc<dyn Scheduler>, future: impl Future<Output = ()> + Send + 'static) {
        let task = Arc::new(Spawned {
            state: AtomicU8::new(RUNNING),
            future: Mutex::new(Some(future.boxed())),
            scheduler,
        });
        task.run();
    }

    // Expects `state == RUNNING`.
    fn run(self: &Arc<Self>) {
        let waker = waker_ref(self);
        let mut cx = std::task::Context::from_waker(&waker);
        loop {
            let finished = {
                let mut slot = self.future.lock();
                match slot.as_mut() {
                    Some(future) => match future.as_mut().poll(&mut cx) {
                        Poll::Ready(()) => {
                            *slot = None;
                            true
                        }
                        Poll::Pending => false,
                    },
                    None => true,
                }
            };
            if finished {
                self.state.store(COMPLETE, Ordering::Release);
                return;
            }
            match self
                .state
                .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                // Woken while polling: poll again.
                Err(_) => self.state.store(RUNNING, Ordering::Release),
            }
        }
    }
}

impl ArcWake for Spawned {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let mut state = arc_self.state.load(Ordering::Acquire);
        loop {
            let next = match state {
                IDLE => SCHEDULED,
                RUNNING => NOTIFIED,
                _ => return,
            };
            match arc_self
                .state
                .compare_exchange(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if next == SCHEDULED {
                        let task = arc_self.clone();
                        arc_self.scheduler.schedule_task(Box::new(move || {
                            task.state.store(RUNNING, Ordering::Release);
                            task.run();
                        }));
                    }
                    return;
                }
                Err(actual) => state = actual,
            }
        }
    }
}

/// Runs `future`, turning a panic into a [`Cause::Die`].
pub(crate) async fn catch_defects<T, E>(
    future: impl Future<Output = Result<T, E>>,
) -> Result<T, Cause<E>> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(Cause::Fail(error)),
        Err(panic) => Err(defect_from_panic(panic)),
    }
}

pub(crate) fn defect_from_panic<E>(panic: Box<dyn Any + Send>) -> Cause<E> {
    let message = if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "effect panicked".to_string()
    };
    Cause::die(anyhow::anyhow!(message))
}
