use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MarshalError {
    #[error("main thread did not run the task within {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("main thread queue is closed")]
    Closed,
    #[error("main thread task aborted before producing a result")]
    Aborted,
}

/// Creates a task queue whose tasks run inside the host's update loop.
pub fn main_thread_channel<S>() -> (MainThreadHandle<S>, MainThreadQueue<S>) {
    let (sender, receiver) = mpsc::channel();
    (MainThreadHandle { sender }, MainThreadQueue { receiver })
}

pub struct MainThreadHandle<S> {
    sender: Sender<Task<S>>,
}

impl<S> Clone for MainThreadHandle<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S: 'static> MainThreadHandle<S> {
    /// Runs `task` on the main thread and blocks for its result.
    ///
    /// A task that misses the deadline still runs later; its result is dropped.
    pub fn call<R, F>(&self, timeout: Duration, task: F) -> Result<R, MarshalError>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::sync_channel::<R>(1);
        self.sender
            .send(Box::new(move |state: &mut S| {
                let _ = result_tx.send(task(state));
            }))
            .map_err(|_| MarshalError::Closed)?;

        match result_rx.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => Err(MarshalError::Timeout { timeout }),
            Err(RecvTimeoutError::Disconnected) => Err(MarshalError::Aborted),
        }
    }
}

pub struct MainThreadQueue<S> {
    receiver: Receiver<Task<S>>,
}

impl<S> MainThreadQueue<S> {
    /// Drains every queued task against `state`. Returns the number of tasks run.
    pub fn run_pending(&self, state: &mut S) -> usize {
        let mut ran = 0usize;
        loop {
            let task = match self.receiver.try_recv() {
                Ok(task) => task,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };
            ran += 1;
            if panic::catch_unwind(AssertUnwindSafe(|| task(state))).is_err() {
                warn!("main_thread_task_panicked");
            }
        }
        ran
    }
}

/// Server tick counter shared between the update loop and request handlers.
#[derive(Debug, Clone, Default)]
pub struct TickClock {
    ticks: Arc<AtomicU64>,
}

impl TickClock {
    pub fn current(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    pub fn advance(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;

    #[test]
    fn call_returns_value_computed_on_pumping_thread() {
        let (handle, queue) = main_thread_channel::<Vec<u32>>();
        let pump = thread::spawn(move || {
            let mut state = vec![1, 2, 3];
            let deadline = Instant::now() + Duration::from_secs(2);
            while Instant::now() < deadline {
                if queue.run_pending(&mut state) > 0 {
                    return state;
                }
                thread::sleep(Duration::from_millis(5));
            }
            state
        });

        let sum = handle
            .call(Duration::from_secs(2), |state: &mut Vec<u32>| {
                state.push(4);
                state.iter().sum::<u32>()
            })
            .expect("call");
        assert_eq!(sum, 10);
        assert_eq!(pump.join().expect("join pump"), vec![1, 2, 3, 4]);
    }

    #[test]
    fn call_times_out_when_nobody_pumps() {
        let (handle, _queue) = main_thread_channel::<()>();
        let result = handle.call(Duration::from_millis(30), |_| 1);
        assert_eq!(
            result,
            Err(MarshalError::Timeout {
                timeout: Duration::from_millis(30)
            })
        );
    }

    #[test]
    fn dropped_queue_reports_closed() {
        let (handle, queue) = main_thread_channel::<()>();
        drop(queue);
        assert_eq!(
            handle.call(Duration::from_millis(30), |_| 1),
            Err(MarshalError::Closed)
        );
    }

    #[test]
    fn panicking_task_aborts_only_its_own_call() {
        let (handle, queue) = main_thread_channel::<u32>();
        let caller = {
            let handle = handle.clone();
            thread::spawn(move || {
                handle.call(Duration::from_secs(2), |_: &mut u32| -> u32 {
                    panic!("task failure")
                })
            })
        };
        let mut state = 0u32;
        let deadline = Instant::now() + Duration::from_secs(2);
        while queue.run_pending(&mut state) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(caller.join().expect("join"), Err(MarshalError::Aborted));

        let follow_up = thread::spawn(move || handle.call(Duration::from_secs(2), |s: &mut u32| *s + 7));
        let deadline = Instant::now() + Duration::from_secs(2);
        while queue.run_pending(&mut state) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(follow_up.join().expect("join"), Ok(7));
    }

    #[test]
    fn tick_clock_is_shared_between_clones() {
        let clock = TickClock::default();
        let observer = clock.clone();
        clock.advance();
        clock.advance();
        assert_eq!(observer.current(), 2);
    }
}
