//
// Copyright 2026 Chat Core Contributors
// SPDX-License-Identifier: Apache-2.0
//

//! A single-threaded serial queue used for both the engine worker and the
//! observer event dispatch. Each [`SerialExecutor`] owns one dedicated
//! background thread and runs everything posted to it in submission order,
//! so callers never race with each other on that thread.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A cloneable handle to a single dedicated worker thread.
#[derive(Clone)]
pub struct SerialExecutor {
    sender: mpsc::Sender<Job>,
}

impl SerialExecutor {
    /// Spawns the backing thread, named for logging/debugging purposes the
    /// way the source names its dedicated queues (e.g.
    /// `PeerConnectionChannelEventQueue`).
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Job>();

        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                for job in receiver {
                    job();
                }
                log::trace!("serial executor '{name}' shutting down");
            })
            .expect("failed to spawn serial executor thread");

        Self { sender }
    }

    /// Enqueue a job to run on this executor's thread.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        if self.sender.send(Box::new(job)).is_err() {
            log::error!("serial executor thread is gone, dropping posted job");
        }
    }

    /// Schedule a job to run on this executor's thread after `delay`. The
    /// sleep happens on a throwaway timer thread; only the final job
    /// execution is serialized onto this executor, so the one-shot timer
    /// never competes with other posted work for a dedicated thread of its
    /// own (see the reconnect-timeout design note).
    pub fn schedule_once(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        let executor = self.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            executor.post(job);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn runs_jobs_in_submission_order() {
        let executor = SerialExecutor::new("test-executor");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let seen = seen.clone();
            executor.post(move || seen.lock().unwrap().push(i));
        }

        // Drain by posting a final job and waiting on a channel, avoiding a
        // sleep-based race.
        let (tx, rx) = mpsc::channel();
        executor.post(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn schedule_once_fires_after_delay() {
        let executor = SerialExecutor::new("test-timer");
        let (tx, rx) = mpsc::channel();
        executor.schedule_once(Duration::from_millis(20), move || tx.send(()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }
}
