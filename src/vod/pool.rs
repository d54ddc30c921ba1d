// SPDX-License-Identifier: GPL-2.0-or-later

use common::Cancelled;
use std::sync::{mpsc, Arc, Mutex};

type Job = Box<dyn FnOnce() + Send>;

/// Fixed pool of worker threads for fragment assembly: disk
/// reads and AES work stay off the async runtime. Jobs run in
/// FIFO order on an unbounded queue; the caller awaits the
/// result and writes the response from the runtime thread.
pub struct AssemblyPool {
    tx: mpsc::Sender<Job>,
}

impl AssemblyPool {
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        for i in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            std::thread::Builder::new()
                .name(format!("assembly-{i}"))
                .spawn(move || loop {
                    // Hold the lock only while dequeueing.
                    let job = { rx.lock().expect("worker queue lock").recv() };
                    match job {
                        Ok(job) => job(),
                        // Pool dropped, shut down.
                        Err(mpsc::RecvError) => return,
                    }
                })
                .expect("spawn assembly worker");
        }

        Self { tx }
    }

    /// Queue `work` on the pool and await its result. The job
    /// is enqueued immediately; a caller that goes away does
    /// not cancel it. The work closure must not touch the
    /// response; the awaiting task does that once the result
    /// arrives.
    pub fn run<T, F>(&self, work: F) -> impl std::future::Future<Output = Result<T, Cancelled>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let job = Box::new(move || {
            // The receiver may be gone if the client hung up;
            // the work still ran to completion.
            let _ = tx.send(work());
        });
        let queued = self.tx.send(job).is_ok();
        async move {
            if !queued {
                return Err(Cancelled);
            }
            rx.await.map_err(|_| Cancelled)
        }
    }
}
