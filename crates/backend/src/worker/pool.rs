//! Bounded worker pool with caller-runs admission.
//!
//! Workers share one bounded queue (`Arc<Mutex<Receiver>>`). When the queue
//! is full, [`WorkerPool::submit`] runs the task on the submitting task
//! instead of buffering or dropping it, which slows the producer down to the
//! pool's pace.

use std::{
  panic::AssertUnwindSafe,
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  },
  time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use tokio::{
  sync::{Mutex, Notify, mpsc},
  task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

pub type Task = BoxFuture<'static, ()>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
  #[error("Worker pool is shut down")]
  Closed,
  #[error("Shutdown grace period elapsed with {remaining} tasks unfinished")]
  Incomplete { remaining: usize },
}

/// How a submitted task was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
  Queued,
  /// Queue was full; the task already ran on the caller
  RanOnCaller,
}

/// Queued-or-running task count with an idle signal.
#[derive(Default)]
struct Outstanding {
  count: AtomicUsize,
  idle: Notify,
}

impl Outstanding {
  fn start(&self) {
    self.count.fetch_add(1, Ordering::SeqCst);
  }

  fn finish(&self) {
    if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
      self.idle.notify_waiters();
    }
  }

  fn get(&self) -> usize {
    self.count.load(Ordering::SeqCst)
  }

  async fn wait_idle(&self) {
    loop {
      let notified = self.idle.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if self.get() == 0 {
        return;
      }
      notified.await;
    }
  }
}

pub struct WorkerPool {
  name: String,
  tx: mpsc::Sender<Task>,
  outstanding: Arc<Outstanding>,
  closed: AtomicBool,
  cancel: CancellationToken,
  workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
  /// Start `workers` workers behind a queue of `capacity` tasks.
  pub fn new(name: impl Into<String>, workers: usize, capacity: usize) -> Self {
    let name = name.into();
    let (tx, rx) = mpsc::channel::<Task>(capacity.max(1));
    let rx = Arc::new(Mutex::new(rx));
    let outstanding = Arc::new(Outstanding::default());
    let cancel = CancellationToken::new();

    let handles = (0..workers.max(1))
      .map(|worker_id| {
        let rx = rx.clone();
        let outstanding = outstanding.clone();
        let cancel = cancel.clone();
        let name = name.clone();
        tokio::spawn(async move { worker(name, worker_id, rx, outstanding, cancel).await })
      })
      .collect();

    debug!(pool = %name, workers = workers.max(1), capacity, "Worker pool started");
    Self {
      name,
      tx,
      outstanding,
      closed: AtomicBool::new(false),
      cancel,
      workers: std::sync::Mutex::new(handles),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Tasks queued or running on workers.
  pub fn outstanding(&self) -> usize {
    self.outstanding.get()
  }

  pub async fn submit(&self, task: Task) -> Result<Admission, PoolError> {
    if self.closed.load(Ordering::SeqCst) {
      return Err(PoolError::Closed);
    }

    self.outstanding.start();
    match self.tx.try_send(task) {
      Ok(()) => Ok(Admission::Queued),
      Err(mpsc::error::TrySendError::Full(task)) => {
        self.outstanding.finish();
        trace!(pool = %self.name, "Queue full, running task on caller");
        run_task(&self.name, task).await;
        Ok(Admission::RanOnCaller)
      }
      Err(mpsc::error::TrySendError::Closed(_)) => {
        self.outstanding.finish();
        Err(PoolError::Closed)
      }
    }
  }

  /// Wait until nothing is queued or running. Returns `false` on timeout.
  pub async fn wait_idle(&self, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, self.outstanding.wait_idle()).await.is_ok()
  }

  /// Stop accepting tasks, let queued and running ones finish within `grace`,
  /// then stop the workers.
  pub async fn shutdown(&self, grace: Duration) -> Result<(), PoolError> {
    self.closed.store(true, Ordering::SeqCst);
    let drained = self.wait_idle(grace).await;
    self.cancel.cancel();

    let handles: Vec<_> = match self.workers.lock() {
      Ok(mut workers) => workers.drain(..).collect(),
      Err(poisoned) => poisoned.into_inner().drain(..).collect(),
    };
    if drained {
      for handle in handles {
        let _ = handle.await;
      }
      debug!(pool = %self.name, "Worker pool stopped");
      Ok(())
    } else {
      let remaining = self.outstanding.get();
      for handle in handles {
        handle.abort();
      }
      warn!(pool = %self.name, remaining, "Worker pool stopped with unfinished tasks");
      Err(PoolError::Incomplete { remaining })
    }
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}

async fn run_task(pool: &str, task: Task) {
  if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
    error!(pool, panic = %panic_message(panic.as_ref()), "Task panicked");
  }
}

async fn worker(
  name: String,
  worker_id: usize,
  rx: Arc<Mutex<mpsc::Receiver<Task>>>,
  outstanding: Arc<Outstanding>,
  cancel: CancellationToken,
) {
  trace!(pool = %name, worker_id, "Worker starting");
  let mut processed = 0usize;

  loop {
    let task = {
      let mut rx_guard = rx.lock().await;
      tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        task = rx_guard.recv() => task,
      }
    };

    let Some(task) = task else {
      break;
    };
    run_task(&name, task).await;
    outstanding.finish();
    processed += 1;
  }

  trace!(pool = %name, worker_id, processed, "Worker finished");
}

/// Best-effort text of a panic payload.
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}
