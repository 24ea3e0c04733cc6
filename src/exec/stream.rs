//! In-order execution streams.
//!
//! Engines enqueue kernels on the stream of whichever device owns the
//! device-resident side of an operation and return immediately.
//! [`ExecStream::synchronize`] blocks until the queue has drained and
//! surfaces any fault raised by earlier work. A fault poisons the
//! stream: kernels queued after it are skipped and every later
//! synchronize reports the same failure, matching sticky device
//! errors.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tracing::warn;

use crate::error::EngineError;

enum Msg {
    Kernel(Box<dyn FnOnce() -> Result<(), String> + Send>),
    Fence(mpsc::Sender<()>),
}

pub(crate) struct ExecStream {
    tx: mpsc::Sender<Msg>,
    fault: Arc<Mutex<Option<String>>>,
}

impl ExecStream {
    /// Spawns the worker thread servicing this stream.
    pub(crate) fn spawn(device_id: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        let fault = Arc::new(Mutex::new(None));
        let latch = Arc::clone(&fault);
        thread::Builder::new()
            .name(format!("kv-stream-{device_id}"))
            .spawn(move || run_worker(rx, latch))
            .expect("spawn stream worker thread");
        Self { tx, fault }
    }

    /// Queues a kernel without blocking. Execution order is submission
    /// order; once enqueued, work runs to completion or latches a
    /// fault.
    pub(crate) fn enqueue<F>(&self, kernel: F)
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        // Send fails only if the worker is gone (process teardown);
        // the kernel is dropped in that case.
        let _ = self.tx.send(Msg::Kernel(Box::new(kernel)));
    }

    /// Drains the queue, then reports the first latched fault, if any.
    pub(crate) fn synchronize(&self) -> Result<(), EngineError> {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.tx.send(Msg::Fence(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
        let fault = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        match &*fault {
            Some(msg) => Err(EngineError::ExecutionFault(msg.clone())),
            None => Ok(()),
        }
    }
}

fn run_worker(rx: mpsc::Receiver<Msg>, fault: Arc<Mutex<Option<String>>>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            Msg::Kernel(kernel) => {
                let poisoned = fault
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_some();
                if poisoned {
                    continue;
                }
                if let Err(msg) = kernel() {
                    warn!(fault = %msg, "stream kernel faulted");
                    *fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(msg);
                }
            }
            Msg::Fence(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
