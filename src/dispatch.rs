//! Hands finished packages to the data consumers

use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, TryRecvError};
use tracing::{error, info, warn};

use crate::{
    consumer::{isolated, DataConsumer},
    order::{Finished, POLL_INTERVAL},
};

pub struct Handler {
    callbacks: Vec<Box<dyn DataConsumer>>,
    queue: Receiver<Finished>,
}

impl Handler {
    pub fn new(queue: Receiver<Finished>, callbacks: Vec<Box<dyn DataConsumer>>) -> Self {
        Self { callbacks, queue }
    }

    pub fn add_callback(&mut self, callback: impl DataConsumer + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    /// Run every callback on one package, in registration order. Returns how many
    /// of them succeeded.
    pub fn process(&mut self, finished: &Finished) -> usize {
        let acc_n = finished.acc_n;
        let mut ok = 0;
        for callback in &mut self.callbacks {
            let name = callback.name().to_owned();
            if isolated("callback", &name, acc_n, || callback.consume(&finished.package)) {
                ok += 1;
            }
        }
        info!("Processed all callbacks for accumulation #{acc_n:<4}");
        ok
    }

    /// Wait up to `timeout` for one package and run every callback on it.
    /// Returns its accumulation number, or `None` if nothing arrived.
    pub fn dispatch_next(&mut self, timeout: Duration) -> Option<u32> {
        let finished = self.queue.recv_timeout(timeout).ok()?;
        if self.process(&finished) < self.callbacks.len() {
            error!(acc_n = finished.acc_n, "Not every callback succeeded");
        }
        Some(finished.acc_n)
    }

    /// Loop until `interrupt` is set, typically from a Ctrl-C handler
    pub fn run(&mut self, interrupt: &AtomicBool) {
        loop {
            if interrupt.load(Ordering::Acquire) {
                info!("Ctrl-C detected. Quitting loop.");
                return;
            }
            let finished = match self.queue.try_recv() {
                Ok(finished) => finished,
                Err(TryRecvError::Empty) => {
                    thread::sleep(POLL_INTERVAL);
                    continue;
                }
                Err(TryRecvError::Disconnected) => {
                    warn!("Ordering queue is gone, nothing left to dispatch");
                    return;
                }
            };
            if self.process(&finished) < self.callbacks.len() {
                error!(acc_n = finished.acc_n, "Not every callback succeeded");
            }
        }
    }
}
