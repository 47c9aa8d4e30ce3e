//! Pipeline assembly and the lifecycle of the capture and ordering threads
//!
//! ```text
//! socket -> [capture] -> UnitBlob -> [order] -> Finished -> Handler -> consumers
//! ```
//!
//! Both queues are unbounded crossbeam channels. There is no flow control toward
//! the X-engines: memory use is bounded only by how quickly the consumers drain
//! finished packages. A consumer that stays slower than the integration rate will
//! grow the dispatch queue without limit.

use std::{
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{error, info};

use crate::{
    capture::{capture_udp, Capturer, UnitBlob},
    consumer::{Consumer, DataConsumer, RawConsumer},
    dispatch::Handler,
    error::{Error, Result},
    order::{order_loop, Finished, Orderer},
    topology::{validate, Topology},
};

pub const DEFAULT_PORT: u16 = 4100;
pub const DEFAULT_PENDING_LIMIT: usize = 16;
/// Receive timeout, i.e. how often the capture thread checks its stop flag
pub const RECV_TIMEOUT: Duration = Duration::from_millis(250);

/// A worker thread that takes its state with it while running and hands it
/// back when joined, so it can be started again
struct Stage<S> {
    name: &'static str,
    /// Stays here until the worker actually runs, so a failed spawn loses nothing
    state: Arc<Mutex<Option<S>>>,
    running: Option<(JoinHandle<Option<S>>, Arc<AtomicBool>)>,
    stack_size: Option<usize>,
}

impl<S: Send + 'static> Stage<S> {
    fn new(name: &'static str, state: S) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(Some(state))),
            running: None,
            stack_size: None,
        }
    }

    fn is_running(&self) -> bool {
        self.running.is_some()
    }

    fn has_state(&self) -> bool {
        self.state.lock().map_or(false, |state| state.is_some())
    }

    fn spawn(&mut self, body: impl FnOnce(&mut S, &AtomicBool) + Send + 'static) -> Result<()> {
        if !self.has_state() {
            return Err(Error::StageLost(self.name));
        }
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let slot = self.state.clone();
        let mut builder = thread::Builder::new().name(self.name.to_lowercase());
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        let handle = builder.spawn(move || {
            let mut state = slot.lock().ok()?.take()?;
            body(&mut state, &flag);
            Some(state)
        })?;
        self.running = Some((handle, stop));
        info!("{} thread has started", self.name);
        Ok(())
    }

    fn stop(&mut self) {
        let Some((handle, stop)) = self.running.take() else {
            error!("{} thread has not been started!", self.name);
            return;
        };
        stop.store(true, Ordering::Release);
        match handle.join() {
            Ok(Some(state)) => {
                if let Ok(mut slot) = self.state.lock() {
                    *slot = Some(state);
                }
            }
            Ok(None) => error!("{} thread never got its state", self.name),
            Err(_) => error!("{} thread panicked, it can't be restarted", self.name),
        }
        info!("{} thread has stopped", self.name);
    }
}

/// Owns the capture and ordering threads
pub struct Catcher {
    host: String,
    port: u16,
    local_addr: Option<SocketAddr>,
    capture: Stage<Capturer>,
    order: Stage<Orderer>,
    catch_tx: Sender<UnitBlob>,
    catch_rx: Receiver<UnitBlob>,
    order_tx: Sender<Finished>,
}

impl Catcher {
    /// Bind the socket and start capturing. Starting twice logs an error and
    /// leaves the running thread alone.
    pub fn start_capture(&mut self) -> Result<()> {
        if self.capture.is_running() {
            error!("Capture thread is already running");
            return Ok(());
        }
        let socket = UdpSocket::bind((self.host.as_str(), self.port))?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        let addr = socket.local_addr()?;
        let out = self.catch_tx.clone();
        self.capture
            .spawn(move |capturer, stop| capture_udp(&socket, capturer, &out, stop))?;
        self.local_addr = Some(addr);
        info!(%addr, "Listening for X-engine packets");
        Ok(())
    }

    pub fn start_order(&mut self) -> Result<()> {
        if self.order.is_running() {
            error!("Order thread is already running");
            return Ok(());
        }
        let input = self.catch_rx.clone();
        let out = self.order_tx.clone();
        self.order
            .spawn(move |orderer, stop| order_loop(orderer, &input, &out, stop))
    }

    pub fn start(&mut self) -> Result<()> {
        self.start_capture()?;
        self.start_order()
    }

    /// Signal the capture thread and wait for it to exit
    pub fn stop_capture(&mut self) {
        self.capture.stop();
        self.local_addr = None;
    }

    pub fn stop_order(&mut self) {
        self.order.stop();
    }

    pub fn stop(&mut self) {
        self.stop_capture();
        self.stop_order();
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_running()
    }

    pub fn is_ordering(&self) -> bool {
        self.order.is_running()
    }

    /// Where the capture socket is bound while capturing
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for Catcher {
    fn drop(&mut self) {
        if self.capture.is_running() {
            self.stop_capture();
        }
        if self.order.is_running() {
            self.stop_order();
        }
    }
}

/// Registry of consumers plus the settings needed to wire a [`Catcher`] to a
/// [`Handler`]
pub struct PipelineBuilder {
    topology: Arc<dyn Topology>,
    host: String,
    port: u16,
    pending_limit: usize,
    consumers: Vec<Consumer>,
}

impl PipelineBuilder {
    pub fn new(topology: Arc<dyn Topology>) -> Self {
        Self {
            topology,
            host: "0.0.0.0".to_owned(),
            port: DEFAULT_PORT,
            pending_limit: DEFAULT_PENDING_LIMIT,
            consumers: vec![],
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Accumulations tracked at once per FID (capture) and overall (ordering)
    pub fn pending_limit(mut self, limit: usize) -> Self {
        self.pending_limit = limit;
        self
    }

    pub fn consumer(mut self, consumer: Consumer) -> Self {
        self.consumers.push(consumer);
        self
    }

    pub fn rawback(self, consumer: impl RawConsumer + 'static) -> Self {
        self.consumer(Consumer::raw(consumer))
    }

    pub fn callback(self, consumer: impl DataConsumer + 'static) -> Self {
        self.consumer(Consumer::data(consumer))
    }

    pub fn build(self) -> Result<(Catcher, Handler)> {
        validate(self.topology.as_ref())?;
        if self.pending_limit == 0 {
            return Err(Error::Config("pending limit must be at least 1".to_owned()));
        }

        let mut rawbacks = vec![];
        let mut callbacks = vec![];
        for consumer in self.consumers {
            info!("Registered {}", consumer.name());
            match consumer {
                Consumer::Raw(c) => rawbacks.push(c),
                Consumer::Data(c) => callbacks.push(c),
            }
        }

        let new_acc = Arc::new(AtomicBool::new(true));
        let (catch_tx, catch_rx) = unbounded();
        let (order_tx, order_rx) = unbounded();
        let capturer = Capturer::new(
            *self.topology.geometry(),
            new_acc.clone(),
            self.pending_limit,
        );
        let orderer = Orderer::new(self.topology, new_acc, rawbacks, self.pending_limit);
        let catcher = Catcher {
            host: self.host,
            port: self.port,
            local_addr: None,
            capture: Stage::new("Capture", capturer),
            order: Stage::new("Order", orderer),
            catch_tx,
            catch_rx,
            order_tx,
        };
        Ok((catcher, Handler::new(order_rx, callbacks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::small_config;

    fn catcher() -> Catcher {
        PipelineBuilder::new(Arc::new(small_config()))
            .host("127.0.0.1")
            .port(0)
            .build()
            .unwrap()
            .0
    }

    #[test]
    fn start_and_stop_are_checked() {
        let mut cat = catcher();
        // Stopping something that never started only logs
        cat.stop();
        cat.start().unwrap();
        assert!(cat.is_capturing() && cat.is_ordering());
        let addr = cat.local_addr().unwrap();
        // A second start doesn't rebind or spawn another thread
        cat.start().unwrap();
        assert_eq!(cat.local_addr(), Some(addr));
        cat.stop();
        assert!(!cat.is_capturing() && !cat.is_ordering());
        // Stages come back and can run again
        cat.start().unwrap();
        assert!(cat.is_capturing() && cat.is_ordering());
    }

    #[test]
    fn rejects_zero_pending_limit() {
        let built = PipelineBuilder::new(Arc::new(small_config()))
            .pending_limit(0)
            .build();
        assert!(matches!(built, Err(Error::Config(_))));
    }

    #[test]
    fn failed_spawn_keeps_state() {
        // No address space holds a stack this large
        let mut stage = Stage::new("Counter", 5u32);
        stage.stack_size = Some(1 << 60);
        assert!(matches!(stage.spawn(|n, _| *n += 1), Err(Error::Io(_))));
        assert!(!stage.is_running());

        stage.stack_size = None;
        stage.spawn(|n, _| *n += 1).unwrap();
        stage.stop();
        assert_eq!(*stage.state.lock().unwrap(), Some(6));
    }

    #[test]
    fn panicked_stage_reports_lost_state() {
        let mut stage = Stage::new("Doomed", ());
        stage.spawn(|_, _| panic!("worker died")).unwrap();
        stage.stop();
        assert!(matches!(
            stage.spawn(|_, _| {}),
            Err(Error::StageLost("Doomed"))
        ));
    }
}
