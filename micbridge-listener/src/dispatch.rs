//! Cross-thread hand-off of session callbacks to the owner thread
//!
//! Every success and error notification produced on the runtime thread is wrapped
//! in a unit of work and handed to the owner's [`Dispatcher`]. Frames take the same
//! route only when [`FrameDelivery::Queued`] is selected; by default they are passed
//! straight to the consumer on the runtime thread to avoid copying every frame.

use std::sync::{mpsc, Arc};
use std::time::Duration;

use bytes::Bytes;

use crate::config::FrameDelivery;
use crate::handlers::{ConnectSuccessObserver, ErrorObserver, FrameConsumer};

/// A unit of work to run on the owner's execution context
pub type Event = Box<dyn FnOnce() + Send + 'static>;

/// Runs events on the owner's execution context
///
/// Implementations must eventually run every event and keep the order in which
/// events were dispatched from any one thread.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, event: Event);
}

/// A [`Dispatcher`] backed by a channel, for owners without their own event loop
///
/// The owner thread drains the paired [`DispatchQueue`].
pub struct ChannelDispatcher {
    tx: mpsc::Sender<Event>,
}

impl ChannelDispatcher {
    /// Create the dispatcher and the queue the owner thread drains
    pub fn new() -> (Arc<Self>, DispatchQueue) {
        let (tx, rx) = mpsc::channel();
        (
            Arc::new(Self { tx }),
            DispatchQueue { rx },
        )
    }
}

impl Dispatcher for ChannelDispatcher {
    fn dispatch(&self, event: Event) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Dispatch queue closed, dropping event");
        }
    }
}

/// Owner-side end of a [`ChannelDispatcher`]
///
/// Not `Sync`: events must run on the thread that owns the queue.
pub struct DispatchQueue {
    rx: mpsc::Receiver<Event>,
}

impl DispatchQueue {
    /// Run every event that is already queued, without blocking
    ///
    /// Returns the number of events run.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.rx.try_recv() {
            event();
            count += 1;
        }
        count
    }

    /// Block until one event is available and run it
    ///
    /// Returns `false` if every dispatcher has been dropped.
    pub fn run_next(&self) -> bool {
        match self.rx.recv() {
            Ok(event) => {
                event();
                true
            }
            Err(_) => false,
        }
    }

    /// Wait up to `timeout` for one event and run it
    ///
    /// Returns `false` if the timeout expired or the queue is closed.
    pub fn run_next_timeout(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => {
                event();
                true
            }
            Err(_) => false,
        }
    }
}

/// Wraps the owner's capability objects so they are only invoked through the
/// dispatcher (frames excepted in [`FrameDelivery::Direct`] mode)
pub(crate) struct DispatchProxy {
    dispatcher: Arc<dyn Dispatcher>,
    frames: Arc<dyn FrameConsumer>,
    connected: Arc<dyn ConnectSuccessObserver>,
    errors: Arc<dyn ErrorObserver>,
    delivery: FrameDelivery,
}

impl DispatchProxy {
    pub(crate) fn new(
        dispatcher: Arc<dyn Dispatcher>,
        frames: Arc<dyn FrameConsumer>,
        connected: Arc<dyn ConnectSuccessObserver>,
        errors: Arc<dyn ErrorObserver>,
        delivery: FrameDelivery,
    ) -> Self {
        Self {
            dispatcher,
            frames,
            connected,
            errors,
            delivery,
        }
    }
}

impl FrameConsumer for DispatchProxy {
    fn on_frame(&self, data: &[u8]) {
        match self.delivery {
            FrameDelivery::Direct => self.frames.on_frame(data),
            FrameDelivery::Queued => {
                let frame = Bytes::copy_from_slice(data);
                let frames = Arc::clone(&self.frames);
                self.dispatcher
                    .dispatch(Box::new(move || frames.on_frame(&frame)));
            }
        }
    }
}

impl ConnectSuccessObserver for DispatchProxy {
    fn on_connected(&self, address: &str) {
        let connected = Arc::clone(&self.connected);
        let address = address.to_string();
        self.dispatcher
            .dispatch(Box::new(move || connected.on_connected(&address)));
    }
}

impl ErrorObserver for DispatchProxy {
    fn on_error(&self, code: i32, message: &str) {
        let errors = Arc::clone(&self.errors);
        let message = message.to_string();
        self.dispatcher
            .dispatch(Box::new(move || errors.on_error(code, &message)));
    }
}
