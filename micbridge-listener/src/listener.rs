//! Owner-facing session handle
//!
//! A [`Listener`] is created on the owner thread and returns immediately; the session
//! itself runs on the runtime thread and reports back only through the capability
//! objects given at construction, each call routed through the owner's dispatcher.
//! Dropping the handle expires the session and tears it down if it is still running.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::controller::SessionEvent;
use crate::dispatch::{DispatchProxy, Dispatcher};
use crate::error::{ListenerError, Result};
use crate::handlers::{ConnectSuccessObserver, ErrorObserver, FrameConsumer};
use crate::runtime::{self, PendingSession, SessionRuntime};
use crate::session::{Credential, DiscoveredService, ExpiryFlag, Session, SessionId, Target};

/// Handle to one streaming session
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use micbridge_listener::{ChannelDispatcher, Credential, Listener};
///
/// let (dispatcher, queue) = ChannelDispatcher::new();
/// let listener = Listener::open(
///     "192.168.1.40",
///     8554,
///     Credential::from_auth_code("4821"),
///     Arc::new(|frame: &[u8]| println!("{} bytes", frame.len())),
///     dispatcher,
///     Arc::new(|address: &str| println!("Listening to {address}")),
///     Arc::new(|code: i32, message: &str| eprintln!("{code}: {message}")),
/// )?;
///
/// while queue.run_next() {}
/// ```
pub struct Listener {
    id: SessionId,
    target: Target,
    expired: ExpiryFlag,
    control: mpsc::UnboundedSender<SessionEvent>,
}

impl Listener {
    /// Start a session on the process-wide runtime with the default configuration
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        address: impl Into<String>,
        port: u16,
        credential: Credential,
        frames: Arc<dyn FrameConsumer>,
        dispatcher: Arc<dyn Dispatcher>,
        on_connected: Arc<dyn ConnectSuccessObserver>,
        on_error: Arc<dyn ErrorObserver>,
    ) -> Result<Self> {
        Self::builder(address, port)
            .credential(credential)
            .frame_consumer(frames)
            .dispatcher(dispatcher)
            .on_connected(on_connected)
            .on_error(on_error)
            .open()
    }

    pub fn builder<'a>(address: impl Into<String>, port: u16) -> ListenerBuilder<'a> {
        ListenerBuilder::new(address.into(), port)
    }

    /// Builder pre-filled with a service found by discovery
    pub fn builder_for<'a>(service: &DiscoveredService) -> ListenerBuilder<'a> {
        tracing::debug!("Using discovered service \"{}\"", service.name);
        ListenerBuilder::new(service.address.clone(), service.port)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// End the session; same as dropping the handle
    pub fn close(self) {}
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.expired.expire();
        if self.control.send(SessionEvent::Teardown).is_err() {
            tracing::trace!(session = %self.id, "Session already finished");
        }
        tracing::debug!(session = %self.id, "Listener for {} closed", self.target);
    }
}

/// Collects everything a session needs before it is handed to the runtime
pub struct ListenerBuilder<'a> {
    address: String,
    port: u16,
    credential: Option<Credential>,
    config: SessionConfig,
    runtime: Option<&'a SessionRuntime>,
    frames: Option<Arc<dyn FrameConsumer>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    connected: Option<Arc<dyn ConnectSuccessObserver>>,
    errors: Option<Arc<dyn ErrorObserver>>,
}

impl<'a> ListenerBuilder<'a> {
    fn new(address: String, port: u16) -> Self {
        Self {
            address,
            port,
            credential: None,
            config: SessionConfig::default(),
            runtime: None,
            frames: None,
            dispatcher: None,
            connected: None,
            errors: None,
        }
    }

    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Authenticate with the code shown by the device
    pub fn auth_code(self, code: impl Into<String>) -> Self {
        self.credential(Credential::from_auth_code(code))
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the session on `runtime` instead of the process-wide one
    pub fn runtime(mut self, runtime: &'a SessionRuntime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn frame_consumer(mut self, frames: Arc<dyn FrameConsumer>) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn on_connected(mut self, observer: Arc<dyn ConnectSuccessObserver>) -> Self {
        self.connected = Some(observer);
        self
    }

    pub fn on_error(mut self, observer: Arc<dyn ErrorObserver>) -> Self {
        self.errors = Some(observer);
        self
    }

    /// Validate the inputs and hand the session to the runtime
    ///
    /// Returns as soon as the session is registered; the outcome is reported later
    /// through the observers.
    pub fn open(self) -> Result<Listener> {
        self.config.validate()?;
        let target = Target::new(self.address, self.port)?;
        let credential = self.credential.ok_or_else(|| missing("credential"))?;
        let frames = self.frames.ok_or_else(|| missing("frame consumer"))?;
        let dispatcher = self.dispatcher.ok_or_else(|| missing("dispatcher"))?;
        let connected = self.connected.ok_or_else(|| missing("success observer"))?;
        let errors = self.errors.ok_or_else(|| missing("error observer"))?;

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => runtime::global()?,
        };

        let proxy = Arc::new(DispatchProxy::new(
            dispatcher,
            frames,
            connected,
            errors,
            self.config.frame_delivery,
        ));
        let session = Session::new(target.clone(), credential);
        let id = session.id;
        let expired = session.expired.clone();
        let (pending, control) =
            PendingSession::new(session, self.config, runtime.connector(), proxy);
        runtime.register(pending)?;

        tracing::info!(session = %id, "Opening stream from {target}");
        Ok(Listener {
            id,
            target,
            expired,
            control,
        })
    }
}

fn missing(what: &str) -> ListenerError {
    ListenerError::Configuration(format!("A {what} is required to open a listener"))
}
