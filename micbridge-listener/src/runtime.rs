//! Background session runtime
//!
//! One dedicated thread owns a single-threaded tokio runtime and drives every session
//! controller. Owner threads hand sessions over through the pending registry: a
//! session is inserted under its identity, then an activation command is posted. The
//! runtime thread removes the entry when it processes the command and starts the
//! controller, unless the owner expired the session in the meantime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::{self, JoinSet};
use tracing::Instrument;

use crate::config::{RuntimeConfig, SessionConfig};
use crate::controller::{SessionController, SessionEvent};
use crate::dispatch::DispatchProxy;
use crate::error::{ListenerError, Result};
use crate::session::{ExpiryFlag, Session, SessionId};
use crate::transport::Connector;

static GLOBAL_RUNTIME: OnceLock<SessionRuntime> = OnceLock::new();

/// Install the process-wide runtime
///
/// Fails with [`ListenerError::RuntimeAlreadyInitialized`] on every call after the
/// first successful one.
pub fn init_global(
    config: RuntimeConfig,
    connector: Arc<dyn Connector>,
) -> Result<&'static SessionRuntime> {
    if GLOBAL_RUNTIME.get().is_some() {
        return Err(ListenerError::RuntimeAlreadyInitialized);
    }

    let runtime = SessionRuntime::start(config, connector)?;
    let mut installed = false;
    let global = GLOBAL_RUNTIME.get_or_init(|| {
        installed = true;
        runtime
    });

    if installed {
        Ok(global)
    } else {
        Err(ListenerError::RuntimeAlreadyInitialized)
    }
}

/// The process-wide runtime installed by [`init_global`]
///
/// The runtime is not created on first use: starting it needs the application's
/// [`Connector`], so it must be installed explicitly with [`init_global`] before any
/// [`Listener`](crate::Listener) opens on it. Until then this returns
/// [`ListenerError::RuntimeNotInitialized`]. [`shutdown_global`] stops it at process
/// shutdown.
pub fn global() -> Result<&'static SessionRuntime> {
    GLOBAL_RUNTIME
        .get()
        .ok_or(ListenerError::RuntimeNotInitialized)
}

/// Shut the process-wide runtime down; no-op if it was never installed
pub fn shutdown_global() {
    if let Some(runtime) = GLOBAL_RUNTIME.get() {
        runtime.shutdown();
    }
}

/// A session waiting for the runtime thread to activate it
pub(crate) struct PendingSession {
    id: SessionId,
    url: String,
    expired: ExpiryFlag,
    controller: SessionController,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    control: mpsc::UnboundedSender<SessionEvent>,
}

impl PendingSession {
    /// Build the controller for `session`; the returned sender reaches it once active
    pub(crate) fn new(
        session: Session,
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        proxy: Arc<DispatchProxy>,
    ) -> (Self, mpsc::UnboundedSender<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = session.id;
        let url = session.target.url().to_string();
        let expired = session.expired.clone();
        let controller = SessionController::new(session, config, connector, proxy, tx.clone());

        let pending = Self {
            id,
            url,
            expired,
            controller,
            events: rx,
            control: tx.clone(),
        };
        (pending, tx)
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }
}

enum RuntimeCommand {
    Activate(SessionId),
    Shutdown,
}

// Entries cross from the owner thread to the runtime thread exactly once; the mutex
// only makes them shareable.
type PendingRegistry = DashMap<SessionId, Mutex<PendingSession>>;

/// Handle to the background thread driving every session
pub struct SessionRuntime {
    config: RuntimeConfig,
    connector: Arc<dyn Connector>,
    pending: Arc<PendingRegistry>,
    commands: mpsc::UnboundedSender<RuntimeCommand>,
    accepting: Arc<AtomicBool>,
    live: Arc<AtomicUsize>,
    thread_id: ThreadId,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRuntime {
    /// Start the runtime thread
    pub fn start(config: RuntimeConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ListenerError::RuntimeStart)?;

        let pending: Arc<PendingRegistry> = Arc::new(DashMap::new());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let accepting = Arc::new(AtomicBool::new(true));
        let live = Arc::new(AtomicUsize::new(0));

        let thread = {
            let pending = Arc::clone(&pending);
            let live = Arc::clone(&live);
            let config = config.clone();
            thread::Builder::new()
                .name(config.thread_name.clone())
                .spawn(move || {
                    runtime.block_on(run_runtime_loop(config, pending, live, command_rx));
                })
                .map_err(ListenerError::RuntimeStart)?
        };

        tracing::info!(thread = %config.thread_name, "Session runtime started");

        Ok(Self {
            config,
            connector,
            pending,
            commands,
            accepting,
            live,
            thread_id: thread.thread().id(),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Whether new sessions are still accepted
    pub fn is_running(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Sessions registered but not yet picked up by the runtime thread
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Sessions currently running on the runtime thread
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Whether the caller is running on the runtime thread
    pub fn on_runtime_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.connector)
    }

    /// Hand a session to the runtime thread
    pub(crate) fn register(&self, session: PendingSession) -> Result<()> {
        let id = session.id();
        self.insert_pending(session)?;
        self.activate(id)
    }

    fn insert_pending(&self, session: PendingSession) -> Result<()> {
        if !self.is_running() {
            return Err(ListenerError::ShuttingDown);
        }

        match self.pending.entry(session.id()) {
            Entry::Occupied(_) => Err(ListenerError::DuplicateSession(session.id())),
            Entry::Vacant(slot) => {
                slot.insert(Mutex::new(session));
                Ok(())
            }
        }
    }

    fn activate(&self, id: SessionId) -> Result<()> {
        if self.commands.send(RuntimeCommand::Activate(id)).is_err() {
            self.pending.remove(&id);
            return Err(ListenerError::ShuttingDown);
        }
        tracing::debug!(session = %id, "Session registered for activation");
        Ok(())
    }

    /// Stop accepting sessions, tear live ones down and join the runtime thread
    ///
    /// Safe to call more than once. When called from the runtime thread itself the
    /// join is skipped.
    pub fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            tracing::info!("Shutting down session runtime");
        }
        let _ = self.commands.send(RuntimeCommand::Shutdown);

        if self.on_runtime_thread() {
            tracing::warn!("Session runtime shutdown requested from its own thread; not joining");
            return;
        }

        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Session runtime thread panicked");
            }
        }
        self.pending.clear();
    }
}

impl Drop for SessionRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_runtime_loop(
    config: RuntimeConfig,
    pending: Arc<PendingRegistry>,
    live_count: Arc<AtomicUsize>,
    mut commands: mpsc::UnboundedReceiver<RuntimeCommand>,
) {
    let mut sessions: JoinSet<SessionId> = JoinSet::new();
    let mut live: HashMap<SessionId, mpsc::UnboundedSender<SessionEvent>> = HashMap::new();
    let mut tasks: HashMap<task::Id, SessionId> = HashMap::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(RuntimeCommand::Activate(id)) => {
                    let Some((_, entry)) = pending.remove(&id) else {
                        tracing::debug!(session = %id, "Session already gone at activation");
                        continue;
                    };
                    let session = entry
                        .into_inner()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    if session.expired.is_expired() {
                        tracing::debug!(session = %id, "Session expired before activation");
                        continue;
                    }

                    live.insert(id, session.control.clone());
                    let span = tracing::info_span!("session", id = %id, url = %session.url);
                    let PendingSession { controller, events, .. } = session;
                    let handle = sessions.spawn(
                        async move {
                            controller.run(events).await;
                            id
                        }
                        .instrument(span),
                    );
                    tasks.insert(handle.id(), id);
                    live_count.store(live.len(), Ordering::Release);
                }
                Some(RuntimeCommand::Shutdown) | None => break,
            },
            Some(finished) = sessions.join_next_with_id(), if !sessions.is_empty() => {
                let task_id = match &finished {
                    Ok((task_id, _)) => *task_id,
                    Err(e) => e.id(),
                };
                if let Some(id) = tasks.remove(&task_id) {
                    live.remove(&id);
                    live_count.store(live.len(), Ordering::Release);
                    if let Err(e) = finished {
                        tracing::error!(session = %id, "Session task failed: {e}");
                    }
                }
            }
        }
    }

    for control in live.values() {
        let _ = control.send(SessionEvent::Teardown);
    }

    let grace = tokio::time::sleep(config.shutdown_grace);
    tokio::pin!(grace);
    while !sessions.is_empty() {
        tokio::select! {
            _ = &mut grace => {
                tracing::warn!(
                    remaining = sessions.len(),
                    "Sessions still running after shutdown grace period"
                );
                break;
            }
            _ = sessions.join_next() => {}
        }
    }
    sessions.shutdown().await;
    live_count.store(0, Ordering::Release);

    tracing::info!("Session runtime stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
