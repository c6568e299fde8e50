//! # MicBridge Listener
//!
//! A sync-first client that pulls a live audio stream from a MicBridge device and hands
//! each decoded frame to the application.
//!
//! ## Overview
//!
//! Opening a [`Listener`] returns immediately. The session runs on a dedicated
//! background thread: it asks the device for its session description, sets up every
//! media substream it can (skipping the ones that fail), starts playback and then pumps
//! frames until the stream ends, the expected duration runs out or the owner drops the
//! handle. Success and failure are each reported at most once, through the owner's
//! [`Dispatcher`], so application callbacks run on the application's own thread.
//!
//! ## Key Features
//!
//! - **Sync-First API**: no async/await in the public surface
//! - **Best-Effort Setup**: one failed substream does not fail the session
//! - **Single Outcome**: each session reports either success or one error, never both
//! - **Race-Free Teardown**: late responses are discarded by request generation
//! - **Pluggable Transport**: the socket layer is supplied through [`Connector`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use micbridge_listener::{init_global, ChannelDispatcher, Listener, RuntimeConfig};
//!
//! // Install the background runtime once, with the application's transport
//! init_global(RuntimeConfig::default(), Arc::new(my_transport::Connector::new()))?;
//!
//! let (dispatcher, queue) = ChannelDispatcher::new();
//! let listener = Listener::builder("192.168.1.40", 8554)
//!     .auth_code("4821")
//!     .frame_consumer(Arc::new(|frame: &[u8]| player.write(frame)))
//!     .dispatcher(dispatcher)
//!     .on_connected(Arc::new(|address: &str| println!("Listening to {address}")))
//!     .on_error(Arc::new(|code: i32, message: &str| eprintln!("{code}: {message}")))
//!     .open()?;
//!
//! // Run callbacks on this thread
//! while queue.run_next() {}
//! ```
//!
//! ## Architecture
//!
//! 1. **Owner thread**: builds the session and registers it with the [`SessionRuntime`]
//! 2. **Pending registry**: holds the session until the runtime thread activates it
//! 3. **Session controller**: a state machine on the runtime thread driving the protocol
//! 4. **Frame sinks**: one pump per substream, delivering into a fixed receive buffer
//! 5. **Dispatch proxy**: re-posts every notification to the owner's [`Dispatcher`]

pub mod config;
mod controller;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod listener;
pub mod logging;
pub mod runtime;
pub mod session;
mod sink;
pub mod transport;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

// Re-export main types for convenience
pub use config::{FrameDelivery, RuntimeConfig, SampleOrder, SessionConfig};
pub use dispatch::{ChannelDispatcher, DispatchQueue, Dispatcher, Event};
pub use error::{codes, ListenerError, Result, SessionError, TransportError};
pub use handlers::{ConnectSuccessObserver, ErrorObserver, FrameConsumer};
pub use listener::{Listener, ListenerBuilder};
pub use logging::{init_logging, init_logging_from_env, LoggingMode};
pub use runtime::{global, init_global, shutdown_global, SessionRuntime};
pub use session::{Credential, DiscoveredService, ExpiryFlag, SessionId, Target};
pub use transport::{
    ConnectRequest, Connector, FrameInfo, FrameSource, LocalPorts, RequestKind, RequestTag,
    SetupOptions, Transport, TransportEvents,
};

// Re-export the description types transports receive
pub use micbridge_sdp::{MediaDescription, PlayRange, SessionDescription};
