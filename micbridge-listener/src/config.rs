//! Configuration types for sessions and the session runtime
//!
//! Session settings control how a single stream is negotiated and delivered; runtime
//! settings control the background thread that drives every session.

use std::time::Duration;

use crate::error::ListenerError;

/// How frames reach the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameDelivery {
    /// Call the consumer directly on the runtime thread; no per-frame copy.
    /// The consumer must tolerate being called from that thread.
    #[default]
    Direct,
    /// Copy each frame and hand it to the dispatcher like every other event
    Queued,
}

/// Byte order of the 16-bit samples handed to the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleOrder {
    /// Deliver payload bytes untouched
    #[default]
    AsReceived,
    /// Swap network-order 16-bit samples to little-endian
    SwapToLittleEndian,
}

/// Per-session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Application name announced to the device
    /// Default: "MicBridge"
    pub application_name: String,

    /// Size of each substream's fixed receive buffer
    /// Default: 64 KiB
    pub receive_buffer_size: usize,

    /// Extra time after the expected duration before the session is ended
    /// Default: 2 seconds
    pub duration_slop: Duration,

    /// Ask for RTP-over-TCP instead of RTP/UDP
    /// Default: false
    pub stream_over_tcp: bool,

    /// Frame hand-off mode
    /// Default: Direct
    pub frame_delivery: FrameDelivery,

    /// Sample byte order applied by the frame sink filter
    /// Default: AsReceived
    pub sample_order: SampleOrder,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            application_name: "MicBridge".to_string(),
            receive_buffer_size: 64 * 1024,
            duration_slop: Duration::from_secs(2),
            stream_over_tcp: false,
            frame_delivery: FrameDelivery::Direct,
            sample_order: SampleOrder::AsReceived,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every callback, frames included, goes through the owner's dispatcher
    pub fn strict_owner_thread() -> Self {
        Self {
            frame_delivery: FrameDelivery::Queued,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ListenerError> {
        if self.receive_buffer_size == 0 {
            return Err(ListenerError::Configuration(
                "Receive buffer size must be greater than 0".to_string(),
            ));
        }

        if self.application_name.trim().is_empty() {
            return Err(ListenerError::Configuration(
                "Application name must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    pub fn with_duration_slop(mut self, slop: Duration) -> Self {
        self.duration_slop = slop;
        self
    }

    pub fn with_stream_over_tcp(mut self, enabled: bool) -> Self {
        self.stream_over_tcp = enabled;
        self
    }

    pub fn with_frame_delivery(mut self, delivery: FrameDelivery) -> Self {
        self.frame_delivery = delivery;
        self
    }

    pub fn with_sample_order(mut self, order: SampleOrder) -> Self {
        self.sample_order = order;
        self
    }
}

/// Settings for the background session runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Name of the runtime thread
    /// Default: "micbridge-runtime"
    pub thread_name: String,

    /// How long live sessions get to tear down when the runtime shuts down
    /// Default: 2 seconds
    pub shutdown_grace: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_name: "micbridge-runtime".to_string(),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ListenerError> {
        if self.thread_name.contains('\0') {
            return Err(ListenerError::Configuration(
                "Thread name must not contain NUL bytes".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}
