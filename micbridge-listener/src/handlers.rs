//! Capability interfaces implemented by the owner of a session
//!
//! Closures with matching signatures implement each trait, so simple owners do not
//! need a dedicated type.

/// Receives decoded-payload frames of a substream
pub trait FrameConsumer: Send + Sync {
    /// Called once per delivered frame; must not block.
    ///
    /// `data` is only valid for the duration of the call.
    fn on_frame(&self, data: &[u8]);
}

/// Notified once per session, after the stream started playing
pub trait ConnectSuccessObserver: Send + Sync {
    fn on_connected(&self, address: &str);
}

/// Notified once per failed session attempt
pub trait ErrorObserver: Send + Sync {
    /// `code` is the protocol/transport result code; see [`crate::codes`].
    /// `message` is a human-readable diagnostic and is not meant to be parsed.
    fn on_error(&self, code: i32, message: &str);
}

impl<F> FrameConsumer for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn on_frame(&self, data: &[u8]) {
        self(data)
    }
}

impl<F> ConnectSuccessObserver for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_connected(&self, address: &str) {
        self(address)
    }
}

impl<F> ErrorObserver for F
where
    F: Fn(i32, &str) + Send + Sync,
{
    fn on_error(&self, code: i32, message: &str) {
        self(code, message)
    }
}
