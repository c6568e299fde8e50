//! Boundary to the underlying streaming transport
//!
//! The socket handling and protocol-message codec live outside this crate. A
//! [`Connector`] creates one [`Transport`] per session on the runtime thread; the
//! transport issues requests without blocking and reports each response later through
//! the [`TransportEvents`] handle it was created with. Media arrives through one
//! [`FrameSource`] per negotiated substream.

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use micbridge_sdp::{MediaDescription, PlayRange};

use crate::controller::SessionEvent;
use crate::error::TransportError;
use crate::session::{Credential, SessionId, Target};

/// Which request a response belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Describe,
    Setup { substream: usize },
    Play,
}

/// Token attached to every request; hand it back unchanged with the response
///
/// The generation lets the controller discard responses that arrive after the
/// session moved on (e.g. a setup response racing a teardown).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestTag {
    generation: u64,
    kind: RequestKind,
}

impl RequestTag {
    pub(crate) fn new(generation: u64, kind: RequestKind) -> Self {
        Self { generation, kind }
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Client ports reserved for a substream by [`Transport::initiate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalPorts {
    pub rtp: u16,
    /// `None` when RTCP is multiplexed on the RTP port
    pub rtcp: Option<u16>,
}

/// Transport parameters requested in a setup request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupOptions {
    pub ports: LocalPorts,
    pub stream_over_tcp: bool,
}

/// Result of one frame pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Bytes written to the front of the buffer
    pub size: usize,
    /// Bytes of the frame that did not fit in the buffer
    pub truncated: usize,
}

/// Data source of one negotiated substream
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next frame and write it into `buffer`
    ///
    /// Returns `None` once the source is closed.
    async fn next_frame(&mut self, buffer: &mut [u8]) -> Option<FrameInfo>;
}

/// Connection to one device, driven from the runtime thread
pub trait Transport: Send {
    /// URL of the stream being negotiated
    fn url(&self) -> &Url;

    /// Ask for the session description; the response body is the description text
    fn send_describe(&mut self, tag: RequestTag);

    /// Reserve local resources (client ports) for a substream
    fn initiate(
        &mut self,
        substream: usize,
        media: &MediaDescription,
    ) -> Result<LocalPorts, TransportError>;

    /// Negotiate the transport of an initiated substream
    fn send_setup(
        &mut self,
        tag: RequestTag,
        substream: usize,
        media: &MediaDescription,
        options: &SetupOptions,
    );

    /// Hand out the data source of a set-up substream
    fn take_source(&mut self, substream: usize) -> Option<Box<dyn FrameSource>>;

    /// Enable or disable forwarding of the out-of-band "stream ended" signal
    fn watch_end_of_stream(&mut self, substream: usize, enabled: bool);

    /// Release the local resources reserved for a substream
    fn release(&mut self, substream: usize);

    /// Ask the remote side to start streaming over `window`
    fn send_play(&mut self, tag: RequestTag, window: &PlayRange);

    /// Tell the remote side to stop; no response is expected
    fn send_teardown(&mut self);

    /// Diagnostic text for the last failure, empty if there is none
    fn diagnostic(&self) -> String;
}

/// What a [`Connector`] needs to build a transport
#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest<'a> {
    pub target: &'a Target,
    pub credential: &'a Credential,
    pub application_name: &'a str,
}

/// Creates transports; shared by every session of a runtime
pub trait Connector: Send + Sync {
    /// Build a transport with the credential already bound
    fn connect(
        &self,
        request: &ConnectRequest<'_>,
        events: TransportEvents,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// Handle a transport uses to report responses and signals to its session
#[derive(Debug, Clone)]
pub struct TransportEvents {
    session: SessionId,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl TransportEvents {
    pub(crate) fn new(session: SessionId, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Report the response to a request; `Ok` carries the response body
    pub fn respond(&self, tag: RequestTag, result: Result<String, TransportError>) {
        if self.tx.send(SessionEvent::Response { tag, result }).is_err() {
            tracing::trace!(session = %self.session, ?tag, "Session closed, dropping response");
        }
    }

    /// Report the out-of-band "stream ended" signal for a substream
    pub fn end_of_stream(&self, substream: usize) {
        if self.tx.send(SessionEvent::EndOfStream { substream }).is_err() {
            tracing::trace!(
                session = %self.session,
                substream,
                "Session closed, dropping end-of-stream"
            );
        }
    }
}
