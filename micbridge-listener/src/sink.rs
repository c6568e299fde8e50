//! Buffered frame pump for one substream
//!
//! A [`FrameSink`] pulls one frame at a time from its substream's source into a fixed
//! receive buffer, republishes it to a weakly-held consumer and immediately pulls the
//! next one into the same buffer. It runs as a task on the runtime thread and never
//! delivers a frame once its expiry flag is set.

use std::sync::Weak;

use tokio::task::JoinHandle;

use micbridge_sdp::MediaDescription;

use crate::config::{SampleOrder, SessionConfig};
use crate::handlers::FrameConsumer;
use crate::session::{ExpiryFlag, SessionId};
use crate::transport::{FrameInfo, FrameSource};

/// Reasons a sink refuses to start
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("The \"{label}\" substream has no data source")]
    MissingSource { label: String },

    #[error(
        "Unable to install a 16-bit byte-order filter on the \"{label}\" substream \
         ({width:?}-bit samples)"
    )]
    UnsupportedSampleWidth { label: String, width: Option<u16> },
}

/// Byte-order normalization applied to each frame before delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ByteOrderFilter {
    Passthrough,
    Swap16,
}

impl ByteOrderFilter {
    fn install(order: SampleOrder, label: &str, width: Option<u16>) -> Result<Self, SinkError> {
        match order {
            SampleOrder::AsReceived => Ok(ByteOrderFilter::Passthrough),
            SampleOrder::SwapToLittleEndian if width == Some(16) => Ok(ByteOrderFilter::Swap16),
            SampleOrder::SwapToLittleEndian => Err(SinkError::UnsupportedSampleWidth {
                label: label.to_string(),
                width,
            }),
        }
    }

    fn apply(&self, frame: &mut [u8]) {
        if let ByteOrderFilter::Swap16 = self {
            for sample in frame.chunks_exact_mut(2) {
                sample.swap(0, 1);
            }
        }
    }
}

/// Delivery counters, logged when the pump stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SinkStats {
    pub frames: u64,
    pub bytes: u64,
    pub truncated_bytes: u64,
}

pub(crate) struct FrameSink {
    session: SessionId,
    substream: usize,
    label: String,
    sample_width: Option<u16>,
    sample_order: SampleOrder,
    source: Option<Box<dyn FrameSource>>,
    filter: Option<ByteOrderFilter>,
    buffer: Box<[u8]>,
    expired: ExpiryFlag,
    consumer: Weak<dyn FrameConsumer>,
    stats: SinkStats,
}

impl FrameSink {
    pub(crate) fn new(
        session: SessionId,
        substream: usize,
        media: &MediaDescription,
        source: Option<Box<dyn FrameSource>>,
        consumer: Weak<dyn FrameConsumer>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            session,
            substream,
            label: media.label(),
            sample_width: media.sample_width_bits(),
            sample_order: config.sample_order,
            source,
            filter: None,
            buffer: vec![0u8; config.receive_buffer_size].into_boxed_slice(),
            expired: ExpiryFlag::new(),
            consumer,
            stats: SinkStats::default(),
        }
    }

    /// Prepare the sink for pumping; installs the byte-order filter on first call
    pub(crate) fn start(&mut self) -> Result<(), SinkError> {
        if self.source.is_none() {
            return Err(SinkError::MissingSource {
                label: self.label.clone(),
            });
        }

        if self.filter.is_none() {
            self.filter = Some(ByteOrderFilter::install(
                self.sample_order,
                &self.label,
                self.sample_width,
            )?);
        }

        Ok(())
    }

    pub(crate) fn expiry(&self) -> ExpiryFlag {
        self.expired.clone()
    }

    /// Start the pump on the current runtime
    ///
    /// `on_closed` runs once if the source closes while the sink is still live.
    pub(crate) fn spawn<F>(self, on_closed: F) -> SinkHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let expired = self.expiry();
        let task = tokio::spawn(self.pump(on_closed));
        SinkHandle { expired, task }
    }

    async fn pump<F>(mut self, on_closed: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(mut source) = self.source.take() else {
            return;
        };

        loop {
            match source.next_frame(&mut self.buffer).await {
                Some(info) => {
                    if !self.deliver(info) {
                        break;
                    }
                }
                None => {
                    if !self.expired.is_expired() {
                        tracing::debug!(
                            session = %self.session,
                            substream = self.substream,
                            "Source of \"{}\" closed", self.label
                        );
                        on_closed();
                    }
                    break;
                }
            }
        }

        tracing::debug!(
            session = %self.session,
            substream = self.substream,
            frames = self.stats.frames,
            bytes = self.stats.bytes,
            truncated_bytes = self.stats.truncated_bytes,
            "Frame sink for \"{}\" stopped", self.label
        );
    }

    /// Forward one arrived frame; returns whether the pump should pull again
    fn deliver(&mut self, info: FrameInfo) -> bool {
        if self.expired.is_expired() {
            return false;
        }

        if info.truncated > 0 {
            self.stats.truncated_bytes += info.truncated as u64;
            tracing::warn!(
                session = %self.session,
                substream = self.substream,
                truncated = info.truncated,
                "Frame truncated; receive buffer is {} bytes", self.buffer.len()
            );
        }

        let size = info.size.min(self.buffer.len());
        if size > 0 {
            let frame = &mut self.buffer[..size];
            if let Some(filter) = &self.filter {
                filter.apply(frame);
            }

            match self.consumer.upgrade() {
                Some(consumer) => {
                    consumer.on_frame(frame);
                    self.stats.frames += 1;
                    self.stats.bytes += size as u64;
                }
                None => {
                    tracing::trace!(session = %self.session, "Frame consumer gone, dropping frame");
                }
            }
        }

        true
    }
}

/// Controller-side handle of a running sink
pub(crate) struct SinkHandle {
    expired: ExpiryFlag,
    task: JoinHandle<()>,
}

impl SinkHandle {
    /// One-way: no frame is delivered after this, even one already in flight
    pub(crate) fn set_expired(&self) {
        self.expired.expire();
    }

    /// Expire the sink and stop its pump, releasing the source
    pub(crate) fn close(self) {
        self.set_expired();
        self.task.abort();
    }
}
