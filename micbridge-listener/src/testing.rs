//! Scripted transport and recording observers for tests
//!
//! Enabled for this crate's own tests and, through the `test-support` feature, for
//! integration tests and downstream crates. Nothing here touches the network: a
//! [`ScriptedConnector`] hands out transports that answer every request from a
//! [`Script`] and record what the session asked of them in a [`TransportLog`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use url::Url;

use micbridge_sdp::{MediaDescription, PlayRange};

use crate::dispatch::{Dispatcher, Event};
use crate::error::TransportError;
use crate::handlers::{ConnectSuccessObserver, ErrorObserver, FrameConsumer};
use crate::transport::{
    ConnectRequest, Connector, FrameInfo, FrameSource, LocalPorts, RequestKind, RequestTag,
    SetupOptions, Transport, TransportEvents,
};

/// A session description with `substreams` 16-bit audio substreams
///
/// `range` is copied into a session-level `a=range:` line when given.
pub fn audio_description(substreams: usize, range: Option<&str>) -> String {
    let mut sdp =
        String::from("v=0\no=- 0 0 IN IP4 127.0.0.1\ns=Microphone\nc=IN IP4 0.0.0.0\nt=0 0\n");
    if let Some(range) = range {
        sdp.push_str(&format!("a=range:{range}\n"));
    }
    for index in 0..substreams {
        sdp.push_str("m=audio 0 RTP/AVP 97\n");
        sdp.push_str("a=rtpmap:97 L16/44100/1\n");
        sdp.push_str(&format!("a=control:track{}\n", index + 1));
    }
    sdp
}

/// How the data source of one substream behaves
#[derive(Debug, Clone)]
pub enum SourceScript {
    /// Yield the frames, then close
    Closing(Vec<Vec<u8>>),
    /// Yield the frames, then wait forever
    Live(Vec<Vec<u8>>),
    /// Yield the same frame every `interval`, forever
    Repeating { frame: Vec<u8>, interval: Duration },
    /// The transport has no source for the substream
    Missing,
}

/// Canned answers for every request a session makes
#[derive(Debug, Clone)]
pub struct Script {
    pub connect: Result<(), TransportError>,
    pub describe: Result<String, TransportError>,
    /// Per-substream initiate failures; substreams not listed succeed
    pub initiate_failures: HashMap<usize, TransportError>,
    /// Per-substream setup failures; substreams not listed succeed
    pub setup_failures: HashMap<usize, TransportError>,
    pub play: Result<(), TransportError>,
    /// Per-substream sources; substreams not listed get `Live(vec![])`
    pub sources: HashMap<usize, SourceScript>,
    pub diagnostic: String,
    /// Requests whose responses are held back until [`TransportLog::release_withheld`]
    pub withheld: Vec<RequestKind>,
}

impl Script {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            connect: Ok(()),
            describe: Ok(description.into()),
            initiate_failures: HashMap::new(),
            setup_failures: HashMap::new(),
            play: Ok(()),
            sources: HashMap::new(),
            diagnostic: String::new(),
            withheld: Vec::new(),
        }
    }

    pub fn with_connect_error(mut self, code: i32, message: &str) -> Self {
        self.connect = Err(TransportError::new(code, message));
        self
    }

    pub fn with_describe_error(mut self, code: i32, message: &str) -> Self {
        self.describe = Err(TransportError::new(code, message));
        self
    }

    pub fn with_initiate_error(mut self, substream: usize, code: i32, message: &str) -> Self {
        self.initiate_failures
            .insert(substream, TransportError::new(code, message));
        self
    }

    pub fn with_setup_error(mut self, substream: usize, code: i32, message: &str) -> Self {
        self.setup_failures
            .insert(substream, TransportError::new(code, message));
        self
    }

    pub fn with_play_error(mut self, code: i32, message: &str) -> Self {
        self.play = Err(TransportError::new(code, message));
        self
    }

    pub fn with_source(mut self, substream: usize, source: SourceScript) -> Self {
        self.sources.insert(substream, source);
        self
    }

    pub fn with_diagnostic(mut self, diagnostic: &str) -> Self {
        self.diagnostic = diagnostic.to_string();
        self
    }

    pub fn withholding(mut self, kind: RequestKind) -> Self {
        self.withheld.push(kind);
        self
    }
}

/// One thing a session asked of its transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Connect { url: String, username: String },
    Describe,
    Initiate(usize),
    Setup { substream: usize, stream_over_tcp: bool },
    TakeSource(usize),
    WatchEndOfStream(usize, bool),
    Release(usize),
    Play(PlayRange),
    Teardown,
    /// The transport was dropped
    Closed,
}

#[derive(Default)]
struct LogState {
    calls: Vec<TransportCall>,
    withheld: Vec<(TransportEvents, RequestTag, Result<String, TransportError>)>,
    events: Option<TransportEvents>,
}

/// Shared record of every call made on the transports of one connector
#[derive(Clone, Default)]
pub struct TransportLog {
    state: Arc<Mutex<LogState>>,
}

impl TransportLog {
    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: TransportCall) {
        self.lock().calls.push(call);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, call: &TransportCall) -> usize {
        self.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn count_matching(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn contains(&self, call: &TransportCall) -> bool {
        self.count(call) > 0
    }

    /// Deliver every held-back response now
    pub fn release_withheld(&self) -> usize {
        let withheld = std::mem::take(&mut self.lock().withheld);
        let count = withheld.len();
        for (events, tag, result) in withheld {
            events.respond(tag, result);
        }
        count
    }

    /// Raise the out-of-band "stream ended" signal on the most recent transport
    pub fn signal_end_of_stream(&self, substream: usize) {
        let events = self.lock().events.clone();
        if let Some(events) = events {
            events.end_of_stream(substream);
        }
    }
}

/// [`Connector`] that builds [`ScriptedTransport`]s
pub struct ScriptedConnector {
    script: Script,
    log: TransportLog,
}

impl ScriptedConnector {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            log: TransportLog::default(),
        }
    }

    pub fn log(&self) -> TransportLog {
        self.log.clone()
    }
}

impl Connector for ScriptedConnector {
    fn connect(
        &self,
        request: &ConnectRequest<'_>,
        events: TransportEvents,
    ) -> Result<Box<dyn Transport>, TransportError> {
        self.log.record(TransportCall::Connect {
            url: request.target.url().to_string(),
            username: request.credential.username().to_string(),
        });
        self.script.connect.clone()?;
        self.log.lock().events = Some(events.clone());

        Ok(Box::new(ScriptedTransport {
            url: request.target.url().clone(),
            script: self.script.clone(),
            events,
            log: self.log.clone(),
            sources: HashMap::new(),
        }))
    }
}

/// Transport answering from a [`Script`]; responses are posted as soon as a
/// request is sent unless the script withholds them
pub struct ScriptedTransport {
    url: Url,
    script: Script,
    events: TransportEvents,
    log: TransportLog,
    sources: HashMap<usize, ScriptedSource>,
}

impl ScriptedTransport {
    fn respond(&self, tag: RequestTag, result: Result<String, TransportError>) {
        if self.script.withheld.contains(&tag.kind()) {
            self.log
                .lock()
                .withheld
                .push((self.events.clone(), tag, result));
        } else {
            self.events.respond(tag, result);
        }
    }
}

impl Transport for ScriptedTransport {
    fn url(&self) -> &Url {
        &self.url
    }

    fn send_describe(&mut self, tag: RequestTag) {
        self.log.record(TransportCall::Describe);
        self.respond(tag, self.script.describe.clone());
    }

    fn initiate(
        &mut self,
        substream: usize,
        _media: &MediaDescription,
    ) -> Result<LocalPorts, TransportError> {
        self.log.record(TransportCall::Initiate(substream));
        if let Some(error) = self.script.initiate_failures.get(&substream) {
            return Err(error.clone());
        }
        let rtp = 50_000 + 2 * substream as u16;
        Ok(LocalPorts {
            rtp,
            rtcp: Some(rtp + 1),
        })
    }

    fn send_setup(
        &mut self,
        tag: RequestTag,
        substream: usize,
        _media: &MediaDescription,
        options: &SetupOptions,
    ) {
        self.log.record(TransportCall::Setup {
            substream,
            stream_over_tcp: options.stream_over_tcp,
        });
        let result = match self.script.setup_failures.get(&substream) {
            Some(error) => Err(error.clone()),
            None => {
                let script = self
                    .script
                    .sources
                    .get(&substream)
                    .cloned()
                    .unwrap_or(SourceScript::Live(Vec::new()));
                if let Some(source) = ScriptedSource::from_script(script) {
                    self.sources.insert(substream, source);
                }
                Ok(String::new())
            }
        };
        self.respond(tag, result);
    }

    fn take_source(&mut self, substream: usize) -> Option<Box<dyn FrameSource>> {
        self.log.record(TransportCall::TakeSource(substream));
        self.sources
            .remove(&substream)
            .map(|source| Box::new(source) as Box<dyn FrameSource>)
    }

    fn watch_end_of_stream(&mut self, substream: usize, enabled: bool) {
        self.log
            .record(TransportCall::WatchEndOfStream(substream, enabled));
    }

    fn release(&mut self, substream: usize) {
        self.log.record(TransportCall::Release(substream));
        self.sources.remove(&substream);
    }

    fn send_play(&mut self, tag: RequestTag, window: &PlayRange) {
        self.log.record(TransportCall::Play(*window));
        let result = self.script.play.clone().map(|_| String::new());
        self.respond(tag, result);
    }

    fn send_teardown(&mut self) {
        self.log.record(TransportCall::Teardown);
    }

    fn diagnostic(&self) -> String {
        self.script.diagnostic.clone()
    }
}

impl Drop for ScriptedTransport {
    fn drop(&mut self) {
        self.log.record(TransportCall::Closed);
    }
}

enum SourceEnd {
    Close,
    Hold,
    Repeat { frame: Vec<u8>, interval: Duration },
}

/// [`FrameSource`] yielding scripted frames; counts every pull
pub struct ScriptedSource {
    frames: VecDeque<Vec<u8>>,
    end: SourceEnd,
    pulls: Arc<AtomicUsize>,
}

impl ScriptedSource {
    /// Yield `frames`, then report the source closed
    pub fn closing(frames: Vec<Vec<u8>>) -> Self {
        Self::with_end(frames, SourceEnd::Close)
    }

    /// Yield `frames`, then never produce another one
    pub fn live(frames: Vec<Vec<u8>>) -> Self {
        Self::with_end(frames, SourceEnd::Hold)
    }

    /// Yield `frame` every `interval`
    pub fn repeating(frame: Vec<u8>, interval: Duration) -> Self {
        Self::with_end(Vec::new(), SourceEnd::Repeat { frame, interval })
    }

    fn with_end(frames: Vec<Vec<u8>>, end: SourceEnd) -> Self {
        Self {
            frames: frames.into(),
            end,
            pulls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn from_script(script: SourceScript) -> Option<Self> {
        match script {
            SourceScript::Closing(frames) => Some(Self::closing(frames)),
            SourceScript::Live(frames) => Some(Self::live(frames)),
            SourceScript::Repeating { frame, interval } => Some(Self::repeating(frame, interval)),
            SourceScript::Missing => None,
        }
    }

    /// Number of `next_frame` calls so far
    pub fn pulls(&self) -> Arc<AtomicUsize> {
        self.pulls.clone()
    }

    fn fill(buffer: &mut [u8], frame: &[u8]) -> FrameInfo {
        let size = frame.len().min(buffer.len());
        buffer[..size].copy_from_slice(&frame[..size]);
        FrameInfo {
            size,
            truncated: frame.len() - size,
        }
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn next_frame(&mut self, buffer: &mut [u8]) -> Option<FrameInfo> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if let Some(frame) = self.frames.pop_front() {
            return Some(Self::fill(buffer, &frame));
        }

        match &self.end {
            SourceEnd::Close => None,
            SourceEnd::Hold => std::future::pending().await,
            SourceEnd::Repeat { frame, interval } => {
                tokio::time::sleep(*interval).await;
                Some(Self::fill(buffer, frame))
            }
        }
    }
}

/// Records every callback it receives, and the thread it ran on
#[derive(Default)]
pub struct RecordingObserver {
    frames: Mutex<Vec<Vec<u8>>>,
    frame_count: AtomicUsize,
    connections: Mutex<Vec<String>>,
    errors: Mutex<Vec<(i32, String)>>,
    threads: Mutex<Vec<ThreadId>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        lock(&self.frames).clone()
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<String> {
        lock(&self.connections).clone()
    }

    pub fn errors(&self) -> Vec<(i32, String)> {
        lock(&self.errors).clone()
    }

    /// Threads that ran the success and error callbacks, in call order
    pub fn notification_threads(&self) -> Vec<ThreadId> {
        lock(&self.threads).clone()
    }

    fn note_thread(&self) {
        lock(&self.threads).push(thread::current().id());
    }
}

impl FrameConsumer for RecordingObserver {
    fn on_frame(&self, data: &[u8]) {
        lock(&self.frames).push(data.to_vec());
        self.frame_count.fetch_add(1, Ordering::SeqCst);
    }
}

impl ConnectSuccessObserver for RecordingObserver {
    fn on_connected(&self, address: &str) {
        self.note_thread();
        lock(&self.connections).push(address.to_string());
    }
}

impl ErrorObserver for RecordingObserver {
    fn on_error(&self, code: i32, message: &str) {
        self.note_thread();
        lock(&self.errors).push((code, message.to_string()));
    }
}

/// [`Dispatcher`] that runs every event immediately on the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, event: Event) {
        event();
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
