//! Per-session state machine
//!
//! A [`SessionController`] lives on the runtime thread and drives one connection
//! attempt: describe, set up each substream in order, play, then wait for the stream
//! to end. Every input (transport responses, the out-of-band end-of-stream signal,
//! sink closure, the duration timer and owner teardown) arrives as a [`SessionEvent`]
//! on one channel, so the controller never needs a lock.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use micbridge_sdp::{MediaDescription, SessionDescription};

use crate::config::SessionConfig;
use crate::dispatch::DispatchProxy;
use crate::error::{SessionError, TransportError};
use crate::handlers::{ConnectSuccessObserver, ErrorObserver, FrameConsumer};
use crate::session::Session;
use crate::sink::{FrameSink, SinkError, SinkHandle};
use crate::transport::{
    ConnectRequest, Connector, LocalPorts, RequestKind, RequestTag, SetupOptions, Transport,
    TransportEvents,
};

/// Input to a session, delivered in order on the runtime thread
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// Response to a tagged request
    Response {
        tag: RequestTag,
        result: Result<String, TransportError>,
    },
    /// The remote side signalled that a substream ended
    EndOfStream { substream: usize },
    /// A frame sink's source closed on its own
    SinkClosed { substream: usize, generation: u64 },
    /// The expected duration (plus slop) elapsed
    TimerExpired { generation: u64 },
    /// The owner no longer wants the session
    Teardown,
}

/// Lifecycle of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Idle,
    Describing,
    SettingUpSubstream(usize),
    Playing,
    Ending,
    Closed,
}

struct Substream {
    media: MediaDescription,
    /// Set while local resources are reserved for the substream
    ports: Option<LocalPorts>,
    sink: Option<SinkHandle>,
    watching_end: bool,
    /// A sink was started for the substream at some point
    was_active: bool,
}

impl Substream {
    fn new(media: MediaDescription) -> Self {
        Self {
            media,
            ports: None,
            sink: None,
            watching_end: false,
            was_active: false,
        }
    }
}

pub(crate) struct SessionController {
    session: Session,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    proxy: Arc<DispatchProxy>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: SessionState,
    generation: u64,
    play_confirmed: bool,
    transport: Option<Box<dyn Transport>>,
    description: Option<SessionDescription>,
    substreams: Vec<Substream>,
    duration: f64,
    timer: Option<JoinHandle<()>>,
}

impl SessionController {
    pub(crate) fn new(
        session: Session,
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        proxy: Arc<DispatchProxy>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            session,
            config,
            connector,
            proxy,
            events,
            state: SessionState::Idle,
            generation: 0,
            play_confirmed: false,
            transport: None,
            description: None,
            substreams: Vec::new(),
            duration: 0.0,
            timer: None,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Drive the session until it closes
    pub(crate) async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        self.start();
        while !self.is_closed() {
            match events.recv().await {
                Some(event) => self.handle_event(event),
                None => self.teardown(),
            }
        }
        tracing::debug!(session = %self.session.id, "Session finished");
    }

    /// Create the transport and ask for the session description
    pub(crate) fn start(&mut self) {
        if self.state != SessionState::Idle {
            return;
        }

        if self.session.expired.is_expired() {
            tracing::debug!(session = %self.session.id, "Session expired before it started");
            self.state = SessionState::Closed;
            return;
        }

        let target = &self.session.target;
        tracing::info!(session = %self.session.id, "Connecting to {}", target.url());
        self.state = SessionState::Describing;

        let request = ConnectRequest {
            target,
            credential: &self.session.credential,
            application_name: &self.config.application_name,
        };
        let events = TransportEvents::new(self.session.id, self.events.clone());
        match self.connector.connect(&request, events) {
            Ok(mut transport) => {
                transport.send_describe(RequestTag::new(self.generation, RequestKind::Describe));
                self.transport = Some(transport);
            }
            Err(source) => {
                let url = target.url().to_string();
                self.report(SessionError::Connect { url, source });
            }
        }
    }

    pub(crate) fn handle_event(&mut self, event: SessionEvent) {
        if self.is_closed() {
            tracing::trace!(session = %self.session.id, ?event, "Session closed, ignoring event");
            return;
        }

        match event {
            SessionEvent::Response { tag, result } => self.handle_response(tag, result),
            SessionEvent::EndOfStream { substream } => {
                tracing::info!(
                    session = %self.session.id,
                    substream,
                    "Received end-of-stream signal"
                );
                self.end_substream(substream);
            }
            SessionEvent::SinkClosed {
                substream,
                generation,
            } => {
                if generation == self.generation {
                    self.end_substream(substream);
                }
            }
            SessionEvent::TimerExpired { generation } => {
                if generation == self.generation {
                    self.timer = None;
                    tracing::info!(session = %self.session.id, "Expected duration elapsed");
                    self.teardown();
                }
            }
            SessionEvent::Teardown => {
                tracing::debug!(session = %self.session.id, "Teardown requested by owner");
                self.teardown();
            }
        }
    }

    fn handle_response(&mut self, tag: RequestTag, result: Result<String, TransportError>) {
        if tag.generation() != self.generation || !self.awaiting(tag.kind()) {
            tracing::debug!(
                session = %self.session.id,
                ?tag,
                state = ?self.state(),
                "Ignoring stale response"
            );
            return;
        }

        match tag.kind() {
            RequestKind::Describe => self.on_described(result),
            RequestKind::Setup { substream } => self.on_set_up(substream, result),
            RequestKind::Play => self.on_playing(result),
        }
    }

    fn awaiting(&self, kind: RequestKind) -> bool {
        match (self.state, kind) {
            (SessionState::Describing, RequestKind::Describe) => true,
            (SessionState::SettingUpSubstream(current), RequestKind::Setup { substream }) => {
                current == substream
            }
            (SessionState::Playing, RequestKind::Play) => !self.play_confirmed,
            _ => false,
        }
    }

    fn on_described(&mut self, result: Result<String, TransportError>) {
        let text = match result {
            Ok(text) => text,
            Err(e) => return self.report(SessionError::Describe(e)),
        };
        tracing::debug!(session = %self.session.id, "Got a session description:\n{text}");

        let description = match SessionDescription::parse(&text) {
            Ok(description) => description,
            Err(e) => return self.report(e.into()),
        };
        if !description.has_media() {
            return self.report(SessionError::NoSubstreams);
        }

        self.substreams = description
            .media()
            .iter()
            .cloned()
            .map(Substream::new)
            .collect();
        self.description = Some(description);
        self.set_up_from(0);
    }

    /// Initiate and set up the first usable substream at or after `index`; plays once
    /// every substream has been tried
    fn set_up_from(&mut self, mut index: usize) {
        while index < self.substreams.len() {
            self.state = SessionState::SettingUpSubstream(index);
            let Some(transport) = self.transport.as_mut() else {
                return;
            };
            let substream = &mut self.substreams[index];
            let label = substream.media.label();

            match transport.initiate(index, &substream.media) {
                Ok(ports) => {
                    match ports.rtcp {
                        Some(rtcp) => tracing::info!(
                            session = %self.session.id,
                            "Initiated the \"{label}\" substream (client ports {}-{rtcp})",
                            ports.rtp
                        ),
                        None => tracing::info!(
                            session = %self.session.id,
                            "Initiated the \"{label}\" substream (client port {})",
                            ports.rtp
                        ),
                    }
                    substream.ports = Some(ports);
                    let options = SetupOptions {
                        ports,
                        stream_over_tcp: self.config.stream_over_tcp,
                    };
                    let tag =
                        RequestTag::new(self.generation, RequestKind::Setup { substream: index });
                    transport.send_setup(tag, index, &substream.media, &options);
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        session = %self.session.id,
                        "Failed to initiate the \"{label}\" substream: {e}"
                    );
                    index += 1;
                }
            }
        }

        self.play();
    }

    fn on_set_up(&mut self, index: usize, result: Result<String, TransportError>) {
        let label = self.substreams[index].media.label();
        match result {
            Ok(_) => {
                tracing::info!(session = %self.session.id, "Set up the \"{label}\" substream");
                if let Err(e) = self.attach_sink(index) {
                    tracing::warn!(
                        session = %self.session.id,
                        "Failed to start the \"{label}\" substream: {e}"
                    );
                    self.release_substream(index);
                }
            }
            Err(e) => {
                tracing::warn!(
                    session = %self.session.id,
                    "Failed to set up the \"{label}\" substream: {e}"
                );
                self.release_substream(index);
            }
        }

        self.set_up_from(index + 1);
    }

    fn attach_sink(&mut self, index: usize) -> Result<(), SinkError> {
        let Some(transport) = self.transport.as_mut() else {
            return Ok(());
        };
        let source = transport.take_source(index);
        let proxy: Weak<DispatchProxy> = Arc::downgrade(&self.proxy);
        let consumer: Weak<dyn FrameConsumer> = proxy;

        let substream = &mut self.substreams[index];
        let mut sink = FrameSink::new(
            self.session.id,
            index,
            &substream.media,
            source,
            consumer,
            &self.config,
        );
        sink.start()?;

        let events = self.events.clone();
        let generation = self.generation;
        substream.sink = Some(sink.spawn(move || {
            let _ = events.send(SessionEvent::SinkClosed {
                substream: index,
                generation,
            });
        }));

        transport.watch_end_of_stream(index, true);
        substream.watching_end = true;
        substream.was_active = true;
        Ok(())
    }

    fn active_sinks(&self) -> usize {
        self.substreams.iter().filter(|s| s.sink.is_some()).count()
    }

    fn play(&mut self) {
        if self.active_sinks() == 0 {
            let ended = self.substreams.iter().filter(|s| s.was_active).count();
            if ended > 0 {
                return self.report(SessionError::EndedBeforePlay { ended });
            }
            let attempted = self.substreams.len();
            return self.report(SessionError::NoActiveSubstreams { attempted });
        }

        let Some(description) = &self.description else {
            return;
        };
        let window = description.play_window();
        self.duration = description.expected_duration();
        self.state = SessionState::Playing;

        if let Some(transport) = self.transport.as_mut() {
            transport.send_play(RequestTag::new(self.generation, RequestKind::Play), &window);
        }
    }

    fn on_playing(&mut self, result: Result<String, TransportError>) {
        if let Err(e) = result {
            return self.report(SessionError::Play(e));
        }
        self.play_confirmed = true;

        if self.duration > 0.0 {
            let delay = Duration::try_from_secs_f64(self.duration)
                .ok()
                .and_then(|duration| duration.checked_add(self.config.duration_slop));
            match delay {
                Some(delay) => {
                    self.arm_timer(delay);
                    tracing::info!(
                        session = %self.session.id,
                        "Started playing session (for up to {:.1} seconds)", self.duration
                    );
                }
                None => {
                    tracing::warn!(
                        session = %self.session.id,
                        "Expected duration {} is out of range, not arming a timer", self.duration
                    );
                }
            }
        } else {
            tracing::info!(session = %self.session.id, "Started playing session");
        }

        self.proxy.on_connected(self.session.target.address());
    }

    fn arm_timer(&mut self, delay: Duration) {
        let events = self.events.clone();
        let generation = self.generation;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::TimerExpired { generation });
        }));
    }

    /// Close one substream's sink; ends the session once no sink is left
    fn end_substream(&mut self, index: usize) {
        let Some(sink) = self.substreams.get_mut(index).and_then(|s| s.sink.take()) else {
            return;
        };
        sink.close();
        self.release_substream(index);

        if self.state == SessionState::Playing && self.active_sinks() == 0 {
            tracing::info!(session = %self.session.id, "All substreams ended");
            self.teardown();
        }
    }

    fn release_substream(&mut self, index: usize) {
        let Some(substream) = self.substreams.get_mut(index) else {
            return;
        };
        if let Some(transport) = self.transport.as_mut() {
            if substream.watching_end {
                transport.watch_end_of_stream(index, false);
            }
            if substream.ports.is_some() {
                transport.release(index);
            }
        }
        substream.watching_end = false;
        substream.ports = None;
    }

    /// Stop every substream, tell the remote side to stop and drop the transport
    ///
    /// Runs at most once; later calls return immediately.
    pub(crate) fn teardown(&mut self) {
        if matches!(self.state, SessionState::Ending | SessionState::Closed) {
            return;
        }
        self.state = SessionState::Ending;
        self.generation += 1;

        if let Some(timer) = self.timer.take() {
            timer.abort();
        }

        for index in 0..self.substreams.len() {
            if let Some(sink) = self.substreams[index].sink.take() {
                sink.close();
            }
            self.release_substream(index);
        }
        let any_active = self.substreams.iter().any(|s| s.was_active);

        if let Some(mut transport) = self.transport.take() {
            if any_active {
                transport.send_teardown();
            }
            tracing::info!(session = %self.session.id, "Closing the stream");
        }

        self.state = SessionState::Closed;
    }

    /// Tear the session down, then notify the owner of the failure
    fn report(&mut self, error: SessionError) {
        if self.is_closed() {
            return;
        }

        let diagnostic = self
            .transport
            .as_ref()
            .map(|t| t.diagnostic())
            .filter(|d| !d.is_empty());
        self.teardown();

        let mut message = error.to_string();
        if let Some(diagnostic) = diagnostic {
            if !message.contains(&diagnostic) {
                message.push_str("; ");
                message.push_str(&diagnostic);
            }
        }

        let code = error.code();
        tracing::error!(session = %self.session.id, code, "{message}");
        self.proxy.on_error(code, &message);
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrameDelivery;
    use crate::error::codes;
    use crate::session::{Credential, Target};
    use crate::testing::{
        audio_description, InlineDispatcher, RecordingObserver, Script, ScriptedConnector,
        SourceScript, TransportCall, TransportLog,
    };
    use micbridge_sdp::PlayRange;
    use proptest::prelude::*;

    struct Harness {
        controller: SessionController,
        rx: mpsc::UnboundedReceiver<SessionEvent>,
        log: TransportLog,
        observer: Arc<RecordingObserver>,
    }

    impl Harness {
        fn new(script: Script) -> Self {
            Self::with_config(script, SessionConfig::default())
        }

        fn with_config(script: Script, config: SessionConfig) -> Self {
            let connector = ScriptedConnector::new(script);
            let log = connector.log();
            let observer = Arc::new(RecordingObserver::new());
            let proxy = Arc::new(DispatchProxy::new(
                Arc::new(InlineDispatcher),
                observer.clone(),
                observer.clone(),
                observer.clone(),
                FrameDelivery::Direct,
            ));
            let (tx, rx) = mpsc::unbounded_channel();
            let session = Session::new(
                Target::new("10.0.0.5", 554).unwrap(),
                Credential::from_auth_code("1234"),
            );
            let controller =
                SessionController::new(session, config, Arc::new(connector), proxy, tx);

            Self {
                controller,
                rx,
                log,
                observer,
            }
        }

        /// Start the session and handle every event already queued
        fn start(&mut self) {
            self.controller.start();
            self.pump();
        }

        fn pump(&mut self) {
            while let Ok(event) = self.rx.try_recv() {
                self.controller.handle_event(event);
            }
        }

        fn state(&self) -> SessionState {
            self.controller.state()
        }
    }

    fn teardowns(log: &TransportLog) -> usize {
        log.count(&TransportCall::Teardown)
    }

    #[tokio::test]
    async fn test_live_stream_plays_and_reports_success() {
        let script = Script::new(audio_description(1, None))
            .with_source(0, SourceScript::Live(vec![vec![1, 2], vec![3, 4]]));
        let mut harness = Harness::new(script);
        harness.start();

        assert_eq!(harness.state(), SessionState::Playing);
        assert_eq!(harness.observer.connections(), vec!["10.0.0.5".to_string()]);
        assert!(harness.observer.errors().is_empty());
        assert!(harness.controller.timer.is_none());
        assert!(harness.log.contains(&TransportCall::Play(PlayRange::full())));
        assert!(harness.log.contains(&TransportCall::WatchEndOfStream(0, true)));

        tokio::task::yield_now().await;
        assert_eq!(harness.observer.frames(), vec![vec![1, 2], vec![3, 4]]);

        harness.controller.handle_event(SessionEvent::Teardown);
        assert_eq!(harness.state(), SessionState::Closed);
        assert_eq!(teardowns(&harness.log), 1);
        assert!(harness.log.contains(&TransportCall::Release(0)));
        assert!(harness.log.contains(&TransportCall::Closed));
    }

    #[tokio::test]
    async fn test_connect_uses_credential_and_target() {
        let mut harness = Harness::new(Script::new(audio_description(1, None)));
        harness.start();

        assert_eq!(
            harness.log.calls()[0],
            TransportCall::Connect {
                url: "rtsp://10.0.0.5:554/".to_string(),
                username: "velvetSweatshop".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error() {
        let script = Script::new(audio_description(1, None)).with_connect_error(-1, "No route");
        let mut harness = Harness::new(script);
        harness.start();

        assert_eq!(harness.state(), SessionState::Closed);
        let errors = harness.observer.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, -1);
        assert!(errors[0].1.contains("rtsp://10.0.0.5:554/"));
        assert!(!harness.log.contains(&TransportCall::Describe));
    }

    #[tokio::test]
    async fn test_describe_failure_reports_error_once() {
        let script = Script::new("")
            .with_describe_error(500, "Internal Server Error")
            .with_diagnostic("connection reset by peer");
        let mut harness = Harness::new(script);
        harness.start();

        assert_eq!(harness.state(), SessionState::Closed);
        let errors = harness.observer.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, 500);
        assert!(errors[0].1.contains("Internal Server Error"));
        assert!(errors[0].1.ends_with("; connection reset by peer"));
        assert!(harness.observer.connections().is_empty());
        assert_eq!(harness.log.count_matching(|c| matches!(c, TransportCall::TakeSource(_))), 0);
        assert_eq!(teardowns(&harness.log), 0);
        assert!(harness.log.contains(&TransportCall::Closed));
    }

    #[tokio::test]
    async fn test_unauthorized_code_is_passed_through() {
        let script = Script::new("").with_describe_error(codes::UNAUTHORIZED, "Unauthorized");
        let mut harness = Harness::new(script);
        harness.start();

        assert_eq!(harness.observer.errors()[0].0, codes::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unparseable_description_reports_local_failure() {
        let mut harness = Harness::new(Script::new("not a description"));
        harness.start();

        let errors = harness.observer.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, codes::LOCAL_FAILURE);
    }

    #[tokio::test]
    async fn test_description_without_media_reports_error() {
        let mut harness = Harness::new(Script::new(audio_description(0, None)));
        harness.start();

        assert_eq!(
            harness.observer.errors(),
            vec![(codes::LOCAL_FAILURE, SessionError::NoSubstreams.to_string())]
        );
        assert_eq!(harness.log.count_matching(|c| matches!(c, TransportCall::Play(_))), 0);
    }

    #[tokio::test]
    async fn test_failed_setup_skips_substream() {
        let script = Script::new(audio_description(2, None))
            .with_setup_error(0, 461, "Unsupported Transport")
            .with_source(0, SourceScript::Live(vec![vec![0xA0]]))
            .with_source(1, SourceScript::Live(vec![vec![0xB1]]));
        let mut harness = Harness::new(script);
        harness.start();

        assert_eq!(harness.state(), SessionState::Playing);
        assert_eq!(harness.observer.connections().len(), 1);
        assert!(!harness.log.contains(&TransportCall::TakeSource(0)));
        assert!(harness.log.contains(&TransportCall::TakeSource(1)));
        assert!(harness.log.contains(&TransportCall::Release(0)));

        tokio::task::yield_now().await;
        assert_eq!(harness.observer.frames(), vec![vec![0xB1]]);
    }

    #[tokio::test]
    async fn test_failed_initiate_skips_substream() {
        let script = Script::new(audio_description(2, None)).with_initiate_error(0, -1, "No ports");
        let mut harness = Harness::new(script);
        harness.start();

        assert_eq!(harness.state(), SessionState::Playing);
        assert_eq!(
            harness.log.count_matching(|c| matches!(c, TransportCall::Setup { .. })),
            1
        );
        assert!(!harness.log.contains(&TransportCall::Release(0)));
    }

    #[tokio::test]
    async fn test_missing_source_skips_substream() {
        let script = Script::new(audio_description(1, None)).with_source(0, SourceScript::Missing);
        let mut harness = Harness::new(script);
        harness.start();

        assert_eq!(
            harness.observer.errors(),
            vec![(
                codes::LOCAL_FAILURE,
                SessionError::NoActiveSubstreams { attempted: 1 }.to_string()
            )]
        );
        assert!(harness.log.contains(&TransportCall::Release(0)));
    }

    #[tokio::test]
    async fn test_no_usable_substream_reports_error_without_play() {
        let script = Script::new(audio_description(2, None))
            .with_setup_error(0, 461, "Unsupported Transport")
            .with_setup_error(1, 461, "Unsupported Transport");
        let mut harness = Harness::new(script);
        harness.start();

        assert_eq!(harness.state(), SessionState::Closed);
        assert_eq!(harness.observer.errors().len(), 1);
        assert_eq!(harness.observer.errors()[0].0, codes::LOCAL_FAILURE);
        assert_eq!(harness.log.count_matching(|c| matches!(c, TransportCall::Play(_))), 0);
        assert_eq!(teardowns(&harness.log), 0);
    }

    #[tokio::test]
    async fn test_play_failure_tears_down_once() {
        let script =
            Script::new(audio_description(1, None)).with_play_error(454, "Session Not Found");
        let mut harness = Harness::new(script);
        harness.start();

        assert_eq!(harness.state(), SessionState::Closed);
        assert_eq!(harness.observer.errors().len(), 1);
        assert_eq!(harness.observer.errors()[0].0, 454);
        assert!(harness.observer.connections().is_empty());
        assert_eq!(teardowns(&harness.log), 1);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let mut harness = Harness::new(Script::new(audio_description(2, None)));
        harness.start();

        harness.controller.teardown();
        harness.controller.teardown();
        harness.controller.handle_event(SessionEvent::Teardown);
        drop(harness.controller);

        assert_eq!(teardowns(&harness.log), 1);
        assert_eq!(harness.log.count(&TransportCall::Release(0)), 1);
        assert_eq!(harness.log.count(&TransportCall::Release(1)), 1);
        assert_eq!(harness.log.count(&TransportCall::Closed), 1);
    }

    #[tokio::test]
    async fn test_end_of_stream_signal_ends_session_quietly() {
        let mut harness = Harness::new(Script::new(audio_description(1, None)));
        harness.start();
        assert_eq!(harness.state(), SessionState::Playing);

        harness.log.signal_end_of_stream(0);
        harness.pump();

        assert_eq!(harness.state(), SessionState::Closed);
        assert_eq!(harness.observer.connections().len(), 1);
        assert!(harness.observer.errors().is_empty());
        assert!(harness.log.contains(&TransportCall::WatchEndOfStream(0, false)));
        assert_eq!(teardowns(&harness.log), 1);
    }

    #[tokio::test]
    async fn test_substream_ended_during_setup_is_not_reported_as_never_set_up() {
        let script = Script::new(audio_description(2, None))
            .with_setup_error(1, 461, "Unsupported Transport")
            .withholding(RequestKind::Setup { substream: 1 });
        let mut harness = Harness::new(script);
        harness.start();
        assert_eq!(harness.state(), SessionState::SettingUpSubstream(1));

        harness.log.signal_end_of_stream(0);
        harness.pump();
        assert_eq!(harness.state(), SessionState::SettingUpSubstream(1));

        assert_eq!(harness.log.release_withheld(), 1);
        harness.pump();

        assert_eq!(harness.state(), SessionState::Closed);
        let errors = harness.observer.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, codes::LOCAL_FAILURE);
        assert_eq!(errors[0].1, SessionError::EndedBeforePlay { ended: 1 }.to_string());
        assert_eq!(harness.log.count_matching(|c| matches!(c, TransportCall::Play(_))), 0);
        assert_eq!(teardowns(&harness.log), 1);
    }

    #[tokio::test]
    async fn test_session_ends_after_last_substream_closes() {
        let script = Script::new(audio_description(2, None))
            .with_source(0, SourceScript::Closing(vec![vec![1]]))
            .with_source(1, SourceScript::Live(vec![]));
        let mut harness = Harness::new(script);
        harness.start();

        // let the first pump observe its close
        while harness.controller.active_sinks() == 2 {
            tokio::task::yield_now().await;
            harness.pump();
        }
        assert_eq!(harness.state(), SessionState::Playing);

        harness.log.signal_end_of_stream(1);
        harness.pump();
        assert_eq!(harness.state(), SessionState::Closed);
        assert_eq!(teardowns(&harness.log), 1);
    }

    #[tokio::test]
    async fn test_late_setup_response_after_teardown_is_ignored() {
        let script = Script::new(audio_description(1, None))
            .withholding(RequestKind::Setup { substream: 0 });
        let mut harness = Harness::new(script);
        harness.start();
        assert_eq!(harness.state(), SessionState::SettingUpSubstream(0));

        harness.controller.handle_event(SessionEvent::Teardown);
        let calls_before = harness.log.calls().len();
        assert_eq!(harness.log.release_withheld(), 1);
        harness.pump();

        assert_eq!(harness.state(), SessionState::Closed);
        assert_eq!(harness.log.calls().len(), calls_before);
        assert!(harness.observer.connections().is_empty());
        assert!(harness.observer.errors().is_empty());
        assert_eq!(teardowns(&harness.log), 0);
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let mut harness = Harness::new(Script::new(audio_description(1, None)));
        harness.start();

        harness.controller.handle_event(SessionEvent::TimerExpired { generation: 7 });
        harness.controller.handle_event(SessionEvent::SinkClosed {
            substream: 0,
            generation: 7,
        });
        harness.controller.handle_event(SessionEvent::Response {
            tag: RequestTag::new(0, RequestKind::Play),
            result: Ok(String::new()),
        });

        assert_eq!(harness.state(), SessionState::Playing);
        assert_eq!(harness.observer.connections().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_session_never_connects() {
        let mut harness = Harness::new(Script::new(audio_description(1, None)));
        harness.controller.session.expired.expire();
        harness.start();

        assert_eq!(harness.state(), SessionState::Closed);
        assert!(harness.log.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stream_over_tcp_is_requested() {
        let config = SessionConfig::default().with_stream_over_tcp(true);
        let mut harness = Harness::with_config(Script::new(audio_description(1, None)), config);
        harness.start();

        assert!(harness.log.contains(&TransportCall::Setup {
            substream: 0,
            stream_over_tcp: true
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_stream_ends_after_duration_and_slop() {
        let script = Script::new(audio_description(1, Some("npt=0-10")));
        let connector = ScriptedConnector::new(script);
        let log = connector.log();
        let observer = Arc::new(RecordingObserver::new());
        let proxy = Arc::new(DispatchProxy::new(
            Arc::new(InlineDispatcher),
            observer.clone(),
            observer.clone(),
            observer.clone(),
            FrameDelivery::Direct,
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(
            Target::new("10.0.0.5", 554).unwrap(),
            Credential::from_auth_code("1234"),
        );
        let config = SessionConfig::default().with_duration_slop(Duration::from_secs(2));
        let controller = SessionController::new(session, config, Arc::new(connector), proxy, tx);

        let started = tokio::time::Instant::now();
        controller.run(rx).await;

        assert!(started.elapsed() >= Duration::from_secs(12));
        assert!(started.elapsed() < Duration::from_secs(13));
        assert_eq!(observer.connections().len(), 1);
        assert_eq!(teardowns(&log), 1);
        assert!(log.contains(&TransportCall::Play(PlayRange::full())));
    }

    #[tokio::test]
    async fn test_out_of_range_timer_plays_without_expiry() {
        let script = Script::new(audio_description(1, Some("npt=0-10")));
        let config = SessionConfig::default().with_duration_slop(Duration::MAX);
        assert!(config.validate().is_ok());
        let mut harness = Harness::with_config(script, config);
        harness.start();

        assert_eq!(harness.state(), SessionState::Playing);
        assert!(harness.controller.timer.is_none());
        assert_eq!(harness.observer.connections().len(), 1);
        assert!(harness.observer.errors().is_empty());

        harness.controller.handle_event(SessionEvent::Teardown);
        assert_eq!(teardowns(&harness.log), 1);
    }

    #[tokio::test]
    async fn test_absolute_range_is_played() {
        let range = "clock=20240101T000000Z-20240101T000030Z";
        let mut harness = Harness::new(Script::new(audio_description(1, Some(range))));
        harness.start();

        let expected: PlayRange = range.parse().unwrap();
        assert!(harness.log.contains(&TransportCall::Play(expected)));
        assert!(harness.controller.timer.is_some());
        assert!((harness.controller.duration - 30.0).abs() < f64::EPSILON);
    }

    #[derive(Debug, Clone)]
    enum Outcome {
        Succeed,
        Fail,
        NoSource,
    }

    fn outcome() -> impl Strategy<Value = Outcome> {
        prop_oneof![Just(Outcome::Succeed), Just(Outcome::Fail), Just(Outcome::NoSource)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Exactly one of success or error is reported, and teardown is sent at most once
        #[test]
        fn prop_single_outcome_per_session(
            outcomes in prop::collection::vec(outcome(), 0..5),
            play_fails in any::<bool>(),
            owner_teardowns in 0usize..3,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let mut script = Script::new(audio_description(outcomes.len(), None));
                for (index, outcome) in outcomes.iter().enumerate() {
                    script = match outcome {
                        Outcome::Succeed => script,
                        Outcome::Fail => {
                            script.with_setup_error(index, 461, "Unsupported Transport")
                        }
                        Outcome::NoSource => script.with_source(index, SourceScript::Missing),
                    };
                }
                if play_fails {
                    script = script.with_play_error(454, "Session Not Found");
                }

                let mut harness = Harness::new(script);
                harness.start();
                for _ in 0..owner_teardowns {
                    harness.controller.handle_event(SessionEvent::Teardown);
                }
                drop(harness.controller);

                let usable = outcomes.iter().filter(|o| matches!(o, Outcome::Succeed)).count();
                let connections = harness.observer.connections().len();
                let errors = harness.observer.errors().len();

                prop_assert_eq!(connections + errors, 1);
                prop_assert_eq!(connections == 1, usable > 0 && !play_fails);
                prop_assert!(teardowns(&harness.log) <= 1);
                prop_assert_eq!(teardowns(&harness.log) == 1, usable > 0);
                prop_assert_eq!(harness.log.count(&TransportCall::Closed), 1);
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
