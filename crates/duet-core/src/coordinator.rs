//! Audio/video coordination over one sink and one clock
//!
//! The [`AvSyncCoordinator`] owns both stream controllers and the sink. Its
//! [`run`](AvSyncCoordinator::run) loop is the single place where sink
//! notifications, fetch completions and clock events are handled, so the
//! controllers are only ever touched from one task.

use crate::{
    clock::{ClockEvent, PlaybackClock},
    config::EngineConfig,
    controller::{BufferCheck, ControllerStats, FetchDone, FetchRequest, StreamBufferController},
    fetch::RangeFetcher,
    sink::{MediaSink, ReadyState, SinkEvent},
    types::{SessionId, SourcePair, StreamKind},
    Error, Result,
};
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Drives a video stream and an audio stream into one sink
pub struct AvSyncCoordinator {
    session_id: SessionId,
    sources: SourcePair,
    config: EngineConfig,
    sink: Box<dyn MediaSink>,
    fetcher: Arc<dyn RangeFetcher>,
    clock: Arc<dyn PlaybackClock>,
    video: Option<StreamBufferController>,
    audio: Option<StreamBufferController>,
    opened: bool,
    seeking: bool,
    video_ended: bool,
    audio_ended: bool,
    finalized: bool,
    fetch_tx: mpsc::UnboundedSender<FetchDone>,
    fetch_rx: Option<mpsc::UnboundedReceiver<FetchDone>>,
    shutdown: CancellationToken,
}

impl AvSyncCoordinator {
    /// Check codec support and set up an engine for the pair
    ///
    /// Nothing is fetched until the sink reports it is open.
    pub fn new(
        sources: SourcePair,
        config: EngineConfig,
        sink: Box<dyn MediaSink>,
        fetcher: Arc<dyn RangeFetcher>,
        clock: Arc<dyn PlaybackClock>,
    ) -> Result<Self> {
        config.validate()?;
        for source in [&sources.video, &sources.audio] {
            if !sink.is_type_supported(&source.mime_codec) {
                error!(mime = %source.mime_codec, "Unsupported MIME type or codec");
                return Err(Error::UnsupportedCodec {
                    codec: source.mime_codec.clone(),
                });
            }
        }

        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        Ok(Self {
            session_id: SessionId::new(),
            sources,
            config,
            sink,
            fetcher,
            clock,
            video: None,
            audio: None,
            opened: false,
            seeking: false,
            video_ended: false,
            audio_ended: false,
            finalized: false,
            fetch_tx,
            fetch_rx: Some(fetch_rx),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn is_opened(&self) -> bool {
        self.opened
    }

    pub fn is_seeking(&self) -> bool {
        self.seeking
    }

    /// True once end of stream has been passed to the sink in this lifecycle
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn controller(&self, kind: StreamKind) -> Option<&StreamBufferController> {
        match kind {
            StreamKind::Video => self.video.as_ref(),
            StreamKind::Audio => self.audio.as_ref(),
        }
    }

    fn controller_mut(&mut self, kind: StreamKind) -> Option<&mut StreamBufferController> {
        match kind {
            StreamKind::Video => self.video.as_mut(),
            StreamKind::Audio => self.audio.as_mut(),
        }
    }

    pub fn stats(&self) -> Vec<ControllerStats> {
        [&self.video, &self.audio]
            .into_iter()
            .flatten()
            .map(|c| c.stats())
            .collect()
    }

    /// Token that stops [`run`](Self::run) when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Configuration for a replacement engine that resumes at the playhead,
    /// as used when switching quality
    pub fn resume_config(&self) -> EngineConfig {
        EngineConfig {
            start_time: self.clock.current_time(),
            ..self.config.clone()
        }
    }

    /// Create and initialize both streams on first open
    ///
    /// A later open (the sink re-opening after end of stream, once media is
    /// appended again) keeps the existing streams and starts a new
    /// end-of-stream lifecycle.
    #[instrument(skip(self), fields(session = %self.session_id))]
    pub fn on_source_open(&mut self) -> Result<()> {
        if self.opened {
            debug!("Sink re-opened, keeping existing streams");
            self.video_ended = false;
            self.audio_ended = false;
            self.finalized = false;
            return Ok(());
        }

        let video_buffer = self
            .sink
            .add_source_buffer(StreamKind::Video, &self.sources.video.mime_codec)?;
        let audio_buffer = self
            .sink
            .add_source_buffer(StreamKind::Audio, &self.sources.audio.mime_codec)?;

        let mut video = StreamBufferController::new(self.sources.video.clone(), video_buffer, &self.config);
        let mut audio = StreamBufferController::new(self.sources.audio.clone(), audio_buffer, &self.config);
        if video.kind() != StreamKind::Video || audio.kind() != StreamKind::Audio {
            warn!(
                video = %video.kind(),
                audio = %audio.kind(),
                "Source pair kinds look swapped"
            );
        }
        video.initialize();
        audio.initialize();
        self.video = Some(video);
        self.audio = Some(audio);
        self.opened = true;

        info!(
            quality = self.sources.quality_string.as_deref().unwrap_or("unknown"),
            start_time = self.config.start_time,
            "Streams opened"
        );
        self.dispatch();
        Ok(())
    }

    /// Run a buffer check on both streams unless a seek is underway
    pub fn check_both_buffers(&mut self) {
        if self.seeking {
            return;
        }
        let position = self.clock.current_time();
        for kind in [StreamKind::Audio, StreamKind::Video] {
            let check = self
                .controller_mut(kind)
                .map(|c| c.check_buffer(position))
                .unwrap_or(BufferCheck::NotReady);
            if check == BufferCheck::EndOfStream {
                self.stream_end_of_stream(kind);
            }
        }
        self.dispatch();
    }

    /// Note that a seek is underway; buffer checks pause until [`seek`](Self::seek)
    pub fn begin_seek(&mut self) {
        self.seeking = true;
    }

    /// Act on the clock's current position after a seek
    #[instrument(skip(self), fields(session = %self.session_id))]
    pub fn seek(&mut self) {
        if self.sink.ready_state() != ReadyState::Open {
            warn!(state = ?self.sink.ready_state(), "Seek while sink is not open");
            self.seeking = false;
            return;
        }
        let position = self.clock.current_time();
        debug!(position, "Seeking");
        self.seeking = true;
        for kind in [StreamKind::Audio, StreamKind::Video] {
            if let Some(controller) = self.controller_mut(kind) {
                controller.handle_seek(position);
            }
        }
        self.seeking = false;
        self.dispatch();
    }

    /// Record that one stream reached its end; finalize once both have
    pub fn stream_end_of_stream(&mut self, kind: StreamKind) {
        match kind {
            StreamKind::Video => self.video_ended = true,
            StreamKind::Audio => self.audio_ended = true,
        }
        if !(self.video_ended && self.audio_ended) || self.finalized {
            return;
        }
        match self.sink.end_of_stream() {
            Ok(()) => {
                self.finalized = true;
                info!(session = %self.session_id, "End of stream");
            }
            Err(e) => warn!(session = %self.session_id, error = %e, "Sink refused end of stream"),
        }
    }

    /// Close both streams and detach their buffers
    #[instrument(skip(self), fields(session = %self.session_id))]
    pub fn close(&mut self) {
        for kind in [StreamKind::Video, StreamKind::Audio] {
            if let Some(controller) = self.controller_mut(kind) {
                if controller.is_closed() {
                    continue;
                }
                controller.close();
                self.sink.remove_source_buffer(kind);
            }
        }
        self.shutdown.cancel();
    }

    pub fn handle_sink_event(&mut self, event: SinkEvent) {
        match event {
            SinkEvent::SourceOpen => {
                if let Err(e) = self.on_source_open() {
                    error!(session = %self.session_id, error = %e, "Could not open streams");
                }
            }
            SinkEvent::UpdateEnd(kind) => {
                let position = self.clock.current_time();
                if let Some(controller) = self.controller_mut(kind) {
                    controller.on_update_end(position);
                }
                self.dispatch();
            }
            SinkEvent::SourceEnded => debug!(session = %self.session_id, "Sink ended"),
        }
    }

    pub fn handle_fetch_done(&mut self, done: FetchDone) {
        let position = self.clock.current_time();
        if let Some(controller) = self.controller_mut(done.request.kind) {
            controller.on_fetch_complete(done, position);
        }
        self.dispatch();
    }

    /// Spawn the fetches both controllers asked for
    fn dispatch(&mut self) {
        let requests: Vec<FetchRequest> = [&mut self.video, &mut self.audio]
            .into_iter()
            .flatten()
            .flat_map(|c| c.take_fetch_requests())
            .collect();

        for request in requests {
            let fetcher = self.fetcher.clone();
            let done_tx = self.fetch_tx.clone();
            let span = info_span!(
                "fetch",
                session = %self.session_id,
                stream = %request.kind,
                target = ?request.target
            );
            tokio::spawn(
                async move {
                    let result = tokio::select! {
                        _ = request.cancel.cancelled() => {
                            debug!("Fetch cancelled");
                            return;
                        }
                        result = fetcher.fetch_range(&request.url, request.range) => result,
                    };
                    let _ = done_tx.send(FetchDone { request, result });
                }
                .instrument(span),
            );
        }
    }

    /// Event loop: runs until the shutdown token fires or the clock goes away
    ///
    /// Seek notifications are debounced; only the last one in a burst is
    /// acted upon, once the configured quiet period has passed.
    pub async fn run(mut self, mut sink_events: mpsc::UnboundedReceiver<SinkEvent>) -> Result<()> {
        let Some(mut fetch_rx) = self.fetch_rx.take() else {
            return Err(Error::SinkState("coordinator is already running".into()));
        };
        let mut clock_events = self.clock.subscribe();
        let shutdown = self.shutdown.clone();
        let debounce = self.config.seek_debounce();
        let seek_timer = sleep_until(Instant::now());
        tokio::pin!(seek_timer);
        let mut seek_pending = false;

        info!(session = %self.session_id, "Coordinator running");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(event) = sink_events.recv() => self.handle_sink_event(event),
                Some(done) = fetch_rx.recv() => self.handle_fetch_done(done),
                event = clock_events.recv() => match event {
                    Ok(ClockEvent::TimeUpdate(_)) => self.check_both_buffers(),
                    Ok(ClockEvent::Seeking(position)) => {
                        debug!(position, "Seek notification");
                        self.begin_seek();
                        seek_timer.as_mut().reset(Instant::now() + debounce);
                        seek_pending = true;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Clock events dropped");
                    }
                    Err(RecvError::Closed) => {
                        info!("Clock closed");
                        break;
                    }
                },
                _ = &mut seek_timer, if seek_pending => {
                    seek_pending = false;
                    self.seek();
                }
            }
        }

        self.close();
        info!(session = %self.session_id, finalized = self.finalized, "Coordinator stopped");
        Ok(())
    }
}
