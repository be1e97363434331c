use crate::backend::{BackendDescriptor, TraceRequest};
use crate::enrich::GeoEnricher;
use crate::error::TraceError;
use crate::finalize::ResultFinalizer;
use crate::pipeline::{HopCallback, HopSink, LinePipeline};
use crate::process::{BackendLauncher, ProcessControl, SystemLauncher};
use crate::select::{AddressChooser, Clock, SelectionConfig, SelectionController, SystemClock};
use hoptrace_model::{HopRecord, SessionOutcome, SessionStatus};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Span};

const DEFAULT_GRACE: Duration = Duration::from_secs(30);
const OUTPUT_TAIL_LINES: usize = 20;
const READ_CHUNK: usize = 4096;
/// How long the loop waits for output before checking on a stalled prompt.
const IDLE_POLL: Duration = Duration::from_millis(100);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Everything a session needs besides the request itself.
#[derive(Clone)]
pub struct TraceContext {
    pub launcher: Arc<dyn BackendLauncher>,
    /// `None` selects addresses automatically.
    pub chooser: Option<Arc<dyn AddressChooser>>,
    pub clock: Arc<dyn Clock>,
    pub selection: SelectionConfig,
    pub on_hop: Option<HopCallback>,
    /// Applied to native dialects only; the rich backend geolocates itself.
    pub enrichment: Option<GeoEnricher>,
    /// Added to `max_hops × probe_timeout` to form the overall deadline.
    pub grace: Duration,
}

impl Default for TraceContext {
    fn default() -> Self {
        Self {
            launcher: Arc::new(SystemLauncher),
            chooser: None,
            clock: Arc::new(SystemClock::new()),
            selection: SelectionConfig::default(),
            on_hop: None,
            enrichment: None,
            grace: DEFAULT_GRACE,
        }
    }
}

impl TraceContext {
    pub fn with_launcher(mut self, launcher: Arc<dyn BackendLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_chooser(mut self, chooser: Arc<dyn AddressChooser>) -> Self {
        self.chooser = Some(chooser);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_selection(mut self, selection: SelectionConfig) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_hop_callback(mut self, on_hop: HopCallback) -> Self {
        self.on_hop = Some(on_hop);
        self
    }

    pub fn with_enrichment(mut self, enricher: GeoEnricher) -> Self {
        self.enrichment = Some(enricher);
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

/// Adapts the per-hop callback into a channel for consumers that poll.
pub fn hop_channel() -> (HopCallback, Receiver<HopRecord>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let callback: HopCallback = Arc::new(move |hop: &HopRecord| {
        let tx = tx.lock().unwrap_or_else(|err| err.into_inner());
        let _ = tx.send(hop.clone());
    });
    (callback, rx)
}

/// Cancels a running session from any thread.
#[derive(Clone)]
pub struct SessionCanceller {
    cancelled: Arc<AtomicBool>,
    control: Arc<dyn ProcessControl>,
}

impl SessionCanceller {
    /// Idempotent. The session resolves as `Cancelled` unless it already
    /// finished.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("cancelling trace session");
        if let Err(err) = self.control.terminate() {
            warn!(error = %err, "failed to terminate trace backend");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub struct SessionHandle {
    id: u64,
    target: String,
    backend: String,
    canceller: SessionCanceller,
    worker: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn canceller(&self) -> SessionCanceller {
        self.canceller.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Blocks until the session resolves.
    pub fn await_outcome(self) -> SessionOutcome {
        match self.worker.join() {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(session = self.id, "trace session thread panicked");
                ResultFinalizer::new(self.target, self.backend).finish(
                    SessionStatus::Failed {
                        reason: "trace session thread panicked".to_string(),
                    },
                    None,
                )
            }
        }
    }
}

/// Entry point for supervised trace runs.
pub struct TraceSession;

impl TraceSession {
    /// Launches the backend and returns immediately. Lines are processed on
    /// a dedicated thread until the stream ends, the deadline passes or the
    /// session is cancelled.
    pub fn start(request: TraceRequest, context: TraceContext) -> Result<SessionHandle, TraceError> {
        request.validate()?;
        let descriptor = request.descriptor();
        let invocation = descriptor.invocation(&request);
        let budget = request.overall_budget(context.grace);
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let target = request.target.trim().to_string();

        let span = info_span!("trace_session", id, target = %target, backend = descriptor.name);
        let spawned = {
            let _guard = span.enter();
            let spawned = context.launcher.launch(&invocation)?;
            info!(
                program = %invocation.program.display(),
                args = ?invocation.args,
                budget = ?budget,
                "trace session started"
            );
            spawned
        };

        let canceller = SessionCanceller {
            cancelled: Arc::new(AtomicBool::new(false)),
            control: spawned.control.clone(),
        };

        let (tx, rx) = mpsc::channel();
        let mut open_streams = 0;
        spawn_reader(id, "stdout", spawned.stdout, descriptor, tx.clone()).map_err(|err| {
            let _ = spawned.control.terminate();
            TraceError::Io(err)
        })?;
        open_streams += 1;
        if let Some(stderr) = spawned.stderr {
            match spawn_reader(id, "stderr", stderr, descriptor, tx.clone()) {
                Ok(()) => open_streams += 1,
                Err(err) => warn!(error = %err, "failed to read backend stderr"),
            }
        }
        drop(tx);

        let controller =
            SelectionController::new(context.selection.clone(), context.chooser.clone(), context.clock.clone());
        let sink = HopSink {
            enricher: context
                .enrichment
                .clone()
                .filter(|_| descriptor.dialect.is_native()),
            on_hop: context.on_hop.clone(),
        };
        let pipeline = LinePipeline::new(
            descriptor,
            controller,
            ResultFinalizer::new(target.clone(), descriptor.name),
            sink,
        );

        let session = SessionLoop {
            descriptor,
            pipeline,
            lines: rx,
            open_streams,
            input: spawned
                .stdin
                .unwrap_or_else(|| Box::new(ClosedInput) as Box<dyn Write + Send>),
            control: spawned.control.clone(),
            cancelled: canceller.cancelled.clone(),
            budget,
            tail: VecDeque::with_capacity(OUTPUT_TAIL_LINES),
            pending: Vec::new(),
            partials: HashMap::new(),
        };

        let worker = thread::Builder::new()
            .name(format!("hoptrace-session-{id}"))
            .spawn(move || session.run(span))
            .map_err(|err| {
                let _ = spawned.control.terminate();
                TraceError::Io(err)
            })?;

        Ok(SessionHandle {
            id,
            target,
            backend: descriptor.name.to_string(),
            canceller,
            worker,
        })
    }
}

/// Starts a session and blocks until it resolves.
pub fn run_trace(request: TraceRequest, context: TraceContext) -> Result<SessionOutcome, TraceError> {
    Ok(TraceSession::start(request, context)?.await_outcome())
}

enum StreamMessage {
    Line(&'static str, String),
    /// Output since the last newline, resent whenever a read ends mid-line.
    Partial(&'static str, String),
    Closed(&'static str),
}

fn spawn_reader(
    id: u64,
    name: &'static str,
    mut stream: Box<dyn Read + Send>,
    descriptor: &'static BackendDescriptor,
    tx: Sender<StreamMessage>,
) -> io::Result<()> {
    let decode = move |bytes: &[u8]| {
        descriptor
            .decode_output(bytes)
            .trim_end_matches(['\r', '\n'])
            .to_string()
    };
    thread::Builder::new()
        .name(format!("hoptrace-{name}-{id}"))
        .spawn(move || {
            let mut chunk = [0u8; READ_CHUNK];
            let mut pending = Vec::new();
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        pending.extend_from_slice(&chunk[..n]);
                        while let Some(end) = pending.iter().position(|byte| *byte == b'\n') {
                            let line: Vec<u8> = pending.drain(..=end).collect();
                            if tx.send(StreamMessage::Line(name, decode(&line[..]))).is_err() {
                                return;
                            }
                        }
                        if !pending.is_empty()
                            && tx
                                .send(StreamMessage::Partial(name, decode(&pending[..])))
                                .is_err()
                        {
                            return;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(stream = name, error = %err, "backend stream read failed");
                        break;
                    }
                }
            }
            if !pending.is_empty() {
                let _ = tx.send(StreamMessage::Line(name, decode(&pending[..])));
            }
            let _ = tx.send(StreamMessage::Closed(name));
        })?;
    Ok(())
}

/// Unterminated output of one stream and how much of it was already parsed.
#[derive(Default)]
struct PartialLine {
    text: String,
    fed: String,
}

impl PartialLine {
    /// The part not yet fed, once the stream has gone idle.
    fn take_unfed(&mut self) -> Option<String> {
        let rest = self.text.strip_prefix(self.fed.as_str())?;
        if rest.trim().is_empty() {
            return None;
        }
        let rest = rest.to_string();
        self.fed = self.text.clone();
        Some(rest)
    }

    /// What is left of the completed line after the part fed while idle.
    fn complete(self, line: String) -> Option<String> {
        if self.fed.is_empty() {
            return Some(line);
        }
        match line.strip_prefix(self.fed.as_str()) {
            Some(rest) if rest.trim().is_empty() => None,
            Some(rest) => Some(rest.to_string()),
            None => Some(line),
        }
    }
}

/// Stdin stand-in when the launcher provided none; any selection fails.
struct ClosedInput;

impl Write for ClosedInput {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "backend stdin is not available"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum LoopEnd {
    StreamEnded,
    Cancelled,
    TimedOut,
    Failed(TraceError),
}

struct SessionLoop {
    descriptor: &'static BackendDescriptor,
    pipeline: LinePipeline,
    lines: Receiver<StreamMessage>,
    open_streams: usize,
    input: Box<dyn Write + Send>,
    control: Arc<dyn ProcessControl>,
    cancelled: Arc<AtomicBool>,
    budget: Duration,
    tail: VecDeque<String>,
    /// Lines held back for dialects that are parsed once output is complete.
    pending: Vec<String>,
    partials: HashMap<&'static str, PartialLine>,
}

impl SessionLoop {
    fn run(mut self, span: Span) -> SessionOutcome {
        let _guard = span.enter();
        let end = self.consume();
        self.resolve(end)
    }

    fn consume(&mut self) -> LoopEnd {
        let deadline = Instant::now().checked_add(self.budget);
        loop {
            let wait = match deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(IDLE_POLL),
                None => IDLE_POLL,
            };
            let message = self.lines.recv_timeout(wait);

            if self.is_cancelled() {
                return LoopEnd::Cancelled;
            }

            match message {
                Ok(StreamMessage::Line(stream, line)) => {
                    let line = match self.partials.remove(stream) {
                        Some(partial) => partial.complete(line),
                        None => Some(line),
                    };
                    if let Some(end) = line.and_then(|line| self.accept(line)) {
                        return end;
                    }
                }
                Ok(StreamMessage::Partial(stream, text)) => {
                    self.partials.entry(stream).or_default().text = text;
                }
                Ok(StreamMessage::Closed(stream)) => {
                    debug!(stream, "backend stream closed");
                    self.open_streams = self.open_streams.saturating_sub(1);
                    if self.open_streams == 0 {
                        return LoopEnd::StreamEnded;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        return LoopEnd::TimedOut;
                    }
                    if let Some(end) = self.idle() {
                        return end;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return LoopEnd::StreamEnded,
            }
        }
    }

    fn accept(&mut self, line: String) -> Option<LoopEnd> {
        self.remember(&line);
        if !self.descriptor.realtime {
            self.pending.push(line);
            return None;
        }
        let fed = self.pipeline.feed(&line, &mut self.input);
        self.check(fed)
    }

    /// The backend is quiet: parse output it left without a newline (such as
    /// a prompt waiting on stdin), then let a stalled prompt resolve.
    fn idle(&mut self) -> Option<LoopEnd> {
        if !self.descriptor.realtime {
            return None;
        }
        let unfed: Vec<String> = self
            .partials
            .values_mut()
            .filter_map(PartialLine::take_unfed)
            .collect();
        for text in unfed {
            debug!(text = %text, "parsing unterminated output");
            if let Some(end) = self.accept(text) {
                return Some(end);
            }
        }
        let ticked = self.pipeline.tick(&mut self.input);
        self.check(ticked)
    }

    fn check(&self, result: Result<(), TraceError>) -> Option<LoopEnd> {
        match result {
            Ok(()) => None,
            Err(_) if self.is_cancelled() => Some(LoopEnd::Cancelled),
            Err(err) => Some(LoopEnd::Failed(err)),
        }
    }

    fn resolve(mut self, end: LoopEnd) -> SessionOutcome {
        let outcome = match end {
            LoopEnd::StreamEnded => {
                if let Err(err) = self.drain_pending() {
                    return self.fail(err);
                }
                self.pipeline.finish();
                let code = self.wait();
                if self.is_cancelled() {
                    self.finish(SessionStatus::Cancelled, code)
                } else if code.is_some_and(|code| code != 0) && self.pipeline.finalizer().is_empty() {
                    let output = self.tail.iter().cloned().collect::<Vec<_>>().join("\n");
                    let err = TraceError::ProcessTerminatedUnexpectedly { code, output };
                    self.finish_with_error(&err, code)
                } else {
                    self.finish(SessionStatus::Completed, code)
                }
            }
            LoopEnd::Cancelled => {
                self.terminate();
                let code = self.wait();
                self.finish(SessionStatus::Cancelled, code)
            }
            LoopEnd::TimedOut => {
                let budget = self.budget;
                warn!(budget = ?budget, "trace session timed out; stopping backend");
                self.terminate();
                let _ = self.drain_pending();
                self.pipeline.finish();
                let code = self.wait();
                self.finish_with_error(&TraceError::StreamTimeout(budget), code)
            }
            LoopEnd::Failed(err) => return self.fail(err),
        };

        info!(
            status = ?outcome.status,
            hops = outcome.hops.len(),
            exit_code = ?outcome.exit_code,
            "trace session finished"
        );
        outcome
    }

    fn fail(self, err: TraceError) -> SessionOutcome {
        warn!(error = %err, "trace session failed");
        self.terminate();
        let code = self.wait();
        let outcome = self.finish_with_error(&err, code);
        info!(status = ?outcome.status, "trace session finished");
        outcome
    }

    fn drain_pending(&mut self) -> Result<(), TraceError> {
        for line in std::mem::take(&mut self.pending) {
            self.pipeline.feed(&line, &mut self.input)?;
        }
        Ok(())
    }

    fn remember(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        if self.tail.len() == OUTPUT_TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn terminate(&self) {
        if let Err(err) = self.control.terminate() {
            warn!(error = %err, "failed to terminate trace backend");
        }
    }

    fn wait(&self) -> Option<i32> {
        match self.control.wait() {
            Ok(code) => code,
            Err(err) => {
                warn!(error = %err, "failed to collect backend exit status");
                None
            }
        }
    }

    fn finish(self, status: SessionStatus, code: Option<i32>) -> SessionOutcome {
        let (finalizer, _) = self.pipeline.into_parts();
        finalizer.finish(status, code)
    }

    fn finish_with_error(self, err: &TraceError, code: Option<i32>) -> SessionOutcome {
        let (finalizer, _) = self.pipeline.into_parts();
        finalizer.finish_with_error(err, code)
    }
}
