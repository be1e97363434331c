//! Handling of the rich backend's "which address?" prompt.

use crate::classify::LineEvent;
use crate::error::TraceError;
use hoptrace_model::{AddressFamily, SelectionOption};
use std::io::Write;
use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Picks one of the offered addresses. `Ok(None)` cancels the trace.
pub trait AddressChooser: Send + Sync {
    fn choose(&self, options: &[SelectionOption]) -> anyhow::Result<Option<u32>>;
}

impl<F> AddressChooser for F
where
    F: Fn(&[SelectionOption]) -> anyhow::Result<Option<u32>> + Send + Sync,
{
    fn choose(&self, options: &[SelectionOption]) -> anyhow::Result<Option<u32>> {
        self(options)
    }
}

/// Monotonic time source, swappable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Clock that only moves when slept on or advanced.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|err| err.into_inner());
        *now += duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
        thread::yield_now();
    }
}

#[derive(Debug, Clone)]
pub struct SelectionConfig {
    /// Collection stops as soon as this many options are buffered.
    pub option_cap: usize,
    /// How long a chooser gets before the automatic rule takes over.
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Treat the first non-option line after an option as the end of the list.
    pub end_on_non_option: bool,
    /// Silence after the last option that also ends the list.
    pub quiet_period: Duration,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            option_cap: 4,
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            end_on_non_option: true,
            quiet_period: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionState {
    Idle,
    CollectingOptions,
    AwaitingChoice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChoiceSource {
    Chooser,
    /// No chooser configured.
    Automatic,
    /// The chooser did not answer in time.
    TimeoutFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub option: SelectionOption,
    pub source: ChoiceSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerStep {
    /// Not a prompt line; route it as usual.
    PassThrough,
    /// Consumed by the prompt.
    Consumed,
    /// A choice was written to the backend. With `replay`, the line that ended
    /// the option list still needs normal routing.
    Resolved { choice: Choice, replay: bool },
}

/// First IPv4 option, else the first option offered.
pub fn automatic_choice(options: &[SelectionOption]) -> Option<&SelectionOption> {
    options
        .iter()
        .find(|option| option.family == AddressFamily::V4)
        .or_else(|| options.first())
}

pub struct SelectionController {
    config: SelectionConfig,
    chooser: Option<Arc<dyn AddressChooser>>,
    clock: Arc<dyn Clock>,
    state: SelectionState,
    options: Vec<SelectionOption>,
    prompt_started: Option<Duration>,
    last_activity: Option<Duration>,
}

impl SelectionController {
    pub fn new(
        config: SelectionConfig,
        chooser: Option<Arc<dyn AddressChooser>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            chooser,
            clock,
            state: SelectionState::Idle,
            options: Vec::new(),
            prompt_started: None,
            last_activity: None,
        }
    }

    pub fn state(&self) -> SelectionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != SelectionState::Idle
    }

    pub fn is_collecting(&self) -> bool {
        self.state == SelectionState::CollectingOptions
    }

    pub fn buffered(&self) -> &[SelectionOption] {
        &self.options
    }

    /// Feeds one classified line. Writes the choice to `input` once the
    /// option list is complete.
    pub fn observe<W>(&mut self, event: &LineEvent, input: &mut W) -> Result<ControllerStep, TraceError>
    where
        W: Write + ?Sized,
    {
        if let LineEvent::SelectionPromptStart = event {
            if !self.options.is_empty() {
                warn!(
                    discarded = self.options.len(),
                    "prompt restarted before a choice was made"
                );
            }
            self.options.clear();
            self.state = SelectionState::CollectingOptions;
            self.prompt_started = Some(self.clock.now());
            self.last_activity = self.prompt_started;
            info!("address selection prompt detected");
            return Ok(ControllerStep::Consumed);
        }

        if self.state != SelectionState::CollectingOptions {
            return Ok(ControllerStep::PassThrough);
        }

        if let LineEvent::SelectionOption(option) = event {
            self.options.push(option.clone());
            self.last_activity = Some(self.clock.now());
            if self.options.len() >= self.config.option_cap.max(1) {
                let choice = self.resolve(input)?;
                return Ok(ControllerStep::Resolved {
                    choice,
                    replay: false,
                });
            }
            return Ok(ControllerStep::Consumed);
        }

        if let LineEvent::SelectionListEnd = event {
            if self.options.is_empty() {
                self.reset();
                return Err(TraceError::SelectionFailed(
                    "backend asked for a choice without offering addresses".to_string(),
                ));
            }
            let choice = self.resolve(input)?;
            return Ok(ControllerStep::Resolved {
                choice,
                replay: false,
            });
        }

        let elapsed = self.prompt_elapsed();
        if !self.options.is_empty() {
            if self.config.end_on_non_option || elapsed >= self.config.timeout {
                let choice = self.resolve(input)?;
                return Ok(ControllerStep::Resolved {
                    choice,
                    replay: true,
                });
            }
            return Ok(ControllerStep::Consumed);
        }

        if elapsed >= self.config.timeout {
            return Err(self.no_options());
        }

        Ok(ControllerStep::Consumed)
    }

    /// Called while the backend is silent. Answers a prompt whose option
    /// list stopped growing for `quiet_period`, and fails one that offered
    /// nothing within `timeout`.
    pub fn tick<W>(&mut self, input: &mut W) -> Result<Option<Choice>, TraceError>
    where
        W: Write + ?Sized,
    {
        if self.state != SelectionState::CollectingOptions {
            return Ok(None);
        }
        if self.options.is_empty() {
            if self.prompt_elapsed() >= self.config.timeout {
                return Err(self.no_options());
            }
            return Ok(None);
        }

        let quiet = self
            .last_activity
            .map(|at| self.clock.now().saturating_sub(at))
            .unwrap_or_default();
        if quiet < self.config.quiet_period {
            return Ok(None);
        }
        debug!(options = self.options.len(), quiet = ?quiet, "option list went quiet");
        self.resolve(input).map(Some)
    }

    /// Drops an unfinished prompt at end of stream. Returns how many options
    /// were discarded.
    pub fn abandon(&mut self) -> usize {
        let discarded = self.options.len();
        if self.is_active() {
            warn!(discarded, "stream ended during address selection");
        }
        self.reset();
        discarded
    }

    fn prompt_elapsed(&self) -> Duration {
        self.prompt_started
            .map(|start| self.clock.now().saturating_sub(start))
            .unwrap_or_default()
    }

    fn reset(&mut self) {
        self.options.clear();
        self.state = SelectionState::Idle;
        self.prompt_started = None;
        self.last_activity = None;
    }

    fn no_options(&mut self) -> TraceError {
        self.reset();
        TraceError::SelectionFailed(format!(
            "no address options offered within {:?}",
            self.config.timeout
        ))
    }

    fn resolve<W>(&mut self, input: &mut W) -> Result<Choice, TraceError>
    where
        W: Write + ?Sized,
    {
        self.state = SelectionState::AwaitingChoice;
        let options = std::mem::take(&mut self.options);

        let outcome = match self.chooser.clone() {
            None => automatic_choice(&options)
                .cloned()
                .map(|option| Choice {
                    option,
                    source: ChoiceSource::Automatic,
                })
                .ok_or_else(|| TraceError::SelectionFailed("no options to choose from".to_string())),
            Some(chooser) => self.await_chooser(chooser, &options),
        };

        let choice = match outcome {
            Ok(choice) => choice,
            Err(err) => {
                self.reset();
                return Err(err);
            }
        };

        let written = writeln!(input, "{}", choice.option.offered_index).and_then(|_| input.flush());
        self.reset();
        written.map_err(|err| {
            TraceError::SelectionFailed(format!("failed to send selection to backend: {err}"))
        })?;

        info!(
            index = choice.option.offered_index,
            address = %choice.option.address,
            source = ?choice.source,
            "address selected"
        );
        Ok(choice)
    }

    fn await_chooser(
        &self,
        chooser: Arc<dyn AddressChooser>,
        options: &[SelectionOption],
    ) -> Result<Choice, TraceError> {
        let (tx, rx) = mpsc::channel();
        let offered = options.to_vec();
        thread::Builder::new()
            .name("hoptrace-chooser".to_string())
            .spawn(move || {
                let _ = tx.send(chooser.choose(&offered));
            })
            .map_err(|err| TraceError::SelectionFailed(format!("failed to start chooser: {err}")))?;

        let started = self.clock.now();
        loop {
            match rx.try_recv() {
                Ok(Ok(Some(index))) => {
                    return options
                        .iter()
                        .find(|option| option.offered_index == index)
                        .cloned()
                        .map(|option| Choice {
                            option,
                            source: ChoiceSource::Chooser,
                        })
                        .ok_or_else(|| {
                            TraceError::SelectionFailed(format!(
                                "chooser picked index {index}, which was not offered"
                            ))
                        });
                }
                Ok(Ok(None)) => {
                    return Err(TraceError::SelectionFailed(
                        "selection cancelled by chooser".to_string(),
                    ))
                }
                Ok(Err(err)) => {
                    return Err(TraceError::SelectionFailed(format!("chooser failed: {err:#}")))
                }
                Err(TryRecvError::Disconnected) => {
                    return Err(TraceError::SelectionFailed(
                        "chooser stopped without answering".to_string(),
                    ))
                }
                Err(TryRecvError::Empty) => {}
            }

            let elapsed = self.clock.now().saturating_sub(started);
            if elapsed >= self.config.timeout {
                warn!(timeout = ?self.config.timeout, "chooser timed out; selecting automatically");
                return automatic_choice(options)
                    .cloned()
                    .map(|option| Choice {
                        option,
                        source: ChoiceSource::TimeoutFallback,
                    })
                    .ok_or_else(|| {
                        TraceError::SelectionFailed("no options to choose from".to_string())
                    });
            }
            let remaining = self.config.timeout - elapsed;
            self.clock.sleep(remaining.min(self.config.poll_interval));
        }
    }
}
