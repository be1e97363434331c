use crate::accumulate::HopAccumulator;
use crate::backend::BackendDescriptor;
use crate::classify::{classify_line, LineEvent, ParseState};
use crate::enrich::GeoEnricher;
use crate::error::TraceError;
use crate::finalize::ResultFinalizer;
use crate::select::{Choice, ControllerStep, SelectionController};
use hoptrace_model::HopRecord;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info};

pub type HopCallback = Arc<dyn Fn(&HopRecord) + Send + Sync>;

/// Where closed hops go: optional enrichment, then the finalizer, then the
/// caller's callback.
#[derive(Clone, Default)]
pub(crate) struct HopSink {
    pub(crate) enricher: Option<GeoEnricher>,
    pub(crate) on_hop: Option<HopCallback>,
}

impl HopSink {
    fn emit(&self, hop: &HopRecord, finalizer: &mut ResultFinalizer) {
        let mut hop = hop.clone();
        if let Some(enricher) = &self.enricher {
            enricher.enrich(&mut hop);
        }
        finalizer.record(&hop);
        if let Some(on_hop) = &self.on_hop {
            on_hop(&hop);
        }
    }
}

/// Classifier, selection controller and accumulator wired together for one
/// stream of lines.
pub(crate) struct LinePipeline {
    descriptor: &'static BackendDescriptor,
    accumulator: HopAccumulator,
    controller: SelectionController,
    finalizer: ResultFinalizer,
    sink: HopSink,
    selections: Vec<Choice>,
}

impl LinePipeline {
    pub(crate) fn new(
        descriptor: &'static BackendDescriptor,
        controller: SelectionController,
        finalizer: ResultFinalizer,
        sink: HopSink,
    ) -> Self {
        Self {
            descriptor,
            accumulator: HopAccumulator::new(),
            controller,
            finalizer,
            sink,
            selections: Vec::new(),
        }
    }

    pub(crate) fn feed<W>(&mut self, line: &str, input: &mut W) -> Result<(), TraceError>
    where
        W: Write + ?Sized,
    {
        let state = ParseState {
            collecting_options: self.controller.is_collecting(),
            hop_context: self.accumulator.has_hop_context(),
        };
        let event = classify_line(line, self.descriptor, state);
        debug!(kind = event.kind(), line, "classified line");

        match self.controller.observe(&event, input)? {
            ControllerStep::PassThrough => self.route(&event),
            ControllerStep::Consumed => {}
            ControllerStep::Resolved { choice, replay } => {
                self.selections.push(choice);
                if replay {
                    self.route(&event);
                }
            }
        }
        Ok(())
    }

    /// Lets a prompt that went quiet resolve between lines.
    pub(crate) fn tick<W>(&mut self, input: &mut W) -> Result<(), TraceError>
    where
        W: Write + ?Sized,
    {
        if let Some(choice) = self.controller.tick(input)? {
            self.selections.push(choice);
        }
        Ok(())
    }

    /// End of input: drops an unfinished prompt and flushes the open hop.
    pub(crate) fn finish(&mut self) {
        self.controller.abandon();
        let Self {
            accumulator,
            finalizer,
            sink,
            ..
        } = self;
        accumulator.finish(&mut |hop: &HopRecord| sink.emit(hop, finalizer));
    }

    pub(crate) fn finalizer(&self) -> &ResultFinalizer {
        &self.finalizer
    }

    pub(crate) fn into_parts(self) -> (ResultFinalizer, Vec<Choice>) {
        (self.finalizer, self.selections)
    }

    fn route(&mut self, event: &LineEvent) {
        let Self {
            accumulator,
            finalizer,
            sink,
            ..
        } = self;
        match event {
            LineEvent::SentinelUrl { value } => {
                info!(artifact = %value, "backend reported artifact");
                finalizer.set_artifact(value.clone());
            }
            LineEvent::NewHopHeader(_)
            | LineEvent::DelayContinuation(_)
            | LineEvent::GeoContinuation { .. } => {
                accumulator.apply(event, &mut |hop: &HopRecord| sink.emit(hop, finalizer));
            }
            _ => {}
        }
    }
}
