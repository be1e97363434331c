use crate::classify::{HopHeader, LineEvent};
use hoptrace_model::{HopRecord, TIMED_OUT_DELAY_MS};
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Clone)]
struct OpenHop {
    record: HopRecord,
    delay_pending: bool,
}

/// Folds classified lines into hop records.
///
/// One instance per session. Hops are handed to the `emit` sink as soon as
/// they close; the most recently closed hop may be emitted once more if a
/// late continuation adds geo data to it.
#[derive(Debug, Default)]
pub struct HopAccumulator {
    open: Option<OpenHop>,
    last_closed: Option<HopRecord>,
    closed: BTreeSet<u32>,
}

impl HopAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_open_hop(&self) -> bool {
        self.open.is_some()
    }

    /// True when a continuation line has a hop to attach to.
    pub fn has_hop_context(&self) -> bool {
        self.open.is_some() || self.last_closed.is_some()
    }

    pub fn is_closed(&self, hop_number: u32) -> bool {
        self.closed.contains(&hop_number)
    }

    pub fn closed_hops(&self) -> impl Iterator<Item = u32> + '_ {
        self.closed.iter().copied()
    }

    /// Applies one event. Events that do not concern hops are ignored.
    pub fn apply<F>(&mut self, event: &LineEvent, emit: &mut F)
    where
        F: FnMut(&HopRecord),
    {
        match event {
            LineEvent::NewHopHeader(header) => self.on_header(header, emit),
            LineEvent::DelayContinuation(samples) => {
                let Some(open) = self.open.as_mut() else {
                    debug!("delay continuation without an open hop; ignored");
                    return;
                };
                if !open.delay_pending {
                    return;
                }
                if let Some(delay) = samples.resolve() {
                    open.record.delay_ms = delay;
                    open.delay_pending = false;
                    self.close_open(emit);
                }
            }
            LineEvent::GeoContinuation { tokens } => {
                if let Some(open) = self.open.as_mut() {
                    open.record.geo.fill_unknown(tokens);
                } else if let Some(last) = self.last_closed.as_mut() {
                    if last.geo.fill_unknown(tokens) {
                        debug!(hop = last.hop_number, "late geo correction");
                        emit(last);
                    }
                }
            }
            _ => {}
        }
    }

    /// Closes whatever is still open at end of stream.
    pub fn finish<F>(&mut self, emit: &mut F)
    where
        F: FnMut(&HopRecord),
    {
        self.close_open(emit);
    }

    fn on_header<F>(&mut self, header: &HopHeader, emit: &mut F)
    where
        F: FnMut(&HopRecord),
    {
        if let Some(open) = self.open.as_mut() {
            if open.record.hop_number == header.hop_number {
                // Re-report of the hop still being assembled.
                merge_header(&mut open.record, header);
                if open.delay_pending {
                    if let Some(delay) = inline_delay(header) {
                        open.record.delay_ms = delay;
                        open.delay_pending = false;
                        self.close_open(emit);
                    }
                }
                return;
            }
            self.close_open(emit);
        }

        if self.closed.contains(&header.hop_number) {
            if let Some(last) = self.last_closed.as_mut() {
                if last.hop_number == header.hop_number && merge_header(last, header) {
                    debug!(hop = last.hop_number, "re-reported hop adds fields");
                    emit(last);
                    return;
                }
            }
            debug!(hop = header.hop_number, "hop already closed; ignored");
            return;
        }

        let mut record = HopRecord::new(header.hop_number, header.address.clone());
        record.network_owner = header.network_owner.clone();
        record.geo.fill_unknown(&header.geo_tokens);

        if header.timed_out {
            record.delay_ms = TIMED_OUT_DELAY_MS;
            self.open = Some(OpenHop {
                record,
                delay_pending: false,
            });
            self.close_open(emit);
            return;
        }

        match inline_delay(header) {
            Some(delay) => {
                record.delay_ms = delay;
                self.open = Some(OpenHop {
                    record,
                    delay_pending: false,
                });
                self.close_open(emit);
            }
            None => {
                self.open = Some(OpenHop {
                    record,
                    delay_pending: true,
                });
            }
        }
    }

    fn close_open<F>(&mut self, emit: &mut F)
    where
        F: FnMut(&HopRecord),
    {
        if let Some(open) = self.open.take() {
            self.closed.insert(open.record.hop_number);
            emit(&open.record);
            self.last_closed = Some(open.record);
        }
    }
}

/// Delay carried on the header line itself. A lone `*` after the address is
/// a placeholder on some dialects, so only real samples count here.
fn inline_delay(header: &HopHeader) -> Option<f64> {
    if header.delays.values.is_empty() {
        None
    } else {
        header.delays.resolve()
    }
}

/// Fills fields of `record` that a repeated header knows better. Returns
/// true if anything changed.
fn merge_header(record: &mut HopRecord, header: &HopHeader) -> bool {
    let mut changed = record.geo.fill_unknown(&header.geo_tokens);
    if record.network_owner.is_none() && header.network_owner.is_some() {
        record.network_owner = header.network_owner.clone();
        changed = true;
    }
    if !record.has_reply() && !header.timed_out && header.address != record.address {
        record.address = header.address.clone();
        changed = true;
    }
    changed
}
