//! Supervised traceroute sessions: launching the backend, parsing its output
//! into hops and answering its address prompt.

pub mod accumulate;
pub mod backend;
pub mod classify;
pub mod enrich;
pub mod error;
pub mod finalize;
pub mod locate;
mod pipeline;
pub mod process;
pub mod select;
pub mod session;
pub mod transcript;

pub use accumulate::HopAccumulator;
pub use backend::{
    BackendDescriptor, BackendKind, Dialect, Invocation, ProbeProtocol, ReverseDns, RichOptions,
    TraceRequest, NATIVE_UNIX, NATIVE_WINDOWS, RICH_BACKEND,
};
pub use classify::{classify_line, DelaySamples, HopHeader, LineEvent, ParseState};
pub use enrich::{GeoCache, GeoEnricher, GeoInfo, GeoLookup, PrivateRangeLookup};
pub use error::TraceError;
pub use finalize::ResultFinalizer;
pub use locate::{backend_version, is_available, locate_backend, BackendLocator};
pub use pipeline::HopCallback;
pub use process::{BackendLauncher, ProcessControl, SpawnedBackend, SystemLauncher};
pub use select::{
    automatic_choice, AddressChooser, Choice, ChoiceSource, Clock, ControllerStep, ManualClock,
    SelectionConfig, SelectionController, SelectionState, SystemClock,
};
pub use session::{
    hop_channel, run_trace, SessionCanceller, SessionHandle, TraceContext, TraceSession,
};
pub use transcript::{parse_transcript, parse_transcript_bytes, ParsedTranscript};
