//! Offline parsing of captured backend output.

use crate::backend::Dialect;
use crate::error::TraceError;
use crate::finalize::ResultFinalizer;
use crate::pipeline::{HopSink, LinePipeline};
use crate::select::{Choice, SelectionConfig, SelectionController, SystemClock};
use hoptrace_model::{HopRecord, SessionStatus};
use std::io;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTranscript {
    /// Target named in the banner, if the backend printed one.
    pub target: Option<String>,
    pub hops: Vec<HopRecord>,
    pub artifact: Option<String>,
    /// Automatic choices made for any prompts found in the text.
    pub selections: Vec<Choice>,
}

/// Runs a full transcript through the same pipeline a live session uses.
/// Prompts are answered automatically and the answers discarded.
pub fn parse_transcript(text: &str, dialect: Dialect) -> Result<ParsedTranscript, TraceError> {
    let descriptor = dialect.descriptor();
    let controller = SelectionController::new(
        SelectionConfig::default(),
        None,
        Arc::new(SystemClock::new()),
    );
    let mut pipeline = LinePipeline::new(
        descriptor,
        controller,
        ResultFinalizer::new(String::new(), descriptor.name),
        HopSink::default(),
    );

    let mut target = None;
    let mut sink = io::sink();
    for line in text.lines() {
        if target.is_none() {
            target = parse_target(line);
        }
        pipeline.feed(line, &mut sink)?;
    }
    pipeline.finish();

    let (finalizer, selections) = pipeline.into_parts();
    let outcome = finalizer.finish(SessionStatus::Completed, None);
    Ok(ParsedTranscript {
        target,
        hops: outcome.hops,
        artifact: outcome.artifact,
        selections,
    })
}

/// Like [`parse_transcript`] for raw captured bytes, decoded line by line
/// the way a live session decodes them.
pub fn parse_transcript_bytes(
    bytes: &[u8],
    dialect: Dialect,
) -> Result<ParsedTranscript, TraceError> {
    let descriptor = dialect.descriptor();
    let text = bytes
        .split(|byte| *byte == b'\n')
        .map(|line| descriptor.decode_output(line))
        .collect::<Vec<_>>()
        .join("\n");
    parse_transcript(&text, dialect)
}

/// Reads the target from banners such as `traceroute to example.com (93.184.216.34), 30 hops max`,
/// `Tracing route to example.com [93.184.216.34]` or the zh-CN `到 example.com [93.184.216.34] 的路由:`.
fn parse_target(line: &str) -> Option<String> {
    let trimmed = line.trim();
    let lower = trimmed.to_ascii_lowercase();
    let rest = ["traceroute to ", "tracing route to "]
        .iter()
        .find_map(|prefix| lower.strip_prefix(prefix).map(|_| &trimmed[prefix.len()..]))
        .or_else(|| {
            trimmed
                .strip_prefix("到 ")
                .filter(|_| trimmed.contains("的路由"))
        })?;
    let token = rest
        .split(|c: char| c.is_whitespace() || c == ',')
        .next()?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
