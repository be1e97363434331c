//! Static descriptions of the supported trace backends.
//!
//! Everything that differs between backends lives in a [`BackendDescriptor`]:
//! how to build the argument vector, which unit the per-probe timeout uses,
//! and the fixed strings the classifier keys on. Adding a backend means adding
//! a descriptor here, not another parsing loop.

use crate::error::TraceError;
use encoding_rs::Encoding;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// The platform's own `tracert` / `traceroute`.
    #[default]
    Native,
    /// `nexttrace`, which prints geo and AS data and may prompt for an address.
    Rich,
}

impl BackendKind {
    /// Dialect this backend speaks on the host OS.
    pub fn host_dialect(self) -> Dialect {
        match self {
            BackendKind::Rich => Dialect::RichBackend,
            BackendKind::Native if cfg!(windows) => Dialect::NativeWindows,
            BackendKind::Native => Dialect::NativeUnix,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Native => "native",
            BackendKind::Rich => "rich",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = TraceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "native" | "system" | "traceroute" | "tracert" => Ok(BackendKind::Native),
            "rich" | "nexttrace" => Ok(BackendKind::Rich),
            other => Err(TraceError::InvalidRequest(format!(
                "unknown backend: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    NativeWindows,
    NativeUnix,
    RichBackend,
}

impl Dialect {
    pub fn descriptor(self) -> &'static BackendDescriptor {
        match self {
            Dialect::NativeWindows => &NATIVE_WINDOWS,
            Dialect::NativeUnix => &NATIVE_UNIX,
            Dialect::RichBackend => &RICH_BACKEND,
        }
    }

    pub fn is_native(self) -> bool {
        !matches!(self, Dialect::RichBackend)
    }
}

impl FromStr for Dialect {
    type Err = TraceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "windows" | "tracert" => Ok(Dialect::NativeWindows),
            "unix" | "traceroute" => Ok(Dialect::NativeUnix),
            "rich" | "nexttrace" => Ok(Dialect::RichBackend),
            other => Err(TraceError::InvalidRequest(format!(
                "unknown dialect: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutUnit {
    Millis,
    Seconds,
}

#[derive(Debug)]
pub struct BackendDescriptor {
    pub name: &'static str,
    pub program: &'static str,
    pub dialect: Dialect,
    pub timeout_unit: TimeoutUnit,
    /// Streams hops as lines arrive; otherwise output is buffered until exit.
    pub realtime: bool,
    /// Marker of the multi-address disambiguation prompt, if the backend has one.
    pub prompt_marker: Option<&'static str>,
    /// Text that closes the option list. The backend prints it without a
    /// newline and then blocks on stdin.
    pub option_list_end: Option<&'static str>,
    /// Prefix of the once-per-run side-channel line (e.g. a map URL).
    pub artifact_prefix: Option<&'static str>,
    pub noise_prefixes: &'static [&'static str],
    pub noise_fragments: &'static [&'static str],
    /// Tokens that mark a line as carrying place names.
    pub geo_lexicon: &'static [&'static str],
    pub delay_units: &'static [&'static str],
    /// WHATWG label of the code page used when output is not UTF-8.
    pub legacy_encoding: Option<&'static str>,
    pub version_flag: Option<&'static str>,
}

const DELAY_UNITS: &[&str] = &["ms", "毫秒"];

pub static NATIVE_WINDOWS: BackendDescriptor = BackendDescriptor {
    name: "tracert",
    program: "tracert",
    dialect: Dialect::NativeWindows,
    timeout_unit: TimeoutUnit::Millis,
    realtime: true,
    prompt_marker: None,
    option_list_end: None,
    artifact_prefix: None,
    noise_prefixes: &[
        "Tracing route to",
        "over a maximum of",
        "Trace complete",
        "通过最多",
        "跟踪完成",
    ],
    noise_fragments: &["的路由", "Unable to resolve"],
    geo_lexicon: &[],
    delay_units: DELAY_UNITS,
    legacy_encoding: Some("gbk"),
    version_flag: None,
};

pub static NATIVE_UNIX: BackendDescriptor = BackendDescriptor {
    name: "traceroute",
    program: "traceroute",
    dialect: Dialect::NativeUnix,
    timeout_unit: TimeoutUnit::Seconds,
    realtime: false,
    prompt_marker: None,
    option_list_end: None,
    artifact_prefix: None,
    noise_prefixes: &["traceroute to", "traceroute6 to", "traceroute:"],
    noise_fragments: &["hops max"],
    geo_lexicon: &[],
    delay_units: DELAY_UNITS,
    legacy_encoding: None,
    version_flag: None,
};

pub static RICH_BACKEND: BackendDescriptor = BackendDescriptor {
    name: "nexttrace",
    program: "nexttrace",
    dialect: Dialect::RichBackend,
    timeout_unit: TimeoutUnit::Millis,
    realtime: true,
    prompt_marker: Some("Please Choose the IP You Want To TraceRoute"),
    option_list_end: Some("Your Option:"),
    artifact_prefix: Some("MapTrace URL:"),
    noise_prefixes: &["NextTrace", "traceroute to", "IP Geo Data Provider"],
    noise_fragments: &[
        "NextTrace API",
        "Sponsored by",
        "Copyright",
        "Founder",
        "Developer",
        "Usage:",
        "Flags:",
        "Examples:",
        "Output trace results as",
        "Start from the first_ttl hop",
        "Disable Print Trace Map",
        "Disable MPLS",
        "Print version info and exit",
        "Use source address",
        "Use the following Network Devices",
        "Set how many [milliseconds]",
        "The number of [milliseconds]",
        "Set the payload size",
        "Choose the language",
        "Read IP Address",
        "Disable Colorful Output",
    ],
    geo_lexicon: &[
        "中国",
        "美国",
        "新加坡",
        "日本",
        "韩国",
        "香港",
        "台湾",
        "China",
        "United States",
        "Singapore",
        "Japan",
        "Korea",
        "Hong Kong",
        "Taiwan",
        "Germany",
        "United Kingdom",
        "Netherlands",
        "France",
    ],
    delay_units: DELAY_UNITS,
    legacy_encoding: None,
    version_flag: Some("-V"),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeProtocol {
    #[default]
    Icmp,
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReverseDns {
    #[default]
    Default,
    Never,
    Always,
}

/// Knobs only the rich backend understands.
#[derive(Debug, Clone)]
pub struct RichOptions {
    pub queries: u32,
    pub parallel_requests: u32,
    pub lang: String,
    pub fast_trace: bool,
    pub protocol: ProbeProtocol,
    pub port: Option<u16>,
    pub reverse_dns: ReverseDns,
    pub data_provider: Option<String>,
    pub disable_map: bool,
}

impl Default for RichOptions {
    fn default() -> Self {
        Self {
            queries: 3,
            parallel_requests: 18,
            lang: "en".to_string(),
            fast_trace: false,
            protocol: ProbeProtocol::Icmp,
            port: None,
            reverse_dns: ReverseDns::Default,
            data_provider: None,
            disable_map: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraceRequest {
    pub target: String,
    pub max_hops: u32,
    pub probe_timeout: Duration,
    pub backend: BackendKind,
    pub rich: RichOptions,
    /// Explicit executable path; defaults to the descriptor's program name.
    pub program: Option<PathBuf>,
}

impl Default for TraceRequest {
    fn default() -> Self {
        Self {
            target: String::new(),
            max_hops: 30,
            probe_timeout: Duration::from_millis(2000),
            backend: BackendKind::Native,
            rich: RichOptions::default(),
            program: None,
        }
    }
}

impl TraceRequest {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), TraceError> {
        let target = self.target.trim();
        if target.is_empty() {
            return Err(TraceError::InvalidRequest("target is empty".to_string()));
        }
        if target.starts_with('-') || target.chars().any(char::is_whitespace) {
            return Err(TraceError::InvalidRequest(format!(
                "target is not a host name or address: {target}"
            )));
        }
        if self.max_hops == 0 || self.max_hops > 255 {
            return Err(TraceError::InvalidRequest(format!(
                "max hops must be within 1..=255, got {}",
                self.max_hops
            )));
        }
        Ok(())
    }

    /// Wall-clock budget for the whole session.
    pub fn overall_budget(&self, grace: Duration) -> Duration {
        self.probe_timeout
            .saturating_mul(self.max_hops)
            .saturating_add(grace)
    }

    pub fn dialect(&self) -> Dialect {
        self.backend.host_dialect()
    }

    pub fn descriptor(&self) -> &'static BackendDescriptor {
        self.dialect().descriptor()
    }
}

/// A fully resolved command line for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub dialect: Dialect,
    pub realtime: bool,
}

impl BackendDescriptor {
    pub fn invocation(&self, request: &TraceRequest) -> Invocation {
        let target = request.target.trim().to_string();
        let max_hops = request.max_hops.to_string();
        let timeout = self.timeout_arg(request.probe_timeout);

        let args = match self.dialect {
            Dialect::NativeWindows => vec![
                "-d".to_string(),
                "-w".to_string(),
                timeout,
                "-h".to_string(),
                max_hops,
                target,
            ],
            Dialect::NativeUnix => vec![
                "-m".to_string(),
                max_hops,
                "-w".to_string(),
                timeout,
                "-q".to_string(),
                "1".to_string(),
                target,
            ],
            Dialect::RichBackend => rich_args(target, max_hops, timeout, &request.rich),
        };

        Invocation {
            program: request
                .program
                .clone()
                .unwrap_or_else(|| PathBuf::from(self.program)),
            args,
            dialect: self.dialect,
            realtime: self.realtime,
        }
    }

    fn timeout_arg(&self, timeout: Duration) -> String {
        match self.timeout_unit {
            TimeoutUnit::Millis => {
                let millis = timeout.as_millis().clamp(1, 65_535);
                millis.to_string()
            }
            TimeoutUnit::Seconds => {
                let millis = timeout.as_millis() as u64;
                ((millis + 999) / 1000).max(1).to_string()
            }
        }
    }

    pub fn is_interactive(&self) -> bool {
        self.prompt_marker.is_some()
    }

    /// Decodes raw output. Bytes that are not valid UTF-8 are read in the
    /// legacy code page when one is set (zh-CN `tracert` prints GBK).
    pub fn decode_output(&self, bytes: &[u8]) -> String {
        if let Ok(text) = std::str::from_utf8(bytes) {
            return text.to_string();
        }
        match self
            .legacy_encoding
            .and_then(|label| Encoding::for_label(label.as_bytes()))
        {
            Some(encoding) => encoding.decode_without_bom_handling(bytes).0.into_owned(),
            None => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    /// File name of the executable on this host.
    pub fn executable_name(&self) -> String {
        format!("{}{}", self.program, std::env::consts::EXE_SUFFIX)
    }
}

fn rich_args(target: String, max_hops: String, timeout: String, rich: &RichOptions) -> Vec<String> {
    let mut args = vec![
        target,
        "-m".to_string(),
        max_hops,
        "--timeout".to_string(),
        timeout,
        "-C".to_string(),
        "-g".to_string(),
        rich.lang.clone(),
        "-q".to_string(),
        rich.queries.to_string(),
        "--parallel-requests".to_string(),
        rich.parallel_requests.to_string(),
    ];

    if rich.fast_trace {
        args.push("-F".to_string());
    }

    let protocol_flag = match rich.protocol {
        ProbeProtocol::Icmp => None,
        ProbeProtocol::Tcp => Some("-T"),
        ProbeProtocol::Udp => Some("-U"),
    };
    if let Some(flag) = protocol_flag {
        args.push(flag.to_string());
        if let Some(port) = rich.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
    }

    match rich.reverse_dns {
        ReverseDns::Default => {}
        ReverseDns::Never => args.push("-n".to_string()),
        ReverseDns::Always => args.push("-a".to_string()),
    }

    if let Some(provider) = &rich.data_provider {
        args.push("-d".to_string());
        args.push(provider.clone());
    }

    if rich.disable_map {
        args.push("-M".to_string());
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(target: &str) -> TraceRequest {
        TraceRequest {
            max_hops: 20,
            probe_timeout: Duration::from_millis(1500),
            ..TraceRequest::new(target)
        }
    }

    #[test]
    fn windows_invocation_uses_milliseconds() {
        let invocation = NATIVE_WINDOWS.invocation(&request("example.com"));
        assert_eq!(invocation.program, PathBuf::from("tracert"));
        assert_eq!(
            invocation.args,
            vec!["-d", "-w", "1500", "-h", "20", "example.com"]
        );
        assert!(invocation.realtime);
    }

    #[test]
    fn unix_invocation_rounds_timeout_up_to_seconds() {
        let invocation = NATIVE_UNIX.invocation(&request("example.com"));
        assert_eq!(
            invocation.args,
            vec!["-m", "20", "-w", "2", "-q", "1", "example.com"]
        );
        assert!(!invocation.realtime);
    }

    #[test]
    fn rich_invocation_carries_optional_flags() {
        let mut req = request("example.com");
        req.backend = BackendKind::Rich;
        req.rich.protocol = ProbeProtocol::Tcp;
        req.rich.port = Some(443);
        req.rich.reverse_dns = ReverseDns::Never;
        req.rich.disable_map = true;
        req.program = Some(PathBuf::from("/opt/tools/nexttrace"));

        let invocation = req.descriptor().invocation(&req);
        assert_eq!(invocation.program, PathBuf::from("/opt/tools/nexttrace"));
        assert_eq!(invocation.dialect, Dialect::RichBackend);
        assert_eq!(&invocation.args[..5], &["example.com", "-m", "20", "--timeout", "1500"]);
        assert!(invocation.args.windows(2).any(|w| w == ["-p", "443"]));
        assert!(invocation.args.contains(&"-T".to_string()));
        assert!(invocation.args.contains(&"-n".to_string()));
        assert!(invocation.args.contains(&"-M".to_string()));
    }

    #[test]
    fn validate_rejects_flag_like_targets() {
        assert!(request("-m").validate().is_err());
        assert!(request("").validate().is_err());
        assert!(request("example.com").validate().is_ok());

        let mut req = request("example.com");
        req.max_hops = 0;
        assert!(req.validate().is_err());
    }

    #[test]
    fn gbk_delay_units_survive_decoding() {
        use crate::classify::{classify_line, LineEvent, ParseState};

        let (bytes, _, _) =
            encoding_rs::GBK.encode("  1    <1 毫秒    <1 毫秒    <1 毫秒 192.168.1.1");
        assert!(std::str::from_utf8(&bytes).is_err());

        let line = NATIVE_WINDOWS.decode_output(&bytes);
        assert!(line.contains("毫秒"));
        match classify_line(&line, &NATIVE_WINDOWS, ParseState::default()) {
            LineEvent::NewHopHeader(header) => {
                assert_eq!(header.address, "192.168.1.1");
                assert_eq!(header.delays.resolve(), Some(1.0));
            }
            other => panic!("expected hop header, got {other:?}"),
        }
    }

    #[test]
    fn utf8_output_is_left_alone() {
        assert_eq!(NATIVE_UNIX.decode_output("1.20 ms".as_bytes()), "1.20 ms");
        assert_eq!(
            RICH_BACKEND.decode_output("中国 江苏 南京".as_bytes()),
            "中国 江苏 南京"
        );
        // No legacy code page: invalid bytes become replacement characters.
        assert_eq!(NATIVE_UNIX.decode_output(&[0xff, b'a']), "\u{fffd}a");
    }

    #[test]
    fn budget_scales_with_hops() {
        let req = request("example.com");
        assert_eq!(
            req.overall_budget(Duration::from_secs(30)),
            Duration::from_secs(60)
        );
    }
}
