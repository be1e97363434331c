use crate::backend::{BackendDescriptor, Dialect};
use hoptrace_model::{AddressFamily, GeoField, SelectionOption, NO_REPLY_ADDRESS};
use std::net::IpAddr;

/// Parser context the classifier needs from its callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseState {
    /// A disambiguation prompt is buffering options.
    pub collecting_options: bool,
    /// A hop is open, or one was just closed and may still take corrections.
    pub hop_context: bool,
}

/// Probe delays found on one line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DelaySamples {
    pub values: Vec<f64>,
    /// Probes reported as `*`.
    pub timeouts: usize,
}

impl DelaySamples {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.timeouts == 0
    }

    /// Mean of the positive samples. A line of only zero-valued samples
    /// resolves to 0 and a line of only lost probes to -1.
    pub fn resolve(&self) -> Option<f64> {
        let positive: Vec<f64> = self.values.iter().copied().filter(|v| *v > 0.0).collect();
        if !positive.is_empty() {
            return Some(positive.iter().sum::<f64>() / positive.len() as f64);
        }
        if !self.values.is_empty() {
            return Some(0.0);
        }
        if self.timeouts > 0 {
            return Some(hoptrace_model::TIMED_OUT_DELAY_MS);
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HopHeader {
    pub hop_number: u32,
    pub address: String,
    pub delays: DelaySamples,
    pub network_owner: Option<String>,
    pub geo_tokens: Vec<String>,
    /// The reply token was `*` and nothing else on the line answered.
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    SelectionPromptStart,
    SelectionOption(SelectionOption),
    /// The backend finished listing options and waits for an answer.
    SelectionListEnd,
    SentinelUrl { value: String },
    NewHopHeader(HopHeader),
    DelayContinuation(DelaySamples),
    GeoContinuation { tokens: Vec<String> },
    Noise,
}

impl LineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LineEvent::SelectionPromptStart => "selection_prompt",
            LineEvent::SelectionOption(_) => "selection_option",
            LineEvent::SelectionListEnd => "selection_list_end",
            LineEvent::SentinelUrl { .. } => "sentinel_url",
            LineEvent::NewHopHeader(_) => "hop_header",
            LineEvent::DelayContinuation(_) => "delay",
            LineEvent::GeoContinuation { .. } => "geo",
            LineEvent::Noise => "noise",
        }
    }
}

/// Maps one output line to an event. Pure apart from `state`.
pub fn classify_line(line: &str, descriptor: &BackendDescriptor, state: ParseState) -> LineEvent {
    let line = line.trim();
    if line.is_empty() {
        return LineEvent::Noise;
    }

    if let Some(marker) = descriptor.prompt_marker {
        if line.contains(marker) {
            return LineEvent::SelectionPromptStart;
        }
    }

    if state.collecting_options {
        if let Some(marker) = descriptor.option_list_end {
            if line.contains(marker) {
                return LineEvent::SelectionListEnd;
            }
        }
        if let Some(option) = parse_selection_option(line) {
            return LineEvent::SelectionOption(option);
        }
    }

    if let Some(prefix) = descriptor.artifact_prefix {
        if let Some(rest) = line.strip_prefix(prefix) {
            let value = rest.trim();
            if !value.is_empty() {
                return LineEvent::SentinelUrl {
                    value: value.to_string(),
                };
            }
            return LineEvent::Noise;
        }
    }

    if is_boilerplate(line, descriptor) {
        return LineEvent::Noise;
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();
    if let Some(header) = parse_hop_header(&tokens, descriptor) {
        return LineEvent::NewHopHeader(header);
    }

    if state.hop_context {
        if has_delay_unit(&tokens, descriptor) {
            return LineEvent::DelayContinuation(parse_delay_samples(&tokens, descriptor));
        }
        if descriptor
            .geo_lexicon
            .iter()
            .any(|word| line.contains(word))
        {
            let tokens = geo_tokens(&tokens, descriptor, true);
            if !tokens.is_empty() {
                return LineEvent::GeoContinuation { tokens };
            }
        }
    }

    LineEvent::Noise
}

fn is_boilerplate(line: &str, descriptor: &BackendDescriptor) -> bool {
    descriptor
        .noise_prefixes
        .iter()
        .any(|prefix| line.starts_with(prefix))
        || descriptor
            .noise_fragments
            .iter()
            .any(|fragment| line.contains(fragment))
}

/// `"0. 180.101.51.73"` or `"1) 2400:da00::6666 (IPv6) Beijing"`.
pub fn parse_selection_option(line: &str) -> Option<SelectionOption> {
    let digits_len = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits_len == 0 || digits_len > 2 {
        return None;
    }
    let (digits, rest) = line.split_at(digits_len);
    let rest = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')'))?;
    let offered_index: u32 = digits.parse().ok()?;

    let mut parts = rest.split_whitespace();
    let raw_address = parts.next()?;
    let ip = parse_ip(raw_address)?;
    let family = match ip {
        IpAddr::V4(_) => AddressFamily::V4,
        IpAddr::V6(_) => AddressFamily::V6,
    };

    let hint: Vec<&str> = parts
        .filter(|part| {
            let bare = part.trim_matches(|c| c == '(' || c == ')');
            !bare.eq_ignore_ascii_case("ipv4") && !bare.eq_ignore_ascii_case("ipv6")
        })
        .collect();

    Some(SelectionOption {
        offered_index,
        address: ip.to_string(),
        family,
        geo_hint: GeoField::from(hint.join(" ")),
    })
}

fn parse_hop_header(tokens: &[&str], descriptor: &BackendDescriptor) -> Option<HopHeader> {
    let first = *tokens.first()?;
    if !first.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hop_number: u32 = first.parse().ok()?;
    if hop_number == 0 {
        return None;
    }
    // "12 ms" on its own line is a delay, not hop 12.
    if let Some(next) = tokens.get(1) {
        if is_delay_unit(next, descriptor) {
            return None;
        }
    }

    let rest = &tokens[1..];
    let delays = parse_delay_samples(rest, descriptor);
    let reply_is_star = rest.first().map(|tok| *tok == "*").unwrap_or(false);
    let timed_out = reply_is_star && delays.values.is_empty();

    let (address, network_owner, geo) = match descriptor.dialect {
        Dialect::RichBackend => {
            let address = rest
                .first()
                .map(|tok| strip_brackets(tok).to_string())
                .unwrap_or_else(|| NO_REPLY_ADDRESS.to_string());
            let owner = rest
                .iter()
                .skip(1)
                .find(|tok| is_as_token(tok))
                .map(|tok| tok.to_string());
            let geo = if timed_out || rest.len() < 2 {
                Vec::new()
            } else {
                geo_tokens(&rest[1..], descriptor, false)
            };
            (address, owner, geo)
        }
        Dialect::NativeWindows | Dialect::NativeUnix => {
            (native_address(rest, descriptor), None, Vec::new())
        }
    };

    Some(HopHeader {
        hop_number,
        address: if timed_out {
            NO_REPLY_ADDRESS.to_string()
        } else {
            address
        },
        delays,
        network_owner,
        geo_tokens: geo,
        timed_out,
    })
}

fn native_address(tokens: &[&str], descriptor: &BackendDescriptor) -> String {
    if let Some(ip) = tokens.iter().find_map(|tok| parse_ip(tok)) {
        return ip.to_string();
    }
    // Unresolved host name with no numeric address alongside it.
    tokens
        .iter()
        .enumerate()
        .find(|(idx, tok)| {
            **tok != "*"
                && !is_delay_unit(tok, descriptor)
                && parse_delay_token(tok, tokens.get(idx + 1).copied(), descriptor).is_none()
                && tok.contains('.')
        })
        .map(|(_, tok)| strip_brackets(tok).to_string())
        .unwrap_or_else(|| NO_REPLY_ADDRESS.to_string())
}

/// Collects every probe delay on the line: `12 ms`, `12ms`, `<1 ms`, `*`.
pub fn parse_delay_samples(tokens: &[&str], descriptor: &BackendDescriptor) -> DelaySamples {
    let mut samples = DelaySamples::default();
    let mut i = 0;
    while i < tokens.len() {
        let tok = tokens[i];
        if tok == "*" {
            samples.timeouts += 1;
            i += 1;
            continue;
        }

        let next = tokens.get(i + 1).copied();
        if let Some((value, consumed_next)) = parse_delay_token(tok, next, descriptor) {
            samples.values.push(value);
            i += if consumed_next { 2 } else { 1 };
            continue;
        }

        i += 1;
    }
    samples
}

fn parse_delay_token(
    token: &str,
    next: Option<&str>,
    descriptor: &BackendDescriptor,
) -> Option<(f64, bool)> {
    let token = token.trim_start_matches('<');

    for unit in descriptor.delay_units {
        if let Some(num) = token.strip_suffix(unit) {
            if let Ok(val) = num.parse::<f64>() {
                return Some((val, false));
            }
        }
    }

    if let Ok(val) = token.parse::<f64>() {
        if matches!(next, Some(next_tok) if is_delay_unit(next_tok, descriptor)) {
            return Some((val, true));
        }
    }

    None
}

fn is_delay_unit(token: &str, descriptor: &BackendDescriptor) -> bool {
    descriptor
        .delay_units
        .iter()
        .any(|unit| token == *unit || token.strip_prefix(unit) == Some(","))
}

fn has_delay_unit(tokens: &[&str], descriptor: &BackendDescriptor) -> bool {
    tokens.iter().any(|tok| {
        is_delay_unit(tok, descriptor) || parse_delay_token(tok, None, descriptor).is_some()
    })
}

/// Place-name tokens from a rich-backend line. Header lines skip host names
/// and vendor words; continuation lines keep every non-numeric word.
fn geo_tokens(tokens: &[&str], descriptor: &BackendDescriptor, continuation: bool) -> Vec<String> {
    const SKIP: &[&str] = &["-", "*", "LLC", "Gbps", "/"];

    tokens
        .iter()
        .filter(|tok| !SKIP.contains(tok))
        .filter(|tok| !is_as_token(tok))
        .filter(|tok| !tok.starts_with('['))
        .filter(|tok| {
            !is_delay_unit(tok, descriptor) && parse_delay_token(tok, None, descriptor).is_none()
        })
        .filter(|tok| !tok.replace('.', "").chars().all(|c| c.is_ascii_digit()))
        .filter(|tok| parse_ip(tok).is_none())
        .filter(|tok| {
            let in_lexicon = descriptor.geo_lexicon.iter().any(|word| tok.contains(word));
            if continuation {
                return true;
            }
            if tok.contains('.') && !in_lexicon {
                return false;
            }
            in_lexicon || tok.chars().count() <= 10
        })
        .map(|tok| tok.to_string())
        .collect()
}

fn is_as_token(token: &str) -> bool {
    token
        .strip_prefix("AS")
        .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

fn strip_brackets(token: &str) -> &str {
    token.trim_matches(|c| matches!(c, '(' | ')' | '[' | ']' | ','))
}

fn parse_ip(token: &str) -> Option<IpAddr> {
    strip_brackets(token).parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{NATIVE_UNIX, NATIVE_WINDOWS, RICH_BACKEND};

    const OPEN: ParseState = ParseState {
        collecting_options: false,
        hop_context: true,
    };

    fn header(event: LineEvent) -> HopHeader {
        match event {
            LineEvent::NewHopHeader(header) => header,
            other => panic!("expected hop header, got {other:?}"),
        }
    }

    #[test]
    fn windows_line_averages_probes() {
        let hop = header(classify_line(
            "3  12 ms  11 ms  13 ms  10.0.0.1",
            &NATIVE_WINDOWS,
            ParseState::default(),
        ));
        assert_eq!(hop.hop_number, 3);
        assert_eq!(hop.address, "10.0.0.1");
        assert_eq!(hop.delays.values, vec![12.0, 11.0, 13.0]);
        assert_eq!(hop.delays.resolve(), Some(12.0));
        assert!(!hop.timed_out);
    }

    #[test]
    fn windows_sub_millisecond_and_partial_loss() {
        let hop = header(classify_line(
            "1    <1 ms    <1 ms    <1 ms  192.168.1.1",
            &NATIVE_WINDOWS,
            ParseState::default(),
        ));
        assert_eq!(hop.delays.resolve(), Some(1.0));

        let hop = header(classify_line(
            "5     *       10 ms    11 ms  10.1.1.1",
            &NATIVE_WINDOWS,
            ParseState::default(),
        ));
        assert!(!hop.timed_out);
        assert_eq!(hop.delays.timeouts, 1);
        assert_eq!(hop.delays.resolve(), Some(10.5));
        assert_eq!(hop.address, "10.1.1.1");
    }

    #[test]
    fn star_reply_marks_timeout() {
        let hop = header(classify_line(
            "4     *        *        *     Request timed out.",
            &NATIVE_WINDOWS,
            ParseState::default(),
        ));
        assert!(hop.timed_out);
        assert_eq!(hop.address, "*");
        assert_eq!(hop.delays.resolve(), Some(-1.0));

        let hop = header(classify_line("7  *", &RICH_BACKEND, ParseState::default()));
        assert!(hop.timed_out);
    }

    #[test]
    fn unix_header_with_resolved_name() {
        let hop = header(classify_line(
            " 1  router.lan (192.168.1.1)  1.234 ms",
            &NATIVE_UNIX,
            ParseState::default(),
        ));
        assert_eq!(hop.address, "192.168.1.1");
        assert_eq!(hop.delays.values, vec![1.234]);
    }

    #[test]
    fn rich_header_extracts_owner_and_geo() {
        let hop = header(classify_line(
            "5   202.97.12.1   AS4134   中国 上海 chinatelecom.com.cn",
            &RICH_BACKEND,
            ParseState::default(),
        ));
        assert_eq!(hop.address, "202.97.12.1");
        assert_eq!(hop.network_owner.as_deref(), Some("AS4134"));
        assert_eq!(hop.geo_tokens, vec!["中国", "上海"]);
        assert!(hop.delays.is_empty());
    }

    #[test]
    fn bare_delay_line_is_continuation_not_header() {
        assert_eq!(
            classify_line("12 ms", &RICH_BACKEND, OPEN),
            LineEvent::DelayContinuation(DelaySamples {
                values: vec![12.0],
                timeouts: 0,
            })
        );
        assert_eq!(
            classify_line("0.98 ms / 0.77 ms / 0.66 ms", &RICH_BACKEND, OPEN),
            LineEvent::DelayContinuation(DelaySamples {
                values: vec![0.98, 0.77, 0.66],
                timeouts: 0,
            })
        );
    }

    #[test]
    fn continuation_requires_hop_context() {
        assert_eq!(
            classify_line("1.2 ms", &RICH_BACKEND, ParseState::default()),
            LineEvent::Noise
        );
        assert_eq!(
            classify_line("中国 江苏 南京", &RICH_BACKEND, ParseState::default()),
            LineEvent::Noise
        );
        assert_eq!(
            classify_line("中国 江苏 南京", &RICH_BACKEND, OPEN),
            LineEvent::GeoContinuation {
                tokens: vec!["中国".to_string(), "江苏".to_string(), "南京".to_string()]
            }
        );
    }

    #[test]
    fn prompt_options_and_artifact() {
        assert_eq!(
            classify_line(
                "Please Choose the IP You Want To TraceRoute",
                &RICH_BACKEND,
                OPEN
            ),
            LineEvent::SelectionPromptStart
        );

        let collecting = ParseState {
            collecting_options: true,
            hop_context: false,
        };
        match classify_line("1) 2400:da00::6666 (IPv6)", &RICH_BACKEND, collecting) {
            LineEvent::SelectionOption(option) => {
                assert_eq!(option.offered_index, 1);
                assert_eq!(option.family, AddressFamily::V6);
                assert!(option.geo_hint.is_unknown());
            }
            other => panic!("expected option, got {other:?}"),
        }
        assert_eq!(
            classify_line("Your Option: ", &RICH_BACKEND, collecting),
            LineEvent::SelectionListEnd
        );
        assert_eq!(
            classify_line("Your Option:", &RICH_BACKEND, OPEN),
            LineEvent::Noise
        );
        // Outside a prompt the same shape is not an option.
        assert_eq!(
            classify_line("0. 180.101.51.73", &RICH_BACKEND, ParseState::default()),
            LineEvent::Noise
        );

        assert_eq!(
            classify_line(
                "MapTrace URL: https://assets.nxtrace.org/tracemap/x.html",
                &RICH_BACKEND,
                OPEN
            ),
            LineEvent::SentinelUrl {
                value: "https://assets.nxtrace.org/tracemap/x.html".to_string()
            }
        );
    }

    #[test]
    fn boilerplate_is_noise() {
        for line in [
            "NextTrace v1.2.3 2021-2024 NextTrace.org",
            "[NextTrace API] preferred API IP - 1.2.3.4",
            "traceroute to 1.1.1.1, 30 hops max, 52 bytes packets",
            "Sponsored by AS-JiangSu",
        ] {
            assert_eq!(classify_line(line, &RICH_BACKEND, OPEN), LineEvent::Noise, "{line}");
        }
        assert_eq!(
            classify_line("Tracing route to example.com [93.184.216.34]", &NATIVE_WINDOWS, OPEN),
            LineEvent::Noise
        );
    }

    #[test]
    fn resolve_distinguishes_zero_from_timeout() {
        let zero = DelaySamples {
            values: vec![0.0],
            timeouts: 0,
        };
        assert_eq!(zero.resolve(), Some(0.0));
        let lost = DelaySamples {
            values: vec![],
            timeouts: 3,
        };
        assert_eq!(lost.resolve(), Some(-1.0));
        assert_eq!(DelaySamples::default().resolve(), None);
    }
}
