mod report;

use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::{Args, Parser, Subcommand};
use hoptrace_model::{HopRecord, SelectionOption};
use hoptrace_trace::{
    backend_version, locate_backend, parse_transcript_bytes, AddressChooser, BackendKind, Dialect,
    GeoCache, GeoEnricher, HopCallback, PrivateRangeLookup, ProbeProtocol, ReverseDns, RichOptions,
    SelectionConfig, TraceContext, TraceRequest, TraceSession,
};
use report::{describe_status, format_hop, write_json, TraceReport};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "hoptrace", version, about = "Supervised traceroute with live hop output")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Trace(TraceArgs),
    Parse(ParseArgs),
    /// Show where each backend was found and which version it reports.
    Backends,
}

#[derive(Args)]
#[command(
    about = "Trace the route to a host. Only target networks you own or have permission to test."
)]
struct TraceArgs {
    target: String,

    /// `native` (tracert/traceroute) or `rich` (nexttrace).
    #[arg(long, default_value = "native")]
    backend: BackendKind,

    #[arg(long)]
    program: Option<PathBuf>,

    #[arg(long, default_value_t = 30)]
    max_hops: u32,

    #[arg(long, default_value_t = 2000)]
    probe_timeout_ms: u64,

    #[arg(long, default_value_t = 3)]
    queries: u32,

    #[arg(long, default_value_t = 18)]
    parallel_requests: u32,

    #[arg(long, default_value = "en")]
    lang: String,

    #[arg(long)]
    fast: bool,

    #[arg(long, conflicts_with = "udp")]
    tcp: bool,

    #[arg(long)]
    udp: bool,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long, conflicts_with = "always_rdns")]
    no_rdns: bool,

    #[arg(long)]
    always_rdns: bool,

    #[arg(long)]
    data_provider: Option<String>,

    #[arg(long)]
    disable_map: bool,

    /// Never ask which address to trace; pick the first IPv4 option.
    #[arg(long)]
    auto_select: bool,

    #[arg(long, default_value_t = 5000)]
    selection_timeout_ms: u64,

    #[arg(long, default_value_t = 4)]
    option_cap: usize,

    #[arg(long, default_value_t = 30)]
    grace_secs: u64,

    /// Skip offline labelling of private and loopback hops.
    #[arg(long)]
    no_enrich: bool,

    #[arg(long)]
    json: bool,

    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
#[command(about = "Parse saved backend output into hops")]
struct ParseArgs {
    #[arg(long = "in")]
    in_path: PathBuf,

    /// `windows`, `unix` or `rich`.
    #[arg(long, default_value = "unix")]
    dialect: Dialect,

    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .map_err(|err| anyhow!(err))
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    match cli.command {
        Commands::Trace(args) => run_trace(args),
        Commands::Parse(args) => run_parse(args),
        Commands::Backends => run_backends(),
    }
}

fn build_request(args: &TraceArgs) -> TraceRequest {
    let protocol = if args.tcp {
        ProbeProtocol::Tcp
    } else if args.udp {
        ProbeProtocol::Udp
    } else {
        ProbeProtocol::Icmp
    };
    let reverse_dns = if args.no_rdns {
        ReverseDns::Never
    } else if args.always_rdns {
        ReverseDns::Always
    } else {
        ReverseDns::Default
    };

    TraceRequest {
        target: args.target.clone(),
        max_hops: args.max_hops,
        probe_timeout: Duration::from_millis(args.probe_timeout_ms),
        backend: args.backend,
        rich: RichOptions {
            queries: args.queries,
            parallel_requests: args.parallel_requests,
            lang: args.lang.clone(),
            fast_trace: args.fast,
            protocol,
            port: args.port,
            reverse_dns,
            data_provider: args.data_provider.clone(),
            disable_map: args.disable_map,
        },
        program: args.program.clone(),
    }
}

fn run_trace(args: TraceArgs) -> Result<()> {
    let started_at_utc = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut request = build_request(&args);
    if request.program.is_none() && !request.dialect().is_native() {
        let descriptor = request.descriptor();
        let program = locate_backend(descriptor).ok_or_else(|| {
            anyhow!(
                "{} was not found in tools/, next to hoptrace, or on PATH; pass --program",
                descriptor.program
            )
        })?;
        info!(program = %program.display(), "using located backend");
        request.program = Some(program);
    }
    let invocation = request.descriptor().invocation(&request);

    let mut context = TraceContext::default()
        .with_selection(SelectionConfig {
            option_cap: args.option_cap,
            timeout: Duration::from_millis(args.selection_timeout_ms),
            ..SelectionConfig::default()
        })
        .with_grace(Duration::from_secs(args.grace_secs))
        .with_hop_callback(live_printer(args.json));
    if !args.auto_select {
        context = context.with_chooser(Arc::new(TerminalChooser));
    }
    if !args.no_enrich {
        context = context.with_enrichment(GeoEnricher::new(
            Arc::new(PrivateRangeLookup),
            GeoCache::new(),
        ));
    }

    let handle = TraceSession::start(request, context)
        .with_context(|| format!("failed to start trace to {}", args.target))?;
    let canceller = handle.canceller();
    if let Err(err) = ctrlc::set_handler(move || canceller.cancel()) {
        warn!(error = %err, "failed to install Ctrl-C handler");
    }

    let outcome = handle.await_outcome();
    let finished_at_utc = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

    let report = TraceReport {
        started_at_utc,
        finished_at_utc,
        program: invocation.program.display().to_string(),
        args: invocation.args.clone(),
        outcome: &outcome,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        if let Some(artifact) = &outcome.artifact {
            println!("map: {artifact}");
        }
        println!("trace {}", describe_status(&outcome.status));
    }

    if let Some(path) = &args.out {
        write_json(path, &report)?;
        info!(path = %path.display(), "wrote trace report");
    }

    match &outcome.status {
        status if status.is_success() => Ok(()),
        status => Err(anyhow!("trace to {} {}", outcome.target, describe_status(status))),
    }
}

fn run_parse(args: ParseArgs) -> Result<()> {
    let bytes = fs::read(&args.in_path)
        .with_context(|| format!("failed to read transcript {:?}", args.in_path))?;
    let parsed = parse_transcript_bytes(&bytes, args.dialect)?;

    for hop in &parsed.hops {
        println!("{}", format_hop(hop));
    }
    if let Some(artifact) = &parsed.artifact {
        println!("map: {artifact}");
    }

    if let Some(path) = &args.out {
        write_json(path, &parsed.hops)?;
        info!(path = %path.display(), hops = parsed.hops.len(), "wrote parsed hops");
    }
    Ok(())
}

fn run_backends() -> Result<()> {
    for kind in [BackendKind::Native, BackendKind::Rich] {
        let descriptor = kind.host_dialect().descriptor();
        let Some(program) = locate_backend(descriptor) else {
            println!("{:<7} {:<11} not found", kind.name(), descriptor.program);
            continue;
        };
        let version = match descriptor.version_flag {
            Some(_) => backend_version(descriptor, &program).unwrap_or_else(|err| {
                warn!(backend = descriptor.name, error = %err, "failed to read backend version");
                "version unknown".to_string()
            }),
            None => String::new(),
        };
        println!(
            "{:<7} {:<11} {}  {version}",
            kind.name(),
            descriptor.program,
            program.display()
        );
    }
    Ok(())
}

/// Prints hops as they close. A repeated hop number is a late correction.
fn live_printer(to_stderr: bool) -> HopCallback {
    let printed = Mutex::new(0u32);
    Arc::new(move |hop: &HopRecord| {
        let mut last = printed.lock().unwrap_or_else(|err| err.into_inner());
        let marker = if hop.hop_number <= *last { " (updated)" } else { "" };
        *last = (*last).max(hop.hop_number);
        let line = format!("{}{marker}", format_hop(hop));
        if to_stderr {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    })
}

/// Asks on the terminal which resolved address to trace.
struct TerminalChooser;

impl AddressChooser for TerminalChooser {
    fn choose(&self, options: &[SelectionOption]) -> Result<Option<u32>> {
        let mut stderr = io::stderr().lock();
        writeln!(stderr, "The target resolves to several addresses:")?;
        for option in options {
            let hint = option.geo_hint.as_known().unwrap_or("");
            writeln!(
                stderr,
                "  {}) {} ({}) {}",
                option.offered_index, option.address, option.family, hint
            )?;
        }
        write!(stderr, "Address to trace [enter for default, q to cancel]: ")?;
        stderr.flush()?;
        drop(stderr);

        let mut answer = String::new();
        io::stdin()
            .lock()
            .read_line(&mut answer)
            .context("failed to read address choice")?;
        let answer = answer.trim();

        if answer.eq_ignore_ascii_case("q") {
            return Ok(None);
        }
        if answer.is_empty() {
            return Ok(hoptrace_trace::automatic_choice(options).map(|option| option.offered_index));
        }
        let index: u32 = answer
            .parse()
            .with_context(|| format!("not an option number: {answer}"))?;
        Ok(Some(index))
    }
}
