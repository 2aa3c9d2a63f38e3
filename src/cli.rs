//! CLI argument parsing for Rastreo

use crate::symbols::InstrVersion;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Where replayed traces go
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExporterKind {
    /// Indented call tree on stdout (default)
    Stdout,
    /// OpenTelemetry collector
    Otlp,
}

/// OTLP transport flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProtocolArg {
    Grpc,
    Http,
}

#[derive(Parser, Debug)]
#[command(name = "rastreo")]
#[command(version)]
#[command(about = "Call-tree tracing for instrumented WebAssembly modules", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long = "debug", global = true)]
    pub debug: bool,

    /// TOML configuration file
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show a module's instrumentation version and function names
    Inspect(InspectArgs),
    /// Correlate a JSON-lines raw event log and export the traces
    Replay(ReplayArgs),
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Instrumented WASM module
    #[arg(value_name = "MODULE")]
    pub module: PathBuf,

    /// Instrumentation version to accept (MAJOR.MINOR)
    #[arg(long = "baseline", value_name = "VERSION", value_parser = parse_version)]
    pub baseline: Option<InstrVersion>,
}

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// JSON-lines raw event log
    #[arg(value_name = "EVENTS")]
    pub events: PathBuf,

    /// Module the events came from, for names and the version gate
    #[arg(short = 'm', long = "module", value_name = "MODULE")]
    pub module: Option<PathBuf>,

    /// Instrumentation version to accept (MAJOR.MINOR)
    #[arg(long = "baseline", value_name = "VERSION", value_parser = parse_version)]
    pub baseline: Option<InstrVersion>,

    #[arg(short = 'e', long = "exporter", value_enum, default_value = "stdout")]
    pub exporter: ExporterKind,

    /// OTLP collector endpoint (host:port or URL)
    #[arg(long = "otlp-endpoint", value_name = "ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Service name reported to the collector
    #[arg(long = "otlp-service-name", value_name = "NAME")]
    pub otlp_service_name: Option<String>,

    #[arg(long = "otlp-protocol", value_enum)]
    pub otlp_protocol: Option<ProtocolArg>,

    /// Allow plaintext transport to the collector
    #[arg(long = "otlp-insecure")]
    pub otlp_insecure: bool,

    /// Extra header sent with every upload (repeatable)
    #[arg(long = "otlp-header", value_name = "KEY=VALUE", value_parser = parse_header)]
    pub otlp_headers: Vec<(String, String)>,
}

/// Parse `MAJOR.MINOR`
pub fn parse_version(s: &str) -> Result<InstrVersion, String> {
    let (major, minor) = s
        .split_once('.')
        .ok_or_else(|| format!("expected MAJOR.MINOR, got '{}'", s))?;
    let major = major
        .parse()
        .map_err(|_| format!("invalid major version '{}'", major))?;
    let minor = minor
        .parse()
        .map_err(|_| format!("invalid minor version '{}'", minor))?;
    Ok(InstrVersion::new(major, minor))
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}
