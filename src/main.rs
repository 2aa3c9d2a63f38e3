use anyhow::{Context, Result};
use clap::Parser;
use rastreo::batcher::{Flusher, TraceBatcher};
use rastreo::cli::{Cli, Command, ExporterKind, InspectArgs, ProtocolArg, ReplayArgs};
use rastreo::config::RastreoConfig;
use rastreo::otlp_exporter::{otlp_adapter, OtlpProtocol};
use rastreo::printer::stdout_adapter;
use rastreo::symbols::{Compatibility, SymbolResolver};
use rastreo::trace_ctx::Observer;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<RastreoConfig> {
    match &cli.config {
        Some(path) => RastreoConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(RastreoConfig::default()),
    }
}

fn inspect(args: &InspectArgs, config: &RastreoConfig) -> Result<()> {
    let baseline = args.baseline.unwrap_or(config.baseline);
    let module = std::fs::read(&args.module)
        .with_context(|| format!("failed to read {}", args.module.display()))?;
    let resolver = SymbolResolver::new(&module, baseline)
        .with_context(|| format!("{} cannot be traced", args.module.display()))?;

    println!("module: {}", args.module.display());
    match resolver.compatibility() {
        Compatibility::Compatible(version) => {
            println!("instrumentation: {} (baseline {})", version, baseline)
        }
        Compatibility::NoCompatibilityInfo => println!("instrumentation: none declared (legacy)"),
    }
    println!("functions: {}", resolver.names().len());
    for (index, _) in resolver.names().sorted() {
        if let Some(name) = resolver.name_of(index) {
            println!("  {:>5}  {}", index, name);
        }
    }
    Ok(())
}

fn replay(args: ReplayArgs, mut config: RastreoConfig) -> Result<()> {
    if let Some(endpoint) = args.otlp_endpoint.clone() {
        config.otlp.endpoint = endpoint;
    }
    if let Some(service_name) = args.otlp_service_name.clone() {
        config.otlp.service_name = service_name;
    }
    if let Some(protocol) = args.otlp_protocol {
        config.otlp.protocol = match protocol {
            ProtocolArg::Grpc => OtlpProtocol::Grpc,
            ProtocolArg::Http => OtlpProtocol::HttpProtobuf,
        };
    }
    if args.otlp_insecure {
        config.otlp.allow_insecure = true;
    }
    config.otlp.headers.extend(args.otlp_headers.iter().cloned());
    config.validate()?;

    match args.exporter {
        ExporterKind::Stdout => run_replay(&args, &config, Arc::new(stdout_adapter()?)),
        ExporterKind::Otlp => {
            let adapter = otlp_adapter(&config.otlp, config.batch)?;
            run_replay(&args, &config, Arc::new(adapter))
        }
    }
}

fn run_replay<F: Flusher>(
    args: &ReplayArgs,
    config: &RastreoConfig,
    adapter: Arc<TraceBatcher<F>>,
) -> Result<()> {
    let mut observer = Observer::new(adapter.clone(), config.correlator);
    if let Some(path) = &args.module {
        let module =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let baseline = args.baseline.unwrap_or(config.baseline);
        observer = observer
            .with_module(&module, baseline)
            .with_context(|| format!("{} cannot be traced", path.display()))?;
    }

    adapter.start();
    let file = File::open(&args.events)
        .with_context(|| format!("failed to open {}", args.events.display()))?;
    let result = rastreo::replay::replay(BufReader::new(file), &observer);
    adapter.stop(true);

    let summary = result?;
    let stats = adapter.stats();
    eprintln!(
        "replayed {} records into {} traces ({} batches flushed, {} failed)",
        summary.records,
        summary.traces.len(),
        stats.batches_flushed,
        stats.batches_failed
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(cli.debug);

    let config = load_config(&cli)?;
    match cli.command {
        Command::Inspect(args) => inspect(&args, &config),
        Command::Replay(args) => replay(args, config),
    }
}
