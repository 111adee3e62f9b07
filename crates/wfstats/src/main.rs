use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wfstats_core::aggregate::SummaryReport;
use wfstats_core::client::WikifunctionsClient;
use wfstats_core::config::{DEFAULT_CONFIG_FILE, ResolvedConfig, load_config};
use wfstats_core::download::DumpDownloader;
use wfstats_core::dump::{convert_all, convert_file};
use wfstats_core::entity_map::JsonlFile;
use wfstats_core::pipeline::{Pipeline, PipelineError};
use wfstats_core::wikitext::{write_report, write_status_map};

#[derive(Debug, Parser)]
#[command(
    name = "wfstats",
    version,
    about = "Function, implementation and test statistics for Wikifunctions dumps"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,
    #[command(flatten)]
    overrides: Overrides,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Default, Args)]
struct Overrides {
    #[arg(long, global = true, value_name = "N", help = "Maximum in-flight API requests")]
    concurrency: Option<usize>,
    #[arg(long, global = true, value_name = "MS", help = "Per-request timeout")]
    timeout_ms: Option<u64>,
    #[arg(long, global = true, value_name = "N", help = "Stop after N functions")]
    max_functions: Option<usize>,
    #[arg(long, global = true, value_name = "N", help = "Minimum entries per entity map")]
    min_map_entries: Option<usize>,
    #[arg(long, global = true, value_name = "PATH", help = "Output path prefix")]
    output_prefix: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH", help = "Write the raw status map as JSON")]
    status_map: Option<PathBuf>,
    #[arg(long, global = true, help = "Also query connected implementations")]
    connectivity: bool,
    #[arg(long, global = true, help = "Abort conversion on the first non-JSON page")]
    strict: bool,
}

impl Overrides {
    fn apply(&self, resolved: &mut ResolvedConfig) {
        if let Some(concurrency) = self.concurrency {
            resolved.client.concurrency = concurrency.max(1);
        }
        if let Some(timeout_ms) = self.timeout_ms {
            resolved.client.timeout_ms = timeout_ms;
        }
        if let Some(max_functions) = self.max_functions {
            resolved.pipeline.max_functions = (max_functions > 0).then_some(max_functions);
        }
        if let Some(min_entries) = self.min_map_entries {
            resolved.pipeline.map.min_entries = min_entries;
        }
        if let Some(prefix) = &self.output_prefix {
            resolved.output_prefix = prefix.clone();
        }
        if let Some(path) = &self.status_map {
            resolved.status_map = Some(path.clone());
        }
        if self.connectivity {
            resolved.pipeline.check_connectivity = true;
        }
        if self.strict {
            resolved.convert.strict = true;
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Download today's dump into the data directory")]
    Download,
    #[command(about = "Convert XML dumps to JSONL")]
    Convert(ConvertArgs),
    #[command(about = "Compute statistics for one JSONL dump and write wikitext")]
    Stats(StatsArgs),
    #[command(about = "Convert every dump in the data directory, then compute statistics")]
    Run,
    #[command(about = "List implementations the API reports as connected")]
    Connected(ConnectedArgs),
    #[command(about = "Print the resolved configuration")]
    Config,
}

#[derive(Debug, Args)]
struct ConvertArgs {
    #[arg(value_name = "XML", help = "Dump file(s); defaults to every *.xml and *.xml.bz2 in the data directory")]
    inputs: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct StatsArgs {
    #[arg(value_name = "JSONL")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct ConnectedArgs {
    #[arg(value_name = "ZID", required = true)]
    functions: Vec<String>,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let Some(command) = cli.command else {
        let mut command = Cli::command();
        command.print_help()?;
        println!();
        return Ok(());
    };
    let resolved = resolve_config(cli.config.as_deref(), &cli.overrides)?;

    match command {
        Commands::Download => run_download(&resolved),
        Commands::Convert(args) => run_convert(&resolved, args),
        Commands::Stats(args) => run_stats(&resolved, &args.input),
        Commands::Run => run_all(&resolved),
        Commands::Connected(args) => run_connected(&resolved, args),
        Commands::Config => run_config(&resolved),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn resolve_config(config_path: Option<&Path>, overrides: &Overrides) -> Result<ResolvedConfig> {
    let path = config_path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
    if config_path.is_some() && !path.exists() {
        bail!("config file not found: {}", normalize_path(path));
    }
    let mut resolved = load_config(path)?.resolve()?;
    overrides.apply(&mut resolved);
    Ok(resolved)
}

fn run_download(resolved: &ResolvedConfig) -> Result<()> {
    let downloader = DumpDownloader::new(
        &resolved.dump_base_url,
        &resolved.data_dir,
        &resolved.client.user_agent,
    )?;
    match downloader.download_today()? {
        Some(path) => println!("downloaded: {}", normalize_path(&path)),
        None => println!("no dump published for today"),
    }
    Ok(())
}

fn run_convert(resolved: &ResolvedConfig, args: ConvertArgs) -> Result<()> {
    let outputs = if args.inputs.is_empty() {
        convert_all(&resolved.data_dir, &resolved.output_dir, &resolved.convert)?
    } else {
        let mut outputs = Vec::with_capacity(args.inputs.len());
        for input in &args.inputs {
            let (output, stats) = convert_file(input, &resolved.output_dir, &resolved.convert)?;
            println!(
                "{}: {} pages, {} ids written, {} skipped",
                normalize_path(input),
                stats.pages,
                stats.written,
                stats.invalid_json
            );
            outputs.push(output);
        }
        outputs
    };
    if outputs.is_empty() {
        println!("no dumps converted");
    }
    for output in outputs {
        println!("wrote: {}", normalize_path(&output));
    }
    Ok(())
}

fn run_stats(resolved: &ResolvedConfig, input: &Path) -> Result<()> {
    if !input.exists() {
        bail!("input not found: {}", normalize_path(input));
    }
    let source = JsonlFile::new(input);

    let outcome = {
        let client = WikifunctionsClient::connect(resolved.client.clone())
            .context("failed to set up API client")?;
        let pipeline = Pipeline::new(client, resolved.pipeline.clone());
        pipeline.run(&source).map_err(|error| fatal(&error))?
    };

    let written = write_report(&outcome.report, &resolved.output_prefix)?;
    if let Some(path) = &resolved.status_map {
        write_status_map(path, &outcome.status_map)?;
    }

    print_summary(&outcome.report, outcome.requests);
    for path in written {
        println!("wrote: {}", normalize_path(&path));
    }
    Ok(())
}

fn run_all(resolved: &ResolvedConfig) -> Result<()> {
    let jsonl_files = convert_all(&resolved.data_dir, &resolved.output_dir, &resolved.convert)?;
    if jsonl_files.is_empty() {
        tracing::warn!(data_dir = %resolved.data_dir.display(), "no JSONL files produced");
        return Ok(());
    }
    for jsonl in jsonl_files {
        tracing::info!(input = %jsonl.display(), "processing JSONL");
        run_stats(resolved, &jsonl)?;
    }
    Ok(())
}

fn run_connected(resolved: &ResolvedConfig, args: ConnectedArgs) -> Result<()> {
    let client = WikifunctionsClient::connect(resolved.client.clone())
        .context("failed to set up API client")?;
    let connected = client.bulk_fetch_connected_implementations(&args.functions);
    println!("{}", serde_json::to_string_pretty(&connected)?);
    Ok(())
}

fn run_config(resolved: &ResolvedConfig) -> Result<()> {
    for (key, value) in resolved.describe() {
        println!("{key} = {value}");
    }
    Ok(())
}

fn fatal(error: &PipelineError) -> anyhow::Error {
    tracing::error!(condition = error.condition(), %error, "run aborted");
    anyhow::anyhow!("{}: {error}", error.condition())
}

fn print_summary(report: &SummaryReport, requests: usize) {
    let stats = &report.stats;
    println!("Z8 statistics (dump of {})", report.as_of_label());
    println!("functions: {}", stats.function_count);
    println!("mean implementations: {:.2}", stats.mean_implementations);
    println!("mean tests: {:.2}", stats.mean_tests);
    println!(
        "tests: {} pass / {} fail / {} error",
        stats.totals.pass, stats.totals.fail, stats.totals.error
    );
    println!("deletion candidates: {}", stats.deletion_candidates.len());
    println!("api requests: {requests}");
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wfstats_core::config::StatsConfig;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_resolved_config() {
        let cli = Cli::parse_from([
            "wfstats",
            "stats",
            "dump-20250301.jsonl",
            "--concurrency",
            "2",
            "--max-functions",
            "10",
            "--connectivity",
            "--output-prefix",
            "out/z8",
        ]);
        let mut resolved = StatsConfig::default()
            .resolve_with(|_| None)
            .expect("resolve");
        cli.overrides.apply(&mut resolved);

        assert_eq!(resolved.client.concurrency, 2);
        assert_eq!(resolved.pipeline.max_functions, Some(10));
        assert!(resolved.pipeline.check_connectivity);
        assert_eq!(resolved.output_prefix, PathBuf::from("out/z8"));
        assert!(matches!(cli.command, Some(Commands::Stats(_))));
    }
}
