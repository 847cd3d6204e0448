mod config;
mod dataset;
mod derive;
mod export;
mod extractor;
mod series;

use clap::{Args, Parser, Subcommand};
use config::{ChartConfig, MalformedPolicy, Profile, SimstatConfig};
use dataset::Dataset;
use export::Format;
use extractor::LogStatExtractor;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Scrape per-run statistics out of simulator logs: match run-start markers
/// and metric lines, emit one row per completed run, export the table or the
/// chart series built from it.
#[derive(Parser, Debug)]
#[command(name = "simstat", version, about)]
pub struct Cli {
    /// Config file path (default: simstat.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Extra logging (discarded runs, suppressed records)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract one record per completed run and export the dataset
    Extract(ExtractArgs),
    /// Group, sort and scale extracted records into chart series
    Series(SeriesArgs),
    /// List available extraction profiles
    Profiles,
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Simulator log file, or `-` for stdin
    #[arg(value_name = "LOG")]
    log: PathBuf,

    /// Extraction profile name (see `simstat profiles`)
    #[arg(short, long)]
    profile: String,

    /// Abort on the first unparseable value instead of skipping the line
    #[arg(long)]
    strict: bool,

    /// Ignore the profile's row filters
    #[arg(long)]
    no_filter: bool,
}

#[derive(Args, Debug)]
struct ExtractArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Output format (default: from output extension, else table on stdout)
    #[arg(short, long, value_enum)]
    format: Option<Format>,

    /// Write to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Sort rows by this field
    #[arg(long)]
    sort: Option<String>,

    /// Print the resolved profile and exit without reading the log
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct SeriesArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// X field (overrides profile chart settings)
    #[arg(long)]
    x: Option<String>,

    /// Y field (overrides profile chart settings)
    #[arg(long)]
    y: Option<String>,

    /// Field whose values split the records into one series each
    #[arg(long)]
    group: Option<String>,

    /// Treat the x axis as log2 (drops non-positive x, adds power-of-two ticks)
    #[arg(long)]
    log2_x: bool,

    /// Multiply every y value, e.g. 100 for a percentage
    #[arg(long)]
    y_scale: Option<f64>,

    /// Keep points in run-completion order
    #[arg(long)]
    no_sort: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    format: Format,
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    tracing::debug!(?cli, "parsed CLI arguments");

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> CliResult {
    let config = config::load(cli.config.as_deref())?;
    match &cli.command {
        Command::Extract(args) => run_extract(&config, args),
        Command::Series(args) => run_series(&config, args),
        Command::Profiles => run_profiles(&config),
    }
}

/// Resolve the profile, scan the log and apply the profile's filters.
fn load_dataset<'c>(
    config: &'c SimstatConfig,
    source: &SourceArgs,
) -> Result<(&'c Profile, Dataset), Box<dyn std::error::Error>> {
    let profile = config.profile(&source.profile)?;
    let policy = if source.strict {
        MalformedPolicy::Fail
    } else {
        config.extract.on_malformed
    };
    let extractor = LogStatExtractor::new(profile, policy)?;
    tracing::debug!(
        profile = extractor.profile_name(),
        key_fields = ?extractor.key_fields(),
        ?policy,
        "compiled profile"
    );
    let mut dataset = if source.log.as_os_str() == "-" {
        extractor.extract_reader(std::io::stdin().lock(), "<stdin>")?
    } else {
        extractor.extract_path(&source.log)?
    };

    if !source.no_filter {
        for filter in &profile.filters {
            let before = dataset.len();
            dataset = dataset.filter(filter);
            tracing::debug!(
                %filter,
                kept = dataset.len(),
                dropped = before - dataset.len(),
                "applied filter"
            );
        }
    }
    Ok((profile, dataset))
}

fn run_extract(config: &SimstatConfig, args: &ExtractArgs) -> CliResult {
    if args.dry_run {
        let profile = config.profile(&args.source.profile)?;
        LogStatExtractor::new(profile, config.extract.on_malformed)?;
        print!("{}", toml::to_string_pretty(profile)?);
        return Ok(());
    }

    let (_, mut dataset) = load_dataset(config, &args.source)?;
    if dataset.is_empty() {
        eprintln!("No valid data found in the log file.");
        return Ok(());
    }
    eprintln!("Extracted {} data points.", dataset.len());

    if let Some(field) = &args.sort {
        if !dataset.has_column(field) {
            tracing::warn!(%field, "sort field not in dataset, order unchanged");
        }
        dataset = dataset.sorted_by(field);
    }

    match &args.output {
        Some(path) => {
            let format = args
                .format
                .or_else(|| Format::from_extension(path))
                .unwrap_or(Format::Csv);
            export::write_to_path(&dataset, format, path)?;
            eprintln!("Data stored in {}", path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            export::write_dataset(&dataset, args.format.unwrap_or(Format::Table), &mut stdout)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn run_series(config: &SimstatConfig, args: &SeriesArgs) -> CliResult {
    let (profile, dataset) = load_dataset(config, &args.source)?;
    let chart_config = resolve_chart(profile, args)?;
    if dataset.is_empty() {
        eprintln!("No valid data found in the log file.");
        return Ok(());
    }

    let chart = series::build_chart(&dataset, &chart_config)?;
    tracing::info!(
        series = chart.series.len(),
        points = chart.point_count(),
        "built chart series"
    );
    let mut stdout = std::io::stdout().lock();
    series::write_chart(&chart, args.format, &mut stdout)?;
    stdout.flush()?;
    Ok(())
}

/// Profile chart settings with command-line overrides applied.
fn resolve_chart(profile: &Profile, args: &SeriesArgs) -> Result<ChartConfig, String> {
    let base = profile.chart.as_ref();
    let x = args
        .x
        .clone()
        .or_else(|| base.map(|c| c.x.clone()))
        .ok_or_else(|| format!("profile '{}' has no chart settings; pass --x", profile.name))?;
    let y = args
        .y
        .clone()
        .or_else(|| base.map(|c| c.y.clone()))
        .ok_or_else(|| format!("profile '{}' has no chart settings; pass --y", profile.name))?;
    Ok(ChartConfig {
        x,
        y,
        group: args.group.clone().or_else(|| base.and_then(|c| c.group.clone())),
        log2_x: args.log2_x || base.is_some_and(|c| c.log2_x),
        y_scale: args
            .y_scale
            .unwrap_or_else(|| base.map_or(1.0, |c| c.y_scale)),
        sort_x: !args.no_sort && base.map_or(true, |c| c.sort_x),
    })
}

fn run_profiles(config: &SimstatConfig) -> CliResult {
    let mut stdout = std::io::stdout().lock();
    for profile in config.all_profiles() {
        writeln!(stdout, "{:<12} {}", profile.name, profile.description)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_extract_args() {
        let cli = Cli::try_parse_from([
            "simstat", "extract", "log_RAS.txt", "-p", "ras", "-o", "ras.csv", "--sort",
            "totalSize", "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Command::Extract(args) => {
                assert_eq!(args.source.profile, "ras");
                assert_eq!(args.source.log, PathBuf::from("log_RAS.txt"));
                assert_eq!(args.output, Some(PathBuf::from("ras.csv")));
                assert_eq!(args.sort.as_deref(), Some("totalSize"));
                assert!(args.format.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["simstat", "-v", "-q", "profiles"]).is_err());
    }

    fn series_args(extra: &[&str]) -> SeriesArgs {
        let mut argv = vec!["simstat", "series", "log.txt", "-p", "btb"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Series(args) => args,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn chart_overrides_apply_on_top_of_profile() {
        let config = SimstatConfig::default();
        let profile = config.profile("btb").unwrap();

        let chart = resolve_chart(profile, &series_args(&[])).unwrap();
        assert_eq!(chart.x, "totalSize");
        assert_eq!(chart.y_scale, 100.0);
        assert!(chart.log2_x);
        assert!(chart.sort_x);

        let chart = resolve_chart(
            profile,
            &series_args(&["--x", "numEntries", "--y-scale", "1", "--no-sort"]),
        )
        .unwrap();
        assert_eq!(chart.x, "numEntries");
        assert_eq!(chart.y, "BTBHitRatio");
        assert_eq!(chart.y_scale, 1.0);
        assert!(!chart.sort_x);
    }

    #[test]
    fn chart_without_profile_settings_needs_axes() {
        let mut profile = SimstatConfig::default().profile("btb").unwrap().clone();
        profile.chart = None;
        let err = resolve_chart(&profile, &series_args(&[])).unwrap_err();
        assert!(err.contains("pass --x"));

        let chart = resolve_chart(&profile, &series_args(&["--x", "a", "--y", "b"])).unwrap();
        assert_eq!(chart.y_scale, 1.0);
        assert!(!chart.log2_x);
        assert!(chart.group.is_none());
    }

    #[test]
    fn load_dataset_applies_profile_filter() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log_BTB_full.txt");
        std::fs::write(
            &log,
            "RUNNING associativity=1 AND numEntries=4096\n\
             system.cpu.branchPred.BTBHitRatio 0.9\n\
             RUNNING associativity=1 AND numEntries=8192\n\
             system.cpu.branchPred.BTBHitRatio 0.95\n",
        )
        .unwrap();
        let config = SimstatConfig::default();

        let mut source = SourceArgs {
            log,
            profile: "btb-assoc".into(),
            strict: false,
            no_filter: false,
        };
        let (_, ds) = load_dataset(&config, &source).unwrap();
        assert_eq!(ds.len(), 1);

        source.no_filter = true;
        let (_, ds) = load_dataset(&config, &source).unwrap();
        assert_eq!(ds.len(), 2);
    }
}
