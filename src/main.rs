use clap::{Parser, Subcommand};
use context_scan::dead_code::Bucket;
use context_scan::{Analyzer, Config, ProjectModel, Reporter};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "context-scan")]
#[command(about = "Project introspection and dead-code confidence analysis for LLM context documents")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Log progress to stderr (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the project and write PROJECT.llm plus one CONTEXT.llm per directory
    Update {
        #[arg(short, long, default_value = ".")]
        path: PathBuf,

        /// Configuration file (defaults to <path>/.context-scan.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Scan the project and print the summary and diagnostics
    Check {
        #[arg(short, long, default_value = ".")]
        path: PathBuf,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// List dead-code findings grouped by confidence bucket
    Cleancode {
        #[arg(short, long, default_value = ".")]
        path: PathBuf,

        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Only show findings at or above this confidence (0-100)
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
        min_confidence: Option<u8>,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate a documented configuration file
    Config {
        /// Output path for the config file (defaults to ./.context-scan.toml)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Update { path, config } => update(&path, config)?,
        Commands::Check { path, config } => check(&path, config)?,
        Commands::Cleancode {
            path,
            config,
            min_confidence,
            json,
        } => cleancode(&path, config, min_confidence, json)?,
        Commands::Config { output } => generate_config(output)?,
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn load_config(target: &Path, config_path: Option<PathBuf>) -> anyhow::Result<Config> {
    let mut config = match config_path {
        Some(path) => Config::from_file(&path)?,
        None => Config::load(target)?,
    };
    config.target_directory = target.to_path_buf();
    Ok(config)
}

fn scan(target: &Path, config: &Config) -> anyhow::Result<ProjectModel> {
    let analyzer = Analyzer::new(config.clone())?;
    println!("🔍 Scanning {}", target.display());
    Ok(analyzer.analyze_project())
}

fn update(target: &Path, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let start_time = Instant::now();
    let config = load_config(target, config_path)?;
    let model = scan(target, &config)?;

    println!("\n📝 Writing documents...");
    let reporter = Reporter::new(&model, &config.output);
    let project = reporter.project_document();
    let written = reporter.write_documents(target, &project)?;

    if project.is_truncated() {
        println!("✂️  PROJECT.llm truncated: {} modules omitted", project.dropped.len());
    }
    for diagnostic in model.diagnostics.iter().chain(&project.diagnostics) {
        println!("  ⚠️  {}", diagnostic);
    }

    println!("\n✅ Updated {} documents in {:.2}s", written.len(), start_time.elapsed().as_secs_f64());
    for file in written {
        println!("   - {}", file.display());
    }
    Ok(())
}

fn check(target: &Path, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(target, config_path)?;
    let model = scan(target, &config)?;

    println!();
    model.print_summary();

    let project = Reporter::new(&model, &config.output).project_document();
    for diagnostic in &project.diagnostics {
        println!("  ⚠️  {}", diagnostic);
    }
    if project.is_truncated() {
        println!(
            "\n✂️  PROJECT.llm would omit {} modules at the current budget",
            project.dropped.len()
        );
    }
    Ok(())
}

fn cleancode(
    target: &Path,
    config_path: Option<PathBuf>,
    min_confidence: Option<u8>,
    json: bool,
) -> anyhow::Result<()> {
    let config = load_config(target, config_path)?;
    let model = scan(target, &config)?;
    let min_confidence = min_confidence.unwrap_or(config.analysis.confidence_threshold);
    let report = model.dead_code.filtered(min_confidence);

    if json {
        let mut full = Reporter::new(&model, &config.output).generate_report();
        full.dead_code = report;
        println!("{}", serde_json::to_string_pretty(&full)?);
        return Ok(());
    }

    println!("\n🧹 Dead code (confidence >= {})", min_confidence);
    for bucket in [Bucket::High, Bucket::Medium, Bucket::Low] {
        let findings: Vec<_> = report.in_bucket(bucket).collect();
        if findings.is_empty() {
            continue;
        }
        println!("\n{} confidence ({}):", bucket, findings.len());
        for finding in findings {
            println!(
                "  {}:{} {} {} [{}%] {}{}",
                finding.file.display(),
                finding.line,
                finding.kind,
                finding.symbol,
                finding.confidence,
                finding.evidence.join(", "),
                if finding.test_only { " (test-only)" } else { "" }
            );
        }
    }

    if !report.empty_files.is_empty() {
        println!("\n📄 Empty files:");
        for file in &report.empty_files {
            println!("  {}", file.display());
        }
    }

    if report.findings.is_empty() && report.empty_files.is_empty() {
        println!("✨ No dead code found");
    }
    Ok(())
}

fn generate_config(output_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config_path = output_path.unwrap_or_else(|| Config::default_config_path(Path::new(".")));

    println!("📝 Generating configuration file: {}", config_path.display());
    std::fs::write(&config_path, Config::create_documented_config())?;

    println!("✅ Configuration file created successfully!");
    println!("💡 Edit the file to tune exclusions, confidence threshold and output budgets.");
    Ok(())
}
