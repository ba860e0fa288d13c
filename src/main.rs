use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use forgeflow::classify;
use forgeflow::config::{SandboxConfig, Settings};
use forgeflow::models::GeneratedCode;
use forgeflow::sandbox::{run_static_analysis, DockerSandbox};

#[derive(Parser)]
#[command(name = "forgeflow")]
#[command(version, about = "Generation-execution-debug pipeline for automation code")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding sandbox.toml. Defaults to the current directory.
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a Docker engine is reachable for sandboxed execution
    Probe,
    /// Validate the syntax of a Python source file without executing it
    Validate {
        /// Path to the source file
        file: PathBuf,
    },
    /// Classify an error from captured stderr
    Classify {
        /// Path to a file holding the stderr text, or '-' for stdin
        stderr: PathBuf,
        /// Source file the error came from, for context and name analysis
        #[arg(short, long)]
        source: Option<PathBuf>,
    },
    /// Run the static-analysis checks against a source file
    Analyze {
        /// Path to the source file
        file: PathBuf,
    },
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match &cli.command {
        Commands::Probe => cmd_probe().await,
        Commands::Validate { file } => cmd_validate(file),
        Commands::Classify { stderr, source } => cmd_classify(stderr, source.as_deref()),
        Commands::Analyze { file } => cmd_analyze(file),
        Commands::Config => cmd_config(cli.config_dir.as_deref()),
    }
}

async fn cmd_probe() -> Result<()> {
    match DockerSandbox::connect().await {
        Ok(_) => {
            println!("Docker engine reachable: candidates will run in containers");
        }
        Err(e) => {
            println!("Docker engine unavailable ({})", e);
            println!("Candidates will be checked with static analysis only");
        }
    }
    Ok(())
}

fn cmd_validate(file: &std::path::Path) -> Result<()> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    match classify::validate_syntax(&source) {
        None => {
            println!("{}: syntax OK", file.display());
            Ok(())
        }
        Some(err) => {
            println!(
                "{}: {} at line {}",
                file.display(),
                err.message,
                err.line_number.unwrap_or(0)
            );
            if !err.code_context.is_empty() {
                println!("{}", err.code_context);
            }
            std::process::exit(1);
        }
    }
}

fn cmd_classify(stderr_path: &std::path::Path, source_path: Option<&std::path::Path>) -> Result<()> {
    let stderr = if stderr_path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read stderr text from stdin")?;
        buf
    } else {
        std::fs::read_to_string(stderr_path)
            .with_context(|| format!("Failed to read {}", stderr_path.display()))?
    };
    let source = match source_path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => String::new(),
    };

    let parsed = classify::parse_error(&stderr, &source);
    println!("{}", serde_json::to_string_pretty(&parsed)?);

    if !source.is_empty() {
        let undefined = classify::find_undefined_names(&source);
        if !undefined.is_empty() {
            println!("Undefined names: {}", undefined.join(", "));
        }
    }
    Ok(())
}

fn cmd_analyze(file: &std::path::Path) -> Result<()> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let code = GeneratedCode {
        source,
        aux_files: Default::default(),
    };
    let result = run_static_analysis(&code);
    println!("{}", result.stdout);
    if !result.success {
        eprintln!("{}", result.stderr);
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_config(config_dir: Option<&std::path::Path>) -> Result<()> {
    let mut settings = Settings::from_env();
    let dir = match config_dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    settings.sandbox = SandboxConfig::load(&dir)?;

    println!("max_debug_attempts   = {}", settings.max_debug_attempts);
    println!("confidence_threshold = {}", settings.confidence_threshold);
    println!("event_buffer         = {}", settings.event_buffer);
    println!("sandbox.image        = {}", settings.sandbox.image);
    println!("sandbox.memory       = {}", settings.sandbox.memory);
    println!("sandbox.cpus         = {}", settings.sandbox.cpus);
    println!("sandbox.timeout      = {}s", settings.sandbox.timeout_secs);
    println!("sandbox.network      = {}", settings.sandbox.network);
    Ok(())
}
