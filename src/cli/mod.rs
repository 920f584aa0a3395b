use crate::app_error::AppError;
use crate::config::{self, Config, DEFAULT_CONFIG_PATH, Settings};
use crate::format::{RenderOptions, ResultFormatter};
use crate::job::JobSpec;
use crate::model::RunState;
use crate::orchestrator::JobOrchestrator;
use crate::output::{self, Tone};
use crate::registry::RunRegistry;
use crate::service::Service;
use crate::version;
use clap::builder::styling::{AnsiColor, Effects, Styles};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Generator, generate};
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::info;

const DEFAULT_CONFIG_TEMPLATE: &str = r#"version: 1

limits:
  max_concurrent: 2          # runs allowed in flight at once
  timeout: "5m"              # default deadline per run
  max_text_output: 20000     # bytes of stdout/stderr kept and shown
  max_file_size: 104857600   # input files above this are rejected
  max_artifact_preview: 20000
  max_artifacts: 200
  # max_retained_runs: 1000  # evict oldest finished runs past this

paths:
  output_dir: "./output"     # one sub-directory per run
  upload_dir: "./uploads"
  allowed_roots: []          # extra directories callers may reference
  allow_any_path: false

tools:
  gitleaks: "gitleaks"
  solazy: "sol-azy"
  waybackurls: "waybackurls"
  medusa: "medusa"
  allow_exec: false          # accept raw "exec" requests in serve mode

env: {}

previews:
  extensions: [".out", ".dot", ".md", ".json", ".txt"]
"#;

#[derive(Debug, Parser)]
#[command(
    name = "jobgate",
    version = version::VALUE,
    about = "Runs external analysis tools under a concurrency ceiling and deadline",
    styles = clap_styles()
)]
struct Cli {
    #[arg(long = "no-color", global = true)]
    no_color: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Answer JSON requests read line by line from stdin
    Serve(ServeArgs),
    /// Run one command and print its summary
    Exec(ExecArgs),
    Init(InitArgs),
    Validate(ValidateArgs),
    Version,
    Completion(CompletionArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ExecArgs {
    #[arg(last = true, allow_hyphen_values = true, required = true)]
    argv: Vec<String>,

    #[arg(long)]
    config: Option<PathBuf>,

    /// Deadline such as "30s" or "2m"; bare numbers are seconds
    #[arg(long)]
    timeout: Option<String>,

    /// Run inside this directory instead of the run's output directory
    #[arg(long)]
    cwd: Option<String>,

    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct CompletionArgs {
    #[arg(value_enum)]
    shell: Shell,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Shell {
    Bash,
    Zsh,
    Fish,
    Powershell,
}

fn clap_styles() -> Styles {
    Styles::plain()
        .header(AnsiColor::White.on_default() | Effects::BOLD)
        .error(AnsiColor::Red.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default())
        .literal(AnsiColor::Cyan.on_default())
        .placeholder(AnsiColor::Cyan.on_default())
        .valid(AnsiColor::Cyan.on_default())
        .invalid(AnsiColor::Cyan.on_default())
        .context(AnsiColor::White.on_default())
        .context_value(AnsiColor::Cyan.on_default())
}

pub async fn run_cli() -> Result<(), AppError> {
    let cli = Cli::parse();
    output::configure(cli.no_color);

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Exec(args) => run_exec(args).await,
        Commands::Init(args) => run_init(args),
        Commands::Validate(args) => run_validate(args),
        Commands::Version => {
            println!("{}", version::VALUE);
            Ok(())
        }
        Commands::Completion(args) => run_completion(args),
    }
}

/// `--config` when given, else `./jobgate.yml` when present, else built-in
/// defaults; `JOBGATE_*` variables apply on top of all three.
fn load_settings(path: Option<&Path>) -> Result<Settings, AppError> {
    let default_path = Path::new(DEFAULT_CONFIG_PATH);
    let mut cfg = match path {
        Some(path) => config::parse(path).map_err(AppError::usage)?,
        None if default_path.exists() => config::parse(default_path).map_err(AppError::usage)?,
        None => Config::builtin(),
    };

    cfg.apply_env(|key| std::env::var(key).ok())?;
    Ok(cfg.resolve()?)
}

fn build_orchestrator(settings: Settings) -> JobOrchestrator {
    let registry = Arc::new(RunRegistry::with_retention(settings.max_retained_runs));
    JobOrchestrator::new(Arc::new(settings), registry)
}

async fn run_serve(args: ServeArgs) -> Result<(), AppError> {
    let settings = load_settings(args.config.as_deref())?;
    info!(
        max_concurrent = settings.max_concurrent,
        output_dir = %settings.output_dir.display(),
        "serving on stdio"
    );

    let service = Arc::new(Service::new(build_orchestrator(settings)));
    service
        .serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
        .map_err(|e| AppError::internal(format!("serve: {e}")))
}

async fn run_exec(args: ExecArgs) -> Result<(), AppError> {
    let settings = load_settings(args.config.as_deref())?;

    let timeout = match args.timeout.as_deref() {
        Some(raw) => Some(config::parse_timeout(raw).ok_or_else(|| {
            AppError::usage(format!("--timeout: invalid duration {raw:?}"))
        })?),
        None => None,
    };

    let mut spec = JobSpec::command("exec", args.argv).timeout(timeout);
    if let Some(cwd) = args.cwd {
        spec = spec.cwd_input(cwd);
    }

    let opts = RenderOptions::summary(settings.max_text_output).with_output();
    let formatter = ResultFormatter::new(&settings);
    let orchestrator = build_orchestrator(settings);

    let run = orchestrator.submit(spec).await?;
    let summary = formatter.render(&run, &opts);

    if args.json {
        let mut stdout = io::stdout().lock();
        serde_json::to_writer_pretty(&mut stdout, &summary)
            .map_err(|e| AppError::internal(format!("encode json: {e}")))?;
        writeln!(stdout).map_err(|e| AppError::internal(format!("write output: {e}")))?;
    } else {
        output::print_run(io::stdout().lock(), &summary)
            .map_err(|e| AppError::internal(format!("write output: {e}")))?;
    }

    if run.state != RunState::Completed {
        return Err(AppError::runtime(format!(
            "run {} ended {}",
            run.id, run.state
        )));
    }

    Ok(())
}

fn run_init(args: InitArgs) -> Result<(), AppError> {
    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if config_path.exists() && !args.force {
        return Err(AppError::usage(format!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        )));
    }

    fs::write(&config_path, DEFAULT_CONFIG_TEMPLATE)
        .map_err(|e| AppError::internal(format!("write {}: {e}", config_path.display())))?;

    println!(
        "created {}",
        output::paint(Tone::Path, &config_path.display().to_string())
    );
    Ok(())
}

#[derive(Serialize)]
struct Issue<'a> {
    field: &'a str,
    message: &'a str,
}

#[derive(Serialize)]
struct ValidateOutput<'a> {
    valid: bool,
    config: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    issues: Option<Vec<Issue<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

fn print_validate_json(output: &ValidateOutput<'_>) -> Result<(), AppError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, output)
        .map_err(|e| AppError::internal(format!("encode validate json: {e}")))?;
    writeln!(stdout).map_err(|e| AppError::internal(format!("write output: {e}")))
}

fn run_validate(args: ValidateArgs) -> Result<(), AppError> {
    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config_path_text = config_path.display().to_string();

    let cfg = match config::parse(&config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            if args.json {
                print_validate_json(&ValidateOutput {
                    valid: false,
                    config: &config_path_text,
                    issues: None,
                    error: Some(&err),
                })?;
            }
            return Err(AppError::usage(err));
        }
    };

    let Err(err) = config::validate(&cfg) else {
        if args.json {
            print_validate_json(&ValidateOutput {
                valid: true,
                config: &config_path_text,
                issues: None,
                error: None,
            })?;
        } else {
            println!(
                "{} {}",
                output::paint(Tone::Strong, "valid"),
                output::paint(Tone::Path, &config_path_text)
            );
        }
        return Ok(());
    };

    if args.json {
        let issues = err
            .issues
            .iter()
            .map(|issue| Issue {
                field: &issue.field,
                message: &issue.message,
            })
            .collect();
        print_validate_json(&ValidateOutput {
            valid: false,
            config: &config_path_text,
            issues: Some(issues),
            error: Some(&err.to_string()),
        })?;
    }
    Err(err.into())
}

fn run_completion(args: CompletionArgs) -> Result<(), AppError> {
    let mut cmd = Cli::command();
    let mut stdout = io::stdout().lock();

    match args.shell {
        Shell::Bash => generate_completion(clap_complete::shells::Bash, &mut cmd, &mut stdout),
        Shell::Zsh => generate_completion(clap_complete::shells::Zsh, &mut cmd, &mut stdout),
        Shell::Fish => generate_completion(clap_complete::shells::Fish, &mut cmd, &mut stdout),
        Shell::Powershell => {
            generate_completion(clap_complete::shells::PowerShell, &mut cmd, &mut stdout)
        }
    }
    .map_err(|e| AppError::internal(format!("generate completion: {e}")))
}

fn generate_completion<G: Generator>(
    generator: G,
    cmd: &mut clap::Command,
    writer: &mut impl Write,
) -> Result<(), io::Error> {
    generate(generator, cmd, "jobgate", writer);
    writer.flush()
}
