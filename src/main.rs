mod config;
mod container;
mod docker;
mod env;
mod error;
mod sanitize;
mod summarize;

use clap::{Parser, Subcommand};
use config::{ensure_parent, load_config, resolve_config_path, Config, DEFAULT_CONFIG_YAML};
use container::{HostIdentity, LaunchRequest, LaunchSettings, Launcher};
use docker::{execute_docker, DockerRunner, RealDockerRunner};
use env::EnvSnapshot;
use error::{ProcessErrorDetails, SolverError};
use sanitize::LogSanitizer;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use summarize::{ChatCompletionsSummarizer, DisabledSummarizer, Summarizer};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "aider-solver",
    version,
    about = "Run the aider coding assistant container against a repository"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the assistant against a repository and print a summary of what it did.
    Launch {
        #[arg(long)]
        repo: PathBuf,
        #[arg(long)]
        model: String,
        #[arg(long)]
        background: String,
        #[arg(long)]
        test_command: Option<String>,
        #[arg(long)]
        timeout_sec: Option<u64>,
    },
    /// Clean (and optionally summarize) a captured log from a file or stdin.
    Sanitize {
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        no_summarize: bool,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Doctor,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Show,
    Validate,
    Path,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    json: bool,
    env: EnvSnapshot,
}

fn main() -> Result<(), SolverError> {
    // `.env` never overrides variables that are already set.
    let _ = dotenvy::dotenv();
    let env = EnvSnapshot::capture();
    init_tracing();

    let cli = Cli::parse();
    let ctx = build_context(&cli, env);

    let result = match cli.command {
        Commands::Launch {
            repo,
            model,
            background,
            test_command,
            timeout_sec,
        } => handle_launch(&ctx, repo, model, background, test_command, timeout_sec),
        Commands::Sanitize { file, no_summarize } => handle_sanitize(&ctx, file, no_summarize),
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Doctor => handle_doctor(&ctx, &RealDockerRunner),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: err.process_details(),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("aider_solver=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn build_context(cli: &Cli, env: EnvSnapshot) -> Context {
    Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
        env,
    }
}

fn build_sanitizer(
    cfg: &Config,
    env: &EnvSnapshot,
    summarize: bool,
) -> Result<LogSanitizer<Box<dyn Summarizer>>, SolverError> {
    let summarizer: Box<dyn Summarizer> = if summarize && cfg.summarizer.enabled {
        Box::new(ChatCompletionsSummarizer::from_config(&cfg.summarizer, env)?)
    } else {
        Box::new(DisabledSummarizer)
    };
    Ok(LogSanitizer::new(summarizer, cfg.logs.trailing_marker.clone()))
}

fn handle_launch(
    ctx: &Context,
    repo: PathBuf,
    model: String,
    background: String,
    test_command: Option<String>,
    timeout_sec: Option<u64>,
) -> Result<(), SolverError> {
    let cfg = load_config(&ctx.config_path)?;
    let timeout_sec = timeout_sec.unwrap_or(cfg.launch.default_timeout_sec);
    if timeout_sec == 0 {
        return Err(SolverError::Config(
            "--timeout-sec must be greater than 0".to_string(),
        ));
    }
    let request = LaunchRequest {
        repo_dir: repo,
        model_name: model,
        background,
        test_command,
        timeout: Duration::from_secs(timeout_sec),
    };
    let launcher = Launcher::new(
        LaunchSettings::from_config(&cfg),
        HostIdentity::current()?,
        ctx.env.clone(),
        RealDockerRunner,
        build_sanitizer(&cfg, &ctx.env, true)?,
    );
    let summary = launcher.launch(&request)?;
    if ctx.json {
        return output(ctx, json!({ "summary": summary }));
    }
    println!("{summary}");
    Ok(())
}

fn handle_sanitize(
    ctx: &Context,
    file: Option<PathBuf>,
    no_summarize: bool,
) -> Result<(), SolverError> {
    let cfg = load_config(&ctx.config_path)?;
    let bytes = match file {
        Some(path) => fs::read(path)?,
        None => {
            let mut buf = Vec::new();
            io::stdin().read_to_end(&mut buf)?;
            buf
        }
    };
    let raw = String::from_utf8_lossy(&bytes);
    let sanitizer = build_sanitizer(&cfg, &ctx.env, !no_summarize)?;
    let text = sanitizer.sanitize(&raw);
    if ctx.json {
        return output(ctx, json!({ "text": text }));
    }
    println!("{text}");
    Ok(())
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), SolverError> {
    match command {
        ConfigCommand::Init => {
            let path = &ctx.config_path;
            if path.exists() {
                return output(
                    ctx,
                    json!({"created": false, "path": path.to_string_lossy()}),
                );
            }
            ensure_parent(path)?;
            fs::write(path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"created": true, "path": path.to_string_lossy()}))
        }
        ConfigCommand::Show => {
            let cfg = load_config(&ctx.config_path)?;
            if ctx.json {
                return output(ctx, serde_json::to_value(&cfg)?);
            }
            print!("{}", serde_yaml::to_string(&cfg)?);
            Ok(())
        }
        ConfigCommand::Validate => {
            load_config(&ctx.config_path)?;
            output(
                ctx,
                json!({
                    "valid": true,
                    "path": ctx.config_path.to_string_lossy(),
                    "exists": ctx.config_path.exists(),
                }),
            )
        }
        ConfigCommand::Path => output(
            ctx,
            json!({ "config_path": ctx.config_path.to_string_lossy() }),
        ),
    }
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    ok: bool,
    severity: String,
    message: String,
    remediation: String,
}

fn doctor_check(
    id: &str,
    ok: bool,
    severity: &str,
    message: impl Into<String>,
    remediation: impl Into<String>,
) -> DoctorCheck {
    DoctorCheck {
        id: id.to_string(),
        ok,
        severity: severity.to_string(),
        message: message.into(),
        remediation: remediation.into(),
    }
}

fn host_dir_writable(path: &Path) -> bool {
    fs::create_dir_all(path)
        .and_then(|_| {
            let test_path = path.join(".aider_solver_write_test");
            fs::write(&test_path, b"ok")?;
            fs::remove_file(&test_path)?;
            Ok(())
        })
        .is_ok()
}

fn collect_doctor_checks<R: DockerRunner>(
    ctx: &Context,
    runner: &R,
    docker_installed: bool,
) -> Vec<DoctorCheck> {
    let mut checks = Vec::new();
    let no_env = BTreeMap::new();
    let probe_timeout = Some(Duration::from_secs(15));

    let (cfg, config_error) = match load_config(&ctx.config_path) {
        Ok(cfg) => (cfg, None),
        Err(err) => (Config::default(), Some(err.to_string())),
    };
    checks.push(doctor_check(
        "config",
        config_error.is_none(),
        "error",
        config_error
            .clone()
            .unwrap_or_else(|| format!("config ok ({})", ctx.config_path.display())),
        "Fix the config file or run `aider-solver config init`.",
    ));

    let docker_ok = docker_installed
        && execute_docker(runner, &["info".to_string()], &no_env, probe_timeout).is_ok();
    checks.push(doctor_check(
        "docker_runtime",
        docker_ok,
        "error",
        if docker_ok {
            "docker daemon reachable"
        } else if docker_installed {
            "docker is installed but daemon is unreachable"
        } else {
            "docker is not installed or not in PATH"
        },
        "Install/start Docker and rerun `aider-solver doctor`.",
    ));

    let image_ok = docker_ok
        && execute_docker(
            runner,
            &[
                "image".to_string(),
                "inspect".to_string(),
                cfg.docker.image.clone(),
            ],
            &no_env,
            probe_timeout,
        )
        .is_ok();
    checks.push(doctor_check(
        "image",
        image_ok,
        "warning",
        if image_ok {
            format!("image {} is present", cfg.docker.image)
        } else {
            format!("image {} is not present locally", cfg.docker.image)
        },
        format!(
            "Run `docker pull {}`; otherwise the first launch pulls it.",
            cfg.docker.image
        ),
    ));

    let cache_dir = cfg.cache_dir();
    let cache_ok = host_dir_writable(&cache_dir);
    checks.push(doctor_check(
        "cache_dir",
        cache_ok,
        "error",
        if cache_ok {
            format!("cache directory {} is writable", cache_dir.display())
        } else {
            format!("cache directory {} is not writable", cache_dir.display())
        },
        "Point docker.cache_dir at a directory you can write to.",
    ));

    let key_env = &cfg.summarizer.api_key_env;
    let key_ok = !cfg.summarizer.enabled
        || ctx
            .env
            .get(key_env)
            .is_some_and(|value| !value.trim().is_empty());
    checks.push(doctor_check(
        "summarizer_api_key",
        key_ok,
        "warning",
        if !cfg.summarizer.enabled {
            "summarizer disabled".to_string()
        } else if key_ok {
            format!("{key_env} is set")
        } else {
            format!("{key_env} is not set; summaries fall back to cleaned logs")
        },
        format!("Export {key_env} or add it to .env."),
    ));

    checks
}

fn handle_doctor<R: DockerRunner>(ctx: &Context, runner: &R) -> Result<(), SolverError> {
    let checks = collect_doctor_checks(ctx, runner, which::which("docker").is_ok());
    let ok = !checks
        .iter()
        .any(|check| !check.ok && check.severity == "error");
    let primary_error = checks
        .iter()
        .find(|check| !check.ok && check.severity == "error")
        .map(|check| check.message.clone());

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({ "checks": checks })),
            error: primary_error,
            error_details: None,
        };
        print_json(&payload)?;
        if !ok {
            std::process::exit(1);
        }
        return Ok(());
    }

    for check in &checks {
        let state = if check.ok { "ok" } else { "fail" };
        println!(
            "[{}] {} ({}) - {}",
            state, check.id, check.severity, check.message
        );
        if !check.ok {
            println!("  remediation: {}", check.remediation);
        }
    }
    match primary_error {
        None => Ok(()),
        Some(message) => Err(SolverError::Process(message)),
    }
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), SolverError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), SolverError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
