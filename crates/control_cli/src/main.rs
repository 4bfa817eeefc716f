use clap::{Parser, Subcommand};
use dotenvy::from_path as dotenv_from_path;
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use thiserror::Error;

use capibara_engine::{
    ClearRequest, Engine, EngineError, ListRequest, RunRequest, ShowRequest,
};
use capibara_providers::{GroqCompatProvider, OpenAICompatProvider, Provider};
use capibara_sandbox::SandboxRunner;

#[derive(Debug, Error)]
enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::Io(_) | CliError::Json(_) | CliError::Config(_) => 1,
            CliError::Engine(e) => match e {
                EngineError::InvalidRequest(_) | EngineError::NotFound(_) => 1,
                EngineError::SecurityViolation(_) => 2,
                _ => 3,
            },
        }
    }
}

#[derive(Parser)]
#[command(name = "capibara", version, about = "Secure code generation and sandboxed execution")]
struct Args {
    /// Cache directory (overrides config/env/defaults)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Audit directory containing audit.jsonl and violations.jsonl
    #[arg(long, global = true)]
    audit_dir: Option<PathBuf>,

    /// Directory holding custom policy YAML documents
    #[arg(long, global = true)]
    policies_dir: Option<PathBuf>,

    /// Explicit local config file (highest-precedence file source)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Disable the Docker sandbox runner (generation-only mode)
    #[arg(long, global = true, default_value_t = false)]
    no_sandbox: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate (or fetch from cache) a script and optionally execute it.
    Run {
        prompt: String,

        #[arg(long, default_value = "python")]
        language: String,

        /// Path to a JSON file supplying the `context` object.
        #[arg(long)]
        context_json: Option<PathBuf>,

        #[arg(long)]
        policy_name: Option<String>,

        #[arg(long)]
        provider_name: Option<String>,

        #[arg(long)]
        cache_ttl_seconds: Option<u64>,

        #[arg(long, default_value_t = false)]
        execute: bool,
    },

    /// List cached scripts.
    ListScripts {
        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long)]
        language: Option<String>,

        #[arg(long)]
        search: Option<String>,

        #[arg(long, default_value = "created_at")]
        sort_by: String,

        #[arg(long, default_value = "desc")]
        order: String,
    },

    /// Show a single cached script by id.
    Show {
        script_id: String,

        #[arg(long, default_value_t = true)]
        include_code: bool,

        #[arg(long, default_value_t = false)]
        include_logs: bool,
    },

    /// Clear cached scripts matching the given criteria.
    Clear {
        #[arg(long = "script-id")]
        script_ids: Vec<String>,

        #[arg(long)]
        language: Option<String>,

        #[arg(long)]
        older_than_seconds: Option<u64>,

        #[arg(long, default_value_t = false)]
        all: bool,
    },

    /// Report provider and sandbox health.
    Health,

    /// Report cache, provider, and generator statistics.
    Stats,

    /// Run one diagnostic sweep (health + sandbox probe + cache-dir writable check).
    Doctor,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
    cache_dir: Option<PathBuf>,
    audit_dir: Option<PathBuf>,
    policies_dir: Option<PathBuf>,
    default_policy: Option<String>,
    openai_base_url: Option<String>,
    openai_api_key: Option<String>,
    openai_model: Option<String>,
    groq_base_url: Option<String>,
    groq_api_key: Option<String>,
    groq_model: Option<String>,
}

fn load_config_file(path: &Path) -> FileConfig {
    match std::fs::read_to_string(path) {
        Ok(text) => serde_yaml::from_str(&text).unwrap_or_else(|e| {
            eprintln!("config: failed to parse {}: {e}", path.display());
            FileConfig::default()
        }),
        Err(_) => FileConfig::default(),
    }
}

/// Resolves a single setting across the five sources named in the
/// configuration precedence: explicit -> env -> local file -> user file ->
/// system file -> built-in default. Earlier non-None sources win.
struct ResolvedConfig {
    cache_dir: PathBuf,
    audit_dir: PathBuf,
    policies_dir: PathBuf,
    openai_base_url: Option<String>,
    openai_api_key: Option<String>,
    openai_model: String,
    groq_base_url: Option<String>,
    groq_api_key: Option<String>,
    groq_model: String,
}

/// One `EngineConfig` is built per invocation and passed down explicitly;
/// there is no ambient global config singleton.
struct EngineConfig;

impl EngineConfig {
    fn resolve(args: &Args) -> ResolvedConfig {
        let repo_env = PathBuf::from(".env");
        if repo_env.exists() {
            let _ = dotenv_from_path(&repo_env);
        }

        let local_file = args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from("capibara.yaml"));
        let local = if local_file.exists() {
            load_config_file(&local_file)
        } else {
            FileConfig::default()
        };

        let user_file = dirs_config_home().join("capibara").join("config.yaml");
        let user = if user_file.exists() { load_config_file(&user_file) } else { FileConfig::default() };

        let system_file = PathBuf::from("/etc/capibara/config.yaml");
        let system = if system_file.exists() { load_config_file(&system_file) } else { FileConfig::default() };

        let cache_dir = args
            .cache_dir
            .clone()
            .or_else(|| std::env::var("CAPIBARA_CACHE_DIR").ok().map(PathBuf::from))
            .or(local.cache_dir)
            .or(user.cache_dir)
            .or(system.cache_dir)
            .unwrap_or_else(|| PathBuf::from("capibara_data/cache"));

        let audit_dir = args
            .audit_dir
            .clone()
            .or_else(|| std::env::var("CAPIBARA_AUDIT_DIR").ok().map(PathBuf::from))
            .or(local.audit_dir)
            .or(user.audit_dir)
            .or(system.audit_dir)
            .unwrap_or_else(|| PathBuf::from("capibara_data/audit"));

        let policies_dir = args
            .policies_dir
            .clone()
            .or_else(|| std::env::var("CAPIBARA_POLICIES_DIR").ok().map(PathBuf::from))
            .or(local.policies_dir)
            .or(user.policies_dir)
            .or(system.policies_dir)
            .unwrap_or_else(|| PathBuf::from("capibara_data/policies"));

        let openai_base_url = std::env::var("OPENAI_BASE_URL")
            .ok()
            .or(local.openai_base_url.clone())
            .or(user.openai_base_url.clone())
            .or(system.openai_base_url.clone());
        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .or(local.openai_api_key)
            .or(user.openai_api_key)
            .or(system.openai_api_key);
        let openai_model = std::env::var("OPENAI_MODEL")
            .ok()
            .or(local.openai_model)
            .or(user.openai_model)
            .or(system.openai_model)
            .unwrap_or_else(|| "gpt-4o-mini".to_string());

        let groq_base_url = std::env::var("GROQ_BASE_URL")
            .ok()
            .or(local.groq_base_url.clone())
            .or(user.groq_base_url.clone())
            .or(system.groq_base_url.clone());
        let groq_api_key = std::env::var("GROQ_API_KEY")
            .ok()
            .or(local.groq_api_key)
            .or(user.groq_api_key)
            .or(system.groq_api_key);
        let groq_model = std::env::var("GROQ_MODEL")
            .ok()
            .or(local.groq_model)
            .or(user.groq_model)
            .or(system.groq_model)
            .unwrap_or_else(|| "llama-3.1-70b-versatile".to_string());

        ResolvedConfig {
            cache_dir,
            audit_dir,
            policies_dir,
            openai_base_url,
            openai_api_key,
            openai_model,
            groq_base_url,
            groq_api_key,
            groq_model,
        }
    }
}

fn dirs_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::var("HOME")
                .map(|home| PathBuf::from(home).join(".config"))
                .unwrap_or_else(|_| PathBuf::from(".config"))
        })
}

fn build_providers(cfg: &ResolvedConfig) -> Vec<Box<dyn Provider>> {
    let mut providers: Vec<Box<dyn Provider>> = Vec::new();
    if let Some(base_url) = &cfg.openai_base_url {
        providers.push(Box::new(OpenAICompatProvider::new(
            base_url.clone(),
            cfg.openai_api_key.clone(),
            cfg.openai_model.clone(),
            1,
        )));
    }
    if let Some(base_url) = &cfg.groq_base_url {
        providers.push(Box::new(GroqCompatProvider::new(
            base_url.clone(),
            cfg.groq_api_key.clone(),
            cfg.groq_model.clone(),
            2,
        )));
    }
    providers
}

async fn build_engine(args: &Args) -> Result<Engine, CliError> {
    let cfg = EngineConfig::resolve(args);
    std::fs::create_dir_all(&cfg.cache_dir)?;
    std::fs::create_dir_all(&cfg.audit_dir)?;
    std::fs::create_dir_all(&cfg.policies_dir)?;

    let sandbox = if args.no_sandbox {
        None
    } else {
        match SandboxRunner::connect() {
            Ok(runner) => Some(runner),
            Err(e) => {
                eprintln!("sandbox: docker unavailable ({e}), running in generation-only mode");
                None
            }
        }
    };

    let engine = Engine::new(
        cfg.cache_dir.clone(),
        cfg.audit_dir.join("audit.jsonl"),
        cfg.audit_dir.join("violations.jsonl"),
        cfg.policies_dir.clone(),
        build_providers(&cfg),
        sandbox,
    )
    .map_err(CliError::Engine)?;
    Ok(engine)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            let code = e.exit_code();
            eprintln!("ERROR: {e}");
            std::process::exit(code);
        }
    }
}

async fn run(args: Args) -> Result<(), CliError> {
    match &args.cmd {
        Command::Run { .. } => run_generate(&args).await,
        Command::ListScripts { .. } => run_list(&args).await,
        Command::Show { .. } => run_show(&args).await,
        Command::Clear { .. } => run_clear(&args).await,
        Command::Health => run_health(&args).await,
        Command::Stats => run_stats(&args).await,
        Command::Doctor => run_doctor(&args).await,
    }
}

async fn run_generate(args: &Args) -> Result<(), CliError> {
    let Command::Run {
        prompt,
        language,
        context_json,
        policy_name,
        provider_name,
        cache_ttl_seconds,
        execute,
    } = &args.cmd
    else {
        unreachable!()
    };

    let context = match context_json {
        Some(path) => {
            let bytes = std::fs::read(path)?;
            Some(serde_json::from_slice(&bytes)?)
        }
        None => None,
    };

    let engine = build_engine(args).await?;
    let response = engine
        .run(RunRequest {
            prompt: prompt.clone(),
            language: language.clone(),
            context,
            policy_name: policy_name.clone(),
            provider_name: provider_name.clone(),
            cache_ttl_seconds: *cache_ttl_seconds,
            execute: *execute,
        })
        .await?;

    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}

async fn run_list(args: &Args) -> Result<(), CliError> {
    let Command::ListScripts { limit, offset, language, search, sort_by, order } = &args.cmd else {
        unreachable!()
    };
    let engine = build_engine(args).await?;
    let response = engine.list(ListRequest {
        limit: *limit,
        offset: *offset,
        language: language.clone(),
        search: search.clone(),
        sort_by: sort_by.clone(),
        order: order.clone(),
    })?;
    println!("{}", serde_json::to_string(&response.scripts)?);
    Ok(())
}

async fn run_show(args: &Args) -> Result<(), CliError> {
    let Command::Show { script_id, include_code, include_logs } = &args.cmd else {
        unreachable!()
    };
    let engine = build_engine(args).await?;
    let response = engine.show(ShowRequest {
        script_id: script_id.clone(),
        include_code: *include_code,
        include_logs: *include_logs,
    })?;
    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}

async fn run_clear(args: &Args) -> Result<(), CliError> {
    let Command::Clear { script_ids, language, older_than_seconds, all } = &args.cmd else {
        unreachable!()
    };
    let engine = build_engine(args).await?;
    let ids = if script_ids.is_empty() { None } else { Some(script_ids.clone()) };
    let response = engine
        .clear(ClearRequest {
            script_ids: ids,
            language: language.clone(),
            older_than_seconds: *older_than_seconds,
            all: *all,
        })
        .await?;
    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}

async fn run_health(args: &Args) -> Result<(), CliError> {
    let engine = build_engine(args).await?;
    let response = engine.health().await;
    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}

async fn run_stats(args: &Args) -> Result<(), CliError> {
    let engine = build_engine(args).await?;
    let response = engine.stats();
    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}

async fn run_doctor(args: &Args) -> Result<(), CliError> {
    let cfg = EngineConfig::resolve(args);
    let cache_writable = std::fs::create_dir_all(&cfg.cache_dir).is_ok()
        && std::fs::write(cfg.cache_dir.join(".doctor_probe"), b"ok").is_ok();
    let _ = std::fs::remove_file(cfg.cache_dir.join(".doctor_probe"));

    let engine = build_engine(args).await?;
    let health = engine.health().await;

    println!(
        "{}",
        serde_json::to_string(&json!({
            "cache_dir": cfg.cache_dir,
            "cache_writable": cache_writable,
            "health": health,
        }))?
    );
    Ok(())
}
