mod openai;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgAction, Args, Parser, Subcommand};

use anvil_agent::{Agent, AgentConfig, ContextMode};
use anvil_llm::{Provider, TextDeltaSink};

use openai::OpenAiCompatProvider;

#[derive(Parser, Debug)]
#[command(name = "anvil")]
#[command(about = "Reactive agent runtime CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one prompt and print the final reply.
    Exec(ExecArgs),
    /// Interactive conversation on one session.
    Chat(ChatArgs),
}

#[derive(Args, Debug)]
struct RunOptions {
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long = "session")]
    session_id: Option<String>,
    /// Workspace root for prompt/runtime context.
    #[arg(long)]
    workspace: Option<PathBuf>,
    /// Directory for JSONL session files.
    #[arg(long)]
    sessions_dir: Option<PathBuf>,
    #[arg(long = "no-stream", action = ArgAction::SetTrue)]
    no_stream: bool,
}

#[derive(Args, Debug)]
struct ExecArgs {
    #[command(flatten)]
    options: RunOptions,
    prompt: String,
}

#[derive(Args, Debug)]
struct ChatArgs {
    #[command(flatten)]
    options: RunOptions,
}

#[tokio::main]
async fn main() -> ExitCode {
    load_env_files();
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Exec(args) => exec_command(args).await,
        Commands::Chat(args) => chat_command(args).await,
    };
    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

fn load_env_files() {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
}

async fn exec_command(args: ExecArgs) -> anyhow::Result<ExitCode> {
    let agent = match build_agent(&args.options)? {
        Ok(agent) => agent,
        Err(code) => return Ok(code),
    };
    let reply = run_prompt(&agent, &args.prompt, !args.options.no_stream).await?;
    println!("{reply}");
    Ok(ExitCode::SUCCESS)
}

async fn chat_command(args: ChatArgs) -> anyhow::Result<ExitCode> {
    let agent = match build_agent(&args.options)? {
        Ok(agent) => agent,
        Err(code) => return Ok(code),
    };

    println!("anvil - reactive agent runtime");
    println!(
        "provider/model: {}/{}",
        agent.config().provider,
        agent.config().model
    );
    println!("session id: {}", agent.session_id());
    println!("session messages: {}", agent.snapshot()?.messages.len());
    println!("Type your message (or \"exit\" to quit, \"/reset\" to clear history).");
    println!("{}", "-".repeat(60));

    let stdin = std::io::stdin();
    loop {
        print!("\n> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            println!("\nBye!");
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            println!("Bye!");
            break;
        }
        if input == "/reset" {
            agent.reset()?;
            println!("[session reset]");
            continue;
        }

        match run_prompt(&agent, input, !args.options.no_stream).await {
            Ok(reply) => {
                if args.options.no_stream {
                    println!("\n{reply}");
                } else {
                    println!();
                }
            }
            Err(error) => eprintln!("[error] {error}"),
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_prompt(agent: &Agent, prompt: &str, stream: bool) -> anyhow::Result<String> {
    if stream {
        let on_delta: TextDeltaSink = Arc::new(|delta: &str| {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        });
        Ok(agent.chat_stream(prompt, on_delta).await?)
    } else {
        Ok(agent.chat(prompt).await?)
    }
}

/// Build the agent, or report a configuration problem with exit code 2.
fn build_agent(options: &RunOptions) -> anyhow::Result<Result<Agent, ExitCode>> {
    let config = config_from_env(options);
    let provider: Arc<dyn Provider> = match config.provider.as_str() {
        "openai" => match OpenAiCompatProvider::from_env() {
            Some(provider) => provider,
            None => {
                eprintln!("error: OPENAI_API_KEY is not set");
                return Ok(Err(ExitCode::from(2)));
            }
        },
        other => {
            eprintln!(
                "error: unsupported provider '{other}'; this front-end ships an \
                 OpenAI-compatible adapter (set OPENAI_BASE_URL for other endpoints)"
            );
            return Ok(Err(ExitCode::from(2)));
        }
    };

    let mut builder = Agent::builder(provider).config(config);
    if let Some(session_id) = &options.session_id {
        builder = builder.session_id(session_id);
    }
    Ok(Ok(builder.build()?))
}

fn config_from_env(options: &RunOptions) -> AgentConfig {
    let mut config = AgentConfig::default();
    let provider = options
        .provider
        .clone()
        .or_else(|| env_string("ANVIL_PROVIDER"))
        .unwrap_or_else(|| config.provider.clone());
    config.provider = provider.trim().to_lowercase();
    if let Some(model) = options.model.clone().or_else(|| env_string("ANVIL_MODEL")) {
        config.model = model;
    }
    if let Some(workspace) = &options.workspace {
        config.workspace_dir = workspace.clone();
    } else if let Ok(cwd) = std::env::current_dir() {
        config.workspace_dir = cwd;
    }
    if let Some(sessions_dir) = &options.sessions_dir {
        config.sessions_dir = sessions_dir.clone();
    } else if let Some(dir) = env_string("ANVIL_SESSIONS_DIR") {
        config.sessions_dir = PathBuf::from(dir);
    }

    if let Some(value) = env_parse("ANVIL_MAX_CONCURRENT") {
        config.max_concurrent = value;
    }
    if let Some(value) = env_parse("ANVIL_LANE_WARN_WAIT_MS") {
        config.lane_warn_wait_ms = value;
    }
    if let Some(value) = env_parse("ANVIL_MAX_RETRIES") {
        config.max_retries = value;
    }
    if let Some(value) = env_parse("ANVIL_RETRY_BASE_SECONDS") {
        config.retry_base_seconds = value;
    }
    if let Some(value) = env_parse("ANVIL_MAX_TOOL_ROUNDS") {
        config.max_tool_rounds = value;
    }

    if let Some(mode) = env_string("ANVIL_CONTEXT_MODE") {
        config.context.mode = match mode.trim().to_lowercase().as_str() {
            "tokens" => ContextMode::Tokens,
            _ => ContextMode::Chars,
        };
    }
    if let Some(value) = env_parse("ANVIL_MAX_CHARS") {
        config.context.max_chars = value;
    }
    if let Some(value) = env_parse("ANVIL_MAX_TOKENS") {
        config.context.max_tokens = value;
    }
    if let Some(value) = env_parse("ANVIL_COMPACT_TRIGGER_CHARS") {
        config.context.compact_trigger_chars = value;
    }
    if let Some(value) = env_parse("ANVIL_COMPACT_TRIGGER_TOKENS") {
        config.context.compact_trigger_tokens = value;
    }
    if let Some(value) = env_parse("ANVIL_KEEP_LAST_MESSAGES") {
        config.context.keep_last_messages = value;
    }
    if let Some(value) = env_parse("ANVIL_COMPACT_KEEP_TAIL") {
        config.context.compact_keep_tail = value;
    }

    if let Some(value) = env_parse("ANVIL_SUBAGENT_MAX_DEPTH") {
        config.subagents.max_depth = value;
    }
    if let Some(value) = env_parse("ANVIL_SUBAGENT_MAX_WORKERS") {
        config.subagents.max_workers = value;
    }
    if let Some(value) = env_parse("ANVIL_SUBAGENT_RUN_TIMEOUT_SECONDS") {
        config.subagents.run_timeout_seconds = value;
    }
    if let Some(value) = env_string("ANVIL_SUBAGENT_ANNOUNCE_COMPLETION") {
        config.subagents.announce_completion =
            matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes");
    }
    config
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|value| value.trim().parse().ok())
}
