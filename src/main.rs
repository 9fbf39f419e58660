use std::{fs, io::Write, path::PathBuf, process};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use flowise_pipeline::{FlowisePipeline, Valves, logger::init_tracing};
use futures::StreamExt;
use pipeline_plugin::{ConversationMessage, LogLevel, PipeOutput, Pipeline};
use serde_json::json;
use tracing::error;

#[derive(Parser, Debug)]
#[command(
    name = "flowise-pipeline",
    about = "Relay chat messages to a Flowise chatflow",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send one message through the pipeline and print the reply
    Ask(AskArgs),

    /// Emit the JSON-Schema of the configuration
    Schema,
}

#[derive(Args, Debug)]
struct AskArgs {
    /// The user message
    message: String,

    /// JSON file with earlier turns: [{"role":"user","content":"..."}, ...]
    #[arg(long)]
    history: Option<PathBuf>,

    /// Wait for the whole answer instead of streaming tokens
    #[arg(long)]
    no_stream: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: LogLevel,

    /// Also write logs to a daily file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Ask(args) => ask(args).await,
        Commands::Schema => schema(),
    };
    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("❌ {:#}", e);
        process::exit(1);
    }
}

fn schema() -> anyhow::Result<()> {
    let schema = serde_json::to_string_pretty(&Valves::json_schema())?;
    println!("{schema}");
    Ok(())
}

async fn ask(args: AskArgs) -> anyhow::Result<()> {
    init_tracing(args.log_level, args.log_dir.as_deref())?;

    let valves = Valves::from_env().context("invalid FLOWISE_* configuration")?;
    let mut pipeline = FlowisePipeline::new(valves)?;

    let mut messages: Vec<ConversationMessage> = match &args.history {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("could not read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a list of messages", path.display()))?
        }
        None => Vec::new(),
    };
    messages.push(ConversationMessage::user(args.message.clone()));

    pipeline.on_startup().await?;

    let body = json!({ "stream": !args.no_stream, "messages": messages });
    let body = pipeline.inlet(body, None).await?;

    let output = pipeline
        .pipe(&args.message, &pipeline.name(), &messages, &body)
        .await;
    let answer = print_output(output).await?;

    let reply = json!({ "messages": [{ "role": "assistant", "content": answer }] });
    pipeline.outlet(reply, None).await?;
    pipeline.on_shutdown().await?;
    Ok(())
}

async fn print_output(output: PipeOutput) -> anyhow::Result<String> {
    let mut stdout = std::io::stdout();
    let mut answer = String::new();
    match output {
        PipeOutput::Text(text) => {
            writeln!(stdout, "{text}")?;
            answer = text;
        }
        PipeOutput::Stream(mut tokens) => {
            while let Some(token) = tokens.next().await {
                write!(stdout, "{token}")?;
                stdout.flush()?;
                answer.push_str(&token);
            }
            writeln!(stdout)?;
        }
    }
    Ok(answer)
}
