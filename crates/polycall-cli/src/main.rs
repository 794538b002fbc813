//! CLI binary for running LLM calls and structured extractions.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use polycall_llm::{
    Call, CallParams, LoggingHandler, Message, Provider, ProviderAdapter, ProviderRegistry,
    ResponseModelSpec, UsageTracker,
};

#[derive(Parser)]
#[command(name = "polycall", version, about = "Provider-agnostic LLM calls from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args)]
struct CallOptions {
    /// The user prompt
    prompt: String,

    /// Vendor to call (openai, azure, groq, anthropic, gemini, vertex, mistral, cohere)
    #[arg(short, long, default_value = "openai")]
    provider: Provider,

    /// Model name (Azure: deployment name)
    #[arg(short, long, default_value = "gpt-4o-mini")]
    model: String,

    /// Optional system prompt
    #[arg(long)]
    system: Option<String>,

    /// Ask for JSON output instead of tool calls
    #[arg(long)]
    json_mode: bool,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    max_tokens: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one prompt and print the reply
    Call {
        #[command(flatten)]
        options: CallOptions,

        /// Print the reply as it streams in
        #[arg(long)]
        stream: bool,
    },

    /// Extract a JSON object matching a schema
    Extract {
        #[command(flatten)]
        options: CallOptions,

        /// Path to a JSON Schema file
        #[arg(long)]
        schema: PathBuf,

        /// Name of the extraction tool shown to the model
        #[arg(long, default_value = "Output")]
        name: String,

        /// Re-prompt with the validation errors this many times
        #[arg(long, default_value = "0")]
        retries: usize,
    },

    /// List providers and the environment variable each reads its key from
    Providers,
}

/// Arguments the prompt is rendered from.
#[derive(Serialize)]
struct PromptArgs {
    prompt: String,
    system: Option<String>,
    errors: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Call { options, stream } => cmd_call(options, stream, cli.verbose).await?,
        Commands::Extract {
            options,
            schema,
            name,
            retries,
        } => cmd_extract(options, &schema, name, retries, cli.verbose).await?,
        Commands::Providers => cmd_providers(),
    }

    Ok(())
}

fn build_call(options: &CallOptions, verbose: bool, tracker: &UsageTracker) -> Call<PromptArgs> {
    let mut call = Call::new(options.provider, options.model.clone(), render_prompt)
        .json_mode(options.json_mode)
        .call_params(CallParams {
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            ..Default::default()
        })
        .handler(tracker.clone());
    if verbose {
        call = call.handler(LoggingHandler);
    }
    call
}

fn render_prompt(args: &PromptArgs) -> Vec<Message> {
    let mut messages = Vec::new();
    if let Some(system) = &args.system {
        messages.push(Message::system(system.clone()));
    }
    let mut prompt = args.prompt.clone();
    if !args.errors.is_empty() {
        prompt.push_str("\n\nYour previous answer was invalid:\n");
        for error in &args.errors {
            prompt.push_str(&format!("- {error}\n"));
        }
    }
    messages.push(Message::user(prompt));
    messages
}

fn prompt_args(options: &CallOptions) -> PromptArgs {
    PromptArgs {
        prompt: options.prompt.clone(),
        system: options.system.clone(),
        errors: Vec::new(),
    }
}

fn print_usage(tracker: &UsageTracker) {
    eprintln!(
        "tokens: {} in / {} out ({} call{})",
        tracker.total_input_tokens(),
        tracker.total_output_tokens(),
        tracker.calls(),
        if tracker.calls() == 1 { "" } else { "s" }
    );
}

async fn cmd_call(options: CallOptions, stream: bool, verbose: bool) -> anyhow::Result<()> {
    let tracker = UsageTracker::new();
    let call = build_call(&options, verbose, &tracker);
    let args = prompt_args(&options);

    if stream {
        let mut stream = call.stream_async(&args).await?;
        let mut stdout = std::io::stdout();
        while let Some(chunk) = stream.next_chunk().await {
            write!(stdout, "{}", chunk?.content())?;
            stdout.flush()?;
        }
        let response = stream.finish().await?;
        writeln!(stdout)?;
        for tool in &response.tool_calls {
            println!("[tool call] {}({})", tool.name, tool.arguments);
        }
    } else {
        let response = call.call_async(&args).await?;
        println!("{}", response.content);
        for tool in &response.tool_calls {
            println!("[tool call] {}({})", tool.name, tool.arguments);
        }
        tracing::debug!(
            finish = ?response.finish_reasons,
            duration_ms = response.duration_ms(),
            "call finished"
        );
    }

    print_usage(&tracker);
    Ok(())
}

async fn cmd_extract(
    options: CallOptions,
    schema_path: &Path,
    name: String,
    retries: usize,
    verbose: bool,
) -> anyhow::Result<()> {
    let schema_text = std::fs::read_to_string(schema_path)
        .with_context(|| format!("Failed to read schema {}", schema_path.display()))?;
    let schema: serde_json::Value = serde_json::from_str(&schema_text)
        .with_context(|| format!("{} is not valid JSON", schema_path.display()))?;

    let tracker = UsageTracker::new();
    let call = build_call(&options, verbose, &tracker)
        .response_schema(ResponseModelSpec::from_schema(name, schema));

    let value = polycall_llm::retry::with_error_reinsertion_async(retries + 1, |errors| {
        let call = &call;
        let mut args = prompt_args(&options);
        args.errors = errors.iter().map(ToString::to_string).collect();
        async move { call.extract_value_async(&args).await }
    })
    .await?;

    println!("{}", serde_json::to_string_pretty(&value)?);
    print_usage(&tracker);
    Ok(())
}

fn cmd_providers() {
    let registry = ProviderRegistry::with_defaults();
    for provider in registry.providers() {
        if let Ok(adapter) = registry.get(provider) {
            let adapter: &dyn ProviderAdapter = adapter.as_ref();
            let key_set = std::env::var(adapter.api_key_env()).is_ok();
            println!(
                "{:<10} {:<24} {}",
                provider,
                adapter.api_key_env(),
                if key_set { "set" } else { "missing" }
            );
        }
    }
}
