use std::env;
use std::str::FromStr;

use aimd_scheduler::scheduler::{Scheduler, SchedulerSettings};
use openai_client::{ChatCompletionRequest, ChatMessage, OpenAIClient, OpenAIClientConfig};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

// --- Configuration Environment Variable Names ---
const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
const ENV_OPENAI_BASE_URL: &str = "OPENAI_API_BASE_URL";
const ENV_OPENAI_DEFAULT_MODEL: &str = "OPENAI_DEFAULT_MODEL";
const ENV_USER_AGENT: &str = "OPENAI_CLIENT_USER_AGENT";
const ENV_LOG_FILE: &str = "OPENAI_CLIENT_LOG_FILE";
const ENV_CONCURRENT_TASKS: &str = "DEMO_CONCURRENT_TASKS";

// Scheduler Settings
const ENV_SCHED_INITIAL_CAPACITY: &str = "SCHED_INITIAL_CAPACITY";
const ENV_SCHED_INITIAL_RATE: &str = "SCHED_INITIAL_RATE";
const ENV_SCHED_BUCKET_SIZE: &str = "SCHED_BUCKET_SIZE";
const ENV_SCHED_BACKOFF_BASE_MS: &str = "SCHED_BACKOFF_BASE_MS";
const ENV_SCHED_BACKOFF_CAP_MS: &str = "SCHED_BACKOFF_CAP_MS";
const ENV_SCHED_JITTER_MAX_MS: &str = "SCHED_JITTER_MAX_MS";

// Helper to parse environment variables with a default
fn get_env_var<T: FromStr + std::fmt::Debug>(var_name: &str, default_value: T) -> T
where
    <T as FromStr>::Err: std::fmt::Debug,
{
    env::var(var_name)
        .ok()
        .and_then(|val_str| match val_str.parse::<T>() {
            Ok(val) => Some(val),
            Err(e) => {
                warn!(
                    "Failed to parse env var '{}' (value: '{}'). Error: {:?}. Using default: {:?}",
                    var_name, val_str, e, default_value
                );
                None
            }
        })
        .unwrap_or(default_value)
}

fn scheduler_settings_from_env() -> SchedulerSettings {
    let defaults = SchedulerSettings::default();
    SchedulerSettings::builder()
        .initial_capacity(get_env_var(
            ENV_SCHED_INITIAL_CAPACITY,
            defaults.initial_capacity(),
        ))
        .initial_rate(get_env_var(ENV_SCHED_INITIAL_RATE, defaults.initial_rate()))
        .bucket_size(get_env_var(ENV_SCHED_BUCKET_SIZE, defaults.bucket_size()))
        .backoff_base_ms(get_env_var(
            ENV_SCHED_BACKOFF_BASE_MS,
            defaults.backoff_base().as_millis() as u64,
        ))
        .backoff_cap_ms(get_env_var(
            ENV_SCHED_BACKOFF_CAP_MS,
            defaults.backoff_cap().as_millis() as u64,
        ))
        .jitter_max_ms(get_env_var(
            ENV_SCHED_JITTER_MAX_MS,
            defaults.jitter_max().as_millis() as u64,
        ))
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    // Load .env before anything reads the environment.
    let dotenv_loaded = dotenvy::dotenv().is_ok();

    let default_log_filter = "info,aimd_scheduler=debug";
    let log_file = env::var(ENV_LOG_FILE).unwrap_or_else(|_| "adaptive_openai_client.log".into());
    let (file_writer, _log_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(".", &log_file));
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_log_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();
    info!(%log_file, dotenv_loaded, "Tracing initialized.");

    let api_key = env::var(ENV_OPENAI_API_KEY)
        .map_err(|_| format!("Required environment variable '{}' not set", ENV_OPENAI_API_KEY))?;

    let settings = scheduler_settings_from_env();
    info!(target: "config_loading", ?settings);

    let default_config = OpenAIClientConfig::default();
    let config = OpenAIClientConfig {
        api_key,
        base_url: env::var(ENV_OPENAI_BASE_URL).unwrap_or(default_config.base_url.clone()),
        default_model: env::var(ENV_OPENAI_DEFAULT_MODEL)
            .unwrap_or(default_config.default_model.clone()),
        user_agent: env::var(ENV_USER_AGENT)
            .ok()
            .or(default_config.user_agent.clone()),
        scheduler: Some(Scheduler::new(settings)?),
        ..default_config
    };
    info!(target: "config_final", client_config = ?config, "OpenAIClient configuration loaded.");

    let client = OpenAIClient::new(config)?;

    // --- First example call (default model) ---
    let messages = vec![
        ChatMessage::system("You are a concise assistant."),
        ChatMessage::user("What is the color of the sky on a clear day?"),
    ];
    info!("Sending request with default model...");
    match client.chat_completion_with_messages(messages.clone()).await {
        Ok(response) => match response.choices.first() {
            Some(choice) => println!("Assistant (default model): {}", choice.message.content),
            None => println!("Assistant (default model): No choices returned."),
        },
        Err(e) => eprintln!("Error with default model: {}", e),
    }

    // --- Second example call (specific request) ---
    let specific_request = ChatCompletionRequest {
        model: client.config.default_model.clone(),
        messages,
        temperature: Some(0.7),
        max_tokens: Some(150),
    };
    info!("Sending specific request (model: {})...", specific_request.model);
    match client.chat_completion(specific_request).await {
        Ok(response) => match response.choices.first() {
            Some(choice) => println!("Assistant (specific request): {}", choice.message.content),
            None => println!("Assistant (specific request): No choices returned."),
        },
        Err(e) => eprintln!("Error with specific model request: {}", e),
    }

    // --- Burst of concurrent requests ---
    // All of them are submitted at once; the scheduler decides when each one starts.
    let num_concurrent_tasks: usize = get_env_var(ENV_CONCURRENT_TASKS, 20);
    info!("Spawning {} concurrent tasks...", num_concurrent_tasks);
    let mut tasks = Vec::with_capacity(num_concurrent_tasks);
    for i in 0..num_concurrent_tasks {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let messages = vec![ChatMessage::user(format!(
                "Briefly explain concept #{} for a five-year-old in one sentence.",
                i
            ))];
            match client.chat_completion_with_messages(messages).await {
                Ok(res) => println!(
                    "[Task {}] SUCCESS: {:.80}...",
                    i,
                    res.choices
                        .first()
                        .map(|c| c.message.content.replace('\n', " "))
                        .unwrap_or_default()
                ),
                Err(e) => eprintln!("[Task {}] ERROR: {}", i, e),
            }
        }));
    }

    let snapshot = client.scheduler().snapshot();
    info!(
        queued = snapshot.queued,
        in_flight = snapshot.in_flight,
        "All tasks submitted."
    );

    for (i, task) in tasks.into_iter().enumerate() {
        if let Err(e) = task.await {
            eprintln!("[Main] Task {} join error: {}", i, e);
        }
    }

    let snapshot = client.scheduler().snapshot();
    info!(
        capacity = snapshot.capacity,
        rate = snapshot.rate,
        ewma_latency = ?snapshot.ewma_latency,
        "All example calls completed."
    );
    Ok(())
}
