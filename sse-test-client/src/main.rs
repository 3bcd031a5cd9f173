use anyhow::Result;
use clap::Parser;
use colored::*;

mod api_client;
mod output;
mod scenarios;
mod sse_client;

use api_client::ApiClient;
use output::print_test_summary;
use scenarios::Prefixes;

#[derive(Parser)]
#[command(name = "sse-test-client")]
#[command(about = "SSE Integration Testing Tool")]
struct Cli {
    /// Base URL of the server (e.g., http://localhost:8080)
    #[arg(long)]
    base_url: String,

    /// Path prefix the server exposes pub/sub channels under
    #[arg(long, default_value = "/pubsub")]
    pubsub_prefix: String,

    /// Path prefix the server exposes streams under
    #[arg(long, default_value = "/stream")]
    stream_prefix: String,

    /// Test scenario to run
    #[arg(long, value_enum)]
    scenario: ScenarioChoice,

    /// Enable verbose output
    #[arg(long, short)]
    verbose: bool,
}

#[derive(clap::ValueEnum, Clone)]
enum ScenarioChoice {
    /// Publish to a channel with two listeners attached
    PubsubRoundTrip,
    /// Append a form entry to a stream with a listener attached
    StreamRoundTrip,
    /// Reconnect to a stream with Last-Event-ID
    StreamResume,
    /// Run every scenario
    All,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    }

    println!("{}", "=== SETUP PHASE ===".bright_white().bold());

    let base_url = cli.base_url.trim_end_matches('/').to_string();
    let client = reqwest::Client::new();

    println!("{} Checking server health...", "→".blue());
    let health = client.get(format!("{}/health", base_url)).send().await?;
    if !health.status().is_success() {
        anyhow::bail!("Server at {} is not healthy: {}", base_url, health.status());
    }
    println!("{} Server is healthy", "✓".green());

    let api_client = ApiClient::new(client, base_url.clone());
    let prefixes = Prefixes {
        pubsub: cli.pubsub_prefix,
        stream: cli.stream_prefix,
    };

    println!("\n{}", "=== TEST PHASE ===".bright_white().bold());

    let mut results = Vec::new();

    match cli.scenario {
        ScenarioChoice::PubsubRoundTrip => {
            results.push(scenarios::test_pubsub_round_trip(&base_url, &prefixes, &api_client).await);
        }
        ScenarioChoice::StreamRoundTrip => {
            results.push(scenarios::test_stream_round_trip(&base_url, &prefixes, &api_client).await);
        }
        ScenarioChoice::StreamResume => {
            results.push(scenarios::test_stream_resume(&base_url, &prefixes, &api_client).await);
        }
        ScenarioChoice::All => {
            results.push(scenarios::test_pubsub_round_trip(&base_url, &prefixes, &api_client).await);
            results.push(scenarios::test_stream_round_trip(&base_url, &prefixes, &api_client).await);
            results.push(scenarios::test_stream_resume(&base_url, &prefixes, &api_client).await);
        }
    }

    // Print summary
    println!("\n{}", "=== RESULTS ===".bright_white().bold());
    print_test_summary(&results);

    let all_passed = results.iter().all(|r| r.passed);

    if all_passed {
        println!("\n{}", "All tests passed! ✓".bright_green().bold());
    } else {
        println!("\n{}", "Some tests failed! ✗".bright_red().bold());
    }

    std::process::exit(if all_passed { 0 } else { 1 });
}
