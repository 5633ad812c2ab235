//! Followers indexer CLI entry point.
//!
//! This binary is the composition root:
//!
//! 1. **Parse configuration** from arguments and environment (`clap`).
//! 2. **Wire observability** (see [`logging`]).
//! 3. **Construct infrastructure**: the GitHub client, the JSON checkpoint
//!    store, and the credential pool, injected into an `IndexingEngine`.
//! 4. **Run** the work plan, cancelling on Ctrl-C, and report the outcome.
//!
//! Exits 0 when the run finishes or halts cleanly, 1 on a fatal error.

mod input;
mod logging;
mod paths;
mod run;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use github::GithubClientConfig;
use indexer::{AccessToken, IndexerConfig, RetryConfig, WaitPolicy};

use crate::logging::LogFormat;

#[derive(Parser, Debug)]
#[command(
    name = "followers-indexer",
    version,
    about = "Resumable indexer of GitHub followers for a list of repositories"
)]
pub(crate) struct Cli {
    /// JSON array of repository records (each with a `name`)
    repositories: PathBuf,

    /// Checkpoint file (default: input name with a `Followers` suffix)
    followers: Option<PathBuf>,

    /// Comma-separated GitHub access tokens
    #[arg(
        long,
        env = "GITHUB_TOKENS",
        value_delimiter = ',',
        hide_env_values = true
    )]
    tokens: Vec<String>,

    /// Wait for the earliest quota reset instead of halting when every token is spent
    #[arg(long)]
    wait_for_reset: bool,

    /// Longest single wait for a quota reset, in seconds
    #[arg(long, default_value_t = 3600)]
    max_wait: u64,

    /// Fetch attempts per repository before giving up on it for this run
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,

    /// Maximum number of repositories fetched at once
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// GitHub API root
    #[arg(long, env = "GITHUB_API_URL", default_value = github::DEFAULT_API_URL)]
    api_url: String,

    /// Followers requested per page (1-100)
    #[arg(long, default_value_t = github::MAX_PER_PAGE)]
    per_page: u32,

    /// Per-request timeout, in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

impl Cli {
    fn indexer_config(&self) -> IndexerConfig {
        let wait = if self.wait_for_reset {
            WaitPolicy::WaitForReset {
                max_wait: Duration::from_secs(self.max_wait),
            }
        } else {
            WaitPolicy::Halt
        };

        IndexerConfig {
            retry: RetryConfig {
                max_attempts: self.max_attempts,
                ..RetryConfig::default()
            },
            wait,
            concurrency: self.concurrency,
            ..IndexerConfig::default()
        }
    }

    fn client_config(&self) -> GithubClientConfig {
        GithubClientConfig {
            api_url: self.api_url.clone(),
            per_page: self.per_page,
            timeout: Duration::from_secs(self.timeout),
        }
    }

    /// Configured tokens with blanks dropped.
    fn access_tokens(&self) -> Vec<AccessToken> {
        self.tokens
            .iter()
            .filter_map(|t| AccessToken::new(t.as_str()))
            .collect()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let guard = logging::init(&cli.log_level, cli.log_format)?;
    let result = run::execute(cli).await;
    if let Err(error) = &result {
        tracing::error!(error = %format!("{error:#}"), "Indexing failed");
    }
    guard.shutdown();

    result
}
