use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use checkpoint::JsonFileStore;
use engine::{IndexingEngine, RunFailure, RunSummary};
use github::GithubFollowersClient;
use indexer::{plan, CredentialPool, IndexerError, RunStats};
use tokio_util::sync::CancellationToken;

use crate::{input, paths, Cli};

/// Index every repository in the input list that the checkpoint does not yet hold.
pub async fn execute(cli: Cli) -> Result<()> {
    // 1. Load input and checkpoint
    let repositories = input::load_repositories(&cli.repositories).await?;
    let checkpoint_path = checkpoint_path(&cli).await;
    let store = Arc::new(
        JsonFileStore::open(&checkpoint_path)
            .await
            .with_context(|| format!("Failed to open checkpoint: {}", checkpoint_path.display()))?,
    );

    // 2. Plan and report
    let work = plan(&repositories, store.as_ref());
    print_stats(&work.stats);
    if work.units.is_empty() {
        println!("Nothing to index.");
        return Ok(());
    }

    // 3. Wire the engine
    let pool = Arc::new(CredentialPool::new(cli.access_tokens())?);
    let api = Arc::new(GithubFollowersClient::new(cli.client_config())?);
    let engine = IndexingEngine::new(cli.indexer_config(), api, Arc::clone(&pool), store.clone())?;
    engine
        .check_credentials()
        .await
        .context("No usable GitHub token")?;
    println!("Usable tokens:     {}", pool.usable_count());

    // 4. Run until done, halted, or interrupted
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; stopping after in-flight writes");
            on_signal.cancel();
        }
    });

    match engine.run(work, cancel).await {
        Ok(summary) => {
            print_summary(&summary, None, store.path());
            Ok(())
        }
        Err(RunFailure { error, summary }) => {
            print_summary(&summary, Some(&error), store.path());
            Err(error.into())
        }
    }
}

/// The explicit path if one was given, otherwise the derived one.
async fn checkpoint_path(cli: &Cli) -> PathBuf {
    if let Some(path) = &cli.followers {
        return path.clone();
    }

    let derived = paths::derive_checkpoint_path(&cli.repositories);
    if tokio::fs::try_exists(&derived).await.unwrap_or(false) {
        tracing::warn!(
            path = %derived.display(),
            "Checkpoint file already exists; resuming from it. \
             Pass an explicit output path if this progress belongs to another run"
        );
    }
    derived
}

fn print_stats(stats: &RunStats) {
    println!("Repositories:      {}", stats.total);
    println!("  Already indexed: {}", stats.completed);
    println!("  To process:      {}", stats.remaining);
}

fn print_summary(summary: &RunSummary, error: Option<&IndexerError>, checkpoint: &Path) {
    match (error, summary.halt) {
        (Some(error), _) => println!("Run {} aborted: {error}.", summary.run_id),
        (None, Some(reason)) => println!("Run {} halted: {reason}.", summary.run_id),
        (None, None) => println!("Run {} completed.", summary.run_id),
    }
    println!("  Indexed:         {}", summary.completed);
    println!("  Not found:       {}", summary.not_found);
    if summary.skipped > 0 {
        println!("  Duplicates:      {}", summary.skipped);
    }
    println!("  Failed:          {}", summary.failed.len());
    for name in &summary.failed {
        println!("    {name}");
    }
    println!("  Remaining:       {}", summary.unprocessed());
    println!("  Checkpoint:      {}", checkpoint.display());
}
