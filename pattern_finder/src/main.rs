use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::AsyncReadExt;

use pattern_finder::search::{cancel_pair, HttpCatalog};
use pattern_finder::{PatternSearch, SearchRunRequest, ServiceConfig};

/// One search job read from stdin.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    dataset_id: String,
    #[serde(default)]
    authorization: Option<String>,
    request: SearchRunRequest,
}

#[tokio::main]
async fn main() -> Result<()> {
    common::log_setup::setup_logging("info", "logs")?;

    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("reading job from stdin")?;
    let job: Job = serde_json::from_str(&input).context("parsing job JSON")?;

    let config = ServiceConfig::from_env();
    tracing::info!(
        api_base_url = %config.api_base_url,
        results_dir = %config.results_dir.display(),
        dataset_id = %job.dataset_id,
        "Starting pattern search"
    );

    let catalog = HttpCatalog::new(&config)?;
    let search = PatternSearch::new(catalog, config);

    let (cancel, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let response = search
        .run(&job.dataset_id, job.request, job.authorization.as_deref(), &signal)
        .await?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
