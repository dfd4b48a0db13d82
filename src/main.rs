//! Segment a turn into renderable blocks.
//!
//! With no arguments, reads a turn as JSON from stdin. Given a thread id,
//! hydrates that thread from the database instead. Prints the blocks as JSON.

use std::io::Read;

use anyhow::Context;
use serde::Serialize;
use uuid::Uuid;

use lens_assist::config::AgentConfig;
use lens_assist::conversation::{FileEntry, Turn, hydrate_turns};
use lens_assist::parser::{Block, segment};
use lens_assist::store::{LibSqlStore, Store};

#[derive(Serialize)]
struct SegmentedTurn {
    turn_id: Uuid,
    blocks: Vec<Block>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = AgentConfig::from_env();

    let output = match std::env::args().nth(1) {
        Some(arg) => {
            let thread_id = Uuid::parse_str(&arg)
                .with_context(|| format!("'{arg}' is not a thread id"))?;
            segment_thread(&config, thread_id).await?
        }
        None => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("Failed to read stdin")?;
            let turn: Turn = serde_json::from_str(&input).context("Invalid turn JSON")?;
            vec![SegmentedTurn {
                turn_id: turn.id,
                blocks: segment(&turn, &[]),
            }]
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn segment_thread(
    config: &AgentConfig,
    thread_id: Uuid,
) -> anyhow::Result<Vec<SegmentedTurn>> {
    let store = LibSqlStore::new_local(&config.db_path)
        .await
        .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?;

    let thread = store
        .get_thread(thread_id)
        .await?
        .with_context(|| format!("Thread {thread_id} not found"))?;
    tracing::info!(thread_id = %thread.id, title = %thread.title, "Segmenting thread");

    let files: Vec<FileEntry> = store
        .list_files()
        .await?
        .into_iter()
        .filter(|f| f.visible_in(thread_id))
        .collect();
    let turns = hydrate_turns(thread_id, store.list_contents(thread_id).await?);

    Ok(turns
        .iter()
        .map(|turn| SegmentedTurn {
            turn_id: turn.id,
            blocks: segment(turn, &files),
        })
        .collect())
}
