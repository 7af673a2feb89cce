//! Load generator for Cloud Logging.
//!
//! Fires `--requests` concurrent `entries:write` calls, each carrying a
//! random number of entries. Every entry gets a unique `jsonPayload.id`,
//! ordered within this writer, and the ids of accepted writes are printed
//! to stdout (logs go to stderr). A harness can then check a `lilo` store
//! for completeness.
//!
//! Usage:
//!   LILO_GCP_PROJECT=my-project cargo run --release --bin write_many -- \
//!       --log-id test-01 --requests 10 --min-entries 1 --max-entries 100
//!
//! Several writers started with the same `--start-at` produce ids that sort
//! roughly in write order across processes.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use futures_util::future::join_all;
use rand::Rng;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{info, warn};

use lilo::auth::{GcloudTokenSource, StaticTokenSource, TokenCache, TokenSource};
use lilo::config::{api_base_from_env, IngestTuning};
use lilo::gcp::{log_name, write::LogWriter, LoggingClient};

#[derive(Parser, Debug)]
#[command(name = "write_many")]
#[command(about = "Write uniquely identified test entries to Cloud Logging")]
struct Args {
    /// Log id, written to projects/<project>/logs/<log-id>
    #[arg(long, default_value = "lilo-write-many")]
    log_id: String,

    /// GCP project id
    #[arg(long, env = "LILO_GCP_PROJECT")]
    project: String,

    /// Number of concurrent entries:write requests
    #[arg(long, default_value = "1")]
    requests: usize,

    #[arg(long, default_value = "1")]
    min_entries: usize,

    #[arg(long, default_value = "100")]
    max_entries: usize,

    /// RFC3339 instant to wait for before writing
    #[arg(long)]
    start_at: Option<String>,
}

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// `s<secs>_n<nanos>_id<seq>_<writer>` ids, increasing within one writer.
struct IdGenerator {
    writer_id: String,
    started: Instant,
    seq: u64,
}

impl IdGenerator {
    fn new(writer_id: String) -> Self {
        Self {
            writer_id,
            started: Instant::now(),
            seq: 0,
        }
    }

    fn random_writer_id<R: Rng>(rng: &mut R) -> String {
        (0..7)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect()
    }

    fn next_id(&mut self) -> String {
        let elapsed = self.started.elapsed();
        self.seq += 1;
        format!(
            "s{:04}_n{:09}_id{:06}_{}",
            elapsed.as_secs(),
            elapsed.subsec_nanos(),
            self.seq,
            self.writer_id
        )
    }
}

fn build_entries(ids: &mut IdGenerator, project: &str, count: usize) -> Vec<Value> {
    (0..count)
        .map(|_| {
            json!({
                "jsonPayload": { "id": ids.next_id() },
                "resource": {
                    "type": "global",
                    "labels": { "project_id": project }
                }
            })
        })
        .collect()
}

fn entry_id(entry: &Value) -> Option<&str> {
    entry.pointer("/jsonPayload/id").and_then(Value::as_str)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "write_many=info,lilo=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if args.min_entries == 0 || args.min_entries > args.max_entries {
        bail!("--min-entries must be >= 1 and <= --max-entries");
    }

    if let Some(start_at) = &args.start_at {
        let start = DateTime::parse_from_rfc3339(start_at)
            .with_context(|| format!("--start-at is not RFC3339: {}", start_at))?
            .with_timezone(&Utc);
        if let Ok(wait) = (start - Utc::now()).to_std() {
            info!(wait_ms = wait.as_millis() as u64, "Waiting for start time");
            tokio::time::sleep(wait).await;
        }
    }

    let tuning = IngestTuning::from_env();
    let source: Box<dyn TokenSource> = match std::env::var("LILO_ACCESS_TOKEN") {
        Ok(token) if !token.trim().is_empty() => Box::new(StaticTokenSource::new(token)),
        _ => Box::new(GcloudTokenSource::from_env().with_timeout(tuning.token_command_timeout)),
    };
    let tokens = TokenCache::new(source, tuning.token_lifetime);
    // Fetch once up front so concurrent writers share one token.
    tokens.get_token().await?;

    let writer = LogWriter::new(LoggingClient::new(api_base_from_env())?);
    let target = log_name(&args.project, &args.log_id);

    let mut rng = rand::thread_rng();
    let mut ids = IdGenerator::new(IdGenerator::random_writer_id(&mut rng));
    let batches: Vec<Vec<Value>> = (0..args.requests)
        .map(|_| {
            let count = rng.gen_range(args.min_entries..=args.max_entries);
            build_entries(&mut ids, &args.project, count)
        })
        .collect();

    info!(
        writer_id = %ids.writer_id,
        log_name = %target,
        requests = batches.len(),
        "Writing"
    );

    let writer = &writer;
    let tokens = &tokens;
    let target = target.as_str();
    let results = join_all(batches.iter().map(|entries| async move {
        let started = Instant::now();
        let ok = writer.write_entries(tokens, target, entries).await;
        (entries, ok, started.elapsed())
    }))
    .await;

    let mut accepted = 0usize;
    for (entries, ok, elapsed) in results {
        match ok {
            Ok(true) => {
                accepted += 1;
                for id in entries.iter().filter_map(entry_id) {
                    println!("{}", id);
                }
            }
            Ok(false) => warn!(entries = entries.len(), "Write rejected"),
            Err(e) => warn!(entries = entries.len(), ms = elapsed.as_millis() as u64, "Write failed: {:#}", e),
        }
    }

    info!(accepted, total = args.requests, "Done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_ordered_and_padded() {
        let mut ids = IdGenerator::new("abcdefg".to_string());
        let a = ids.next_id();
        let b = ids.next_id();

        assert!(a < b);
        assert!(a.ends_with("_id000001_abcdefg"));
        assert!(b.ends_with("_id000002_abcdefg"));
        assert!(a.starts_with("s0000_n"));
    }

    #[test]
    fn writer_id_is_seven_lowercase_letters() {
        let id = IdGenerator::random_writer_id(&mut rand::thread_rng());
        assert_eq!(id.len(), 7);
        assert!(id.bytes().all(|b| b.is_ascii_lowercase()));
    }

    #[test]
    fn entries_carry_ids_and_global_resource() {
        let mut ids = IdGenerator::new("writerx".to_string());
        let entries = build_entries(&mut ids, "demo", 3);

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0]["resource"]["labels"]["project_id"], "demo");
        let collected: Vec<&str> = entries.iter().filter_map(entry_id).collect();
        assert_eq!(collected.len(), 3);
        assert!(collected.windows(2).all(|w| w[0] < w[1]));
    }
}
