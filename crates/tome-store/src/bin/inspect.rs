//! # Sync Store Inspector
//!
//! Prints what the sync engine has persisted: pending events, metadata and
//! any legacy snapshot still waiting for migration.
//!
//! ## Usage
//! ```bash
//! # Inspect the default store
//! cargo run -p tome-store --bin inspect -- --db ./data/sync.db
//!
//! # Only one key
//! cargo run -p tome-store --bin inspect -- --db ./data/sync.db --key tome.sync.queue.v2
//!
//! # Verbose logging
//! RUST_LOG=tome_store=debug cargo run -p tome-store --bin inspect -- --db ./data/sync.db
//! ```

use std::env;

use tome_store::{Database, StoreConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let mut db_path = "./sync.db".to_string();
    let mut only_key: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--db" | "-d" if i + 1 < args.len() => {
                db_path = args[i + 1].clone();
                i += 2;
            }
            "--key" | "-k" if i + 1 < args.len() => {
                only_key = Some(args[i + 1].clone());
                i += 2;
            }
            "--help" | "-h" => {
                println!("Usage: inspect [--db PATH] [--key KEY]");
                return;
            }
            other => {
                error!(arg = %other, "Unknown argument");
                std::process::exit(2);
            }
        }
    }

    // Never create a store just to inspect it
    if !std::path::Path::new(&db_path).exists() {
        error!(path = %db_path, "Store does not exist");
        std::process::exit(1);
    }

    let db = match Database::new(StoreConfig::new(&db_path).run_migrations(false)).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "Failed to open store");
            std::process::exit(1);
        }
    };

    let entries = match db.kv().entries().await {
        Ok(entries) => entries,
        Err(e) => {
            error!(error = %e, "Failed to read store");
            std::process::exit(1);
        }
    };

    info!(path = %db_path, entries = entries.len(), "Store opened");

    for entry in entries {
        if only_key.as_deref().is_some_and(|k| k != entry.key) {
            continue;
        }

        println!("── {} (updated {})", entry.key, entry.updated_at);

        match serde_json::from_str::<serde_json::Value>(&entry.value) {
            Ok(value) => {
                if let Some(events) = value.get("events").and_then(|e| e.as_array()) {
                    println!("   {} pending event(s)", events.len());
                    for ev in events {
                        println!(
                            "   • {}:{} kind={} priority={} retries={} version={}",
                            ev["entity_type"].as_str().unwrap_or("?"),
                            ev["entity_id"].as_str().unwrap_or("?"),
                            ev["kind"].as_str().unwrap_or("?"),
                            ev["priority"].as_str().unwrap_or("?"),
                            ev["retry_count"],
                            ev["version"],
                        );
                    }
                } else {
                    let pretty = serde_json::to_string_pretty(&value).unwrap_or(entry.value);
                    for line in pretty.lines() {
                        println!("   {}", line);
                    }
                }
            }
            Err(_) => println!("   (not JSON) {}", entry.value),
        }
    }

    db.close().await;
}
