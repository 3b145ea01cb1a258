//! Cache command - inspect and clean the dependency cache

use crate::cache::{CacheEntry, CacheStore, FsCacheStore};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::{Config, ConfigManager};
use crate::error::RiggerResult;
use crate::ui::{self, UiContext};
use chrono::{Duration, Utc};
use console::style;
use serde::Serialize;
use tracing::debug;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> RiggerResult<()> {
    let store = FsCacheStore::new(ConfigManager::cache_dir_for(config))
        .with_max_age_days(config.cache.max_age_days);

    match args.action {
        CacheAction::List { format } => list_entries(&store, config, format).await,
        CacheAction::Gc { days, dry_run } => gc_entries(&store, config, days, dry_run).await,
        CacheAction::Clear { yes } => clear_entries(&store, yes).await,
    }
}

async fn list_entries(store: &FsCacheStore, config: &Config, format: OutputFormat) -> RiggerResult<()> {
    let mut entries = store.list().await?;
    entries.sort_by(|a, b| a.key.cmp(&b.key));

    if entries.is_empty() && format != OutputFormat::Json {
        println!("No cache entries in {}", store.root().display());
        return Ok(());
    }

    match format {
        OutputFormat::Table => print_entry_table(&entries, config.cache.max_age_days),
        OutputFormat::Json => print_entry_json(&entries)?,
        OutputFormat::Plain => {
            for entry in &entries {
                println!("{}", entry.key);
            }
        }
    }
    Ok(())
}

fn print_entry_table(entries: &[CacheEntry], max_age_days: u32) {
    println!("{:<48} {:>7} {:>10} {:<17}", "KEY", "FILES", "SIZE", "CREATED");
    println!("{}", "-".repeat(86));

    let mut total = 0;
    for entry in entries {
        let created = entry.created_at.format("%Y-%m-%d %H:%M").to_string();
        let created = if max_age_days > 0 && entry.is_older_than(Duration::days(i64::from(max_age_days))) {
            style(format!("{created} (expired)")).dim().to_string()
        } else {
            created
        };
        total += entry.total_size();
        println!(
            "{:<48} {:>7} {:>10} {}",
            entry.key,
            entry.files.len(),
            human_size(entry.total_size()),
            created
        );
    }

    println!();
    println!("Total: {} entr{} ({})", entries.len(), if entries.len() == 1 { "y" } else { "ies" }, human_size(total));
}

fn print_entry_json(entries: &[CacheEntry]) -> RiggerResult<()> {
    #[derive(Serialize)]
    struct EntryJson<'a> {
        key: &'a str,
        roots: &'a [String],
        files: usize,
        size: u64,
        created_at: String,
    }

    let json: Vec<EntryJson<'_>> = entries
        .iter()
        .map(|e| EntryJson {
            key: &e.key,
            roots: &e.roots,
            files: e.files.len(),
            size: e.total_size(),
            created_at: e.created_at.to_rfc3339(),
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

/// Remove entries older than the threshold, then unreferenced blobs
async fn gc_entries(
    store: &FsCacheStore,
    config: &Config,
    days_override: Option<u32>,
    dry_run: bool,
) -> RiggerResult<()> {
    let ctx = UiContext::detect();
    let gc_days = days_override.unwrap_or(config.cache.gc_days);

    if gc_days == 0 {
        println!("Cache GC is disabled (gc_days = 0)");
        return Ok(());
    }

    let age = Duration::days(i64::from(gc_days));
    let stale: Vec<CacheEntry> = store
        .list()
        .await?
        .into_iter()
        .filter(|e| e.is_older_than(age))
        .collect();

    if stale.is_empty() {
        println!("No cache entries older than {} days.", gc_days);
    } else {
        println!("Found {} entr{} older than {} days:", stale.len(), if stale.len() == 1 { "y" } else { "ies" }, gc_days);
        for entry in &stale {
            let age_days = (Utc::now() - entry.created_at).num_days();
            println!("  {} {} ({} days old)", style("•").red(), entry.key, age_days);
        }
    }

    if dry_run {
        println!();
        println!("Dry run - nothing removed.");
        return Ok(());
    }

    for entry in &stale {
        debug!("Removing cache entry {}", entry.key);
        store.remove(&entry.key).await?;
    }
    let (blobs, bytes) = store.prune_blobs().await?;

    ui::step_ok_detail(
        &ctx,
        &format!("Removed {} entr{}", stale.len(), if stale.len() == 1 { "y" } else { "ies" }),
        &format!("{} blobs, {}", blobs, human_size(bytes)),
    );
    Ok(())
}

async fn clear_entries(store: &FsCacheStore, yes: bool) -> RiggerResult<()> {
    let ctx = UiContext::detect().with_auto_yes(yes);
    let entries = store.list().await?;

    if entries.is_empty() {
        println!("No cache entries to clear.");
        return Ok(());
    }

    println!("This will remove {} cache entr{}:", entries.len(), if entries.len() == 1 { "y" } else { "ies" });
    for entry in &entries {
        println!("  {} {}", style("•").red(), entry.key);
    }
    println!();

    if !ui::confirm(&ctx, "Are you sure?", false).await? {
        ui::step_warn_hint(&ctx, "Aborted", "Pass --yes to clear without a prompt");
        return Ok(());
    }

    for entry in &entries {
        store.remove(&entry.key).await?;
    }
    let (blobs, bytes) = store.prune_blobs().await?;

    ui::step_ok_detail(
        &ctx,
        &format!("Cleared {} entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" }),
        &format!("{} blobs, {}", blobs, human_size(bytes)),
    );
    Ok(())
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
