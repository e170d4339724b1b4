// src/commands/cache.rs
//! Download cache commands

use super::home;
use anyhow::Result;
use tsuku::download::DownloadCache;

fn open_cache() -> Result<DownloadCache> {
    Ok(DownloadCache::new(home()?.download_cache_dir()))
}

/// Show cache location and usage
pub fn cmd_cache_info(list_entries: bool) -> Result<()> {
    let cache = open_cache()?;
    let entries = cache.entries()?;
    let total: u64 = entries.iter().map(|e| e.size).sum();

    println!("Cache: {}", cache.dir().display());
    println!("Entries: {}", entries.len());
    println!("Size: {} bytes", total);

    if list_entries {
        for entry in &entries {
            let url = entry.meta.as_ref().map(|m| m.url.as_str()).unwrap_or("-");
            println!("  {}  {:>10}  {}", entry.key, entry.size, url);
        }
    }
    Ok(())
}

/// Remove every cached artifact
pub fn cmd_cache_clear() -> Result<()> {
    let removed = open_cache()?.clear()?;
    println!("Removed {} cached artifact(s)", removed);
    Ok(())
}
