use anyhow::{Context, Result};
use wbx_store::DurableStore;

use crate::opts::EnvOpts;

pub fn cmd_list(opts: &EnvOpts) -> Result<()> {
    let store = opts.open_store()?;
    let keys = store.list().context("list store")?;
    if opts.json {
        println!("{}", serde_json::to_string_pretty(&keys)?);
        return Ok(());
    }
    for key in keys {
        println!("{key}");
    }
    Ok(())
}

pub fn cmd_clear(opts: &EnvOpts) -> Result<()> {
    let store = opts.open_store()?;
    let keys = store.list().context("list store")?;
    for key in &keys {
        store.remove(key).with_context(|| format!("remove {key}"))?;
    }
    store.clear_stale_lock()?;
    tracing::info!(removed = keys.len(), "cache cleared");
    println!("removed {} entries", keys.len());
    Ok(())
}

pub fn cmd_unlock(opts: &EnvOpts) -> Result<()> {
    let store = opts.open_store()?;
    if store.clear_stale_lock()? {
        println!("removed stale lock");
    } else {
        println!("store is not locked");
    }
    Ok(())
}
