// src/cli/handlers/cookies.rs

use crate::{
    cli::{args::CookiesArgs, handlers::commons},
    core::memory::MemoryStore,
};
use anyhow::{Context, Result};
use clap::Parser;
use colored::*;

/// The main handler for the `cookies` command.
/// Lists the Permanent memory slots persisted in a cookie jar, or clears the jar.
pub fn handle(args: Vec<String>) -> Result<()> {
    let cookies_args = CookiesArgs::try_parse_from(&args)?;
    let mut jar = commons::open_cookie_jar(cookies_args.cookies.as_deref())?;

    if cookies_args.clear {
        jar.clear()
            .with_context(|| format!("Failed to clear '{}'", jar.path().display()))?;
        println!("{} '{}'", "Cleared".green(), jar.path().display());
        return Ok(());
    }

    let config = commons::load_config(cookies_args.config.as_deref())?;
    let location = jar.path().display().to_string();
    let mut store = MemoryStore::new(Box::new(jar), config.persistence);
    let restored = store
        .restore()
        .with_context(|| format!("Cookie jar '{}' holds a corrupt index", location))?;

    println!("{} {} slot(s) from '{}'", "Restored".green(), restored, location);
    let slots = store
        .iter()
        .map(|(name, slot)| (name.clone(), slot.clone()))
        .collect();
    commons::print_memory(&slots);
    Ok(())
}
