// src/cli/handlers/mod.rs

// One module per CLI command.

pub mod boot;
pub mod commons;
pub mod cookies;
pub mod parse;
pub mod render;
