// src/core/mod.rs

pub mod binder;
pub mod bootstrap;
pub mod config;
pub mod console;
pub mod engine;
pub mod expression;
pub mod memory;
pub mod parser;
pub mod paths;
pub mod registry;
pub mod scheduler;
pub mod template;
