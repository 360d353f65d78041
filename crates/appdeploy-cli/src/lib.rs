//! appdeploy command-line support
//!
//! The binary lives in `main.rs`; configuration discovery and argument
//! parsers are kept here so they can be tested on their own.

pub mod args;
pub mod config;
