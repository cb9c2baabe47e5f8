pub mod backend;
pub mod config;
pub mod engine;
pub mod filter;
pub mod i18n;
pub mod matcher;
pub mod report;
pub mod spec;
pub mod types;

// Re-export the message lookups behind the `t!`/`t_args!` macros
pub use crate::i18n::{t, t_with_args};
