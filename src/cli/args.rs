//! Command line argument parsing.
//!
//! Operator-facing subcommands: run one gateway operation against the
//! configured upstream (`categorize`, `rewrite`, `search`, `generate`,
//! `title`), inspect usage (`stats`, `quota`) or clear the response cache
//! (`cache-clear`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "prensa-gateway")]
#[command(author = "Prensa Platform Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "AI usage gateway for the prensa news platform")]
pub struct Args {
    /// TOML configuration file; skips the discovery hierarchy
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Keep usage and quota state in memory instead of the data directory
    #[arg(long, global = true)]
    pub ephemeral: bool,

    /// Data directory for usage logs and quota records
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// User id charged for the operation; omit for an untracked call
    #[arg(long, global = true)]
    pub user: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Assign a category to an article
    Categorize {
        title: String,
        content: String,
        #[arg(default_value = "")]
        url: String,
    },
    /// Rewrite an article in a neutral style
    Rewrite { title: String, content: String },
    /// Answer a news query
    Search { query: String },
    /// Free-form text generation
    Generate {
        prompt: String,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Generate a headline and summary for an article
    Title { content: String },
    /// Usage aggregates and cache counters
    Stats {
        /// Days to include in the rollup
        #[arg(long, default_value_t = 1)]
        days: u32,
    },
    /// Show (or override) a user's daily quota
    Quota {
        user_id: String,
        /// New daily limit for the user
        #[arg(long)]
        set_limit: Option<u32>,
    },
    /// Drop every cached response
    CacheClear,
}
