//! CLI module for Convoy
//!
//! This module provides the command-line interface for Convoy,
//! including argument parsing and subcommand handling.

pub mod run;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Convoy - fan tasks out to many hosts
#[derive(Parser, Debug, Clone)]
#[command(name = "convoy")]
#[command(version)]
#[command(about = "Run configuration-management tasks across many hosts", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(short = 'c', long, global = true, env = "CONVOY_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the tasks in a YAML file
    Run(run::RunArgs),

    /// Check a routing table for redirect cycles
    #[command(name = "validate-routing")]
    ValidateRouting(ValidateRoutingArgs),
}

/// Arguments for validate-routing command
#[derive(Parser, Debug, Clone)]
pub struct ValidateRoutingArgs {
    /// Routing file (YAML)
    pub file: PathBuf,
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Get the effective verbosity level (0-3)
    pub fn verbosity(&self) -> u8 {
        self.verbose.min(3)
    }
}
