//! CLI argument parsing for the csv-import-worker binary.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "csv-import-worker", about = "CSV import worker for the company catalog")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the import workers (default if no subcommand given)
    Serve,
}
