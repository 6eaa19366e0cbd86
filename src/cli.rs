use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// bootprov - first-boot provisioner for application servers
#[derive(Parser)]
#[command(name = "bootprov")]
#[command(about = "Turn a freshly booted VM into a running application server")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: log every command and the unit file instead of
    /// changing the host.
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute the provisioning pipeline
    Run {
        /// Path to the provisioning config (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Write the structured run report (JSON) to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
    /// Print the ordered steps and their preconditions
    Plan {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print the service unit file the run would install
    RenderUnit {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print an equivalent user-data shell script
    RenderUserData {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Write the default configuration to a file
    InitConfig {
        /// Destination path
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Parse an existing unit file and print it as a service definition (JSON)
    ParseUnit {
        /// Path to a `.service` file
        path: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
