use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use serac::upload::DEFAULT_PART_SIZE;

#[derive(Parser)]
#[command(name = "Serac")]
#[command(about = "Streaming archive upload to Amazon Glacier")]
#[command(author, version, long_about = None)]
pub struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Upload a file (or stdin) as a new archive
    Upload {
        /// File to upload; reads stdin when omitted
        file: Option<PathBuf>,

        /// Vault to store the archive in, overriding the config
        #[arg(short, long)]
        vault: Option<String>,

        /// Archive description; defaults to the file name
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Abort an interrupted multipart upload
    Abort {
        /// The upload id to abort
        upload_id: String,

        /// Vault the upload belongs to, overriding the config
        #[arg(short, long)]
        vault: Option<String>,
    },
}

// Configuration
// Credentials come from the standard environment variables instead:
// https://aws.amazon.com/blogs/security/a-new-and-standardized-way-to-manage-credentials-in-the-aws-sdks/
#[derive(Deserialize, Debug)]
pub struct Config {
    pub region: String,
    pub vault: String,

    #[serde(default = "default_part_size_mib")]
    pub part_size_mib: u64,

    /// Glacier-compatible endpoint other than AWS (testing, proxies)
    pub endpoint: Option<String>,
}

fn default_part_size_mib() -> u64 {
    DEFAULT_PART_SIZE >> 20
}

impl Config {
    pub fn part_size(&self) -> u64 {
        self.part_size_mib << 20
    }

    pub fn endpoint(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://glacier.{}.amazonaws.com", self.region),
        }
    }
}
