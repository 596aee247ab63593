use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::autosave::AutosaveConfig;
use crate::executor::RetryPolicy;

/// Tuning for a storage engine instance.
///
/// Constructor-injected; there is no global configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Primary document file name inside the connected folder. The name and
    /// the payload schema are owned by the domain layer; the engine treats
    /// the payload as an opaque JSON blob.
    pub document_name: String,
    pub autosave: AutosaveConfig,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            document_name: "cases.json".to_string(),
            autosave: AutosaveConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Configuration for the casetrack-storage-local inspector.
#[derive(Parser, Debug, Clone)]
#[command(name = "casetrack-storage-local")]
#[command(about = "Inspect and exercise a casetrack folder store")]
pub struct Cli {
    /// Folder holding the casetrack document
    #[arg(long, env = "CASETRACK_DIR")]
    pub dir: PathBuf,

    /// Document file name inside the folder
    #[arg(long, default_value = "cases.json", env = "CASETRACK_DOC")]
    pub document_name: String,

    /// Directory for the stored handle record (defaults to the platform
    /// data dir)
    #[arg(long, env = "CASETRACK_HANDLE_DIR")]
    pub handle_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Get the effective handle-store directory.
    pub fn effective_handle_dir(&self) -> PathBuf {
        self.handle_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("casetrack")
        })
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the current engine status as JSON
    Status,
    /// List files in the connected folder
    List,
    /// Print the document to stdout
    Export,
    /// Replace the document with a file's contents (takes a backup first)
    Import {
        /// JSON file to import
        file: PathBuf,
    },
    /// Stream external change events until Ctrl-C
    Watch,
}
