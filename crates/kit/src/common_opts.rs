//! Common CLI options shared across commands

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported disk image formats
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Raw disk image format
    Raw,
    /// QEMU Copy On Write 2 format
    Qcow2,
}

impl ImageFormat {
    /// Get the string representation for qemu tools
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output format options for reporting commands
#[derive(Parser, Debug, Clone, Default)]
pub struct OutputOpts {
    /// Output as structured JSON instead of human-readable text
    #[clap(long)]
    pub json: bool,
}
