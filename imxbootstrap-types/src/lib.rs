#![doc = include_str!("../README.md")]
#![allow(clippy::multiple_crate_versions)]

extern crate alloc;

use alloc::fmt;
use std::{io, path::PathBuf};

/// Representation of the architecture we build the boot stack for
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, clap::ValueEnum)]
#[clap(rename_all = "lower")]
pub enum Architecture {
    /// ARM's AARCH32 Architecture
    Arm,

    /// ARM's AARCH64 Architecture
    #[default]
    Arm64,
}

impl Architecture {
    /// Creates our architecture enum from the Linux `ARCH` name
    ///
    /// # Errors
    ///
    /// If the given architecture is unknown
    pub fn from_kernel_str(s: &str) -> Result<Self, ImxBootstrapError> {
        Ok(match s {
            "arm64" | "aarch64" => Self::Arm64,
            "arm" => Self::Arm,
            _ => {
                return Err(ImxBootstrapError::Config(format!(
                    "Unknown architecture: {s}"
                )))
            }
        })
    }

    /// Returns the name the Linux and U-Boot build systems expect in `ARCH`
    #[must_use]
    pub fn as_kernel_str(self) -> &'static str {
        match self {
            Self::Arm => "arm",
            Self::Arm64 => "arm64",
        }
    }

    /// Returns the usual GNU cross-compiler prefix for this architecture
    #[must_use]
    pub fn default_cross_compile(self) -> &'static str {
        match self {
            Self::Arm => "arm-linux-gnueabihf-",
            Self::Arm64 => "aarch64-linux-gnu-",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_kernel_str())
    }
}

/// Our Error Type
#[derive(thiserror::Error, Debug)]
pub enum ImxBootstrapError {
    /// An error has occurred when accessing the local filesystem or files
    #[error("I/O Error")]
    Io(#[from] io::Error),

    /// An error has occurred when parsing JSON data
    #[error("JSON Parsing Failure")]
    Json(#[from] serde_json::Error),

    /// An error has occurred when parsing the environment file
    #[error("Environment File Format Error")]
    Toml(#[from] toml::de::Error),

    /// An external tool exited with a failure status
    #[error("Command `{command}` failed ({status})")]
    Command {
        /// The command line that was executed
        command: String,

        /// Description of how the command terminated
        status: String,
    },

    /// An external tool reported success but didn't produce its output
    #[error("Expected artifact {} is missing", .0.display())]
    MissingArtifact(PathBuf),

    /// The configuration or the command line is invalid
    #[error("Configuration Error: {0}")]
    Config(String),

    /// An unknown error occurred
    #[error("Error: {0}")]
    Custom(String),
}
