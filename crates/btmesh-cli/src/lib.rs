//! `btmesh`: inspect and edit Bluetooth Mesh network documents.
//!
//! The binary is a thin shell over [`run`], which takes the parsed command
//! line and a writer for its output so it can be driven from tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod commands;
pub mod error;

pub use cli::Cli;
pub use commands::run;
pub use error::CliError;
