//! Command line definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

/// Inspect and edit Bluetooth Mesh network documents.
#[derive(Debug, Parser)]
#[command(name = "btmesh", version, about)]
pub struct Cli {
    /// Network document (JSON)
    #[arg(short, long, env = "BTMESH_NETWORK", default_value = "mesh.json")]
    pub file: PathBuf,

    /// More logging (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// What to do
    #[command(subcommand)]
    pub command: Command,
}

/// Top level commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a new network with one provisioner and a primary network key
    Init {
        /// Network name
        #[arg(long, default_value = "Mesh Network")]
        name: String,
        /// Name of the first provisioner
        #[arg(long, default_value = "btmesh")]
        provisioner: String,
        /// Overwrite an existing document
        #[arg(long)]
        force: bool,
    },
    /// Summary of the network
    Show,
    /// Validate every invariant of the document
    Check,
    /// Write the network as a CBOR snapshot
    Snapshot {
        /// Output path
        output: PathBuf,
    },
    /// Network and application keys
    #[command(subcommand)]
    Keys(KeysCommand),
    /// Provisioners
    #[command(subcommand)]
    Provisioner(ProvisionerCommand),
    /// Nodes
    #[command(subcommand)]
    Node(NodeCommand),
    /// Groups
    #[command(subcommand)]
    Group(GroupCommand),
}

/// Key commands.
#[derive(Debug, Subcommand)]
pub enum KeysCommand {
    /// List keys
    List,
    /// Generate a network key with the next free index
    AddNet {
        /// Key name
        #[arg(long)]
        name: Option<String>,
    },
    /// Generate an application key bound to a network key
    AddApp {
        /// Bound network key index
        #[arg(long, default_value_t = 0)]
        bound: u16,
        /// Key name
        #[arg(long)]
        name: Option<String>,
    },
    /// Remove a network key
    RemoveNet {
        /// Key index
        index: u16,
    },
    /// Remove an application key
    RemoveApp {
        /// Key index
        index: u16,
    },
}

/// Provisioner commands.
#[derive(Debug, Subcommand)]
pub enum ProvisionerCommand {
    /// List provisioners
    List,
    /// Add a provisioner with ranges in the first free space
    Add {
        /// Name
        name: String,
    },
    /// Remove a provisioner
    Remove {
        /// Provisioner UUID
        uuid: Uuid,
    },
    /// Make a provisioner the one this network acts as
    Select {
        /// Provisioner UUID
        uuid: Uuid,
    },
}

/// Node commands.
#[derive(Debug, Subcommand)]
pub enum NodeCommand {
    /// List nodes
    List,
    /// Record a provisioned node
    Add(AddNode),
    /// Remove a node
    Remove {
        /// Node UUID
        uuid: Uuid,
        /// The device has already been reset
        #[arg(long)]
        reset: bool,
    },
    /// Next free unicast address for a node
    NextAddress {
        /// Element count
        #[arg(long, default_value_t = 1)]
        elements: u8,
    },
}

/// Arguments of `node add`.
#[derive(Debug, Args)]
pub struct AddNode {
    /// Name
    pub name: String,
    /// Element count
    #[arg(long, default_value_t = 1)]
    pub elements: u8,
    /// Device UUID; random when omitted
    #[arg(long)]
    pub uuid: Option<Uuid>,
    /// Primary address (hex); the next free address when omitted
    #[arg(long, value_parser = parse_address)]
    pub address: Option<u16>,
    /// Device key (32 hex digits); random when omitted
    #[arg(long)]
    pub device_key: Option<String>,
    /// Network key the node was provisioned with
    #[arg(long, default_value_t = 0)]
    pub net_key: u16,
}

/// Group commands.
#[derive(Debug, Subcommand)]
pub enum GroupCommand {
    /// List groups
    List,
    /// Create a group
    Add {
        /// Name
        name: String,
        /// Group address (hex); the next free one when omitted
        #[arg(long, value_parser = parse_address)]
        address: Option<u16>,
    },
    /// Remove a group
    Remove {
        /// Group address (hex)
        #[arg(value_parser = parse_address)]
        address: u16,
    },
}

/// Parse a 16-bit address written in hex, with or without `0x`.
pub fn parse_address(value: &str) -> Result<u16, String> {
    let digits = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")).unwrap_or(value);
    u16::from_str_radix(digits, 16).map_err(|err| format!("invalid address {value:?}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_parse_with_and_without_prefix() {
        assert_eq!(parse_address("C000"), Ok(0xC000));
        assert_eq!(parse_address("0x0100"), Ok(0x0100));
        assert!(parse_address("xyz").is_err());
        assert!(parse_address("10000").is_err());
    }

    #[test]
    fn command_line_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
