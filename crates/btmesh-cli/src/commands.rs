//! Command implementations.
//!
//! Every command loads the document, runs against the network model and,
//! if it changed anything, stamps the modification time and writes the
//! document back. Output goes to the writer the caller passes in.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use btmesh_core::{
    MeshNetwork,
    env::{SystemEnv, random_key, random_uuid},
    model::{AddressRange, ApplicationKey, Group, GroupAddress, NetworkKey, Node},
};
use chrono::{DateTime, FixedOffset, Utc};
use tracing::{debug, info};

use crate::{
    CliError,
    cli::{AddNode, Cli, Command, GroupCommand, KeysCommand, NodeCommand, ProvisionerCommand},
};

/// Run one command.
pub fn run(cli: &Cli, out: &mut dyn Write) -> Result<(), CliError> {
    let path = cli.file.as_path();
    match &cli.command {
        Command::Init { name, provisioner, force } => init(path, name, provisioner, *force, out),
        Command::Show => show(&load(path)?, out),
        Command::Check => {
            let network = load(path)?;
            writeln!(out, "{}: ok", network.mesh_name())?;
            Ok(())
        },
        Command::Snapshot { output } => {
            let bytes = load(path)?.to_snapshot_bytes()?;
            fs::write(output, &bytes).map_err(|source| io_error(output, source))?;
            writeln!(out, "{} bytes written to {}", bytes.len(), output.display())?;
            Ok(())
        },
        Command::Keys(command) => edit(path, out, |network, out| keys(network, command, out)),
        Command::Provisioner(command) => {
            edit(path, out, |network, out| provisioners(network, command, out))
        },
        Command::Node(command) => edit(path, out, |network, out| nodes(network, command, out)),
        Command::Group(command) => edit(path, out, |network, out| groups(network, command, out)),
    }
}

fn io_error(path: &Path, source: std::io::Error) -> CliError {
    CliError::Io { path: path.to_owned(), source }
}

fn now() -> DateTime<FixedOffset> {
    Utc::now().fixed_offset()
}

fn load(path: &Path) -> Result<MeshNetwork, CliError> {
    let json = fs::read_to_string(path).map_err(|source| io_error(path, source))?;
    let network = MeshNetwork::from_json(&json)
        .map_err(|source| CliError::Document { path: path.to_owned(), source })?;
    debug!(path = %path.display(), "document loaded");
    Ok(network)
}

fn save(path: &Path, network: &MeshNetwork) -> Result<(), CliError> {
    let json = network.to_json()?;
    let mut staging = PathBuf::from(path);
    staging.as_mut_os_string().push(".tmp");
    fs::write(&staging, json).map_err(|source| io_error(&staging, source))?;
    fs::rename(&staging, path).map_err(|source| io_error(path, source))?;
    debug!(path = %path.display(), "document saved");
    Ok(())
}

/// Load, apply `command` and save if it reports a change.
fn edit(
    path: &Path,
    out: &mut dyn Write,
    command: impl FnOnce(&mut MeshNetwork, &mut dyn Write) -> Result<bool, CliError>,
) -> Result<(), CliError> {
    let mut network = load(path)?;
    if command(&mut network, out)? {
        network.touch(now())?;
        save(path, &network)?;
    }
    Ok(())
}

fn init(
    path: &Path,
    name: &str,
    provisioner: &str,
    force: bool,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    if path.exists() && !force {
        return Err(CliError::Exists(path.to_owned()));
    }
    let env = SystemEnv;
    let mut network = MeshNetwork::new(name, now(), &env);
    let provisioner = network.create_provisioner(provisioner, &env)?;
    network.create_network_key(&env)?;
    save(path, &network)?;
    info!(uuid = %network.mesh_uuid(), path = %path.display(), "network created");
    writeln!(out, "created {} ({})", network.mesh_name(), network.mesh_uuid())?;
    writeln!(out, "provisioner {} ({})", provisioner.name, provisioner.uuid)?;
    Ok(())
}

fn show(network: &MeshNetwork, out: &mut dyn Write) -> Result<(), CliError> {
    let devices = network.nodes().iter().filter(|n| network.provisioner(n.uuid).is_none()).count();
    let iv = network.iv_index();
    writeln!(out, "name:         {}", network.mesh_name())?;
    writeln!(out, "uuid:         {}", network.mesh_uuid())?;
    writeln!(out, "timestamp:    {}", network.timestamp().to_rfc3339())?;
    writeln!(
        out,
        "iv index:     {}{}",
        iv.index,
        if iv.update_active { " (update in progress)" } else { "" }
    )?;
    writeln!(
        out,
        "acting as:    {}",
        network.selected_provisioner().map_or("-", |p| p.name.as_str())
    )?;
    writeln!(out, "net keys:     {}", network.net_keys().len())?;
    writeln!(out, "app keys:     {}", network.app_keys().len())?;
    writeln!(out, "provisioners: {}", network.provisioners().len())?;
    writeln!(out, "nodes:        {devices}")?;
    writeln!(out, "groups:       {}", network.groups().len())?;
    writeln!(out, "scenes:       {}", network.scenes().len())?;
    Ok(())
}

fn keys(
    network: &mut MeshNetwork,
    command: &KeysCommand,
    out: &mut dyn Write,
) -> Result<bool, CliError> {
    let env = SystemEnv;
    match command {
        KeysCommand::List => {
            for key in network.net_keys() {
                writeln!(
                    out,
                    "net {:>4}  {}  phase {}  {}",
                    key.index,
                    hex::encode_upper(key.key),
                    key.phase.as_u8(),
                    key.name
                )?;
            }
            for key in network.app_keys() {
                writeln!(
                    out,
                    "app {:>4}  {}  bound {}  {}",
                    key.index,
                    hex::encode_upper(key.key),
                    key.bound_net_key,
                    key.name
                )?;
            }
            Ok(false)
        },
        KeysCommand::AddNet { name } => {
            let key = network.create_network_key(&env)?;
            if let Some(name) = name {
                network.update_network_key(NetworkKey { name: name.clone(), ..key.clone() })?;
            }
            writeln!(out, "network key {}", key.index)?;
            Ok(true)
        },
        KeysCommand::AddApp { bound, name } => {
            let key = network.create_app_key(*bound, &env)?;
            if let Some(name) = name {
                network.update_app_key(ApplicationKey { name: name.clone(), ..key.clone() })?;
            }
            writeln!(out, "application key {} bound to {}", key.index, key.bound_net_key)?;
            Ok(true)
        },
        KeysCommand::RemoveNet { index } => {
            network.remove_network_key(*index)?;
            writeln!(out, "removed network key {index}")?;
            Ok(true)
        },
        KeysCommand::RemoveApp { index } => {
            network.remove_app_key(*index)?;
            writeln!(out, "removed application key {index}")?;
            Ok(true)
        },
    }
}

fn join_ranges(ranges: &[AddressRange]) -> String {
    ranges.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

fn provisioners(
    network: &mut MeshNetwork,
    command: &ProvisionerCommand,
    out: &mut dyn Write,
) -> Result<bool, CliError> {
    match command {
        ProvisionerCommand::List => {
            let selected = network.selected_provisioner().map(|p| p.uuid);
            for p in network.provisioners() {
                writeln!(
                    out,
                    "{} {}  {}  address {}  unicast {}  group {}  scene {}",
                    if Some(p.uuid) == selected { '*' } else { ' ' },
                    p.uuid,
                    p.name,
                    p.address.map_or_else(|| "-".to_owned(), |a| format!("{a:04X}")),
                    join_ranges(&p.unicast_ranges),
                    join_ranges(&p.group_ranges),
                    join_ranges(&p.scene_ranges),
                )?;
            }
            Ok(false)
        },
        ProvisionerCommand::Add { name } => {
            let provisioner = network.create_provisioner(name.as_str(), &SystemEnv)?;
            writeln!(out, "provisioner {} ({})", provisioner.name, provisioner.uuid)?;
            Ok(true)
        },
        ProvisionerCommand::Remove { uuid } => {
            let provisioner = network.remove_provisioner(*uuid)?;
            writeln!(out, "removed provisioner {}", provisioner.name)?;
            Ok(true)
        },
        ProvisionerCommand::Select { uuid } => {
            network.select_provisioner(*uuid)?;
            Ok(true)
        },
    }
}

fn parse_device_key(value: &str) -> Result<[u8; 16], CliError> {
    let bytes = hex::decode(value).map_err(|err| CliError::InvalidDeviceKey(err.to_string()))?;
    <[u8; 16]>::try_from(bytes.as_slice())
        .map_err(|_| CliError::InvalidDeviceKey(format!("{} bytes, expected 16", bytes.len())))
}

fn add_node(network: &mut MeshNetwork, args: &AddNode, out: &mut dyn Write) -> Result<(), CliError> {
    let env = SystemEnv;
    let device_key = match &args.device_key {
        Some(value) => parse_device_key(value)?,
        None => random_key(&env),
    };
    let address = match args.address {
        Some(address) => address,
        None => network.next_available_unicast(args.elements)?,
    };
    let uuid = args.uuid.unwrap_or_else(|| random_uuid(&env));

    let mut node = Node::new(uuid, args.name.as_str(), address, args.elements);
    node.device_key = Some(device_key);
    node.net_keys.insert(args.net_key);
    let range = node.element_range();
    network.add_node(node)?;
    writeln!(out, "node {uuid} at {range}")?;
    Ok(())
}

fn nodes(
    network: &mut MeshNetwork,
    command: &NodeCommand,
    out: &mut dyn Write,
) -> Result<bool, CliError> {
    match command {
        NodeCommand::List => {
            for node in network.nodes() {
                let role = if network.provisioner(node.uuid).is_some() { "provisioner" } else { "" };
                writeln!(
                    out,
                    "{}  {}  {}  net {:?}  app {:?} {role}",
                    node.uuid,
                    node.element_range(),
                    node.name,
                    node.net_keys,
                    node.app_keys,
                )?;
            }
            Ok(false)
        },
        NodeCommand::Add(args) => {
            add_node(network, args, out)?;
            Ok(true)
        },
        NodeCommand::Remove { uuid, reset } => {
            let removed = if *reset {
                network.forget_reset_node(*uuid)?
            } else {
                network.remove_node(*uuid)?
            };
            writeln!(out, "removed {} ({:?})", removed.node.name, removed.device)?;
            Ok(true)
        },
        NodeCommand::NextAddress { elements } => {
            writeln!(out, "{:04X}", network.next_available_unicast(*elements)?)?;
            Ok(false)
        },
    }
}

fn groups(
    network: &mut MeshNetwork,
    command: &GroupCommand,
    out: &mut dyn Write,
) -> Result<bool, CliError> {
    match command {
        GroupCommand::List => {
            for group in network.groups() {
                let label = group.address.label().map(|label| format!("  label {label}"));
                let parent = group.parent.map(|p| format!("  parent {:04X}", p.address()));
                writeln!(
                    out,
                    "{:04X}  {}{}{}",
                    group.address.address(),
                    group.name,
                    label.unwrap_or_default(),
                    parent.unwrap_or_default(),
                )?;
            }
            Ok(false)
        },
        GroupCommand::Add { name, address } => {
            let group = match address {
                Some(address) => {
                    let group = Group::new(name.as_str(), GroupAddress::Group(*address));
                    network.add_group(group.clone())?;
                    group
                },
                None => network.create_group(name.as_str())?,
            };
            writeln!(out, "group {:04X}", group.address.address())?;
            Ok(true)
        },
        GroupCommand::Remove { address } => {
            let group = network.remove_group(*address)?;
            writeln!(out, "removed group {}", group.name)?;
            Ok(true)
        },
    }
}
