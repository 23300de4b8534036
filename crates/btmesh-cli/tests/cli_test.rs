//! Commands against documents in a temporary directory.

use std::{fs, path::Path};

use btmesh_cli::{Cli, CliError, error::exit_code, run};
use btmesh_core::{MeshNetwork, ModelError};
use clap::Parser;
use tempfile::TempDir;

fn btmesh(file: &Path, args: &[&str]) -> Result<String, CliError> {
    let path = file.to_str().unwrap();
    let cli = Cli::try_parse_from(["btmesh", "--file", path].iter().chain(args)).unwrap();
    let mut out = Vec::new();
    run(&cli, &mut out)?;
    Ok(String::from_utf8(out).unwrap())
}

fn initialized() -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("mesh.json");
    btmesh(&file, &["init", "--name", "Home", "--provisioner", "laptop"]).unwrap();
    (dir, file)
}

fn reload(file: &Path) -> MeshNetwork {
    MeshNetwork::from_json(&fs::read_to_string(file).unwrap()).unwrap()
}

#[test]
fn init_creates_a_usable_network() {
    let (_dir, file) = initialized();
    let network = reload(&file);

    assert_eq!(network.mesh_name(), "Home");
    assert_eq!(network.net_keys().len(), 1);
    assert_eq!(network.selected_provisioner().unwrap().name, "laptop");
    assert_eq!(network.selected_provisioner().unwrap().address, Some(0x0001));

    let show = btmesh(&file, &["show"]).unwrap();
    assert!(show.contains("name:         Home"));
    assert!(show.contains("acting as:    laptop"));
    assert!(show.contains("nodes:        0"));
}

#[test]
fn init_refuses_to_overwrite() {
    let (_dir, file) = initialized();
    let err = btmesh(&file, &["init"]).unwrap_err();
    assert!(matches!(err, CliError::Exists(_)));
    btmesh(&file, &["init", "--force", "--name", "Office"]).unwrap();
    assert_eq!(reload(&file).mesh_name(), "Office");
}

#[test]
fn keys_follow_model_rules() {
    let (_dir, file) = initialized();

    btmesh(&file, &["keys", "add-app", "--bound", "0", "--name", "Lights"]).unwrap();
    btmesh(&file, &["keys", "add-net"]).unwrap();
    let list = btmesh(&file, &["keys", "list"]).unwrap();
    assert_eq!(list.lines().count(), 3);
    assert!(list.lines().any(|line| line.starts_with("app    0") && line.ends_with("Lights")));

    let err = btmesh(&file, &["keys", "remove-net", "0"]).unwrap_err();
    assert!(matches!(err, CliError::Model(ModelError::KeyBound { net_key: 0, app_key: 0 })));

    btmesh(&file, &["keys", "remove-app", "0"]).unwrap();
    btmesh(&file, &["keys", "remove-net", "1"]).unwrap();
    let network = reload(&file);
    assert_eq!(network.net_keys().len(), 1);
    assert!(network.app_keys().is_empty());
}

#[test]
fn nodes_get_consecutive_addresses() {
    let (_dir, file) = initialized();

    let first = btmesh(&file, &["node", "add", "lamp", "--elements", "3"]).unwrap();
    assert!(first.trim_end().ends_with("0002-0004"), "{first}");
    assert_eq!(btmesh(&file, &["node", "next-address", "--elements", "2"]).unwrap(), "0005\n");

    let uuid = reload(&file)
        .nodes()
        .iter()
        .find(|node| node.name == "lamp")
        .map(|node| node.uuid.to_string())
        .unwrap();
    let removed = btmesh(&file, &["node", "remove", &uuid, "--reset"]).unwrap();
    assert!(removed.contains("Reset"));
    // The cursor is rebuilt from the nodes in the document on every load.
    assert_eq!(btmesh(&file, &["node", "next-address"]).unwrap(), "0002\n");

    let err = btmesh(&file, &["node", "add", "switch", "--address", "0001"]).unwrap_err();
    assert!(matches!(err, CliError::Model(ModelError::AddressInUse(0x0001))));
}

#[test]
fn device_key_must_be_sixteen_bytes() {
    let (_dir, file) = initialized();
    let err = btmesh(&file, &["node", "add", "lamp", "--device-key", "00112233"]).unwrap_err();
    assert!(matches!(err, CliError::InvalidDeviceKey(_)));
    assert!(reload(&file).nodes().iter().all(|node| node.name != "lamp"));
}

#[test]
fn groups_and_provisioners() {
    let (_dir, file) = initialized();

    assert_eq!(btmesh(&file, &["group", "add", "Kitchen"]).unwrap(), "group C000\n");
    assert_eq!(btmesh(&file, &["group", "add", "Hall", "--address", "0xC010"]).unwrap(), "group C010\n");
    btmesh(&file, &["group", "remove", "C000"]).unwrap();
    let list = btmesh(&file, &["group", "list"]).unwrap();
    assert_eq!(list, "C010  Hall\n");

    btmesh(&file, &["provisioner", "add", "phone"]).unwrap();
    let network = reload(&file);
    let phone = network.provisioners().iter().find(|p| p.name == "phone").unwrap().uuid;
    btmesh(&file, &["provisioner", "select", &phone.to_string()]).unwrap();
    assert_eq!(reload(&file).selected_provisioner().unwrap().uuid, phone);

    let list = btmesh(&file, &["provisioner", "list"]).unwrap();
    assert!(list.lines().any(|line| line.starts_with('*') && line.contains("phone")));
}

#[test]
fn broken_document_is_reported_with_its_own_exit_code() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("mesh.json");

    fs::write(&file, "{\"meshName\": \"x\"}").unwrap();
    let err = btmesh(&file, &["check"]).unwrap_err();
    assert_eq!(err.exit_code(), exit_code::GENERAL);

    btmesh(&file, &["init", "--force"]).unwrap();
    let mut json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&file).unwrap()).unwrap();
    let key = json["netKeys"][0].clone();
    json["netKeys"].as_array_mut().unwrap().push(key);
    fs::write(&file, json.to_string()).unwrap();

    let err = btmesh(&file, &["check"]).unwrap_err();
    assert!(matches!(err, CliError::Document { source: ModelError::DuplicateKeyIndex(0), .. }));
    assert_eq!(err.exit_code(), exit_code::INVALID_DOCUMENT);
}

#[test]
fn snapshot_restores_the_same_state() {
    let (dir, file) = initialized();
    btmesh(&file, &["node", "add", "lamp"]).unwrap();
    let snapshot = dir.path().join("mesh.cbor");
    btmesh(&file, &["snapshot", snapshot.to_str().unwrap()]).unwrap();

    let restored = MeshNetwork::from_snapshot_bytes(&fs::read(&snapshot).unwrap()).unwrap();
    assert_eq!(restored.state(), reload(&file).state());
}
