//! JSON import and export.
//!
//! The document follows the Mesh Configuration Database layout: mandatory
//! `meshUUID`, `meshName`, `timestamp`, `provisioners` and `netKeys`,
//! optional `appKeys`, `nodes`, `groups`, `scenes`, `$schema`, `id` and
//! `version`. Keys are hex strings, addresses four hex digits, and timestamps
//! `YYYY-MM-DDTHH:MM:SS±HH:MM`.
//!
//! A few fields extend the layout so that a round trip loses nothing the
//! model tracks: `selectedProvisioner` and `ivIndex` at the top level,
//! `sequenceNumber` on nodes, and `globalTtl` plus `sequenceNumber` on
//! provisioners. A provisioner's address is not stored on the provisioner;
//! it is the address of the node sharing its UUID.

use std::collections::BTreeSet;

use btmesh_crypto::Key;
use btmesh_proto::{
    CompositionData, CompositionElement, Features,
    address::{format_address, parse_address},
};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{
    AddressRange, ApplicationKey, Group, GroupAddress, IvIndex, KeyRefreshPhase, MeshNetwork,
    NetworkKey, NetworkState, Node, Provisioner, Scene, Security,
};
use crate::error::ModelError;

/// Timestamp format used throughout the document.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

const SCHEMA: &str = "http://json-schema.org/draft-04/schema#";
const SCHEMA_ID: &str =
    "http://www.bluetooth.com/specifications/assigned-numbers/mesh-profile/cdb-schema.json#";
const SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(rename = "meshUUID")]
    mesh_uuid: String,
    mesh_name: String,
    timestamp: String,
    #[serde(default)]
    partial: bool,
    provisioners: Vec<ProvisionerEntry>,
    net_keys: Vec<NetKeyEntry>,
    #[serde(default)]
    app_keys: Vec<AppKeyEntry>,
    #[serde(default)]
    nodes: Vec<NodeEntry>,
    #[serde(default)]
    groups: Vec<GroupEntry>,
    #[serde(default)]
    scenes: Vec<SceneEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    selected_provisioner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iv_index: Option<IvIndexEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IvIndexEntry {
    index: u32,
    #[serde(default)]
    update_active: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetKeyEntry {
    name: String,
    index: u16,
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    old_key: Option<String>,
    #[serde(default)]
    phase: u8,
    #[serde(default = "secure")]
    min_security: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppKeyEntry {
    name: String,
    index: u16,
    bound_net_key: u16,
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    old_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionerEntry {
    provisioner_name: String,
    #[serde(rename = "UUID")]
    uuid: String,
    #[serde(default)]
    allocated_unicast_range: Vec<AddressRangeEntry>,
    #[serde(default)]
    allocated_group_range: Vec<AddressRangeEntry>,
    #[serde(default)]
    allocated_scene_range: Vec<SceneRangeEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    global_ttl: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sequence_number: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressRangeEntry {
    low_address: String,
    high_address: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SceneRangeEntry {
    first_scene: String,
    last_scene: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeEntry {
    #[serde(rename = "UUID")]
    uuid: String,
    #[serde(default)]
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_key: Option<String>,
    unicast_address: String,
    #[serde(default = "secure")]
    security: String,
    #[serde(default)]
    config_complete: bool,
    #[serde(default)]
    net_keys: Vec<NodeKeyEntry>,
    #[serde(default)]
    app_keys: Vec<NodeKeyEntry>,
    #[serde(default)]
    elements: Vec<ElementEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    crpl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    features: Option<FeaturesEntry>,
    #[serde(default)]
    excluded: bool,
    #[serde(rename = "defaultTTL", default, skip_serializing_if = "Option::is_none")]
    default_ttl: Option<u8>,
    #[serde(default)]
    sequence_number: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeKeyEntry {
    index: u16,
    #[serde(default)]
    updated: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ElementEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    index: u8,
    #[serde(default = "zero_location")]
    location: String,
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelEntry {
    model_id: String,
    #[serde(default)]
    bind: Vec<u16>,
    #[serde(default)]
    subscribe: Vec<String>,
}

/// Feature states: 0 disabled, 1 enabled, 2 unsupported.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeaturesEntry {
    #[serde(default = "unsupported")]
    relay: u8,
    #[serde(default = "unsupported")]
    proxy: u8,
    #[serde(default = "unsupported")]
    friend: u8,
    #[serde(default = "unsupported")]
    low_power: u8,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupEntry {
    name: String,
    address: String,
    #[serde(default = "zero_location")]
    parent_address: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SceneEntry {
    name: String,
    #[serde(default)]
    addresses: Vec<String>,
    number: String,
}

fn secure() -> String {
    "secure".to_owned()
}

fn zero_location() -> String {
    "0000".to_owned()
}

const fn unsupported() -> u8 {
    2
}

fn malformed(what: impl Into<String>) -> ModelError {
    ModelError::MalformedDocument(what.into())
}

fn format_timestamp(timestamp: &DateTime<FixedOffset>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(text: &str) -> Result<DateTime<FixedOffset>, ModelError> {
    DateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(text))
        .map_err(|_| malformed(format!("invalid timestamp {text:?}")))
}

fn format_uuid(uuid: Uuid) -> String {
    uuid.simple().to_string().to_uppercase()
}

fn parse_uuid(text: &str) -> Result<Uuid, ModelError> {
    Uuid::parse_str(text).map_err(|_| malformed(format!("invalid UUID {text:?}")))
}

fn parse_key(text: &str) -> Result<Key, ModelError> {
    let bytes = hex::decode(text).map_err(|_| malformed(format!("invalid key {text:?}")))?;
    bytes.try_into().map_err(|_| malformed(format!("key {text:?} is not 16 bytes")))
}

fn parse_hex16(text: &str) -> Result<u16, ModelError> {
    parse_address(text).map_err(|err| malformed(err.to_string()))
}

fn parse_security(text: &str) -> Result<Security, ModelError> {
    match text {
        "secure" => Ok(Security::Secure),
        "insecure" => Ok(Security::Insecure),
        other => Err(malformed(format!("unknown security level {other:?}"))),
    }
}

const fn security_name(security: Security) -> &'static str {
    match security {
        Security::Secure => "secure",
        Security::Insecure => "insecure",
    }
}

fn parse_group_address(text: &str) -> Result<GroupAddress, ModelError> {
    if text.len() == 32 {
        Ok(GroupAddress::from_label(parse_uuid(text)?))
    } else {
        Ok(GroupAddress::Group(parse_hex16(text)?))
    }
}

fn format_group_address(address: &GroupAddress) -> String {
    match address {
        GroupAddress::Group(address) => format_address(*address),
        GroupAddress::Virtual { label, .. } => format_uuid(*label),
    }
}

fn ranges_out(ranges: &[AddressRange]) -> Vec<AddressRangeEntry> {
    ranges
        .iter()
        .map(|r| AddressRangeEntry {
            low_address: format_address(r.low),
            high_address: format_address(r.high),
        })
        .collect()
}

fn ranges_in(entries: &[AddressRangeEntry]) -> Result<Vec<AddressRange>, ModelError> {
    entries
        .iter()
        .map(|e| Ok(AddressRange::new(parse_hex16(&e.low_address)?, parse_hex16(&e.high_address)?)))
        .collect()
}

fn features_out(features: Features) -> FeaturesEntry {
    let state = |flag| if features.contains(flag) { 1 } else { 2 };
    FeaturesEntry {
        relay: state(Features::RELAY),
        proxy: state(Features::PROXY),
        friend: state(Features::FRIEND),
        low_power: state(Features::LOW_POWER),
    }
}

fn features_in(entry: &FeaturesEntry) -> Features {
    let mut features = Features::empty();
    for (state, flag) in [
        (entry.relay, Features::RELAY),
        (entry.proxy, Features::PROXY),
        (entry.friend, Features::FRIEND),
        (entry.low_power, Features::LOW_POWER),
    ] {
        if state != 2 {
            features |= flag;
        }
    }
    features
}

fn node_out(node: &Node) -> NodeEntry {
    let elements = (0..node.element_count)
        .map(|index| {
            let element = node.composition.as_ref().and_then(|c| c.elements.get(usize::from(index)));
            let models = element
                .map(|e| {
                    e.sig_models
                        .iter()
                        .map(|m| format!("{m:04X}"))
                        .chain(e.vendor_models.iter().map(|(cid, m)| format!("{cid:04X}{m:04X}")))
                        .map(|model_id| ModelEntry { model_id, bind: Vec::new(), subscribe: Vec::new() })
                        .collect()
                })
                .unwrap_or_default();
            ElementEntry {
                name: None,
                index,
                location: format!("{:04X}", element.map_or(0, |e| e.location)),
                models,
            }
        })
        .collect();
    let composition = node.composition.as_ref();
    NodeEntry {
        uuid: format_uuid(node.uuid),
        name: node.name.clone(),
        device_key: node.device_key.map(hex::encode_upper),
        unicast_address: format_address(node.unicast_address),
        security: secure(),
        config_complete: node.config_complete,
        net_keys: node.net_keys.iter().map(|&index| NodeKeyEntry { index, updated: false }).collect(),
        app_keys: node.app_keys.iter().map(|&index| NodeKeyEntry { index, updated: false }).collect(),
        elements,
        cid: composition.map(|c| format!("{:04X}", c.cid)),
        pid: composition.map(|c| format!("{:04X}", c.pid)),
        vid: composition.map(|c| format!("{:04X}", c.vid)),
        crpl: composition.map(|c| format!("{:04X}", c.crpl)),
        features: composition.map(|c| features_out(c.features)),
        excluded: node.excluded,
        default_ttl: node.ttl,
        sequence_number: node.sequence_number,
    }
}

fn node_in(entry: &NodeEntry) -> Result<Node, ModelError> {
    let element_count = u8::try_from(entry.elements.len().max(1))
        .map_err(|_| malformed(format!("node {} has too many elements", entry.uuid)))?;
    let mut node = Node::new(
        parse_uuid(&entry.uuid)?,
        entry.name.clone(),
        parse_hex16(&entry.unicast_address)?,
        element_count,
    );
    node.device_key = entry.device_key.as_deref().map(parse_key).transpose()?;
    node.net_keys = entry.net_keys.iter().map(|k| k.index).collect::<BTreeSet<_>>();
    node.app_keys = entry.app_keys.iter().map(|k| k.index).collect::<BTreeSet<_>>();
    node.sequence_number = entry.sequence_number;
    node.config_complete = entry.config_complete;
    node.excluded = entry.excluded;
    node.ttl = entry.default_ttl;

    if let (Some(cid), Some(pid), Some(vid), Some(crpl)) =
        (&entry.cid, &entry.pid, &entry.vid, &entry.crpl)
    {
        let mut elements = Vec::with_capacity(entry.elements.len());
        for element in &entry.elements {
            let mut sig_models = Vec::new();
            let mut vendor_models = Vec::new();
            for model in &element.models {
                let id = u32::from_str_radix(&model.model_id, 16)
                    .map_err(|_| malformed(format!("invalid model id {:?}", model.model_id)))?;
                match model.model_id.len() {
                    4 => sig_models.push(id as u16),
                    8 => vendor_models.push(((id >> 16) as u16, id as u16)),
                    _ => return Err(malformed(format!("invalid model id {:?}", model.model_id))),
                }
            }
            elements.push(CompositionElement {
                location: parse_hex16(&element.location)?,
                sig_models,
                vendor_models,
            });
        }
        node.composition = Some(CompositionData {
            cid: parse_hex16(cid)?,
            pid: parse_hex16(pid)?,
            vid: parse_hex16(vid)?,
            crpl: parse_hex16(crpl)?,
            features: entry.features.as_ref().map_or(Features::empty(), features_in),
            elements,
        });
    }
    Ok(node)
}

impl MeshNetwork {
    /// Export the network as a JSON document.
    pub fn to_json(&self) -> Result<String, ModelError> {
        let state = &self.state;
        let document = Document {
            schema: Some(SCHEMA.to_owned()),
            id: Some(SCHEMA_ID.to_owned()),
            version: Some(SCHEMA_VERSION.to_owned()),
            mesh_uuid: format_uuid(state.mesh_uuid),
            mesh_name: state.mesh_name.clone(),
            timestamp: format_timestamp(&state.timestamp),
            partial: false,
            provisioners: state
                .provisioners
                .iter()
                .map(|p| ProvisionerEntry {
                    provisioner_name: p.name.clone(),
                    uuid: format_uuid(p.uuid),
                    allocated_unicast_range: ranges_out(&p.unicast_ranges),
                    allocated_group_range: ranges_out(&p.group_ranges),
                    allocated_scene_range: p
                        .scene_ranges
                        .iter()
                        .map(|r| SceneRangeEntry {
                            first_scene: format_address(r.low),
                            last_scene: format_address(r.high),
                        })
                        .collect(),
                    global_ttl: Some(p.global_ttl),
                    sequence_number: Some(p.sequence_number).filter(|&seq| seq > 0),
                })
                .collect(),
            net_keys: state
                .net_keys
                .iter()
                .map(|k| NetKeyEntry {
                    name: k.name.clone(),
                    index: k.index,
                    key: hex::encode_upper(k.key),
                    old_key: k.old_key.map(hex::encode_upper),
                    phase: k.phase.as_u8(),
                    min_security: security_name(k.min_security).to_owned(),
                    timestamp: Some(format_timestamp(&k.timestamp)),
                })
                .collect(),
            app_keys: state
                .app_keys
                .iter()
                .map(|k| AppKeyEntry {
                    name: k.name.clone(),
                    index: k.index,
                    bound_net_key: k.bound_net_key,
                    key: hex::encode_upper(k.key),
                    old_key: k.old_key.map(hex::encode_upper),
                })
                .collect(),
            nodes: state.nodes.iter().map(node_out).collect(),
            groups: state
                .groups
                .iter()
                .map(|g| GroupEntry {
                    name: g.name.clone(),
                    address: format_group_address(&g.address),
                    parent_address: g
                        .parent
                        .as_ref()
                        .map_or_else(zero_location, format_group_address),
                })
                .collect(),
            scenes: state
                .scenes
                .iter()
                .map(|s| SceneEntry {
                    name: s.name.clone(),
                    addresses: s.addresses.iter().map(|&a| format_address(a)).collect(),
                    number: format_address(s.number),
                })
                .collect(),
            selected_provisioner: state.selected_provisioner.map(format_uuid),
            iv_index: Some(IvIndexEntry {
                index: state.iv_index.index,
                update_active: state.iv_index.update_active,
            }),
        };
        serde_json::to_string_pretty(&document).map_err(|err| malformed(err.to_string()))
    }

    /// Import a network from a JSON document.
    ///
    /// Missing mandatory fields and unparsable values fail with
    /// [`ModelError::MalformedDocument`]. A document that parses but breaks a
    /// model invariant fails with the error of that invariant.
    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        let document: Document = serde_json::from_str(json).map_err(|err| malformed(err.to_string()))?;
        let timestamp = parse_timestamp(&document.timestamp)?;
        let mut state =
            NetworkState::new(parse_uuid(&document.mesh_uuid)?, document.mesh_name, timestamp);

        for entry in &document.net_keys {
            let phase = KeyRefreshPhase::from_u8(entry.phase)
                .ok_or_else(|| malformed(format!("invalid key refresh phase {}", entry.phase)))?;
            state.net_keys.push(NetworkKey {
                index: entry.index,
                name: entry.name.clone(),
                key: parse_key(&entry.key)?,
                old_key: entry.old_key.as_deref().map(parse_key).transpose()?,
                phase,
                min_security: parse_security(&entry.min_security)?,
                timestamp: entry.timestamp.as_deref().map(parse_timestamp).transpose()?.unwrap_or(timestamp),
            });
        }
        for entry in &document.app_keys {
            state.app_keys.push(ApplicationKey {
                index: entry.index,
                name: entry.name.clone(),
                key: parse_key(&entry.key)?,
                old_key: entry.old_key.as_deref().map(parse_key).transpose()?,
                bound_net_key: entry.bound_net_key,
            });
        }

        state.nodes = document.nodes.iter().map(node_in).collect::<Result<_, _>>()?;
        for entry in &document.provisioners {
            let uuid = parse_uuid(&entry.uuid)?;
            let scene_ranges = entry
                .allocated_scene_range
                .iter()
                .map(|e| Ok(AddressRange::new(parse_hex16(&e.first_scene)?, parse_hex16(&e.last_scene)?)))
                .collect::<Result<_, ModelError>>()?;
            let mut provisioner = Provisioner::new(
                uuid,
                entry.provisioner_name.clone(),
                ranges_in(&entry.allocated_unicast_range)?,
                ranges_in(&entry.allocated_group_range)?,
                scene_ranges,
            );
            let shadow = state.nodes.iter().find(|node| node.uuid == uuid);
            provisioner.address = shadow.map(|node| node.unicast_address);
            if let Some(ttl) = entry.global_ttl.or(shadow.and_then(|node| node.ttl)) {
                provisioner.global_ttl = ttl;
            }
            provisioner.sequence_number = entry.sequence_number.unwrap_or_default();
            state.provisioners.push(provisioner);
        }

        for entry in &document.groups {
            let parent = match entry.parent_address.as_str() {
                "0000" => None,
                text => Some(parse_group_address(text)?),
            };
            state.groups.push(Group {
                address: parse_group_address(&entry.address)?,
                parent,
                name: entry.name.clone(),
            });
        }
        for entry in &document.scenes {
            state.scenes.push(Scene {
                number: parse_hex16(&entry.number)?,
                addresses: entry.addresses.iter().map(|a| parse_hex16(a)).collect::<Result<_, _>>()?,
                name: entry.name.clone(),
            });
        }

        state.selected_provisioner =
            document.selected_provisioner.as_deref().map(parse_uuid).transpose()?;
        if let Some(iv) = document.iv_index {
            state.iv_index = IvIndex { index: iv.index, update_active: iv.update_active };
        }
        let next = state
            .nodes
            .iter()
            .map(|node| node.last_element() + 1)
            .max()
            .unwrap_or(1);
        state.next_unicast = u16::try_from(next).unwrap_or(u16::MAX);

        let network = Self::from_state(state)?;
        debug!(
            mesh = %network.mesh_uuid(),
            nodes = network.nodes().len(),
            "network imported"
        );
        Ok(network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_use_offset_format() {
        let parsed = parse_timestamp("2018-12-23T11:45:22-08:00").unwrap();
        assert_eq!(format_timestamp(&parsed), "2018-12-23T11:45:22-08:00");
        assert!(parse_timestamp("2018-12-23T11:45:22Z").is_ok());
        assert!(parse_timestamp("23/12/2018").is_err());
    }

    #[test]
    fn uuids_accept_both_spellings() {
        let simple = parse_uuid("70CF7C9732A345B691494810D2E9CBF4").unwrap();
        let hyphenated = parse_uuid("70cf7c97-32a3-45b6-9149-4810d2e9cbf4").unwrap();
        assert_eq!(simple, hyphenated);
        assert_eq!(format_uuid(simple), "70CF7C9732A345B691494810D2E9CBF4");
    }

    #[test]
    fn virtual_group_addresses_use_label() {
        let label = "0073E7E4D8B9440FAF8415DF4C56C0E1";
        let address = parse_group_address(label).unwrap();
        assert_eq!(address.address(), 0xB529);
        assert_eq!(format_group_address(&address), label);
        assert_eq!(parse_group_address("C001").unwrap(), GroupAddress::Group(0xC001));
    }

    #[test]
    fn features_round_trip() {
        let features = Features::RELAY | Features::PROXY;
        assert_eq!(features_in(&features_out(features)), features);
    }

    #[test]
    fn keys_must_be_sixteen_bytes() {
        assert!(parse_key("00112233445566778899AABBCCDDEEFF").is_ok());
        assert!(matches!(parse_key("0011"), Err(ModelError::MalformedDocument(_))));
        assert!(matches!(parse_key("zz"), Err(ModelError::MalformedDocument(_))));
    }
}
