//! Outgoing mesh messages.
//!
//! A [`MeshMessage`] is an access layer message plus what the transport needs
//! to know about it: which key protects it and which response, if any,
//! completes it. Messages are values; the transport wraps each one in a
//! [`super::Transaction`] when it is sent.

use bytes::Bytes;
use btmesh_proto::{
    Opcode, ProtocolError,
    opcode::{config, generic},
};

use crate::model::{ApplicationKey, KeyIndex};

/// Response that completes an acknowledged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExpectedResponse {
    /// Opcode of the response
    pub opcode: Opcode,
    /// Offset of a status octet in the response parameters. A non-zero
    /// status there fails the transaction with an incompatible response.
    pub status_offset: Option<usize>,
}

impl ExpectedResponse {
    /// Response without a status field.
    pub const fn new(opcode: Opcode) -> Self {
        Self { opcode, status_offset: None }
    }

    /// Response whose first parameter octet is a status code.
    pub const fn with_status(opcode: Opcode) -> Self {
        Self { opcode, status_offset: Some(0) }
    }
}

/// How a message is protected and completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// SIG model message, application key, no response
    GenericUnacknowledged {
        /// Application key index
        app_key: KeyIndex,
    },
    /// SIG model message, application key, completed by a response
    GenericAcknowledged {
        /// Application key index
        app_key: KeyIndex,
        /// Expected response
        response: ExpectedResponse,
    },
    /// Vendor model message, application key, no response
    VendorUnacknowledged {
        /// Application key index
        app_key: KeyIndex,
    },
    /// Vendor model message, application key, completed by a response
    VendorAcknowledged {
        /// Application key index
        app_key: KeyIndex,
        /// Expected response
        response: ExpectedResponse,
    },
    /// Configuration message, protected with the destination's device key
    Configuration {
        /// Expected response; `None` for fire-and-forget configuration
        response: Option<ExpectedResponse>,
    },
}

/// Marker for the kind of a message, for callers that only need to branch on
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageState {
    /// Unacknowledged SIG model message
    GenericUnacknowledged,
    /// Acknowledged SIG model message
    GenericAcknowledged,
    /// Unacknowledged vendor model message
    VendorUnacknowledged,
    /// Acknowledged vendor model message
    VendorAcknowledged,
    /// Configuration message
    Configuration,
}

/// An access layer message ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshMessage {
    kind: MessageKind,
    opcode: Opcode,
    parameters: Bytes,
}

impl MeshMessage {
    /// Unacknowledged SIG model message.
    pub fn generic(opcode: Opcode, parameters: impl Into<Bytes>, app_key: KeyIndex) -> Self {
        Self {
            kind: MessageKind::GenericUnacknowledged { app_key },
            opcode,
            parameters: parameters.into(),
        }
    }

    /// Acknowledged SIG model message.
    pub fn generic_acknowledged(
        opcode: Opcode,
        parameters: impl Into<Bytes>,
        app_key: KeyIndex,
        response: ExpectedResponse,
    ) -> Self {
        Self {
            kind: MessageKind::GenericAcknowledged { app_key, response },
            opcode,
            parameters: parameters.into(),
        }
    }

    /// Unacknowledged vendor model message.
    pub fn vendor(
        opcode: u8,
        company_id: u16,
        parameters: impl Into<Bytes>,
        app_key: KeyIndex,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: MessageKind::VendorUnacknowledged { app_key },
            opcode: Opcode::vendor(opcode, company_id)?,
            parameters: parameters.into(),
        })
    }

    /// Acknowledged vendor model message. The response opcode belongs to the
    /// same company.
    pub fn vendor_acknowledged(
        opcode: u8,
        company_id: u16,
        parameters: impl Into<Bytes>,
        app_key: KeyIndex,
        response_opcode: u8,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: MessageKind::VendorAcknowledged {
                app_key,
                response: ExpectedResponse::new(Opcode::vendor(response_opcode, company_id)?),
            },
            opcode: Opcode::vendor(opcode, company_id)?,
            parameters: parameters.into(),
        })
    }

    /// Configuration message, encrypted with the destination's device key.
    pub fn configuration(
        opcode: Opcode,
        parameters: impl Into<Bytes>,
        response: Option<ExpectedResponse>,
    ) -> Self {
        Self { kind: MessageKind::Configuration { response }, opcode, parameters: parameters.into() }
    }

    /// Generic OnOff Get.
    pub fn generic_onoff_get(app_key: KeyIndex) -> Self {
        Self::generic_acknowledged(
            generic::ONOFF_GET,
            Bytes::new(),
            app_key,
            ExpectedResponse::new(generic::ONOFF_STATUS),
        )
    }

    /// Generic OnOff Set, acknowledged.
    pub fn generic_onoff_set(on: bool, tid: u8, app_key: KeyIndex) -> Self {
        Self::generic_acknowledged(
            generic::ONOFF_SET,
            vec![u8::from(on), tid],
            app_key,
            ExpectedResponse::new(generic::ONOFF_STATUS),
        )
    }

    /// Generic OnOff Set Unacknowledged.
    pub fn generic_onoff_set_unacknowledged(on: bool, tid: u8, app_key: KeyIndex) -> Self {
        Self::generic(generic::ONOFF_SET_UNACKNOWLEDGED, vec![u8::from(on), tid], app_key)
    }

    /// Config Composition Data Get.
    pub fn config_composition_data_get(page: u8) -> Self {
        Self::configuration(
            config::COMPOSITION_DATA_GET,
            vec![page],
            Some(ExpectedResponse::new(config::COMPOSITION_DATA_STATUS)),
        )
    }

    /// Config AppKey Add: hand `app_key` to a node. Twenty bytes, so it
    /// always travels segmented.
    pub fn config_app_key_add(app_key: &ApplicationKey) -> Self {
        let mut parameters = pack_key_indexes(app_key.bound_net_key, app_key.index).to_vec();
        parameters.extend_from_slice(&app_key.key);
        Self::configuration(
            config::APPKEY_ADD,
            parameters,
            Some(ExpectedResponse::with_status(config::APPKEY_STATUS)),
        )
    }

    /// Config AppKey Delete.
    pub fn config_app_key_delete(net_key: KeyIndex, app_key: KeyIndex) -> Self {
        Self::configuration(
            config::APPKEY_DELETE,
            pack_key_indexes(net_key, app_key).to_vec(),
            Some(ExpectedResponse::with_status(config::APPKEY_STATUS)),
        )
    }

    /// Config Model App Bind. `model_id` is a SIG model id, or
    /// `company_id << 16 | model_id` for a vendor model.
    pub fn config_model_app_bind(
        element_address: u16,
        app_key: KeyIndex,
        model_id: u32,
        vendor: bool,
    ) -> Self {
        let mut parameters = Vec::with_capacity(8);
        parameters.extend_from_slice(&element_address.to_le_bytes());
        parameters.extend_from_slice(&(app_key & 0x0FFF).to_le_bytes());
        if vendor {
            parameters.extend_from_slice(&((model_id >> 16) as u16).to_le_bytes());
        }
        parameters.extend_from_slice(&(model_id as u16).to_le_bytes());
        Self::configuration(
            config::MODEL_APP_BIND,
            parameters,
            Some(ExpectedResponse::with_status(config::MODEL_APP_STATUS)),
        )
    }

    /// Config Default TTL Get.
    pub fn config_default_ttl_get() -> Self {
        Self::configuration(
            config::DEFAULT_TTL_GET,
            Bytes::new(),
            Some(ExpectedResponse::new(config::DEFAULT_TTL_STATUS)),
        )
    }

    /// Config Node Reset. The node forgets every key after answering.
    pub fn config_node_reset() -> Self {
        Self::configuration(
            config::NODE_RESET,
            Bytes::new(),
            Some(ExpectedResponse::new(config::NODE_RESET_STATUS)),
        )
    }

    /// Message kind.
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    /// Kind marker.
    pub fn state(&self) -> MessageState {
        match self.kind {
            MessageKind::GenericUnacknowledged { .. } => MessageState::GenericUnacknowledged,
            MessageKind::GenericAcknowledged { .. } => MessageState::GenericAcknowledged,
            MessageKind::VendorUnacknowledged { .. } => MessageState::VendorUnacknowledged,
            MessageKind::VendorAcknowledged { .. } => MessageState::VendorAcknowledged,
            MessageKind::Configuration { .. } => MessageState::Configuration,
        }
    }

    /// Opcode.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Parameters.
    pub fn parameters(&self) -> &Bytes {
        &self.parameters
    }

    /// Application key index; `None` for device key messages.
    pub fn app_key(&self) -> Option<KeyIndex> {
        match self.kind {
            MessageKind::GenericUnacknowledged { app_key }
            | MessageKind::GenericAcknowledged { app_key, .. }
            | MessageKind::VendorUnacknowledged { app_key }
            | MessageKind::VendorAcknowledged { app_key, .. } => Some(app_key),
            MessageKind::Configuration { .. } => None,
        }
    }

    /// Response that completes the message, if it is acknowledged.
    pub fn expected_response(&self) -> Option<ExpectedResponse> {
        match self.kind {
            MessageKind::GenericAcknowledged { response, .. }
            | MessageKind::VendorAcknowledged { response, .. } => Some(response),
            MessageKind::Configuration { response } => response,
            MessageKind::GenericUnacknowledged { .. }
            | MessageKind::VendorUnacknowledged { .. } => None,
        }
    }

    /// True if a response completes the message.
    pub fn is_acknowledged(&self) -> bool {
        self.expected_response().is_some()
    }

    /// Access layer PDU: opcode followed by parameters.
    pub fn access_pdu(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.opcode.len() + self.parameters.len());
        self.opcode.encode(&mut out);
        out.extend_from_slice(&self.parameters);
        out
    }
}

/// Two 12-bit key indexes packed into three octets, little endian.
pub fn pack_key_indexes(first: KeyIndex, second: KeyIndex) -> [u8; 3] {
    let packed = u32::from(first & 0x0FFF) | (u32::from(second & 0x0FFF) << 12);
    let [a, b, c, _] = packed.to_le_bytes();
    [a, b, c]
}

/// Inverse of [`pack_key_indexes`].
pub fn unpack_key_indexes(bytes: [u8; 3]) -> (KeyIndex, KeyIndex) {
    let packed = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]);
    ((packed & 0x0FFF) as KeyIndex, ((packed >> 12) & 0x0FFF) as KeyIndex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_follow_kind() {
        assert_eq!(MeshMessage::generic_onoff_get(0).state(), MessageState::GenericAcknowledged);
        assert_eq!(
            MeshMessage::generic_onoff_set_unacknowledged(true, 1, 0).state(),
            MessageState::GenericUnacknowledged
        );
        assert_eq!(
            MeshMessage::vendor(0x01, 0x0059, vec![1], 0).unwrap().state(),
            MessageState::VendorUnacknowledged
        );
        assert_eq!(
            MeshMessage::vendor_acknowledged(0x01, 0x0059, vec![1], 0, 0x02).unwrap().state(),
            MessageState::VendorAcknowledged
        );
        assert_eq!(MeshMessage::config_node_reset().state(), MessageState::Configuration);
    }

    #[test]
    fn vendor_opcode_must_fit_six_bits() {
        assert!(MeshMessage::vendor(0x40, 0x0059, Bytes::new(), 0).is_err());
    }

    #[test]
    fn access_pdu_starts_with_opcode() {
        let message = MeshMessage::generic_onoff_set(true, 7, 0);
        assert_eq!(message.access_pdu(), vec![0x82, 0x02, 0x01, 0x07]);

        let vendor = MeshMessage::vendor(0x01, 0x0059, vec![0xAA], 0).unwrap();
        assert_eq!(vendor.access_pdu(), vec![0xC1, 0x59, 0x00, 0xAA]);
    }

    #[test]
    fn key_indexes_pack_into_three_octets() {
        // NetKeyIndex 0x456, AppKeyIndex 0x123
        assert_eq!(pack_key_indexes(0x456, 0x123), [0x56, 0x34, 0x12]);
        assert_eq!(unpack_key_indexes([0x56, 0x34, 0x12]), (0x456, 0x123));
    }

    #[test]
    fn app_key_add_carries_key() {
        let key = ApplicationKey::new(1, [0x11; 16], 0);
        let message = MeshMessage::config_app_key_add(&key);
        assert_eq!(message.parameters().len(), 19);
        assert_eq!(&message.parameters()[3..], &[0x11; 16]);
        assert_eq!(
            message.expected_response(),
            Some(ExpectedResponse::with_status(config::APPKEY_STATUS))
        );
    }
}
