//! Node features and Composition Data page 0.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

bitflags! {
    /// Features supported by a node, as reported in Composition Data.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Features: u16 {
        /// Relay feature
        const RELAY = 0x0001;
        /// Proxy feature
        const PROXY = 0x0002;
        /// Friend feature
        const FRIEND = 0x0004;
        /// Low power feature
        const LOW_POWER = 0x0008;
    }
}

/// One element in Composition Data page 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositionElement {
    /// GATT namespace location descriptor
    pub location: u16,
    /// SIG model identifiers
    pub sig_models: Vec<u16>,
    /// Vendor model identifiers as `(company_id, model_id)`
    pub vendor_models: Vec<(u16, u16)>,
}

/// Composition Data page 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositionData {
    /// Company identifier
    pub cid: u16,
    /// Product identifier
    pub pid: u16,
    /// Version identifier
    pub vid: u16,
    /// Minimum replay protection list size
    pub crpl: u16,
    /// Supported features
    pub features: Features,
    /// Elements, primary first
    pub elements: Vec<CompositionElement>,
}

fn read_u16(bytes: &[u8], at: usize) -> Result<u16> {
    match bytes.get(at..at + 2) {
        Some(&[lo, hi]) => Ok(u16::from_le_bytes([lo, hi])),
        _ => Err(ProtocolError::Truncated { expected: at + 2, actual: bytes.len() }),
    }
}

impl CompositionData {
    /// Parse the parameters of a Config Composition Data Status message.
    ///
    /// The first octet is the page number; only page 0 is understood.
    pub fn decode_status(params: &[u8]) -> Result<Self> {
        let (_page, data) =
            params.split_first().ok_or(ProtocolError::Truncated { expected: 1, actual: 0 })?;
        Self::decode(data)
    }

    /// Parse page 0 (little endian fields).
    pub fn decode(data: &[u8]) -> Result<Self> {
        let cid = read_u16(data, 0)?;
        let pid = read_u16(data, 2)?;
        let vid = read_u16(data, 4)?;
        let crpl = read_u16(data, 6)?;
        let features = Features::from_bits_truncate(read_u16(data, 8)?);

        let mut elements = Vec::new();
        let mut at = 10;
        while at < data.len() {
            let location = read_u16(data, at)?;
            let num_s = usize::from(*data.get(at + 2).ok_or(ProtocolError::Truncated {
                expected: at + 3,
                actual: data.len(),
            })?);
            let num_v = usize::from(*data.get(at + 3).ok_or(ProtocolError::Truncated {
                expected: at + 4,
                actual: data.len(),
            })?);
            at += 4;

            let sig_models =
                (0..num_s).map(|i| read_u16(data, at + i * 2)).collect::<Result<Vec<_>>>()?;
            at += num_s * 2;

            let vendor_models = (0..num_v)
                .map(|i| Ok((read_u16(data, at + i * 4)?, read_u16(data, at + i * 4 + 2)?)))
                .collect::<Result<Vec<_>>>()?;
            at += num_v * 4;

            elements.push(CompositionElement { location, sig_models, vendor_models });
        }

        Ok(Self { cid, pid, vid, crpl, features, elements })
    }

    /// Encode page 0.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10 + self.elements.len() * 8);
        for field in [self.cid, self.pid, self.vid, self.crpl, self.features.bits()] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        for element in &self.elements {
            out.extend_from_slice(&element.location.to_le_bytes());
            out.push(element.sig_models.len() as u8);
            out.push(element.vendor_models.len() as u8);
            for model in &element.sig_models {
                out.extend_from_slice(&model.to_le_bytes());
            }
            for (company, model) in &element.vendor_models {
                out.extend_from_slice(&company.to_le_bytes());
                out.extend_from_slice(&model.to_le_bytes());
            }
        }
        out
    }
}
