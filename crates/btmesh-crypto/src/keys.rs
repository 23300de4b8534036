//! Material derived from network keys, application keys and label UUIDs.

use crate::{
    Key,
    toolbox::{aes_cmac, k2, k3, k4, s1},
};

/// Everything the network layer needs from one network key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkKeyMaterial {
    /// 7-bit identifier carried in every network PDU
    pub nid: u8,
    /// Network layer encryption key
    pub encryption_key: Key,
    /// Header obfuscation key
    pub privacy_key: Key,
    /// 64-bit network identifier
    pub network_id: [u8; 8],
}

impl NetworkKeyMaterial {
    /// Derive the master credentials of `net_key`.
    pub fn derive(net_key: &Key) -> Self {
        let k2 = k2(net_key, &[0x00]);
        Self {
            nid: k2.nid,
            encryption_key: k2.encryption_key,
            privacy_key: k2.privacy_key,
            network_id: k3(net_key),
        }
    }
}

/// Application key identifier of `app_key`.
pub fn aid(app_key: &Key) -> u8 {
    k4(app_key)
}

/// Virtual address for a 128-bit label UUID: `0x8000 | (hash mod 0x4000)`.
pub fn virtual_address(label: &[u8; 16]) -> u16 {
    let salt = s1(b"vtad");
    let hash = aes_cmac(&salt, label);
    0x8000 | (u16::from_be_bytes([hash[14], hash[15]]) & 0x3FFF)
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn derives_sample_network_material() {
        let material = NetworkKeyMaterial::derive(&hex!("7dd7364cd842ad18c17c2b820c84c3d6"));
        assert_eq!(material.nid, 0x68);
        assert_eq!(material.encryption_key, hex!("0953fa93e7caac9638f58820220a398e"));
        assert_eq!(material.privacy_key, hex!("8b84eedec100067d670971dd2aa700cf"));
    }

    #[test]
    fn sample_virtual_address() {
        assert_eq!(virtual_address(&hex!("0073e7e4d8b9440faf8415df4c56c0e1")), 0xB529);
    }

    proptest! {
        #[test]
        fn virtual_addresses_stay_in_range(label in any::<[u8; 16]>()) {
            let address = virtual_address(&label);
            prop_assert!((0x8000..=0xBFFF).contains(&address));
        }

        #[test]
        fn aid_fits_six_bits(key in any::<[u8; 16]>()) {
            prop_assert!(aid(&key) <= 0x3F);
        }
    }
}
