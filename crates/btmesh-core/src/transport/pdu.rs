//! Upper transport and network layer encryption for the transport.

use btmesh_crypto::{
    Key, MicSize, NetworkKeyMaterial, NetworkNonceKind, encrypt_network_pdu, nonce,
};
use btmesh_proto::NetworkHeader;
use bytes::Bytes;
use uuid::Uuid;

use super::transaction::{AccessKey, ResolvedKeys};
use crate::error::TransportError;

pub(crate) fn mic_size(szmic: bool) -> MicSize {
    if szmic { MicSize::Long } else { MicSize::Short }
}

fn label_aad(label: Option<&Uuid>) -> &[u8] {
    label.map_or(&[][..], |label| label.as_bytes().as_slice())
}

/// Nonce of an upper transport PDU. `device` selects the device nonce.
pub(crate) fn access_nonce(
    device: bool,
    szmic: bool,
    seq_auth: u32,
    src: u16,
    dst: u16,
    iv_index: u32,
) -> nonce::Nonce {
    if device {
        nonce::device(szmic, seq_auth, src, dst, iv_index)
    } else {
        nonce::application(szmic, seq_auth, src, dst, iv_index)
    }
}

/// Encrypt an access PDU into an upper transport PDU.
pub(crate) fn encrypt_upper(
    keys: &ResolvedKeys,
    access: &[u8],
    szmic: bool,
    seq_auth: u32,
    src: u16,
    dst: u16,
    iv_index: u32,
) -> Result<Vec<u8>, TransportError> {
    let device = matches!(keys.access, AccessKey::Device { .. });
    let nonce = access_nonce(device, szmic, seq_auth, src, dst, iv_index);
    Ok(btmesh_crypto::encrypt(
        keys.access.key(),
        &nonce,
        access,
        label_aad(keys.label.as_ref()),
        mic_size(szmic),
    )?)
}

/// Try to decrypt an upper transport PDU with one key.
pub(crate) fn decrypt_upper(
    key: &Key,
    nonce: &nonce::Nonce,
    upper: &[u8],
    label: Option<&Uuid>,
    szmic: bool,
) -> Option<Vec<u8>> {
    btmesh_crypto::decrypt(key, nonce, upper, label_aad(label), mic_size(szmic)).ok()
}

/// Network-encrypt one lower transport PDU.
#[allow(clippy::too_many_arguments)]
pub(crate) fn seal(
    material: &NetworkKeyMaterial,
    iv_index: u32,
    ctl: bool,
    ttl: u8,
    seq: u32,
    src: u16,
    dst: u16,
    lower: &[u8],
) -> Result<Bytes, TransportError> {
    let header = NetworkHeader::new(iv_index & 1 == 1, material.nid, ctl, ttl, seq, src, dst);
    let pdu = encrypt_network_pdu(material, iv_index, &header, lower, NetworkNonceKind::Network)?;
    Ok(Bytes::from(pdu))
}

/// IV index a received PDU was sent with, given its IVI bit.
pub(crate) fn receive_iv_index(current: u32, ivi: bool) -> u32 {
    if ivi == (current & 1 == 1) { current } else { current.wrapping_sub(1) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ivi_selects_current_or_previous_index() {
        assert_eq!(receive_iv_index(0x1234_5678, false), 0x1234_5678);
        assert_eq!(receive_iv_index(0x1234_5678, true), 0x1234_5677);
        assert_eq!(receive_iv_index(3, true), 3);
    }

    #[test]
    fn upper_pdu_opens_with_matching_nonce_only() {
        let keys = ResolvedKeys {
            net_key: 0,
            network: NetworkKeyMaterial::derive(&[0x11; 16]),
            access: AccessKey::Device { key: [0x22; 16] },
            label: None,
            ttl: 5,
        };
        let sealed = encrypt_upper(&keys, &[0x80, 0x08, 0x00], false, 7, 0x0001, 0x0100, 0).unwrap();
        assert_eq!(sealed.len(), 3 + 4);

        let nonce = access_nonce(true, false, 7, 0x0001, 0x0100, 0);
        assert_eq!(
            decrypt_upper(&[0x22; 16], &nonce, &sealed, None, false),
            Some(vec![0x80, 0x08, 0x00])
        );
        let app_nonce = access_nonce(false, false, 7, 0x0001, 0x0100, 0);
        assert_eq!(decrypt_upper(&[0x22; 16], &app_nonce, &sealed, None, false), None);
    }
}
