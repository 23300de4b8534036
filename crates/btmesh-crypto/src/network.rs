//! Network layer encryption and header obfuscation.
//!
//! The DST field and the lower transport PDU are encrypted with the network
//! encryption key. The first seven bytes of that ciphertext (the privacy
//! random) then key an AES block that masks CTL/TTL, SEQ and SRC:
//!
//! ```text
//! PECB       = e(PrivacyKey, 0000000000 || IV index || PrivacyRandom)
//! Obfuscated = (CTL,TTL || SEQ || SRC) xor PECB[0..6]
//! ```

use btmesh_proto::{NetworkHeader, ProtocolError, network::MAX_NETWORK_PDU};

use crate::{
    aead::{self, MicSize},
    error::{CryptoError, Result},
    keys::NetworkKeyMaterial,
    nonce,
    toolbox::e,
};

const OBFUSCATED_LEN: usize = 6;
const PRIVACY_RANDOM_LEN: usize = 7;
/// IVI/NID, obfuscated header, and enough ciphertext for the privacy random.
const MIN_PDU_LEN: usize = 1 + OBFUSCATED_LEN + PRIVACY_RANDOM_LEN;

/// Which nonce protects the PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkNonceKind {
    /// Regular network traffic
    Network,
    /// Proxy configuration messages
    Proxy,
}

fn pdu_nonce(kind: NetworkNonceKind, header: &NetworkHeader, iv_index: u32) -> nonce::Nonce {
    match kind {
        NetworkNonceKind::Network => {
            nonce::network(header.ctl(), header.ttl(), header.seq(), header.src(), iv_index)
        },
        NetworkNonceKind::Proxy => nonce::proxy(header.seq(), header.src(), iv_index),
    }
}

fn mic_size(ctl: bool) -> MicSize {
    if ctl { MicSize::Long } else { MicSize::Short }
}

fn pecb(material: &NetworkKeyMaterial, iv_index: u32, privacy_random: &[u8]) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[5..9].copy_from_slice(&iv_index.to_be_bytes());
    block[9..].copy_from_slice(&privacy_random[..PRIVACY_RANDOM_LEN]);
    e(&material.privacy_key, &block)
}

/// Encrypt and obfuscate one network PDU.
///
/// `header` carries the clear CTL, TTL, SEQ, SRC and DST; its NID is
/// replaced by the NID of `material`.
pub fn encrypt_network_pdu(
    material: &NetworkKeyMaterial,
    iv_index: u32,
    header: &NetworkHeader,
    transport_pdu: &[u8],
    kind: NetworkNonceKind,
) -> Result<Vec<u8>> {
    let mic = mic_size(header.ctl());
    let size = NetworkHeader::SIZE + transport_pdu.len() + mic.size();
    if size > MAX_NETWORK_PDU {
        return Err(ProtocolError::PayloadTooLarge { size, max: MAX_NETWORK_PDU }.into());
    }

    let header = NetworkHeader::new(
        iv_index & 1 == 1,
        material.nid,
        header.ctl(),
        header.ttl(),
        header.seq(),
        header.src(),
        header.dst(),
    );
    let clear = header.to_bytes();

    let mut plaintext = Vec::with_capacity(2 + transport_pdu.len());
    plaintext.extend_from_slice(&clear[7..9]);
    plaintext.extend_from_slice(transport_pdu);
    let sealed = aead::encrypt(
        &material.encryption_key,
        &pdu_nonce(kind, &header, iv_index),
        &plaintext,
        &[],
        mic,
    )?;

    let mask = pecb(material, iv_index, &sealed);
    let mut out = Vec::with_capacity(size);
    out.push(clear[0]);
    out.extend(clear[1..7].iter().zip(mask.iter()).map(|(byte, m)| byte ^ m));
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Deobfuscate and decrypt one network PDU.
///
/// `iv_index` is the receiver's current IV index. When the PDU's IVI bit
/// differs from it, the previous IV index is used instead.
///
/// Returns the clear header and the lower transport PDU.
pub fn decrypt_network_pdu(
    material: &NetworkKeyMaterial,
    iv_index: u32,
    pdu: &[u8],
    kind: NetworkNonceKind,
) -> Result<(NetworkHeader, Vec<u8>)> {
    if pdu.len() < MIN_PDU_LEN {
        return Err(CryptoError::TooShort { expected: MIN_PDU_LEN, actual: pdu.len() });
    }
    let nid = pdu[0] & 0x7F;
    if nid != material.nid {
        return Err(CryptoError::NidMismatch { expected: material.nid, actual: nid });
    }
    let ivi = pdu[0] & 0x80 != 0;
    let iv_index = if ivi == (iv_index & 1 == 1) { iv_index } else { iv_index.wrapping_sub(1) };

    let sealed = &pdu[1 + OBFUSCATED_LEN..];
    let mask = pecb(material, iv_index, sealed);
    let mut clear = [0u8; NetworkHeader::SIZE];
    clear[0] = pdu[0];
    for (i, byte) in pdu[1..=OBFUSCATED_LEN].iter().enumerate() {
        clear[i + 1] = byte ^ mask[i];
    }

    // DST is still encrypted; parse what is clear so far to build the nonce.
    let partial = NetworkHeader::from_bytes(&clear)?;
    let mic = mic_size(partial.ctl());
    let plaintext = aead::decrypt(
        &material.encryption_key,
        &pdu_nonce(kind, &partial, iv_index),
        sealed,
        &[],
        mic,
    )?;
    if plaintext.len() < 2 {
        return Err(CryptoError::TooShort { expected: 2 + mic.size(), actual: sealed.len() });
    }
    clear[7..9].copy_from_slice(&plaintext[..2]);
    let header = NetworkHeader::from_bytes(&clear)?;
    Ok((header, plaintext[2..].to_vec()))
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    fn sample_material() -> NetworkKeyMaterial {
        NetworkKeyMaterial::derive(&hex!("7dd7364cd842ad18c17c2b820c84c3d6"))
    }

    #[test]
    fn sample_control_message() {
        let material = sample_material();
        let header = NetworkHeader::new(false, 0, true, 0, 1, 0x1201, 0xFFFD);
        let transport = hex!("034b50057e400000010000");
        let pdu = encrypt_network_pdu(
            &material,
            0x1234_5678,
            &header,
            &transport,
            NetworkNonceKind::Network,
        )
        .unwrap();
        assert_eq!(pdu, hex!("68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df").to_vec());

        let (decoded, lower) =
            decrypt_network_pdu(&material, 0x1234_5678, &pdu, NetworkNonceKind::Network).unwrap();
        assert_eq!(decoded.nid(), 0x68);
        assert_eq!(decoded.seq(), 1);
        assert_eq!(decoded.src(), 0x1201);
        assert_eq!(decoded.dst(), 0xFFFD);
        assert_eq!(lower, transport.to_vec());
    }

    #[test]
    fn access_message_round_trip_with_previous_iv_index() {
        let material = sample_material();
        let header = NetworkHeader::new(false, 0, false, 4, 0x3129AB, 0x0003, 0x1201);
        let pdu = encrypt_network_pdu(&material, 7, &header, &[0x00, 0xAA, 0xBB], NetworkNonceKind::Network)
            .unwrap();
        // Receiver already moved to IV index 8; IVI bit selects 7.
        let (decoded, lower) =
            decrypt_network_pdu(&material, 8, &pdu, NetworkNonceKind::Network).unwrap();
        assert_eq!(decoded.seq(), 0x3129AB);
        assert_eq!(decoded.ttl(), 4);
        assert!(!decoded.ctl());
        assert_eq!(lower, vec![0x00, 0xAA, 0xBB]);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let material = sample_material();
        let other = NetworkKeyMaterial::derive(&[0x11; 16]);
        let header = NetworkHeader::new(false, 0, false, 4, 1, 0x0001, 0x0002);
        let pdu = encrypt_network_pdu(&material, 0, &header, &[0x00], NetworkNonceKind::Network)
            .unwrap();
        assert!(decrypt_network_pdu(&other, 0, &pdu, NetworkNonceKind::Network).is_err());
    }

    #[test]
    fn proxy_nonce_is_not_interchangeable() {
        let material = sample_material();
        let header = NetworkHeader::new(false, 0, true, 0, 1, 0x0001, 0x0000);
        let pdu =
            encrypt_network_pdu(&material, 0, &header, &[0x00, 0x00], NetworkNonceKind::Proxy)
                .unwrap();
        assert!(decrypt_network_pdu(&material, 0, &pdu, NetworkNonceKind::Proxy).is_ok());
        assert_eq!(
            decrypt_network_pdu(&material, 0, &pdu, NetworkNonceKind::Network),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn oversized_pdu_is_rejected() {
        let material = sample_material();
        let header = NetworkHeader::new(false, 0, false, 4, 1, 0x0001, 0x0002);
        let result =
            encrypt_network_pdu(&material, 0, &header, &[0u8; 17], NetworkNonceKind::Network);
        assert!(matches!(result, Err(CryptoError::Protocol(ProtocolError::PayloadTooLarge { .. }))));
    }
}
