//! Key derivation functions built on AES-CMAC.

use aes::{
    Aes128, Block,
    cipher::{BlockEncrypt, KeyInit},
};
use cmac::{Cmac, Mac};

use crate::Key;

/// Output of `k2`: the material derived from a network key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct K2Output {
    /// 7-bit network identifier
    pub nid: u8,
    /// Network layer encryption key
    pub encryption_key: Key,
    /// Header obfuscation key
    pub privacy_key: Key,
}

fn cmac_parts(key: &Key, parts: &[&[u8]]) -> Key {
    let mut mac = <Cmac<Aes128> as Mac>::new(key.into());
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// AES-CMAC (RFC 4493).
pub fn aes_cmac(key: &Key, message: &[u8]) -> Key {
    cmac_parts(key, &[message])
}

/// Single block AES-128 encryption, `e(key, plaintext)`.
pub fn e(key: &Key, plaintext: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(key.into());
    let mut block = Block::from(*plaintext);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// Salt generation: AES-CMAC with an all-zero key.
pub fn s1(message: &[u8]) -> Key {
    aes_cmac(&[0u8; 16], message)
}

/// Key derivation function `k1(N, SALT, P)`.
pub fn k1(n: &[u8], salt: &Key, p: &[u8]) -> Key {
    let t = aes_cmac(salt, n);
    aes_cmac(&t, p)
}

/// Network key material derivation `k2(N, P)`.
///
/// `p` is `0x00` for the master credentials and the friendship parameters
/// otherwise.
pub fn k2(n: &Key, p: &[u8]) -> K2Output {
    let t = aes_cmac(&s1(b"smk2"), n);
    let t1 = cmac_parts(&t, &[p, &[0x01]]);
    let t2 = cmac_parts(&t, &[&t1, p, &[0x02]]);
    let t3 = cmac_parts(&t, &[&t2, p, &[0x03]]);
    K2Output { nid: t1[15] & 0x7F, encryption_key: t2, privacy_key: t3 }
}

/// Network identifier derivation `k3(N)`.
pub fn k3(n: &Key) -> [u8; 8] {
    let t = aes_cmac(&s1(b"smk3"), n);
    let full = cmac_parts(&t, &[b"id64", &[0x01]]);
    let mut out = [0u8; 8];
    out.copy_from_slice(&full[8..]);
    out
}

/// Application key identifier derivation `k4(N)`, 6 bits.
pub fn k4(n: &Key) -> u8 {
    let t = aes_cmac(&s1(b"smk4"), n);
    cmac_parts(&t, &[b"id6", &[0x01]])[15] & 0x3F
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    const RFC4493_KEY: Key = hex!("2b7e151628aed2a6abf7158809cf4f3c");

    #[test]
    fn cmac_rfc4493() {
        assert_eq!(aes_cmac(&RFC4493_KEY, &[]), hex!("bb1d6929e95937287fa37d129b756746"));
        assert_eq!(
            aes_cmac(&RFC4493_KEY, &hex!("6bc1bee22e409f96e93d7e117393172a")),
            hex!("070a16b46b4d4144f79bdd9dd04a287c")
        );
    }

    #[test]
    fn s1_sample() {
        assert_eq!(s1(b"test"), hex!("b73cefbd641ef2ea598c2b6efb62f79c"));
    }

    #[test]
    fn k1_sample() {
        let out = k1(
            &hex!("3216d1509884b533248541792b877f98"),
            &hex!("2ba14ffa0df84a2831938d57d276cab4"),
            &hex!("5a09d60797eeb4478aada59db3352a0d"),
        );
        assert_eq!(out, hex!("f6ed15a8934afbe7d83e8dcb57fcf5d7"));
    }

    #[test]
    fn k2_master_credentials() {
        let out = k2(&hex!("f7a2a44f8e8a8029064f173ddc1e2b00"), &[0x00]);
        assert_eq!(out.nid, 0x7f);
        assert_eq!(out.encryption_key, hex!("9f589181a0f50de73c8070c7a6d27f46"));
        assert_eq!(out.privacy_key, hex!("4c715bd4a64b938f99b453351653124f"));
    }

    #[test]
    fn k3_sample() {
        assert_eq!(k3(&hex!("f7a2a44f8e8a8029064f173ddc1e2b00")), hex!("ff046958233db014"));
    }

    #[test]
    fn k4_sample() {
        assert_eq!(k4(&hex!("3216d1509884b533248541792b877f98")), 0x38);
    }

    #[test]
    fn e_is_plain_aes() {
        // FIPS-197 appendix C.1
        let out = e(&hex!("000102030405060708090a0b0c0d0e0f"), &hex!("00112233445566778899aabbccddeeff"));
        assert_eq!(out, hex!("69c4e0d86a7b0430d8cdb78070b4c55a"));
    }
}
