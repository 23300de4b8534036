//! AES-CCM with the two MIC sizes mesh uses.

use aes::Aes128;
use ccm::{
    Ccm,
    aead::{AeadInPlace, KeyInit, generic_array::GenericArray},
    consts::{U4, U8, U13},
};

use crate::{
    Key,
    error::{CryptoError, Result},
    nonce::Nonce,
};

type Ccm32 = Ccm<Aes128, U4, U13>;
type Ccm64 = Ccm<Aes128, U8, U13>;

/// Length of the message integrity check appended to ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MicSize {
    /// 32-bit MIC
    Short,
    /// 64-bit MIC
    Long,
}

impl MicSize {
    /// MIC length in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::Short => 4,
            Self::Long => 8,
        }
    }
}

/// Encrypt `plaintext`, returning `ciphertext || MIC`.
pub fn encrypt(
    key: &Key,
    nonce: &Nonce,
    plaintext: &[u8],
    aad: &[u8],
    mic: MicSize,
) -> Result<Vec<u8>> {
    let mut out = plaintext.to_vec();
    let nonce = GenericArray::from_slice(nonce);
    match mic {
        MicSize::Short => {
            let tag = Ccm32::new(key.into())
                .encrypt_in_place_detached(nonce, aad, &mut out)
                .map_err(|_| CryptoError::AuthenticationFailed)?;
            out.extend_from_slice(&tag);
        },
        MicSize::Long => {
            let tag = Ccm64::new(key.into())
                .encrypt_in_place_detached(nonce, aad, &mut out)
                .map_err(|_| CryptoError::AuthenticationFailed)?;
            out.extend_from_slice(&tag);
        },
    }
    Ok(out)
}

/// Verify and decrypt `ciphertext || MIC`.
pub fn decrypt(
    key: &Key,
    nonce: &Nonce,
    sealed: &[u8],
    aad: &[u8],
    mic: MicSize,
) -> Result<Vec<u8>> {
    let split = sealed
        .len()
        .checked_sub(mic.size())
        .ok_or(CryptoError::TooShort { expected: mic.size(), actual: sealed.len() })?;
    let (ciphertext, tag) = sealed.split_at(split);
    let mut out = ciphertext.to_vec();
    let nonce = GenericArray::from_slice(nonce);
    match mic {
        MicSize::Short => Ccm32::new(key.into()).decrypt_in_place_detached(
            nonce,
            aad,
            &mut out,
            GenericArray::from_slice(tag),
        ),
        MicSize::Long => Ccm64::new(key.into()).decrypt_in_place_detached(
            nonce,
            aad,
            &mut out,
            GenericArray::from_slice(tag),
        ),
    }
    .map_err(|_| CryptoError::AuthenticationFailed)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    const KEY: Key = hex!("0953fa93e7caac9638f58820220a398e");
    const NONCE: Nonce = hex!("00800000011201000012345678");

    #[test]
    fn both_mic_sizes_verify() {
        for mic in [MicSize::Short, MicSize::Long] {
            let sealed = encrypt(&KEY, &NONCE, b"hello mesh", &[], mic).unwrap();
            assert_eq!(sealed.len(), 10 + mic.size());
            assert_eq!(decrypt(&KEY, &NONCE, &sealed, &[], mic).unwrap(), b"hello mesh");
        }
    }

    #[test]
    fn tampering_is_detected() {
        let mut sealed = encrypt(&KEY, &NONCE, b"payload", &[], MicSize::Short).unwrap();
        sealed[0] ^= 0x01;
        assert_eq!(
            decrypt(&KEY, &NONCE, &sealed, &[], MicSize::Short),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn associated_data_is_authenticated() {
        let sealed = encrypt(&KEY, &NONCE, b"payload", b"label", MicSize::Short).unwrap();
        assert!(decrypt(&KEY, &NONCE, &sealed, b"other", MicSize::Short).is_err());
        assert!(decrypt(&KEY, &NONCE, &sealed, b"label", MicSize::Short).is_ok());
    }

    #[test]
    fn short_input_is_rejected() {
        assert_eq!(
            decrypt(&KEY, &NONCE, &[0u8; 3], &[], MicSize::Short),
            Err(CryptoError::TooShort { expected: 4, actual: 3 })
        );
    }
}
