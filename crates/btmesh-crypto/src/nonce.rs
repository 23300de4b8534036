//! 13-byte CCM nonces.
//!
//! ```text
//! network      00 | CTL,TTL | SEQ | SRC | 0000 | IV index
//! application  01 | ASZMIC  | SEQ | SRC | DST  | IV index
//! device       02 | ASZMIC  | SEQ | SRC | DST  | IV index
//! proxy        03 | 00      | SEQ | SRC | 0000 | IV index
//! ```

/// A CCM nonce.
pub type Nonce = [u8; 13];

const NETWORK: u8 = 0x00;
const APPLICATION: u8 = 0x01;
const DEVICE: u8 = 0x02;
const PROXY: u8 = 0x03;

fn build(kind: u8, second: u8, seq: u32, src: u16, dst: u16, iv_index: u32) -> Nonce {
    let [_, s0, s1, s2] = seq.to_be_bytes();
    let [src0, src1] = src.to_be_bytes();
    let [d0, d1] = dst.to_be_bytes();
    let [i0, i1, i2, i3] = iv_index.to_be_bytes();
    [kind, second, s0, s1, s2, src0, src1, d0, d1, i0, i1, i2, i3]
}

/// Nonce for network layer encryption.
pub fn network(ctl: bool, ttl: u8, seq: u32, src: u16, iv_index: u32) -> Nonce {
    build(NETWORK, (u8::from(ctl) << 7) | (ttl & 0x7F), seq, src, 0, iv_index)
}

/// Nonce for upper transport encryption with an application key.
///
/// `aszmic` is only ever set for segmented messages with a 64-bit TransMIC.
pub fn application(aszmic: bool, seq: u32, src: u16, dst: u16, iv_index: u32) -> Nonce {
    build(APPLICATION, u8::from(aszmic) << 7, seq, src, dst, iv_index)
}

/// Nonce for upper transport encryption with a device key.
pub fn device(aszmic: bool, seq: u32, src: u16, dst: u16, iv_index: u32) -> Nonce {
    build(DEVICE, u8::from(aszmic) << 7, seq, src, dst, iv_index)
}

/// Nonce for proxy configuration messages.
pub fn proxy(seq: u32, src: u16, iv_index: u32) -> Nonce {
    build(PROXY, 0, seq, src, 0, iv_index)
}
