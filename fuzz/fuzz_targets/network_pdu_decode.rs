#![no_main]

use btmesh_crypto::{NetworkKeyMaterial, NetworkNonceKind, decrypt_network_pdu};
use btmesh_proto::{
    CompositionData, LowerHeader, NetworkHeader, Opcode, ProxyConfigMessage, SegmentAck,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let material = NetworkKeyMaterial::derive(&[0x7D; 16]);
    for kind in [NetworkNonceKind::Network, NetworkNonceKind::Proxy] {
        let _ = decrypt_network_pdu(&material, 0x1234_5678, data, kind);
    }

    if let Ok(header) = NetworkHeader::from_bytes(data) {
        assert_eq!(NetworkHeader::from_bytes(&header.to_bytes()), Ok(header));
        let _ = LowerHeader::decode(header.ctl(), &data[NetworkHeader::SIZE..]);
    }

    let _ = SegmentAck::decode(data);
    let _ = ProxyConfigMessage::decode(data);
    let _ = CompositionData::decode_status(data);
    if let Ok((opcode, rest)) = Opcode::decode(data) {
        assert_eq!(opcode.len() + rest.len(), data.len());
    }
});
