#![no_main]

use btmesh_core::MeshNetwork;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|json: &str| {
    let Ok(network) = MeshNetwork::from_json(json) else {
        return;
    };
    // Anything that imports must export and import again to the same state.
    let exported = network.to_json().unwrap();
    let reimported = MeshNetwork::from_json(&exported).unwrap();
    assert_eq!(reimported.state(), network.state());
});
