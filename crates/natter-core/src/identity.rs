//! Derived peer identity.

/// Stable identifier for a peer address: the first 16 bytes of the BLAKE3
/// hash of the address string, hex encoded.
pub fn derive_id(addr: &str) -> String {
    let hash = blake3::hash(addr.as_bytes());
    hex::encode(&hash.as_bytes()[..16])
}
