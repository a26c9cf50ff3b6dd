use crate::cipher::{encrypt_block, Key};

/// 8-byte packet authentication tag.
pub const MAC_LEN: usize = 8;

/// Computes the MAC over `data` with `key`: pad to 16-byte blocks with
/// zeros, XOR the blocks together, encrypt the result with `key`, and take
/// the first 8 bytes.
#[must_use]
pub fn compute_mac(key: &Key, data: &[u8]) -> [u8; MAC_LEN] {
    let mut acc = [0u8; 16];
    for block in data.chunks(16) {
        for (a, b) in acc.iter_mut().zip(block) {
            *a ^= b;
        }
    }
    let enc = encrypt_block(key, &acc);
    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(&enc[..MAC_LEN]);
    mac
}

/// Constant-time MAC comparison. Always walks the full length regardless
/// of where the first mismatch occurs.
#[must_use]
pub fn verify_mac(key: &Key, data: &[u8], mac: &[u8]) -> bool {
    if mac.len() != MAC_LEN {
        return false;
    }
    let expected = compute_mac(key, data);
    let mut diff = 0u8;
    for (a, b) in expected.iter().zip(mac) {
        diff |= a ^ b;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_round_trips() {
        let key = Key::new([7u8; 16]);
        let data = b"transport header + payload bytes";
        let mac = compute_mac(&key, data);
        assert!(verify_mac(&key, data, &mac));
    }

    #[test]
    fn mac_rejects_tampered_payload() {
        let key = Key::new([7u8; 16]);
        let mac = compute_mac(&key, b"original");
        assert!(!verify_mac(&key, b"tampered", &mac));
    }

    #[test]
    fn mac_is_independent_of_block_boundary_padding() {
        // A payload that is an exact multiple of 16 bytes and one that
        // needs zero padding must not collide trivially.
        let key = Key::new([1u8; 16]);
        let exact = [9u8; 16];
        let padded = [9u8; 10];
        assert_ne!(compute_mac(&key, &exact), compute_mac(&key, &padded));
    }
}
