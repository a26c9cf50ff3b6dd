use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};

/// 16-byte AES-128 key. There are two per pump: `client->pump` and
/// `pump->client`; which one applies to a given packet is determined by
/// the transport layer from the packet's source/destination address.
#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(transparent)]
pub struct Key(pub [u8; 16]);

impl Key {
    /// Wraps a raw 16-byte key.
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Debug for Key {
    // Keys never print their bytes; a log line that accidentally holds one
    // does not leak it.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Key(..)")
    }
}

impl From<[u8; 16]> for Key {
    #[inline]
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

/// Encrypts a single 16-byte block with AES-128. The packet MAC reduces to
/// exactly one of these.
#[must_use]
pub fn encrypt_block(key: &Key, block: &[u8; 16]) -> [u8; 16] {
    let cipher = aes::Aes128::new(GenericArray::from_slice(&key.0));
    let mut buf = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut buf);
    buf.into()
}

/// Decrypts a single 16-byte block with AES-128. Used to recover the two
/// session cipher keys carried in the pairing handshake's `KEY_RESPONSE`
/// payload, which arrive encrypted under the PIN-derived key.
#[must_use]
pub fn decrypt_block(key: &Key, block: &[u8; 16]) -> [u8; 16] {
    let cipher = aes::Aes128::new(GenericArray::from_slice(&key.0));
    let mut buf = GenericArray::clone_from_slice(block);
    cipher.decrypt_block(&mut buf);
    buf.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_block_is_deterministic() {
        let key = Key::new([0u8; 16]);
        let block = [1u8; 16];
        assert_eq!(encrypt_block(&key, &block), encrypt_block(&key, &block));
    }

    #[test]
    fn different_keys_produce_different_ciphertext() {
        let a = encrypt_block(&Key::new([0u8; 16]), &[0u8; 16]);
        let b = encrypt_block(&Key::new([1u8; 16]), &[0u8; 16]);
        assert_ne!(a, b);
    }

    #[test]
    fn decrypt_inverts_encrypt() {
        let key = Key::new([3u8; 16]);
        let plaintext = [0xAB; 16];
        let ciphertext = encrypt_block(&key, &plaintext);
        assert_eq!(decrypt_block(&key, &ciphertext), plaintext);
    }
}
