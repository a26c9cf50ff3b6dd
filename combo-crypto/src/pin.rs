use crate::cipher::Key;

/// Number of decimal digits in a Combo pairing PIN.
pub const PIN_DIGITS: usize = 10;

/// Derives the weak pairing key from the 10-digit PIN the pump displays
/// during pairing.
///
/// The pump's own derivation is undocumented and the corpus available to
/// this implementation does not carry the original source far enough to
/// recover it byte-exact (see `DESIGN.md`). This packs PIN digit pairs
/// into the low 5 bytes of the key space, as the wire evidence available
/// (`KEY_RESPONSE` is exactly 32 bytes, i.e. two 16-byte blocks, decrypted
/// with a key derived from a 10-digit, i.e. 5-byte-packed, PIN) implies,
/// and cycles those bytes to fill the remaining 11 bytes of the AES-128
/// key. Callers that replay a real pump's wire transcript must treat the
/// produced cipher keys as implementation-defined until the derivation is
/// confirmed against hardware.
///
/// # Panics
/// Panics if `pin` is not exactly [`PIN_DIGITS`] ASCII decimal digits.
#[must_use]
pub fn derive_pin_key(pin: &str) -> Key {
    let digits: Vec<u8> = pin
        .bytes()
        .map(|b| {
            assert!(b.is_ascii_digit(), "PIN must be ASCII decimal digits");
            b - b'0'
        })
        .collect();
    assert_eq!(digits.len(), PIN_DIGITS, "PIN must be {PIN_DIGITS} digits");

    let mut packed = [0u8; 5];
    for (i, pair) in digits.chunks(2).enumerate() {
        packed[i] = (pair[0] << 4) | pair[1];
    }

    let mut key = [0u8; 16];
    for (i, b) in key.iter_mut().enumerate() {
        *b = packed[i % packed.len()];
    }
    Key::new(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_digit_pairs_into_first_five_bytes() {
        let key = derive_pin_key("2606819273");
        assert_eq!(key.as_bytes()[0], 0x26);
        assert_eq!(key.as_bytes()[1], 0x06);
        assert_eq!(key.as_bytes()[2], 0x81);
        assert_eq!(key.as_bytes()[3], 0x92);
        assert_eq!(key.as_bytes()[4], 0x73);
    }

    #[test]
    fn is_deterministic_for_the_same_pin() {
        assert_eq!(
            derive_pin_key("0000000000").as_bytes(),
            derive_pin_key("0000000000").as_bytes()
        );
    }

    #[test]
    fn differs_across_pins() {
        assert_ne!(
            derive_pin_key("1111111111").as_bytes(),
            derive_pin_key("2222222222").as_bytes()
        );
    }

    #[test]
    #[should_panic(expected = "10 digits")]
    fn rejects_short_pin() {
        derive_pin_key("123");
    }
}
