//! Sequential nonces for the frame cipher.

use crate::error::{Error, Result};

/// Size of the nonce in bytes: 96 bits, as ChaCha20-Poly1305-IETF expects.
pub const SIZE: usize = 12;

/// A little-endian 96-bit counter. Each direction of a secret connection
/// owns one, starting at zero.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Nonce(pub [u8; SIZE]);

impl Nonce {
    /// Advance the counter by one.
    ///
    /// A wrap of the full 96-bit range is refused: the nonce space of a key
    /// must never repeat.
    pub fn increment(&mut self) -> Result<()> {
        for byte in self.0.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                return Ok(());
            }
        }
        Err(Error::protocol("send/recv nonce exhausted"))
    }

    /// Serialize the nonce for the AEAD call.
    pub fn to_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_little_endian() {
        let mut nonce = Nonce::default();
        nonce.increment().unwrap();
        assert_eq!(nonce.0, [1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);

        let mut nonce = Nonce([0xff, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        nonce.increment().unwrap();
        assert_eq!(nonce.0, [0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn carry_ripples_through_every_byte() {
        let mut nonce = Nonce([0xff; SIZE]);
        nonce.0[SIZE - 1] = 0xfe;
        nonce.increment().unwrap();
        let mut expected = [0u8; SIZE];
        expected[SIZE - 1] = 0xff;
        assert_eq!(nonce.0, expected);
    }

    #[test]
    fn full_wrap_is_refused() {
        let mut nonce = Nonce([0xff; SIZE]);
        assert!(nonce.increment().is_err());
    }
}
