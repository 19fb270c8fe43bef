//! Wrapper types around Bitvec.
use bitvec::prelude::*;

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// Reserved bytes exchanged during handshake.
type ReservedAlias = BitArray<[u8; 8], Msb0>;

/// `reserved[5] & 0x10`
const EXTENSION_BIT: usize = 43;

/// `reserved[7] & 0x01`
const DHT_BIT: usize = 63;

#[derive(Debug, Clone, Default, Copy, PartialEq, Eq)]
pub struct Reserved(pub ReservedAlias);

impl From<[u8; 8]> for Reserved {
    fn from(value: [u8; 8]) -> Self {
        Self(ReservedAlias::from(value))
    }
}

impl From<Reserved> for [u8; 8] {
    fn from(value: Reserved) -> Self {
        value.0.into_inner()
    }
}

impl Reserved {
    /// Reserved bits of protocols that the client supports, the extension
    /// protocol and the DHT port message.
    pub fn supported() -> Reserved {
        let mut r = Reserved::default();
        r.0.set(EXTENSION_BIT, true);
        r.0.set(DHT_BIT, true);
        r
    }

    pub fn supports_extended(&self) -> bool {
        self.0[EXTENSION_BIT]
    }

    pub fn supports_dht(&self) -> bool {
        self.0[DHT_BIT]
    }
}

pub trait RvtBitfield {
    fn from_piece(pieces: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; pieces]
    }

    /// Build a bitfield received from the wire, trimmed to `len` bits.
    /// Returns `None` if the spare bits are set or the buffer is too short.
    fn from_wire(vec: Vec<u8>, len: usize) -> Option<Bitfield> {
        if vec.len() != len.div_ceil(8) {
            return None;
        }
        let mut s = Bitfield::from_vec(vec);
        if s[len..].any() {
            return None;
        }
        s.truncate(len);
        Some(s)
    }

    /// Set a bit, growing the vector if needed.
    fn safe_set(&mut self, index: usize);

    /// Indices of the pieces that `self` has and `other` doesn't.
    fn missing_in(&self, other: &Bitfield) -> Vec<usize>;
}

impl RvtBitfield for Bitfield {
    fn safe_set(&mut self, index: usize) {
        if self.len() <= index {
            self.resize(index + 1, false);
        }
        self.set(index, true);
    }

    fn missing_in(&self, other: &Bitfield) -> Vec<usize> {
        self.iter_ones()
            .filter(|i| !other.get(*i).map(|b| *b).unwrap_or(false))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_piece() {
        let bitfield = Bitfield::from_piece(1407);
        assert_eq!(bitfield.len(), 1407);
        assert!(bitfield.not_any());
    }

    #[test]
    fn safe_set() {
        let mut bitfield = Bitfield::from_piece(2);
        bitfield.safe_set(2);
        assert_eq!(bitfield.len(), 3);
        assert!(bitfield[2]);

        bitfield.safe_set(10);
        assert_eq!(bitfield.len(), 11);
        assert!(bitfield[10]);
    }

    #[test]
    fn from_wire() {
        let b = Bitfield::from_wire(vec![0b1010_0000, 0b1000_0000], 9).unwrap();
        assert_eq!(b.len(), 9);
        assert_eq!(b.iter_ones().collect::<Vec<_>>(), [0, 2, 8]);

        // spare bit set
        assert!(Bitfield::from_wire(vec![0, 0b0100_0000], 9).is_none());
        // wrong number of bytes
        assert!(Bitfield::from_wire(vec![0], 9).is_none());
    }

    #[test]
    fn missing_in() {
        let mut a = Bitfield::from_piece(4);
        a.set(1, true);
        a.set(3, true);
        let mut b = Bitfield::from_piece(4);
        b.set(1, true);
        assert_eq!(a.missing_in(&b), [3]);
    }

    #[test]
    fn reserved() {
        let reserved = Reserved::supported();
        assert!(reserved.supports_extended());
        assert!(reserved.supports_dht());
        assert_eq!(<[u8; 8]>::from(reserved), [0, 0, 0, 0, 0, 0x10, 0, 0x01]);

        let plain = Reserved::from([0u8; 8]);
        assert!(!plain.supports_extended());
    }
}
