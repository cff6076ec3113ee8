use crate::PieceIndex;

/// Per-piece ownership map. Bit `i` of the packed form lives in byte
/// `i / 8`, MSB-first, so a 3-piece complete file packs to `0xE0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<bool>,
}

impl Bitfield {
    /// All-false bitfield for `piece_count` pieces.
    pub fn new(piece_count: u32) -> Self {
        Self {
            bits: vec![false; piece_count as usize],
        }
    }

    /// All-true bitfield (a seed's view of the file).
    pub fn full(piece_count: u32) -> Self {
        Self {
            bits: vec![true; piece_count as usize],
        }
    }

    pub fn len(&self) -> u32 {
        self.bits.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Out-of-range indices read as false, same as a short wire bitfield.
    pub fn has(&self, index: PieceIndex) -> bool {
        self.bits.get(index as usize).copied().unwrap_or(false)
    }

    /// Marks a piece as owned. Pieces are never un-marked.
    pub fn set(&mut self, index: PieceIndex) {
        if let Some(bit) = self.bits.get_mut(index as usize) {
            *bit = true;
        }
    }

    pub fn count_set(&self) -> u32 {
        self.bits.iter().filter(|b| **b).count() as u32
    }

    pub fn is_all_set(&self) -> bool {
        self.bits.iter().all(|b| *b)
    }

    /// Indices `other` has and we lack, in ascending order.
    pub fn missing_from(&self, other: &Bitfield) -> Vec<PieceIndex> {
        (0..self.len())
            .filter(|&i| other.has(i) && !self.has(i))
            .collect()
    }

    /// Packs MSB-first into `ceil(len / 8)` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.bits.len().div_ceil(8)];
        for (i, &bit) in self.bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (7 - (i % 8));
            }
        }
        bytes
    }

    /// Unpacks `piece_count` bits; bits beyond the supplied bytes stay false.
    pub fn from_bytes(bytes: &[u8], piece_count: u32) -> Self {
        let mut bitfield = Self::new(piece_count);
        for i in 0..piece_count as usize {
            let byte_index = i / 8;
            if byte_index >= bytes.len() {
                break;
            }
            if bytes[byte_index] & (1 << (7 - (i % 8))) != 0 {
                bitfield.bits[i] = true;
            }
        }
        bitfield
    }

    /// Uppercase hex rendering of the packed form, for the tracker protocol.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.to_bytes())
    }

    /// Inverse of [`to_hex`]. Malformed or truncated hex leaves the
    /// unreachable tail false rather than failing.
    ///
    /// [`to_hex`]: Bitfield::to_hex
    pub fn from_hex(s: &str, piece_count: u32) -> Self {
        match hex::decode(s) {
            Ok(bytes) => Self::from_bytes(&bytes, piece_count),
            Err(_) => Self::new(piece_count),
        }
    }
}
