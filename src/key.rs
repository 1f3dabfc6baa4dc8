//! Key types and the total order over raw key bytes.

use std::cmp::Ordering;
use std::convert::TryInto;

use bytes::Bytes;

/// Sentinel for "keys may have any size".
pub const KEY_SIZE_UNLIMITED: u16 = u16::MAX;

/// Sentinel for "records may have any size".
pub const RECORD_SIZE_UNLIMITED: u32 = u32::MAX;

/// How a find resolved: exactly, or at the nearest neighbour in the
/// requested direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApproxMatch {
    Exact,
    Lt,
    Gt,
}

impl ApproxMatch {
    pub fn is_approximate(&self) -> bool {
        *self != ApproxMatch::Exact
    }
}

/// The type of a database's keys; controls both the compare function and
/// the fixed key size stored in the database descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    U8,
    U16,
    U32,
    U64,
    Real32,
    Real64,
    /// Variable-length binary, ordered lexicographically.
    Binary,
}

impl KeyType {
    pub fn fixed_size(&self) -> Option<u16> {
        match self {
            KeyType::U8 => Some(1),
            KeyType::U16 => Some(2),
            KeyType::U32 | KeyType::Real32 => Some(4),
            KeyType::U64 | KeyType::Real64 => Some(8),
            KeyType::Binary => None,
        }
    }

    pub fn to_u16(&self) -> u16 {
        match self {
            KeyType::U8 => 1,
            KeyType::U16 => 2,
            KeyType::U32 => 3,
            KeyType::U64 => 4,
            KeyType::Real32 => 5,
            KeyType::Real64 => 6,
            KeyType::Binary => 7,
        }
    }

    pub fn from_u16(value: u16) -> Option<KeyType> {
        match value {
            1 => Some(KeyType::U8),
            2 => Some(KeyType::U16),
            3 => Some(KeyType::U32),
            4 => Some(KeyType::U64),
            5 => Some(KeyType::Real32),
            6 => Some(KeyType::Real64),
            7 => Some(KeyType::Binary),
            _ => None,
        }
    }

    /// The total order over raw key bytes. Fixed-width keys whose size
    /// does not match the declared width fall back to the lexicographic
    /// order; key sizes are validated at the insert boundary, so that
    /// branch only sees keys from a corrupt image.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            KeyType::U8 => fixed_compare::<1>(a, b, |x| x[0] as u64),
            KeyType::U16 => fixed_compare::<2>(a, b, |x| u16::from_le_bytes(x.try_into().unwrap()) as u64),
            KeyType::U32 => fixed_compare::<4>(a, b, |x| u32::from_le_bytes(x.try_into().unwrap()) as u64),
            KeyType::U64 => fixed_compare::<8>(a, b, |x| u64::from_le_bytes(x.try_into().unwrap())),
            KeyType::Real32 => fixed_compare::<4>(a, b, |x| {
                total_order_f32(f32::from_le_bytes(x.try_into().unwrap())) as u64
            }),
            KeyType::Real64 => fixed_compare::<8>(a, b, |x| {
                total_order_f64(f64::from_le_bytes(x.try_into().unwrap()))
            }),
            KeyType::Binary => a.cmp(b),
        }
    }
}

fn fixed_compare<const N: usize>(a: &[u8], b: &[u8], decode: fn(&[u8]) -> u64) -> Ordering {
    if a.len() != N || b.len() != N {
        return a.cmp(b);
    }
    decode(a).cmp(&decode(b))
}

// Map IEEE-754 bit patterns onto an order-preserving unsigned integer:
// positive floats keep their magnitude order, negative floats are
// mirrored below them.
fn total_order_f32(v: f32) -> u32 {
    let bits = v.to_bits();
    if bits & 0x8000_0000 != 0 {
        !bits
    } else {
        bits | 0x8000_0000
    }
}

fn total_order_f64(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits & 0x8000_0000_0000_0000 != 0 {
        !bits
    } else {
        bits | 0x8000_0000_0000_0000
    }
}

/// A key paired with its type so it can live in an ordered map. All keys
/// within one index share the same type.
#[derive(Clone)]
pub struct IndexKey {
    key_type: KeyType,
    bytes: Bytes,
}

impl IndexKey {
    pub fn new(key_type: KeyType, bytes: Bytes) -> Self {
        Self { key_type, bytes }
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_type.compare(&self.bytes, &other.bytes)
    }
}

impl std::fmt::Debug for IndexKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "IndexKey({})", hex::encode(&self.bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_order_ignores_byte_order() {
        // little-endian 256 > 255, although the first byte says otherwise
        let a = 255u32.to_le_bytes();
        let b = 256u32.to_le_bytes();
        assert_eq!(KeyType::U32.compare(&a, &b), Ordering::Less);
        // the lexicographic order would disagree
        assert_eq!(KeyType::Binary.compare(&a, &b), Ordering::Greater);
    }

    #[test]
    fn test_float_total_order() {
        let keys = [-1000.5f64, -1.0, -0.0, 0.0, 0.25, 3.5, 1e10];
        for w in keys.windows(2) {
            let a = w[0].to_le_bytes();
            let b = w[1].to_le_bytes();
            assert_ne!(KeyType::Real64.compare(&a, &b), Ordering::Greater);
        }
        // -0.0 and 0.0 are distinct bit patterns but -0.0 sorts first
        let neg = (-0.0f64).to_le_bytes();
        let pos = (0.0f64).to_le_bytes();
        assert_eq!(KeyType::Real64.compare(&neg, &pos), Ordering::Less);
    }

    #[test]
    fn test_binary_order() {
        assert_eq!(KeyType::Binary.compare(b"abc", b"abd"), Ordering::Less);
        assert_eq!(KeyType::Binary.compare(b"ab", b"abc"), Ordering::Less);
        assert_eq!(KeyType::Binary.compare(b"b", b"abc"), Ordering::Greater);
    }

    #[test]
    fn test_index_key_ordering() {
        let k = |v: u64| IndexKey::new(KeyType::U64, Bytes::copy_from_slice(&v.to_le_bytes()));
        assert!(k(1) < k(2));
        assert!(k(255) < k(256));
        assert!(k(7) == k(7));
    }
}
