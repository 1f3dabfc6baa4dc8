//! The host/disk boundary. Everything written to disk goes through this
//! module; all on-disk integers are little-endian, the in-memory
//! representation is host-native.

use std::{
    convert::TryInto,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    mem::size_of,
    path::Path,
};

use crate::error::{BurrowError, BurrowResult, ErrorKind};

pub trait Encodeable {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decodeable {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self;
}

pub fn read_exact_from<R: std::io::Read>(reader: &mut R, bytes_count: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; bytes_count];
    // page images are length-checked before they reach a reader, so a
    // short read here is a corrupt image
    reader
        .read_exact(&mut buffer)
        .unwrap_or_else(|_| panic!("short read, expected {} bytes", bytes_count));
    buffer
}

macro_rules! impl_serialization {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }

            impl Decodeable for $t {
                fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
                    let bytes = read_exact_from(reader, size_of::<Self>());
                    Self::from_le_bytes(bytes.try_into().unwrap())
                }
            }
        )*
    }
}

impl_serialization!(for u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);

/// # Format
///
/// - 1 byte (0 for false, 1 for true)
impl Encodeable for bool {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl Decodeable for bool {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
        u8::decode_from(reader) == 1
    }
}

impl Encodeable for &[u8] {
    fn encode(&self) -> Vec<u8> {
        self.to_vec()
    }
}

/// An append/overwrite byte buffer for building page and record images.
pub struct BurrowWriter {
    buf: Vec<u8>,
}

impl BurrowWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) {
        self.buf.extend_from_slice(obj.encode().as_slice());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn to_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Pad the buffer with zeroes up to `size`. Panics if the content is
    /// already larger; callers check capacity before serializing.
    pub fn to_padded_bytes(self, size: usize) -> Vec<u8> {
        let mut buf = self.buf;
        if buf.len() > size {
            panic!(
                "buffer size is larger than the given size: {} > {}",
                buf.len(),
                size
            );
        }
        buf.resize(size, 0);
        buf
    }
}

/// Positional reader over an in-memory image.
pub struct BurrowReader {
    cursor: std::io::Cursor<Vec<u8>>,
}

impl BurrowReader {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            cursor: std::io::Cursor::new(bytes),
        }
    }

    pub fn read<T: Decodeable>(&mut self) -> T {
        T::decode_from(&mut self.cursor)
    }

    pub fn read_bytes(&mut self, count: usize) -> Vec<u8> {
        read_exact_from(&mut self.cursor, count)
    }
}

/// A positioned file wrapper; the unit of I/O is the caller's buffer, not
/// the file cursor.
pub struct BurrowFile {
    file: File,
}

impl BurrowFile {
    pub fn create<P: AsRef<Path>>(path: P) -> BurrowResult<Self> {
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> BurrowResult<Self> {
        if !path.as_ref().exists() {
            return Err(BurrowError::new(
                ErrorKind::FileNotFound,
                &format!("{}", path.as_ref().display()),
            ));
        }
        let file = OpenOptions::new().write(true).read(true).open(path)?;
        Ok(Self { file })
    }

    pub fn read_at(&mut self, offset: u64, len: usize) -> BurrowResult<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> BurrowResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    pub fn append(&mut self, bytes: &[u8]) -> BurrowResult<u64> {
        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(bytes)?;
        Ok(offset)
    }

    pub fn len(&self) -> BurrowResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn set_len(&mut self, len: u64) -> BurrowResult<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    pub fn sync(&mut self) -> BurrowResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_round_trip() {
        let mut w = BurrowWriter::new();
        w.write(&0x1122u16);
        w.write(&0x33445566u32);
        w.write(&0xaabbccdd00112233u64);
        w.write(&true);

        let mut r = BurrowReader::new(w.to_bytes());
        assert_eq!(r.read::<u16>(), 0x1122);
        assert_eq!(r.read::<u32>(), 0x33445566);
        assert_eq!(r.read::<u64>(), 0xaabbccdd00112233);
        assert_eq!(r.read::<bool>(), true);
    }

    #[test]
    fn test_little_endian_on_disk() {
        let mut w = BurrowWriter::new();
        w.write(&0x0102u16);
        assert_eq!(w.to_bytes(), vec![0x02, 0x01]);
    }

    #[test]
    fn test_padded_page_image() {
        let mut w = BurrowWriter::new();
        w.write(&7u32);
        let image = w.to_padded_bytes(16);
        assert_eq!(image.len(), 16);
        assert_eq!(&image[..4], &[7, 0, 0, 0]);
    }
}
