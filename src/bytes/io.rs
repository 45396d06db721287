//! Object payloads and standard I/O adapters for [`Bytes`].

use super::Bytes;
use crate::error::Result;

/// Encodes and decodes values of `T` against a byte stream.
///
/// The cursor layer stays payload-agnostic: anything beyond primitives,
/// text and blocks goes through a codec supplied by the caller.
pub trait ObjectCodec<T>: Send + Sync {
    /// Write `value` at the cursor position.
    fn write(&self, bytes: &mut Bytes, value: &T) -> Result<()>;

    /// Read a value from the cursor position.
    fn read(&self, bytes: &mut Bytes) -> Result<T>;
}

impl Bytes {
    /// Write `value` through `codec`.
    pub fn write_object<T>(&mut self, codec: &dyn ObjectCodec<T>, value: &T) -> Result<()> {
        codec.write(self, value)
    }

    /// Read a value through `codec`.
    pub fn read_object<T>(&mut self, codec: &dyn ObjectCodec<T>) -> Result<T> {
        codec.read(self)
    }
}

/// Drains the remaining bytes; a read at the limit returns 0 (EOF).
impl std::io::Read for Bytes {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = buf.len().min(self.remaining());
        if n > 0 {
            self.read_raw(&mut buf[..n]).map_err(std::io::Error::other)?;
        }
        Ok(n)
    }
}

/// Fills up to the limit; a write at the limit returns 0, which the
/// standard library surfaces as `WriteZero` from `write_all`.
impl std::io::Write for Bytes {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = buf.len().min(self.remaining());
        if n > 0 {
            self.write_raw(&buf[..n]).map_err(std::io::Error::other)?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
