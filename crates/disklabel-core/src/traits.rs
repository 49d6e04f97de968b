//! Core traits for device access

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// Combined trait for Read + Seek
pub trait ReadSeek: Read + Seek {}

/// Blanket implementation for any type that implements Read + Seek
impl<T: Read + Seek> ReadSeek for T {}

/// Combined trait for Read + Write + Seek
pub trait ReadWriteSeek: Read + Write + Seek {}

/// Blanket implementation for any type that implements Read + Write + Seek
impl<T: Read + Write + Seek> ReadWriteSeek for T {}

/// A device a context can be assigned to: a block device, a disk image file
/// or an in-memory buffer
pub trait DeviceIo: ReadWriteSeek {
    /// Get the device size in bytes
    fn size(&mut self) -> io::Result<u64> {
        let pos = self.stream_position()?;
        let end = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(pos))?;
        Ok(end)
    }

    /// Flush all buffered data down to the storage
    fn sync_all(&mut self) -> io::Result<()> {
        self.flush()
    }

    /// Ask the kernel to re-read the partition table of this device
    fn reread_partition_table(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Access the underlying file, if any (used for topology probing)
    fn as_file(&self) -> Option<&File> {
        None
    }

    /// Read exactly `buf.len()` bytes at byte offset `offset`
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }

    /// Write all of `buf` at byte offset `offset`
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(buf)
    }
}

impl DeviceIo for File {
    fn size(&mut self) -> io::Result<u64> {
        let meta = self.metadata()?;
        if meta.is_file() {
            return Ok(meta.len());
        }
        self.seek(SeekFrom::End(0))
    }

    fn sync_all(&mut self) -> io::Result<()> {
        self.flush()?;
        File::sync_all(self)
    }

    fn reread_partition_table(&mut self) -> io::Result<()> {
        crate::device::reread_partition_table(self)
    }

    fn as_file(&self) -> Option<&File> {
        Some(self)
    }
}

impl DeviceIo for Cursor<Vec<u8>> {
    fn size(&mut self) -> io::Result<u64> {
        Ok(self.get_ref().len() as u64)
    }
}

impl DeviceIo for Cursor<&mut [u8]> {
    fn size(&mut self) -> io::Result<u64> {
        Ok(self.get_ref().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_device_read_write_at() {
        let mut dev = Cursor::new(vec![0u8; 4096]);
        dev.write_at(1024, b"EFI PART").unwrap();

        let mut buf = [0u8; 8];
        dev.read_at(1024, &mut buf).unwrap();
        assert_eq!(&buf, b"EFI PART");
        assert_eq!(DeviceIo::size(&mut dev).unwrap(), 4096);
    }

    #[test]
    fn test_cursor_device_short_read() {
        let mut dev = Cursor::new(vec![0u8; 512]);
        let mut buf = [0u8; 16];
        assert!(dev.read_at(510, &mut buf).is_err());
    }
}
