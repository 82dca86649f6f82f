//! Treelet record stream codec.
//!
//! Treelet files are a flat stream of records, each framed as a 32-bit
//! little-endian length prefix followed by the payload. Fixed-width
//! integers are 4- or 8-byte records, packed structures are copied into a
//! record verbatim, and a previously written integer record can be patched
//! in place once its final value is known.

#![allow(dead_code)]
use crate::core::error::{Error, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

/// Sequential writer for the record stream.
pub struct RecordWriter<W: Write + Seek> {
    w: W,
}

impl RecordWriter<BufWriter<File>> {
    /// Creates a record writer over a new file.
    ///
    /// * `path` - The file path.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write + Seek> RecordWriter<W> {
    /// Creates a record writer over a stream.
    ///
    /// * `w` - The stream.
    pub fn new(w: W) -> Self {
        Self { w }
    }

    /// Returns the current byte offset in the stream.
    pub fn offset(&mut self) -> Result<u64> {
        Ok(self.w.stream_position()?)
    }

    /// Writes a `u32` record and returns the offset of the record start.
    ///
    /// * `v` - The value.
    pub fn write_u32(&mut self, v: u32) -> Result<u64> {
        let offset = self.offset()?;
        self.w.write_u32::<LittleEndian>(4)?;
        self.w.write_u32::<LittleEndian>(v)?;
        Ok(offset)
    }

    /// Writes a `u64` record.
    ///
    /// * `v` - The value.
    pub fn write_u64(&mut self, v: u64) -> Result<u64> {
        let offset = self.offset()?;
        self.w.write_u32::<LittleEndian>(8)?;
        self.w.write_u64::<LittleEndian>(v)?;
        Ok(offset)
    }

    /// Writes a byte blob record.
    ///
    /// * `bytes` - The payload.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<u64> {
        let offset = self.offset()?;
        self.w.write_u32::<LittleEndian>(bytes.len() as u32)?;
        self.w.write_all(bytes)?;
        Ok(offset)
    }

    /// Rewrites the payload of a `u32` record written earlier.
    ///
    /// * `record_offset` - Offset returned by the original `write_u32`.
    /// * `v`             - The new value.
    pub fn patch_u32(&mut self, record_offset: u64, v: u32) -> Result<()> {
        let end = self.w.stream_position()?;
        self.w.seek(SeekFrom::Start(record_offset + 4))?;
        self.w.write_u32::<LittleEndian>(v)?;
        self.w.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    /// Flushes the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        Ok(self.w.flush()?)
    }
}

/// Sequential reader over an in-memory record stream.
pub struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,

    /// Treelet id used in error payloads.
    id: u32,
}

impl<'a> RecordReader<'a> {
    /// Creates a reader over a buffer.
    ///
    /// * `buf` - The record stream.
    /// * `id`  - Treelet id reported in format errors.
    pub fn new(buf: &'a [u8], id: u32) -> Self {
        Self { buf, pos: 0, id }
    }

    /// Returns true when the stream is exhausted.
    pub fn eof(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Reads the next record as a raw byte slice.
    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        if self.pos + 4 > self.buf.len() {
            return Err(Error::format(self.id, "truncated record length"));
        }
        let len = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap()) as usize;
        self.pos += 4;

        if self.pos + len > self.buf.len() {
            return Err(Error::format(
                self.id,
                format!("record length {} overruns buffer", len),
            ));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Reads the next record as a `u32`.
    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes()?;
        if bytes.len() != 4 {
            return Err(Error::format(
                self.id,
                format!("expected u32 record, got {} bytes", bytes.len()),
            ));
        }
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Reads the next record as a `u64`.
    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes()?;
        if bytes.len() != 8 {
            return Err(Error::format(
                self.id,
                format!("expected u64 record, got {} bytes", bytes.len()),
            ));
        }
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Returns the byte offset of the next record.
    pub fn position(&self) -> usize {
        self.pos
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip() {
        let mut w = RecordWriter::new(Cursor::new(Vec::new()));
        w.write_u32(7).unwrap();
        w.write_u64(1 << 40).unwrap();
        w.write_bytes(b"payload").unwrap();
        let buf = {
            w.flush().unwrap();
            w.w.into_inner()
        };

        let mut r = RecordReader::new(&buf, 0);
        assert_eq!(r.read_u32().unwrap(), 7);
        assert_eq!(r.read_u64().unwrap(), 1 << 40);
        assert_eq!(r.read_bytes().unwrap(), b"payload");
        assert!(r.eof());
    }

    #[test]
    fn patch_backfills_earlier_record() {
        let mut w = RecordWriter::new(Cursor::new(Vec::new()));
        let count_offset = w.write_u32(0).unwrap();
        w.write_bytes(b"abc").unwrap();
        w.patch_u32(count_offset, 3).unwrap();
        let buf = w.w.into_inner();

        let mut r = RecordReader::new(&buf, 0);
        assert_eq!(r.read_u32().unwrap(), 3);
        assert_eq!(r.read_bytes().unwrap(), b"abc");
    }

    #[test]
    fn overrun_is_a_format_error() {
        let mut w = RecordWriter::new(Cursor::new(Vec::new()));
        w.write_bytes(b"abcdef").unwrap();
        let mut buf = w.w.into_inner();
        buf.truncate(6);

        let mut r = RecordReader::new(&buf, 3);
        match r.read_bytes() {
            Err(Error::Format { treelet, .. }) => assert_eq!(treelet, 3),
            other => panic!("expected format error, got {other:?}"),
        }
    }
}
