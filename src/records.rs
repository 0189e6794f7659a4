
use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// On-disk size of one co-occurrence record: two u32 fields and one f32,
/// each written little-endian.
pub const RECORD_SIZE: usize = 12;

/// One co-occurrence triple. `target` is a global vocabulary id below the
/// target count, `context` is 0-based within the context band.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CoocRecord {
    pub target: u32,
    pub context: u32,
    pub weight: f32,
}

impl CoocRecord {
    pub fn key(&self) -> (u32, u32) {
        (self.target, self.context)
    }
}

/// Append a batch of records to a writer in the 12-byte wire layout.
pub fn write_records<W: Write>(writer: &mut W, records: &[CoocRecord]) -> io::Result<()> {
    for record in records {
        writer.write_u32::<LittleEndian>(record.target)?;
        writer.write_u32::<LittleEndian>(record.context)?;
        writer.write_f32::<LittleEndian>(record.weight)?;
    }
    Ok(())
}

/// Read the next record from a run stream.
///
/// Returns Ok(None) on a clean end of stream. A stream that ends in the
/// middle of a record yields an UnexpectedEof error, which the merger
/// reports as a corrupt run file.
pub fn read_record<R: Read>(reader: &mut R) -> io::Result<Option<CoocRecord>> {
    let mut frame = [0u8; RECORD_SIZE];
    let mut filled = 0;
    while filled < RECORD_SIZE {
        match reader.read(&mut frame[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    if filled == 0 {
        return Ok(None);
    }
    if filled < RECORD_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "partial co-occurrence record",
        ));
    }
    let mut cursor = Cursor::new(&frame[..]);
    let target = cursor.read_u32::<LittleEndian>()?;
    let context = cursor.read_u32::<LittleEndian>()?;
    let weight = cursor.read_f32::<LittleEndian>()?;
    Ok(Some(CoocRecord { target, context, weight }))
}
