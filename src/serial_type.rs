//! Serial types describe how SQLite stores one column value in a record.
//!
//! A serial type is a non-negative integer carrying both the storage class
//! and the byte length of the value. Carving additionally works with
//! *simplified* serial types, where every BLOB collapses to `BLOB_ID` and
//! every TEXT to `TEXT_ID` so that a per-column signature stays small.
use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use enum_as_inner::EnumAsInner;
use std::io::Read;

/// Simplified serial type standing for any BLOB (serial type >= 12, even).
pub const BLOB_ID: i64 = -1;
/// Simplified serial type standing for any TEXT (serial type >= 13, odd).
pub const TEXT_ID: i64 = -2;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Serial type {0} is reserved for internal use.")]
    ReservedSerialType(i64),
    #[error("Serial type {0} is not a valid serial type code.")]
    InvalidSerialTypeCode(i64),
    #[error("Record body too short: serial type {serial_type} needs {needed} bytes at offset {offset}, {available} available.")]
    ShortBody {
        serial_type: i64,
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("Error reading record content: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded column value borrowing from the record body.
///
/// TEXT stays raw bytes in the database text encoding; transcoding is the
/// exporter's concern, not the decoder's.
#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum Value<'a> {
    Null,
    Int(i64),
    Real(f64),
    Blob(&'a [u8]),
    Text(&'a [u8]),
}

impl<'a> Value<'a> {
    pub fn to_owned(&self) -> OwnedValue {
        match self {
            Value::Null => OwnedValue::Null,
            Value::Int(i) => OwnedValue::Int(*i),
            Value::Real(f) => OwnedValue::Real(*f),
            Value::Blob(b) => OwnedValue::Blob(b.to_vec()),
            Value::Text(t) => OwnedValue::Text(t.to_vec()),
        }
    }
}

/// An owning column value. Carved cells outlive the page bytes they were
/// found in, so they hold these instead of [`Value`].
#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum OwnedValue {
    Null,
    Int(i64),
    Real(f64),
    Blob(Vec<u8>),
    Text(Vec<u8>),
}

/// Content size in bytes for a serial type.
///
/// Fails on the reserved codes 10 and 11 and on negative codes, which never
/// appear in a well-formed record header.
pub fn content_size(serial_type: i64) -> Result<usize, Error> {
    match serial_type {
        // Serial Type	Content Size	Meaning
        // 0	        0	            Value is a NULL.
        0 => Ok(0),
        // 1	        1	            8-bit twos-complement integer.
        1 => Ok(1),
        // 2	        2	            Big-endian 16-bit twos-complement integer.
        2 => Ok(2),
        // 3	        3	            Big-endian 24-bit twos-complement integer.
        3 => Ok(3),
        // 4	        4	            Big-endian 32-bit twos-complement integer.
        4 => Ok(4),
        // 5	        6	            Big-endian 48-bit twos-complement integer.
        5 => Ok(6),
        // 6	        8	            Big-endian 64-bit twos-complement integer.
        // 7	        8	            Big-endian IEEE 754-2008 64-bit float.
        6 | 7 => Ok(8),
        // 8	        0	            Integer constant 0 (schema format 4+).
        // 9	        0	            Integer constant 1 (schema format 4+).
        8 | 9 => Ok(0),
        // 10,11: reserved for internal use.
        10 | 11 => Err(Error::ReservedSerialType(serial_type)),
        // N>=12, even: BLOB of (N-12)/2 bytes.
        x if x >= 12 && x % 2 == 0 => Ok((x as usize - 12) / 2),
        // N>=13, odd: TEXT of (N-13)/2 bytes in the database encoding.
        x if x >= 13 => Ok((x as usize - 13) / 2),
        x => Err(Error::InvalidSerialTypeCode(x)),
    }
}

/// Collapse a serial type to its simplified form for signature matching.
pub fn simplified(serial_type: i64) -> i64 {
    if serial_type >= 12 {
        if serial_type % 2 == 0 {
            BLOB_ID
        } else {
            TEXT_ID
        }
    } else {
        serial_type
    }
}

/// Decode one column value from a record body.
///
/// Returns the number of body bytes consumed and the value. The slice for
/// TEXT and BLOB borrows from `body`.
pub fn value_at<'a>(
    serial_type: i64,
    body: &'a [u8],
    offset: usize,
) -> Result<(usize, Value<'a>), Error> {
    let size = content_size(serial_type)?;
    let available = body.len().saturating_sub(offset);
    if available < size {
        return Err(Error::ShortBody {
            serial_type,
            offset,
            needed: size,
            available,
        });
    }
    let data = &body[offset..offset + size];
    let mut c = std::io::Cursor::new(data);
    let value = match serial_type {
        0 => Value::Null,
        1 => Value::Int(c.read_i8()? as i64),
        2 => Value::Int(c.read_i16::<BigEndian>()? as i64),
        3 => {
            let mut bytes = [0_u8; 4];
            c.read_exact(&mut bytes[1..])?;
            bytes[0] = match (bytes[1] & 0b1000_0000) > 0 {
                false => 0,
                true => 0xff,
            };
            Value::Int(i32::from_be_bytes(bytes) as i64)
        }
        4 => Value::Int(c.read_i32::<BigEndian>()? as i64),
        5 => {
            let mut bytes = [0_u8; 8];
            c.read_exact(&mut bytes[2..])?;
            let fill = match (bytes[2] & 0b1000_0000) > 0 {
                false => 0,
                true => 0xff,
            };
            bytes[0] = fill;
            bytes[1] = fill;
            Value::Int(i64::from_be_bytes(bytes))
        }
        6 => Value::Int(c.read_i64::<BigEndian>()?),
        7 => Value::Real(c.read_f64::<BigEndian>()?),
        8 => Value::Int(0),
        9 => Value::Int(1),
        x if x % 2 == 0 => Value::Blob(data),
        _ => Value::Text(data),
    };
    Ok((size, value))
}
