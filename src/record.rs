//! Record decoding. Btree cells hold records; a record is a header of
//! serial-type varints followed by the column values.
//!
//! Layout per https://www.sqlite.org/fileformat.html#record_format :
//! `[header_size varint][serial_type varint]...[value bytes]...`
//! where `header_size` includes its own varint length.

use crate::serial_type;
use crate::serial_type::Value;
use crate::varint;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Record header size {header_size} does not fit the payload of {payload_len} bytes.")]
    HeaderOverrunsPayload {
        header_size: usize,
        payload_len: usize,
    },
    #[error("Record header size {0} is not a valid length.")]
    InvalidHeaderSize(i64),
    #[error("Record body ends at {body_end} but the payload holds {payload_len} bytes.")]
    BodyOverrunsPayload { body_end: usize, payload_len: usize },
    #[error("Error decoding varint in record: {0}")]
    Varint(#[from] varint::Error),
    #[error("Error decoding record column: {0}")]
    SerialType(#[from] serial_type::Error),
}

/// One decoded column of a record.
#[derive(Debug, Clone)]
pub struct RecordColumn<'a> {
    pub index: usize,
    pub serial_type: i64,
    pub serial_type_varint_length: usize,
    pub content_size: usize,
    /// Offset of the value within the record payload.
    pub value_offset: usize,
    pub value: Value<'a>,
}

/// A fully decoded record, borrowing the payload bytes.
#[derive(Debug, Clone)]
pub struct Record<'a> {
    pub header_byte_size: usize,
    pub header_byte_size_varint_length: usize,
    pub columns: Vec<RecordColumn<'a>>,
    /// Offset one past the last body byte, relative to the payload start.
    pub body_end: usize,
}

impl<'a> Record<'a> {
    /// Decode a record from a cell payload.
    ///
    /// The payload may extend past the record body (trailing bytes are
    /// ignored); a header or body reaching past the payload is an error.
    pub fn parse(payload: &'a [u8]) -> Result<Record<'a>, Error> {
        let (header_size, header_size_len) = varint::decode(payload, 0)?;
        if header_size < header_size_len as i64 {
            return Err(Error::InvalidHeaderSize(header_size));
        }
        let header_size = header_size as usize;
        if header_size > payload.len() {
            return Err(Error::HeaderOverrunsPayload {
                header_size,
                payload_len: payload.len(),
            });
        }

        let mut columns = Vec::new();
        let mut header_offset = header_size_len;
        let mut value_offset = header_size;
        while header_offset < header_size {
            let (serial_type, serial_type_len) = varint::decode(payload, header_offset)?;
            let content_size = serial_type::content_size(serial_type)?;
            if value_offset + content_size > payload.len() {
                return Err(Error::BodyOverrunsPayload {
                    body_end: value_offset + content_size,
                    payload_len: payload.len(),
                });
            }
            let (read, value) = serial_type::value_at(serial_type, payload, value_offset)?;
            columns.push(RecordColumn {
                index: columns.len(),
                serial_type,
                serial_type_varint_length: serial_type_len,
                content_size,
                value_offset,
                value,
            });
            header_offset += serial_type_len;
            value_offset += read;
        }

        Ok(Record {
            header_byte_size: header_size,
            header_byte_size_varint_length: header_size_len,
            columns,
            body_end: value_offset,
        })
    }

    pub fn values(&self) -> Vec<&Value<'a>> {
        self.columns.iter().map(|c| &c.value).collect()
    }

    /// The simplified serial type of each column, in order.
    pub fn simplified_serial_types(&self) -> Vec<i64> {
        self.columns
            .iter()
            .map(|c| serial_type::simplified(c.serial_type))
            .collect()
    }
}
