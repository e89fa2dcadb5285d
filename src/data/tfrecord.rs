//! Reader for TFRecord shards holding `tf.train.Example` messages.
//!
//! Framing per record: `u64` little-endian payload length, masked CRC32C of
//! the length bytes, the payload, masked CRC32C of the payload.

use std::path::Path;

use crate::error::{Error, Result};

const CRC32C_POLY: u32 = 0x82F6_3B78;
const CRC_MASK_DELTA: u32 = 0xA282_EAD8;

const CRC32C_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 == 1 {
                (crc >> 1) ^ CRC32C_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

pub fn crc32c(bytes: &[u8]) -> u32 {
    !bytes.iter().fold(!0u32, |crc, &byte| {
        CRC32C_TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8)
    })
}

pub fn masked_crc32c(bytes: &[u8]) -> u32 {
    let crc = crc32c(bytes);
    ((crc >> 15) | (crc << 17)).wrapping_add(CRC_MASK_DELTA)
}

/// Every record payload of one shard, checksums verified.
pub fn read_records(path: &Path) -> Result<Vec<Vec<u8>>> {
    let bytes = std::fs::read(path)?;
    let corrupt = |offset: usize, reason: &str| Error::Record {
        path: path.to_path_buf(),
        offset: offset as u64,
        reason: reason.to_owned(),
    };

    let mut records = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let header = bytes
            .get(offset..offset + 12)
            .ok_or_else(|| corrupt(offset, "truncated header"))?;
        let (length_bytes, length_crc) = header.split_at(8);
        if masked_crc32c(length_bytes) != read_u32(length_crc) {
            return Err(corrupt(offset, "length checksum mismatch"));
        }

        let length = u64::from_le_bytes(length_bytes.try_into().unwrap_or_default()) as usize;
        let start = offset + 12;
        let end = start
            .checked_add(length)
            .filter(|end| end.checked_add(4).is_some_and(|end| end <= bytes.len()))
            .ok_or_else(|| corrupt(offset, "truncated payload"))?;
        let payload = &bytes[start..end];
        if masked_crc32c(payload) != read_u32(&bytes[end..end + 4]) {
            return Err(corrupt(offset, "payload checksum mismatch"));
        }

        records.push(payload.to_vec());
        offset = end + 4;
    }

    Ok(records)
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

// ////////////////////////////////////////////////////////////////////////////
// tf.train.Example

/// First value of the bytes feature `key`, or `None` when the example has no
/// such feature. `Err` carries a description of malformed input.
///
/// Example { features: Features = 1 }
/// Features { map<string, Feature> feature = 1 }
/// Feature { oneof { BytesList bytes_list = 1; ... } }
/// BytesList { repeated bytes value = 1 }
pub fn bytes_feature<'a>(
    example: &'a [u8],
    key: &str,
) -> std::result::Result<Option<&'a [u8]>, &'static str> {
    for features in fields(example, 1) {
        for entry in fields(features?, 1) {
            let entry = entry?;
            let name = fields(entry, 1).next().transpose()?;
            if name != Some(key.as_bytes()) {
                continue;
            }
            let Some(feature) = fields(entry, 2).next().transpose()? else {
                return Ok(None);
            };
            let Some(bytes_list) = fields(feature, 1).next().transpose()? else {
                return Ok(None);
            };
            return fields(bytes_list, 1).next().transpose();
        }
    }
    Ok(None)
}

/// Length-delimited fields with number `field` in a protobuf message; other
/// fields are skipped.
fn fields<'a>(
    message: &'a [u8],
    field: u64,
) -> impl Iterator<Item = std::result::Result<&'a [u8], &'static str>> {
    let mut reader = WireReader { buf: message, pos: 0 };
    std::iter::from_fn(move || loop {
        match reader.next_field() {
            Ok(None) => return None,
            Ok(Some((number, Some(value)))) if number == field => return Some(Ok(value)),
            Ok(Some(_)) => continue,
            Err(err) => {
                reader.pos = reader.buf.len();
                return Some(Err(err));
            }
        }
    })
}

struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}
impl<'a> WireReader<'a> {
    /// Next `(field number, payload)`; payload is only kept for
    /// length-delimited fields.
    #[allow(clippy::type_complexity)]
    fn next_field(
        &mut self,
    ) -> std::result::Result<Option<(u64, Option<&'a [u8]>)>, &'static str> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let key = self.varint()?;
        let value = match key & 0x7 {
            0 => {
                self.varint()?;
                None
            }
            1 => {
                self.take(8)?;
                None
            }
            2 => {
                let length = self.varint()? as usize;
                Some(self.take(length)?)
            }
            5 => {
                self.take(4)?;
                None
            }
            _ => return Err("unsupported wire type"),
        };

        Ok(Some((key >> 3, value)))
    }

    fn varint(&mut self) -> std::result::Result<u64, &'static str> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = *self.buf.get(self.pos).ok_or("truncated varint")?;
            self.pos += 1;
            value |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err("varint too long")
    }

    fn take(&mut self, length: usize) -> std::result::Result<&'a [u8], &'static str> {
        let end = self
            .pos
            .checked_add(length)
            .filter(|end| *end <= self.buf.len())
            .ok_or("truncated field")?;
        let value = &self.buf[self.pos..end];
        self.pos = end;
        Ok(value)
    }
}
