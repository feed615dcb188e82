//! The on-disk record codec.
//!
//! Every segment file is a plain concatenation of records, each framed as:
//!
//! ```text
//! u32 total_size   // little-endian, inclusive of this field
//! u32 key_len
//! bytes key[key_len]
//! u8   data_type   // 0 = string, 1 = int64
//! u32  val_len
//! bytes value[val_len]   // int64 => val_len == 8, little-endian
//! ```
//!
//! so `total_size == 13 + key_len + val_len`. There is no per-record
//! checksum and no per-segment header; the framing above is the whole
//! format.

use std::io::Read;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{KvError, Result};

// fixed framing overhead: size(4) + key_len(4) + data_type(1) + val_len(4)
const RECORD_OVERHEAD: usize = 13;

/// The declared type of a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// raw UTF-8 bytes
    Str,
    /// a 64-bit signed integer, little-endian on disk
    Int64,
}

impl DataType {
    /// the single byte this type is encoded as on disk
    pub fn as_byte(self) -> u8 {
        match self {
            DataType::Str => 0,
            DataType::Int64 => 1,
        }
    }

    /// decodes a type byte read from disk
    pub fn from_byte(b: u8) -> Result<DataType> {
        match b {
            0 => Ok(DataType::Str),
            1 => Ok(DataType::Int64),
            other => Err(KvError::Corrupt(format!("unknown data type: {}", other))),
        }
    }
}

/// A typed value as stored in a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// a string value
    Str(String),
    /// an int64 value
    Int64(i64),
}

impl Value {
    /// the [`DataType`] tag this value is written with
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Str(_) => DataType::Str,
            Value::Int64(_) => DataType::Int64,
        }
    }
}

/// One key/value unit as written to a segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// the record's key
    pub key: String,
    /// the record's typed value
    pub value: Value,
}

impl Record {
    /// builds a string record
    pub fn new_str<K: Into<String>, V: Into<String>>(key: K, value: V) -> Record {
        Record {
            key: key.into(),
            value: Value::Str(value.into()),
        }
    }

    /// builds an int64 record
    pub fn new_int64<K: Into<String>>(key: K, value: i64) -> Record {
        Record {
            key: key.into(),
            value: Value::Int64(value),
        }
    }

    /// Serializes the record into its on-disk framing.
    pub fn encode(&self) -> Vec<u8> {
        let key = self.key.as_bytes();
        let mut int_buf = [0u8; 8];
        let value_bytes: &[u8] = match &self.value {
            Value::Str(s) => s.as_bytes(),
            Value::Int64(i) => {
                LittleEndian::write_i64(&mut int_buf, *i);
                &int_buf
            }
        };

        let kl = key.len();
        let vl = value_bytes.len();
        let total = RECORD_OVERHEAD + kl + vl;
        let mut out = vec![0u8; total];
        LittleEndian::write_u32(&mut out[0..4], total as u32);
        LittleEndian::write_u32(&mut out[4..8], kl as u32);
        out[8..8 + kl].copy_from_slice(key);
        out[8 + kl] = self.value.data_type().as_byte();
        LittleEndian::write_u32(&mut out[8 + kl + 1..8 + kl + 5], vl as u32);
        out[8 + kl + 5..].copy_from_slice(value_bytes);
        out
    }

    /// Deserializes a record from a buffer holding one full encoded record,
    /// including the leading size field.
    ///
    /// Every length is validated against the remaining input before it is
    /// used, so a truncated or garbage buffer surfaces as
    /// [`KvError::Corrupt`] rather than a panic.
    pub fn decode(input: &[u8]) -> Result<Record> {
        if input.len() < 4 {
            return Err(KvError::Corrupt("input too short to read size".into()));
        }
        let total = LittleEndian::read_u32(&input[0..4]);
        if total <= 4 {
            return Err(KvError::Corrupt(format!("invalid record size: {}", total)));
        }

        if input.len() < 8 {
            return Err(KvError::Corrupt("input too short to read key length".into()));
        }
        let key_len = LittleEndian::read_u32(&input[4..8]) as usize;

        let key_end = 8 + key_len;
        // +1 for the data type byte
        if input.len() < key_end + 1 {
            return Err(KvError::Corrupt(
                "input too short to read key or data type".into(),
            ));
        }
        let key = String::from_utf8(input[8..key_end].to_vec())
            .map_err(|e| KvError::Corrupt(format!("key is not valid UTF-8: {}", e)))?;
        let data_type = DataType::from_byte(input[key_end])?;

        let vl_off = key_end + 1;
        if input.len() < vl_off + 4 {
            return Err(KvError::Corrupt(
                "input too short to read value length".into(),
            ));
        }
        let val_len = LittleEndian::read_u32(&input[vl_off..vl_off + 4]) as usize;

        let val_off = vl_off + 4;
        if input.len() < val_off + val_len {
            return Err(KvError::Corrupt(format!(
                "input too short to read value (expected {} bytes at offset {})",
                val_len, val_off
            )));
        }
        let value_bytes = &input[val_off..val_off + val_len];

        let value = match data_type {
            DataType::Str => Value::Str(
                String::from_utf8(value_bytes.to_vec())
                    .map_err(|e| KvError::Corrupt(format!("value is not valid UTF-8: {}", e)))?,
            ),
            DataType::Int64 => {
                if val_len != 8 {
                    return Err(KvError::Corrupt(format!(
                        "invalid length for int64 value: expected 8, got {}",
                        val_len
                    )));
                }
                Value::Int64(LittleEndian::read_i64(value_bytes))
            }
        };

        Ok(Record { key, value })
    }

    /// Reads and deserializes one record from a reader.
    ///
    /// Returns `Ok(None)` only on a clean end of stream, i.e. when zero
    /// bytes were available before the size prefix. A partial size prefix
    /// or a short body is reported as [`KvError::Corrupt`]; this is what
    /// lets segment scans tell "end of file" from "torn record".
    ///
    /// On success the returned `usize` is the exact number of bytes
    /// consumed, which equals the record's `total_size`.
    pub fn decode_from_reader<R: Read>(reader: &mut R) -> Result<Option<(Record, usize)>> {
        let mut size_buf = [0u8; 4];
        match read_full(reader, &mut size_buf)? {
            0 => return Ok(None),
            4 => {}
            n => {
                return Err(KvError::Corrupt(format!(
                    "truncated record size prefix: got {} of 4 bytes",
                    n
                )))
            }
        }
        let total = LittleEndian::read_u32(&size_buf);
        if total <= 4 {
            return Err(KvError::Corrupt(format!("invalid record size: {}", total)));
        }
        let total = total as usize;

        let mut full = vec![0u8; total];
        full[0..4].copy_from_slice(&size_buf);
        let body_len = total - 4;
        let got = read_full(reader, &mut full[4..])?;
        if got != body_len {
            return Err(KvError::Corrupt(format!(
                "truncated record body: expected {} bytes, got {}",
                body_len, got
            )));
        }

        let record = Record::decode(&full)?;
        Ok(Some((record, total)))
    }
}

/// Reads until `buf` is full or the stream ends, returning the number of
/// bytes actually read. Unlike `read_exact` this keeps "nothing at all"
/// distinguishable from "some but not enough".
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(record: Record) {
        let encoded = record.encode();
        let decoded = Record::decode(&encoded).expect("decode failed");
        assert_eq!(decoded, record);

        let mut cursor = Cursor::new(encoded.clone());
        let (streamed, consumed) = Record::decode_from_reader(&mut cursor)
            .expect("decode_from_reader failed")
            .expect("unexpected end of stream");
        assert_eq!(streamed, record);
        assert_eq!(consumed, encoded.len());
        // nothing may remain after one record
        assert!(matches!(
            Record::decode_from_reader(&mut cursor),
            Ok(None)
        ));
    }

    #[test]
    fn encode_decode_string_values() {
        round_trip(Record::new_str("testKey", "testValue"));
        round_trip(Record::new_str("emptyVal", ""));
        round_trip(Record::new_str("", "value for empty key"));
        round_trip(Record::new_str("unicode", "日本語 værdi ламповий"));
        round_trip(Record::new_str("k".repeat(1024), "big key"));
    }

    #[test]
    fn encode_decode_int64_values() {
        for v in [i64::MIN, -1, 0, 1, i64::MAX, 12_345_678_912_345] {
            round_trip(Record::new_int64("intKey", v));
        }
    }

    #[test]
    fn encoded_layout_is_bit_exact() {
        let encoded = Record::new_int64("ab", 1).encode();
        // 13 overhead + 2 key bytes + 8 value bytes
        assert_eq!(encoded.len(), 23);
        assert_eq!(&encoded[0..4], &23u32.to_le_bytes());
        assert_eq!(&encoded[4..8], &2u32.to_le_bytes());
        assert_eq!(&encoded[8..10], b"ab");
        assert_eq!(encoded[10], 1);
        assert_eq!(&encoded[11..15], &8u32.to_le_bytes());
        assert_eq!(&encoded[15..23], &1i64.to_le_bytes());
    }

    #[test]
    fn decode_rejects_short_input() {
        // declared size 10, no data behind it
        let short = [0x0Au8, 0x00, 0x00, 0x00];
        assert!(matches!(
            Record::decode(&short),
            Err(KvError::Corrupt(_))
        ));
        assert!(matches!(Record::decode(&[1, 2]), Err(KvError::Corrupt(_))));
    }

    #[test]
    fn decode_rejects_undersized_total() {
        let bad = 3u32.to_le_bytes();
        assert!(matches!(Record::decode(&bad), Err(KvError::Corrupt(_))));
    }

    #[test]
    fn decode_rejects_bad_int64_length() {
        let mut encoded = Record::new_str("k", "1234").encode();
        // flip the type byte to int64 while val_len stays 4
        encoded[9] = 1;
        assert!(matches!(
            Record::decode(&encoded),
            Err(KvError::Corrupt(_))
        ));
    }

    #[test]
    fn decode_rejects_unknown_type_byte() {
        let mut encoded = Record::new_str("k", "v").encode();
        encoded[9] = 7;
        assert!(matches!(
            Record::decode(&encoded),
            Err(KvError::Corrupt(_))
        ));
    }

    #[test]
    fn reader_distinguishes_clean_eof_from_truncation() {
        // empty stream: clean end
        let mut empty = Cursor::new(Vec::new());
        assert!(matches!(Record::decode_from_reader(&mut empty), Ok(None)));

        // partial size prefix: corruption
        let mut partial = Cursor::new(vec![0x20, 0x00]);
        assert!(matches!(
            Record::decode_from_reader(&mut partial),
            Err(KvError::Corrupt(_))
        ));

        // full prefix, short body: corruption
        let encoded = Record::new_str("key1", "value1").encode();
        let mut torn = Cursor::new(encoded[..encoded.len() - 3].to_vec());
        assert!(matches!(
            Record::decode_from_reader(&mut torn),
            Err(KvError::Corrupt(_))
        ));
    }
}
