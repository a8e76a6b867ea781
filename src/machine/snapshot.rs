//! Snapshot stream: a little endian `u64` pair count, then for every pair a `u64` size followed by
//! that many bytes of JSON `{"Key": .., "Val": ..}`. Pairs are written in key order.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{FurrowError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    #[serde(rename = "Key")]
    pub key: Vec<u8>,
    #[serde(rename = "Val")]
    pub val: Vec<u8>,
}

/// Largest single pair accepted when reading, to fail fast on a corrupt size prefix.
const MAX_PAIR_SIZE: u64 = 64 * 1024 * 1024;

pub fn write_pairs<'a, I>(writer: &mut dyn Write, count: u64, pairs: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    writer.write_u64::<LittleEndian>(count)?;
    let mut written = 0;
    for (key, val) in pairs {
        let kv = serde_json::to_vec(&KeyValue {
            key: key.to_vec(),
            val: val.to_vec(),
        })?;
        writer.write_u64::<LittleEndian>(kv.len() as u64)?;
        writer.write_all(&kv)?;
        written += 1;
    }
    if written != count {
        return Err(FurrowError::internal(format!(
            "snapshot announced {} pairs but wrote {}",
            count, written
        )));
    }
    Ok(())
}

pub struct PairReader<'a> {
    reader: &'a mut dyn Read,
    remaining: u64,
}

impl<'a> PairReader<'a> {
    pub fn new(reader: &'a mut dyn Read) -> Result<Self> {
        let remaining = reader.read_u64::<LittleEndian>()?;
        Ok(PairReader { reader, remaining })
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    fn read_pair(&mut self) -> Result<KeyValue> {
        let size = self.reader.read_u64::<LittleEndian>()?;
        if size > MAX_PAIR_SIZE {
            return Err(FurrowError::serialization(format!(
                "snapshot pair of {} bytes exceeds limit",
                size
            )));
        }
        let mut buf = vec![0; size as usize];
        self.reader.read_exact(&mut buf)?;
        Ok(serde_json::from_slice(&buf)?)
    }
}

impl Iterator for PairReader<'_> {
    type Item = Result<KeyValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.read_pair())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_layout() {
        let mut out = Vec::new();
        write_pairs(&mut out, 1, vec![(&b"k"[..], &b"v"[..])]).unwrap();
        assert_eq!(&out[..8], &1u64.to_le_bytes());
        let kv = br#"{"Key":[107],"Val":[118]}"#;
        assert_eq!(&out[8..16], &(kv.len() as u64).to_le_bytes());
        assert_eq!(&out[16..], &kv[..]);
    }

    #[test]
    fn read_back_in_order() {
        let mut out = Vec::new();
        let pairs = vec![(&b"a"[..], &b"1"[..]), (&b"b"[..], &b"2"[..])];
        write_pairs(&mut out, 2, pairs).unwrap();

        let mut slice = out.as_slice();
        let reader = PairReader::new(&mut slice).unwrap();
        assert_eq!(reader.remaining(), 2);
        let read: Vec<KeyValue> = reader.collect::<Result<_>>().unwrap();
        assert_eq!(read[0].key, b"a");
        assert_eq!(read[1].val, b"2");
    }

    #[test]
    fn truncated_stream_fails() {
        let mut out = Vec::new();
        write_pairs(&mut out, 1, vec![(&b"a"[..], &b"1"[..])]).unwrap();
        out.truncate(out.len() - 2);
        let mut slice = out.as_slice();
        let mut reader = PairReader::new(&mut slice).unwrap();
        assert!(reader.next().unwrap().is_err());
    }
}
