//! Checkpoint files.
//!
//! A checkpoint is a plain concatenation of records, little-endian, no header:
//!
//! ```text
//! u32 key_len | u8[key_len] key | u32 rank | u32[rank] dims | f32[prod(dims)] values
//! ```
//!
//! Keys are stored relative to the scope that was active at save time and
//! re-rooted under the scope active at load time.

use crate::error::Result;
use crate::state::{State, join_keys, relative_key};
use crate::tensor::{Kind, RawTensor, numel_of};
use bincode::config::{self, Config};
use bincode::de::read::Reader;
use bincode::de::{Decode, Decoder};
use bincode::enc::write::Writer;
use bincode::enc::{Encode, Encoder};
use bincode::error::{DecodeError, EncodeError};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

/// Upper bound on bytes one record may claim, so a corrupt length field
/// fails to decode instead of attempting a huge allocation.
const RECORD_LIMIT: usize = 1 << 30;

/// Fixed-width little-endian integers, which is what makes the bincode
/// stream match the record layout byte for byte.
pub fn record_config() -> impl Config {
    config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
        .with_limit::<RECORD_LIMIT>()
}

// ===== RECORDS =====

/// Borrowed view of one tensor, for writing.
pub struct RecordRef<'a> {
    pub key: &'a str,
    pub shape: &'a [usize],
    pub data: &'a [f32],
}

/// One decoded tensor record.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorRecord {
    pub key: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

fn encode_u32<E: Encoder>(
    n: usize,
    what: &'static str,
    encoder: &mut E,
) -> std::result::Result<(), EncodeError> {
    u32::try_from(n)
        .map_err(|_| EncodeError::Other(what))?
        .encode(encoder)
}

impl RecordRef<'_> {
    /// Encoded size in bytes, saturating on overflow.
    pub fn encoded_len(&self) -> usize {
        let numel = numel_of(self.shape).unwrap_or(usize::MAX);
        (8 + self.key.len())
            .saturating_add(self.shape.len().saturating_mul(4))
            .saturating_add(numel.saturating_mul(4))
    }
}

impl Encode for RecordRef<'_> {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> std::result::Result<(), EncodeError> {
        if self.encoded_len() > RECORD_LIMIT {
            return Err(EncodeError::Other("record exceeds the per-record size limit"));
        }
        encode_u32(self.key.len(), "key longer than u32::MAX bytes", encoder)?;
        encoder.writer().write(self.key.as_bytes())?;
        encode_u32(self.shape.len(), "rank exceeds u32::MAX", encoder)?;
        for &dim in self.shape {
            encode_u32(dim, "dimension exceeds u32::MAX", encoder)?;
        }
        for value in self.data {
            value.encode(encoder)?;
        }
        Ok(())
    }
}

impl<Context> Decode<Context> for TensorRecord {
    fn decode<D: Decoder<Context = Context>>(
        decoder: &mut D,
    ) -> std::result::Result<Self, DecodeError> {
        let key_len = u32::decode(decoder)? as usize;
        decoder.claim_bytes_read(key_len)?;
        let mut key = vec![0u8; key_len];
        decoder.reader().read(&mut key)?;
        let key = String::from_utf8(key).map_err(|e| DecodeError::Utf8 {
            inner: e.utf8_error(),
        })?;

        // claim up front so a corrupt length cannot drive the allocation,
        // then hand the bytes back for the element reads to claim again
        let rank = u32::decode(decoder)? as usize;
        decoder.claim_bytes_read(rank.saturating_mul(4))?;
        let mut shape = Vec::with_capacity(rank);
        decoder.unclaim_bytes_read(rank * 4);
        for _ in 0..rank {
            shape.push(u32::decode(decoder)? as usize);
        }

        let numel = numel_of(&shape).ok_or(DecodeError::Other("tensor size overflows usize"))?;
        decoder.claim_bytes_read(numel.saturating_mul(4))?;
        let mut data = Vec::with_capacity(numel);
        decoder.unclaim_bytes_read(numel * 4);
        for _ in 0..numel {
            data.push(f32::decode(decoder)?);
        }

        Ok(TensorRecord { key, shape, data })
    }
}

// ===== SAVE / LOAD =====

impl State {
    /// Write every entry under the active scope to `path`, keyed relative to
    /// that scope, in key order. Returns the number of records written.
    ///
    /// A tensor whose record would exceed `RECORD_LIMIT` bytes (1 GiB) fails
    /// the save with [`TnnError::Encode`](crate::TnnError::Encode), since
    /// `load` could not read it back.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        let entries = self.enumerate("");

        for (key, tensor) in &entries {
            let t = tensor.borrow();
            let record = RecordRef {
                key,
                shape: &t.shape,
                data: &t.data,
            };
            bincode::encode_into_std_write(&record, &mut writer, record_config())?;
        }
        writer.flush()?;

        info!(
            path = %path.display(),
            records = entries.len(),
            scope = self.scope(),
            "saved state"
        );
        Ok(entries.len())
    }

    /// Read records from `path` until end of file and insert each as an
    /// Unclaimed tensor under the active scope, replacing entries with the
    /// same key. A truncated or undecodable record ends the load.
    ///
    /// Returns the number of records loaded.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let mut reader = BufReader::new(File::open(path)?);
        let mut loaded = 0;

        loop {
            if reader.fill_buf()?.is_empty() {
                break;
            }
            let record: TensorRecord =
                match bincode::decode_from_std_read(&mut reader, record_config()) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(
                            path = %path.display(),
                            after = loaded,
                            error = %e,
                            "stopping at unreadable record"
                        );
                        break;
                    }
                };
            let key = join_keys(self.scope(), &record.key);
            let tensor = RawTensor::new(record.data, &record.shape, Kind::Unclaimed);
            self.insert_absolute(key, tensor);
            loaded += 1;
        }

        info!(
            path = %path.display(),
            records = loaded,
            scope = self.scope(),
            "loaded state"
        );
        Ok(loaded)
    }
}

/// Decode every complete record in `bytes`, stopping at the first short one.
pub fn decode_records(mut bytes: &[u8]) -> Vec<TensorRecord> {
    let mut records = Vec::new();
    while !bytes.is_empty() {
        match bincode::decode_from_slice::<TensorRecord, _>(bytes, record_config()) {
            Ok((record, used)) => {
                records.push(record);
                bytes = &bytes[used..];
            }
            Err(_) => break,
        }
    }
    records
}

/// Encode `(key, tensor)` records, keys taken relative to `scope`.
pub fn encode_records(entries: &[(String, crate::Tensor)], scope: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for (key, tensor) in entries {
        let Some(rel) = relative_key(key, scope) else {
            continue;
        };
        let t = tensor.borrow();
        let record = RecordRef {
            key: rel,
            shape: &t.shape,
            data: &t.data,
        };
        bincode::encode_into_std_write(&record, &mut out, record_config())?;
    }
    Ok(out)
}
