//! Binary envelope for pending manifests.
//!
//! Layout:
//!
//! ```text
//! +-------+---------+----------+----------------------------+
//! | magic | version | checksum | body                       |
//! | 4B    | u16 BE  | u64 BE   | JSON array of descriptors  |
//! +-------+---------+----------+----------------------------+
//! ```
//!
//! The checksum is a [`seahash`] of the body so a torn or bit-rotted
//! manifest is reported as corrupt rather than half-parsed.

use thiserror::Error;

use crate::model::DataFileDescriptor;

const MAGIC: &[u8; 4] = b"TCPM";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 8;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("truncated manifest: {0} bytes")]
    Truncated(usize),
    #[error("bad magic {0:?}")]
    BadMagic([u8; 4]),
    #[error("unsupported manifest format version {0}")]
    UnsupportedVersion(u16),
    #[error("checksum mismatch: header says {expected:#018x}, body hashes to {found:#018x}")]
    ChecksumMismatch { expected: u64, found: u64 },
    #[error("error decoding manifest body: {0}")]
    Body(#[from] serde_json::Error),
}

pub fn encode(files: &[DataFileDescriptor]) -> Result<Vec<u8>, CodecError> {
    let body = serde_json::to_vec(files)?;
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    buf.extend_from_slice(&seahash::hash(&body).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> Result<Vec<DataFileDescriptor>, CodecError> {
    let truncated = || CodecError::Truncated(bytes.len());
    let (magic, rest) = bytes.split_first_chunk::<4>().ok_or_else(truncated)?;
    let (version, rest) = rest.split_first_chunk::<2>().ok_or_else(truncated)?;
    let (checksum, body) = rest.split_first_chunk::<8>().ok_or_else(truncated)?;

    if magic != MAGIC {
        return Err(CodecError::BadMagic(*magic));
    }
    let version = u16::from_be_bytes(*version);
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let expected = u64::from_be_bytes(*checksum);
    let found = seahash::hash(body);
    if expected != found {
        return Err(CodecError::ChecksumMismatch { expected, found });
    }

    Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
fn sample() -> Vec<DataFileDescriptor> {
    use crate::model::FileFormat;

    vec![
        DataFileDescriptor::new("data-1.parquet", FileFormat::Parquet, 1024, 10)
            .with_partition("day", "2024-01-01"),
        DataFileDescriptor::new("data-2.orc", FileFormat::Orc, 2048, 20),
    ]
}

#[test]
fn decode_reads_back_in_order() {
    let files = sample();
    let bytes = encode(&files).unwrap();
    assert_eq!(&bytes[..4], b"TCPM");
    assert_eq!(decode(&bytes).unwrap(), files);
}

#[test]
fn decode_detects_flipped_bit() {
    let mut bytes = encode(&sample()).unwrap();
    let last = bytes.len() - 2;
    bytes[last] ^= 0x01;
    assert!(matches!(
        decode(&bytes),
        Err(CodecError::ChecksumMismatch { .. })
    ));
}

#[test]
fn decode_rejects_short_and_foreign_input() {
    assert!(matches!(decode(b"TCPM"), Err(CodecError::Truncated(4))));
    assert!(matches!(
        decode(b"PAR1\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00[]"),
        Err(CodecError::BadMagic(_))
    ));
}

#[test]
fn decode_rejects_future_version() {
    let mut bytes = encode(&sample()).unwrap();
    bytes[5] = 2;
    assert!(matches!(
        decode(&bytes),
        Err(CodecError::UnsupportedVersion(2))
    ));
}
