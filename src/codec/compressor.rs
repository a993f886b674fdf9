//! Byte compressor behind the filter pipeline.
//!
//! Zlib and Zstd are built in; the blosc family rides behind the `blosc`
//! cargo feature. Level 0 stores blocks raw regardless of codec id.

use std::io::Read;

use crate::{CodecId, Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Compressor {
    Raw,
    Zlib { level: u32 },
    Zstd { level: i32 },
    #[cfg(feature = "blosc")]
    Blosc { cname: BloscCname, level: u8 },
}

#[cfg(feature = "blosc")]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BloscCname {
    BloscLz,
    Lz4,
    Lz4hc,
    Snappy,
}

impl Compressor {
    pub fn resolve(id: CodecId, level: u8) -> Result<Self> {
        if level == 0 {
            return Ok(Self::Raw);
        }
        match id {
            CodecId::Zlib => Ok(Self::Zlib {
                level: level as u32,
            }),
            CodecId::Zstd => Ok(Self::Zstd {
                level: level as i32,
            }),
            #[cfg(feature = "blosc")]
            CodecId::BloscLz => Ok(Self::Blosc {
                cname: BloscCname::BloscLz,
                level,
            }),
            #[cfg(feature = "blosc")]
            CodecId::Lz4 => Ok(Self::Blosc {
                cname: BloscCname::Lz4,
                level,
            }),
            #[cfg(feature = "blosc")]
            CodecId::Lz4hc => Ok(Self::Blosc {
                cname: BloscCname::Lz4hc,
                level,
            }),
            #[cfg(feature = "blosc")]
            CodecId::Snappy => Ok(Self::Blosc {
                cname: BloscCname::Snappy,
                level,
            }),
            CodecId::Lizard => Err(Error::invalid_argument("codec lizard is not available")),
            #[cfg(not(feature = "blosc"))]
            _ => Err(Error::invalid_argument(
                "codec requires the `blosc` feature",
            )),
        }
    }

    pub fn encode(&self, raw: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Raw => Ok(raw.to_vec()),
            Self::Zlib { level } => {
                let mut enc = flate2::write::ZlibEncoder::new(
                    Vec::with_capacity(raw.len() / 2 + 16),
                    flate2::Compression::new(*level),
                );
                std::io::Write::write_all(&mut enc, raw)?;
                Ok(enc.finish()?)
            }
            Self::Zstd { level } => Ok(zstd::bulk::compress(raw, *level)?),
            #[cfg(feature = "blosc")]
            Self::Blosc { cname, level } => blosc_encode(*cname, *level, raw),
        }
    }

    /// `raw_len` is the exact decoded size, known from the chunk frame.
    pub fn decode(&self, encoded: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        let out = match self {
            Self::Raw => encoded.to_vec(),
            Self::Zlib { .. } => {
                let mut out = Vec::with_capacity(raw_len);
                flate2::read::ZlibDecoder::new(encoded).read_to_end(&mut out)?;
                out
            }
            Self::Zstd { .. } => zstd::bulk::decompress(encoded, raw_len)?,
            #[cfg(feature = "blosc")]
            Self::Blosc { .. } => blosc_decode(encoded)?,
        };
        if out.len() != raw_len {
            return Err(Error::codec(format!(
                "decoded {} bytes where {} were expected",
                out.len(),
                raw_len
            )));
        }
        Ok(out)
    }
}

#[cfg(feature = "blosc")]
fn blosc_context(cname: BloscCname, level: u8) -> Result<blosc::Context> {
    let compressor = match cname {
        BloscCname::BloscLz => blosc::Compressor::BloscLZ,
        BloscCname::Lz4 => blosc::Compressor::LZ4,
        BloscCname::Lz4hc => blosc::Compressor::LZ4HC,
        BloscCname::Snappy => blosc::Compressor::Snappy,
    };
    let clevel = match level {
        1 => blosc::Clevel::L1,
        2 => blosc::Clevel::L2,
        3 => blosc::Clevel::L3,
        4 => blosc::Clevel::L4,
        5 => blosc::Clevel::L5,
        6 => blosc::Clevel::L6,
        7 => blosc::Clevel::L7,
        8 => blosc::Clevel::L8,
        _ => blosc::Clevel::L9,
    };
    blosc::Context::new()
        .compressor(compressor)
        .map_err(|_| Error::codec("blosc compressor not enabled"))
        .map(|c| c.clevel(clevel).shuffle(blosc::ShuffleMode::None))
}

#[cfg(feature = "blosc")]
fn blosc_encode(cname: BloscCname, level: u8, raw: &[u8]) -> Result<Vec<u8>> {
    let ctx = blosc_context(cname, level)?;
    Ok(ctx.compress(raw).into())
}

#[cfg(feature = "blosc")]
fn blosc_decode(encoded: &[u8]) -> Result<Vec<u8>> {
    // Decoding bytes into bytes, so the only risk is untrustworthy input.
    unsafe { blosc::decompress_bytes(encoded) }.map_err(|_| Error::codec("blosc decompression"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_backends() {
        let raw: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        for comp in [
            Compressor::Raw,
            Compressor::Zlib { level: 5 },
            Compressor::Zstd { level: 3 },
        ] {
            let enc = comp.encode(&raw).unwrap();
            assert_eq!(comp.decode(&enc, raw.len()).unwrap(), raw);
        }
    }

    #[test]
    fn level_zero_is_raw() {
        assert_eq!(
            Compressor::resolve(CodecId::Zstd, 0).unwrap(),
            Compressor::Raw
        );
    }

    #[test]
    fn lizard_is_rejected() {
        assert!(Compressor::resolve(CodecId::Lizard, 5).is_err());
    }
}
