//! The super-chunk facade: an ordered sequence of compressed chunks plus a
//! metadata footer, held in memory or in a single file.
//!
//! Each chunk is a little-endian frame of independently compressed blocks:
//!
//! ```text
//! | n_blocks u32 | raw_len u32 | block csizes u32 * n_blocks | payloads... |
//! ```
//!
//! Blocks compress independently so that partial decodes touch only the
//! covering blocks, and so that a [BlockProducer] can synthesize block
//! contents on the fly while a chunk is being compressed.

use std::cell::RefCell;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{Config, Filter};
use crate::shape::DtShape;
use crate::{variant_from_data, CodecId, Error, Result};

pub mod compressor;
mod filter;

use compressor::Compressor;

const FRAME_HEADER: usize = 8;
const FILE_MAGIC: u32 = 0x54535241; // "TSRA"
const TRAILER_LEN: u64 = 8 + 8 + 4 + 4;

/// Where a super-chunk lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Storage {
    InMemory,
    File(PathBuf),
}

variant_from_data!(Storage, File, PathBuf);

impl Storage {
    /// Idempotent removal of persisted state.
    pub fn remove(&self) -> Result<()> {
        match self {
            Self::InMemory => Ok(()),
            Self::File(path) => match fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }
}

/// Fills raw block bytes while a chunk is compressed.
///
/// This is the prefilter seam: the codec calls `fill` once per block with
/// the block's output buffer, letting callers (the matmul pipeline, plain
/// buffer appends) produce bytes without materializing the whole chunk.
/// `out` is 8-byte aligned and a whole number of items long, so producers
/// may reinterpret it as a typed panel.
pub trait BlockProducer: Sync {
    fn fill(&self, nblock: usize, out: &mut [u8]);
}

/// Producer over an in-memory chunk buffer.
pub struct SliceProducer<'a> {
    raw: &'a [u8],
    block_nbytes: usize,
}

impl<'a> SliceProducer<'a> {
    pub fn new(raw: &'a [u8], block_nbytes: usize) -> Self {
        Self { raw, block_nbytes }
    }
}

impl<'a> BlockProducer for SliceProducer<'a> {
    fn fill(&self, nblock: usize, out: &mut [u8]) {
        let at = nblock * self.block_nbytes;
        out.copy_from_slice(&self.raw[at..at + out.len()]);
    }
}

/// Resolved compression parameters shared by every chunk of a super-chunk.
#[derive(Clone, Debug)]
pub struct CodecParams {
    pub item_size: usize,
    pub chunk_nbytes: usize,
    pub block_nbytes: usize,
    pub compressor: Compressor,
    pub filters: Vec<Filter>,
    pub fp_mantissa_bits: u8,
}

impl CodecParams {
    pub fn new(cfg: &Config, item_size: usize, chunk_nbytes: usize, block_nbytes: usize) -> Result<Self> {
        if item_size == 0 || chunk_nbytes == 0 {
            return Err(Error::invalid_argument("zero-sized chunk"));
        }
        let block_nbytes = block_nbytes.clamp(item_size, chunk_nbytes);
        if block_nbytes % item_size != 0 {
            return Err(Error::invalid_argument(
                "block byte size must be a multiple of the item size",
            ));
        }
        Ok(Self {
            item_size,
            chunk_nbytes,
            block_nbytes,
            compressor: Compressor::resolve(cfg.codec, cfg.level)?,
            filters: cfg.filters.clone(),
            fp_mantissa_bits: cfg.fp_mantissa_bits,
        })
    }

    pub fn n_blocks(&self, raw_len: usize) -> usize {
        (raw_len + self.block_nbytes - 1) / self.block_nbytes
    }

    fn block_len(&self, raw_len: usize, nblock: usize) -> usize {
        (raw_len - nblock * self.block_nbytes).min(self.block_nbytes)
    }
}

fn encode_block(params: &CodecParams, producer: &dyn BlockProducer, raw_len: usize, nblock: usize) -> Result<Vec<u8>> {
    let len = params.block_len(raw_len, nblock);
    // 8-byte aligned backing so producers can write typed panels
    let mut words = vec![0u64; (len + 7) / 8];
    let raw = &mut bytemuck::cast_slice_mut::<u64, u8>(&mut words)[..len];
    producer.fill(nblock, raw);
    let filtered = filter::forward(&params.filters, raw.to_vec(), params.item_size, params.fp_mantissa_bits);
    params.compressor.encode(&filtered)
}

/// Compress one chunk, pulling each block's raw bytes from `producer`.
///
/// With `parallel` set, blocks compress on the current rayon pool; each
/// block is independent, so output bytes do not depend on the setting.
pub fn compress_frame(
    params: &CodecParams,
    raw_len: usize,
    producer: &dyn BlockProducer,
    parallel: bool,
) -> Result<Bytes> {
    if raw_len == 0 || raw_len > params.chunk_nbytes {
        return Err(Error::invalid_argument("chunk byte length out of range"));
    }
    let n_blocks = params.n_blocks(raw_len);
    let blocks: Vec<Vec<u8>> = if parallel && n_blocks > 1 {
        (0..n_blocks)
            .into_par_iter()
            .map(|nb| encode_block(params, producer, raw_len, nb))
            .collect::<Result<_>>()?
    } else {
        (0..n_blocks)
            .map(|nb| encode_block(params, producer, raw_len, nb))
            .collect::<Result<_>>()?
    };

    let payload: usize = blocks.iter().map(Vec::len).sum();
    let mut frame = Vec::with_capacity(FRAME_HEADER + 4 * n_blocks + payload);
    frame.write_u32::<LittleEndian>(n_blocks as u32)?;
    frame.write_u32::<LittleEndian>(raw_len as u32)?;
    for b in &blocks {
        frame.write_u32::<LittleEndian>(b.len() as u32)?;
    }
    for b in &blocks {
        frame.extend_from_slice(b);
    }
    Ok(frame.into())
}

struct FrameIndex {
    raw_len: usize,
    /// (payload offset, compressed len) per block.
    blocks: Vec<(usize, usize)>,
}

fn read_frame_index(frame: &[u8]) -> Result<FrameIndex> {
    if frame.len() < FRAME_HEADER {
        return Err(Error::codec("chunk frame shorter than its header"));
    }
    let n_blocks = LittleEndian::read_u32(&frame[0..4]) as usize;
    let raw_len = LittleEndian::read_u32(&frame[4..8]) as usize;
    let table_end = FRAME_HEADER + 4 * n_blocks;
    if frame.len() < table_end {
        return Err(Error::codec("chunk frame truncated in its block table"));
    }
    let mut blocks = Vec::with_capacity(n_blocks);
    let mut at = table_end;
    for nb in 0..n_blocks {
        let csize = LittleEndian::read_u32(&frame[FRAME_HEADER + 4 * nb..][..4]) as usize;
        blocks.push((at, csize));
        at += csize;
    }
    if frame.len() < at {
        return Err(Error::codec("chunk frame truncated in its payload"));
    }
    Ok(FrameIndex { raw_len, blocks })
}

/// Uncompressed byte length of a chunk frame.
pub fn frame_raw_len(frame: &[u8]) -> Result<usize> {
    Ok(read_frame_index(frame)?.raw_len)
}

fn decode_block_raw(params: &CodecParams, frame: &[u8], index: &FrameIndex, nblock: usize) -> Result<Vec<u8>> {
    let (at, csize) = *index
        .blocks
        .get(nblock)
        .ok_or_else(|| Error::codec("block index out of range"))?;
    let raw_len = params.block_len(index.raw_len, nblock);
    let raw = params.compressor.decode(&frame[at..at + csize], raw_len)?;
    Ok(filter::backward(&params.filters, raw, params.item_size))
}

/// Decode one whole block of a chunk frame into `out` (sized to the block).
pub fn decode_block_into(params: &CodecParams, frame: &[u8], nblock: usize, out: &mut [u8]) -> Result<usize> {
    let index = read_frame_index(frame)?;
    let raw = decode_block_raw(params, frame, &index, nblock)?;
    if out.len() < raw.len() {
        return Err(Error::invalid_argument("output buffer too small for block"));
    }
    out[..raw.len()].copy_from_slice(&raw);
    Ok(raw.len())
}

/// Decode a whole chunk frame into `out`; returns the raw byte count.
pub fn decompress_frame_into(params: &CodecParams, frame: &[u8], out: &mut [u8]) -> Result<usize> {
    let index = read_frame_index(frame)?;
    if out.len() < index.raw_len {
        return Err(Error::invalid_argument("output buffer too small for chunk"));
    }
    let mut at = 0usize;
    for nb in 0..index.blocks.len() {
        let raw = decode_block_raw(params, frame, &index, nb)?;
        out[at..at + raw.len()].copy_from_slice(&raw);
        at += raw.len();
    }
    if at != index.raw_len {
        return Err(Error::codec("chunk frame decoded to the wrong length"));
    }
    Ok(at)
}

/// Partial decode: items `[item_offset, item_offset + n_items)` of the
/// chunk's flat buffer, touching only the covering blocks.
pub fn frame_items_into(
    params: &CodecParams,
    frame: &[u8],
    item_offset: usize,
    n_items: usize,
    out: &mut [u8],
) -> Result<()> {
    let index = read_frame_index(frame)?;
    let byte_start = item_offset * params.item_size;
    let byte_end = byte_start + n_items * params.item_size;
    if byte_end > index.raw_len {
        return Err(Error::invalid_argument("item range outside the chunk"));
    }
    if out.len() < byte_end - byte_start {
        return Err(Error::invalid_argument("output buffer too small for items"));
    }
    let first = byte_start / params.block_nbytes;
    let last = (byte_end - 1) / params.block_nbytes;
    let mut written = 0usize;
    for nb in first..=last {
        let raw = decode_block_raw(params, frame, &index, nb)?;
        let block_start = nb * params.block_nbytes;
        let lo = byte_start.max(block_start) - block_start;
        let hi = byte_end.min(block_start + raw.len()) - block_start;
        out[written..written + (hi - lo)].copy_from_slice(&raw[lo..hi]);
        written += hi - lo;
    }
    debug_assert_eq!(written, byte_end - byte_start);
    Ok(())
}

/// Metadata footer persisted with file-backed super-chunks.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FooterMeta {
    pub dtshape: DtShape,
    pub codec: CodecId,
    pub level: u8,
    pub filters: Vec<Filter>,
    pub fp_mantissa_bits: u8,
    pub block_nbytes: usize,
    pub contiguous: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ChunkSpan {
    offset: u64,
    nbytes: u64,
}

impl ChunkSpan {
    fn from_reader<R: Read>(r: &mut R) -> Result<Self> {
        let offset = r.read_u64::<LittleEndian>()?;
        let nbytes = r.read_u64::<LittleEndian>()?;
        Ok(Self { offset, nbytes })
    }

    fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64::<LittleEndian>(self.offset)?;
        w.write_u64::<LittleEndian>(self.nbytes)?;
        Ok(())
    }
}

enum Backend {
    Memory {
        chunks: Vec<Bytes>,
    },
    File {
        file: RefCell<File>,
        index: Vec<ChunkSpan>,
        /// End of the chunk data region; the footer is written here.
        data_end: u64,
    },
}

/// An ordered sequence of compressed chunks with shared codec parameters.
pub struct SuperChunk {
    params: CodecParams,
    backend: Backend,
    nbytes: u64,
    cbytes: u64,
}

impl SuperChunk {
    pub fn create(params: CodecParams, storage: &Storage) -> Result<Self> {
        let backend = match storage {
            Storage::InMemory => Backend::Memory {
                chunks: Vec::default(),
            },
            Storage::File(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?;
                fs4::FileExt::try_lock_exclusive(&file)?;
                let mut file = file;
                file.write_u32::<LittleEndian>(FILE_MAGIC)?;
                file.write_u32::<LittleEndian>(1)?; // format version
                Backend::File {
                    file: RefCell::new(file),
                    index: Vec::default(),
                    data_end: 8,
                }
            }
        };
        Ok(Self {
            params,
            backend,
            nbytes: 0,
            cbytes: 0,
        })
    }

    /// Reopen a persisted super-chunk, reconstructing codec parameters and
    /// shape metadata from the footer. A missing or corrupt footer is fatal.
    pub fn open(path: &PathBuf) -> Result<(Self, FooterMeta)> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        fs4::FileExt::try_lock_exclusive(&file)?;
        let mut file = file;

        let flen = file.seek(SeekFrom::End(0))?;
        if flen < 8 + TRAILER_LEN {
            return Err(Error::codec("file too short for a super-chunk"));
        }
        file.seek(SeekFrom::Start(0))?;
        if file.read_u32::<LittleEndian>()? != FILE_MAGIC {
            return Err(Error::codec("bad super-chunk magic"));
        }
        let _version = file.read_u32::<LittleEndian>()?;

        file.seek(SeekFrom::End(-(TRAILER_LEN as i64)))?;
        let footer_start = file.read_u64::<LittleEndian>()?;
        let footer_len = file.read_u64::<LittleEndian>()?;
        let crc = file.read_u32::<LittleEndian>()?;
        if file.read_u32::<LittleEndian>()? != FILE_MAGIC {
            return Err(Error::codec("bad super-chunk trailer magic"));
        }
        if footer_start + footer_len + TRAILER_LEN != flen {
            return Err(Error::codec("inconsistent super-chunk trailer"));
        }
        file.seek(SeekFrom::Start(footer_start))?;
        let mut footer = vec![0u8; footer_len as usize];
        file.read_exact(&mut footer)?;
        if crc32c::crc32c(&footer) != crc {
            return Err(Error::codec("super-chunk footer checksum mismatch"));
        }

        let mut r = std::io::Cursor::new(footer.as_slice());
        let n_chunks = r.read_u64::<LittleEndian>()? as usize;
        let mut index = Vec::with_capacity(n_chunks);
        let mut nbytes = 0u64;
        let mut cbytes = 0u64;
        for _ in 0..n_chunks {
            let span = ChunkSpan::from_reader(&mut r)?;
            cbytes += span.nbytes;
            index.push(span);
        }
        let json_at = r.position() as usize;
        let meta: FooterMeta = serde_json::from_slice(&footer[json_at..])
            .map_err(|e| Error::codec(format!("unparseable footer metadata: {e}")))?;

        let item_size = meta.dtshape.item_size();
        let chunk_nbytes = meta.dtshape.chunk_items() * item_size;
        let params = CodecParams {
            item_size,
            chunk_nbytes,
            block_nbytes: meta.block_nbytes,
            compressor: Compressor::resolve(meta.codec, meta.level)?,
            filters: meta.filters.clone(),
            fp_mantissa_bits: meta.fp_mantissa_bits,
        };

        let sc = {
            let mut sc = Self {
                params,
                backend: Backend::File {
                    file: RefCell::new(file),
                    index,
                    data_end: footer_start,
                },
                nbytes: 0,
                cbytes,
            };
            for i in 0..sc.n_chunks() {
                nbytes += frame_raw_len(&sc.chunk_bytes(i)?)? as u64;
            }
            sc.nbytes = nbytes;
            sc
        };
        debug!("opened super-chunk with {} chunks", sc.n_chunks());
        Ok((sc, meta))
    }

    pub fn params(&self) -> &CodecParams {
        &self.params
    }

    pub fn n_chunks(&self) -> usize {
        match &self.backend {
            Backend::Memory { chunks } => chunks.len(),
            Backend::File { index, .. } => index.len(),
        }
    }

    /// Uncompressed and compressed totals.
    pub fn info(&self) -> (u64, u64) {
        (self.nbytes, self.cbytes)
    }

    /// Append one compressed chunk frame; returns the new chunk count.
    pub fn append_chunk(&mut self, frame: Bytes) -> Result<usize> {
        self.nbytes += frame_raw_len(&frame)? as u64;
        self.cbytes += frame.len() as u64;
        match &mut self.backend {
            Backend::Memory { chunks } => {
                chunks.push(frame);
                Ok(chunks.len())
            }
            Backend::File {
                file,
                index,
                data_end,
            } => {
                let mut f = file.borrow_mut();
                f.seek(SeekFrom::Start(*data_end))?;
                f.write_all(&frame)?;
                index.push(ChunkSpan {
                    offset: *data_end,
                    nbytes: frame.len() as u64,
                });
                *data_end += frame.len() as u64;
                Ok(index.len())
            }
        }
    }

    /// Overwrite chunk `i`; `i == n_chunks()` appends.
    pub fn update_chunk(&mut self, i: usize, frame: Bytes) -> Result<()> {
        let n = self.n_chunks();
        if i == n {
            self.append_chunk(frame)?;
            return Ok(());
        }
        if i > n {
            return Err(Error::invalid_argument("chunk index out of range"));
        }
        let old_raw = self.chunk_raw_len(i)? as u64;
        let old_clen = match &self.backend {
            Backend::Memory { chunks } => chunks[i].len() as u64,
            Backend::File { index, .. } => index[i].nbytes,
        };
        self.nbytes = self.nbytes - old_raw + frame_raw_len(&frame)? as u64;
        self.cbytes = self.cbytes - old_clen + frame.len() as u64;
        match &mut self.backend {
            Backend::Memory { chunks } => {
                chunks[i] = frame;
            }
            Backend::File {
                file,
                index,
                data_end,
            } => {
                // the replaced span becomes a hole; not reclaimed
                let mut f = file.borrow_mut();
                f.seek(SeekFrom::Start(*data_end))?;
                f.write_all(&frame)?;
                index[i] = ChunkSpan {
                    offset: *data_end,
                    nbytes: frame.len() as u64,
                };
                *data_end += frame.len() as u64;
            }
        }
        Ok(())
    }

    fn chunk_bytes_span(&self, span: ChunkSpan) -> Result<Bytes> {
        match &self.backend {
            Backend::Memory { .. } => Err(Error::Failed("span read on a memory super-chunk")),
            Backend::File { file, .. } => {
                let mut f = file.borrow_mut();
                f.seek(SeekFrom::Start(span.offset))?;
                let mut buf = vec![0u8; span.nbytes as usize];
                f.read_exact(&mut buf)?;
                Ok(buf.into())
            }
        }
    }

    /// The compressed frame of chunk `i`.
    pub fn chunk_bytes(&self, i: usize) -> Result<Bytes> {
        match &self.backend {
            Backend::Memory { chunks } => chunks
                .get(i)
                .cloned()
                .ok_or_else(|| Error::invalid_argument("chunk index out of range")),
            Backend::File { index, .. } => {
                let span = *index
                    .get(i)
                    .ok_or_else(|| Error::invalid_argument("chunk index out of range"))?;
                self.chunk_bytes_span(span)
            }
        }
    }

    /// Stored (uncompressed) byte length of chunk `i`.
    pub fn chunk_raw_len(&self, i: usize) -> Result<usize> {
        frame_raw_len(&self.chunk_bytes(i)?)
    }

    /// Decompress chunk `i` into `out`; returns the byte count written.
    pub fn decompress_chunk(&self, i: usize, out: &mut [u8]) -> Result<usize> {
        decompress_frame_into(&self.params, &self.chunk_bytes(i)?, out)
    }

    /// Partial decode of `n_items` items starting at flat `item_offset`
    /// within chunk `i`.
    pub fn get_block(&self, i: usize, item_offset: usize, n_items: usize, out: &mut [u8]) -> Result<()> {
        frame_items_into(&self.params, &self.chunk_bytes(i)?, item_offset, n_items, out)
    }

    /// Compress `raw` as the next chunk.
    pub fn append_raw(&mut self, raw: &[u8]) -> Result<usize> {
        let frame = compress_frame(
            &self.params,
            raw.len(),
            &SliceProducer::new(raw, self.params.block_nbytes),
            false,
        )?;
        self.append_chunk(frame)
    }

    /// Persist the chunk index and metadata footer. No-op in memory.
    pub fn flush(&mut self, meta: &FooterMeta) -> Result<()> {
        let Backend::File {
            file,
            index,
            data_end,
        } = &mut self.backend
        else {
            return Ok(());
        };
        let mut footer = Vec::with_capacity(8 + index.len() * 16 + 256);
        footer.write_u64::<LittleEndian>(index.len() as u64)?;
        for span in index.iter() {
            span.write(&mut footer)?;
        }
        serde_json::to_writer(&mut footer, meta).map_err(|e| Error::codec(e.to_string()))?;
        let crc = crc32c::crc32c(&footer);

        let mut f = file.borrow_mut();
        f.seek(SeekFrom::Start(*data_end))?;
        f.write_all(&footer)?;
        f.write_u64::<LittleEndian>(*data_end)?;
        f.write_u64::<LittleEndian>(footer.len() as u64)?;
        f.write_u32::<LittleEndian>(crc)?;
        f.write_u32::<LittleEndian>(FILE_MAGIC)?;
        let end = f.stream_position()?;
        f.set_len(end)?;
        f.flush()?;
        debug!("flushed super-chunk footer ({} chunks)", index.len());
        Ok(())
    }
}
