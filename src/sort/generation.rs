//! Immutable sorted runs persisted in block files.
//!
//! Layout of a generation file:
//!
//! ```text
//! header   magic u32 | version u16 | codec u8 | flags u8 | count u64
//!          | lowest u64 | highest u64 | frames u32 | index offset u64
//!          | index len u32 | crc32 u32
//! frames   (payload len u32 | crc32 u32 | payload)*
//! index    crc32 u32 | (offset u64 | len u32 | records u32 | first record)*
//! ```
//!
//! A frame payload is the codec-encoded concatenation of its records. The
//! sparse index keeps the first record of every frame so seeks touch a single
//! frame. Group membership of a generation is not persisted; it lives in the
//! sort manager.

use std::{
    cmp::Ordering,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
};

use bytes::Bytes;
use flume::Sender;

use crate::{
    cleaner::CleanTag,
    error::StorageError,
    id::{FileId, FileIdGenerator},
    io::{BlockCodec, BlockFile, BlockStore, Uncompressed},
    mvcc::{SeqBounds, SequenceNumber},
    observability::{log_debug, log_warn},
    serdes::{take, Decode, DecodeError, Encode},
};

use super::GenerationRecord;

const MAGIC: u32 = 0x5354_474e;
const VERSION: u16 = 1;
const HEADER_LEN: usize = 52;
const FRAME_HEADER_LEN: usize = 8;
const FLAG_BOUNDS: u8 = 1;

#[derive(Debug, Clone)]
struct FrameMeta {
    offset: u64,
    len: u32,
    records: u32,
    first: Bytes,
}

#[derive(Debug, Clone, Copy)]
struct Header {
    codec: u8,
    count: u64,
    bounds: Option<SeqBounds>,
    frames: u32,
    index_offset: u64,
    index_len: u32,
}

impl Header {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        MAGIC.encode(&mut buf);
        VERSION.encode(&mut buf);
        self.codec.encode(&mut buf);
        let flags = if self.bounds.is_some() { FLAG_BOUNDS } else { 0 };
        flags.encode(&mut buf);
        self.count.encode(&mut buf);
        let bounds = self
            .bounds
            .unwrap_or(SeqBounds::single(SequenceNumber::MIN));
        bounds.lowest.encode(&mut buf);
        bounds.highest.encode(&mut buf);
        self.frames.encode(&mut buf);
        self.index_offset.encode(&mut buf);
        self.index_len.encode(&mut buf);
        crc32fast::hash(&buf).encode(&mut buf);
        debug_assert_eq!(buf.len(), HEADER_LEN);
        buf
    }

    fn decode(raw: &[u8]) -> Result<Self, String> {
        if raw.len() < HEADER_LEN {
            return Err(format!("header is {} bytes", raw.len()));
        }
        let (body, crc) = raw[..HEADER_LEN].split_at(HEADER_LEN - 4);
        let mut reader = body;
        let decode = |reader: &mut &[u8]| -> Result<Self, DecodeError> {
            let magic = u32::decode(reader)?;
            let version = u16::decode(reader)?;
            if magic != MAGIC || version != VERSION {
                return Err(DecodeError::UnknownTag {
                    what: "generation header",
                    tag: version as u8,
                });
            }
            let codec = u8::decode(reader)?;
            let flags = u8::decode(reader)?;
            let count = u64::decode(reader)?;
            let lowest = SequenceNumber::decode(reader)?;
            let highest = SequenceNumber::decode(reader)?;
            Ok(Header {
                codec,
                count,
                bounds: (flags & FLAG_BOUNDS != 0).then_some(SeqBounds { lowest, highest }),
                frames: u32::decode(reader)?,
                index_offset: u64::decode(reader)?,
                index_len: u32::decode(reader)?,
            })
        };
        let expected = u32::decode(&mut &crc[..]).map_err(|err| err.to_string())?;
        if crc32fast::hash(body) != expected {
            return Err("header checksum mismatch".into());
        }
        decode(&mut reader).map_err(|err| err.to_string())
    }
}

/// An immutable sorted run.
///
/// When the last reference to a retired generation is dropped, its file id is
/// sent to the cleaner, which removes the file.
pub struct Generation {
    id: FileId,
    file: Arc<dyn BlockFile>,
    codec: Arc<dyn BlockCodec>,
    count: u64,
    bounds: Option<SeqBounds>,
    frames: Vec<FrameMeta>,
    retired: AtomicBool,
    clean_tx: Option<Sender<CleanTag>>,
}

impl Generation {
    /// File holding the generation.
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Number of records.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sequence bounds of the records, if they carry sequence numbers.
    pub fn bounds(&self) -> Option<SeqBounds> {
        self.bounds
    }

    /// Number of frames listed in the index.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Size of the file, index and header included.
    pub fn size_bytes(&self) -> u64 {
        self.file.len()
    }

    /// Mark the generation for removal once no reader holds it.
    pub fn retire(&self) {
        self.retired.store(true, AtomicOrdering::Release);
    }

    /// Whether [`Generation::retire`] was called.
    pub fn is_retired(&self) -> bool {
        self.retired.load(AtomicOrdering::Acquire)
    }

    fn corrupt(&self, reason: impl Into<String>) -> StorageError {
        StorageError::Corrupt {
            file: self.id,
            reason: reason.into(),
        }
    }

    pub(crate) fn first_record<T: Decode>(&self, frame: usize) -> Result<T, StorageError> {
        let mut reader = &self.frames[frame].first[..];
        T::decode(&mut reader).map_err(|err| self.corrupt(err.to_string()))
    }

    /// Index of the frame where records not less than `probe` may start.
    pub(crate) fn seek_frame<T, C>(&self, probe: &T, cmp: &C) -> Result<usize, StorageError>
    where
        T: Decode,
        C: Fn(&T, &T) -> Ordering + ?Sized,
    {
        // last frame whose first record is strictly less than the probe; equal
        // records may continue from the tail of the previous frame
        let (mut low, mut high) = (0, self.frames.len());
        while low < high {
            let mid = low + (high - low) / 2;
            let first: T = self.first_record(mid)?;
            if cmp(&first, probe) == Ordering::Less {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        Ok(low.saturating_sub(1))
    }

    /// Read and decode frames `[start, start + count)` with a single read.
    pub(crate) async fn read_frames<T: Decode>(
        &self,
        start: usize,
        count: usize,
    ) -> Result<Vec<T>, StorageError> {
        let end = (start + count).min(self.frames.len());
        if start >= end {
            return Ok(Vec::new());
        }
        let offset = self.frames[start].offset;
        let last = &self.frames[end - 1];
        let len = (last.offset + last.len as u64 - offset) as usize;
        let raw = self.file.read_at(offset, len).await?;

        let records = self.frames[start..end]
            .iter()
            .map(|frame| frame.records as usize)
            .sum();
        let mut out = Vec::with_capacity(records);
        for frame in &self.frames[start..end] {
            let at = (frame.offset - offset) as usize;
            let mut reader = &raw[at..at + frame.len as usize];
            let payload_len = u32::decode(&mut reader).map_err(|e| self.corrupt(e.to_string()))?;
            let crc = u32::decode(&mut reader).map_err(|e| self.corrupt(e.to_string()))?;
            let payload =
                take(&mut reader, payload_len as usize).map_err(|e| self.corrupt(e.to_string()))?;
            if crc32fast::hash(payload) != crc {
                return Err(self.corrupt(format!("frame at {} checksum mismatch", frame.offset)));
            }
            let decoded = self
                .codec
                .decode(payload)
                .map_err(|err| self.corrupt(err.to_string()))?;
            let mut reader = &decoded[..];
            for _ in 0..frame.records {
                out.push(T::decode(&mut reader).map_err(|err| self.corrupt(err.to_string()))?);
            }
            if !reader.is_empty() {
                return Err(self.corrupt(format!(
                    "frame at {} has {} trailing bytes",
                    frame.offset,
                    reader.len()
                )));
            }
        }
        Ok(out)
    }

    async fn load(
        id: FileId,
        file: Arc<dyn BlockFile>,
        codec: Arc<dyn BlockCodec>,
        clean_tx: Option<Sender<CleanTag>>,
    ) -> Result<Self, StorageError> {
        let corrupt = |reason: String| StorageError::Corrupt { file: id, reason };
        if file.len() < HEADER_LEN as u64 {
            return Err(corrupt(format!("file is {} bytes", file.len())));
        }
        let header = Header::decode(&file.read_at(0, HEADER_LEN).await?).map_err(corrupt)?;
        if header.codec != codec.id() {
            return Err(corrupt(format!(
                "written with codec {}, opened with {}",
                header.codec,
                codec.id()
            )));
        }
        let index_end = header.index_offset + header.index_len as u64;
        if index_end > file.len() || header.index_len < 4 {
            return Err(corrupt(format!(
                "index [{}, {index_end}) outside file of {} bytes",
                header.index_offset,
                file.len()
            )));
        }
        let raw = file
            .read_at(header.index_offset, header.index_len as usize)
            .await?;
        let (crc, body) = raw.split_at(4);
        let expected = u32::decode(&mut &crc[..]).map_err(|e| corrupt(e.to_string()))?;
        if crc32fast::hash(body) != expected {
            return Err(corrupt("index checksum mismatch".into()));
        }

        let mut reader = body;
        let mut frames = Vec::with_capacity(header.frames as usize);
        let parse = |reader: &mut &[u8]| -> Result<FrameMeta, DecodeError> {
            let offset = u64::decode(reader)?;
            let len = u32::decode(reader)?;
            let records = u32::decode(reader)?;
            let first = Bytes::decode(reader)?;
            Ok(FrameMeta {
                offset,
                len,
                records,
                first,
            })
        };
        for _ in 0..header.frames {
            frames.push(parse(&mut reader).map_err(|e| corrupt(e.to_string()))?);
        }
        let total: u64 = frames.iter().map(|frame| frame.records as u64).sum();
        if total != header.count {
            return Err(corrupt(format!(
                "index lists {total} records, header {}",
                header.count
            )));
        }

        Ok(Generation {
            id,
            file,
            codec,
            count: header.count,
            bounds: header.bounds,
            frames,
            retired: AtomicBool::new(false),
            clean_tx,
        })
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        if !self.is_retired() {
            return;
        }
        if let Some(tx) = &self.clean_tx {
            // the channel is unbounded, so this fails only once the cleaner is gone
            if tx.send(CleanTag::Remove(self.id)).is_err() {
                log_warn!(
                    component = "sort",
                    event = "cleaner_gone",
                    file = %self.id,
                );
            }
        }
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("count", &self.count)
            .field("bounds", &self.bounds)
            .field("frames", &self.frames.len())
            .finish()
    }
}

/// Writes records, in order, into a new generation file.
pub struct GenerationWriter {
    id: FileId,
    store: Arc<dyn BlockStore>,
    file: Arc<dyn BlockFile>,
    codec: Arc<dyn BlockCodec>,
    clean_tx: Option<Sender<CleanTag>>,
    block_size: usize,
    offset: u64,
    frame: Vec<u8>,
    frame_records: u32,
    frame_first: Option<Bytes>,
    index: Vec<FrameMeta>,
    count: u64,
    bounds: Option<SeqBounds>,
}

impl GenerationWriter {
    /// File holding the generation.
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Give up on the generation and remove what was written so far.
    pub async fn discard(self) -> Result<(), StorageError> {
        drop(self.file);
        self.store.remove(self.id).await?;
        log_debug!(component = "sort", event = "generation_discarded", file = %self.id);
        Ok(())
    }

    /// Append `record`; records must arrive in the generation's order.
    pub async fn push<T: GenerationRecord>(&mut self, record: &T) -> Result<(), StorageError> {
        if self.frame_first.is_none() {
            let mut first = Vec::with_capacity(record.size());
            record.encode(&mut first);
            self.frame_first = Some(Bytes::from(first));
        }
        record.encode(&mut self.frame);
        self.frame_records += 1;
        self.count += 1;
        if let Some(seq) = record.sequence() {
            match &mut self.bounds {
                Some(bounds) => bounds.include(seq),
                None => self.bounds = Some(SeqBounds::single(seq)),
            }
        }
        if self.frame.len() >= self.block_size {
            self.flush_frame().await?;
        }
        Ok(())
    }

    async fn flush_frame(&mut self) -> Result<(), StorageError> {
        let Some(first) = self.frame_first.take() else {
            return Ok(());
        };
        let payload = self.codec.encode(&self.frame);
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        (payload.len() as u32).encode(&mut buf);
        crc32fast::hash(&payload).encode(&mut buf);
        buf.extend_from_slice(&payload);

        let len = buf.len() as u32;
        self.file.write_at(self.offset, Bytes::from(buf)).await?;
        self.index.push(FrameMeta {
            offset: self.offset,
            len,
            records: self.frame_records,
            first,
        });
        self.offset += len as u64;
        self.frame.clear();
        self.frame_records = 0;
        Ok(())
    }

    /// Write the index and header, sync, and publish the generation.
    pub async fn finish(mut self) -> Result<Arc<Generation>, StorageError> {
        self.flush_frame().await?;

        let mut body = Vec::new();
        for frame in &self.index {
            frame.offset.encode(&mut body);
            frame.len.encode(&mut body);
            frame.records.encode(&mut body);
            frame.first.encode(&mut body);
        }
        let mut index = Vec::with_capacity(4 + body.len());
        crc32fast::hash(&body).encode(&mut index);
        index.extend_from_slice(&body);

        let header = Header {
            codec: self.codec.id(),
            count: self.count,
            bounds: self.bounds,
            frames: self.index.len() as u32,
            index_offset: self.offset,
            index_len: index.len() as u32,
        };
        self.file.write_at(self.offset, Bytes::from(index)).await?;
        self.file
            .write_at(0, Bytes::from(header.encode()))
            .await?;
        self.file.sync().await?;

        log_debug!(
            component = "sort",
            event = "generation_written",
            file = %self.id,
            records = self.count,
            frames = self.index.len(),
        );
        Ok(Arc::new(Generation {
            id: self.id,
            file: self.file,
            codec: self.codec,
            count: self.count,
            bounds: self.bounds,
            frames: self.index,
            retired: AtomicBool::new(false),
            clean_tx: self.clean_tx,
        }))
    }
}

/// Creates and opens generations on a block store.
pub struct GenerationStore {
    store: Arc<dyn BlockStore>,
    codec: Arc<dyn BlockCodec>,
    ids: FileIdGenerator,
    block_size: usize,
    clean_tx: Option<Sender<CleanTag>>,
}

impl GenerationStore {
    /// Store writing frames of about `block_size` bytes, uncompressed.
    pub fn new(store: Arc<dyn BlockStore>, block_size: usize) -> Self {
        GenerationStore {
            store,
            codec: Arc::new(Uncompressed),
            ids: FileIdGenerator::new(),
            block_size: block_size.max(1),
            clean_tx: None,
        }
    }

    /// Encode frames with `codec`.
    pub fn with_codec(self, codec: Arc<dyn BlockCodec>) -> Self {
        GenerationStore { codec, ..self }
    }

    /// Route retired generations to a cleaner.
    pub fn with_cleaner(self, clean_tx: Sender<CleanTag>) -> Self {
        GenerationStore {
            clean_tx: Some(clean_tx),
            ..self
        }
    }

    /// Underlying block store.
    pub fn block_store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Start a new generation file.
    pub async fn writer(&self) -> Result<GenerationWriter, StorageError> {
        let id = self.ids.generate();
        let file = self.store.create(id).await?;
        Ok(GenerationWriter {
            id,
            store: self.store.clone(),
            file,
            codec: self.codec.clone(),
            clean_tx: self.clean_tx.clone(),
            block_size: self.block_size,
            offset: HEADER_LEN as u64,
            frame: Vec::with_capacity(self.block_size),
            frame_records: 0,
            frame_first: None,
            index: Vec::new(),
            count: 0,
            bounds: None,
        })
    }

    /// Reopen a generation written earlier.
    pub async fn open(&self, id: FileId) -> Result<Arc<Generation>, StorageError> {
        let file = self.store.open(id).await?;
        let generation = Generation::load(id, file, self.codec.clone(), self.clean_tx.clone()).await?;
        Ok(Arc::new(generation))
    }
}
