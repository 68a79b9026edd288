//! File-backed stream store: one directory of segment files per stream.
//!
//! ```text
//! {root}/
//!   stream-00000000000000000042/
//!     start                       first live offset
//!     00000000000000000000.seg    records 0..1200
//!     00000000000000001200.seg    records 1200..
//! ```
//!
//! A segment opens with a 16 byte header (magic, version, base offset) and
//! then holds frames of `len u32 | crc32 u32 | payload`, where the checksum
//! covers the length and the payload. Appends go through the file and are
//! synced before returning. Reads go through a read-only mapping that is
//! refreshed once the segment has grown past it.
//!
//! Opening a stream scans its segments. A torn frame at the tail of the last
//! segment is what a crash mid-append leaves behind and is cut off; damage
//! anywhere else is reported as corruption.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use memmap2::{Mmap, MmapOptions};

use crate::message::{read_u32, read_u64, StreamId};
use crate::storage::stream::{StreamRecord, StreamStore};
use crate::sync::{lock, read, write};
use crate::{Error, Result};

/// Segment size after which appends roll to a new file (64 MiB).
pub const DEFAULT_SEGMENT_BYTES: u64 = 64 * 1024 * 1024;

/// Segment magic number ('PSG0').
const SEG_MAGIC: u32 = 0x5053_4730;
const SEG_VERSION: u32 = 1;
const SEG_HEADER_SIZE: u64 = 16;
const FRAME_HEADER_SIZE: u64 = 8;
const SEGMENT_SUFFIX: &str = ".seg";
const START_FILE: &str = "start";

fn stream_dirname(stream: StreamId) -> String {
    format!("stream-{:020}", stream.0)
}

fn segment_filename(base: u64) -> String {
    format!("{base:020}{SEGMENT_SUFFIX}")
}

/// Returns the base offset if `name` is a segment file.
fn parse_segment_filename(name: &str) -> Option<u64> {
    let base = name.strip_suffix(SEGMENT_SUFFIX)?;
    if base.len() != 20 || !base.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    base.parse().ok()
}

fn discover_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut bases = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(base) = entry.file_name().to_str().and_then(parse_segment_filename) {
            bases.push(base);
        }
    }
    bases.sort_unstable();
    Ok(bases)
}

fn frame_checksum(len: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Total size of the intact frame at `pos`, if there is one.
fn frame_at(data: &[u8], pos: usize) -> Option<usize> {
    let header_end = pos.checked_add(FRAME_HEADER_SIZE as usize)?;
    if header_end > data.len() {
        return None;
    }
    let len = read_u32(data, pos);
    let payload = data.get(header_end..header_end.checked_add(len as usize)?)?;
    (frame_checksum(len, payload) == read_u32(data, pos + 4))
        .then_some(FRAME_HEADER_SIZE as usize + payload.len())
}

fn sync_dir(path: &Path) -> Result<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

/// Writes `data` to `path` through a temp file, so readers see old or new.
fn publish(dir: &Path, name: &str, data: &[u8]) -> Result<PathBuf> {
    let path = dir.join(name);
    let tmp = dir.join(format!("{name}.tmp"));
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&tmp, &path)?;
    sync_dir(dir)?;
    Ok(path)
}

fn read_start(dir: &Path) -> Result<u64> {
    let path = dir.join(START_FILE);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    if data.len() != 12 || crc32fast::hash(&data[..8]) != read_u32(&data, 8) {
        return Err(Error::Corrupt(format!("{}: bad start offset", path.display())));
    }
    Ok(read_u64(&data, 0))
}

fn write_start(dir: &Path, start: u64) -> Result<()> {
    let mut data = start.to_le_bytes().to_vec();
    data.extend_from_slice(&crc32fast::hash(&data).to_le_bytes());
    publish(dir, START_FILE, &data)?;
    Ok(())
}

struct Segment {
    base: u64,
    path: PathBuf,
    /// Byte position of each frame, indexed by `offset - base`.
    positions: Vec<u64>,
    /// Bytes of header plus intact frames.
    len: u64,
    map: Option<Mmap>,
    appender: Option<File>,
}

impl Segment {
    fn create(dir: &Path, base: u64) -> Result<Self> {
        let mut header = Vec::with_capacity(SEG_HEADER_SIZE as usize);
        header.extend_from_slice(&SEG_MAGIC.to_le_bytes());
        header.extend_from_slice(&SEG_VERSION.to_le_bytes());
        header.extend_from_slice(&base.to_le_bytes());
        let path = publish(dir, &segment_filename(base), &header)?;
        Ok(Self {
            base,
            path,
            positions: Vec::new(),
            len: SEG_HEADER_SIZE,
            map: None,
            appender: None,
        })
    }

    fn scan(dir: &Path, base: u64, last: bool) -> Result<Self> {
        let path = dir.join(segment_filename(base));
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_len = file.metadata()?.len();
        let corrupt = |what: &str| Error::Corrupt(format!("{}: {what}", path.display()));
        if file_len < SEG_HEADER_SIZE {
            return Err(corrupt("segment header truncated"));
        }
        let map_len = usize::try_from(file_len).map_err(|_| corrupt("segment too large to map"))?;
        let map = unsafe { MmapOptions::new().len(map_len).map(&file)? };
        if read_u32(&map, 0) != SEG_MAGIC || read_u32(&map, 4) != SEG_VERSION {
            return Err(corrupt("segment magic mismatch"));
        }
        if read_u64(&map, 8) != base {
            return Err(corrupt("segment base mismatch"));
        }

        let mut positions = Vec::new();
        let mut pos = SEG_HEADER_SIZE as usize;
        while let Some(frame_len) = frame_at(&map, pos) {
            positions.push(pos as u64);
            pos += frame_len;
        }
        drop(map);

        let len = pos as u64;
        if len < file_len {
            if !last {
                return Err(corrupt("damaged frame inside a sealed segment"));
            }
            log::warn!(
                "truncating torn tail of {} at byte {len} (was {file_len})",
                path.display()
            );
            file.set_len(len)?;
            file.sync_all()?;
        }

        Ok(Self {
            base,
            path,
            positions,
            len,
            map: None,
            appender: None,
        })
    }

    fn end(&self) -> u64 {
        self.base + self.positions.len() as u64
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if self.appender.is_none() {
            self.appender = Some(OpenOptions::new().append(true).open(&self.path)?);
        }
        let Some(file) = self.appender.as_mut() else {
            return Err(Error::Corrupt(format!("{}: no appender", self.path.display())));
        };
        file.write_all(frame)?;
        file.sync_data()?;
        Ok(())
    }

    /// Cuts the file back to its last intact frame after a failed write.
    fn rollback(&mut self) -> Result<()> {
        self.map = None;
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(self.len)?;
        file.sync_all()?;
        Ok(())
    }

    fn refresh_map(&mut self) -> Result<()> {
        let stale = self
            .map
            .as_ref()
            .map_or(true, |map| (map.len() as u64) < self.len);
        if stale {
            let file = File::open(&self.path)?;
            let map = unsafe { MmapOptions::new().len(self.len as usize).map(&file)? };
            self.map = Some(map);
        }
        Ok(())
    }

    fn read_into(&mut self, from: u64, limit: usize, out: &mut Vec<StreamRecord>) -> Result<()> {
        self.refresh_map()?;
        let data = self.map.as_deref().unwrap_or(&[]);
        for offset in from..self.end() {
            if out.len() >= limit {
                break;
            }
            let pos = self.positions[(offset - self.base) as usize] as usize;
            let start = pos + FRAME_HEADER_SIZE as usize;
            let payload = data
                .get(start..start + read_u32(data, pos) as usize)
                .ok_or_else(|| {
                    Error::Corrupt(format!("{}: frame past end of map", self.path.display()))
                })?;
            out.push(StreamRecord {
                offset,
                payload: Arc::from(payload),
            });
        }
        Ok(())
    }
}

struct FileStream {
    dir: PathBuf,
    start: u64,
    segments: Vec<Segment>,
    /// Set when a failed append could not be rolled back.
    broken: bool,
}

impl FileStream {
    fn open(dir: PathBuf) -> Result<Self> {
        if !dir.exists() {
            return Ok(Self {
                dir,
                start: 0,
                segments: Vec::new(),
                broken: false,
            });
        }

        let start = read_start(&dir)?;
        let bases = discover_segments(&dir)?;
        let mut segments: Vec<Segment> = Vec::with_capacity(bases.len());
        for (idx, &base) in bases.iter().enumerate() {
            if let Some(prev) = segments.last() {
                if prev.end() != base {
                    return Err(Error::Corrupt(format!(
                        "{}: gap between offsets {} and {base}",
                        dir.display(),
                        prev.end()
                    )));
                }
            }
            segments.push(Segment::scan(&dir, base, idx + 1 == bases.len())?);
        }

        let stream = Self {
            dir,
            start,
            segments,
            broken: false,
        };
        let first = stream.segments.first().map_or(start, |segment| segment.base);
        if first > start || start > stream.next_offset() {
            return Err(Error::Corrupt(format!(
                "{}: start offset {start} outside stored records {first}..{}",
                stream.dir.display(),
                stream.next_offset()
            )));
        }
        log::debug!(
            "opened {} with {} segments, offsets {start}..{}",
            stream.dir.display(),
            stream.segments.len(),
            stream.next_offset()
        );
        Ok(stream)
    }

    fn next_offset(&self) -> u64 {
        self.segments.last().map_or(self.start, Segment::end)
    }

    fn append(&mut self, payload: &[u8], segment_bytes: u64) -> Result<u64> {
        if self.broken {
            return Err(Error::Corrupt(format!(
                "{}: unrecovered failed append, reopen the store",
                self.dir.display()
            )));
        }
        let len = u32::try_from(payload.len())
            .map_err(|_| Error::InvalidArgument("record exceeds 4GiB"))?;
        let offset = self.next_offset();
        if self.segments.last().map_or(true, |last| last.len >= segment_bytes) {
            fs::create_dir_all(&self.dir)?;
            let segment = Segment::create(&self.dir, offset)?;
            if let Some(sealed) = self.segments.last_mut() {
                sealed.appender = None;
            }
            self.segments.push(segment);
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE as usize + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&frame_checksum(len, payload).to_le_bytes());
        frame.extend_from_slice(payload);

        let Some(segment) = self.segments.last_mut() else {
            return Err(Error::Corrupt(format!("{}: no open segment", self.dir.display())));
        };
        if let Err(err) = segment.write_frame(&frame) {
            segment.appender = None;
            if let Err(rollback) = segment.rollback() {
                log::error!(
                    "cannot roll back failed append to {}: {rollback}",
                    segment.path.display()
                );
                self.broken = true;
                return Err(err);
            }
            return Err(Error::Unavailable(format!(
                "append to {} failed: {err}",
                segment.path.display()
            )));
        }
        segment.positions.push(segment.len);
        segment.len += frame.len() as u64;
        Ok(offset)
    }

    fn fetch(&mut self, stream: StreamId, offset: u64, limit: usize) -> Result<Vec<StreamRecord>> {
        if offset < self.start {
            return Err(Error::Trimmed { stream, offset });
        }
        let mut records = Vec::new();
        let mut idx = self.segments.partition_point(|segment| segment.end() <= offset);
        while records.len() < limit {
            let Some(segment) = self.segments.get_mut(idx) else {
                break;
            };
            let from = offset.max(segment.base);
            segment.read_into(from, limit, &mut records)?;
            idx += 1;
        }
        Ok(records)
    }

    fn trim(&mut self, offset: u64) -> Result<()> {
        let target = offset.min(self.next_offset());
        if target <= self.start {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;
        write_start(&self.dir, target)?;
        self.start = target;

        let mut removed = 0;
        while self.segments.len() > 1 && self.segments[0].end() <= target {
            let segment = self.segments.remove(0);
            fs::remove_file(&segment.path)?;
            removed += 1;
        }
        if removed > 0 {
            sync_dir(&self.dir)?;
            log::debug!(
                "trimmed {} to {target}, removed {removed} segments",
                self.dir.display()
            );
        }
        Ok(())
    }
}

/// Stream store persisting every stream as a directory of segment files.
pub struct FileStreamStore {
    root: PathBuf,
    segment_bytes: u64,
    streams: RwLock<HashMap<StreamId, Arc<Mutex<FileStream>>>>,
}

impl FileStreamStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::with_segment_bytes(root, DEFAULT_SEGMENT_BYTES)
    }

    pub fn with_segment_bytes(root: impl AsRef<Path>, segment_bytes: u64) -> Result<Self> {
        if segment_bytes <= SEG_HEADER_SIZE + FRAME_HEADER_SIZE {
            return Err(Error::InvalidArgument("segment size too small"));
        }
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            segment_bytes,
            streams: RwLock::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stream(&self, stream: StreamId) -> Result<Arc<Mutex<FileStream>>> {
        if let Some(opened) = read(&self.streams).get(&stream) {
            return Ok(Arc::clone(opened));
        }
        let mut streams = write(&self.streams);
        if let Some(opened) = streams.get(&stream) {
            return Ok(Arc::clone(opened));
        }
        let opened = Arc::new(Mutex::new(FileStream::open(
            self.root.join(stream_dirname(stream)),
        )?));
        streams.insert(stream, Arc::clone(&opened));
        Ok(opened)
    }
}

impl StreamStore for FileStreamStore {
    fn append(&self, stream: StreamId, payload: &[u8]) -> Result<u64> {
        let opened = self.stream(stream)?;
        let mut guard = lock(&opened);
        guard.append(payload, self.segment_bytes)
    }

    fn fetch(&self, stream: StreamId, offset: u64, limit: usize) -> Result<Vec<StreamRecord>> {
        let opened = self.stream(stream)?;
        let mut guard = lock(&opened);
        guard.fetch(stream, offset, limit)
    }

    fn trim(&self, stream: StreamId, offset: u64) -> Result<()> {
        let opened = self.stream(stream)?;
        let mut guard = lock(&opened);
        guard.trim(offset)
    }

    fn start_offset(&self, stream: StreamId) -> Result<u64> {
        let opened = self.stream(stream)?;
        let start = lock(&opened).start;
        Ok(start)
    }

    fn next_offset(&self, stream: StreamId) -> Result<u64> {
        let opened = self.stream(stream)?;
        let next = lock(&opened).next_offset();
        Ok(next)
    }
}
