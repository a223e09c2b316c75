use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const MAGIC: &[u8; 8] = b"ZBRING01";
const FIXED_HEADER_LEN: u64 = 8 + 4 + 4 + 8;
const REGION_HEADER_LEN: u64 = 3 * 8;

#[derive(Debug, Error)]
pub enum RingFileError {
    #[error("I/O error on ring file '{path}': {source}", path = path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("'{path}' is not a ring file", path = path.display())]
    BadMagic { path: PathBuf },

    #[error(
        "Ring file '{path}' has layout {found:?} but {expected:?} was requested",
        path = path.display()
    )]
    LayoutMismatch {
        path: PathBuf,
        expected: RingLayout,
        found: RingLayout,
    },

    #[error("Record of {actual} bytes does not match record size {expected}")]
    RecordSize { expected: usize, actual: usize },

    #[error("Region {region} does not exist (file has {regions})")]
    NoSuchRegion { region: usize, regions: usize },
}

/// Shape of a ring file: fixed-size records in equally sized regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub record_size: usize,
    pub num_regions: usize,
    pub capacity: usize,
}

impl RingLayout {
    /// The largest per-region capacity whose records fit in `bytes`.
    pub fn fitting(bytes: u64, record_size: usize, num_regions: usize) -> Self {
        let per_region = bytes / (record_size.max(1) as u64 * num_regions.max(1) as u64);
        Self {
            record_size,
            num_regions,
            capacity: per_region as usize,
        }
    }

    fn data_offset(&self) -> u64 {
        FIXED_HEADER_LEN + REGION_HEADER_LEN * self.num_regions as u64
    }

    fn file_len(&self) -> u64 {
        self.data_offset() + (self.record_size * self.num_regions * self.capacity) as u64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RegionHeader {
    head: u64,
    len: u64,
    tag: u64,
}

/// A file of bounded FIFO rings of fixed-size records.
///
/// Every mutation rewrites the affected region header immediately, so the file
/// can be reopened at any point between operations. Whether the file existed
/// when opened tells the caller whether it is resuming or starting fresh.
#[derive(Debug)]
pub struct RingFile {
    path: PathBuf,
    file: File,
    layout: RingLayout,
    regions: Vec<RegionHeader>,
}

impl RingFile {
    /// Opens an existing ring file with the given layout, or creates a new one.
    /// Returns the file and whether it already existed.
    pub fn open_or_create(path: &Path, layout: RingLayout) -> Result<(Self, bool), RingFileError> {
        if path.exists() {
            Self::open(path, layout).map(|f| (f, true))
        } else {
            Self::create(path, layout).map(|f| (f, false))
        }
    }

    pub fn create(path: &Path, layout: RingLayout) -> Result<Self, RingFileError> {
        let io = io_err(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(&io)?;
        file.set_len(layout.file_len()).map_err(&io)?;
        let mut ring = Self {
            path: path.to_path_buf(),
            file,
            layout,
            regions: vec![RegionHeader::default(); layout.num_regions],
        };
        ring.write_fixed_header()?;
        for region in 0..layout.num_regions {
            ring.write_region_header(region)?;
        }
        Ok(ring)
    }

    pub fn open(path: &Path, layout: RingLayout) -> Result<Self, RingFileError> {
        let io = io_err(path);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(&io)?;

        let mut fixed = [0u8; FIXED_HEADER_LEN as usize];
        file.read_exact(&mut fixed).map_err(&io)?;
        if &fixed[..8] != MAGIC {
            return Err(RingFileError::BadMagic {
                path: path.to_path_buf(),
            });
        }
        let found = RingLayout {
            record_size: u32::from_le_bytes([fixed[8], fixed[9], fixed[10], fixed[11]]) as usize,
            num_regions: u32::from_le_bytes([fixed[12], fixed[13], fixed[14], fixed[15]]) as usize,
            capacity: u64::from_le_bytes(fixed[16..24].try_into().unwrap_or([0; 8])) as usize,
        };
        if found != layout {
            return Err(RingFileError::LayoutMismatch {
                path: path.to_path_buf(),
                expected: layout,
                found,
            });
        }

        let mut regions = Vec::with_capacity(layout.num_regions);
        let mut buf = [0u8; REGION_HEADER_LEN as usize];
        for _ in 0..layout.num_regions {
            file.read_exact(&mut buf).map_err(&io)?;
            let word = |i: usize| u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap_or([0; 8]));
            regions.push(RegionHeader {
                head: word(0),
                len: word(1),
                tag: word(2),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            layout,
            regions,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn layout(&self) -> RingLayout {
        self.layout
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.layout.capacity
    }

    pub fn len(&self, region: usize) -> usize {
        self.regions.get(region).map_or(0, |r| r.len as usize)
    }

    pub fn is_empty(&self, region: usize) -> bool {
        self.len(region) == 0
    }

    pub fn is_full(&self, region: usize) -> bool {
        self.len(region) >= self.layout.capacity
    }

    pub fn tag(&self, region: usize) -> u64 {
        self.regions.get(region).map_or(0, |r| r.tag)
    }

    pub fn set_tag(&mut self, region: usize, tag: u64) -> Result<(), RingFileError> {
        self.check_region(region)?;
        self.regions[region].tag = tag;
        self.write_region_header(region)
    }

    /// Appends a record; returns `false` without writing when the region is full.
    pub fn push_back(&mut self, region: usize, record: &[u8]) -> Result<bool, RingFileError> {
        self.check_region(region)?;
        self.check_record(record)?;
        if self.is_full(region) {
            return Ok(false);
        }
        let header = self.regions[region];
        let slot = (header.head + header.len) % self.layout.capacity as u64;
        let offset = self.slot_offset(region, slot);
        self.write_at(offset, record)?;
        self.regions[region].len += 1;
        self.write_region_header(region)?;
        Ok(true)
    }

    pub fn pop_front(&mut self, region: usize) -> Result<Option<Vec<u8>>, RingFileError> {
        self.check_region(region)?;
        let header = self.regions[region];
        if header.len == 0 {
            return Ok(None);
        }
        let record = self.read_slot(region, header.head)?;
        let next = &mut self.regions[region];
        next.head = (header.head + 1) % self.layout.capacity as u64;
        next.len -= 1;
        self.write_region_header(region)?;
        Ok(Some(record))
    }

    /// Reads every record of a region in FIFO order without consuming them.
    pub fn read_all(&mut self, region: usize) -> Result<Vec<Vec<u8>>, RingFileError> {
        self.check_region(region)?;
        let header = self.regions[region];
        (0..header.len)
            .map(|i| self.read_slot(region, (header.head + i) % self.layout.capacity as u64))
            .collect()
    }

    pub fn clear(&mut self, region: usize) -> Result<(), RingFileError> {
        self.check_region(region)?;
        self.regions[region].head = 0;
        self.regions[region].len = 0;
        self.write_region_header(region)
    }

    pub fn flush(&mut self) -> Result<(), RingFileError> {
        let io = io_err(&self.path);
        self.file.flush().map_err(&io)?;
        self.file.sync_data().map_err(&io)
    }

    fn check_region(&self, region: usize) -> Result<(), RingFileError> {
        if region >= self.layout.num_regions {
            return Err(RingFileError::NoSuchRegion {
                region,
                regions: self.layout.num_regions,
            });
        }
        Ok(())
    }

    fn check_record(&self, record: &[u8]) -> Result<(), RingFileError> {
        if record.len() != self.layout.record_size {
            return Err(RingFileError::RecordSize {
                expected: self.layout.record_size,
                actual: record.len(),
            });
        }
        Ok(())
    }

    fn slot_offset(&self, region: usize, slot: u64) -> u64 {
        let index = region as u64 * self.layout.capacity as u64 + slot;
        self.layout.data_offset() + index * self.layout.record_size as u64
    }

    fn read_slot(&mut self, region: usize, slot: u64) -> Result<Vec<u8>, RingFileError> {
        let io = io_err(&self.path);
        let offset = self.slot_offset(region, slot);
        let mut record = vec![0u8; self.layout.record_size];
        self.file.seek(SeekFrom::Start(offset)).map_err(&io)?;
        self.file.read_exact(&mut record).map_err(&io)?;
        Ok(record)
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), RingFileError> {
        let io = io_err(&self.path);
        self.file.seek(SeekFrom::Start(offset)).map_err(&io)?;
        self.file.write_all(bytes).map_err(&io)
    }

    fn write_fixed_header(&mut self) -> Result<(), RingFileError> {
        let mut buf = Vec::with_capacity(FIXED_HEADER_LEN as usize);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&(self.layout.record_size as u32).to_le_bytes());
        buf.extend_from_slice(&(self.layout.num_regions as u32).to_le_bytes());
        buf.extend_from_slice(&(self.layout.capacity as u64).to_le_bytes());
        self.write_at(0, &buf)
    }

    fn write_region_header(&mut self, region: usize) -> Result<(), RingFileError> {
        let header = self.regions[region];
        let mut buf = [0u8; REGION_HEADER_LEN as usize];
        buf[..8].copy_from_slice(&header.head.to_le_bytes());
        buf[8..16].copy_from_slice(&header.len.to_le_bytes());
        buf[16..].copy_from_slice(&header.tag.to_le_bytes());
        let offset = FIXED_HEADER_LEN + REGION_HEADER_LEN * region as u64;
        self.write_at(offset, &buf)
    }
}

fn io_err(path: &Path) -> impl Fn(std::io::Error) -> RingFileError + '_ {
    move |source| RingFileError::Io {
        path: path.to_path_buf(),
        source,
    }
}
