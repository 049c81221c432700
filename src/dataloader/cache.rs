use std::{
    fs::File,
    io::{BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::debug;

use crate::error::{CrnnError, Result};

pub const CACHE_MAGIC: &[u8; 8] = b"CRNNAUG1";
// magic + width + height + variants + record count
pub const HEADER_LEN: u64 = 8 + 4 + 4 + 4 + 8;

fn corrupt(path: &Path, reason: impl Into<String>) -> CrnnError {
    CrnnError::CorruptCache {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Sequential writer for a fixed number of u8 grayscale records.
pub struct CacheWriter {
    path: PathBuf,
    file: BufWriter<File>,
    record_len: usize,
    written: u64,
    records: u64,
}

impl CacheWriter {
    pub fn create(path: &Path, width: u32, height: u32, variants: u32, records: u64) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(CACHE_MAGIC)?;
        file.write_all(&width.to_le_bytes())?;
        file.write_all(&height.to_le_bytes())?;
        file.write_all(&variants.to_le_bytes())?;
        file.write_all(&records.to_le_bytes())?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            record_len: width as usize * height as usize,
            written: 0,
            records,
        })
    }

    pub fn write_record(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.record_len {
            return Err(CrnnError::ShapeMismatch {
                context: "augmentation cache record".into(),
                expected: format!("{} bytes", self.record_len),
                actual: format!("{} bytes", data.len()),
            });
        }
        if self.written == self.records {
            return Err(corrupt(&self.path, "more records written than declared"));
        }
        self.file.write_all(data)?;
        self.written += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<CacheReader> {
        if self.written != self.records {
            return Err(corrupt(
                &self.path,
                format!("{} of {} records written", self.written, self.records),
            ));
        }
        self.file.flush()?;
        drop(self.file);
        CacheReader::open(&self.path)
    }
}

/// Random access to cached records. Reads are serialized on one handle.
#[derive(Debug)]
pub struct CacheReader {
    path: PathBuf,
    file: Mutex<File>,
    width: u32,
    height: u32,
    variants: u32,
    records: u64,
}

impl CacheReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)
            .map_err(|_| corrupt(path, "truncated header"))?;
        if &header[0..8] != CACHE_MAGIC {
            return Err(corrupt(path, "bad magic"));
        }

        let u32_at = |offset: usize| u32::from_le_bytes([header[offset], header[offset + 1], header[offset + 2], header[offset + 3]]);
        let width = u32_at(8);
        let height = u32_at(12);
        let variants = u32_at(16);
        let mut count = [0u8; 8];
        count.copy_from_slice(&header[20..28]);
        let records = u64::from_le_bytes(count);

        let expected = HEADER_LEN + records * width as u64 * height as u64;
        let actual = file.metadata()?.len();
        if actual != expected {
            return Err(corrupt(path, format!("expected {} bytes, found {}", expected, actual)));
        }
        debug!(path = %path.display(), width, height, variants, records, "opened augmentation cache");

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            width,
            height,
            variants,
            records,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn variants(&self) -> u32 {
        self.variants
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn record_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn size_bytes(&self) -> u64 {
        HEADER_LEN + self.records * self.record_len() as u64
    }

    pub fn read_record(&self, index: u64, buf: &mut [u8]) -> Result<()> {
        if index >= self.records {
            return Err(corrupt(&self.path, format!("record {} out of {}", index, self.records)));
        }
        if buf.len() != self.record_len() {
            return Err(CrnnError::ShapeMismatch {
                context: "augmentation cache record".into(),
                expected: format!("{} bytes", self.record_len()),
                actual: format!("{} bytes", buf.len()),
            });
        }
        let mut file = self
            .file
            .lock()
            .map_err(|_| CrnnError::Io(std::io::Error::other("augmentation cache lock poisoned")))?;
        file.seek(SeekFrom::Start(HEADER_LEN + index * self.record_len() as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }
}
