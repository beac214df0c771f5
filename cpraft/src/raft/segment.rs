use serde_derive::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const SEGMENT_MAGIC: u32 = 0x4350_5247; // "CPRG"
const HEADER_SIZE: u64 = 12; // 4 bytes magic + 8 bytes start_index
const ENTRY_HEADER_SIZE: u64 = 8; // 8 bytes for entry size

/// Append-only file holding a contiguous run of encoded log entries
/// starting at `start_index`.
#[derive(Debug)]
pub struct Segment {
    file: File,
    start_index: u64,
    path: PathBuf,
    entry_positions: Vec<u64>, // offset of entry (start_index + i)
}

#[derive(Debug, Serialize, Deserialize)]
struct SegmentHeader {
    magic: u32,
    start_index: u64,
}

impl Segment {
    pub fn open<P: AsRef<Path>>(path: P, start_index: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut segment = Segment {
            file,
            start_index,
            path: path.as_ref().to_path_buf(),
            entry_positions: Vec::new(),
        };

        if segment.file.metadata()?.len() == 0 {
            segment.write_header()?;
        } else {
            segment.read_header()?;
            segment.rebuild_entry_positions()?;
        }

        Ok(segment)
    }

    fn write_header(&mut self) -> io::Result<()> {
        let header = SegmentHeader {
            magic: SEGMENT_MAGIC,
            start_index: self.start_index,
        };
        let header_bytes =
            bincode::serialize(&header).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header_bytes)?;
        self.file.sync_all()
    }

    fn read_header(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut header_bytes = vec![0u8; HEADER_SIZE as usize];
        self.file.read_exact(&mut header_bytes)?;

        let header: SegmentHeader = bincode::deserialize(&header_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if header.magic != SEGMENT_MAGIC || header.start_index != self.start_index {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad segment header in {}", self.path.display()),
            ));
        }
        Ok(())
    }

    fn read_entry_header(&mut self) -> io::Result<u64> {
        let mut size_bytes = [0u8; ENTRY_HEADER_SIZE as usize];
        self.file.read_exact(&mut size_bytes)?;
        Ok(u64::from_le_bytes(size_bytes))
    }

    /// Scans the file; a record cut short by a crash is dropped because it
    /// was never acknowledged.
    fn rebuild_entry_positions(&mut self) -> io::Result<()> {
        self.entry_positions.clear();
        let file_len = self.file.metadata()?.len();
        let mut pos = HEADER_SIZE;

        while pos < file_len {
            if pos + ENTRY_HEADER_SIZE > file_len {
                break;
            }
            self.file.seek(SeekFrom::Start(pos))?;
            let entry_size = self.read_entry_header()?;
            let next = pos + ENTRY_HEADER_SIZE + entry_size;
            if next > file_len {
                break;
            }
            self.entry_positions.push(pos);
            pos = next;
        }

        if pos < file_len {
            log::warn!(
                "Dropping torn tail of {} at offset {} ({} bytes)",
                self.path.display(),
                pos,
                file_len - pos
            );
            self.file.set_len(pos)?;
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Appends and fsyncs; entries are durable once this returns.
    pub fn append(&mut self, entries: &[Vec<u8>]) -> io::Result<()> {
        let mut pos = self.file.seek(SeekFrom::End(0))?;
        let mut buffer = Vec::new();
        let mut positions = Vec::with_capacity(entries.len());

        for entry in entries {
            positions.push(pos);
            buffer.extend_from_slice(&(entry.len() as u64).to_le_bytes());
            buffer.extend_from_slice(entry);
            pos += ENTRY_HEADER_SIZE + entry.len() as u64;
        }

        self.file.write_all(&buffer)?;
        self.file.sync_data()?;
        self.entry_positions.extend(positions);
        Ok(())
    }

    pub fn read_entry(&mut self, index: u64) -> io::Result<Vec<u8>> {
        if index < self.start_index || index > self.end_index() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Index out of range",
            ));
        }

        let pos = self.entry_positions[(index - self.start_index) as usize];
        self.file.seek(SeekFrom::Start(pos))?;
        let entry_size = self.read_entry_header()?;

        let mut entry = vec![0u8; entry_size as usize];
        self.file.read_exact(&mut entry)?;
        Ok(entry)
    }

    /// Removes `index` and every entry after it.
    pub fn truncate_from(&mut self, index: u64) -> io::Result<()> {
        if index > self.end_index() {
            return Ok(());
        }
        let keep = index.saturating_sub(self.start_index) as usize;
        let new_len = self
            .entry_positions
            .get(keep)
            .copied()
            .unwrap_or(HEADER_SIZE);

        self.file.set_len(new_len)?;
        self.file.sync_all()?;
        self.entry_positions.truncate(keep);
        Ok(())
    }

    /// Deletes the segment file.
    pub fn remove(self) -> io::Result<()> {
        let path = self.path.clone();
        drop(self);
        fs::remove_file(path)
    }

    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    /// `start_index - 1` while the segment is empty.
    pub fn end_index(&self) -> u64 {
        self.start_index + self.entry_positions.len() as u64 - 1
    }

    pub fn len(&self) -> usize {
        self.entry_positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_positions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entries(items: &[&[u8]]) -> Vec<Vec<u8>> {
        items.iter().map(|e| e.to_vec()).collect()
    }

    #[test]
    fn test_segment_creation() {
        let dir = TempDir::new().unwrap();
        let segment = Segment::open(dir.path().join("segment_1.log"), 1).unwrap();

        assert_eq!(segment.start_index(), 1);
        assert_eq!(segment.end_index(), 0);
        assert!(segment.is_empty());
    }

    #[test]
    fn test_segment_append() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path().join("segment_1.log"), 1).unwrap();

        segment
            .append(&entries(&[b"first entry", b"second entry"]))
            .unwrap();

        assert_eq!(segment.end_index(), 2);
        assert!(!segment.is_empty());
        assert_eq!(segment.read_entry(1).unwrap(), b"first entry");
        assert_eq!(segment.read_entry(2).unwrap(), b"second entry");
        assert!(segment.read_entry(3).is_err());
    }

    #[test]
    fn test_segment_truncate() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path().join("segment_1.log"), 1).unwrap();

        segment
            .append(&entries(&[b"first entry", b"second entry", b"third entry"]))
            .unwrap();

        segment.truncate_from(3).unwrap();
        assert_eq!(segment.end_index(), 2);
        assert_eq!(segment.read_entry(2).unwrap(), b"second entry");
        assert!(segment.read_entry(3).is_err());

        segment.append(&entries(&[b"replacement"])).unwrap();
        assert_eq!(segment.read_entry(3).unwrap(), b"replacement");
    }

    #[test]
    fn test_segment_reopen_drops_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segment_5.log");
        {
            let mut segment = Segment::open(&path, 5).unwrap();
            segment.append(&entries(&[b"five", b"six"])).unwrap();
        }
        {
            // a record header promising more bytes than were written
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u64.to_le_bytes()).unwrap();
            file.write_all(b"short").unwrap();
        }

        let mut segment = Segment::open(&path, 5).unwrap();
        assert_eq!(segment.end_index(), 6);
        assert_eq!(segment.read_entry(6).unwrap(), b"six");
    }

    #[test]
    fn test_segment_rejects_mismatched_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segment_1.log");
        Segment::open(&path, 1).unwrap();
        assert!(Segment::open(&path, 2).is_err());
    }
}
