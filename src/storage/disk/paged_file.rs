use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{FileId, PageKey, PAGE_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Bytes reserved at the start of every paged file, before page 0.
pub const FILE_HEADER_SIZE: usize = 1024;

const FILE_MAGIC: &[u8; 8] = b"SBTDBFIL";
const FILE_FORMAT_VERSION: u32 = 1;

const HEADER_VERSION_OFFSET: usize = 8;
const HEADER_PAGE_SIZE_OFFSET: usize = 12;
const HEADER_FILE_ID_OFFSET: usize = 16;

/// A flat file of fixed-size pages behind a small file header.
pub struct PagedFile {
    file: File,
    path: PathBuf,
    file_id: FileId,
    num_pages: u64,
}

impl PagedFile {
    pub fn create(path: &Path, file_id: FileId) -> StorageResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let mut header = [0u8; FILE_HEADER_SIZE];
        header[..8].copy_from_slice(FILE_MAGIC);
        LittleEndian::write_u32(&mut header[HEADER_VERSION_OFFSET..], FILE_FORMAT_VERSION);
        LittleEndian::write_u32(&mut header[HEADER_PAGE_SIZE_OFFSET..], PAGE_SIZE as u32);
        LittleEndian::write_u64(&mut header[HEADER_FILE_ID_OFFSET..], file_id.0);
        file.write_all(&header)?;
        file.sync_all()?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            file_id,
            num_pages: 0,
        })
    }

    pub fn open(path: &Path) -> StorageResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = [0u8; FILE_HEADER_SIZE];
        file.read_exact(&mut header).map_err(|_| {
            StorageError::consistency(format!("{:?} is too short to be a paged file", path))
        })?;
        if &header[..8] != FILE_MAGIC {
            return Err(StorageError::consistency(format!(
                "{:?} is not a paged file",
                path
            )));
        }
        let version = LittleEndian::read_u32(&header[HEADER_VERSION_OFFSET..]);
        let page_size = LittleEndian::read_u32(&header[HEADER_PAGE_SIZE_OFFSET..]) as usize;
        if version != FILE_FORMAT_VERSION || page_size != PAGE_SIZE {
            return Err(StorageError::consistency(format!(
                "{:?} has format version {} and page size {}, expected {} and {}",
                path, version, page_size, FILE_FORMAT_VERSION, PAGE_SIZE
            )));
        }
        let file_id = FileId(LittleEndian::read_u64(&header[HEADER_FILE_ID_OFFSET..]));

        let len = file.metadata()?.len();
        let num_pages = len.saturating_sub(FILE_HEADER_SIZE as u64) / PAGE_SIZE as u64;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            file_id,
            num_pages,
        })
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_page(&mut self, page_index: u64, buf: &mut [u8]) -> StorageResult<()> {
        check_buffer(buf.len())?;
        if page_index >= self.num_pages {
            return Err(StorageError::PageNotFound(PageKey::new(
                self.file_id,
                page_index,
            )));
        }

        self.file.seek(SeekFrom::Start(Self::page_offset(page_index)))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Write a page image. Writing past the end grows the file.
    pub fn write_page(&mut self, page_index: u64, data: &[u8]) -> StorageResult<()> {
        check_buffer(data.len())?;

        self.file.seek(SeekFrom::Start(Self::page_offset(page_index)))?;
        self.file.write_all(data)?;
        self.num_pages = self.num_pages.max(page_index + 1);
        Ok(())
    }

    pub fn num_pages(&self) -> u64 {
        self.num_pages
    }

    /// Extend the file by one zero-filled page and return its index.
    pub fn allocate_page(&mut self) -> StorageResult<u64> {
        let page_index = self.num_pages;
        self.file.set_len(Self::page_offset(page_index + 1))?;
        self.num_pages += 1;
        Ok(page_index)
    }

    pub fn sync(&mut self) -> StorageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn page_offset(page_index: u64) -> u64 {
        FILE_HEADER_SIZE as u64 + page_index * PAGE_SIZE as u64
    }
}

fn check_buffer(len: usize) -> StorageResult<()> {
    if len != PAGE_SIZE {
        return Err(StorageError::consistency(format!(
            "page buffer must be {} bytes, got {}",
            PAGE_SIZE, len
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_open() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.sbt");

        // Create new file
        {
            let pf = PagedFile::create(&file_path, FileId(7))?;
            assert_eq!(pf.num_pages(), 0);
        }
        assert_eq!(std::fs::metadata(&file_path)?.len(), FILE_HEADER_SIZE as u64);

        // Open existing file
        {
            let pf = PagedFile::open(&file_path)?;
            assert_eq!(pf.num_pages(), 0);
            assert_eq!(pf.file_id(), FileId(7));
        }

        Ok(())
    }

    #[test]
    fn test_write_and_read_page() -> Result<()> {
        let dir = tempdir()?;
        let mut pf = PagedFile::create(&dir.path().join("test.sbt"), FileId(1))?;

        let mut write_buf = vec![0u8; PAGE_SIZE];
        write_buf[0] = 42;
        write_buf[PAGE_SIZE - 1] = 24;
        pf.write_page(0, &write_buf)?;

        let mut read_buf = vec![0u8; PAGE_SIZE];
        pf.read_page(0, &mut read_buf)?;

        assert_eq!(read_buf[0], 42);
        assert_eq!(read_buf[PAGE_SIZE - 1], 24);

        Ok(())
    }

    #[test]
    fn test_page_boundary() -> Result<()> {
        let dir = tempdir()?;
        let mut pf = PagedFile::create(&dir.path().join("test.sbt"), FileId(1))?;

        // Write different patterns to adjacent pages
        pf.write_page(0, &vec![1u8; PAGE_SIZE])?;
        pf.write_page(1, &vec![2u8; PAGE_SIZE])?;

        // Read back and verify no overlap
        let mut read_buf = vec![0u8; PAGE_SIZE];
        pf.read_page(0, &mut read_buf)?;
        assert!(read_buf.iter().all(|&b| b == 1));

        pf.read_page(1, &mut read_buf)?;
        assert!(read_buf.iter().all(|&b| b == 2));

        Ok(())
    }

    #[test]
    fn test_read_nonexistent_page() -> Result<()> {
        let dir = tempdir()?;
        let mut pf = PagedFile::create(&dir.path().join("test.sbt"), FileId(3))?;

        let mut buf = vec![0u8; PAGE_SIZE];
        match pf.read_page(10, &mut buf) {
            Err(StorageError::PageNotFound(key)) => {
                assert_eq!(key, PageKey::new(FileId(3), 10));
            }
            other => panic!("expected PageNotFound, got {:?}", other.err()),
        }

        Ok(())
    }

    #[test]
    fn test_invalid_buffer_size() -> Result<()> {
        let dir = tempdir()?;
        let mut pf = PagedFile::create(&dir.path().join("test.sbt"), FileId(1))?;

        let mut small_buf = vec![0u8; 100];
        assert!(pf.read_page(0, &mut small_buf).is_err());
        assert!(pf.write_page(0, &small_buf).is_err());

        Ok(())
    }

    #[test]
    fn test_open_rejects_foreign_files() -> Result<()> {
        let dir = tempdir()?;

        assert!(PagedFile::open(&dir.path().join("missing.sbt")).is_err());

        let foreign = dir.path().join("foreign.bin");
        std::fs::write(&foreign, vec![0xAB; 4096])?;
        assert!(PagedFile::open(&foreign).is_err());

        Ok(())
    }

    #[test]
    fn test_allocate_and_growth() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.sbt");
        {
            let mut pf = PagedFile::create(&file_path, FileId(1))?;
            assert_eq!(pf.allocate_page()?, 0);
            assert_eq!(pf.allocate_page()?, 1);

            // Writing past the end grows the file
            pf.write_page(5, &vec![5u8; PAGE_SIZE])?;
            assert_eq!(pf.num_pages(), 6);
            pf.sync()?;
        }

        let mut pf = PagedFile::open(&file_path)?;
        assert_eq!(pf.num_pages(), 6);
        let mut buf = vec![0u8; PAGE_SIZE];
        pf.read_page(1, &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0));
        pf.read_page(5, &mut buf)?;
        assert_eq!(buf[0], 5);

        Ok(())
    }
}
