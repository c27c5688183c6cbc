//! Write cache: logical file registry and physical page I/O.
//!
//! The write cache owns every [`PagedFile`], maps logical file names to
//! [`FileId`]s (persisted in `name_id_map.cm`), and enforces the
//! write-ahead rule: a page image is only written after the WAL is durable up
//! to the LSN stamped in that page.

use crate::storage::disk::PagedFile;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{stamp_checksum, verify_checksum, FileId, PageKey, PageRead};
use crate::storage::wal::{Lsn, WriteAheadLog};
use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const REGISTRY_FILE_NAME: &str = "name_id_map.cm";

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileRegistry {
    next_file_id: u64,
    files: Vec<(String, u64)>,
}

pub struct WriteCache {
    data_dir: PathBuf,
    wal: Option<Arc<WriteAheadLog>>,
    verify_checksums: bool,
    files: DashMap<FileId, Arc<Mutex<PagedFile>>>,
    name_to_id: DashMap<String, FileId>,
    id_to_name: DashMap<FileId, String>,
    next_file_id: AtomicU64,
    /// Serializes registry changes and their persistence.
    registry_lock: Mutex<()>,
}

impl WriteCache {
    /// Open the files registered in `data_dir`. Without a WAL, pages are
    /// stored without forcing the log first.
    pub fn open(
        data_dir: impl AsRef<Path>,
        wal: Option<Arc<WriteAheadLog>>,
        verify_checksums: bool,
    ) -> StorageResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        let registry_path = data_dir.join(REGISTRY_FILE_NAME);
        let registry: FileRegistry = if registry_path.exists() {
            bincode::deserialize_from(BufReader::new(File::open(&registry_path)?))?
        } else {
            FileRegistry::default()
        };

        let cache = WriteCache {
            data_dir,
            wal,
            verify_checksums,
            files: DashMap::new(),
            name_to_id: DashMap::new(),
            id_to_name: DashMap::new(),
            next_file_id: AtomicU64::new(registry.next_file_id.max(1)),
            registry_lock: Mutex::new(()),
        };

        let mut dropped = false;
        for (name, id) in registry.files {
            let file_id = FileId(id);
            let path = cache.data_dir.join(&name);
            if !path.exists() {
                warn!("Registered file {} ({}) is missing, dropping it", name, file_id);
                dropped = true;
                continue;
            }
            let paged = PagedFile::open(&path)?;
            if paged.file_id() != file_id {
                return Err(StorageError::consistency(format!(
                    "file {} is registered as {} but its header says {}",
                    name,
                    file_id,
                    paged.file_id()
                )));
            }
            cache.next_file_id.fetch_max(id + 1, Ordering::SeqCst);
            cache.insert_file(name, file_id, paged);
        }
        if dropped {
            let _guard = cache.registry_lock.lock();
            cache.persist_registry()?;
        }

        info!(
            "Opened write cache in {:?} with {} file(s)",
            cache.data_dir,
            cache.files.len()
        );
        Ok(cache)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn insert_file(&self, name: String, file_id: FileId, paged: PagedFile) {
        self.files.insert(file_id, Arc::new(Mutex::new(paged)));
        self.name_to_id.insert(name.clone(), file_id);
        self.id_to_name.insert(file_id, name);
    }

    /// Register and create a new file, assigning the next free id.
    pub fn add_file(&self, name: &str) -> StorageResult<FileId> {
        let _guard = self.registry_lock.lock();
        if self.name_to_id.contains_key(name) {
            return Err(StorageError::FileExists(name.to_string()));
        }
        let file_id = FileId(self.next_file_id.fetch_add(1, Ordering::SeqCst));
        self.create_file(name, file_id)?;
        Ok(file_id)
    }

    /// Register and create a new file under a caller-chosen id.
    pub fn add_file_with_id(&self, name: &str, file_id: FileId) -> StorageResult<FileId> {
        let _guard = self.registry_lock.lock();
        if self.name_to_id.contains_key(name) {
            return Err(StorageError::FileExists(name.to_string()));
        }
        if self.files.contains_key(&file_id) {
            return Err(StorageError::FileExists(format!(
                "{} (id {} is already in use)",
                name, file_id
            )));
        }
        self.next_file_id.fetch_max(file_id.0 + 1, Ordering::SeqCst);
        self.create_file(name, file_id)?;
        Ok(file_id)
    }

    fn create_file(&self, name: &str, file_id: FileId) -> StorageResult<()> {
        if name.is_empty() || name.contains(['/', '\\']) || name == REGISTRY_FILE_NAME {
            return Err(StorageError::consistency(format!(
                "invalid file name {:?}",
                name
            )));
        }
        let paged = PagedFile::create(&self.data_dir.join(name), file_id)?;
        self.insert_file(name.to_string(), file_id, paged);
        self.persist_registry()?;
        debug!("Created file {} as {}", name, file_id);
        Ok(())
    }

    /// Write the registry next to the data files. Callers hold `registry_lock`.
    fn persist_registry(&self) -> StorageResult<()> {
        let mut files: Vec<(String, u64)> = self
            .name_to_id
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().0))
            .collect();
        files.sort_by_key(|(_, id)| *id);
        let registry = FileRegistry {
            next_file_id: self.next_file_id.load(Ordering::SeqCst),
            files,
        };

        let path = self.data_dir.join(REGISTRY_FILE_NAME);
        let tmp_path = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            bincode::serialize_into(&mut writer, &registry)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.name_to_id.contains_key(name)
    }

    pub fn file_id_by_name(&self, name: &str) -> Option<FileId> {
        self.name_to_id.get(name).map(|entry| *entry.value())
    }

    pub fn native_file_name_by_id(&self, file_id: FileId) -> Option<String> {
        self.id_to_name.get(&file_id).map(|entry| entry.value().clone())
    }

    pub fn file_path(&self, file_id: FileId) -> Option<PathBuf> {
        self.native_file_name_by_id(file_id)
            .map(|name| self.data_dir.join(name))
    }

    /// Registered files as `(name, id)`, ordered by id.
    pub fn files(&self) -> Vec<(String, FileId)> {
        let mut files: Vec<(String, FileId)> = self
            .name_to_id
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        files.sort_by_key(|(_, id)| *id);
        files
    }

    /// Unregister a file and remove it from disk. The read cache must have
    /// dropped its frames first.
    pub fn delete_file(&self, file_id: FileId) -> StorageResult<()> {
        let _guard = self.registry_lock.lock();
        let (_, name) = self
            .id_to_name
            .remove(&file_id)
            .ok_or_else(|| StorageError::FileNotFound(file_id.to_string()))?;
        self.name_to_id.remove(&name);
        self.files.remove(&file_id);
        fs::remove_file(self.data_dir.join(&name))?;
        self.persist_registry()?;
        info!("Deleted file {} ({})", name, file_id);
        Ok(())
    }

    fn file(&self, file_id: FileId) -> StorageResult<Arc<Mutex<PagedFile>>> {
        self.files
            .get(&file_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StorageError::FileNotFound(file_id.to_string()))
    }

    /// Read a page image from disk.
    pub fn load(&self, key: PageKey, buf: &mut [u8]) -> StorageResult<()> {
        let file = self.file(key.file_id)?;
        file.lock().read_page(key.page_index, buf)?;
        if self.verify_checksums {
            verify_checksum(key, buf)?;
        }
        Ok(())
    }

    /// Write a page image to disk. The WAL is forced first up to the page
    /// LSN and to `commit_lsn`, the End record of the unit that last changed
    /// the page, so a page never reaches disk ahead of its unit's commit.
    pub fn store(
        &self,
        key: PageKey,
        data: &[u8],
        commit_lsn: Option<Lsn>,
    ) -> StorageResult<()> {
        let durable = commit_lsn.map_or(data.lsn(), |commit| commit.max(data.lsn()));
        if let Some(wal) = &self.wal {
            if !durable.is_none() {
                wal.flush_to(durable)?;
            }
        }

        let mut image = data.to_vec();
        stamp_checksum(&mut image);
        let file = self.file(key.file_id)?;
        file.lock().write_page(key.page_index, &image)?;
        Ok(())
    }

    /// Extend a file by one zero-filled page.
    pub fn allocate(&self, file_id: FileId) -> StorageResult<u64> {
        let file = self.file(file_id)?;
        let page_index = file.lock().allocate_page()?;
        Ok(page_index)
    }

    /// Number of pages the file currently holds.
    pub fn filled_up_to(&self, file_id: FileId) -> StorageResult<u64> {
        let file = self.file(file_id)?;
        let pages = file.lock().num_pages();
        Ok(pages)
    }

    /// Sync every file to stable storage.
    pub fn sync(&self) -> StorageResult<()> {
        let files: Vec<Arc<Mutex<PagedFile>>> = self
            .files
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for file in files {
            file.lock().sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{PAGE_PAYLOAD_OFFSET, PAGE_SIZE};
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn test_add_file_and_lookup() -> Result<()> {
        let dir = tempdir()?;
        let cache = WriteCache::open(dir.path(), None, true)?;

        let a = cache.add_file("a.sbt")?;
        let b = cache.add_file("b.sbt")?;
        assert_ne!(a, b);
        assert!(cache.exists("a.sbt"));
        assert!(!cache.exists("c.sbt"));
        assert_eq!(cache.file_id_by_name("b.sbt"), Some(b));
        assert_eq!(cache.native_file_name_by_id(a).as_deref(), Some("a.sbt"));
        assert!(matches!(
            cache.add_file("a.sbt"),
            Err(StorageError::FileExists(_))
        ));
        assert!(cache.add_file("../escape").is_err());

        Ok(())
    }

    #[test]
    fn test_add_file_with_id() -> Result<()> {
        let dir = tempdir()?;
        let cache = WriteCache::open(dir.path(), None, true)?;

        cache.add_file_with_id("restored.sbt", FileId(40))?;
        assert!(cache.add_file_with_id("other.sbt", FileId(40)).is_err());

        // Fresh ids continue after the explicit one
        let next = cache.add_file("next.sbt")?;
        assert_eq!(next, FileId(41));

        Ok(())
    }

    #[test]
    fn test_registry_survives_reopen() -> Result<()> {
        let dir = tempdir()?;
        let (a, b) = {
            let cache = WriteCache::open(dir.path(), None, true)?;
            let a = cache.add_file("a.sbt")?;
            let b = cache.add_file("b.nbt")?;
            let page = cache.allocate(a)?;
            assert_eq!(page, 0);
            (a, b)
        };

        let cache = WriteCache::open(dir.path(), None, true)?;
        assert_eq!(cache.files(), vec![("a.sbt".to_string(), a), ("b.nbt".to_string(), b)]);
        assert_eq!(cache.filled_up_to(a)?, 1);
        assert_eq!(cache.filled_up_to(b)?, 0);
        assert!(cache.add_file("c.sbt")?.0 > b.0);

        Ok(())
    }

    #[test]
    fn test_store_and_load_with_checksum() -> Result<()> {
        let dir = tempdir()?;
        let cache = WriteCache::open(dir.path(), None, true)?;
        let file_id = cache.add_file("data.sbt")?;
        let key = PageKey::new(file_id, cache.allocate(file_id)?);

        let mut page = vec![0u8; PAGE_SIZE];
        page[PAGE_PAYLOAD_OFFSET] = 77;
        cache.store(key, &page, None)?;

        let mut buf = vec![0u8; PAGE_SIZE];
        cache.load(key, &mut buf)?;
        assert_eq!(buf[PAGE_PAYLOAD_OFFSET], 77);

        // Corrupt the page on disk behind the cache's back
        let path = cache.file_path(file_id).unwrap();
        let mut raw = fs::read(&path)?;
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&path, raw)?;

        let reopened = WriteCache::open(dir.path(), None, true)?;
        assert!(matches!(
            reopened.load(key, &mut buf),
            Err(StorageError::ChecksumMismatch { .. })
        ));
        let unchecked = WriteCache::open(dir.path(), None, false)?;
        assert!(unchecked.load(key, &mut buf).is_ok());

        Ok(())
    }

    #[test]
    fn test_delete_file() -> Result<()> {
        let dir = tempdir()?;
        let cache = WriteCache::open(dir.path(), None, true)?;
        let file_id = cache.add_file("gone.sbt")?;
        let path = cache.file_path(file_id).unwrap();

        cache.delete_file(file_id)?;
        assert!(!path.exists());
        assert!(!cache.exists("gone.sbt"));
        assert!(cache.load(PageKey::new(file_id, 0), &mut vec![0u8; PAGE_SIZE]).is_err());
        assert!(cache.delete_file(file_id).is_err());

        Ok(())
    }
}
