//! Change-tracking page wrapper.
//!
//! A [`DurablePage`] borrows an exclusively latched page buffer and records
//! every byte range it modifies. The accumulated [`PageChanges`] are turned
//! into an Update-Page WAL record by the atomic operation that owns the page,
//! and replayed by recovery through [`DurablePage::restore_changes`].

use super::{PageRead, WAL_POSITION_OFFSET, WAL_SEGMENT_OFFSET};
use crate::storage::wal::Lsn;
use byteorder::{ByteOrder, LittleEndian};

/// Mutable page storage a [`DurablePage`] can operate on.
pub trait PageBuffer {
    fn bytes(&self) -> &[u8];
    fn bytes_mut(&mut self) -> &mut [u8];
    /// Flags the page as modified. `lsn` is the record that modified it, or
    /// [`Lsn::NONE`] when the change is not (yet) logged.
    fn mark_dirty(&mut self, lsn: Lsn);
}

/// One modified byte range with its previous and new content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageChange {
    pub offset: u32,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

impl PageChange {
    pub fn len(&self) -> usize {
        self.after.len()
    }

    pub fn is_empty(&self) -> bool {
        self.after.is_empty()
    }
}

/// Ordered list of byte-range modifications to a single page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageChanges {
    changes: Vec<PageChange>,
}

impl PageChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_changes(changes: Vec<PageChange>) -> Self {
        Self { changes }
    }

    pub fn push(&mut self, change: PageChange) {
        self.changes.push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PageChange> {
        self.changes.iter()
    }

    /// Writes every after-image into `buf`, in order.
    pub fn apply_to(&self, buf: &mut [u8]) {
        for change in &self.changes {
            let start = change.offset as usize;
            buf[start..start + change.after.len()].copy_from_slice(&change.after);
        }
    }

    /// Writes every before-image into `buf`, newest first.
    pub fn revert(&self, buf: &mut [u8]) {
        for change in self.changes.iter().rev() {
            let start = change.offset as usize;
            buf[start..start + change.before.len()].copy_from_slice(&change.before);
        }
    }

    /// Number of bytes covered by after-images.
    pub fn payload_size(&self) -> usize {
        self.changes.iter().map(|c| c.after.len()).sum()
    }
}

impl<'a> IntoIterator for &'a PageChanges {
    type Item = &'a PageChange;
    type IntoIter = std::slice::Iter<'a, PageChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

pub struct DurablePage<'a, B: PageBuffer + ?Sized> {
    buf: &'a mut B,
    changes: PageChanges,
}

impl<'a, B: PageBuffer + ?Sized> DurablePage<'a, B> {
    pub fn new(buf: &'a mut B) -> Self {
        Self {
            buf,
            changes: PageChanges::new(),
        }
    }

    /// Overwrites `bytes.len()` bytes at `offset` and records the change.
    /// Writing identical content records nothing.
    pub fn apply_patch(&mut self, offset: usize, bytes: &[u8]) {
        let end = offset + bytes.len();
        let current = &self.buf.bytes()[offset..end];
        if current == bytes {
            return;
        }
        let before = current.to_vec();
        self.buf.bytes_mut()[offset..end].copy_from_slice(bytes);
        self.buf.mark_dirty(Lsn::NONE);
        self.changes.push(PageChange {
            offset: offset as u32,
            before,
            after: bytes.to_vec(),
        });
    }

    pub fn set_u8(&mut self, offset: usize, value: u8) {
        self.apply_patch(offset, &[value]);
    }

    pub fn set_u16(&mut self, offset: usize, value: u16) {
        let mut tmp = [0u8; 2];
        LittleEndian::write_u16(&mut tmp, value);
        self.apply_patch(offset, &tmp);
    }

    pub fn set_u32(&mut self, offset: usize, value: u32) {
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, value);
        self.apply_patch(offset, &tmp);
    }

    pub fn set_i32(&mut self, offset: usize, value: i32) {
        let mut tmp = [0u8; 4];
        LittleEndian::write_i32(&mut tmp, value);
        self.apply_patch(offset, &tmp);
    }

    pub fn set_u64(&mut self, offset: usize, value: u64) {
        let mut tmp = [0u8; 8];
        LittleEndian::write_u64(&mut tmp, value);
        self.apply_patch(offset, &tmp);
    }

    pub fn set_i64(&mut self, offset: usize, value: i64) {
        let mut tmp = [0u8; 8];
        LittleEndian::write_i64(&mut tmp, value);
        self.apply_patch(offset, &tmp);
    }

    /// Copies `len` bytes from `from` to `to` inside the page. Overlapping
    /// ranges behave like `memmove`.
    pub fn move_data(&mut self, from: usize, to: usize, len: usize) {
        if len == 0 || from == to {
            return;
        }
        let data = self.buf.bytes()[from..from + len].to_vec();
        self.apply_patch(to, &data);
    }

    /// Returns the changes accumulated since the last capture and clears them.
    pub fn capture_changes(&mut self) -> PageChanges {
        std::mem::take(&mut self.changes)
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Replays after-images onto the page without recording them.
    pub fn restore_changes(&mut self, changes: &PageChanges) {
        changes.apply_to(self.buf.bytes_mut());
    }

    /// Stamps the LSN header fields. Not part of the recorded change set.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        let bytes = self.buf.bytes_mut();
        LittleEndian::write_u64(&mut bytes[WAL_SEGMENT_OFFSET..], lsn.segment);
        LittleEndian::write_u64(&mut bytes[WAL_POSITION_OFFSET..], lsn.position);
    }

    pub fn buffer(&self) -> &B {
        &*self.buf
    }

    pub fn buffer_mut(&mut self) -> &mut B {
        &mut *self.buf
    }
}

impl<B: PageBuffer + ?Sized> PageRead for DurablePage<'_, B> {
    fn page_bytes(&self) -> &[u8] {
        self.buf.bytes()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::page::{PAGE_PAYLOAD_OFFSET, PAGE_SIZE};

    /// Plain in-memory page used by layout tests.
    #[derive(Debug, Clone)]
    pub(crate) struct MemPage {
        pub data: Vec<u8>,
        pub dirty: bool,
    }

    impl MemPage {
        pub(crate) fn new() -> Self {
            Self {
                data: vec![0u8; PAGE_SIZE],
                dirty: false,
            }
        }
    }

    impl PageBuffer for MemPage {
        fn bytes(&self) -> &[u8] {
            &self.data
        }

        fn bytes_mut(&mut self) -> &mut [u8] {
            &mut self.data
        }

        fn mark_dirty(&mut self, _lsn: Lsn) {
            self.dirty = true;
        }
    }

    #[test]
    fn test_apply_patch_records_before_and_after() {
        let mut mem = MemPage::new();
        let mut page = DurablePage::new(&mut mem);

        page.set_u32(PAGE_PAYLOAD_OFFSET, 0xDEAD_BEEF);
        assert_eq!(page.get_u32(PAGE_PAYLOAD_OFFSET), 0xDEAD_BEEF);

        let changes = page.capture_changes();
        assert_eq!(changes.len(), 1);
        let change = changes.iter().next().unwrap();
        assert_eq!(change.offset as usize, PAGE_PAYLOAD_OFFSET);
        assert_eq!(change.before, vec![0, 0, 0, 0]);
        assert_eq!(change.after, 0xDEAD_BEEFu32.to_le_bytes().to_vec());

        // Captured changes are cleared
        assert!(!page.has_changes());
        assert!(mem.dirty);
    }

    #[test]
    fn test_identical_patch_is_not_recorded() {
        let mut mem = MemPage::new();
        let mut page = DurablePage::new(&mut mem);

        page.set_u64(100, 0);
        assert!(!page.has_changes());

        page.set_u64(100, 7);
        page.set_u64(100, 7);
        assert_eq!(page.capture_changes().len(), 1);
    }

    #[test]
    fn test_move_data_overlapping() {
        let mut mem = MemPage::new();
        let mut page = DurablePage::new(&mut mem);

        page.apply_patch(200, &[1, 2, 3, 4, 5]);
        page.move_data(200, 202, 5);
        assert_eq!(page.get_bytes(200, 7), &[1, 2, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_restore_changes_is_idempotent() {
        let mut source = MemPage::new();
        let changes = {
            let mut page = DurablePage::new(&mut source);
            page.set_u32(64, 11);
            page.apply_patch(1000, b"hello");
            page.set_u32(64, 12);
            page.capture_changes()
        };

        let mut target = MemPage::new();
        {
            let mut page = DurablePage::new(&mut target);
            page.restore_changes(&changes);
            page.restore_changes(&changes);
            assert!(!page.has_changes());
        }
        assert_eq!(target.data, source.data);
    }

    #[test]
    fn test_revert_restores_before_images() {
        let mut mem = MemPage::new();
        let original = mem.data.clone();
        let changes = {
            let mut page = DurablePage::new(&mut mem);
            page.set_u16(300, 0xAAAA);
            page.set_u16(301, 0xBBBB);
            page.capture_changes()
        };
        changes.revert(&mut mem.data);
        assert_eq!(mem.data, original);
    }

    #[test]
    fn test_set_lsn_is_not_a_change() {
        let mut mem = MemPage::new();
        let mut page = DurablePage::new(&mut mem);

        page.set_lsn(Lsn::new(4, 4096));
        assert!(!page.has_changes());
        assert_eq!(page.lsn(), Lsn::new(4, 4096));
    }
}
