//! Single-slot bucket holding the value of the null key.
//!
//! Lives in page 0 of the tree's `.nbt` file:
//! `| page header | present (1) | value length (4) | value bytes |`.

use crate::storage::page::{DurablePage, PageBuffer, PageRead, PAGE_PAYLOAD_OFFSET};

const PRESENT_OFFSET: usize = PAGE_PAYLOAD_OFFSET;
const LENGTH_OFFSET: usize = PRESENT_OFFSET + 1;
const VALUE_OFFSET: usize = LENGTH_OFFSET + 4;

pub struct NullBucket<P> {
    page: P,
}

impl<P: PageRead> NullBucket<P> {
    pub fn new(page: P) -> Self {
        Self { page }
    }

    /// Serialized value of the null key, if one is stored.
    pub fn value_bytes(&self) -> Option<&[u8]> {
        if self.page.get_u8(PRESENT_OFFSET) == 0 {
            return None;
        }
        let len = self.page.get_u32(LENGTH_OFFSET) as usize;
        Some(self.page.get_bytes(VALUE_OFFSET, len))
    }
}

impl<'a, B: PageBuffer + ?Sized> NullBucket<DurablePage<'a, B>> {
    pub fn page_mut(&mut self) -> &mut DurablePage<'a, B> {
        &mut self.page
    }

    pub fn set_value(&mut self, value: &[u8]) {
        self.page.set_u8(PRESENT_OFFSET, 1);
        self.page.set_u32(LENGTH_OFFSET, value.len() as u32);
        self.page.apply_patch(VALUE_OFFSET, value);
    }

    pub fn remove_value(&mut self) {
        self.page.set_u8(PRESENT_OFFSET, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::durable::tests::MemPage;

    #[test]
    fn test_set_and_remove_value() {
        let mut mem = MemPage::new();
        let mut bucket = NullBucket::new(DurablePage::new(&mut mem));
        assert_eq!(bucket.value_bytes(), None);

        bucket.set_value(b"null value");
        assert_eq!(bucket.value_bytes(), Some(&b"null value"[..]));

        bucket.set_value(b"short");
        assert_eq!(bucket.value_bytes(), Some(&b"short"[..]));

        bucket.remove_value();
        assert_eq!(bucket.value_bytes(), None);
        assert!(bucket.page_mut().has_changes());
    }
}
