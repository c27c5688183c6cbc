//! Tree metadata stored in page 0 of the `.sbt` file.

use super::serializer::KeyType;
use crate::storage::error::StorageResult;
use crate::storage::page::{DurablePage, PageBuffer, PageRead, PAGE_PAYLOAD_OFFSET};

const TREE_SIZE_OFFSET: usize = PAGE_PAYLOAD_OFFSET;
const ROOT_INDEX_OFFSET: usize = TREE_SIZE_OFFSET + 8;
const FREE_LIST_HEAD_OFFSET: usize = ROOT_INDEX_OFFSET + 8;
const KEY_SERIALIZER_OFFSET: usize = FREE_LIST_HEAD_OFFSET + 8;
const VALUE_SERIALIZER_OFFSET: usize = KEY_SERIALIZER_OFFSET + 1;
const NULLABLE_OFFSET: usize = VALUE_SERIALIZER_OFFSET + 1;
const KEY_SIZE_OFFSET: usize = NULLABLE_OFFSET + 1;
const KEY_TYPES_COUNT_OFFSET: usize = KEY_SIZE_OFFSET + 4;
const KEY_TYPES_OFFSET: usize = KEY_TYPES_COUNT_OFFSET + 4;

pub const META_PAGE_INDEX: u64 = 0;
pub const ROOT_PAGE_INDEX: u64 = 1;

pub struct MetaPage<P> {
    page: P,
}

impl<P: PageRead> MetaPage<P> {
    pub fn new(page: P) -> Self {
        Self { page }
    }

    /// Number of entries in the tree, the null key included.
    pub fn tree_size(&self) -> u64 {
        self.page.get_u64(TREE_SIZE_OFFSET)
    }

    pub fn root_index(&self) -> u64 {
        self.page.get_u64(ROOT_INDEX_OFFSET)
    }

    pub fn free_list_head(&self) -> Option<u64> {
        let raw = self.page.get_i64(FREE_LIST_HEAD_OFFSET);
        (raw >= 0).then_some(raw as u64)
    }

    pub fn key_serializer_id(&self) -> u8 {
        self.page.get_u8(KEY_SERIALIZER_OFFSET)
    }

    pub fn value_serializer_id(&self) -> u8 {
        self.page.get_u8(VALUE_SERIALIZER_OFFSET)
    }

    pub fn nullable(&self) -> bool {
        self.page.get_u8(NULLABLE_OFFSET) != 0
    }

    pub fn key_size(&self) -> u32 {
        self.page.get_u32(KEY_SIZE_OFFSET)
    }

    pub fn key_types(&self) -> StorageResult<Vec<KeyType>> {
        let count = self.page.get_u32(KEY_TYPES_COUNT_OFFSET) as usize;
        self.page
            .get_bytes(KEY_TYPES_OFFSET, count)
            .iter()
            .map(|id| KeyType::from_id(*id))
            .collect()
    }
}

impl<'a, B: PageBuffer + ?Sized> MetaPage<DurablePage<'a, B>> {
    pub fn page_mut(&mut self) -> &mut DurablePage<'a, B> {
        &mut self.page
    }

    pub fn init(
        &mut self,
        key_serializer_id: u8,
        value_serializer_id: u8,
        nullable: bool,
        key_size: u32,
        key_types: &[KeyType],
    ) {
        self.page.set_u64(TREE_SIZE_OFFSET, 0);
        self.page.set_u64(ROOT_INDEX_OFFSET, ROOT_PAGE_INDEX);
        self.page.set_i64(FREE_LIST_HEAD_OFFSET, -1);
        self.page.set_u8(KEY_SERIALIZER_OFFSET, key_serializer_id);
        self.page.set_u8(VALUE_SERIALIZER_OFFSET, value_serializer_id);
        self.page.set_u8(NULLABLE_OFFSET, nullable as u8);
        self.page.set_u32(KEY_SIZE_OFFSET, key_size);
        self.page
            .set_u32(KEY_TYPES_COUNT_OFFSET, key_types.len() as u32);
        let ids: Vec<u8> = key_types.iter().map(|t| *t as u8).collect();
        self.page.apply_patch(KEY_TYPES_OFFSET, &ids);
    }

    pub fn set_tree_size(&mut self, size: u64) {
        self.page.set_u64(TREE_SIZE_OFFSET, size);
    }

    pub fn set_free_list_head(&mut self, head: Option<u64>) {
        self.page
            .set_i64(FREE_LIST_HEAD_OFFSET, head.map_or(-1, |index| index as i64));
    }
}
