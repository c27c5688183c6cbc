//! Access structures built on the storage layer.
//!
//! - **SBTree**: Disk-resident B-tree mapping typed keys to typed values,
//!   with an optional null key and range cursors
//! - **Serializers**: Binary encodings of keys and values

pub mod btree;

pub use btree::{
    BinarySerializer, ByteArraySerializer, DuplicatePolicy, IntegerSerializer, KeyType,
    LinkSerializer, LongSerializer, Rid, SBTree, SBTreeCursor, StringSerializer,
};
