use std::ptr::NonNull;

/// Bookkeeping for one block of pages, live or cached. These live in the
/// [`NodePool`](crate::pool::NodePool) and are linked into at most one index
/// at a time, so a single set of tree links is enough.
///
/// ```plaintext
/// pages_base                                user_ptr        guard page
/// |                                         |               |
/// v                                         v               v
/// +-----------+-----------+-----------+-----+---------------+-----------+
/// |  slack ...                              | user_size ... | PROT_NONE |
/// +-----------+-----------+-----------+-----+---------------+-----------+
/// |<------------- page_count - 1 data pages --------------->|
/// ```
#[derive(Debug)]
pub struct MetadataNode {
    /// Start of the mapping, page aligned
    pub pages_base: usize,
    /// Pages in the mapping, *including* the trailing guard page
    pub page_count: usize,
    pub user_ptr: usize,
    /// The size the caller asked for, before rounding up for alignment
    pub user_size: usize,
    pub tag: Option<&'static str>,
    pub(crate) links: Links,
}

// SAFETY: a node is plain data. The links are only followed by the index
// that owns the node, under that index's lock.
unsafe impl Send for MetadataNode {}

pub type NodePtr = NonNull<MetadataNode>;

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Links {
    pub left: Option<NodePtr>,
    pub right: Option<NodePtr>,
    pub height: u32,
}

impl MetadataNode {
    pub fn new(pages_base: usize, page_count: usize) -> Self {
        Self {
            pages_base,
            page_count,
            user_ptr: 0,
            user_size: 0,
            tag: None,
            links: Links::default(),
        }
    }

    /// First byte of the guard page, one past the last usable byte
    pub fn guard_page(&self, page_size: usize) -> usize {
        self.pages_base + (self.page_count - 1) * page_size
    }

    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            user_ptr: self.user_ptr,
            user_size: self.user_size,
            pages_base: self.pages_base,
            page_count: self.page_count,
            tag: self.tag,
        }
    }
}

/// A copy of a live block's record, safe to hold on to after the index lock
/// has been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub user_ptr: usize,
    pub user_size: usize,
    pub pages_base: usize,
    pub page_count: usize,
    pub tag: Option<&'static str>,
}
