//! Page cache, freelist, and blob storage over a [`device::Device`].
//!
//! The [`PageManager`] owns the device and the cache of [`Page`]s; the
//! [`Freelist`] tracks reusable file space at page and chunk
//! granularity inside chained bitmap pages; the [`BlobManager`] stores
//! variable-length records through both. The [`Changeset`] collects the
//! pages an operation dirties so the environment can flush them
//! atomically with the write-ahead log.

mod blob;
mod changeset;
mod freelist;
mod manager;
mod page;

#[cfg(test)]
mod tests;

pub use blob::{BLOB_HEADER_SIZE, BlobManager};
pub use changeset::Changeset;
pub use freelist::Freelist;
pub use manager::{
    ALLOC_CLEAR_WITH_ZERO, ALLOC_IGNORE_FREELIST, PURGE_LIMIT, PageManager, PageState,
};
pub use page::{PAGE_NO_HEADER, Page, PageType};
