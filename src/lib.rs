//! Helpers for walking a Linux kernel's `list_lru` structures from an
//! already-open memory target, either a crash dump or a live image.
//!
//! An LRU list can be created memcg aware, and its entries are kept
//! ordered by NUMA node. The in-memory shape of `struct list_lru` has
//! changed several times over kernel history: flat per-node lists, then
//! per-node arrays of per-memcg sublists, then an xarray keyed by memcg
//! index, with an additional field rename (`node` replaced by `ext`)
//! layered on top by some distribution kernels. [`LruLayout::resolve`]
//! probes which shape is present from type information alone, so one
//! build of a tool runs unmodified against any of these kernels.
//!
//! [`iter_entries`] walks a whole `list_lru`, grouped by NUMA node.
//! [`iter_memcg_node_entries`] restricts the walk to one memcg index and
//! one node. [`kmem_to_memcg_idx`] goes the other way: given the address
//! of a slab allocated object, it finds the kmemcg id of the memcg that
//! owns it. Only per-object slab accounting is resolved; the
//! `MEMCG_DATA_KMEM` case reports not found.
//!
//! All memory is read through the [`KernelTarget`] contract; the crate
//! itself owns no kernel state and never writes.

pub mod list;
pub mod lru;
pub mod memcg;
pub mod target;
pub mod types;

pub use crate::list::{list_empty, ListIter};
pub use crate::lru::{iter_entries, iter_memcg_node_entries, LruIter, LruLayout, MemcgLayout};
pub use crate::memcg::{
    kmem_to_memcg_idx, MemcgData, MEMCG_DATA_KMEM, MEMCG_DATA_OBJCGS,
};
pub use crate::target::KernelTarget;
pub use crate::types::{TypeCatalog, TypeRef, View};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// None of the known `struct list_lru` shapes matched the type
    /// information. Fatal for the call; never silently defaulted.
    #[error("unsupported list_lru layout: {0}")]
    UnsupportedLayout(&'static str),

    /// A struct name is absent from the type catalog.
    #[error("unknown type: {0}")]
    UnknownType(String),

    /// A field access named a member the type does not carry.
    #[error("type {0} has no member {1}")]
    MissingField(String, String),

    /// A named global or build constant could not be looked up.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// A view was used in a way its type does not permit, e.g. a
    /// scalar read of a struct.
    #[error("invalid access: {0}")]
    InvalidAccess(&'static str),

    /// A read from the underlying memory target failed.
    #[error("memory read failed: {0}")]
    Memory(#[from] memflow::error::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
