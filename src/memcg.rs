//! Mapping a slab allocated object back to the memcg that owns it.
//!
//! Slab memcg accounting is per object: a page's accounting word
//! either points (tagged) at a per-object `obj_cgroup` array, marks
//! the allocation as charged directly (kmem), or holds a plain memcg
//! pointer. Only the per-object case is resolved here; the kmem case
//! reports not found. Kernels before the tagged
//! word kept the owner on the slab cache's `memcg_params` instead.

use log::trace;
use memflow::types::Address;

use crate::target::KernelTarget;
use crate::types::{TypeCatalog, TypeRef, View};
use crate::Result;

/// Low tag bit marking the accounting word as a per-object
/// `obj_cgroup` array pointer.
pub const MEMCG_DATA_OBJCGS: u64 = 1 << 0;
/// Low tag bit marking an allocation charged directly to a memcg.
pub const MEMCG_DATA_KMEM: u64 = 1 << 1;

const MEMCG_DATA_FLAGS_MASK: u64 = MEMCG_DATA_OBJCGS | MEMCG_DATA_KMEM;

/// The meanings a page's memcg accounting word can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemcgData {
    /// Pointer to a per-object `obj_cgroup` array.
    ObjCgroups(Address),
    /// The allocation itself is charged, kmem style. Not resolved by
    /// this module.
    Kmem(Address),
    /// Untagged word: a plain `mem_cgroup` pointer, or zero.
    Plain(Address),
}

impl MemcgData {
    /// Decode a raw accounting word by its low tag bits.
    pub fn decode(word: u64) -> MemcgData {
        if word & MEMCG_DATA_OBJCGS != 0 {
            MemcgData::ObjCgroups(Address::from(word & !MEMCG_DATA_FLAGS_MASK))
        } else if word & MEMCG_DATA_KMEM != 0 {
            MemcgData::Kmem(Address::from(word & !MEMCG_DATA_FLAGS_MASK))
        } else {
            MemcgData::Plain(Address::from(word))
        }
    }
}

/// Follow a tail page to its compound head. Bit 0 of `compound_head`
/// marks a tail page and the rest of the word is the head pointer.
fn compound_head(
    types: &TypeCatalog,
    mem: &mut impl KernelTarget,
    page: Address,
) -> Result<View> {
    let page = View::new(page, TypeRef::structure("page"));
    if page.has_field(types, "compound_head") {
        let word = page.field(types, mem, "compound_head")?.read(mem)?;
        if word & 1 != 0 {
            return Ok(View::new(Address::from(word - 1), TypeRef::structure("page")));
        }
    }
    Ok(page)
}

/// The `kmem_cache` owning a slab page: either the page's own
/// `slab_cache` member, or, where slab metadata moved into
/// `struct slab` (v5.17), the overlay's member, gated on the page
/// actually carrying `PG_slab`. `None` means the page is not slab
/// memory and the accounting word belonged to a different union
/// member.
fn slab_cache(
    types: &TypeCatalog,
    mem: &mut impl KernelTarget,
    cpage: &View,
) -> Result<Option<View>> {
    if cpage.has_field(types, "slab_cache") {
        return Ok(Some(cpage.field(types, mem, "slab_cache")?));
    }
    let flags = cpage.field(types, mem, "flags")?.read(mem)?;
    let pg_slab = mem.constant("PG_slab")?;
    if flags & (1u64 << pg_slab) == 0 {
        trace!("page {:x}: PG_slab clear, not slab memory", cpage.addr.to_umem());
        return Ok(None);
    }
    let slab = cpage.cast(TypeRef::structure("slab"));
    Ok(Some(slab.field(types, mem, "slab_cache")?))
}

/// The memcg's `kmemcg_id`, a signed kernel int. Offline and
/// never-onlined memcgs hold the -1 sentinel, which is no owner.
fn kmemcg_id(
    types: &TypeCatalog,
    mem: &mut impl KernelTarget,
    memcg: &View,
) -> Result<Option<u64>> {
    let id = memcg.field(types, mem, "kmemcg_id")?.read_signed(mem)?;
    if id < 0 {
        return Ok(None);
    }
    Ok(Some(id as u64))
}

/// Resolve the owner through a per-object `obj_cgroup` array at
/// `objcgs`. The object's slot is its offset into the page divided by
/// the cache's object size; the exact object base is never needed.
fn objcgs_owner<M: KernelTarget>(
    types: &TypeCatalog,
    mem: &mut M,
    cpage: &View,
    objcgs: Address,
    kvm: Address,
) -> Result<Option<u64>> {
    let cache = match slab_cache(types, mem, cpage)? {
        Some(cache) => cache,
        None => return Ok(None),
    };
    let objsize = cache.field(types, mem, "size")?.read(mem)?;
    if objsize == 0 {
        // corrupt cache
        return Ok(None);
    }
    let pvm = mem.page_to_virt(cpage.addr)?;
    let slot = (kvm.to_umem() as u64 - pvm.to_umem() as u64) / objsize;

    let objcg = View::new(
        objcgs,
        TypeRef::array(TypeRef::struct_ptr("obj_cgroup")),
    )
    .index(types, mem, slot)?;
    if objcg.is_null(mem)? {
        return Ok(None);
    }
    let memcg = objcg.field(types, mem, "memcg")?;
    if memcg.is_null(mem)? {
        return Ok(None);
    }
    kmemcg_id(types, mem, &memcg)
}

/// Pre-tagged-word accounting: the owner hangs off the slab cache's
/// `memcg_params`. Null links along the chain resolve to no owner
/// rather than a faulting dereference.
fn legacy_owner<M: KernelTarget>(
    types: &TypeCatalog,
    mem: &mut M,
    cpage: &View,
) -> Result<Option<u64>> {
    let cache = cpage.field(types, mem, "slab_cache")?;
    if cache.is_null(mem)? {
        return Ok(None);
    }
    let memcg = cache
        .field(types, mem, "memcg_params")?
        .field(types, mem, "memcg")?;
    if memcg.is_null(mem)? {
        return Ok(None);
    }
    kmemcg_id(types, mem, &memcg)
}

/// Map the address of a slab allocated object, e.g. an embedded LRU
/// list node, to the kmemcg id of the owning memcg. `Ok(None)` is the
/// normal "no owner" outcome, not a failure: the page is not memcg
/// tracked, is not slab memory, the object's slot is unassigned, or
/// the allocation uses kmem charging, which this routine does not
/// decode.
pub fn kmem_to_memcg_idx<M: KernelTarget>(
    types: &TypeCatalog,
    mem: &mut M,
    kvm: Address,
) -> Result<Option<u64>> {
    let page = mem.virt_to_page(kvm)?;
    let cpage = compound_head(types, mem, page)?;

    if cpage.has_field(types, "memcg_data") || cpage.has_field(types, "obj_cgroups") {
        // obj_cgroups was re-declared as the untyped memcg_data word
        // in v5.13; both carry the same tagged value.
        let word = if cpage.has_field(types, "memcg_data") {
            cpage.field(types, mem, "memcg_data")?.read(mem)?
        } else {
            cpage.field(types, mem, "obj_cgroups")?.read(mem)?
        };
        match MemcgData::decode(word) {
            MemcgData::ObjCgroups(objcgs) => objcgs_owner(types, mem, &cpage, objcgs, kvm),
            MemcgData::Kmem(_) => {
                trace!("page {:x}: kmem charged, not resolved here", cpage.addr.to_umem());
                Ok(None)
            }
            MemcgData::Plain(_) => Ok(None),
        }
    } else {
        legacy_owner(types, mem, &cpage)
    }
}
