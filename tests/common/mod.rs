#![allow(dead_code)]

//! Synthetic kernel image for driving the walkers: a byte-addressed
//! mock target plus type catalogs for the layout generations the
//! resolver must tell apart.

use std::collections::HashMap;

use memflow::types::Address;

use linux_list_lru::{Error, KernelTarget, Result, TypeCatalog, TypeRef, View};

pub const PAGE_SIZE: u64 = 4096;

/// In-memory fake of an open kernel target. Every byte read must have
/// been written beforehand; reads of unmapped addresses fail, which
/// doubles as a check that the walkers only touch what they should.
pub struct MockKernel {
    mem: HashMap<u64, u8>,
    pub nodes: Vec<u32>,
    globals: HashMap<String, u64>,
    constants: HashMap<String, u64>,
    xarrays: HashMap<u64, Vec<(u64, u64)>>,
    pages: Vec<(u64, u64)>,
    cursor: u64,
}

impl MockKernel {
    pub fn new() -> MockKernel {
        MockKernel {
            mem: HashMap::new(),
            nodes: vec![0],
            globals: HashMap::new(),
            constants: HashMap::new(),
            xarrays: HashMap::new(),
            pages: Vec::new(),
            cursor: 0xffff_8880_0000_0000,
        }
    }

    /// Carve out `size` bytes of fake kernel address space.
    pub fn alloc(&mut self, size: u64) -> u64 {
        let addr = self.cursor;
        self.cursor += (size + 7) & !7;
        addr
    }

    /// Carve out `n` consecutive page-aligned pages and map each to a
    /// freshly allocated page descriptor. Returns (virt base, descs).
    pub fn alloc_pages(&mut self, n: u64) -> (u64, Vec<u64>) {
        self.cursor = (self.cursor + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let base = self.cursor;
        self.cursor += n * PAGE_SIZE;
        let descs: Vec<u64> = (0..n).map(|_| self.alloc(64)).collect();
        for (i, &desc) in descs.iter().enumerate() {
            self.pages.push((base + i as u64 * PAGE_SIZE, desc));
        }
        (base, descs)
    }

    pub fn write_u8(&mut self, addr: u64, val: u8) {
        self.mem.insert(addr, val);
    }

    pub fn write_u32(&mut self, addr: u64, val: u32) {
        for (i, b) in val.to_le_bytes().iter().enumerate() {
            self.mem.insert(addr + i as u64, *b);
        }
    }

    pub fn write_u64(&mut self, addr: u64, val: u64) {
        for (i, b) in val.to_le_bytes().iter().enumerate() {
            self.mem.insert(addr + i as u64, *b);
        }
    }

    pub fn set_global(&mut self, name: &str, val: u64) {
        self.globals.insert(name.to_string(), val);
    }

    pub fn set_constant(&mut self, name: &str, val: u64) {
        self.constants.insert(name.to_string(), val);
    }

    pub fn set_xarray(&mut self, root: u64, entries: Vec<(u64, u64)>) {
        self.xarrays.insert(root, entries);
    }

    /// Link `nodes` (addresses of embedded list_heads) into the
    /// circular list at `head`. An empty slice links the head to
    /// itself.
    pub fn link_list(&mut self, head: u64, nodes: &[u64]) {
        let mut prev = head;
        for &node in nodes {
            self.write_u64(prev, node);
            self.write_u64(node + 8, prev);
            prev = node;
        }
        self.write_u64(prev, head);
        self.write_u64(head + 8, prev);
    }

    /// Allocate `count` entry objects and link their list member into
    /// the list at `head`. Returns the entry base addresses in list
    /// order.
    pub fn push_entries(&mut self, head: u64, count: usize, member_off: u64) -> Vec<u64> {
        let entries: Vec<u64> = (0..count).map(|_| self.alloc(64)).collect();
        let nodes: Vec<u64> = entries.iter().map(|e| e + member_off).collect();
        self.link_list(head, &nodes);
        entries
    }
}

impl KernelTarget for MockKernel {
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()> {
        let base = addr.to_umem() as u64;
        for (i, b) in out.iter_mut().enumerate() {
            *b = *self
                .mem
                .get(&(base + i as u64))
                .ok_or(Error::InvalidAccess("read of unmapped mock address"))?;
        }
        Ok(())
    }

    fn online_nodes(&mut self) -> Result<Vec<u32>> {
        Ok(self.nodes.clone())
    }

    fn global_u64(&mut self, name: &str) -> Result<u64> {
        self.globals
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownSymbol(name.to_string()))
    }

    fn constant(&mut self, name: &str) -> Result<u64> {
        self.constants
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownSymbol(name.to_string()))
    }

    fn xa_entries(&mut self, xa: Address) -> Result<Vec<(u64, Address)>> {
        Ok(self
            .xarrays
            .get(&(xa.to_umem() as u64))
            .map(|entries| {
                entries
                    .iter()
                    .map(|&(idx, val)| (idx, Address::from(val)))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn xa_load(&mut self, xa: Address, index: u64) -> Result<Option<Address>> {
        Ok(self
            .xarrays
            .get(&(xa.to_umem() as u64))
            .and_then(|entries| entries.iter().find(|&&(idx, _)| idx == index))
            .map(|&(_, val)| Address::from(val)))
    }

    fn virt_to_page(&mut self, virt: Address) -> Result<Address> {
        let virt = virt.to_umem() as u64;
        self.pages
            .iter()
            .find(|&&(base, _)| virt >= base && virt < base + PAGE_SIZE)
            .map(|&(_, desc)| Address::from(desc))
            .ok_or(Error::InvalidAccess("no page backs this address"))
    }

    fn page_to_virt(&mut self, page: Address) -> Result<Address> {
        let page = page.to_umem() as u64;
        self.pages
            .iter()
            .find(|&&(_, desc)| desc == page)
            .map(|&(base, _)| Address::from(base))
            .ok_or(Error::InvalidAccess("not a page descriptor"))
    }
}

pub fn lru_view(addr: u64) -> View {
    View::new(Address::from(addr), TypeRef::structure("list_lru"))
}

/// Drain an entry iterator into plain entry addresses, panicking on
/// read errors.
pub fn addrs<I>(iter: I) -> Vec<u64>
where
    I: Iterator<Item = Result<View>>,
{
    iter.map(|r| r.unwrap().addr.to_umem() as u64).collect()
}

/// Types every generation shares: the list plumbing and a caller
/// entry type with its list member at offset 16.
fn base_types(types: &mut TypeCatalog) {
    types
        .structure("list_head", 16)
        .field("next", 0, TypeRef::struct_ptr("list_head"))
        .field("prev", 8, TypeRef::struct_ptr("list_head"));
    types
        .structure("list_lru_one", 24)
        .field("list", 0, TypeRef::structure("list_head"))
        .field("nr_items", 16, TypeRef::Int(8));
    types
        .structure("dentry", 64)
        .field("d_lru", 16, TypeRef::structure("list_head"));
}

/// v5.13+ mainline: xarray at the root, memcg_aware flag, per-node
/// sublists inside `struct list_lru_memcg`.
pub fn catalog_v6() -> TypeCatalog {
    let mut types = TypeCatalog::new();
    base_types(&mut types);
    types.structure("xarray", 16);
    types
        .structure("list_lru_node", 32)
        .field("lru", 0, TypeRef::structure("list_lru_one"));
    types
        .structure("list_lru", 40)
        .field("xa", 0, TypeRef::structure("xarray"))
        .field("node", 16, TypeRef::struct_ptr("list_lru_node"))
        .field("memcg_aware", 24, TypeRef::Bool);
    types
        .structure("list_lru_memcg", 0)
        .field("node", 0, TypeRef::array(TypeRef::structure("list_lru_one")));
    types
}

/// Distribution kernel where `node` was KABI-replaced by an `ext`
/// pointer; the xarray sits behind it.
pub fn catalog_uek7() -> TypeCatalog {
    let mut types = TypeCatalog::new();
    base_types(&mut types);
    types.structure("xarray", 16);
    types
        .structure("list_lru_node", 32)
        .field("lru", 0, TypeRef::structure("list_lru_one"));
    types
        .structure("list_lru_ext", 32)
        .field("xa", 0, TypeRef::structure("xarray"))
        .field("node", 16, TypeRef::struct_ptr("list_lru_node"));
    // node and ext share offset 0, a union left behind by the rename
    types
        .structure("list_lru", 16)
        .field("node", 0, TypeRef::struct_ptr("list_lru_node"))
        .field("ext", 0, TypeRef::struct_ptr("list_lru_ext"))
        .field("memcg_aware", 8, TypeRef::Bool);
    types
        .structure("list_lru_memcg", 0)
        .field("node", 0, TypeRef::array(TypeRef::structure("list_lru_one")));
    types
}

/// Before v5.13: no memcg_aware flag, no xarray; each node carries a
/// memcg_lrus array of sublist pointers bounded by the global
/// memcg_nr_cache_ids.
pub fn catalog_v5_10() -> TypeCatalog {
    let mut types = TypeCatalog::new();
    base_types(&mut types);
    types
        .structure("list_lru_node", 48)
        .field("lru", 0, TypeRef::structure("list_lru_one"))
        .field("memcg_lrus", 24, TypeRef::struct_ptr("list_lru_memcg"));
    types
        .structure("list_lru", 16)
        .field("node", 0, TypeRef::struct_ptr("list_lru_node"));
    types
        .structure("list_lru_memcg", 0)
        .field("lru", 16, TypeRef::array(TypeRef::struct_ptr("list_lru_one")));
    types
}

/// Slab ownership types shared by the page-era builders below.
fn owner_types(types: &mut TypeCatalog) {
    types
        .structure("obj_cgroup", 16)
        .field("memcg", 0, TypeRef::struct_ptr("mem_cgroup"));
    types
        .structure("mem_cgroup", 128)
        .field("kmemcg_id", 8, TypeRef::Int(4));
}

/// v5.17+: page carries the memcg_data word but slab metadata moved to
/// `struct slab`, an overlay of the page descriptor.
pub fn page_types_v5_17(types: &mut TypeCatalog) {
    owner_types(types);
    types
        .structure("page", 64)
        .field("flags", 0, TypeRef::UInt(8))
        .field("compound_head", 8, TypeRef::UInt(8))
        .field("memcg_data", 16, TypeRef::UInt(8));
    types
        .structure("slab", 64)
        .field("slab_cache", 24, TypeRef::struct_ptr("kmem_cache"));
    types
        .structure("kmem_cache", 128)
        .field("size", 0, TypeRef::UInt(4));
}

/// v5.13..v5.16: memcg_data word and slab_cache both on the page.
pub fn page_types_v5_13(types: &mut TypeCatalog) {
    owner_types(types);
    types
        .structure("page", 64)
        .field("flags", 0, TypeRef::UInt(8))
        .field("compound_head", 8, TypeRef::UInt(8))
        .field("memcg_data", 16, TypeRef::UInt(8))
        .field("slab_cache", 24, TypeRef::struct_ptr("kmem_cache"));
    types
        .structure("kmem_cache", 128)
        .field("size", 0, TypeRef::UInt(4));
}

/// Around v5.10: the tagged word still wears its pointer type,
/// `obj_cgroups`.
pub fn page_types_v5_10(types: &mut TypeCatalog) {
    owner_types(types);
    types
        .structure("page", 64)
        .field("flags", 0, TypeRef::UInt(8))
        .field("compound_head", 8, TypeRef::UInt(8))
        .field("obj_cgroups", 16, TypeRef::struct_ptr("obj_cgroup"))
        .field("slab_cache", 24, TypeRef::struct_ptr("kmem_cache"));
    types
        .structure("kmem_cache", 128)
        .field("size", 0, TypeRef::UInt(4));
}

/// Oldest supported accounting: no tagged word at all, the owner hangs
/// off the cache's memcg_params.
pub fn page_types_legacy(types: &mut TypeCatalog) {
    owner_types(types);
    types
        .structure("page", 64)
        .field("flags", 0, TypeRef::UInt(8))
        .field("compound_head", 8, TypeRef::UInt(8))
        .field("slab_cache", 24, TypeRef::struct_ptr("kmem_cache"));
    types
        .structure("kmem_cache", 128)
        .field("size", 0, TypeRef::UInt(4))
        .field("memcg_params", 16, TypeRef::structure("memcg_cache_params"));
    types
        .structure("memcg_cache_params", 16)
        .field("memcg", 0, TypeRef::struct_ptr("mem_cgroup"));
}
