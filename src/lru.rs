//! Layout resolution and traversal for `struct list_lru`.
//!
//! The same logical structure has shipped in several shapes:
//!
//! * flat per-node lists (`lru.node[nid].lru.list`), not memcg aware;
//! * per-node arrays of memcg sublists
//!   (`lru.node[nid].memcg_lrus.lru[idx].list`), bounded by the global
//!   `memcg_nr_cache_ids`;
//! * an xarray keyed by memcg index whose values are
//!   `struct list_lru_memcg` with one sublist per node, reached through
//!   `lru.xa` or, where `node` was KABI-replaced, `lru.ext.xa`.
//!
//! [`LruLayout::resolve`] decides between them by probing field
//! presence, first match wins. The walk itself never branches on a
//! kernel version; it only follows the resolved plan.

use log::debug;
use memflow::types::Address;

use crate::list::{list_empty, Walk};
use crate::target::KernelTarget;
use crate::types::{TypeCatalog, TypeRef, View};
use crate::{Error, Result};

/// Which memcg bookkeeping variant a `struct list_lru` carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemcgLayout {
    /// Sublists live in `struct list_lru_memcg` values of an xarray
    /// keyed by memcg index (v5.13 and newer).
    Xarray,
    /// Per-node `memcg_lrus` array of sublist pointers, bounded by the
    /// global `memcg_nr_cache_ids` (before v5.13).
    PerNodeArray,
    /// Not memcg aware; one list per node.
    None,
}

/// Resolved access plan for one `struct list_lru`. Layouts do not
/// change mid-run, so a plan can be reused across walks of the same
/// structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LruLayout {
    /// Top-level fields sit behind an `ext` member that KABI-replaced
    /// `node` on some distribution kernels.
    pub via_ext: bool,
    pub memcg: MemcgLayout,
}

impl LruLayout {
    /// Probe which of the known `struct list_lru` shapes is present.
    /// Field presence decides, never a version number, so minor
    /// reorderings keep working. No shape matching is an error, not a
    /// default.
    pub fn resolve(
        types: &TypeCatalog,
        mem: &mut impl KernelTarget,
        lru: &View,
    ) -> Result<LruLayout> {
        let via_ext = lru.has_field(types, "ext");
        let has_node = lru.has_field(types, "node");
        if !via_ext && !has_node {
            return Err(Error::UnsupportedLayout("list_lru has neither node nor ext"));
        }

        let node_has_memcg_lrus = has_node
            && types.has_field(&types.field(&lru.ty, "node")?.ty, "memcg_lrus");

        // Newer kernels say so outright; before the flag existed the
        // tell is a populated memcg_lrus on node 0.
        let mut aware = lru.has_field(types, "memcg_aware")
            && lru.field(types, mem, "memcg_aware")?.read_bool(mem)?;
        if !aware && node_has_memcg_lrus {
            aware = !lru
                .field(types, mem, "node")?
                .index(types, mem, 0)?
                .field(types, mem, "memcg_lrus")?
                .is_null(mem)?;
        }

        let memcg = if aware {
            if via_ext || lru.has_field(types, "xa") {
                MemcgLayout::Xarray
            } else if node_has_memcg_lrus {
                MemcgLayout::PerNodeArray
            } else {
                return Err(Error::UnsupportedLayout(
                    "memcg aware list_lru without xa or memcg_lrus",
                ));
            }
        } else {
            MemcgLayout::None
        };

        debug!(
            "list_lru at {:x}: via_ext={} memcg={:?}",
            lru.addr.to_umem(), via_ext, memcg
        );

        Ok(LruLayout { via_ext, memcg })
    }

    /// Walk every entry of the LRU: nodes in ascending online-node
    /// order, memcg groups within a node in their native order,
    /// entries within a sublist in list order. Entries from a later
    /// node never interleave with an earlier one.
    pub fn iter_all<'a, M: KernelTarget>(
        &self,
        types: &'a TypeCatalog,
        mem: &'a mut M,
        lru: &View,
        entry_ty: &str,
        member: &str,
    ) -> Result<LruIter<'a, M>> {
        let nodes = mem.online_nodes()?;
        let source = match self.memcg {
            MemcgLayout::Xarray => {
                let xa = self.xa_addr(types, mem, lru)?;
                let groups = mem
                    .xa_entries(xa)?
                    .into_iter()
                    .map(|(_, memcg)| memcg)
                    .collect();
                Source::Xa { groups }
            }
            MemcgLayout::PerNodeArray => {
                let nr_ids = mem.global_u64("memcg_nr_cache_ids")?;
                Source::Array {
                    first: 0,
                    last: nr_ids,
                }
            }
            MemcgLayout::None => Source::Plain,
        };
        LruIter::new(types, mem, *self, lru.clone(), entry_ty, member, nodes, source)
    }

    /// Walk the entries of one (memcg index, node) sublist. An offline
    /// node, an out-of-range index, or an unpopulated map slot walks
    /// as empty rather than failing; speculative index scans are an
    /// expected use. Without memcg awareness the index is ignored and
    /// the node's single list is walked.
    pub fn iter_one<'a, M: KernelTarget>(
        &self,
        types: &'a TypeCatalog,
        mem: &'a mut M,
        lru: &View,
        mindx: u64,
        nid: u32,
        entry_ty: &str,
        member: &str,
    ) -> Result<LruIter<'a, M>> {
        let nodes = if mem.node_online(nid)? {
            vec![nid]
        } else {
            Vec::new()
        };
        let source = match self.memcg {
            MemcgLayout::Xarray => {
                let xa = self.xa_addr(types, mem, lru)?;
                let groups = match mem.xa_load(xa, mindx)? {
                    Some(memcg) => vec![memcg],
                    None => Vec::new(),
                };
                Source::Xa { groups }
            }
            MemcgLayout::PerNodeArray => {
                let nr_ids = mem.global_u64("memcg_nr_cache_ids")?;
                if mindx < nr_ids {
                    Source::Array {
                        first: mindx,
                        last: mindx + 1,
                    }
                } else {
                    Source::Array { first: 0, last: 0 }
                }
            }
            MemcgLayout::None => Source::Plain,
        };
        LruIter::new(types, mem, *self, lru.clone(), entry_ty, member, nodes, source)
    }

    fn xa_addr(
        &self,
        types: &TypeCatalog,
        mem: &mut impl KernelTarget,
        lru: &View,
    ) -> Result<Address> {
        let xa = if self.via_ext {
            lru.field(types, mem, "ext")?.field(types, mem, "xa")?
        } else {
            lru.field(types, mem, "xa")?
        };
        Ok(xa.addr)
    }

    /// `lru.node[nid].lru.list`, or the `ext` spelling of it.
    fn plain_list_head(
        &self,
        types: &TypeCatalog,
        mem: &mut impl KernelTarget,
        lru: &View,
        nid: u32,
    ) -> Result<Address> {
        let node = if self.via_ext {
            lru.field(types, mem, "ext")?.field(types, mem, "node")?
        } else {
            lru.field(types, mem, "node")?
        };
        Ok(node
            .index(types, mem, nid as u64)?
            .field(types, mem, "lru")?
            .field(types, mem, "list")?
            .addr)
    }

    /// `lru.node[nid].memcg_lrus.lru[idx].list`.
    fn array_list_head(
        &self,
        types: &TypeCatalog,
        mem: &mut impl KernelTarget,
        lru: &View,
        nid: u32,
        idx: u64,
    ) -> Result<Address> {
        Ok(lru
            .field(types, mem, "node")?
            .index(types, mem, nid as u64)?
            .field(types, mem, "memcg_lrus")?
            .field(types, mem, "lru")?
            .index(types, mem, idx)?
            .field(types, mem, "list")?
            .addr)
    }
}

/// `memcg.node[nid]`, the per-node sublist of one xarray value.
fn memcg_node_one(
    types: &TypeCatalog,
    mem: &mut impl KernelTarget,
    memcg: Address,
    nid: u32,
) -> Result<View> {
    View::new(memcg, TypeRef::structure("list_lru_memcg"))
        .field(types, mem, "node")?
        .index(types, mem, nid as u64)
}

/// Where the memcg groups of one node come from.
enum Source {
    Plain,
    /// `list_lru_memcg` values, in the xarray's native order.
    Xa { groups: Vec<Address> },
    /// Half-open index range into the per-node sublist array.
    Array { first: u64, last: u64 },
}

enum SubList {
    Plain,
    Xa(Address),
    Array(u64),
}

/// Lazy, single-pass walk over `list_lru` entries, node major, memcg
/// group minor. Yields one typed entry view per list node. Not
/// restartable; a fresh call re-walks from scratch. Dropping it
/// mid-walk carries no cleanup obligation.
pub struct LruIter<'a, M: KernelTarget> {
    types: &'a TypeCatalog,
    mem: &'a mut M,
    layout: LruLayout,
    lru: View,
    entry_ty: TypeRef,
    member_off: u64,
    nodes: Vec<u32>,
    source: Source,
    node_pos: usize,
    group_pos: u64,
    walk: Option<Walk>,
    done: bool,
}

impl<'a, M: KernelTarget> LruIter<'a, M> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        types: &'a TypeCatalog,
        mem: &'a mut M,
        layout: LruLayout,
        lru: View,
        entry_ty: &str,
        member: &str,
        nodes: Vec<u32>,
        source: Source,
    ) -> Result<Self> {
        let member_off = types.member_offset(entry_ty, member)?;
        Ok(LruIter {
            types,
            mem,
            layout,
            lru,
            entry_ty: TypeRef::structure(entry_ty),
            member_off,
            nodes,
            source,
            node_pos: 0,
            group_pos: 0,
            walk: None,
            done: false,
        })
    }

    fn group_count(&self) -> u64 {
        match &self.source {
            Source::Plain => 1,
            Source::Xa { groups } => groups.len() as u64,
            Source::Array { first, last } => last - first,
        }
    }

    /// Begin walking the sublist selected by (node_pos, group_pos), or
    /// report it empty. Empty sublists are skipped without touching
    /// their list heads where a cheaper check exists.
    fn start_sublist(&mut self) -> Result<Option<Walk>> {
        let nid = self.nodes[self.node_pos];
        let sel = match &self.source {
            Source::Plain => SubList::Plain,
            Source::Xa { groups } => SubList::Xa(groups[self.group_pos as usize]),
            Source::Array { first, .. } => SubList::Array(first + self.group_pos),
        };
        let head = match sel {
            SubList::Plain => {
                Some(self.layout.plain_list_head(self.types, self.mem, &self.lru, nid)?)
            }
            SubList::Xa(memcg) => {
                let one = memcg_node_one(self.types, self.mem, memcg, nid)?;
                let nr_items = one
                    .field(self.types, self.mem, "nr_items")?
                    .read_signed(self.mem)?;
                if nr_items > 0 {
                    Some(one.field(self.types, self.mem, "list")?.addr)
                } else {
                    None
                }
            }
            SubList::Array(idx) => {
                let head =
                    self.layout
                        .array_list_head(self.types, self.mem, &self.lru, nid, idx)?;
                if list_empty(self.types, self.mem, head)? {
                    None
                } else {
                    Some(head)
                }
            }
        };
        match head {
            Some(head) => Ok(Some(Walk::start(self.types, self.mem, head)?)),
            None => Ok(None),
        }
    }
}

impl<'a, M: KernelTarget> Iterator for LruIter<'a, M> {
    type Item = Result<View>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            if let Some(walk) = self.walk.as_mut() {
                match walk.next(self.mem) {
                    Some(Ok(node)) => {
                        let entry = node.to_umem() as u64 - self.member_off;
                        return Some(Ok(View::new(
                            Address::from(entry),
                            self.entry_ty.clone(),
                        )));
                    }
                    Some(Err(e)) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                    None => {
                        self.walk = None;
                        self.group_pos += 1;
                    }
                }
                continue;
            }

            if self.node_pos >= self.nodes.len() {
                self.done = true;
                return None;
            }
            if self.group_pos >= self.group_count() {
                self.node_pos += 1;
                self.group_pos = 0;
                continue;
            }
            match self.start_sublist() {
                Ok(Some(walk)) => self.walk = Some(walk),
                Ok(None) => self.group_pos += 1,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Resolve the layout of `lru` and walk all of its entries. `entry_ty`
/// is the entry struct name and `member` the name of its embedded
/// `list_head`.
pub fn iter_entries<'a, M: KernelTarget>(
    types: &'a TypeCatalog,
    mem: &'a mut M,
    lru: &View,
    entry_ty: &str,
    member: &str,
) -> Result<LruIter<'a, M>> {
    let layout = LruLayout::resolve(types, mem, lru)?;
    layout.iter_all(types, mem, lru, entry_ty, member)
}

/// Resolve the layout of `lru` and walk the entries of one
/// (memcg index, NUMA node) sublist.
pub fn iter_memcg_node_entries<'a, M: KernelTarget>(
    types: &'a TypeCatalog,
    mem: &'a mut M,
    lru: &View,
    mindx: u64,
    nid: u32,
    entry_ty: &str,
    member: &str,
) -> Result<LruIter<'a, M>> {
    let layout = LruLayout::resolve(types, mem, lru)?;
    layout.iter_one(types, mem, lru, mindx, nid, entry_ty, member)
}
