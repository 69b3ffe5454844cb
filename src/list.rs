//! Walking intrusive `struct list_head` lists.

use memflow::types::Address;

use crate::target::KernelTarget;
use crate::types::TypeCatalog;
use crate::Result;

fn next_offset(types: &TypeCatalog) -> Result<u64> {
    types.member_offset("list_head", "next")
}

/// True when the circular list at `head` links back to itself.
pub fn list_empty(
    types: &TypeCatalog,
    mem: &mut impl KernelTarget,
    head: Address,
) -> Result<bool> {
    let off = next_offset(types)?;
    let next = mem.read_u64(Address::from(head.to_umem() as u64 + off))?;
    Ok(next == head.to_umem() as u64)
}

/// In-progress walk of one circular list. Pointers are trusted as
/// read; a torn list surfaces as a read error or as early termination
/// at the head.
pub(crate) struct Walk {
    head: u64,
    cur: u64,
    next_off: u64,
    done: bool,
}

impl Walk {
    pub(crate) fn start(
        types: &TypeCatalog,
        mem: &mut impl KernelTarget,
        head: Address,
    ) -> Result<Walk> {
        let next_off = next_offset(types)?;
        let head = head.to_umem() as u64;
        let cur = mem.read_u64(Address::from(head + next_off))?;
        Ok(Walk {
            head,
            cur,
            next_off,
            done: false,
        })
    }

    /// The next list node address, or `None` once the walk is back at
    /// the head. A failed read ends the walk after being reported.
    pub(crate) fn next(&mut self, mem: &mut impl KernelTarget) -> Option<Result<Address>> {
        if self.done || self.cur == self.head {
            return None;
        }
        let node = self.cur;
        match mem.read_u64(Address::from(node + self.next_off)) {
            Ok(next) => {
                self.cur = next;
                Some(Ok(Address::from(node)))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Lazy iterator over the nodes of a `list_head` list, head excluded,
/// in link order. Yields the address of each embedded `list_head`.
pub struct ListIter<'a, M> {
    mem: &'a mut M,
    walk: Walk,
}

impl<'a, M: KernelTarget> ListIter<'a, M> {
    pub fn new(types: &TypeCatalog, mem: &'a mut M, head: Address) -> Result<Self> {
        let walk = Walk::start(types, mem, head)?;
        Ok(ListIter { mem, walk })
    }
}

impl<'a, M: KernelTarget> Iterator for ListIter<'a, M> {
    type Item = Result<Address>;

    fn next(&mut self) -> Option<Self::Item> {
        self.walk.next(self.mem)
    }
}
