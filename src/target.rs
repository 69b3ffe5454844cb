use memflow::types::Address;

use crate::Result;

/// Read contract over an open kernel image, plus the handful of kernel
/// services the walkers need. An implementation typically pairs a
/// memory connector with kernel debug information; nothing here ever
/// writes to the target.
///
/// Every operation is a bounded synchronous read. The target may be a
/// live kernel, in which case results are best-effort consistent; on a
/// frozen crash dump repeated calls return identical data.
pub trait KernelTarget {
    /// Fill `out` from kernel virtual memory at `addr`.
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()>;

    /// Online NUMA node ids, ascending.
    fn online_nodes(&mut self) -> Result<Vec<u32>>;

    /// Membership test against the node-online bitmap.
    fn node_online(&mut self, nid: u32) -> Result<bool> {
        Ok(self.online_nodes()?.contains(&nid))
    }

    /// Named global scalar, e.g. `memcg_nr_cache_ids`.
    fn global_u64(&mut self, name: &str) -> Result<u64>;

    /// Named build constant, e.g. the `PG_slab` page flag bit.
    fn constant(&mut self, name: &str) -> Result<u64>;

    /// Every present (index, value) pair of the xarray rooted at `xa`,
    /// in the array's native enumeration order.
    fn xa_entries(&mut self, xa: Address) -> Result<Vec<(u64, Address)>>;

    /// Point lookup in the xarray rooted at `xa`; absent slots are
    /// `None`.
    fn xa_load(&mut self, xa: Address, index: u64) -> Result<Option<Address>>;

    /// Page descriptor backing a kernel virtual address.
    fn virt_to_page(&mut self, virt: Address) -> Result<Address>;

    /// First virtual address mapped by a page descriptor.
    fn page_to_virt(&mut self, page: Address) -> Result<Address>;

    /// Little-endian unsigned read of `width` bytes, zero extended.
    fn read_uint(&mut self, addr: Address, width: usize) -> Result<u64> {
        debug_assert!(width <= 8);
        let mut buf = [0u8; 8];
        self.read_raw_into(addr, &mut buf[..width])?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Little-endian signed read of `width` bytes, sign extended.
    fn read_int(&mut self, addr: Address, width: usize) -> Result<i64> {
        let v = self.read_uint(addr, width)?;
        if width >= 8 {
            Ok(v as i64)
        } else {
            let shift = 64 - width as u32 * 8;
            Ok(((v << shift) as i64) >> shift)
        }
    }

    fn read_u64(&mut self, addr: Address) -> Result<u64> {
        self.read_uint(addr, 8)
    }
}
