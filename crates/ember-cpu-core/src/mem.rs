//! Guest memory: address translation, the split-page store protocol, and
//! the locked read-modify-write path.
//!
//! All multibyte accesses on a bus behave with acquire/release ordering at
//! aligned word sizes, which is what x86-TSO requires of us; a bus is owned
//! by one guest thread and cross-thread sharing synchronises through the
//! per-page bus locks below.

use crate::exception::Exception;
use crate::state::Machine;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

pub const PAGE_SIZE: u64 = 4096;

// 4-level page-table entry bits.
pub const PTE_V: u64 = 0x01;
pub const PTE_RW: u64 = 0x02;
pub const PTE_U: u64 = 0x04;
pub const PTE_TA: u64 = 0x0000_7fff_ffff_f000;
pub const PTE_XD: u64 = 1 << 63;

/// Guest-physical memory plus translation. `translate` resolves one byte's
/// page; the caller may touch bytes from the returned physical address to
/// the end of that page without re-translating.
pub trait Bus {
    fn translate(&mut self, vaddr: i64, write: bool) -> Result<u64, Exception>;
    /// Instruction-fetch translation: like a read, but an
    /// execute-disabled page faults.
    fn translate_exec(&mut self, vaddr: i64) -> Result<u64, Exception> {
        self.translate(vaddr, false)
    }
    fn ram(&mut self) -> &mut [u8];
    fn io_read(&mut self, port: u16, size: u32) -> Result<u64, Exception>;
    fn io_write(&mut self, port: u16, size: u32, val: u64) -> Result<(), Exception>;
    /// Drops cached translations (guest mmap/mprotect/CR3 writes).
    fn invalidate_tlb(&mut self) {}
}

/// A flat, identity-mapped bus: every address below the RAM size is valid
/// and writable. This is the real-mode memory model and the test double.
#[derive(Debug, Clone)]
pub struct FlatBus {
    mem: Vec<u8>,
}

impl FlatBus {
    pub fn new(size: usize) -> Self {
        FlatBus { mem: vec![0; size] }
    }

    pub fn load(&mut self, addr: u64, bytes: &[u8]) {
        let at = addr as usize;
        self.mem[at..at + bytes.len()].copy_from_slice(bytes);
    }
}

impl Bus for FlatBus {
    fn translate(&mut self, vaddr: i64, _write: bool) -> Result<u64, Exception> {
        if (0..self.mem.len() as i64).contains(&vaddr) {
            Ok(vaddr as u64)
        } else {
            Err(Exception::segv(vaddr))
        }
    }

    fn ram(&mut self) -> &mut [u8] {
        &mut self.mem
    }

    fn io_read(&mut self, _port: u16, _size: u32) -> Result<u64, Exception> {
        Err(Exception::ProtectionFault)
    }

    fn io_write(&mut self, _port: u16, _size: u32, _val: u64) -> Result<(), Exception> {
        Err(Exception::ProtectionFault)
    }
}

#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    vpage: i64,
    ppage: u64,
    writable: bool,
    executable: bool,
}

const TLB_WAYS: usize = 64;

/// A bus with 4-level paging rooted at CR3 and a direct-mapped TLB.
pub struct PagedBus {
    mem: Vec<u8>,
    cr3: u64,
    paging: bool,
    tlb: [TlbEntry; TLB_WAYS],
}

impl PagedBus {
    pub fn new(size: usize) -> Self {
        PagedBus {
            mem: vec![0; size],
            cr3: 0,
            paging: false,
            tlb: [TlbEntry {
                vpage: -1,
                ppage: 0,
                writable: false,
                executable: false,
            }; TLB_WAYS],
        }
    }

    pub fn load(&mut self, paddr: u64, bytes: &[u8]) {
        let at = paddr as usize;
        self.mem[at..at + bytes.len()].copy_from_slice(bytes);
    }

    pub fn set_cr3(&mut self, cr3: u64) {
        self.cr3 = cr3 & PTE_TA;
        self.invalidate_tlb();
    }

    pub fn enable_paging(&mut self, on: bool) {
        self.paging = on;
        self.invalidate_tlb();
    }

    fn read_pte(&self, at: u64) -> Result<u64, Exception> {
        let at = at as usize;
        if at + 8 > self.mem.len() {
            return Err(Exception::ProtectionFault);
        }
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.mem[at..at + 8]);
        Ok(u64::from_le_bytes(b))
    }

    /// Installs a 4KiB mapping into the guest page tables, allocating
    /// intermediate tables from `alloc` (a bump pointer over physical RAM).
    pub fn map_page(&mut self, alloc: &mut u64, vaddr: u64, paddr: u64, flags: u64) {
        let mut table = self.cr3;
        for level in (1..4).rev() {
            let idx = (vaddr >> (12 + 9 * level)) & 511;
            let at = (table + idx * 8) as usize;
            let mut b = [0u8; 8];
            b.copy_from_slice(&self.mem[at..at + 8]);
            let mut entry = u64::from_le_bytes(b);
            if entry & PTE_V == 0 {
                let fresh = *alloc;
                *alloc += PAGE_SIZE;
                entry = fresh | PTE_V | PTE_RW | PTE_U;
                self.mem[at..at + 8].copy_from_slice(&entry.to_le_bytes());
            }
            table = entry & PTE_TA;
        }
        let idx = (vaddr >> 12) & 511;
        let at = (table + idx * 8) as usize;
        let entry = (paddr & PTE_TA) | (flags & !PTE_TA) | PTE_V;
        self.mem[at..at + 8].copy_from_slice(&entry.to_le_bytes());
        self.invalidate_tlb();
    }

    fn walk(&mut self, vaddr: i64) -> Result<(u64, bool, bool), Exception> {
        let mut table = self.cr3;
        let mut writable = true;
        let mut executable = true;
        for level in (0..4).rev() {
            let idx = (vaddr as u64 >> (12 + 9 * level)) & 511;
            let entry = self.read_pte(table + idx * 8)?;
            if entry & PTE_V == 0 {
                return Err(Exception::segv(vaddr));
            }
            writable &= entry & PTE_RW != 0;
            executable &= entry & PTE_XD == 0;
            table = entry & PTE_TA;
        }
        Ok((table, writable, executable))
    }

    /// The shared translation path: TLB probe, then a walk on miss, with
    /// write and execute permissions checked against the accumulated bits.
    fn lookup(&mut self, vaddr: i64, write: bool, exec: bool) -> Result<u64, Exception> {
        if !self.paging {
            return if (0..self.mem.len() as i64).contains(&vaddr) {
                Ok(vaddr as u64)
            } else {
                Err(Exception::segv(vaddr))
            };
        }
        let vpage = vaddr >> 12;
        let way = (vpage as usize) & (TLB_WAYS - 1);
        let hit = self.tlb[way];
        if hit.vpage == vpage && (!write || hit.writable) && (!exec || hit.executable) {
            return Ok(hit.ppage + (vaddr as u64 & (PAGE_SIZE - 1)));
        }
        let (ppage, writable, executable) = self.walk(vaddr & !0xfff)?;
        if (write && !writable) || (exec && !executable) {
            return Err(Exception::segv(vaddr));
        }
        if ppage + PAGE_SIZE > self.mem.len() as u64 {
            return Err(Exception::segv(vaddr));
        }
        self.tlb[way] = TlbEntry {
            vpage,
            ppage,
            writable,
            executable,
        };
        Ok(ppage + (vaddr as u64 & (PAGE_SIZE - 1)))
    }
}

impl Bus for PagedBus {
    fn translate(&mut self, vaddr: i64, write: bool) -> Result<u64, Exception> {
        self.lookup(vaddr, write, false)
    }

    fn translate_exec(&mut self, vaddr: i64) -> Result<u64, Exception> {
        self.lookup(vaddr, false, true)
    }

    fn ram(&mut self) -> &mut [u8] {
        &mut self.mem
    }

    fn io_read(&mut self, _port: u16, _size: u32) -> Result<u64, Exception> {
        Err(Exception::ProtectionFault)
    }

    fn io_write(&mut self, _port: u16, _size: u32, _val: u64) -> Result<(), Exception> {
        Err(Exception::ProtectionFault)
    }

    fn invalidate_tlb(&mut self) {
        for e in &mut self.tlb {
            e.vpage = -1;
        }
    }
}

#[inline]
fn page_remaining(addr: i64) -> usize {
    (PAGE_SIZE - (addr as u64 & (PAGE_SIZE - 1))) as usize
}

/// Copies guest memory into `buf`, splitting at page boundaries. Loads are
/// performed immediately; a fault records the offending linear address.
pub fn read_mem(
    m: &mut Machine,
    bus: &mut dyn Bus,
    addr: i64,
    buf: &mut [u8],
) -> Result<(), Exception> {
    let mut done = 0;
    while done < buf.len() {
        let at = addr.wrapping_add(done as i64);
        let chunk = page_remaining(at).min(buf.len() - done);
        let phys = bus.translate(at, false).map_err(|e| fault(m, e))? as usize;
        buf[done..done + chunk].copy_from_slice(&bus.ram()[phys..phys + chunk]);
        done += chunk;
    }
    Ok(())
}

/// Stores guest memory. A store contained in one page goes straight
/// through; a store that straddles a boundary lands in the machine's stash
/// and becomes visible only when [`commit_stash`] runs, after both pages
/// have been verified writable.
pub fn write_mem(
    m: &mut Machine,
    bus: &mut dyn Bus,
    addr: i64,
    bytes: &[u8],
) -> Result<(), Exception> {
    let first = page_remaining(addr);
    if bytes.len() <= first {
        let phys = bus.translate(addr, true).map_err(|e| fault(m, e))? as usize;
        bus.ram()[phys..phys + bytes.len()].copy_from_slice(bytes);
        return Ok(());
    }
    // Fault atomically: both pages must translate before any byte moves.
    bus.translate(addr, true).map_err(|e| fault(m, e))?;
    bus.translate(addr.wrapping_add(first as i64), true)
        .map_err(|e| fault(m, e))?;
    debug_assert_eq!(m.stash.size, 0, "one split store per instruction");
    m.stash.addr = addr;
    m.stash.size = bytes.len() as u32;
    m.stash.buf[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Returns a writable view for an in-place store: the backing RAM when the
/// access fits in one page, the stash otherwise. Pair with
/// [`commit_stash`] at instruction end.
pub fn begin_store<'a>(
    m: &'a mut Machine,
    bus: &'a mut dyn Bus,
    addr: i64,
    size: usize,
) -> Result<&'a mut [u8], Exception> {
    let first = page_remaining(addr);
    if size <= first {
        let phys = bus.translate(addr, true).map_err(|e| fault(m, e))? as usize;
        return Ok(&mut bus.ram()[phys..phys + size]);
    }
    bus.translate(addr, true).map_err(|e| fault(m, e))?;
    bus.translate(addr.wrapping_add(first as i64), true)
        .map_err(|e| fault(m, e))?;
    debug_assert!(size <= m.stash.buf.len());
    // Seed with current contents so read-modify-write stores see the old
    // bytes through the stash.
    let mut cur = vec![0u8; size];
    read_mem(m, bus, addr, &mut cur)?;
    m.stash.addr = addr;
    m.stash.size = size as u32;
    m.stash.buf[..size].copy_from_slice(&cur);
    Ok(&mut m.stash.buf[..size])
}

/// Scatters any pending split store out to its two pages. Runs after every
/// retired instruction; a faulting instruction drops the stash instead.
pub fn commit_stash(m: &mut Machine, bus: &mut dyn Bus) -> Result<(), Exception> {
    if m.stash.size == 0 {
        return Ok(());
    }
    let size = m.stash.size as usize;
    let addr = m.stash.addr;
    m.stash.size = 0;
    let mut done = 0;
    while done < size {
        let at = addr.wrapping_add(done as i64);
        let chunk = page_remaining(at).min(size - done);
        let phys = bus.translate(at, true).map_err(|e| fault(m, e))? as usize;
        bus.ram()[phys..phys + chunk].copy_from_slice(&m.stash.buf[done..done + chunk]);
        done += chunk;
    }
    Ok(())
}

/// Drops an in-flight split store (fault path).
pub fn drop_stash(m: &mut Machine) {
    m.stash.size = 0;
    m.stash.addr = 0;
}

fn fault(m: &mut Machine, e: Exception) -> Exception {
    if let Exception::SegmentationFault { addr } = e {
        m.faultaddr = addr;
    }
    e
}

macro_rules! sized_access {
    ($read:ident, $write:ident, $ty:ty) => {
        pub fn $read(m: &mut Machine, bus: &mut dyn Bus, addr: i64) -> Result<$ty, Exception> {
            let mut b = [0u8; std::mem::size_of::<$ty>()];
            read_mem(m, bus, addr, &mut b)?;
            Ok(<$ty>::from_le_bytes(b))
        }

        pub fn $write(
            m: &mut Machine,
            bus: &mut dyn Bus,
            addr: i64,
            v: $ty,
        ) -> Result<(), Exception> {
            write_mem(m, bus, addr, &v.to_le_bytes())
        }
    };
}

sized_access!(read_u8, write_u8, u8);
sized_access!(read_u16, write_u16, u16);
sized_access!(read_u32, write_u32, u32);
sized_access!(read_u64, write_u64, u64);
sized_access!(read_u128, write_u128, u128);

/// Sized load selected by width log2.
pub fn read_sized(
    m: &mut Machine,
    bus: &mut dyn Bus,
    addr: i64,
    log2: usize,
) -> Result<u64, Exception> {
    match log2 {
        0 => read_u8(m, bus, addr).map(u64::from),
        1 => read_u16(m, bus, addr).map(u64::from),
        2 => read_u32(m, bus, addr).map(u64::from),
        _ => read_u64(m, bus, addr),
    }
}

/// Sized store selected by width log2.
pub fn write_sized(
    m: &mut Machine,
    bus: &mut dyn Bus,
    addr: i64,
    log2: usize,
    v: u64,
) -> Result<(), Exception> {
    match log2 {
        0 => write_u8(m, bus, addr, v as u8),
        1 => write_u16(m, bus, addr, v as u16),
        2 => write_u32(m, bus, addr, v as u32),
        _ => write_u64(m, bus, addr, v),
    }
}

const BUS_LOCK_WAYS: usize = 64;

fn bus_locks() -> &'static [Mutex<()>; BUS_LOCK_WAYS] {
    static LOCKS: OnceLock<[Mutex<()>; BUS_LOCK_WAYS]> = OnceLock::new();
    LOCKS.get_or_init(|| std::array::from_fn(|_| Mutex::new(())))
}

/// Acquires the bus lock guarding the page containing `addr`. The lock is
/// hashed by aligned page number, so distinct pages rarely contend.
pub fn lock_bus(addr: i64) -> MutexGuard<'static, ()> {
    let way = (addr as u64 >> 12) as usize & (BUS_LOCK_WAYS - 1);
    match bus_locks()[way].lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A `LOCK`-prefixed read-modify-write of `1 << log2` bytes.
///
/// Naturally-aligned windows run a lock-free compare-exchange loop
/// straight on the backing RAM. Misaligned and page-split windows fall
/// back to the page's bus lock, verifying both pages before writing, so
/// the guest never observes a torn RMW either way.
pub fn locked_rmw(
    m: &mut Machine,
    bus: &mut dyn Bus,
    addr: i64,
    log2: usize,
    mut f: impl FnMut(u64) -> u64,
) -> Result<u64, Exception> {
    let size = 1usize << log2;
    if addr as u64 & (size as u64 - 1) == 0 {
        let phys = bus.translate(addr, true).map_err(|e| fault(m, e))? as usize;
        let p = bus.ram()[phys..phys + size].as_mut_ptr();
        // The backing store is a byte buffer, so the guest-aligned slot is
        // only atomically addressable when the host pointer carries the
        // width's alignment too; degrade to the bus lock otherwise.
        if p.align_offset(size) == 0 {
            return Ok(cas_rmw(p, log2, &mut f));
        }
    }
    let _guard = lock_bus(addr);
    // Validate the whole window for writing before reading.
    bus.translate(addr, true).map_err(|e| fault(m, e))?;
    if page_remaining(addr) < size {
        bus.translate(addr.wrapping_add(page_remaining(addr) as i64), true)
            .map_err(|e| fault(m, e))?;
    }
    let old = read_sized(m, bus, addr, log2)?;
    let new = f(old);
    // Write through immediately, split or not; both pages are known good.
    let bytes = new.to_le_bytes();
    let mut done = 0;
    while done < size {
        let at = addr.wrapping_add(done as i64);
        let chunk = page_remaining(at).min(size - done);
        let phys = bus.translate(at, true).map_err(|e| fault(m, e))? as usize;
        bus.ram()[phys..phys + chunk].copy_from_slice(&bytes[done..done + chunk]);
        done += chunk;
    }
    Ok(old)
}

/// The lock-free RMW loop: load, transform, compare-exchange, retry.
/// Values cross the loop in guest byte order.
fn cas_rmw(p: *mut u8, log2: usize, f: &mut dyn FnMut(u64) -> u64) -> u64 {
    macro_rules! cas {
        ($atomic:ty, $ty:ty) => {{
            // The caller checked bounds and alignment, and the exclusive
            // bus borrow pins the slot for the duration of the loop.
            let a = unsafe { &*(p as *const $atomic) };
            loop {
                let old = <$ty>::from_le(a.load(Ordering::Acquire));
                let new = (f(old as u64) as $ty).to_le();
                if a.compare_exchange_weak(old.to_le(), new, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break old as u64;
                }
            }
        }};
    }
    match log2 {
        0 => cas!(AtomicU8, u8),
        1 => cas!(AtomicU16, u16),
        2 => cas!(AtomicU32, u32),
        _ => cas!(AtomicU64, u64),
    }
}

/// A 16-byte locked compare-exchange (CMPXCHG16B). Requires natural
/// alignment; the caller has already raised `#GP` otherwise.
pub fn locked_cmpxchg16b(
    m: &mut Machine,
    bus: &mut dyn Bus,
    addr: i64,
    expected: u128,
    desired: u128,
) -> Result<(bool, u128), Exception> {
    let _guard = lock_bus(addr);
    let old = read_u128(m, bus, addr)?;
    if old == expected {
        let phys = bus.translate(addr, true).map_err(|e| fault(m, e))? as usize;
        bus.ram()[phys..phys + 16].copy_from_slice(&desired.to_le_bytes());
        Ok((true, old))
    } else {
        Ok((false, old))
    }
}

/// Copies up to 15 instruction bytes starting at `pc`. Stops early at an
/// unmapped page; an unmapped first byte faults.
pub fn fetch(m: &mut Machine, bus: &mut dyn Bus, pc: i64) -> Result<([u8; 15], usize), Exception> {
    let mut out = [0u8; 15];
    let mut done = 0;
    while done < out.len() {
        let at = pc.wrapping_add(done as i64);
        let chunk = page_remaining(at).min(out.len() - done);
        match bus.translate_exec(at) {
            Ok(phys) => {
                let phys = phys as usize;
                out[done..done + chunk].copy_from_slice(&bus.ram()[phys..phys + chunk]);
                done += chunk;
            }
            Err(e) => {
                if done == 0 {
                    return Err(fault(m, e));
                }
                break;
            }
        }
    }
    Ok((out, done))
}
