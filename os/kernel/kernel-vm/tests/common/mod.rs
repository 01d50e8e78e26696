//! Host doubles for the collaborators of the paging core.

#![allow(dead_code)]

use kernel_info::ids::Pid;
use kernel_info::memory::PAGE_SIZE;
use kernel_vm::{
    BackingStore, Hat, HeapPhysMapper, IoError, MemoryRegion, PageFrame, Pfn, PhysicalAddress,
    Protection, PsetId, SwapBlock, SwapDevice, VasId, ViewId, VirtualAddress, Vm, VmConfig,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const BASE: VirtualAddress = VirtualAddress::new(0x4000_0000);
pub const PAGE: u64 = PAGE_SIZE as u64;

/// 32 frames below the DMA limit at 1 MiB.
pub const LOW: MemoryRegion = MemoryRegion::usable(PhysicalAddress::new(0x10_0000), 32);
/// 64 frames above the DMA limit at 32 MiB.
pub const HIGH: MemoryRegion = MemoryRegion::usable(PhysicalAddress::new(0x200_0000), 64);

/// Records the translations the paging core installs.
#[derive(Default)]
pub struct RecordingHat {
    map: Mutex<HashMap<(ViewId, VirtualAddress), (Pfn, bool)>>,
}

impl RecordingHat {
    pub fn translation(&self, view: ViewId, vaddr: VirtualAddress) -> Option<(Pfn, bool)> {
        self.map.lock().unwrap().get(&(view, vaddr)).copied()
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}

impl Hat for RecordingHat {
    fn add_translation(&self, view: ViewId, vaddr: VirtualAddress, pfn: Pfn, writable: bool) {
        self.map.lock().unwrap().insert((view, vaddr), (pfn, writable));
    }

    fn remove_translation(&self, view: ViewId, vaddr: VirtualAddress, pfn: Pfn) {
        let removed = self.map.lock().unwrap().remove(&(view, vaddr));
        assert_eq!(removed.map(|(p, _)| p), Some(pfn), "removing unknown translation");
    }
}

#[derive(Default)]
pub struct MemSwap {
    pages: Mutex<HashMap<u64, Vec<u8>>>,
    next: AtomicU64,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    pub areas: AtomicUsize,
    pub fail_writes: AtomicBool,
}

impl MemSwap {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl SwapDevice for MemSwap {
    fn alloc(&self, pages: u32) -> Result<SwapBlock, IoError> {
        self.areas.fetch_add(1, Ordering::SeqCst);
        Ok(SwapBlock(self.next.fetch_add(u64::from(pages), Ordering::SeqCst)))
    }

    fn free(&self, _block: SwapBlock, _pages: u32) {
        self.areas.fetch_sub(1, Ordering::SeqCst);
    }

    fn read_page(&self, block: SwapBlock, buf: &mut PageFrame) -> Result<(), IoError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let pages = self.pages.lock().unwrap();
        let data = pages.get(&block.0).ok_or(IoError::Failed)?;
        buf.as_bytes_mut().copy_from_slice(data);
        Ok(())
    }

    fn write_page(&self, block: SwapBlock, buf: &PageFrame) -> Result<(), IoError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(IoError::Failed);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.pages
            .lock()
            .unwrap()
            .insert(block.0, buf.as_bytes().to_vec());
        Ok(())
    }
}

/// A file shared by every connection opened on it.
pub struct MemFile {
    data: Vec<u8>,
    pub open: AtomicUsize,
    pub reads: AtomicUsize,
    /// Number of upcoming reads that fail.
    pub fail_reads: AtomicUsize,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data,
            open: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            fail_reads: AtomicUsize::new(0),
        })
    }

    pub fn connect(self: &Arc<Self>) -> Box<dyn BackingStore> {
        self.open.fetch_add(1, Ordering::SeqCst);
        Box::new(Connection {
            file: Arc::clone(self),
            closed: AtomicBool::new(false),
        })
    }

    pub fn open_handles(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

struct Connection {
    file: Arc<MemFile>,
    closed: AtomicBool,
}

impl BackingStore for Connection {
    fn read_page(&self, offset: u64, buf: &mut PageFrame, len: usize) -> Result<usize, IoError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IoError::Closed);
        }
        self.file.reads.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .file
            .fail_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(IoError::Failed);
        }
        let start = usize::try_from(offset).unwrap().min(self.file.data.len());
        let n = len.min(self.file.data.len() - start);
        buf.as_bytes_mut()[..n].copy_from_slice(&self.file.data[start..start + n]);
        Ok(n)
    }

    fn write_page(&self, _offset: u64, _buf: &PageFrame, _len: usize) -> Result<(), IoError> {
        Err(IoError::Failed)
    }

    fn dup(&self) -> Result<Box<dyn BackingStore>, IoError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IoError::Closed);
        }
        Ok(self.file.connect())
    }

    fn close(&self) {
        assert!(!self.closed.swap(true, Ordering::SeqCst), "double close");
        self.file.open.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Fixture {
    pub vm: Arc<Vm>,
    pub hat: Arc<RecordingHat>,
    pub swap: Arc<MemSwap>,
}

pub fn fixture_with(map: &[MemoryRegion], config: VmConfig) -> Fixture {
    let hat = Arc::new(RecordingHat::default());
    let swap = Arc::new(MemSwap::default());
    let vm = Vm::new(
        config,
        map,
        Box::new(HeapPhysMapper::from_memory_map(map)),
        Arc::clone(&hat) as Arc<dyn Hat>,
        Arc::clone(&swap) as Arc<dyn SwapDevice>,
    );
    Fixture {
        vm: Arc::new(vm),
        hat,
        swap,
    }
}

/// Low and high memory, default configuration.
pub fn fixture() -> Fixture {
    fixture_with(&[LOW, HIGH], VmConfig::default())
}

impl Fixture {
    /// A fresh address space with `pages` of anonymous memory at [`BASE`].
    pub fn anon(&self, pid: u32, pages: u32, prot: Protection) -> (VasId, ViewId, PsetId) {
        let vas = self.vm.create_vas(Pid(pid));
        let pset = self.vm.create_zero_fill(pages).unwrap();
        let view = self.vm.attach(vas, pset, BASE, 0, pages, prot).unwrap();
        self.vm.release_pset(pset).unwrap();
        (vas, view, pset)
    }

    /// A fresh address space with a read-only view of `file` at [`BASE`].
    pub fn mapped_file(&self, pid: u32, file: &Arc<MemFile>, pages: u32) -> (VasId, ViewId, PsetId) {
        let vas = self.vm.create_vas(Pid(pid));
        let pset = self.vm.create_file(file.connect(), 0, pages).unwrap();
        let view = self
            .vm
            .attach(vas, pset, BASE, 0, pages, Protection::READ)
            .unwrap();
        self.vm.release_pset(pset).unwrap();
        (vas, view, pset)
    }

    pub fn read_vec(&self, vas: VasId, vaddr: VirtualAddress, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.vm.read(vas, vaddr, &mut buf).unwrap();
        buf
    }
}

/// Deterministic non-zero bytes.
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_add((i % 251) as u8) | 1)
        .collect()
}
