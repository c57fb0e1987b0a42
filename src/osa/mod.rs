//! DMA bounce-buffer pool managed by the Tlsf algorithm.
//!
//! The DMA engine requires word-aligned source/destination addresses. When a
//! caller hands the driver a buffer that does not meet the alignment, the
//! transfer bounces through a buffer carved out of this pool.

mod consts;
mod err;
mod pool_buffer;

use core::alloc::Layout;
use core::mem::MaybeUninit;
use core::ptr::{NonNull, addr_of_mut};

use consts::MAX_POOL_SIZE;
use lazy_static::lazy_static;
use rlsf::Tlsf;
use spin::Mutex;

pub use err::{PoolError, PoolStatus};
pub use pool_buffer::PoolBuffer;

/// Backing storage handed to the Tlsf allocator once at init.
static mut POOL: [MaybeUninit<u8>; MAX_POOL_SIZE] = [MaybeUninit::uninit(); MAX_POOL_SIZE];

/// Tlsf controller over [`POOL`].
pub struct DmaPool<'a> {
    tlsf: Tlsf<'a, u32, u32, 32, 32>,
    is_ready: bool,
}

lazy_static! {
    /// Global pool manager shared by all controller instances.
    pub static ref GLOBAL_DMA_POOL: Mutex<DmaPool<'static>> = Mutex::new(DmaPool::new());
}

impl<'a> DmaPool<'a> {
    fn new() -> Self {
        Self {
            tlsf: Tlsf::new(),
            is_ready: false,
        }
    }

    unsafe fn init(&mut self) {
        if self.is_ready {
            return;
        }
        unsafe {
            self.tlsf.insert_free_block(&mut *addr_of_mut!(POOL));
        }
        self.is_ready = true;
    }

    fn alloc_aligned(&mut self, size: usize, align: usize) -> PoolStatus<PoolBuffer> {
        if !self.is_ready {
            return Err(PoolError::NotInitialized);
        }
        let layout =
            Layout::from_size_align(size, align).map_err(|_| PoolError::SizeNotAligned)?;
        match self.tlsf.allocate(layout) {
            Some(ptr) => Ok(PoolBuffer::new(ptr, size, align)),
            None => Err(PoolError::BadMalloc),
        }
    }

    unsafe fn dealloc(&mut self, addr: NonNull<u8>, align: usize) {
        unsafe {
            self.tlsf.deallocate(addr, align);
        }
    }
}

/// Hand the static pool to the allocator. Idempotent.
pub fn pool_init() {
    unsafe {
        GLOBAL_DMA_POOL.lock().init();
    }
}

/// Alloc `size` bytes aligned to `align` bytes.
pub fn pool_alloc_aligned(size: usize, align: usize) -> PoolStatus<PoolBuffer> {
    GLOBAL_DMA_POOL.lock().alloc_aligned(size, align)
}

/// Return `addr` to the pool. Called from [`PoolBuffer::drop`].
pub(crate) fn pool_dealloc(addr: NonNull<u8>, align: usize) {
    unsafe {
        GLOBAL_DMA_POOL.lock().dealloc(addr, align);
    }
}
