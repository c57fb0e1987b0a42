/// Pool capacity. Sized to hold one full DMA chunk (255 blocks of 512 bytes)
/// plus allocator overhead.
pub const MAX_POOL_SIZE: usize = 0x28000;
