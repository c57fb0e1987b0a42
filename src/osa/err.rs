#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// `pool_init` has not run yet.
    NotInitialized,
    BadMalloc,
    // PoolBuffer related errors
    NotEnoughSpace, // buffer too small to copy contents from a slice
    SizeNotAligned, // requested layout is not representable
}

pub type PoolStatus<T = ()> = Result<T, PoolError>;
