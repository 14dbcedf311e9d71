//! Data transfer below the cache.
//!
//! - [`disk_io`]: the backing store holding the image, read asynchronously
//! - [`aux_dma`]: the secondary tier's memory and its transfer channel

pub mod aux_dma;
pub mod disk_io;
