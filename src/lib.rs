//! rom-block-cache: serve random-access reads out of a large read-only image
//! that lives on a slow optical backing store.
//!
//! Fixed-size blocks of the image are staged on demand through two tiers:
//!   primary (main memory, directly addressable) → secondary (auxiliary
//!   memory behind a DMA channel) → backing store

pub mod cache;
pub mod config;
pub mod host;
pub mod image;
pub mod memory;
pub mod metrics;
pub mod transfer;
