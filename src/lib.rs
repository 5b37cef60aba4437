//! Convolution-function cache for A/W-projection gridding.
//!
//! A memory tier ([`store::CfStore`]) and a disk tier ([`disk::DiskCatalog`])
//! are composed by [`cache::CfCache`]. A background CF server and the
//! gridding loop exchange one device-ready CF set per spectral window through
//! [`coordinator::ThreadCoordinator`].

pub mod aperture;
pub mod artifact;
pub mod aux_index;
pub mod buffer;
pub mod cache;
pub mod cell;
pub mod coordinator;
pub mod device;
pub mod disk;
pub mod error;
pub mod pipeline;
pub mod store;
pub mod utils;

pub use cache::{CacheConfig, CfCache, CfHandles, FreshCf, FreshPlane, LocateStatus, Located, Tiers};
pub use coordinator::{CfPublication, SpwHooks, ThreadCoordinator};
pub use error::{CfCacheError, CfResult};
