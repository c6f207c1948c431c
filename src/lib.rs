//! Local on-disk cache layer over remote filesystems.
//!
//! Materializes remote objects (HDFS, S3, Tachyon, local) into a
//! size-bounded local working area so scan operators read at local-disk
//! speed. The pieces, bottom up:
//!
//! - [`exec`]: deadline-enforcing executor; a hung remote node cannot park a
//!   query thread forever.
//! - [`bridge`]: retrying wrapper around every remote primitive, backed by
//!   the [`meta`] metadata cache.
//! - [`pool`]: per-descriptor connection pools with scoped leases.
//! - [`namespace`]: pure mapping from remote origins to local cache paths.
//! - [`cache`]: the managed file state machine, the weighted-LRU engine, and
//!   the single-flight download loader.
//! - [`registry`]: the facade owning all of the above.
//! - [`mediator`]: the POSIX-flavored handle API scan operators consume.

pub mod bridge;
pub mod cache;
pub mod config;
pub mod error;
pub mod exec;
pub mod fs;
pub mod mediator;
pub mod meta;
pub mod namespace;
pub mod pool;
pub mod registry;

pub use cache::{CreationNature, FileState, ManagedFile};
pub use config::CacheConfig;
pub use error::CacheError;
pub use fs::{FilesystemDescriptor, FsType, OpenFlags};
pub use mediator::{DfsFile, FileSystemMediator};
pub use registry::CacheRegistry;
