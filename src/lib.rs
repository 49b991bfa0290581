pub mod header;
pub mod block;
pub mod strings;
pub mod crypto;
pub mod allocator;
pub mod io_stream;
pub mod container;

pub use header::{Header, Layout, CLUSTER_SIZE};
pub use block::BlockData;
pub use strings::{StringData, MAX_NAME_LEN};
pub use allocator::{BlockAllocator, IntegrityIssue};
pub use io_stream::Stream;
pub use container::{AccessMode, Container, ContainerError, ContainerStats, CreateOptions, FileInfo};
