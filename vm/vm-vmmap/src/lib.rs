//! Address-space layout and fault resolution.
//!
//! Sits on top of the table walker and splits one address space into
//! independently locked pieces:
//!
//! | Module     | Contents                                                     |
//! | ---------- | ------------------------------------------------------------ |
//! | [`object`] | Backing-object trait faults are delegated to                 |
//! | [`shard`]  | One contiguous slice: entry bookkeeping and fault resolution |
//! | [`vmmap`]  | The whole space: one pmap, N shards, resharding, forking     |
//!
//! Table walks and shard bookkeeping are synchronous; the only suspension
//! point anywhere is the backing object resolving a fault. No shard lock is
//! ever held across that await, and the mapping is re-validated once the
//! object comes back.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod object;
pub mod shard;
pub mod vmmap;

pub use vm_pmap::{
    Attr, FrameAlloc, Level, MemArch, PageCount, PageNo, PagingArch, PhysAccess, PhysAddr, Pmap,
    PmapError, SpaceContext, Table, VirtAddr, VirtPageNo, X64, X86Pae,
};

pub use crate::object::{AnonObject, FaultToken, ForkMode, VmObject};
pub use crate::shard::{Resolved, VmShard};
pub use crate::vmmap::Vmmap;

/// Errors surfaced while resolving a fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    /// No mapping covers the faulting address. Also the verdict when the
    /// mapping disappeared while the backing object was working; the caller
    /// redelivers if the access is retried.
    #[error("no mapping at the faulting address")]
    NoMapping,

    /// The access contradicts the mapping's permissions.
    #[error("access not permitted by the mapping")]
    Forbidden,

    /// The frame allocator could not supply a data page.
    #[error("out of physical frames")]
    OutOfMemory,

    #[error(transparent)]
    Pmap(#[from] PmapError),
}
