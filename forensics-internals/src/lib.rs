#![no_std]
#![forbid(
    missing_docs,
    clippy::alloc_instead_of_core,
    clippy::std_instead_of_alloc,
    clippy::std_instead_of_core,
    clippy::missing_safety_doc,
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    rustdoc::invalid_rust_codeblocks,
    rustdoc::broken_intra_doc_links,
    unused_doc_comments
)]
#![allow(rustdoc::private_intra_doc_links)]
//! Internal storage crate for [`forensics`].
//!
//! # Overview
//!
//! This crate contains the fixed-capacity data structures that hold the
//! diagnostics state of a [`forensics`] runtime. Every structure allocates all
//! of its memory once, when it is created, through a pluggable
//! [`StorageAllocator`], and never allocates again. Filling one up degrades
//! (by rejecting or evicting) instead of growing.
//!
//! **This crate is an implementation detail.** No semantic versioning
//! guarantees are provided. Users should depend on the [`forensics`] crate,
//! not this one.
//!
//! # Structures
//!
//! - **[`FixedBuf`]**: An owned, never-growing buffer of `Copy` elements, the
//!   building block for everything else
//! - **[`AttributeArena`]**: Unique key/value pairs packed into one compacting
//!   byte buffer, in insertion order
//! - **[`BreadcrumbRing`]**: A ring of variable-sized event records with
//!   repeat coalescing and oldest-first eviction
//!
//! # Safety Strategy
//!
//! Stored strings are copied byte for byte out of `&str` values and read back
//! without re-validating UTF-8. Each structure keeps its offsets and lengths
//! module-private, so the ranges handed to the unchecked conversion can only
//! come from the code that wrote them.
//!
//! [`forensics`]: https://docs.rs/forensics/latest/forensics/

extern crate alloc;

mod allocator;
pub mod arena;
mod fixed;
pub mod ring;
mod util;

pub use self::{
    allocator::{AllocError, SharedAllocator, StorageAllocator, SystemAllocator, shared_allocator},
    arena::{AttributeArena, AttributeError},
    fixed::FixedBuf,
    ring::{BreadcrumbOutcome, BreadcrumbRef, BreadcrumbRing, BreadcrumbSlot},
};
