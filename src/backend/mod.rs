//! Backend implementations of [`crate::driver::Driver`].
//!
//! This crate ships no real GPU backend (GL/Vulkan/wgpu driver details are
//! out of scope per spec §1) — only [`mock::MockDriver`], which records
//! calls in-process so the command-generation core can be exercised without
//! a window or a GPU.

pub mod mock;
