#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]

//! Frame-graph-facing core of a real-time PBR renderer.
//!
//! This crate owns the three pieces that stay on the hot path every frame:
//! per-primitive command generation and sort/instancing (`render_pass`), the
//! per-frame uniform-buffer pool (`buffer_allocator` + `ubo_manager`), and
//! the resource lifecycle substrate (`resource_list`, `transform`,
//! `renderable`, `material_cache`). Everything else — shader compilation,
//! window-system integration, a concrete GPU backend — is an external
//! collaborator, reached only through the [`driver::Driver`] trait.

pub mod backend;
pub mod buffer_allocator;
pub mod driver;
pub mod engine;
pub mod entity;
pub mod error;
pub mod jobs;
pub mod key;
pub mod material;
pub mod material_cache;
pub mod render_pass;
pub mod renderable;
pub mod resource_list;
pub mod scene;
pub mod transform;
pub mod ubo_manager;

pub use driver::Driver;
pub use engine::Engine;
pub use entity::Entity;
pub use error::{ForgeError, Result};
pub use resource_list::{Handle, ResourceList};
