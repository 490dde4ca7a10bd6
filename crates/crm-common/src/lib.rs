//! Shared domain types for the CRM.
//!
//! Both the HTTP client and the reference backend speak the wire format
//! defined here, so this crate carries no I/O of its own.

pub mod filters;
pub mod models;
pub mod page;
pub mod resource;

pub use filters::{
    ContactFilter, DealFilter, FilterPatch, ListQuery, PipelineFilter, QueryFilter, TagFilter,
};
pub use models::*;
pub use page::Page;
pub use resource::Resource;
