//! Per-entity state containers.
//!
//! A hook owns the locally cached page of one collection (pipelines,
//! contacts, ...) together with its loading flag, last error and
//! filter/pagination window, and exposes the mutations a view needs.
//!
//! # Synchronization rules
//!
//! - The backend is authoritative; the cached page is replaced wholesale by
//!   every applied fetch.
//! - A failed fetch keeps the previous page and records the message.
//! - Each fetch takes a generation number. Only the response to the most
//!   recently issued fetch is applied; older responses are dropped.
//! - Deletes are optimistic. The removed entity is put back at its old index
//!   when the request fails, unless a fetch was applied in the meantime.
//! - After [`Collection::close`] no response touches the state.
//!
//! # Usage
//!
//! ```ignore
//! use crm::hooks::Collection;
//!
//! let contacts = Collection::<Contact>::new(api, ListQuery::default());
//! contacts.fetch().await?;
//! contacts.apply_filters(FilterPatch::filter(ContactFilter {
//!     search: Some("ada".into()),
//!     ..Default::default()
//! })).await?;
//! ```

mod collection;

pub use collection::{Collection, CollectionState};

use crm_common::{Contact, Pipeline};

pub type PipelinesHook = Collection<Pipeline>;
pub type ContactsHook = Collection<Contact>;
