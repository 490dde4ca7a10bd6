use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::filters::{ContactFilter, DealFilter, PipelineFilter, QueryFilter, TagFilter};
use crate::models::*;

/// Binds an entity to its REST collection and payload types.
pub trait Resource: Serialize + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync + 'static {
    /// Collection path, e.g. `/deals`.
    const PATH: &'static str;
    /// Singular name used in messages.
    const NAME: &'static str;

    type Create: Serialize + std::fmt::Debug + Send + Sync;
    type Update: Serialize + std::fmt::Debug + Send + Sync;
    type Filter: QueryFilter;

    fn id(&self) -> i64;
}

impl Resource for Pipeline {
    const PATH: &'static str = "/pipelines";
    const NAME: &'static str = "pipeline";
    type Create = NewPipeline;
    type Update = PipelineUpdate;
    type Filter = PipelineFilter;

    fn id(&self) -> i64 {
        self.id
    }
}

impl Resource for Deal {
    const PATH: &'static str = "/deals";
    const NAME: &'static str = "deal";
    type Create = NewDeal;
    type Update = DealUpdate;
    type Filter = DealFilter;

    fn id(&self) -> i64 {
        self.id
    }
}

impl Resource for Contact {
    const PATH: &'static str = "/contacts";
    const NAME: &'static str = "contact";
    type Create = NewContact;
    type Update = ContactUpdate;
    type Filter = ContactFilter;

    fn id(&self) -> i64 {
        self.id
    }
}

impl Resource for Tag {
    const PATH: &'static str = "/tags";
    const NAME: &'static str = "tag";
    type Create = NewTag;
    type Update = TagUpdate;
    type Filter = TagFilter;

    fn id(&self) -> i64 {
        self.id
    }
}
