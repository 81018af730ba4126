//! Knowledge graph engine
//!
//! Entities are markdown documents on disk; [`EntityStore`] reads and writes
//! them, [`GraphOps`] mutates and queries the graph while keeping it
//! referentially consistent.

mod entity;
mod links;
mod markdown;
mod ops;
mod store;

pub use entity::{
    generate_entity_id, split_id, title_from_id, BackReference, Entity, EntityType, OutgoingLink,
    Relationship,
};
pub use links::{extract_wiki_links, rewrite_wiki_links};
pub use markdown::{format_entity, parse_entity};
pub use ops::{GraphOps, RelatedEntities, UpdatePatch};
pub use store::EntityStore;
