//! Graph operations
//!
//! The mutation and query surface over the entity store. Every mutation keeps
//! the graph referentially consistent: saves propagate back-references,
//! renames and merges rewrite every referrer, deletes refuse while referrers
//! remain, and [`GraphOps::rebuild_all_backrefs`] repairs whatever hand edits
//! broke.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::graph::entity::{
    generate_entity_id, split_id, Entity, EntityType,
};
use crate::graph::links::rewrite_wiki_links;
use crate::graph::markdown::normalize_rel_type;
use crate::graph::store::EntityStore;
use crate::llm::LanguageModel;

/// Partial update applied to an entity; `None` fields are left alone,
/// `Some` fields replace the existing value wholesale
#[derive(Debug, Default, Clone)]
pub struct UpdatePatch {
    pub content: Option<String>,
    pub aliases: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub sources: Option<Vec<String>>,
}

/// Everything connected to one entity, resolved and grouped for display
#[derive(Debug)]
pub struct RelatedEntities {
    pub entity: Entity,
    /// Outgoing references grouped by relationship type, resolved to the
    /// target entities; weak links appear under `mentioned_in` and
    /// `sourced_from`
    pub outgoing: BTreeMap<String, Vec<Entity>>,
    /// Incoming references grouped by the referrer's relationship type,
    /// resolved to the referrer entities; untyped mentions appear under
    /// `referenced_by`
    pub incoming: BTreeMap<String, Vec<Entity>>,
    /// Outgoing references whose target has no readable document
    pub broken_links: Vec<String>,
    /// Every connected entity, deduplicated, ordered by type then id
    pub all: Vec<Entity>,
}

/// High-level graph operations over an [`EntityStore`]
pub struct GraphOps {
    store: Arc<EntityStore>,
    llm: Option<Arc<dyn LanguageModel>>,
}

impl GraphOps {
    pub fn new(store: Arc<EntityStore>) -> Self {
        Self { store, llm: None }
    }

    pub fn with_llm(store: Arc<EntityStore>, llm: Arc<dyn LanguageModel>) -> Self {
        Self {
            store,
            llm: Some(llm),
        }
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Create a new entity.
    ///
    /// Fails if the entity already exists or the id's type segment does not
    /// agree with the given type.
    pub fn create(
        &self,
        entity_type: EntityType,
        id: &str,
        title: Option<&str>,
        content: Option<&str>,
    ) -> Result<Entity> {
        if self.store.exists(id) {
            return Err(Error::EntityExists(id.to_string()));
        }
        let (type_segment, _) = split_id(id)?;
        let segment_type = EntityType::parse(type_segment)
            .ok_or_else(|| Error::InvalidType(type_segment.to_string()))?;
        if segment_type != entity_type {
            return Err(Error::Validation(format!(
                "id '{id}' does not belong to type '{entity_type}'"
            )));
        }

        let mut entity = Entity::new(id, entity_type);
        if let Some(title) = title {
            entity.title = title.to_string();
        }
        if let Some(content) = content {
            entity.content = content.to_string();
        }
        self.store.save(&entity)?;
        info!(entity_id = %entity.id, "created entity");
        Ok(entity)
    }

    /// Load an entity by id
    pub fn get(&self, id: &str) -> Result<Entity> {
        self.store.load(id)
    }

    /// Apply a partial update; `Some` fields replace, `None` fields keep
    pub fn update(&self, id: &str, patch: UpdatePatch) -> Result<Entity> {
        let mut entity = self.store.load(id)?;
        if let Some(content) = patch.content {
            entity.content = content;
        }
        if let Some(aliases) = patch.aliases {
            entity.aliases = aliases;
        }
        if let Some(tags) = patch.tags {
            entity.tags = tags;
        }
        if let Some(sources) = patch.sources {
            entity.sources = sources;
        }
        entity.updated = Utc::now();
        self.store.save(&entity)?;
        Ok(entity)
    }

    /// Union new source references into an entity
    pub fn add_sources(&self, id: &str, sources: &[String]) -> Result<Entity> {
        let mut entity = self.store.load(id)?;
        for source in sources {
            entity.add_source(source.clone());
        }
        self.store.save(&entity)?;
        Ok(entity)
    }

    /// Add a typed relationship from one entity to another.
    ///
    /// Both entities must exist. The relationship row is appended as given;
    /// callers that want at-most-one edge per (type, target) dedupe
    /// themselves.
    pub fn link(
        &self,
        from: &str,
        rel_type: &str,
        to: &str,
        note: Option<&str>,
    ) -> Result<Entity> {
        let rel_type = normalize_rel_type(rel_type);
        if rel_type.is_empty() {
            return Err(Error::Validation("relationship type is required".to_string()));
        }
        if !self.store.exists(to) {
            return Err(Error::EntityNotFound(to.to_string()));
        }

        let mut entity = self.store.load(from)?;
        entity.add_relationship(rel_type, to, None, note.map(str::to_string));
        self.store.save(&entity)?;
        Ok(entity)
    }

    /// Delete an entity, refusing while other entities still reference it
    pub fn delete(&self, id: &str) -> Result<()> {
        if !self.store.exists(id) {
            return Err(Error::EntityNotFound(id.to_string()));
        }
        let referrers = self.referrers_of(id)?;
        if !referrers.is_empty() {
            return Err(Error::Referenced(id.to_string(), referrers.len()));
        }
        self.store.delete_file(id)?;
        info!(entity_id = %id, "deleted entity");
        Ok(())
    }

    /// Rename an entity, rewriting every reference to it across the graph.
    ///
    /// The new id may carry a different type segment; the entity's type
    /// follows it. The old id is kept as an alias so searches still find it.
    pub fn rename(&self, old_id: &str, new_id: &str) -> Result<Entity> {
        if old_id == new_id {
            return Err(Error::Validation("old and new id are the same".to_string()));
        }
        if self.store.exists(new_id) {
            return Err(Error::EntityExists(new_id.to_string()));
        }
        let mut entity = self.store.load(old_id)?;

        let (type_segment, _) = split_id(new_id)?;
        let entity_type = EntityType::parse(type_segment)
            .ok_or_else(|| Error::InvalidType(type_segment.to_string()))?;

        entity.id = new_id.to_string();
        entity.entity_type = entity_type;
        entity.add_alias(old_id.to_string());
        entity.content = rewrite_wiki_links(&entity.content, old_id, new_id);
        entity.updated = Utc::now();

        self.store.save_raw(&entity)?;
        self.store.delete_file(old_id)?;
        self.rewrite_referrers(old_id, new_id)?;
        self.rebuild_all_backrefs()?;

        info!(old_id, new_id, "renamed entity");
        self.store.load(new_id)
    }

    /// Merge one entity into another.
    ///
    /// Content is merged by the language model when one is configured (with
    /// plain concatenation as the fallback on transient failure); metadata is
    /// unioned; every referrer of the absorbed entity is rewritten to the
    /// keeper; the absorbed document is deleted.
    pub async fn merge(
        &self,
        keeper_id: &str,
        absorbed_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Entity> {
        if keeper_id == absorbed_id {
            return Err(Error::Validation(
                "cannot merge an entity into itself".to_string(),
            ));
        }
        let mut keeper = self.store.load(keeper_id)?;
        let absorbed = self.store.load(absorbed_id)?;

        keeper.content = self
            .merge_content(&keeper.content, &absorbed.content, cancel)
            .await?;
        // The fused body may still mention the absorbed id.
        keeper.content = rewrite_wiki_links(&keeper.content, absorbed_id, keeper_id);

        keeper.add_alias(absorbed.title.clone());
        keeper.add_alias(absorbed_id.to_string());
        for alias in &absorbed.aliases {
            keeper.add_alias(alias.clone());
        }
        for source in &absorbed.sources {
            keeper.add_source(source.clone());
        }
        for tag in &absorbed.tags {
            keeper.add_tag(tag.clone());
        }
        for rel in &absorbed.relationships {
            if rel.target == keeper.id {
                continue;
            }
            let exists = keeper
                .relationships
                .iter()
                .any(|r| r.rel_type == rel.rel_type && r.target == rel.target);
            if !exists {
                keeper.relationships.push(rel.clone());
            }
        }
        keeper.updated = Utc::now();

        self.store.save_raw(&keeper)?;
        self.store.delete_file(absorbed_id)?;
        self.rewrite_referrers(absorbed_id, keeper_id)?;
        self.rebuild_all_backrefs()?;

        info!(keeper_id, absorbed_id, "merged entities");
        self.store.load(keeper_id)
    }

    async fn merge_content(
        &self,
        first: &str,
        second: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if second.trim().is_empty() {
            return Ok(first.to_string());
        }
        if first.trim().is_empty() {
            return Ok(second.to_string());
        }
        let Some(llm) = &self.llm else {
            return Ok(format!("{first}\n\n{second}"));
        };
        match llm.merge_two(first, second, cancel).await {
            Ok(merged) => Ok(merged),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) if e.is_transient() => {
                warn!(error = %e, "LLM merge failed, concatenating content instead");
                Ok(format!("{first}\n\n{second}"))
            }
            Err(e) => Err(e),
        }
    }

    /// Rewrite an entity's content with the language model.
    ///
    /// The prompt carries the current content, the bodies of any archived
    /// source entities, the remaining source URLs, and the optional
    /// guidance. The model output replaces `content` verbatim;
    /// relationships and aliases are untouched. LLM failures surface.
    pub async fn refine(
        &self,
        id: &str,
        guidance: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Entity> {
        let llm = self
            .llm
            .as_ref()
            .ok_or_else(|| Error::Llm("no language model configured".to_string()))?;
        let mut entity = self.store.load(id)?;

        let system = "You are a knowledge base editor. Improve the clarity and organization \
                      of the entity description you are given, using the source material for \
                      accuracy. Preserve ALL wiki-links in [[entity-id]] format and ALL \
                      factual information. Do not invent facts. Output only the revised \
                      content in markdown, without frontmatter.";

        let mut user = format!("Entity: {} ({})\n\nCurrent content:\n{}\n", entity.title, entity.id, entity.content);
        for source in &entity.sources {
            if source.contains('/') && !source.contains("://") {
                // Archived capture stored as an entity; include its body.
                if let Ok(archived) = self.store.load(source) {
                    user.push_str(&format!(
                        "\nSource material from {} ({}):\n{}\n",
                        archived.title, archived.id, archived.content
                    ));
                }
            } else {
                user.push_str(&format!("\nSource URL: {source}\n"));
            }
        }
        if let Some(guidance) = guidance {
            user.push_str(&format!("\nGuidance: {guidance}\n"));
        }

        let refined = llm.complete_with_system(system, &user, cancel).await?;

        entity.content = refined.trim().to_string();
        entity.updated = Utc::now();
        self.store.save(&entity)?;
        Ok(entity)
    }

    /// Everything connected to one entity, resolved and grouped for display
    pub fn related(&self, id: &str) -> Result<RelatedEntities> {
        let entity = self.store.load(id)?;

        let mut outgoing: BTreeMap<String, Vec<Entity>> = BTreeMap::new();
        let mut broken_links = Vec::new();
        let mut connected: BTreeMap<String, Entity> = BTreeMap::new();

        for link in entity.outgoing_links() {
            // Only targets that resolve to a readable document land in
            // buckets; the rest are broken.
            match self.store.load(&link.target) {
                Ok(target) => {
                    let bucket = outgoing.entry(link.link_type).or_default();
                    if !bucket.iter().any(|e| e.id == target.id) {
                        bucket.push(target.clone());
                    }
                    connected.insert(target.id.clone(), target);
                }
                Err(_) => {
                    if !broken_links.contains(&link.target) {
                        broken_links.push(link.target);
                    }
                }
            }
        }

        // Typed incoming edges come from this entity's back-references.
        let mut incoming: BTreeMap<String, Vec<Entity>> = BTreeMap::new();
        for backref in &entity.backrefs {
            let Ok(source) = self.store.load(&backref.source) else {
                // Stale row; rebuild_all_backrefs clears it.
                continue;
            };
            let bucket_name = if backref.rel_type.is_empty() {
                "referenced_by".to_string()
            } else {
                backref.rel_type.clone()
            };
            let bucket = incoming.entry(bucket_name).or_default();
            if !bucket.iter().any(|e| e.id == source.id) {
                bucket.push(source.clone());
            }
            connected.insert(source.id.clone(), source);
        }

        // Weak references (content mentions, entity-id sources) carry no
        // back-reference row; a scan surfaces them as `referenced_by`.
        for other in self.store.list_all()? {
            if other.id == id {
                continue;
            }
            let mentions = other.outgoing_links().iter().any(|l| {
                l.target == id
                    && matches!(l.link_type.as_str(), "mentioned_in" | "sourced_from")
            });
            if !mentions {
                continue;
            }
            let bucket = incoming.entry("referenced_by".to_string()).or_default();
            if !bucket.iter().any(|e| e.id == other.id) {
                bucket.push(other.clone());
            }
            connected.insert(other.id.clone(), other);
        }

        let mut all: Vec<Entity> = connected.into_values().collect();
        all.sort_by(|a, b| {
            a.entity_type
                .plural()
                .cmp(b.entity_type.plural())
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(RelatedEntities {
            entity,
            outgoing,
            incoming,
            broken_links,
            all,
        })
    }

    /// Case-insensitive search across ids, titles, aliases, tags, and content
    pub fn search(&self, query: &str) -> Result<Vec<Entity>> {
        self.store.search(query)
    }

    /// List entities, optionally restricted to one type
    pub fn list(&self, entity_type: Option<EntityType>) -> Result<Vec<Entity>> {
        match entity_type {
            Some(t) => self.store.list_by_type(t),
            None => self.store.list_all(),
        }
    }

    /// Recompute every entity's back-references from the relationships
    /// authored across the graph.
    ///
    /// Idempotent; writes only the documents whose back-references actually
    /// changed and returns how many were written.
    pub fn rebuild_all_backrefs(&self) -> Result<usize> {
        let entities = self.store.list_all()?;

        let mut desired: BTreeMap<String, Vec<crate::graph::entity::BackReference>> =
            entities.iter().map(|e| (e.id.clone(), Vec::new())).collect();
        for entity in &entities {
            for rel in &entity.relationships {
                if rel.target == entity.id {
                    continue;
                }
                if let Some(backrefs) = desired.get_mut(&rel.target) {
                    if !backrefs.iter().any(|b| b.source == entity.id) {
                        backrefs.push(crate::graph::entity::BackReference {
                            source: entity.id.clone(),
                            rel_type: rel.rel_type.clone(),
                            note: rel.note.clone(),
                        });
                    }
                }
            }
        }

        let mut written = 0;
        for mut entity in entities {
            let Some(backrefs) = desired.remove(&entity.id) else {
                continue;
            };
            if backrefs_equal(&entity.backrefs, &backrefs) {
                continue;
            }
            entity.backrefs = backrefs;
            entity.updated = Utc::now();
            self.store.save_raw(&entity)?;
            written += 1;
        }
        if written > 0 {
            info!(written, "rebuilt back-references");
        }
        Ok(written)
    }

    /// Generate a new, unused entity id from a display name.
    ///
    /// Appends a numeric suffix when the natural slug is taken.
    pub fn unique_entity_id(&self, name: &str, entity_type: EntityType) -> String {
        let base = generate_entity_id(name, entity_type);
        if !self.store.exists(&base) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}-{n}");
            if !self.store.exists(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Ids of entities whose relationships, content links, or sources
    /// reference the given id
    fn referrers_of(&self, id: &str) -> Result<Vec<String>> {
        let mut referrers = Vec::new();
        for entity in self.store.list_all()? {
            if entity.id == id {
                continue;
            }
            if entity.outgoing_links().iter().any(|l| l.target == id) {
                referrers.push(entity.id);
            }
        }
        Ok(referrers)
    }

    /// Point every reference to `old_id` at `new_id`: content wiki-links,
    /// relationship targets, entity-id sources, and back-reference sources
    fn rewrite_referrers(&self, old_id: &str, new_id: &str) -> Result<()> {
        for mut entity in self.store.list_all()? {
            if entity.id == new_id {
                continue;
            }
            let mut changed = false;

            let rewritten = rewrite_wiki_links(&entity.content, old_id, new_id);
            if rewritten != entity.content {
                entity.content = rewritten;
                changed = true;
            }
            for rel in &mut entity.relationships {
                if rel.target == old_id {
                    rel.target = new_id.to_string();
                    changed = true;
                }
            }
            // Collapse relationships made duplicate by the retarget.
            if changed {
                let mut seen = HashSet::new();
                entity
                    .relationships
                    .retain(|r| seen.insert((r.rel_type.clone(), r.target.clone())));
            }
            for source in &mut entity.sources {
                if source == old_id {
                    *source = new_id.to_string();
                    changed = true;
                }
            }
            for backref in &mut entity.backrefs {
                if backref.source == old_id {
                    backref.source = new_id.to_string();
                    changed = true;
                }
            }

            if changed {
                entity.updated = Utc::now();
                self.store.save_raw(&entity)?;
            }
        }
        Ok(())
    }
}

/// Order-insensitive back-reference comparison
fn backrefs_equal(
    a: &[crate::graph::entity::BackReference],
    b: &[crate::graph::entity::BackReference],
) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let key = |x: &crate::graph::entity::BackReference| {
        (x.source.clone(), x.rel_type.clone(), x.note.clone())
    };
    let mut a_keys: Vec<_> = a.iter().map(key).collect();
    let mut b_keys: Vec<_> = b.iter().map(key).collect();
    a_keys.sort();
    b_keys.sort();
    a_keys == b_keys
}
