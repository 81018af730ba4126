//! Entity document store
//!
//! Entities live one-per-file under `<data_dir>/graph/<type-plural>/<slug>.md`.
//! The store keeps an in-memory cache validated against file modification
//! times, so documents edited by hand (or by another process) are re-read on
//! the next access without any explicit invalidation step.
//!
//! Saving an entity also propagates its relationships to the referenced
//! entities as back-references (one hop, no recursion). Stale back-references
//! left behind by deletions or hand edits are repaired by
//! [`crate::graph::GraphOps::rebuild_all_backrefs`].

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::graph::entity::{split_id, Entity, EntityType};
use crate::graph::markdown::{format_entity, parse_entity};

struct CacheEntry {
    entity: Entity,
    mtime: SystemTime,
}

/// Filesystem-backed entity store with an mtime-validated cache
pub struct EntityStore {
    data_dir: PathBuf,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl EntityStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Root of the on-disk data directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Create the expected directory layout if missing
    pub fn init_directories(&self) -> Result<()> {
        for entity_type in EntityType::all() {
            fs::create_dir_all(self.data_dir.join("graph").join(entity_type.plural()))?;
        }
        for sub in ["web", "bsky", "pdfs"] {
            fs::create_dir_all(self.data_dir.join("sources").join(sub))?;
        }
        fs::create_dir_all(self.data_dir.join("config"))?;
        fs::create_dir_all(self.data_dir.join(".silvia"))?;
        Ok(())
    }

    /// Path of the document backing an entity id
    pub fn entity_path(&self, id: &str) -> Result<PathBuf> {
        let (type_segment, slug) = split_id(id)?;
        let entity_type = EntityType::parse(type_segment)
            .ok_or_else(|| Error::InvalidType(type_segment.to_string()))?;
        if slug.contains("..") || slug.contains('/') {
            return Err(Error::Validation(format!("invalid entity slug: {slug}")));
        }
        Ok(self
            .data_dir
            .join("graph")
            .join(entity_type.plural())
            .join(format!("{slug}.md")))
    }

    /// Whether an entity document exists on disk
    pub fn exists(&self, id: &str) -> bool {
        self.entity_path(id).map(|p| p.exists()).unwrap_or(false)
    }

    /// Load an entity, serving from cache when the file is unchanged
    pub fn load(&self, id: &str) -> Result<Entity> {
        let path = self.entity_path(id)?;
        let mtime = match fs::metadata(&path) {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::EntityNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = cache.get(id) {
                if entry.mtime == mtime {
                    return Ok(entry.entity.clone());
                }
            }
        }

        let entity = self.load_from_disk(&path)?;
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            id.to_string(),
            CacheEntry {
                entity: entity.clone(),
                mtime,
            },
        );
        Ok(entity)
    }

    fn load_from_disk(&self, path: &Path) -> Result<Entity> {
        let text = fs::read_to_string(path)?;
        parse_entity(&text).map_err(|e| match e {
            Error::Format { message, .. } => Error::Format {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    /// Save an entity and propagate its relationships as back-references.
    ///
    /// Propagation is one hop: each relationship target that exists gets a
    /// back-reference row naming this entity, written only when it actually
    /// changed. Targets that do not exist yet are skipped; the back-reference
    /// appears when the pending entity is created and the graph rebuilt.
    /// A target that fails to load or write is logged and skipped so the
    /// remaining targets still get their rows; the primary document is
    /// already saved either way.
    pub fn save(&self, entity: &Entity) -> Result<()> {
        self.save_raw(entity)?;

        for rel in &entity.relationships {
            if rel.target == entity.id {
                continue;
            }
            let mut target = match self.load(&rel.target) {
                Ok(target) => target,
                Err(Error::EntityNotFound(_)) => {
                    debug!(target_id = %rel.target, "relationship target missing, backref deferred");
                    continue;
                }
                Err(e) => {
                    warn!(target_id = %rel.target, error = %e, "backref propagation skipped unreadable target");
                    continue;
                }
            };
            if target.add_backref(&entity.id, &rel.rel_type, rel.note.as_deref()) {
                if let Err(e) = self.save_raw(&target) {
                    warn!(target_id = %rel.target, error = %e, "backref propagation failed to write target");
                }
            }
        }
        Ok(())
    }

    /// Save without back-reference propagation.
    ///
    /// Validates, writes atomically (temp file then rename), and refreshes
    /// the cache. Used directly by rebuild and rename walks that manage
    /// back-references themselves.
    pub fn save_raw(&self, entity: &Entity) -> Result<()> {
        entity.validate()?;
        let path = self.entity_path(&entity.id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let text = format_entity(entity);
        let tmp = path.with_extension("md.tmp");
        fs::write(&tmp, &text)?;
        fs::rename(&tmp, &path)?;

        let mtime = fs::metadata(&path)?.modified()?;
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            entity.id.clone(),
            CacheEntry {
                entity: entity.clone(),
                mtime,
            },
        );
        Ok(())
    }

    /// Delete the document backing an entity.
    ///
    /// Referential safety (refusing to delete referenced entities) is
    /// enforced by the operations layer, not here.
    pub fn delete_file(&self, id: &str) -> Result<()> {
        let path = self.entity_path(id)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::EntityNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.remove(id);
        Ok(())
    }

    /// All entity ids on disk, grouped by type directory
    pub fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entity_type in EntityType::all() {
            let dir = self.data_dir.join("graph").join(entity_type.plural());
            if !dir.exists() {
                continue;
            }
            let mut slugs = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Some(slug) = name.strip_suffix(".md") {
                    slugs.push(slug.to_string());
                }
            }
            slugs.sort();
            for slug in slugs {
                ids.push(format!("{}/{}", entity_type.plural(), slug));
            }
        }
        Ok(ids)
    }

    /// Load every entity in the graph, skipping unparseable documents
    pub fn list_all(&self) -> Result<Vec<Entity>> {
        let mut entities = Vec::new();
        for id in self.list_ids()? {
            match self.load(&id) {
                Ok(entity) => entities.push(entity),
                Err(e) => warn!(entity_id = %id, error = %e, "skipping unparseable entity document"),
            }
        }
        Ok(entities)
    }

    /// Load all entities of one type
    pub fn list_by_type(&self, entity_type: EntityType) -> Result<Vec<Entity>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|e| e.entity_type == entity_type)
            .collect())
    }

    /// Case-insensitive substring search across id, title, aliases, tags,
    /// and content
    pub fn search(&self, query: &str) -> Result<Vec<Entity>> {
        let needle = query.to_lowercase();
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|e| {
                e.id.to_lowercase().contains(&needle)
                    || e.title.to_lowercase().contains(&needle)
                    || e.aliases.iter().any(|a| a.to_lowercase().contains(&needle))
                    || e.tags.iter().any(|t| t.to_lowercase().contains(&needle))
                    || e.content.to_lowercase().contains(&needle)
            })
            .collect())
    }

    /// Drop all cached entries; next accesses re-read from disk
    pub fn clear_cache(&self) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
