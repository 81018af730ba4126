//! Entity types for the knowledge graph
//!
//! Entities are the nodes of the graph, persisted one per markdown document.
//! Each entity carries explicit typed relationships (authored, outgoing) and
//! back-references (derived, incoming), plus free-form content that may embed
//! `[[wiki-links]]` to other entities.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::links::extract_wiki_links;

/// Types of entities in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A person (e.g., "people/jane-doe")
    Person,
    /// An organization, company, or group
    Organization,
    /// An abstract concept or topic
    Concept,
    /// A creative or published work (book, paper, album)
    Work,
    /// An event (conference, election, release)
    Event,
}

impl EntityType {
    /// Singular form used in frontmatter
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Organization => "organization",
            Self::Concept => "concept",
            Self::Work => "work",
            Self::Event => "event",
        }
    }

    /// Plural form used in entity ids and storage paths
    pub fn plural(&self) -> &'static str {
        match self {
            Self::Person => "people",
            Self::Organization => "organizations",
            Self::Concept => "concepts",
            Self::Work => "works",
            Self::Event => "events",
        }
    }

    /// Parse from string, accepting both singular and plural forms
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "person" | "people" => Some(Self::Person),
            "organization" | "organizations" | "org" => Some(Self::Organization),
            "concept" | "concepts" => Some(Self::Concept),
            "work" | "works" => Some(Self::Work),
            "event" | "events" => Some(Self::Event),
            _ => None,
        }
    }

    /// All entity types
    pub fn all() -> &'static [EntityType] {
        &[
            Self::Person,
            Self::Organization,
            Self::Concept,
            Self::Work,
            Self::Event,
        ]
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An explicit, typed outgoing edge from one entity to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Relationship type, lowercase with underscores (e.g., "founded", "spoke_at")
    #[serde(rename = "type")]
    pub rel_type: String,
    /// ID of the target entity; need not currently exist
    pub target: String,
    /// Optional date the relationship refers to
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub date: Option<DateTime<Utc>>,
    /// Optional free-form note
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub note: Option<String>,
}

/// An incoming edge stored on the target entity; derived from relationships
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackReference {
    /// ID of the referring entity
    pub source: String,
    /// Type of the originating relationship
    #[serde(rename = "type")]
    pub rel_type: String,
    /// Optional note carried over from the relationship
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub note: Option<String>,
}

/// A node in the knowledge graph, persisted as one markdown document
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    /// Logical id of the form `<type-plural>/<slug>` (e.g., "people/jane-doe")
    pub id: String,
    /// Entity type; consistent with the id's type segment
    pub entity_type: EntityType,
    /// Human-readable name
    pub title: String,
    /// Alternative names, case-insensitive deduped
    pub aliases: Vec<String>,
    /// Free-form tags
    pub tags: Vec<String>,
    /// Source references: URLs or entity ids of archived captures
    pub sources: Vec<String>,
    /// Creation timestamp; immutable
    pub created: DateTime<Utc>,
    /// Last-mutation timestamp
    pub updated: DateTime<Utc>,
    /// Free-form body text; may embed `[[wiki-links]]`
    pub content: String,
    /// Authored outgoing edges
    pub relationships: Vec<Relationship>,
    /// Derived incoming edges; never authored directly
    pub backrefs: Vec<BackReference>,
    /// Unknown frontmatter keys, preserved on round-trip
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Entity {
    /// Create a new entity with the given id and type.
    ///
    /// The title is derived from the id's slug; override it afterwards if a
    /// better name is known.
    pub fn new(id: impl Into<String>, entity_type: EntityType) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            title: title_from_id(&id),
            id,
            entity_type,
            aliases: Vec::new(),
            tags: Vec::new(),
            sources: Vec::new(),
            created: now,
            updated: now,
            content: String::new(),
            relationships: Vec::new(),
            backrefs: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Add an outgoing relationship
    pub fn add_relationship(
        &mut self,
        rel_type: impl Into<String>,
        target: impl Into<String>,
        date: Option<DateTime<Utc>>,
        note: Option<String>,
    ) {
        self.relationships.push(Relationship {
            rel_type: rel_type.into(),
            target: target.into(),
            date,
            note,
        });
        self.updated = Utc::now();
    }

    /// Add or update a back-reference from another entity.
    ///
    /// If a back-reference from the same source already exists, its type and
    /// note are updated in place. Returns whether anything changed.
    pub fn add_backref(
        &mut self,
        source: &str,
        rel_type: &str,
        note: Option<&str>,
    ) -> bool {
        if let Some(existing) = self.backrefs.iter_mut().find(|b| b.source == source) {
            if existing.rel_type == rel_type && existing.note.as_deref() == note {
                return false;
            }
            existing.rel_type = rel_type.to_string();
            existing.note = note.map(str::to_string);
            self.updated = Utc::now();
            return true;
        }
        self.backrefs.push(BackReference {
            source: source.to_string(),
            rel_type: rel_type.to_string(),
            note: note.map(str::to_string),
        });
        self.updated = Utc::now();
        true
    }

    /// Add an alias unless an equal one (case-insensitive) is already present
    pub fn add_alias(&mut self, alias: impl Into<String>) {
        let alias = alias.into();
        if !self.aliases.iter().any(|a| a.eq_ignore_ascii_case(&alias)) {
            self.aliases.push(alias);
            self.updated = Utc::now();
        }
    }

    /// Add a source reference unless already present
    pub fn add_source(&mut self, source: impl Into<String>) {
        let source = source.into();
        if !self.sources.contains(&source) {
            self.sources.push(source);
            self.updated = Utc::now();
        }
    }

    /// Add a tag unless already present
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
            self.updated = Utc::now();
        }
    }

    /// Wiki-link targets embedded in the content, first-occurrence order
    pub fn wiki_links(&self) -> Vec<String> {
        extract_wiki_links(&self.content)
    }

    /// All outgoing references: relationships by their own type, content
    /// wiki-links as `mentioned_in`, entity-id sources as `sourced_from`.
    ///
    /// Used by the related-entities view. Back-reference propagation uses
    /// only `relationships`.
    pub fn outgoing_links(&self) -> Vec<OutgoingLink> {
        let mut links = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for rel in &self.relationships {
            if seen.insert(format!("rel:{}:{}", rel.rel_type, rel.target)) {
                links.push(OutgoingLink {
                    target: rel.target.clone(),
                    link_type: rel.rel_type.clone(),
                    note: rel.note.clone(),
                });
            }
        }

        for target in self.wiki_links() {
            if seen.insert(format!("wiki:{target}")) {
                links.push(OutgoingLink {
                    target,
                    link_type: "mentioned_in".to_string(),
                    note: None,
                });
            }
        }

        for source in &self.sources {
            // Entity-id sources only; URLs are not graph references.
            if source.contains('/') && !source.contains("://")
                && seen.insert(format!("source:{source}"))
            {
                links.push(OutgoingLink {
                    target: source.clone(),
                    link_type: "sourced_from".to_string(),
                    note: None,
                });
            }
        }

        links
    }

    /// Check required fields and id shape
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::Validation("entity id is required".to_string()));
        }
        if self.title.is_empty() {
            return Err(Error::Validation("entity title is required".to_string()));
        }
        let (type_segment, slug) = split_id(&self.id)?;
        let id_type = EntityType::parse(type_segment).ok_or_else(|| {
            Error::Validation(format!("unknown type segment in id: {type_segment}"))
        })?;
        if id_type != self.entity_type {
            return Err(Error::Validation(format!(
                "id type segment '{}' does not match entity type '{}'",
                type_segment, self.entity_type
            )));
        }
        if slug.is_empty()
            || !slug
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(Error::Validation(format!(
                "entity slug must be lowercase kebab-case, got '{slug}'"
            )));
        }
        Ok(())
    }
}

/// Any outgoing reference from an entity (relationship, wiki-link, or source)
#[derive(Debug, Clone)]
pub struct OutgoingLink {
    /// Entity id the link points at
    pub target: String,
    /// Relationship type, or `mentioned_in` / `sourced_from` for weak links
    pub link_type: String,
    /// Optional note (relationships only)
    pub note: Option<String>,
}

/// Split an entity id into its type segment and slug
pub fn split_id(id: &str) -> Result<(&str, &str)> {
    id.split_once('/').ok_or_else(|| {
        Error::Validation(format!(
            "invalid entity id '{id}': must be '<type>/<slug>' (e.g., 'people/jane-doe')"
        ))
    })
}

/// Derive a human-readable title from an entity id's slug
pub fn title_from_id(id: &str) -> String {
    let slug = id.rsplit('/').next().unwrap_or(id);
    let slug = slug.strip_suffix(".md").unwrap_or(slug);
    slug.split('-')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Generate a standardized entity id from a display name and type
pub fn generate_entity_id(name: &str, entity_type: EntityType) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().to_lowercase().chars() {
        match c {
            ' ' | '_' | '/' | '\\' => slug.push('-'),
            c if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' => slug.push(c),
            _ => {}
        }
    }
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let slug = slug.trim_matches('-');
    format!("{}/{}", entity_type.plural(), slug)
}
