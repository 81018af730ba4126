//! Markdown document codec for entities
//!
//! One entity is one markdown document: YAML frontmatter between `---`
//! delimiters, a `# Title` heading, free-form content, a `## Relationships`
//! section with one `###` group per relationship type, and an auto-maintained
//! `## Back-references` section.
//!
//! The codec round-trips: unknown frontmatter keys are preserved via the
//! entity's `extra` map, and unknown `##` body sections stay in `content`
//! verbatim. Relationship dates are kept at month precision on disk.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::entity::{BackReference, Entity, EntityType, Relationship};
use crate::graph::links::WIKI_LINK;

/// Marker emitted at the top of the back-references section
const BACKREF_MARKER: &str = "<!-- Auto-maintained by silvia -->";

static FRONTMATTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\A---\r?\n(.*?)\r?\n---\r?\n?(.*)\z").unwrap());

/// Frontmatter header, field order fixed by this struct
#[derive(Debug, Serialize, Deserialize)]
struct Frontmatter {
    id: String,
    #[serde(rename = "type")]
    entity_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    aliases: Vec<String>,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    sources: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    tags: Vec<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

/// Parse a markdown document into an entity.
///
/// Fails only when the frontmatter delimiters are absent or the header does
/// not parse; body oddities are tolerated.
pub fn parse_entity(text: &str) -> Result<Entity> {
    let captures = FRONTMATTER.captures(text).ok_or_else(|| format_error(
        "missing frontmatter delimiters",
    ))?;
    let header = &captures[1];
    let body = &captures[2];

    let frontmatter: Frontmatter = serde_yaml::from_str(header)
        .map_err(|e| format_error(&format!("invalid frontmatter: {e}")))?;
    let entity_type = EntityType::parse(&frontmatter.entity_type)
        .ok_or_else(|| format_error(&format!("unknown entity type: {}", frontmatter.entity_type)))?;

    let mut entity = Entity {
        id: frontmatter.id,
        entity_type,
        title: String::new(),
        aliases: frontmatter.aliases,
        tags: frontmatter.tags,
        sources: frontmatter.sources,
        created: frontmatter.created,
        updated: frontmatter.updated,
        content: String::new(),
        relationships: Vec::new(),
        backrefs: Vec::new(),
        extra: frontmatter.extra,
    };

    // Walk the body once: pull out the title, the relationships and
    // back-references sections, and keep everything else as content.
    let mut content_lines: Vec<&str> = Vec::new();
    let mut rel_lines: Vec<&str> = Vec::new();
    let mut backref_lines: Vec<&str> = Vec::new();

    #[derive(PartialEq)]
    enum Section {
        Content,
        Relationships,
        Backrefs,
    }
    let mut section = Section::Content;
    let mut seen_body_text = false;

    for line in body.lines() {
        // Only the leading `# ` heading is the title; later h1 lines belong
        // to the content.
        if let Some(title) = line.strip_prefix("# ") {
            if entity.title.is_empty() && !seen_body_text && section == Section::Content {
                entity.title = title.trim().to_string();
                continue;
            }
        }
        if line.starts_with("## Relationships") {
            section = Section::Relationships;
            continue;
        }
        if line.starts_with("## Back-references") || line.starts_with("## Referenced by") {
            section = Section::Backrefs;
            continue;
        }
        if line.starts_with("## ") {
            // Unknown section: back to content, heading preserved verbatim.
            section = Section::Content;
        }
        match section {
            Section::Content => {
                if !line.trim().is_empty() {
                    seen_body_text = true;
                }
                content_lines.push(line);
            }
            Section::Relationships => rel_lines.push(line),
            Section::Backrefs => backref_lines.push(line),
        }
    }

    entity.content = content_lines.join("\n").trim().to_string();
    entity.relationships = parse_relationships(&rel_lines);
    entity.backrefs = parse_backrefs(&backref_lines);

    if entity.title.is_empty() {
        entity.title = crate::graph::entity::title_from_id(&entity.id);
    }

    Ok(entity)
}

/// Format an entity as a markdown document
pub fn format_entity(entity: &Entity) -> String {
    let frontmatter = Frontmatter {
        id: entity.id.clone(),
        entity_type: entity.entity_type.as_str().to_string(),
        aliases: entity.aliases.clone(),
        created: entity.created,
        updated: entity.updated,
        sources: entity.sources.clone(),
        tags: entity.tags.clone(),
        extra: entity.extra.clone(),
    };
    // Serialization of a plain key/value struct cannot fail.
    let header = serde_yaml::to_string(&frontmatter).unwrap_or_default();

    let mut out = String::new();
    out.push_str("---\n");
    out.push_str(&header);
    out.push_str("---\n\n");

    out.push_str(&format!("# {}\n\n", entity.title));

    if !entity.content.is_empty() {
        out.push_str(&entity.content);
        out.push_str("\n\n");
    }

    if !entity.relationships.is_empty() {
        out.push_str("## Relationships\n\n");
        for (rel_type, rels) in group_relationships(&entity.relationships) {
            out.push_str(&format!("### {}\n", display_rel_type(rel_type)));
            for rel in rels {
                out.push_str(&format!("- [[{}]]", rel.target));
                if let Some(note) = &rel.note {
                    out.push_str(&format!(" - {note}"));
                }
                if let Some(date) = &rel.date {
                    out.push_str(&format!(" ({})", date.format("%B %Y")));
                }
                out.push('\n');
            }
            out.push('\n');
        }
    }

    // Always emitted, even when empty, so hand-editors see the marker.
    out.push_str("## Back-references\n");
    out.push_str(BACKREF_MARKER);
    out.push('\n');
    for backref in &entity.backrefs {
        out.push_str(&format!("- [[{}]]", backref.source));
        if !backref.rel_type.is_empty() {
            out.push_str(&format!(" ({})", backref.rel_type));
        }
        if let Some(note) = &backref.note {
            out.push_str(&format!(" - {note}"));
        }
        out.push('\n');
    }

    out
}

/// Group relationships by type, preserving first-seen type order and the
/// relative order of rows within a type.
fn group_relationships(relationships: &[Relationship]) -> Vec<(&str, Vec<&Relationship>)> {
    let mut groups: Vec<(&str, Vec<&Relationship>)> = Vec::new();
    for rel in relationships {
        match groups.iter_mut().find(|(t, _)| *t == rel.rel_type) {
            Some((_, rows)) => rows.push(rel),
            None => groups.push((&rel.rel_type, vec![rel])),
        }
    }
    groups
}

/// `spoke_at` -> `Spoke At`
fn display_rel_type(rel_type: &str) -> String {
    rel_type
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// `Spoke At` -> `spoke_at`
pub(crate) fn normalize_rel_type(heading: &str) -> String {
    heading
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

fn parse_relationships(lines: &[&str]) -> Vec<Relationship> {
    let mut relationships = Vec::new();
    let mut current_type = String::new();

    for line in lines {
        let line = line.trim();
        if let Some(heading) = line.strip_prefix("### ") {
            current_type = normalize_rel_type(heading);
        } else if line.starts_with("- [[") {
            let Some(captures) = WIKI_LINK.captures(line) else {
                continue;
            };
            let target = captures[1].to_string();
            let mut rest = after_link(line, &captures);

            // A trailing "(Month Year)" group is the relationship date;
            // other parenthesized text stays in the note.
            let mut date = None;
            if let Some(open) = rest.rfind('(') {
                if rest.ends_with(')') {
                    let candidate = &rest[open + 1..rest.len() - 1];
                    if let Some(parsed) = parse_month_year(candidate) {
                        date = Some(parsed);
                        rest = rest[..open].trim().to_string();
                    }
                }
            }

            let note = normalize_note(&rest);
            relationships.push(Relationship {
                rel_type: current_type.clone(),
                target,
                date,
                note,
            });
        }
    }

    relationships
}

fn parse_backrefs(lines: &[&str]) -> Vec<BackReference> {
    let mut backrefs = Vec::new();

    for line in lines {
        let line = line.trim();
        if !line.starts_with("- [[") {
            continue;
        }
        let Some(captures) = WIKI_LINK.captures(line) else {
            continue;
        };
        let source = captures[1].to_string();
        let mut rest = after_link(line, &captures);

        let mut rel_type = String::new();
        if let Some(open) = rest.find('(') {
            if let Some(close) = rest[open..].find(')') {
                rel_type = rest[open + 1..open + close].to_string();
                rest = format!("{}{}", &rest[..open], &rest[open + close + 1..]);
            }
        }

        backrefs.push(BackReference {
            source,
            rel_type,
            note: normalize_note(&rest),
        });
    }

    backrefs
}

/// The text of a row after its `[[...]]` token
fn after_link(line: &str, captures: &regex::Captures<'_>) -> String {
    match captures.get(0) {
        Some(m) => line[m.end()..].trim().to_string(),
        None => String::new(),
    }
}

/// Strip list/leader dashes around a note; empty notes become `None`
fn normalize_note(rest: &str) -> Option<String> {
    let note = rest.trim().trim_start_matches('-').trim();
    if note.is_empty() {
        None
    } else {
        Some(note.to_string())
    }
}

/// Parse a "January 2006" style date to the first of that month (UTC)
fn parse_month_year(s: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(&format!("1 {}", s.trim()), "%d %B %Y").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

fn format_error(message: &str) -> Error {
    Error::Format {
        path: String::new(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_entity() -> Entity {
        let mut entity = Entity::new("people/jane-doe", EntityType::Person);
        entity.title = "Jane Doe".to_string();
        entity.content =
            "Founder of [[organizations/acme]].\n\nSee also [[concepts/governance]].".to_string();
        entity.aliases = vec!["Jane".to_string(), "J. Doe".to_string()];
        entity.tags = vec!["founder".to_string()];
        entity.sources = vec![
            "https://example.com/jane".to_string(),
            "sources/web/example-profile".to_string(),
        ];
        entity.created = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        entity.updated = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        entity.relationships = vec![
            Relationship {
                rel_type: "founded".to_string(),
                target: "organizations/acme".to_string(),
                date: Some(Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap()),
                note: Some("sole founder".to_string()),
            },
            Relationship {
                rel_type: "spoke_at".to_string(),
                target: "events/conf-2023".to_string(),
                date: None,
                note: None,
            },
        ];
        entity.backrefs = vec![BackReference {
            source: "organizations/acme".to_string(),
            rel_type: "founded_by".to_string(),
            note: Some("per charter".to_string()),
        }];
        entity
    }

    #[test]
    fn test_round_trip() {
        let entity = sample_entity();
        let text = format_entity(&entity);
        let parsed = parse_entity(&text).unwrap();
        assert_eq!(parsed, entity);
    }

    #[test]
    fn test_missing_frontmatter_is_a_format_error() {
        let err = parse_entity("# Just a title\n\nNo header here.").unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }

    #[test]
    fn test_bad_yaml_is_a_format_error() {
        let err = parse_entity("---\nid: [unclosed\n---\n\n# T\n").unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }

    #[test]
    fn test_unknown_header_keys_round_trip() {
        let text = "---\nid: people/jane\ntype: person\ncreated: 2024-01-01T00:00:00Z\nupdated: 2024-01-01T00:00:00Z\nreview_status: pending\n---\n\n# Jane\n\nBody.\n";
        let entity = parse_entity(text).unwrap();
        assert_eq!(
            entity.extra.get("review_status"),
            Some(&serde_yaml::Value::String("pending".to_string()))
        );
        let reparsed = parse_entity(&format_entity(&entity)).unwrap();
        assert_eq!(reparsed.extra, entity.extra);
    }

    #[test]
    fn test_h1_inside_content_survives_round_trip() {
        let mut entity = Entity::new("works/essay", EntityType::Work);
        entity.content = "Intro.\n\n# Part One\n\nBody of part one.".to_string();

        let parsed = parse_entity(&format_entity(&entity)).unwrap();
        assert_eq!(parsed.title, entity.title);
        assert_eq!(parsed.content, entity.content);
    }

    #[test]
    fn test_unknown_body_sections_stay_in_content() {
        let text = "---\nid: people/jane\ntype: person\ncreated: 2024-01-01T00:00:00Z\nupdated: 2024-01-01T00:00:00Z\n---\n\n# Jane\n\nIntro.\n\n## Timeline\n\n- 2020: something happened\n";
        let entity = parse_entity(text).unwrap();
        assert!(entity.content.contains("## Timeline"));
        assert!(entity.content.contains("2020: something happened"));
    }

    #[test]
    fn test_plural_type_tolerated_on_read() {
        let text = "---\nid: people/jane\ntype: people\ncreated: 2024-01-01T00:00:00Z\nupdated: 2024-01-01T00:00:00Z\n---\n\n# Jane\n";
        let entity = parse_entity(text).unwrap();
        assert_eq!(entity.entity_type, EntityType::Person);
        // Singular on write
        assert!(format_entity(&entity).contains("type: person"));
    }

    #[test]
    fn test_relationship_headings_case_fold() {
        let text = "---\nid: people/jane\ntype: person\ncreated: 2024-01-01T00:00:00Z\nupdated: 2024-01-01T00:00:00Z\n---\n\n# Jane\n\n## Relationships\n\n### Spoke At\n- [[events/conf]] - keynote (June 2023)\n";
        let entity = parse_entity(text).unwrap();
        assert_eq!(entity.relationships.len(), 1);
        let rel = &entity.relationships[0];
        assert_eq!(rel.rel_type, "spoke_at");
        assert_eq!(rel.target, "events/conf");
        assert_eq!(rel.note.as_deref(), Some("keynote"));
        assert_eq!(
            rel.date,
            Some(Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_note_with_parens_is_not_a_date() {
        let text = "---\nid: people/jane\ntype: person\ncreated: 2024-01-01T00:00:00Z\nupdated: 2024-01-01T00:00:00Z\n---\n\n# Jane\n\n## Relationships\n\n### Founded\n- [[organizations/acme]] - with partners (seed stage)\n";
        let entity = parse_entity(text).unwrap();
        let rel = &entity.relationships[0];
        assert_eq!(rel.date, None);
        assert_eq!(rel.note.as_deref(), Some("with partners (seed stage)"));
    }

    #[test]
    fn test_backref_rows_parse_type_and_note() {
        let text = "---\nid: organizations/acme\ntype: organization\ncreated: 2024-01-01T00:00:00Z\nupdated: 2024-01-01T00:00:00Z\n---\n\n# Acme\n\n## Back-references\n<!-- Auto-maintained by silvia -->\n- [[people/jane]] (founded) - sole founder\n- [[people/bob]]\n";
        let entity = parse_entity(text).unwrap();
        assert_eq!(entity.backrefs.len(), 2);
        assert_eq!(entity.backrefs[0].source, "people/jane");
        assert_eq!(entity.backrefs[0].rel_type, "founded");
        assert_eq!(entity.backrefs[0].note.as_deref(), Some("sole founder"));
        assert_eq!(entity.backrefs[1].rel_type, "");
        assert_eq!(entity.backrefs[1].note, None);
    }

    #[test]
    fn test_empty_backref_section_always_emitted() {
        let entity = Entity::new("people/jane", EntityType::Person);
        let text = format_entity(&entity);
        assert!(text.contains("## Back-references"));
        assert!(text.contains(BACKREF_MARKER));
    }
}
