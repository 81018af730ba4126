//! End-to-end scenarios over a real on-disk graph

use std::fs;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use silvia_core::error::{Error, Result};
use silvia_core::graph::{
    parse_entity, EntityStore, EntityType, GraphOps, UpdatePatch,
};
use silvia_core::llm::LanguageModel;
use silvia_core::queue::{Priority, SourceQueue};
use silvia_core::sources::SourceTracker;

fn graph() -> (TempDir, GraphOps) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(EntityStore::new(dir.path()));
    store.init_directories().unwrap();
    (dir, GraphOps::new(store))
}

/// Echoes the keeper's links plus a fixed merged body
struct MergeStub;

#[async_trait]
impl LanguageModel for MergeStub {
    async fn complete(&self, _prompt: &str, _cancel: &CancellationToken) -> Result<String> {
        Ok(String::new())
    }

    async fn complete_with_system(
        &self,
        _system: &str,
        user: &str,
        _cancel: &CancellationToken,
    ) -> Result<String> {
        // Preserve every wiki-link that appears in the prompt, as the real
        // model is instructed to.
        let links = silvia_core::graph::extract_wiki_links(user);
        let mut body = String::from("Combined description.");
        for link in links {
            body.push_str(&format!("\nMentions [[{link}]]."));
        }
        Ok(body)
    }
}

#[test]
fn curation_lifecycle_keeps_graph_consistent() {
    let (_dir, ops) = graph();

    // Build a small graph around a person.
    ops.create(EntityType::Person, "people/ada-lovelace", Some("Ada Lovelace"), None)
        .unwrap();
    ops.create(EntityType::Work, "works/analytical-notes", None, Some("Annotated by [[people/ada-lovelace]]."))
        .unwrap();
    ops.create(EntityType::Concept, "concepts/computing", None, None).unwrap();
    ops.link("people/ada-lovelace", "wrote", "works/analytical-notes", Some("1843"))
        .unwrap();
    ops.link("people/ada-lovelace", "contributed_to", "concepts/computing", None)
        .unwrap();

    // Back-references landed on both targets.
    let notes = ops.get("works/analytical-notes").unwrap();
    assert!(notes.backrefs.iter().any(|b| b.source == "people/ada-lovelace" && b.rel_type == "wrote"));
    let computing = ops.get("concepts/computing").unwrap();
    assert_eq!(computing.backrefs.len(), 1);

    // Related view sees both directions.
    let related = ops.related("people/ada-lovelace").unwrap();
    assert!(related.outgoing.contains_key("wrote"));
    assert!(related.incoming.contains_key("referenced_by"));
    let all: Vec<&str> = related.all.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(all, vec!["concepts/computing", "works/analytical-notes"]);

    // The person cannot be deleted while referenced; the work can go after
    // its references are cleared.
    assert!(matches!(
        ops.delete("people/ada-lovelace"),
        Err(Error::Referenced(_, _))
    ));
}

#[test]
fn rename_moves_the_document_and_every_reference() {
    let (dir, ops) = graph();

    ops.create(EntityType::Concept, "concepts/ai", Some("AI"), None).unwrap();
    ops.create(EntityType::Person, "people/researcher", None, Some("Studies [[concepts/ai|artificial intelligence]]."))
        .unwrap();
    ops.link("people/researcher", "studies", "concepts/ai", None)
        .unwrap();

    ops.rename("concepts/ai", "concepts/artificial-intelligence")
        .unwrap();

    // Old document gone, new one present on disk.
    assert!(!dir.path().join("graph/concepts/ai.md").exists());
    assert!(dir
        .path()
        .join("graph/concepts/artificial-intelligence.md")
        .exists());

    let researcher = ops.get("people/researcher").unwrap();
    assert!(researcher
        .content
        .contains("[[concepts/artificial-intelligence|artificial intelligence]]"));
    assert_eq!(
        researcher.relationships[0].target,
        "concepts/artificial-intelligence"
    );

    // Search still finds the entity under its old name.
    let hits = ops.search("concepts/ai").unwrap();
    assert!(hits.iter().any(|e| e.id == "concepts/artificial-intelligence"));
}

#[tokio::test]
async fn merge_preserves_links_and_absorbs_metadata() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(EntityStore::new(dir.path()));
    store.init_directories().unwrap();
    let ops = GraphOps::with_llm(store, Arc::new(MergeStub));

    ops.create(EntityType::Person, "people/grace-hopper", None, Some("Invented [[concepts/compilers]]."))
        .unwrap();
    ops.create(EntityType::Person, "people/g-hopper", None, Some("Served in [[organizations/us-navy]]."))
        .unwrap();
    ops.create(EntityType::Concept, "concepts/compilers", None, None).unwrap();
    ops.create(EntityType::Organization, "organizations/us-navy", None, None).unwrap();
    ops.create(EntityType::Event, "events/conference", None, Some("Keynote by [[people/g-hopper]]."))
        .unwrap();

    let cancel = CancellationToken::new();
    let merged = ops
        .merge("people/grace-hopper", "people/g-hopper", &cancel)
        .await
        .unwrap();

    // Links from both bodies survive the merge.
    let links = merged.wiki_links();
    assert!(links.contains(&"concepts/compilers".to_string()));
    assert!(links.contains(&"organizations/us-navy".to_string()));

    // The absorbed id survives as an alias, and its referrers now point at
    // the keeper.
    assert!(merged.aliases.contains(&"people/g-hopper".to_string()));
    assert!(!ops.store().exists("people/g-hopper"));
    let conference = ops.get("events/conference").unwrap();
    assert!(conference.content.contains("[[people/grace-hopper]]"));
}

#[tokio::test]
async fn cancelled_merge_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(EntityStore::new(dir.path()));
    store.init_directories().unwrap();
    let ops = GraphOps::with_llm(store, Arc::new(CancelledStub));

    ops.create(EntityType::Person, "people/a", None, Some("First.")).unwrap();
    ops.create(EntityType::Person, "people/b", None, Some("Second.")).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = ops.merge("people/a", "people/b", &cancel).await;
    assert!(matches!(result, Err(Error::Cancelled)));

    // Both entities untouched.
    assert!(ops.store().exists("people/a"));
    assert!(ops.store().exists("people/b"));
    assert_eq!(ops.get("people/a").unwrap().content, "First.");
}

struct CancelledStub;

#[async_trait]
impl LanguageModel for CancelledStub {
    async fn complete(&self, _prompt: &str, cancel: &CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(String::new())
    }

    async fn complete_with_system(
        &self,
        _system: &str,
        _user: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(String::new())
    }
}

fn graph_files(root: &std::path::Path) -> std::collections::BTreeMap<String, String> {
    let mut files = std::collections::BTreeMap::new();
    for type_dir in fs::read_dir(root.join("graph")).unwrap() {
        let type_dir = type_dir.unwrap().path();
        if !type_dir.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&type_dir).unwrap() {
            let path = entry.unwrap().path();
            if path.extension().is_some_and(|ext| ext == "md") {
                files.insert(path.display().to_string(), fs::read_to_string(&path).unwrap());
            }
        }
    }
    files
}

#[tokio::test]
async fn repeating_rename_and_merge_changes_nothing() {
    let (dir, ops) = graph();

    ops.create(EntityType::Person, "people/a", None, Some("Alpha knows [[people/b]]."))
        .unwrap();
    ops.create(EntityType::Person, "people/b", None, Some("Beta.")).unwrap();
    ops.create(EntityType::Concept, "concepts/t", None, Some("About [[people/a]]."))
        .unwrap();

    ops.rename("people/a", "people/alice").unwrap();
    let after_rename = graph_files(dir.path());
    assert!(ops.rename("people/a", "people/alice").is_err());
    assert_eq!(graph_files(dir.path()), after_rename);

    let cancel = CancellationToken::new();
    ops.merge("people/alice", "people/b", &cancel).await.unwrap();
    let after_merge = graph_files(dir.path());
    assert!(ops.merge("people/alice", "people/b", &cancel).await.is_err());
    assert_eq!(graph_files(dir.path()), after_merge);

    // Rebuild is a no-op on an already-consistent graph.
    assert_eq!(ops.rebuild_all_backrefs().unwrap(), 0);
    assert_eq!(graph_files(dir.path()), after_merge);
}

#[test]
fn hand_edits_are_picked_up_and_repaired() {
    let (dir, ops) = graph();

    ops.create(EntityType::Person, "people/editor", None, None).unwrap();
    ops.create(EntityType::Concept, "concepts/topic", None, None).unwrap();
    ops.link("people/editor", "curates", "concepts/topic", None)
        .unwrap();

    // Edit the document by hand: change the relationship target section.
    let path = dir.path().join("graph/people/editor.md");
    let text = fs::read_to_string(&path).unwrap();
    let edited = text.replace("[[concepts/topic]]", "[[concepts/renamed-topic]]");
    fs::write(&path, edited).unwrap();
    // Bypass the mtime granularity window.
    let past = std::time::SystemTime::now() - std::time::Duration::from_secs(60);
    fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(past)
        .unwrap();

    // The store notices the change without being told.
    let editor = ops.get("people/editor").unwrap();
    assert_eq!(editor.relationships[0].target, "concepts/renamed-topic");

    // Rebuild clears the now-stale back-reference on the old target.
    ops.create(EntityType::Concept, "concepts/renamed-topic", None, None).unwrap();
    ops.rebuild_all_backrefs().unwrap();
    let old_target = ops.get("concepts/topic").unwrap();
    assert!(old_target.backrefs.is_empty());
    let new_target = ops.get("concepts/renamed-topic").unwrap();
    assert_eq!(new_target.backrefs.len(), 1);
}

#[test]
fn documents_on_disk_are_valid_and_reparseable() {
    let (dir, ops) = graph();

    ops.create(EntityType::Concept, "concepts/memory", None, None)
        .unwrap();
    let mut entity = ops
        .create(
            EntityType::Work,
            "works/long-essay",
            Some("A Long Essay"),
            Some("About [[concepts/memory]]."),
        )
        .unwrap();
    entity.add_tag("essay");
    entity.add_source("https://example.com/essay");
    ops.store().save(&entity).unwrap();
    ops.link("works/long-essay", "cites", "concepts/memory", None)
        .unwrap();

    let text = fs::read_to_string(dir.path().join("graph/works/long-essay.md")).unwrap();
    assert!(text.starts_with("---\n"));
    assert!(text.contains("# A Long Essay"));
    assert!(text.contains("## Relationships"));
    assert!(text.contains("### Cites"));

    let parsed = parse_entity(&text).unwrap();
    assert_eq!(parsed.id, "works/long-essay");
    assert_eq!(parsed.entity_type, EntityType::Work);
    assert_eq!(parsed.tags, vec!["essay"]);
    assert_eq!(parsed.relationships.len(), 1);
}

#[test]
fn update_then_reload_round_trips_through_disk() {
    let (dir, ops) = graph();
    ops.create(EntityType::Concept, "concepts/persistence", None, None).unwrap();
    ops.update(
        "concepts/persistence",
        UpdatePatch {
            content: Some("Multi-line\n\ncontent with [[people/someone]].".to_string()),
            aliases: Some(vec!["durability".to_string()]),
            ..Default::default()
        },
    )
    .unwrap();

    // A second store over the same directory sees the same entity.
    let fresh = EntityStore::new(dir.path());
    let entity = fresh.load("concepts/persistence").unwrap();
    assert_eq!(entity.aliases, vec!["durability"]);
    assert!(entity.content.contains("[[people/someone]]"));
}

#[test]
fn queue_and_tracker_share_the_data_directory() {
    let (dir, _ops) = graph();

    let queue = SourceQueue::open(dir.path()).unwrap();
    queue
        .add("https://example.com/article", Priority::High, None, None)
        .unwrap();

    let tracker = SourceTracker::open(dir.path()).unwrap();
    assert!(!tracker.is_processed("https://example.com/article"));

    // Typical ingest step: pop, process, record, never re-process.
    let next = queue.pop().unwrap().unwrap();
    tracker
        .mark_processed(&next.url, "An Article", Some("sources/web/an-article".into()))
        .unwrap();
    assert!(tracker.is_processed("https://example.com/article"));
    assert!(queue.is_empty());

    // State files live under .silvia/.
    assert!(dir.path().join(".silvia/queue.json").exists());
    assert!(dir.path().join(".silvia/processed_sources.json").exists());
}
