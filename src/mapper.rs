//! Catalog entity → index document mapping.
//!
//! [`map_entity`] is pure: the same entity, directory, and [`MappingContext`]
//! always produce the same [`Document`], byte for byte. The timestamp comes
//! from the context (the run's start time), never from the clock.
//!
//! The document body is plain text assembled from fixed sections, each
//! omitted when empty:
//!
//! 1. description (markdown reduced to plain text)
//! 2. details: kind, type, lifecycle, owner, system, domain
//! 3. tags
//! 4. links
//! 5. selected annotations (TechDocs, GitHub project, source location)
//! 6. relations
//! 7. API definition

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::error::{SyncError, SyncResult};
use crate::identity::{IdentityDirectory, ResolvedOwner};
use crate::models::{Document, EntityKind, EntityRef, SourceEntity, Visibility};
use crate::permissions::{self, DefaultPermissions};

/// Annotations copied into the body, with their display labels.
const SELECTED_ANNOTATIONS: [(&str, &str); 3] = [
    ("backstage.io/techdocs-ref", "Documentation"),
    ("github.com/project-slug", "GitHub Project"),
    ("backstage.io/source-location", "Source Location"),
];

/// Per-run inputs to the mapper.
#[derive(Debug, Clone)]
pub struct MappingContext {
    pub catalog_base_url: String,
    pub default_permissions: DefaultPermissions,
    pub synced_at: DateTime<Utc>,
}

impl MappingContext {
    pub fn new(
        catalog_base_url: &str,
        default_permissions: DefaultPermissions,
        synced_at: DateTime<Utc>,
    ) -> Self {
        Self {
            catalog_base_url: catalog_base_url.trim_end_matches('/').to_string(),
            default_permissions,
            synced_at,
        }
    }
}

/// Document id for an entity reference: `kind:namespace/name`.
pub fn document_id(kind: EntityKind, namespace: &str, name: &str) -> String {
    format!("{}:{}/{}", kind.slug(), namespace, name)
}

/// Catalog UI URL: `{base}/catalog/{namespace}/{kind}/{name}`.
pub fn entity_url(base: &str, kind: EntityKind, namespace: &str, name: &str) -> String {
    format!("{}/catalog/{}/{}/{}", base, namespace, kind.slug(), name)
}

/// Map one catalog entity into a document.
///
/// Fails with [`SyncError::Mapping`] only when the entity has no name. An
/// owner that cannot be resolved is not an error: the default permission
/// policy applies instead.
pub fn map_entity(
    entity: &SourceEntity,
    directory: &IdentityDirectory,
    ctx: &MappingContext,
) -> SyncResult<Document> {
    let name = entity.name.trim();
    if name.is_empty() {
        return Err(SyncError::Mapping {
            entity: format!("{}:{}/", entity.kind.slug(), entity.namespace),
            reason: "missing metadata.name".to_string(),
        });
    }

    let id = document_id(entity.kind, &entity.namespace, name);
    let title = entity
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(name)
        .to_string();

    let owner = entity
        .owner_ref
        .as_ref()
        .and_then(|r| match directory.resolve_owner(r) {
            Ok(owner) => Some(owner),
            Err(e) => {
                tracing::debug!(
                    entity = %id,
                    error = %e,
                    "owner not in directory, using default permissions"
                );
                None
            }
        });
    let (owner_email, owner_group) = match owner {
        Some(ResolvedOwner::User(user)) => (user.canonical_email.clone(), None),
        Some(ResolvedOwner::Group(group)) => (None, Some(group.source_ref.to_string())),
        None => (None, None),
    };
    let visibility = permissions::resolve(owner, ctx.default_permissions);

    let summary = entity
        .description
        .as_deref()
        .map(markdown_to_plain_text)
        .filter(|s| !s.is_empty());

    let url = entity_url(&ctx.catalog_base_url, entity.kind, &entity.namespace, name);
    let tags: BTreeSet<String> = entity
        .tags
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    let body = build_body(entity, summary.as_deref());
    let content_hash = content_hash(&id, &title, &body, &url, &tags, &visibility);

    Ok(Document {
        object_type: entity.kind.slug().to_string(),
        container_id: container_id(entity),
        properties: properties(entity, name),
        id,
        title,
        summary,
        body,
        url,
        tags,
        owner_email,
        owner_group,
        visibility,
        content_hash,
        last_updated: ctx.synced_at,
    })
}

fn build_body(entity: &SourceEntity, description: Option<&str>) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(description) = description {
        sections.push(description.to_string());
    }

    let mut details = vec![
        "Details".to_string(),
        format!("Kind: {}", entity.kind.catalog_name()),
    ];
    if let Some(spec_type) = &entity.spec_type {
        details.push(format!("Type: {}", spec_type));
    }
    if let Some(lifecycle) = &entity.lifecycle {
        details.push(format!("Lifecycle: {}", lifecycle));
    }
    if let Some(owner) = &entity.owner_label {
        details.push(format!("Owner: {}", owner));
    }
    if let Some(system) = &entity.system {
        details.push(format!("System: {}", short_ref(system)));
    }
    if let Some(domain) = &entity.domain {
        details.push(format!("Domain: {}", short_ref(domain)));
    }
    sections.push(details.join("\n"));

    if !entity.tags.is_empty() {
        sections.push(format!("Tags: {}", entity.tags.join(", ")));
    }

    if !entity.links.is_empty() {
        let mut lines = vec!["Links".to_string()];
        for link in &entity.links {
            let label = link.title.as_deref().unwrap_or("Link");
            lines.push(format!("- {}: {}", label, link.url));
        }
        sections.push(lines.join("\n"));
    }

    let annotations: Vec<String> = SELECTED_ANNOTATIONS
        .iter()
        .filter_map(|(key, label)| {
            entity
                .annotations
                .get(*key)
                .map(|value| format!("- {}: {}", label, value))
        })
        .collect();
    if !annotations.is_empty() {
        sections.push(format!("Annotations\n{}", annotations.join("\n")));
    }

    if !entity.relations.is_empty() {
        let mut lines = vec!["Relations".to_string()];
        for relation in &entity.relations {
            lines.push(format!("- {}: {}", relation.relation_type, relation.target));
        }
        sections.push(lines.join("\n"));
    }

    if let Some(definition) = entity.definition.as_deref().filter(|d| !d.trim().is_empty()) {
        sections.push(format!("Definition\n{}", definition.trim_end()));
    }

    sections.join("\n\n")
}

/// `name` for the default namespace, `namespace/name` otherwise.
fn short_ref(r: &EntityRef) -> String {
    if r.namespace == crate::models::DEFAULT_NAMESPACE {
        r.name.clone()
    } else {
        format!("{}/{}", r.namespace, r.name)
    }
}

/// Components, APIs and resources live in their system; systems in their domain.
fn container_id(entity: &SourceEntity) -> Option<String> {
    let parent = match entity.kind {
        EntityKind::Component | EntityKind::Api | EntityKind::Resource => entity.system.as_ref(),
        EntityKind::System => entity.domain.as_ref(),
        _ => None,
    }?;
    let kind = parent.kind.unwrap_or(EntityKind::System);
    Some(document_id(kind, &parent.namespace, &parent.name))
}

fn properties(entity: &SourceEntity, name: &str) -> Vec<(String, String)> {
    let mut props = vec![("namespace".to_string(), entity.namespace.clone())];
    if let Some(spec_type) = &entity.spec_type {
        props.push(("type".to_string(), spec_type.clone()));
    }
    if let Some(lifecycle) = &entity.lifecycle {
        props.push(("lifecycle".to_string(), title_case(lifecycle)));
    }
    props.push((
        "ref".to_string(),
        document_id(entity.kind, &entity.namespace, name),
    ));
    props
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// SHA-256 over the fields that describe content. `last_updated` is left out
/// so re-running on unchanged data yields the same hash.
fn content_hash(
    id: &str,
    title: &str,
    body: &str,
    url: &str,
    tags: &BTreeSet<String>,
    visibility: &Visibility,
) -> String {
    let mut hasher = Sha256::new();
    for part in [id, title, body, url] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    for tag in tags {
        hasher.update(tag.as_bytes());
        hasher.update([0u8]);
    }
    let visibility = serde_json::to_string(visibility).unwrap_or_default();
    hasher.update(visibility.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============ Markdown ============

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[^\n`]*\n?(.*?)```").unwrap());
static INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]+)`").unwrap());
static HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s+").unwrap());
static BOLD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*\*([^*]+)\*\*|__([^_]+)__").unwrap());
static ITALIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*([^*\n]+)\*|\b_([^_\n]+)_\b").unwrap());
static IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap());
static LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\]\([^)]*\)").unwrap());
static RULE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*([-*_])([ \t]*[-*_]){2,}[ \t]*$").unwrap());
static BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Reduce markdown to readable plain text.
///
/// Handles code fences, inline code, headers, bold and italic, images,
/// links (the text is kept), and horizontal rules. Anything else passes
/// through unchanged.
pub fn markdown_to_plain_text(text: &str) -> String {
    let text = text.replace("\r\n", "\n");
    let text = CODE_FENCE.replace_all(&text, "$1");
    let text = INLINE_CODE.replace_all(&text, "$1");
    let text = HEADER.replace_all(&text, "");
    // Images before links: `![alt](src)` would otherwise match as a link.
    let text = IMAGE.replace_all(&text, "");
    let text = LINK.replace_all(&text, "$1");
    let text = RULE.replace_all(&text, "");
    let text = BOLD.replace_all(&text, "$1$2");
    let text = ITALIC.replace_all(&text, "$1$2");
    let text = BLANK_RUNS.replace_all(&text, "\n\n");
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, EntityRef};
    use chrono::TimeZone;
    use serde_json::json;

    fn ctx(policy: DefaultPermissions) -> MappingContext {
        MappingContext::new(
            "https://backstage.example.com/",
            policy,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        )
    }

    fn component(value: serde_json::Value) -> SourceEntity {
        SourceEntity::from_json(EntityKind::Component, value).unwrap()
    }

    fn checkout() -> SourceEntity {
        component(json!({
            "kind": "Component",
            "metadata": {
                "name": "checkout",
                "title": "Checkout Service",
                "description": "Handles **payments**.\n\nSee [docs](https://docs).",
                "tags": ["payments", "java"],
                "annotations": {
                    "github.com/project-slug": "acme/checkout",
                    "backstage.io/managed-by-location": "url:https://x"
                },
                "links": [{"url": "https://grafana/checkout", "title": "Dashboard"}]
            },
            "spec": {
                "type": "service",
                "lifecycle": "production",
                "owner": "group:team-payments",
                "system": "commerce"
            },
            "relations": [{"type": "providesApi", "targetRef": "api:default/checkout-api"}]
        }))
    }

    fn directory() -> IdentityDirectory {
        let users = vec![SourceEntity::from_json(
            EntityKind::User,
            json!({
                "kind": "User",
                "metadata": {"name": "alice"},
                "spec": {"profile": {"email": "alice@x.com"}, "memberOf": ["team-payments"]}
            }),
        )
        .unwrap()];
        let groups = vec![SourceEntity::from_json(
            EntityKind::Group,
            json!({"kind": "Group", "metadata": {"name": "team-payments"}}),
        )
        .unwrap()];
        IdentityDirectory::from_entities(&users, &groups).0
    }

    #[test]
    fn maps_core_fields() {
        let doc =
            map_entity(&checkout(), &directory(), &ctx(DefaultPermissions::AllUsers)).unwrap();
        assert_eq!(doc.id, "component:default/checkout");
        assert_eq!(doc.title, "Checkout Service");
        assert_eq!(
            doc.url,
            "https://backstage.example.com/catalog/default/component/checkout"
        );
        assert_eq!(doc.object_type, "component");
        assert_eq!(doc.summary.as_deref(), Some("Handles payments.\n\nSee docs."));
        assert_eq!(doc.owner_group.as_deref(), Some("group:default/team-payments"));
        assert_eq!(doc.owner_email, None);
        assert_eq!(doc.visibility, Visibility::Restricted(vec!["alice@x.com".into()]));
        assert_eq!(doc.container_id.as_deref(), Some("system:default/commerce"));
        assert_eq!(
            doc.properties,
            vec![
                ("namespace".to_string(), "default".to_string()),
                ("type".to_string(), "service".to_string()),
                ("lifecycle".to_string(), "Production".to_string()),
                ("ref".to_string(), "component:default/checkout".to_string()),
            ]
        );
        assert!(doc.tags.contains("java"));
    }

    #[test]
    fn body_sections_in_order() {
        let doc =
            map_entity(&checkout(), &directory(), &ctx(DefaultPermissions::AllUsers)).unwrap();
        let body = &doc.body;
        let positions: Vec<usize> = [
            "Handles payments.",
            "Details\nKind: Component",
            "Tags: payments, java",
            "Links\n- Dashboard: https://grafana/checkout",
            "Annotations\n- GitHub Project: acme/checkout",
            "Relations\n- providesApi: api:default/checkout-api",
        ]
        .iter()
        .map(|needle| body.find(needle).unwrap_or_else(|| panic!("missing {needle:?} in {body}")))
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(body.contains("Owner: group:team-payments"));
        assert!(body.contains("System: commerce"));
        assert!(!body.contains("managed-by-location"));
    }

    #[test]
    fn mapping_is_idempotent() {
        let entity = checkout();
        let dir = directory();
        let c = ctx(DefaultPermissions::DatasourceUsers);
        let a = map_entity(&entity, &dir, &c).unwrap();
        let b = map_entity(&entity, &dir, &c).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn hash_ignores_timestamp() {
        let entity = checkout();
        let dir = directory();
        let a = map_entity(&entity, &dir, &ctx(DefaultPermissions::AllUsers)).unwrap();
        let mut later = ctx(DefaultPermissions::AllUsers);
        later.synced_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let b = map_entity(&entity, &dir, &later).unwrap();
        assert_ne!(a.last_updated, b.last_updated);
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.content_hash.len(), 64);
    }

    #[test]
    fn missing_name_is_a_mapping_error() {
        let entity = component(json!({"kind": "Component", "metadata": {}}));
        let err =
            map_entity(&entity, &directory(), &ctx(DefaultPermissions::AllUsers)).unwrap_err();
        assert!(matches!(err, SyncError::Mapping { .. }));
    }

    #[test]
    fn unresolved_owner_uses_policy() {
        let entity = component(json!({
            "kind": "Component",
            "metadata": {"name": "orphan"},
            "spec": {"owner": "user:default/ghost"}
        }));
        let dir = directory();
        let doc = map_entity(&entity, &dir, &ctx(DefaultPermissions::DatasourceUsers)).unwrap();
        assert_eq!(doc.visibility, Visibility::DatasourceUsers);
        let doc = map_entity(&entity, &dir, &ctx(DefaultPermissions::Owner)).unwrap();
        assert_eq!(doc.visibility, Visibility::None);
        assert_eq!(doc.owner_email, None);
    }

    #[test]
    fn user_owner_sets_owner_email() {
        let entity = component(json!({
            "kind": "Component",
            "metadata": {"name": "tool"},
            "spec": {"owner": "user:alice"}
        }));
        let doc = map_entity(&entity, &directory(), &ctx(DefaultPermissions::None)).unwrap();
        assert_eq!(doc.owner_email.as_deref(), Some("alice@x.com"));
        assert_eq!(doc.visibility, Visibility::Restricted(vec!["alice@x.com".into()]));
    }

    #[test]
    fn title_falls_back_to_name() {
        let entity = component(json!({"kind": "Component", "metadata": {"name": "bare"}}));
        let doc = map_entity(&entity, &directory(), &ctx(DefaultPermissions::AllUsers)).unwrap();
        assert_eq!(doc.title, "bare");
        assert_eq!(doc.summary, None);
        assert_eq!(doc.body, "Details\nKind: Component");
    }

    #[test]
    fn system_lives_in_domain() {
        let entity = SourceEntity::from_json(
            EntityKind::System,
            json!({
                "kind": "System",
                "metadata": {"name": "commerce"},
                "spec": {"domain": "retail"}
            }),
        )
        .unwrap();
        let doc = map_entity(&entity, &directory(), &ctx(DefaultPermissions::AllUsers)).unwrap();
        assert_eq!(doc.container_id.as_deref(), Some("domain:default/retail"));
        let r = EntityRef::parse("domain:default/retail").unwrap();
        assert_eq!(short_ref(&r), "retail");
    }

    #[test]
    fn api_definition_is_last() {
        let entity = SourceEntity::from_json(
            EntityKind::Api,
            json!({
                "kind": "API",
                "metadata": {"name": "petstore"},
                "spec": {"type": "openapi", "definition": "openapi: 3.0.0\n"}
            }),
        )
        .unwrap();
        let doc = map_entity(&entity, &directory(), &ctx(DefaultPermissions::AllUsers)).unwrap();
        assert!(doc.body.ends_with("Definition\nopenapi: 3.0.0"));
    }

    #[test]
    fn markdown_is_flattened() {
        let md = "# Title\n\nSome `code` and *emphasis* and __strong__.\n\n---\n\n![logo](x.png)\n```rust\nfn main() {}\n```\n\n\n\nEnd [here](https://x).";
        let text = markdown_to_plain_text(md);
        assert_eq!(
            text,
            "Title\n\nSome code and emphasis and strong.\n\nfn main() {}\n\nEnd here."
        );
    }

    #[test]
    fn snake_case_words_survive() {
        assert_eq!(markdown_to_plain_text("use my_var_name"), "use my_var_name");
    }
}
