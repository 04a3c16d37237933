//! Core data models used throughout catalog-sync.
//!
//! These types represent the catalog records, resolved identities, and
//! indexable documents that flow through the sync pipeline:
//!
//! ```text
//! catalog JSON ──▶ SourceEntity ──▶ Document ──▶ index
//!                        │
//!                        └──(User/Group)──▶ IdentityRecord ──▶ index
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// Namespace assumed when a catalog record or reference omits one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Kinds of catalog entity the engine understands.
///
/// The variant order is the order in which entity kinds are synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Component,
    Api,
    System,
    Domain,
    Resource,
    User,
    Group,
    Location,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Component,
        EntityKind::Api,
        EntityKind::System,
        EntityKind::Domain,
        EntityKind::Resource,
        EntityKind::User,
        EntityKind::Group,
        EntityKind::Location,
    ];

    /// The kind as the catalog spells it (`"API"`, `"Component"`, ...).
    pub fn catalog_name(&self) -> &'static str {
        match self {
            EntityKind::Component => "Component",
            EntityKind::Api => "API",
            EntityKind::System => "System",
            EntityKind::Domain => "Domain",
            EntityKind::Resource => "Resource",
            EntityKind::User => "User",
            EntityKind::Group => "Group",
            EntityKind::Location => "Location",
        }
    }

    /// Lowercase form used in document ids, URLs, and entity references.
    pub fn slug(&self) -> &'static str {
        match self {
            EntityKind::Component => "component",
            EntityKind::Api => "api",
            EntityKind::System => "system",
            EntityKind::Domain => "domain",
            EntityKind::Resource => "resource",
            EntityKind::User => "user",
            EntityKind::Group => "group",
            EntityKind::Location => "location",
        }
    }

    /// Users and groups feed the identity directory rather than the index.
    pub fn is_identity(&self) -> bool {
        matches!(self, EntityKind::User | EntityKind::Group)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.catalog_name())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let candidate = s.trim().to_ascii_lowercase();
        // Plural forms are accepted for CLI convenience (`show users`).
        let singular = candidate.strip_suffix('s').unwrap_or(&candidate);
        EntityKind::ALL
            .into_iter()
            .find(|k| k.slug() == candidate || k.slug() == singular)
            .ok_or_else(|| format!("unknown entity kind: '{}'", s))
    }
}

/// A reference to a catalog entity: `[kind:][namespace/]name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntityRef {
    pub kind: Option<EntityKind>,
    pub namespace: String,
    pub name: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, namespace: &str, name: &str) -> Self {
        Self {
            kind: Some(kind),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Parse a catalog reference string.
    ///
    /// Accepts `name`, `namespace/name`, `kind:name`, and `kind:namespace/name`.
    /// Returns `None` for empty names or kind prefixes the engine does not know.
    pub fn parse(reference: &str) -> Option<Self> {
        let reference = reference.trim();
        let (kind, rest) = match reference.split_once(':') {
            Some((kind, rest)) => (Some(kind.parse::<EntityKind>().ok()?), rest),
            None => (None, reference),
        };
        let (namespace, name) = match rest.split_once('/') {
            Some((ns, name)) => (ns, name),
            None => (DEFAULT_NAMESPACE, rest),
        };
        if name.is_empty() {
            return None;
        }
        let namespace = if namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            namespace
        };
        Some(Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    /// Parse a reference, filling in `kind` when the string omits it.
    pub fn parse_with_default(reference: &str, kind: EntityKind) -> Option<Self> {
        Self::parse(reference).map(|mut r| {
            r.kind.get_or_insert(kind);
            r
        })
    }

    /// The reference with an explicit kind, for map lookups.
    pub fn with_kind(&self, kind: EntityKind) -> Self {
        Self {
            kind: Some(kind),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "{}:{}/{}", kind.slug(), self.namespace, self.name),
            None => write!(f, "{}/{}", self.namespace, self.name),
        }
    }
}

/// A typed edge from one entity to another (`memberOf`, `partOf`, `providesApi`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relation {
    pub relation_type: String,
    pub target: EntityRef,
}

/// An external link attached to an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Profile block carried by User and Group entities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

/// A record fetched from the catalog.
///
/// Immutable once parsed and owned by the page that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEntity {
    pub kind: EntityKind,
    pub name: String,
    pub namespace: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub annotations: BTreeMap<String, String>,
    pub links: Vec<Link>,
    pub owner_ref: Option<EntityRef>,
    /// Raw owner string as written in the catalog, kept for display.
    pub owner_label: Option<String>,
    pub relations: Vec<Relation>,
    pub spec_type: Option<String>,
    pub lifecycle: Option<String>,
    pub system: Option<EntityRef>,
    pub domain: Option<EntityRef>,
    pub definition: Option<String>,
    pub profile: Profile,
    pub member_of: Vec<EntityRef>,
    pub members: Vec<EntityRef>,
    pub children: Vec<EntityRef>,
    pub parent: Option<EntityRef>,
}

impl SourceEntity {
    /// Reference to this entity (`kind:namespace/name`).
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind, &self.namespace, &self.name)
    }

    /// Parse one catalog item.
    ///
    /// Any shape error becomes [`SyncError::SourceMalformed`] so the caller
    /// can skip this record and keep the rest of the page. A missing `name`
    /// is not a parse failure: it is reported later by the mapper.
    pub fn from_json(expected: EntityKind, value: serde_json::Value) -> Result<Self, SyncError> {
        let malformed = |reason: String| SyncError::SourceMalformed {
            kind: expected,
            reason,
        };

        let raw: RawEntity = serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;
        let kind: EntityKind = raw.kind.parse().map_err(malformed)?;
        if kind != expected {
            return Err(malformed(format!(
                "expected kind {} but record is {}",
                expected, kind
            )));
        }

        let namespace = raw
            .metadata
            .namespace
            .filter(|ns| !ns.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        let spec = raw.spec;
        let refs = |values: &[String], default: EntityKind| -> Vec<EntityRef> {
            values
                .iter()
                .filter_map(|v| EntityRef::parse_with_default(v, default))
                .collect()
        };

        let relations = raw
            .relations
            .into_iter()
            .filter_map(|r| {
                EntityRef::parse(&r.target_ref).map(|target| Relation {
                    relation_type: r.relation_type,
                    target,
                })
            })
            .collect();

        let definition = spec.definition.and_then(|d| match d {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s),
            other => serde_json::to_string_pretty(&other).ok(),
        });

        Ok(Self {
            kind,
            name: raw.metadata.name.trim().to_string(),
            namespace,
            title: raw.metadata.title,
            description: raw.metadata.description,
            tags: raw.metadata.tags,
            annotations: raw.metadata.annotations,
            links: raw.metadata.links,
            owner_ref: spec.owner.as_deref().and_then(EntityRef::parse),
            owner_label: spec.owner,
            relations,
            spec_type: spec.spec_type,
            lifecycle: spec.lifecycle,
            system: spec
                .system
                .as_deref()
                .and_then(|s| EntityRef::parse_with_default(s, EntityKind::System)),
            domain: spec
                .domain
                .as_deref()
                .and_then(|s| EntityRef::parse_with_default(s, EntityKind::Domain)),
            definition,
            profile: spec.profile.unwrap_or_default(),
            member_of: refs(&spec.member_of, EntityKind::Group),
            members: refs(&spec.members, EntityKind::User),
            children: refs(&spec.children, EntityKind::Group),
            parent: spec
                .parent
                .as_deref()
                .and_then(|s| EntityRef::parse_with_default(s, EntityKind::Group)),
        })
    }
}

// ============ Catalog wire format ============

#[derive(Debug, Deserialize)]
struct RawEntity {
    kind: String,
    metadata: RawMetadata,
    #[serde(default)]
    spec: RawSpec,
    #[serde(default)]
    relations: Vec<RawRelation>,
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSpec {
    #[serde(default, rename = "type")]
    spec_type: Option<String>,
    #[serde(default)]
    lifecycle: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    definition: Option<serde_json::Value>,
    #[serde(default)]
    profile: Option<Profile>,
    #[serde(default)]
    member_of: Vec<String>,
    #[serde(default)]
    members: Vec<String>,
    #[serde(default)]
    children: Vec<String>,
    #[serde(default)]
    parent: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRelation {
    #[serde(rename = "type")]
    relation_type: String,
    target_ref: String,
}

// ============ Identities ============

/// Whether an identity is a person or a group of people.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    User,
    Group,
}

/// A resolved identity, built once per run by the identity directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityRecord {
    #[serde(serialize_with = "serialize_ref")]
    pub source_ref: EntityRef,
    pub kind: IdentityKind,
    pub canonical_email: Option<String>,
    pub display_name: String,
    /// Emails of resolvable members. Always empty for users.
    pub member_emails: BTreeSet<String>,
    pub picture_url: Option<String>,
}

// ============ Documents ============

/// The access-control value attached to a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", content = "principals", rename_all = "kebab-case")]
pub enum Visibility {
    /// Only the listed principals (emails) may see the document. May be empty.
    Restricted(Vec<String>),
    AllUsers,
    DatasourceUsers,
    /// Visible to nobody.
    None,
}

/// A canonical indexable unit.
///
/// Created by the mapper, owned by an uploader until flushed, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: String,
    pub object_type: String,
    pub title: String,
    pub summary: Option<String>,
    pub body: String,
    pub url: String,
    pub tags: BTreeSet<String>,
    pub owner_email: Option<String>,
    pub owner_group: Option<String>,
    pub visibility: Visibility,
    pub container_id: Option<String>,
    /// Ordered name/value pairs, serialized as `[{"name": .., "value": ..}]`.
    #[serde(serialize_with = "serialize_properties")]
    pub properties: Vec<(String, String)>,
    pub content_hash: String,
    pub last_updated: DateTime<Utc>,
}

fn serialize_ref<S: serde::Serializer>(r: &EntityRef, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(r)
}

fn serialize_properties<S: serde::Serializer>(
    props: &[(String, String)],
    s: S,
) -> Result<S::Ok, S::Error> {
    #[derive(Serialize)]
    struct Property<'a> {
        name: &'a str,
        value: &'a str,
    }
    s.collect_seq(props.iter().map(|(name, value)| Property { name, value }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("API".parse::<EntityKind>().unwrap(), EntityKind::Api);
        assert_eq!("component".parse::<EntityKind>().unwrap(), EntityKind::Component);
        assert_eq!("Group".parse::<EntityKind>().unwrap(), EntityKind::Group);
        assert!("Template".parse::<EntityKind>().is_err());
    }

    #[test]
    fn kind_accepts_plural_for_cli() {
        assert_eq!("users".parse::<EntityKind>().unwrap(), EntityKind::User);
        assert_eq!("apis".parse::<EntityKind>().unwrap(), EntityKind::Api);
    }

    #[test]
    fn parse_full_reference() {
        let r = EntityRef::parse("user:default/john.doe").unwrap();
        assert_eq!(r.kind, Some(EntityKind::User));
        assert_eq!(r.namespace, "default");
        assert_eq!(r.name, "john.doe");
        assert_eq!(r.to_string(), "user:default/john.doe");
    }

    #[test]
    fn parse_short_references() {
        let r = EntityRef::parse("team-a").unwrap();
        assert_eq!(r.kind, None);
        assert_eq!(r.namespace, "default");
        assert_eq!(r.name, "team-a");

        let r = EntityRef::parse("group:team-b").unwrap();
        assert_eq!(r.kind, Some(EntityKind::Group));
        assert_eq!(r.name, "team-b");

        let r = EntityRef::parse_with_default("ops/payments", EntityKind::System).unwrap();
        assert_eq!(r.to_string(), "system:ops/payments");
    }

    #[test]
    fn parse_rejects_empty_and_unknown() {
        assert!(EntityRef::parse("").is_none());
        assert!(EntityRef::parse("user:default/").is_none());
        assert!(EntityRef::parse("template:default/x").is_none());
    }

    #[test]
    fn entity_from_catalog_json() {
        let value = json!({
            "apiVersion": "backstage.io/v1alpha1",
            "kind": "Component",
            "metadata": {
                "name": "checkout",
                "title": "Checkout Service",
                "description": "Handles **payments**",
                "tags": ["java", "payments"],
                "annotations": {"github.com/project-slug": "acme/checkout"},
                "links": [{"url": "https://grafana/checkout", "title": "Dashboard"}]
            },
            "spec": {
                "type": "service",
                "lifecycle": "production",
                "owner": "team-payments",
                "system": "commerce"
            },
            "relations": [
                {"type": "ownedBy", "targetRef": "group:default/team-payments"},
                {"type": "providesApi", "targetRef": "api:default/checkout-api"}
            ]
        });

        let entity = SourceEntity::from_json(EntityKind::Component, value).unwrap();
        assert_eq!(entity.name, "checkout");
        assert_eq!(entity.namespace, "default");
        assert_eq!(entity.tags, vec!["java", "payments"]);
        assert_eq!(entity.owner_ref.as_ref().unwrap().name, "team-payments");
        assert_eq!(entity.owner_ref.as_ref().unwrap().kind, None);
        assert_eq!(entity.system.as_ref().unwrap().to_string(), "system:default/commerce");
        assert_eq!(entity.relations.len(), 2);
        assert_eq!(entity.relations[1].relation_type, "providesApi");
    }

    #[test]
    fn wrong_shape_is_malformed() {
        let value = json!({"kind": "Component", "metadata": {"name": "x", "tags": "not-a-list"}});
        let err = SourceEntity::from_json(EntityKind::Component, value).unwrap_err();
        assert!(matches!(err, SyncError::SourceMalformed { .. }));

        let value = json!({"kind": "Component"});
        assert!(SourceEntity::from_json(EntityKind::Component, value).is_err());
    }

    #[test]
    fn kind_mismatch_is_malformed() {
        let value = json!({"kind": "API", "metadata": {"name": "x"}});
        let err = SourceEntity::from_json(EntityKind::Component, value).unwrap_err();
        assert!(matches!(err, SyncError::SourceMalformed { .. }));
    }

    #[test]
    fn user_profile_and_memberships() {
        let value = json!({
            "kind": "User",
            "metadata": {"name": "jane", "namespace": "people"},
            "spec": {
                "profile": {"displayName": "Jane", "email": "jane@x.com"},
                "memberOf": ["team-a", "group:default/team-b"]
            }
        });
        let user = SourceEntity::from_json(EntityKind::User, value).unwrap();
        assert_eq!(user.namespace, "people");
        assert_eq!(user.profile.email.as_deref(), Some("jane@x.com"));
        assert_eq!(user.member_of.len(), 2);
        assert!(user.member_of.iter().all(|r| r.kind == Some(EntityKind::Group)));
    }

    #[test]
    fn visibility_serializes_tagged() {
        let v = serde_json::to_value(Visibility::Restricted(vec!["a@x.com".into()])).unwrap();
        assert_eq!(v, json!({"type": "restricted", "principals": ["a@x.com"]}));
        let v = serde_json::to_value(Visibility::DatasourceUsers).unwrap();
        assert_eq!(v, json!({"type": "datasource-users"}));
    }
}
