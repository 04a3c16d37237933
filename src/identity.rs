//! In-memory identity directory.
//!
//! Built once per run from the catalog's User and Group entities, then
//! shared read-only (behind an `Arc`) with every entity worker. Lookups are
//! keyed on case-normalized references, so `user:Default/Jane` and
//! `user:default/jane` find the same record.
//!
//! Group membership is gathered from every place the catalog records it:
//!
//! - the group's `spec.members` and `hasMember` relations
//! - each user's `spec.memberOf` and `memberOf` relations
//! - child groups via `spec.children`, `spec.parent`, `parentOf` and
//!   `childOf` relations
//!
//! A group's `member_emails` holds its direct user members plus the direct
//! user members of its direct child groups. Deeper nesting is not followed.

use std::collections::{BTreeMap, BTreeSet};
use tokio_util::sync::CancellationToken;

use crate::error::{SyncError, SyncResult};
use crate::models::{EntityKind, EntityRef, IdentityKind, IdentityRecord, SourceEntity};
use crate::source::{fetch_all, CatalogSource};

/// An owner reference resolved against the directory.
#[derive(Debug, Clone, Copy)]
pub enum ResolvedOwner<'a> {
    User(&'a IdentityRecord),
    Group(&'a IdentityRecord),
}

/// Counters collected while building the directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityStats {
    pub users_fetched: usize,
    pub groups_fetched: usize,
    pub users_without_email: usize,
    pub duplicate_emails: usize,
    /// Member references that matched no known user or group.
    pub unresolved_members: usize,
    pub malformed: usize,
    /// Kinds whose pagination stopped early. The directory holds what was read.
    pub partial_kinds: Vec<EntityKind>,
}

/// Immutable lookup table from catalog identity to canonical identity.
#[derive(Debug, Default)]
pub struct IdentityDirectory {
    users: BTreeMap<EntityRef, IdentityRecord>,
    groups: BTreeMap<EntityRef, IdentityRecord>,
    /// Duplicate-email users, pointing at the user that kept the email.
    aliases: BTreeMap<EntityRef, EntityRef>,
}

fn key(kind: EntityKind, r: &EntityRef) -> EntityRef {
    EntityRef {
        kind: Some(kind),
        namespace: r.namespace.to_lowercase(),
        name: r.name.to_lowercase(),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl IdentityDirectory {
    /// Fetch users and groups (each only when enabled) and build the directory.
    ///
    /// A kind whose pagination fails part way contributes the pages it did
    /// read; the failure is logged and recorded in
    /// [`IdentityStats::partial_kinds`]. Fatal errors (bad credentials,
    /// cancellation) are returned.
    pub async fn build(
        source: &dyn CatalogSource,
        users: bool,
        groups: bool,
        cancel: &CancellationToken,
    ) -> SyncResult<(Self, IdentityStats)> {
        let mut partial_kinds = Vec::new();
        let mut malformed = 0;
        let mut fetched_by_kind = Vec::with_capacity(2);

        for (kind, enabled) in [(EntityKind::User, users), (EntityKind::Group, groups)] {
            if !enabled {
                fetched_by_kind.push(Vec::new());
                continue;
            }
            let fetched = fetch_all(source, kind, cancel).await;
            malformed += fetched.malformed.len();
            if let Some(err) = fetched.error {
                if err.is_fatal() {
                    return Err(err);
                }
                tracing::warn!(
                    kind = %kind,
                    fetched = fetched.entities.len(),
                    error = %err,
                    "identity fetch incomplete, continuing with partial data"
                );
                partial_kinds.push(kind);
            }
            fetched_by_kind.push(fetched.entities);
        }

        let group_entities = fetched_by_kind.pop().unwrap_or_default();
        let user_entities = fetched_by_kind.pop().unwrap_or_default();
        let (directory, mut stats) = Self::from_entities(&user_entities, &group_entities);
        stats.malformed = malformed;
        stats.partial_kinds = partial_kinds;

        tracing::info!(
            users = directory.users.len(),
            groups = directory.groups.len(),
            duplicate_emails = stats.duplicate_emails,
            unresolved_members = stats.unresolved_members,
            "identity directory built"
        );
        Ok((directory, stats))
    }

    /// Build the directory from already-fetched entities.
    pub fn from_entities(users: &[SourceEntity], groups: &[SourceEntity]) -> (Self, IdentityStats) {
        let mut directory = IdentityDirectory::default();
        let mut stats = IdentityStats {
            users_fetched: users.len(),
            groups_fetched: groups.len(),
            ..Default::default()
        };

        // Users, first email wins.
        let mut by_email: BTreeMap<String, EntityRef> = BTreeMap::new();
        for user in users.iter().filter(|u| !u.name.is_empty()) {
            let user_key = key(EntityKind::User, &user.entity_ref());
            let email = non_empty(user.profile.email.as_deref());

            match &email {
                None => {
                    tracing::debug!(user = %user_key, "user has no email");
                    stats.users_without_email += 1;
                }
                Some(email) => {
                    let normalized = email.to_lowercase();
                    if let Some(first) = by_email.get(&normalized) {
                        tracing::warn!(
                            user = %user_key,
                            kept = %first,
                            email = %email,
                            "duplicate user email, merging into first user"
                        );
                        stats.duplicate_emails += 1;
                        directory.aliases.insert(user_key, first.clone());
                        continue;
                    }
                    by_email.insert(normalized, user_key.clone());
                }
            }

            let display_name = non_empty(user.profile.display_name.as_deref())
                .or_else(|| non_empty(user.title.as_deref()))
                .unwrap_or_else(|| user.name.clone());

            directory.users.insert(
                user_key,
                IdentityRecord {
                    source_ref: user.entity_ref(),
                    kind: IdentityKind::User,
                    canonical_email: email,
                    display_name,
                    member_emails: BTreeSet::new(),
                    picture_url: non_empty(user.profile.picture.as_deref()),
                },
            );
        }

        let known_groups: BTreeSet<EntityRef> = groups
            .iter()
            .filter(|g| !g.name.is_empty())
            .map(|g| key(EntityKind::Group, &g.entity_ref()))
            .collect();

        // group -> direct user members, group -> direct child groups
        let mut direct: BTreeMap<EntityRef, BTreeSet<EntityRef>> = BTreeMap::new();
        let mut children: BTreeMap<EntityRef, BTreeSet<EntityRef>> = BTreeMap::new();

        for user in users.iter().filter(|u| !u.name.is_empty()) {
            let user_key = directory.canonical_user(&key(EntityKind::User, &user.entity_ref()));
            let declared = user.member_of.iter().chain(
                user.relations
                    .iter()
                    .filter(|r| r.relation_type == "memberOf")
                    .map(|r| &r.target),
            );
            for group in declared {
                let group_key = key(EntityKind::Group, group);
                if known_groups.contains(&group_key) {
                    direct.entry(group_key).or_default().insert(user_key.clone());
                } else {
                    tracing::debug!(
                        user = %user_key,
                        group = %group_key,
                        "membership in unknown group"
                    );
                    stats.unresolved_members += 1;
                }
            }
        }

        for group in groups.iter().filter(|g| !g.name.is_empty()) {
            let group_key = key(EntityKind::Group, &group.entity_ref());

            let members = group.members.iter().chain(
                group
                    .relations
                    .iter()
                    .filter(|r| r.relation_type == "hasMember")
                    .map(|r| &r.target),
            );
            for member in members {
                // `group:` members are nested groups; anything else names a user.
                if member.kind == Some(EntityKind::Group) {
                    let child_key = key(EntityKind::Group, member);
                    if known_groups.contains(&child_key) {
                        if child_key != group_key {
                            children.entry(group_key.clone()).or_default().insert(child_key);
                        }
                    } else {
                        tracing::debug!(
                            group = %group_key,
                            member = %member,
                            "dropping unknown child group"
                        );
                        stats.unresolved_members += 1;
                    }
                    continue;
                }

                let member_key = directory.canonical_user(&key(EntityKind::User, member));
                if directory.users.contains_key(&member_key) {
                    direct.entry(group_key.clone()).or_default().insert(member_key);
                } else {
                    tracing::debug!(
                        group = %group_key,
                        member = %member,
                        "dropping unknown group member"
                    );
                    stats.unresolved_members += 1;
                }
            }

            let child_refs = group.children.iter().chain(
                group
                    .relations
                    .iter()
                    .filter(|r| r.relation_type == "parentOf")
                    .map(|r| &r.target),
            );
            for child in child_refs {
                let child_key = key(EntityKind::Group, child);
                if known_groups.contains(&child_key) && child_key != group_key {
                    children.entry(group_key.clone()).or_default().insert(child_key);
                }
            }

            let parent_refs = group.parent.iter().chain(
                group
                    .relations
                    .iter()
                    .filter(|r| r.relation_type == "childOf")
                    .map(|r| &r.target),
            );
            for parent in parent_refs {
                let parent_key = key(EntityKind::Group, parent);
                if known_groups.contains(&parent_key) && parent_key != group_key {
                    children.entry(parent_key).or_default().insert(group_key.clone());
                }
            }
        }

        for group in groups.iter().filter(|g| !g.name.is_empty()) {
            let group_key = key(EntityKind::Group, &group.entity_ref());
            if directory.groups.contains_key(&group_key) {
                continue;
            }

            let mut member_users: BTreeSet<&EntityRef> = BTreeSet::new();
            member_users.extend(direct.get(&group_key).into_iter().flatten());
            for child in children.get(&group_key).into_iter().flatten() {
                member_users.extend(direct.get(child).into_iter().flatten());
            }
            let member_emails = member_users
                .into_iter()
                .filter_map(|u| directory.users.get(u))
                .filter_map(|u| u.canonical_email.clone())
                .collect();

            let display_name = non_empty(group.profile.display_name.as_deref())
                .or_else(|| non_empty(group.title.as_deref()))
                .unwrap_or_else(|| group.name.clone());

            directory.groups.insert(
                group_key,
                IdentityRecord {
                    source_ref: group.entity_ref(),
                    kind: IdentityKind::Group,
                    canonical_email: non_empty(group.profile.email.as_deref()),
                    display_name,
                    member_emails,
                    picture_url: non_empty(group.profile.picture.as_deref()),
                },
            );
        }

        (directory, stats)
    }

    fn canonical_user(&self, user_key: &EntityRef) -> EntityRef {
        self.aliases
            .get(user_key)
            .cloned()
            .unwrap_or_else(|| user_key.clone())
    }

    fn user(&self, r: &EntityRef) -> Option<&IdentityRecord> {
        self.users.get(&self.canonical_user(&key(EntityKind::User, r)))
    }

    fn group(&self, r: &EntityRef) -> Option<&IdentityRecord> {
        self.groups.get(&key(EntityKind::Group, r))
    }

    /// Email of the user `r` refers to, if known.
    pub fn lookup_email(&self, r: &EntityRef) -> Option<&str> {
        self.user(r).and_then(|u| u.canonical_email.as_deref())
    }

    pub fn lookup_group(&self, r: &EntityRef) -> Option<&IdentityRecord> {
        self.group(r)
    }

    /// Resolve an owner reference. References without a kind are tried as a
    /// group first, then as a user.
    pub fn resolve_owner(&self, r: &EntityRef) -> SyncResult<ResolvedOwner<'_>> {
        let found = match r.kind {
            Some(EntityKind::User) => self.user(r).map(ResolvedOwner::User),
            Some(EntityKind::Group) => self.group(r).map(ResolvedOwner::Group),
            None => self
                .group(r)
                .map(ResolvedOwner::Group)
                .or_else(|| self.user(r).map(ResolvedOwner::User)),
            Some(_) => None,
        };
        found.ok_or_else(|| SyncError::IdentityUnresolved {
            reference: r.to_string(),
        })
    }

    /// Every identity record, users first, in a stable order.
    pub fn records(&self) -> impl Iterator<Item = &IdentityRecord> {
        self.users.values().chain(self.groups.values())
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(name: &str, email: Option<&str>, member_of: &[&str]) -> SourceEntity {
        let mut profile = json!({"displayName": name.to_uppercase()});
        if let Some(email) = email {
            profile["email"] = json!(email);
        }
        SourceEntity::from_json(
            EntityKind::User,
            json!({
                "kind": "User",
                "metadata": {"name": name},
                "spec": {"profile": profile, "memberOf": member_of}
            }),
        )
        .unwrap()
    }

    fn group(name: &str, spec: serde_json::Value) -> SourceEntity {
        SourceEntity::from_json(
            EntityKind::Group,
            json!({"kind": "Group", "metadata": {"name": name}, "spec": spec}),
        )
        .unwrap()
    }

    fn emails(record: &IdentityRecord) -> Vec<&str> {
        record.member_emails.iter().map(String::as_str).collect()
    }

    #[test]
    fn merges_memberships_from_both_sides() {
        let users = vec![
            user("alice", Some("alice@x.com"), &["team-a"]),
            user("bob", Some("bob@x.com"), &[]),
        ];
        let groups = vec![group("team-a", json!({"members": ["bob", "ghost"]}))];
        let (dir, stats) = IdentityDirectory::from_entities(&users, &groups);

        let team = dir.lookup_group(&EntityRef::parse("team-a").unwrap()).unwrap();
        assert_eq!(emails(team), vec!["alice@x.com", "bob@x.com"]);
        assert_eq!(stats.unresolved_members, 1);
    }

    #[test]
    fn has_member_relations_count() {
        let users = vec![user("carol", Some("carol@x.com"), &[])];
        let groups = vec![SourceEntity::from_json(
            EntityKind::Group,
            json!({
                "kind": "Group",
                "metadata": {"name": "ops"},
                "relations": [{"type": "hasMember", "targetRef": "user:default/carol"}]
            }),
        )
        .unwrap()];
        let (dir, _) = IdentityDirectory::from_entities(&users, &groups);
        let ops = dir.lookup_group(&EntityRef::parse("group:ops").unwrap()).unwrap();
        assert_eq!(emails(ops), vec!["carol@x.com"]);
    }

    #[test]
    fn child_groups_resolve_one_level() {
        let users = vec![
            user("a", Some("a@x.com"), &["parent"]),
            user("b", Some("b@x.com"), &["child"]),
            user("c", Some("c@x.com"), &["grandchild"]),
        ];
        let groups = vec![
            group("parent", json!({"children": ["child"]})),
            group("child", json!({})),
            group("grandchild", json!({"parent": "child"})),
        ];
        let (dir, _) = IdentityDirectory::from_entities(&users, &groups);

        let parent = dir.lookup_group(&EntityRef::parse("parent").unwrap()).unwrap();
        assert_eq!(emails(parent), vec!["a@x.com", "b@x.com"]);
        let child = dir.lookup_group(&EntityRef::parse("child").unwrap()).unwrap();
        assert_eq!(emails(child), vec!["b@x.com", "c@x.com"]);
    }

    #[test]
    fn group_refs_in_members_are_child_groups() {
        let users = vec![
            user("a", Some("a@x.com"), &["platform"]),
            user("b", Some("b@x.com"), &["infra"]),
        ];
        let groups = vec![
            group("platform", json!({"members": ["group:infra", "group:default/gone"]})),
            group("infra", json!({})),
        ];
        let (dir, stats) = IdentityDirectory::from_entities(&users, &groups);

        let platform = dir.lookup_group(&EntityRef::parse("platform").unwrap()).unwrap();
        assert_eq!(emails(platform), vec!["a@x.com", "b@x.com"]);
        // `group:infra` is not mistaken for a user named infra.
        assert_eq!(dir.lookup_email(&EntityRef::parse("user:infra").unwrap()), None);
        assert_eq!(stats.unresolved_members, 1);
    }

    #[test]
    fn duplicate_emails_merge_into_first_user() {
        let users = vec![
            user("jane", Some("jane@x.com"), &[]),
            user("jane-alt", Some("JANE@x.com"), &["team"]),
        ];
        let groups = vec![group("team", json!({}))];
        let (dir, stats) = IdentityDirectory::from_entities(&users, &groups);

        assert_eq!(stats.duplicate_emails, 1);
        assert_eq!(dir.user_count(), 1);
        assert_eq!(
            dir.lookup_email(&EntityRef::parse("user:jane-alt").unwrap()),
            Some("jane@x.com")
        );
        let team = dir.lookup_group(&EntityRef::parse("team").unwrap()).unwrap();
        assert_eq!(emails(team), vec!["jane@x.com"]);
    }

    #[test]
    fn users_without_email_contribute_nothing() {
        let users = vec![user("nomail", None, &["team"])];
        let groups = vec![group("team", json!({}))];
        let (dir, stats) = IdentityDirectory::from_entities(&users, &groups);

        assert_eq!(stats.users_without_email, 1);
        assert_eq!(dir.lookup_email(&EntityRef::parse("user:nomail").unwrap()), None);
        assert!(dir
            .lookup_group(&EntityRef::parse("team").unwrap())
            .unwrap()
            .member_emails
            .is_empty());
    }

    #[test]
    fn lookups_ignore_case() {
        let users = vec![user("Jane", Some("jane@x.com"), &[])];
        let (dir, _) = IdentityDirectory::from_entities(&users, &[]);
        assert_eq!(
            dir.lookup_email(&EntityRef::parse("user:DEFAULT/jane").unwrap()),
            Some("jane@x.com")
        );
    }

    #[test]
    fn unqualified_owner_prefers_group() {
        let users = vec![user("platform", Some("p@x.com"), &[])];
        let groups = vec![group("platform", json!({}))];
        let (dir, _) = IdentityDirectory::from_entities(&users, &groups);

        let owner = dir.resolve_owner(&EntityRef::parse("platform").unwrap()).unwrap();
        assert!(matches!(owner, ResolvedOwner::Group(_)));
        let owner = dir
            .resolve_owner(&EntityRef::parse("user:platform").unwrap())
            .unwrap();
        assert!(matches!(owner, ResolvedOwner::User(_)));
    }

    #[test]
    fn unknown_owner_is_unresolved() {
        let dir = IdentityDirectory::default();
        let err = dir
            .resolve_owner(&EntityRef::parse("group:nobody").unwrap())
            .unwrap_err();
        assert!(matches!(err, SyncError::IdentityUnresolved { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn records_are_users_then_groups() {
        let users = vec![user("zed", Some("z@x.com"), &[]), user("amy", Some("a@x.com"), &[])];
        let groups = vec![group("team", json!({}))];
        let (dir, _) = IdentityDirectory::from_entities(&users, &groups);
        let names: Vec<String> = dir.records().map(|r| r.source_ref.name.clone()).collect();
        assert_eq!(names, vec!["amy", "zed", "team"]);
    }
}
