//! Visibility resolution.
//!
//! Explicit ownership always wins: a user owner with a known email, or any
//! known group owner, restricts the document to those principals. The
//! configured [`DefaultPermissions`] policy only applies when the owner is
//! absent or cannot be resolved.
//!
//! | Owner | Policy | Visibility |
//! |-------|--------|------------|
//! | user with email | any | `Restricted([email])` |
//! | known group | any | `Restricted(member emails)` (possibly empty) |
//! | none / unresolved / user without email | `all-users` | `AllUsers` |
//! | none / unresolved / user without email | `datasource-users` | `DatasourceUsers` |
//! | none / unresolved / user without email | `owner` | `None` |
//! | none / unresolved / user without email | `none` | `None` |

use serde::Deserialize;
use std::fmt;

use crate::identity::ResolvedOwner;
use crate::models::Visibility;

/// Fallback policy for documents without a resolvable owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefaultPermissions {
    AllUsers,
    #[default]
    DatasourceUsers,
    Owner,
    None,
}

impl DefaultPermissions {
    pub const ALL: [DefaultPermissions; 4] = [
        DefaultPermissions::AllUsers,
        DefaultPermissions::DatasourceUsers,
        DefaultPermissions::Owner,
        DefaultPermissions::None,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DefaultPermissions::AllUsers => "all-users",
            DefaultPermissions::DatasourceUsers => "datasource-users",
            DefaultPermissions::Owner => "owner",
            DefaultPermissions::None => "none",
        }
    }
}

impl fmt::Display for DefaultPermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute visibility from an already-resolved owner.
///
/// Total: every input produces exactly one [`Visibility`].
pub fn resolve(owner: Option<ResolvedOwner<'_>>, policy: DefaultPermissions) -> Visibility {
    match owner {
        Some(ResolvedOwner::User(user)) => {
            if let Some(email) = &user.canonical_email {
                return Visibility::Restricted(vec![email.clone()]);
            }
        }
        // An empty group stays restricted to nobody; never widened.
        Some(ResolvedOwner::Group(group)) => {
            return Visibility::Restricted(group.member_emails.iter().cloned().collect());
        }
        None => {}
    }

    match policy {
        DefaultPermissions::AllUsers => Visibility::AllUsers,
        DefaultPermissions::DatasourceUsers => Visibility::DatasourceUsers,
        // The `owner` policy only restricts to a user owner with an email,
        // which was handled above. Anything else is visible to nobody.
        DefaultPermissions::Owner | DefaultPermissions::None => Visibility::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, EntityRef, IdentityKind, IdentityRecord};
    use std::collections::BTreeSet;

    fn user(name: &str, email: Option<&str>) -> IdentityRecord {
        IdentityRecord {
            source_ref: EntityRef::new(EntityKind::User, "default", name),
            kind: IdentityKind::User,
            canonical_email: email.map(str::to_string),
            display_name: name.to_string(),
            member_emails: BTreeSet::new(),
            picture_url: None,
        }
    }

    fn group(name: &str, members: &[&str]) -> IdentityRecord {
        IdentityRecord {
            source_ref: EntityRef::new(EntityKind::Group, "default", name),
            kind: IdentityKind::Group,
            canonical_email: None,
            display_name: name.to_string(),
            member_emails: members.iter().map(|m| m.to_string()).collect(),
            picture_url: None,
        }
    }

    fn is_one_of_four(v: &Visibility) -> bool {
        matches!(
            v,
            Visibility::Restricted(_)
                | Visibility::AllUsers
                | Visibility::DatasourceUsers
                | Visibility::None
        )
    }

    #[test]
    fn user_with_email_wins_over_every_policy() {
        let alice = user("alice", Some("a@x.com"));
        for policy in DefaultPermissions::ALL {
            assert_eq!(
                resolve(Some(ResolvedOwner::User(&alice)), policy),
                Visibility::Restricted(vec!["a@x.com".into()])
            );
        }
    }

    #[test]
    fn group_restricts_to_members() {
        let team = group("team", &["b@x.com", "a@x.com"]);
        assert_eq!(
            resolve(Some(ResolvedOwner::Group(&team)), DefaultPermissions::AllUsers),
            Visibility::Restricted(vec!["a@x.com".into(), "b@x.com".into()])
        );
    }

    #[test]
    fn empty_group_is_not_widened() {
        let empty = group("ghosts", &[]);
        for policy in DefaultPermissions::ALL {
            let v = resolve(Some(ResolvedOwner::Group(&empty)), policy);
            assert_eq!(v, Visibility::Restricted(vec![]));
            assert_ne!(v, Visibility::AllUsers);
            assert_ne!(v, Visibility::DatasourceUsers);
        }
    }

    #[test]
    fn no_owner_uses_policy() {
        assert_eq!(resolve(None, DefaultPermissions::AllUsers), Visibility::AllUsers);
        assert_eq!(
            resolve(None, DefaultPermissions::DatasourceUsers),
            Visibility::DatasourceUsers
        );
        assert_eq!(resolve(None, DefaultPermissions::Owner), Visibility::None);
        assert_eq!(resolve(None, DefaultPermissions::None), Visibility::None);
    }

    #[test]
    fn user_without_email_falls_back() {
        let bob = user("bob", None);
        assert_eq!(
            resolve(Some(ResolvedOwner::User(&bob)), DefaultPermissions::Owner),
            Visibility::None
        );
        assert_eq!(
            resolve(Some(ResolvedOwner::User(&bob)), DefaultPermissions::DatasourceUsers),
            Visibility::DatasourceUsers
        );
    }

    #[test]
    fn resolution_is_total() {
        let alice = user("alice", Some("a@x.com"));
        let bob = user("bob", None);
        let team = group("team", &["a@x.com"]);
        let empty = group("empty", &[]);
        let owners = [
            None,
            Some(ResolvedOwner::User(&alice)),
            Some(ResolvedOwner::User(&bob)),
            Some(ResolvedOwner::Group(&team)),
            Some(ResolvedOwner::Group(&empty)),
        ];
        for owner in owners {
            for policy in DefaultPermissions::ALL {
                assert!(is_one_of_four(&resolve(owner, policy)));
            }
        }
    }

    #[test]
    fn policy_parses_from_kebab_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            p: DefaultPermissions,
        }
        let w: Wrapper = toml::from_str("p = \"all-users\"").unwrap();
        assert_eq!(w.p, DefaultPermissions::AllUsers);
        let w: Wrapper = toml::from_str("p = \"none\"").unwrap();
        assert_eq!(w.p, DefaultPermissions::None);
    }
}
