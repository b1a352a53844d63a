//! Graph store abstraction.
//!
//! The loader talks to the database only through [`GraphStore`]. A batch is
//! handed over as one [`WriteSet`] and must be applied atomically: either
//! every node and relationship lands, or none does.

use crate::error::StoreError;
use crate::models::{Affiliation, EntityKind, Organization, Person, Publication};
use async_trait::async_trait;

/// What the dedup index needs to know about a stored person.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PersonIdentity {
    pub id: String,
    pub display_name: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub birth_year: Option<i32>,
    pub orcid: Option<String>,
    pub scopus_author_id: Option<String>,
}

impl From<&Person> for PersonIdentity {
    fn from(p: &Person) -> Self {
        Self {
            id: p.id.clone(),
            display_name: p.display_name.clone(),
            first_name: p.first_name.clone(),
            last_name: p.last_name.clone(),
            birth_year: p.birth_year,
            orcid: p.orcid.clone(),
            scopus_author_id: p.scopus_author_id.clone(),
        }
    }
}

/// Identity keys in decreasing order of trust.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PersonKey {
    Id(String),
    Orcid(String),
    Scopus(String),
    NameYear {
        first: String,
        last: String,
        birth_year: i32,
    },
    DisplayName(String),
}

impl PersonKey {
    /// Short name used in logs and conflict reports
    pub fn tier(&self) -> &'static str {
        match self {
            PersonKey::Id(_) => "id",
            PersonKey::Orcid(_) => "orcid",
            PersonKey::Scopus(_) => "scopus_author_id",
            PersonKey::NameYear { .. } => "name_and_birth_year",
            PersonKey::DisplayName(_) => "display_name",
        }
    }

    /// Keys derivable from a person, strongest first. Name keys are lowercased.
    pub fn all_for(identity: &PersonIdentity, display_name_fallback: bool) -> Vec<PersonKey> {
        let mut keys = vec![PersonKey::Id(identity.id.clone())];
        if let Some(orcid) = &identity.orcid {
            keys.push(PersonKey::Orcid(orcid.clone()));
        }
        if let Some(scopus) = &identity.scopus_author_id {
            keys.push(PersonKey::Scopus(scopus.clone()));
        }
        if let (Some(first), Some(last), Some(birth_year)) =
            (&identity.first_name, &identity.last_name, identity.birth_year)
        {
            keys.push(PersonKey::NameYear {
                first: first.to_lowercase(),
                last: last.to_lowercase(),
                birth_year,
            });
        }
        if display_name_fallback && !identity.display_name.is_empty() {
            keys.push(PersonKey::DisplayName(identity.display_name.to_lowercase()));
        }
        keys
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeWrite {
    Publication(Publication),
    Person(Person),
    Organization(Organization),
    /// Fill identifiers missing on an existing person; never overwrites
    PersonIdentifiers {
        id: String,
        orcid: Option<String>,
        scopus_author_id: Option<String>,
        birth_year: Option<i32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationshipWrite {
    Authored {
        person_id: String,
        publication_id: String,
        order: u32,
        role: String,
    },
    Affiliation(Affiliation),
    PartOf {
        child_id: String,
        parent_id: String,
    },
}

impl RelationshipWrite {
    pub fn rel_type(&self) -> &'static str {
        match self {
            RelationshipWrite::Authored { .. } => "AUTHORED",
            RelationshipWrite::Affiliation(a) => a.kind.rel_type(),
            RelationshipWrite::PartOf { .. } => "PART_OF",
        }
    }
}

/// One batch worth of writes. Nodes are applied before relationships.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSet {
    pub nodes: Vec<NodeWrite>,
    pub relationships: Vec<RelationshipWrite>,
}

impl WriteSet {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.relationships.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len() + self.relationships.len()
    }
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Cheap round trip used to tell "down" from "refused"
    async fn ping(&self) -> Result<(), StoreError>;

    /// All ids stored for a label; used to bootstrap the dedup index
    async fn existing_ids(&self, kind: EntityKind) -> Result<Vec<String>, StoreError>;

    async fn existing_people(&self) -> Result<Vec<PersonIdentity>, StoreError>;

    async fn node_exists(&self, kind: EntityKind, id: &str) -> Result<bool, StoreError>;

    /// People matching one identity key. Name keys compare case-insensitively.
    async fn find_person(&self, key: &PersonKey) -> Result<Vec<PersonIdentity>, StoreError>;

    /// Apply the whole set in one transaction.
    async fn commit(&self, writes: &WriteSet) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_ordered_by_trust() {
        let identity = PersonIdentity {
            id: "p1".into(),
            display_name: "Ada Lovelace".into(),
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
            birth_year: Some(1985),
            orcid: Some("0000-0002-1825-0097".into()),
            scopus_author_id: Some("123".into()),
        };
        let tiers: Vec<_> = PersonKey::all_for(&identity, true)
            .iter()
            .map(PersonKey::tier)
            .collect();
        assert_eq!(
            tiers,
            vec!["id", "orcid", "scopus_author_id", "name_and_birth_year", "display_name"]
        );
        assert_eq!(PersonKey::all_for(&identity, false).len(), 4);
    }

    #[test]
    fn name_key_needs_birth_year() {
        let identity = PersonIdentity {
            id: "p1".into(),
            display_name: "Ada Lovelace".into(),
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
            ..Default::default()
        };
        let keys = PersonKey::all_for(&identity, true);
        assert_eq!(
            keys,
            vec![
                PersonKey::Id("p1".into()),
                PersonKey::DisplayName("ada lovelace".into())
            ]
        );
    }
}
