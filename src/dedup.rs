//! Identity tracking across the run.
//!
//! The index starts from one bulk snapshot of the store and falls back to point
//! lookups for keys it has not seen. Everything registered while a batch is being
//! prepared is staged; [`DedupIndex::commit_staged`] makes it permanent once the
//! batch is in the store and [`DedupIndex::discard_staged`] forgets it if the
//! batch failed.

use crate::error::{DuplicateConflict, StoreError};
use crate::models::{EntityKind, Person};
use crate::store::{GraphStore, NodeWrite, PersonIdentity, PersonKey};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Outcome of resolving one author against known people.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPerson {
    /// Node id the author maps to
    pub id: String,
    /// True when no existing node matched and a new one will be created
    pub created: bool,
    /// Identifiers to add to the matched node
    pub fill: Option<NodeWrite>,
    pub conflicts: Vec<DuplicateConflict>,
}

#[derive(Debug, Default)]
pub struct DedupIndex {
    publications: FxHashSet<String>,
    organizations: FxHashSet<String>,
    people: FxHashMap<String, PersonIdentity>,
    person_keys: FxHashMap<PersonKey, BTreeSet<String>>,
    staged_publications: FxHashSet<String>,
    staged_organizations: FxHashSet<String>,
    staged_people: FxHashMap<String, PersonIdentity>,
    display_name_fallback: bool,
    store_lookups: u64,
}

impl DedupIndex {
    pub fn new(display_name_fallback: bool) -> Self {
        Self {
            display_name_fallback,
            ..Default::default()
        }
    }

    /// Snapshot every identity already in the store.
    pub async fn bootstrap(
        store: &dyn GraphStore,
        display_name_fallback: bool,
    ) -> Result<Self, StoreError> {
        let mut index = Self::new(display_name_fallback);
        index.publications = store
            .existing_ids(EntityKind::Publication)
            .await?
            .into_iter()
            .collect();
        index.organizations = store
            .existing_ids(EntityKind::Organization)
            .await?
            .into_iter()
            .collect();
        for person in store.existing_people().await? {
            index.remember(person);
        }
        info!(
            publications = index.publications.len(),
            persons = index.people.len(),
            organizations = index.organizations.len(),
            "Dedup index bootstrapped"
        );
        Ok(index)
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Publication => self.publications.len(),
            EntityKind::Person => self.people.len(),
            EntityKind::Organization => self.organizations.len(),
        }
    }

    /// Point lookups issued against the store so far
    pub fn store_lookups(&self) -> u64 {
        self.store_lookups
    }

    pub fn has_staged(&self) -> bool {
        !self.staged_publications.is_empty()
            || !self.staged_organizations.is_empty()
            || !self.staged_people.is_empty()
    }

    /// Whether a publication or organization node exists (or is staged).
    pub async fn node_exists(
        &mut self,
        store: &dyn GraphStore,
        kind: EntityKind,
        id: &str,
    ) -> Result<bool, StoreError> {
        let (committed, staged) = match kind {
            EntityKind::Publication => (&self.publications, &self.staged_publications),
            EntityKind::Organization => (&self.organizations, &self.staged_organizations),
            EntityKind::Person => {
                if self.staged_people.contains_key(id) || self.people.contains_key(id) {
                    return Ok(true);
                }
                let found = self.probe(store, &PersonKey::Id(id.to_string())).await?;
                return Ok(!found.is_empty());
            }
        };
        if committed.contains(id) || staged.contains(id) {
            return Ok(true);
        }

        self.store_lookups += 1;
        let exists = store.node_exists(kind, id).await?;
        if exists {
            debug!(%kind, id, "Found node created outside this run");
            match kind {
                EntityKind::Publication => self.publications.insert(id.to_string()),
                _ => self.organizations.insert(id.to_string()),
            };
        }
        Ok(exists)
    }

    pub fn stage(&mut self, kind: EntityKind, id: &str) {
        match kind {
            EntityKind::Publication => {
                self.staged_publications.insert(id.to_string());
            }
            EntityKind::Organization => {
                self.staged_organizations.insert(id.to_string());
            }
            EntityKind::Person => {}
        }
    }

    /// Map an author to a node id using the identity tiers strongest first.
    ///
    /// A match that carries a contradicting stronger identifier is never used;
    /// it is reported as a [`DuplicateConflict`] instead. When several tiers
    /// point at different nodes the strongest one wins and the others are
    /// reported.
    pub async fn resolve_person(
        &mut self,
        store: &dyn GraphStore,
        candidate: &Person,
    ) -> Result<ResolvedPerson, StoreError> {
        let identity = PersonIdentity::from(candidate);
        let keys = PersonKey::all_for(&identity, self.display_name_fallback);
        let mut conflicts = Vec::new();
        let mut chosen: Option<(PersonIdentity, usize)> = None;

        for (tier, key) in keys.iter().enumerate() {
            let matches = match &chosen {
                None => {
                    let local = self.lookup(key);
                    if local.is_empty() {
                        self.probe(store, key).await?
                    } else {
                        local
                    }
                }
                // Once a node is chosen weaker tiers are only checked in memory
                Some(_) => self.lookup(key),
            };

            for existing in matches {
                if let Some((picked, picked_tier)) = &chosen {
                    if existing.id != picked.id && contradiction(key, &existing, &identity).is_none() {
                        conflicts.push(DuplicateConflict {
                            candidate_id: identity.id.clone(),
                            existing_id: existing.id.clone(),
                            tier: key.tier(),
                            reason: format!(
                                "already resolved to {} by {}",
                                picked.id,
                                keys[*picked_tier].tier()
                            ),
                        });
                    }
                    continue;
                }
                if let Some(reason) = contradiction(key, &existing, &identity) {
                    conflicts.push(DuplicateConflict {
                        candidate_id: identity.id.clone(),
                        existing_id: existing.id.clone(),
                        tier: key.tier(),
                        reason,
                    });
                    continue;
                }
                chosen = Some((existing, tier));
            }
        }

        let Some((existing, _)) = chosen else {
            self.staged_people.insert(identity.id.clone(), identity.clone());
            return Ok(ResolvedPerson {
                id: identity.id,
                created: true,
                fill: None,
                conflicts,
            });
        };

        let fill = identifier_fill(&existing, &identity);
        if fill.is_some() {
            let mut updated = existing.clone();
            updated.orcid = updated.orcid.or(identity.orcid.clone());
            updated.scopus_author_id = updated.scopus_author_id.or(identity.scopus_author_id.clone());
            updated.birth_year = updated.birth_year.or(identity.birth_year);
            self.staged_people.insert(updated.id.clone(), updated);
        }

        Ok(ResolvedPerson {
            id: existing.id,
            created: false,
            fill,
            conflicts,
        })
    }

    /// Promote staged registrations after their batch committed.
    pub fn commit_staged(&mut self) {
        self.publications.extend(self.staged_publications.drain());
        self.organizations.extend(self.staged_organizations.drain());
        let staged: Vec<_> = self.staged_people.drain().map(|(_, p)| p).collect();
        for person in staged {
            self.remember(person);
        }
    }

    /// Forget staged registrations after their batch failed.
    pub fn discard_staged(&mut self) {
        self.staged_publications.clear();
        self.staged_organizations.clear();
        self.staged_people.clear();
    }

    fn remember(&mut self, person: PersonIdentity) {
        for key in PersonKey::all_for(&person, self.display_name_fallback) {
            self.person_keys
                .entry(key)
                .or_default()
                .insert(person.id.clone());
        }
        self.people.insert(person.id.clone(), person);
    }

    /// In-memory matches for a key, staged state taking precedence. Sorted by id.
    fn lookup(&self, key: &PersonKey) -> Vec<PersonIdentity> {
        let mut ids: BTreeSet<&str> = self
            .person_keys
            .get(key)
            .map(|ids| ids.iter().map(String::as_str).collect())
            .unwrap_or_default();
        for person in self.staged_people.values() {
            if PersonKey::all_for(person, self.display_name_fallback).contains(key) {
                ids.insert(person.id.as_str());
            }
        }
        ids.into_iter()
            .filter_map(|id| self.staged_people.get(id).or_else(|| self.people.get(id)))
            .cloned()
            .collect()
    }

    async fn probe(
        &mut self,
        store: &dyn GraphStore,
        key: &PersonKey,
    ) -> Result<Vec<PersonIdentity>, StoreError> {
        self.store_lookups += 1;
        let mut found = store.find_person(key).await?;
        found.sort_by(|a, b| a.id.cmp(&b.id));
        for person in &found {
            debug!(id = %person.id, tier = key.tier(), "Found person created outside this run");
            self.remember(person.clone());
        }
        Ok(found)
    }
}

/// Reason a weaker-tier match must not be merged, if any.
fn contradiction(key: &PersonKey, existing: &PersonIdentity, candidate: &PersonIdentity) -> Option<String> {
    let differs = |a: &Option<String>, b: &Option<String>| matches!((a, b), (Some(x), Some(y)) if x != y);
    match key {
        PersonKey::Id(_) => None,
        PersonKey::Orcid(_) => None,
        PersonKey::Scopus(_) => differs(&existing.orcid, &candidate.orcid)
            .then(|| "different ORCID".to_string()),
        PersonKey::NameYear { .. } | PersonKey::DisplayName(_) => {
            if differs(&existing.orcid, &candidate.orcid) {
                Some("different ORCID".to_string())
            } else if differs(&existing.scopus_author_id, &candidate.scopus_author_id) {
                Some("different Scopus author id".to_string())
            } else if matches!((existing.birth_year, candidate.birth_year), (Some(a), Some(b)) if a != b) {
                Some("different birth year".to_string())
            } else {
                None
            }
        }
    }
}

fn identifier_fill(existing: &PersonIdentity, candidate: &PersonIdentity) -> Option<NodeWrite> {
    let orcid = candidate.orcid.clone().filter(|_| existing.orcid.is_none());
    let scopus_author_id = candidate
        .scopus_author_id
        .clone()
        .filter(|_| existing.scopus_author_id.is_none());
    let birth_year = candidate.birth_year.filter(|_| existing.birth_year.is_none());
    if orcid.is_none() && scopus_author_id.is_none() && birth_year.is_none() {
        return None;
    }
    Some(NodeWrite::PersonIdentifiers {
        id: existing.id.clone(),
        orcid,
        scopus_author_id,
        birth_year,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGraphStore;

    const ORCID_A: &str = "0000-0002-1825-0097";
    const ORCID_B: &str = "0000-0001-5109-3700";

    fn person(id: &str, name: &str) -> Person {
        let mut p = Person::new(id, name);
        let mut parts = name.split(' ');
        p.first_name = parts.next().map(str::to_string);
        p.last_name = parts.next().map(str::to_string);
        p
    }

    #[tokio::test]
    async fn exact_id_match_is_not_created() {
        let store = MemoryGraphStore::new();
        store.insert_person(person("p1", "Ada Lovelace"));
        let mut index = DedupIndex::bootstrap(&store, true).await.unwrap();

        let resolved = index.resolve_person(&store, &person("p1", "Ada Lovelace")).await.unwrap();
        assert_eq!(resolved.id, "p1");
        assert!(!resolved.created);
        assert!(resolved.conflicts.is_empty());
    }

    #[tokio::test]
    async fn orcid_match_wins_over_new_source_id() {
        let store = MemoryGraphStore::new();
        let mut existing = person("p1", "Ada Lovelace");
        existing.orcid = Some(ORCID_A.into());
        store.insert_person(existing);
        let mut index = DedupIndex::bootstrap(&store, true).await.unwrap();

        let mut candidate = person("p9", "A. Lovelace");
        candidate.orcid = Some(ORCID_A.into());
        let resolved = index.resolve_person(&store, &candidate).await.unwrap();
        assert_eq!(resolved.id, "p1");
        assert!(!resolved.created);
    }

    #[tokio::test]
    async fn conflicting_orcid_blocks_name_merge() {
        let store = MemoryGraphStore::new();
        let mut existing = person("p1", "Ada Lovelace");
        existing.orcid = Some(ORCID_A.into());
        existing.birth_year = Some(1985);
        store.insert_person(existing);
        let mut index = DedupIndex::bootstrap(&store, true).await.unwrap();

        let mut candidate = person("p2", "Ada Lovelace");
        candidate.orcid = Some(ORCID_B.into());
        candidate.birth_year = Some(1985);
        let resolved = index.resolve_person(&store, &candidate).await.unwrap();
        assert_eq!(resolved.id, "p2");
        assert!(resolved.created);
        // Name+year and display name both hit p1 and both are refused
        assert_eq!(resolved.conflicts.len(), 2);
        assert!(resolved.conflicts.iter().all(|c| c.reason == "different ORCID"));
    }

    #[tokio::test]
    async fn name_match_fills_missing_identifiers() {
        let store = MemoryGraphStore::new();
        let mut existing = person("p1", "Ada Lovelace");
        existing.birth_year = Some(1985);
        store.insert_person(existing);
        let mut index = DedupIndex::bootstrap(&store, true).await.unwrap();

        let mut candidate = person("p2", "Ada Lovelace");
        candidate.birth_year = Some(1985);
        candidate.orcid = Some(ORCID_A.into());
        let resolved = index.resolve_person(&store, &candidate).await.unwrap();
        assert_eq!(resolved.id, "p1");
        assert_eq!(
            resolved.fill,
            Some(NodeWrite::PersonIdentifiers {
                id: "p1".into(),
                orcid: Some(ORCID_A.into()),
                scopus_author_id: None,
                birth_year: None,
            })
        );

        // After commit the ORCID resolves directly
        index.commit_staged();
        let mut again = person("p3", "Someone Else");
        again.orcid = Some(ORCID_A.into());
        assert_eq!(index.resolve_person(&store, &again).await.unwrap().id, "p1");
    }

    #[tokio::test]
    async fn tier_disagreement_is_reported() {
        let store = MemoryGraphStore::new();
        let mut by_orcid = person("p1", "Ada Lovelace");
        by_orcid.orcid = Some(ORCID_A.into());
        store.insert_person(by_orcid);
        let mut by_scopus = person("p2", "Ada King");
        by_scopus.scopus_author_id = Some("777".into());
        store.insert_person(by_scopus);
        let mut index = DedupIndex::bootstrap(&store, true).await.unwrap();

        let mut candidate = person("p3", "Ada Lovelace");
        candidate.orcid = Some(ORCID_A.into());
        candidate.scopus_author_id = Some("777".into());
        let resolved = index.resolve_person(&store, &candidate).await.unwrap();
        assert_eq!(resolved.id, "p1");
        assert_eq!(resolved.conflicts.len(), 1);
        assert_eq!(resolved.conflicts[0].existing_id, "p2");
        assert_eq!(resolved.conflicts[0].tier, "scopus_author_id");
    }

    #[tokio::test]
    async fn staged_people_are_visible_then_discarded() {
        let store = MemoryGraphStore::new();
        let mut index = DedupIndex::bootstrap(&store, true).await.unwrap();

        let first = index.resolve_person(&store, &person("p1", "Ada Lovelace")).await.unwrap();
        assert!(first.created);
        // Same display name later in the same batch resolves to the staged node
        let second = index.resolve_person(&store, &person("p2", "Ada Lovelace")).await.unwrap();
        assert_eq!(second.id, "p1");

        index.discard_staged();
        assert!(!index.has_staged());
        let third = index.resolve_person(&store, &person("p2", "Ada Lovelace")).await.unwrap();
        assert!(third.created);
        assert_eq!(third.id, "p2");
    }

    #[tokio::test]
    async fn display_name_fallback_can_be_disabled() {
        let store = MemoryGraphStore::new();
        store.insert_person(Person::new("p1", "Ada Lovelace"));
        let mut index = DedupIndex::bootstrap(&store, false).await.unwrap();
        let resolved = index
            .resolve_person(&store, &Person::new("p2", "Ada Lovelace"))
            .await
            .unwrap();
        assert!(resolved.created);
    }

    #[tokio::test]
    async fn point_lookup_finds_nodes_created_after_snapshot() {
        let store = MemoryGraphStore::new();
        let mut index = DedupIndex::bootstrap(&store, true).await.unwrap();
        store.insert_organization(crate::models::Organization::new("o1", "Org"));

        assert!(index
            .node_exists(&store, EntityKind::Organization, "o1")
            .await
            .unwrap());
        assert!(!index
            .node_exists(&store, EntityKind::Publication, "missing")
            .await
            .unwrap());
        assert_eq!(index.store_lookups(), 2);

        // Cached after the first hit
        index
            .node_exists(&store, EntityKind::Organization, "o1")
            .await
            .unwrap();
        assert_eq!(index.store_lookups(), 2);
    }

    #[tokio::test]
    async fn staged_nodes_commit() {
        let store = MemoryGraphStore::new();
        let mut index = DedupIndex::bootstrap(&store, true).await.unwrap();
        index.stage(EntityKind::Publication, "pub1");
        assert!(index.node_exists(&store, EntityKind::Publication, "pub1").await.unwrap());
        index.commit_staged();
        assert_eq!(index.len(EntityKind::Publication), 1);
        assert!(!index.has_staged());
    }
}
