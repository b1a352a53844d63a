use crate::error::StoreError;
use crate::models::{Affiliation, AffiliationKind, EntityKind, Organization, Person, Publication};
use crate::store::{GraphStore, NodeWrite, PersonIdentity, PersonKey, RelationshipWrite, WriteSet};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Graph {
    publications: BTreeMap<String, Publication>,
    persons: BTreeMap<String, Person>,
    organizations: BTreeMap<String, Organization>,
    /// (publication, order) → (person, role)
    authored: BTreeMap<(String, u32), (String, String)>,
    affiliations: BTreeMap<(String, String, AffiliationKind), Affiliation>,
    part_of: BTreeSet<(String, String)>,
}

impl Graph {
    fn contains(&self, kind: EntityKind, id: &str) -> bool {
        match kind {
            EntityKind::Publication => self.publications.contains_key(id),
            EntityKind::Person => self.persons.contains_key(id),
            EntityKind::Organization => self.organizations.contains_key(id),
        }
    }
}

/// Transactional in-process graph. Backs dry runs and the test suite.
///
/// Commits are all-or-nothing: a write set is fully validated before anything
/// is applied. Failures can be injected with [`set_unavailable`] and
/// [`reject_next_commits`].
///
/// [`set_unavailable`]: MemoryGraphStore::set_unavailable
/// [`reject_next_commits`]: MemoryGraphStore::reject_next_commits
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    graph: Mutex<Graph>,
    unavailable: AtomicBool,
    reject_next: AtomicU32,
    commits: AtomicU64,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The next `n` commits are refused while the store stays reachable.
    pub fn reject_next_commits(&self, n: u32) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn insert_person(&self, person: Person) {
        self.lock().persons.insert(person.id.clone(), person);
    }

    pub fn insert_organization(&self, organization: Organization) {
        self.lock()
            .organizations
            .insert(organization.id.clone(), organization);
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        let graph = self.lock();
        match kind {
            EntityKind::Publication => graph.publications.len(),
            EntityKind::Person => graph.persons.len(),
            EntityKind::Organization => graph.organizations.len(),
        }
    }

    pub fn relationship_count(&self) -> usize {
        let graph = self.lock();
        graph.authored.len() + graph.affiliations.len() + graph.part_of.len()
    }

    pub fn publication(&self, id: &str) -> Option<Publication> {
        self.lock().publications.get(id).cloned()
    }

    pub fn person(&self, id: &str) -> Option<Person> {
        self.lock().persons.get(id).cloned()
    }

    pub fn people(&self) -> Vec<Person> {
        self.lock().persons.values().cloned().collect()
    }

    /// `(order, person_id, role)` sorted by order
    pub fn authorship(&self, publication_id: &str) -> Vec<(u32, String, String)> {
        self.lock()
            .authored
            .iter()
            .filter(|((pub_id, _), _)| pub_id == publication_id)
            .map(|((_, order), (person, role))| (*order, person.clone(), role.clone()))
            .collect()
    }

    pub fn affiliations(&self, person_id: &str) -> Vec<Affiliation> {
        self.lock()
            .affiliations
            .iter()
            .filter(|((person, _, _), _)| person == person_id)
            .map(|(_, a)| a.clone())
            .collect()
    }

    /// `(child, parent)` pairs
    pub fn part_of(&self) -> Vec<(String, String)> {
        self.lock().part_of.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Graph> {
        // A poisoned lock only means a test panicked mid-call; the data is still usable
        self.graph.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store is offline".into()));
        }
        Ok(())
    }

    fn validate(graph: &Graph, writes: &WriteSet) -> Result<(), StoreError> {
        let mut incoming: BTreeSet<(EntityKind, &str)> = BTreeSet::new();
        for node in &writes.nodes {
            match node {
                NodeWrite::Publication(p) => {
                    incoming.insert((EntityKind::Publication, p.id.as_str()));
                }
                NodeWrite::Person(p) => {
                    incoming.insert((EntityKind::Person, p.id.as_str()));
                }
                NodeWrite::Organization(o) => {
                    incoming.insert((EntityKind::Organization, o.id.as_str()));
                }
                NodeWrite::PersonIdentifiers { .. } => {}
            }
        }
        let exists =
            |kind: EntityKind, id: &str| graph.contains(kind, id) || incoming.contains(&(kind, id));

        for node in &writes.nodes {
            if let NodeWrite::PersonIdentifiers { id, .. } = node {
                if !exists(EntityKind::Person, id) {
                    return Err(StoreError::Rejected(format!("unknown person {id}")));
                }
            }
        }

        let mut orders: BTreeMap<(&str, u32), &str> = BTreeMap::new();
        for rel in &writes.relationships {
            let (from, to) = match rel {
                RelationshipWrite::Authored {
                    person_id,
                    publication_id,
                    order,
                    ..
                } => {
                    let taken = graph
                        .authored
                        .get(&(publication_id.clone(), *order))
                        .map(|(p, _)| p.as_str())
                        .or_else(|| orders.get(&(publication_id.as_str(), *order)).copied());
                    if let Some(holder) = taken {
                        if holder != person_id.as_str() {
                            return Err(StoreError::Rejected(format!(
                                "author order {order} of {publication_id} already held by {holder}"
                            )));
                        }
                    }
                    orders.insert((publication_id.as_str(), *order), person_id.as_str());
                    (
                        (EntityKind::Person, person_id),
                        (EntityKind::Publication, publication_id),
                    )
                }
                RelationshipWrite::Affiliation(a) => (
                    (EntityKind::Person, &a.person_id),
                    (EntityKind::Organization, &a.organization_id),
                ),
                RelationshipWrite::PartOf { child_id, parent_id } => (
                    (EntityKind::Organization, child_id),
                    (EntityKind::Organization, parent_id),
                ),
            };
            for (kind, id) in [from, to] {
                if !exists(kind, id) {
                    return Err(StoreError::Rejected(format!(
                        "{} endpoint {kind} {id} does not exist",
                        rel.rel_type()
                    )));
                }
            }
        }
        Ok(())
    }

    fn apply(graph: &mut Graph, writes: &WriteSet) {
        for node in &writes.nodes {
            match node {
                NodeWrite::Publication(p) => {
                    graph.publications.entry(p.id.clone()).or_insert_with(|| p.clone());
                }
                NodeWrite::Person(p) => {
                    graph.persons.entry(p.id.clone()).or_insert_with(|| p.clone());
                }
                NodeWrite::Organization(o) => {
                    graph.organizations.entry(o.id.clone()).or_insert_with(|| o.clone());
                }
                NodeWrite::PersonIdentifiers {
                    id,
                    orcid,
                    scopus_author_id,
                    birth_year,
                } => {
                    if let Some(person) = graph.persons.get_mut(id) {
                        if person.orcid.is_none() {
                            person.orcid = orcid.clone();
                        }
                        if person.scopus_author_id.is_none() {
                            person.scopus_author_id = scopus_author_id.clone();
                        }
                        if person.birth_year.is_none() {
                            person.birth_year = *birth_year;
                        }
                    }
                }
            }
        }

        for rel in &writes.relationships {
            match rel {
                RelationshipWrite::Authored {
                    person_id,
                    publication_id,
                    order,
                    role,
                } => {
                    graph
                        .authored
                        .entry((publication_id.clone(), *order))
                        .or_insert_with(|| (person_id.clone(), role.clone()));
                }
                RelationshipWrite::Affiliation(a) => {
                    graph
                        .affiliations
                        .entry((a.person_id.clone(), a.organization_id.clone(), a.kind))
                        .or_insert_with(|| a.clone());
                }
                RelationshipWrite::PartOf { child_id, parent_id } => {
                    graph.part_of.insert((child_id.clone(), parent_id.clone()));
                }
            }
        }
    }
}

fn identity_matches(person: &Person, key: &PersonKey) -> bool {
    let lower = |v: &Option<String>| v.as_deref().map(str::to_lowercase);
    match key {
        PersonKey::Id(id) => &person.id == id,
        PersonKey::Orcid(orcid) => person.orcid.as_ref() == Some(orcid),
        PersonKey::Scopus(scopus) => person.scopus_author_id.as_ref() == Some(scopus),
        PersonKey::NameYear {
            first,
            last,
            birth_year,
        } => {
            person.birth_year == Some(*birth_year)
                && lower(&person.first_name).as_ref() == Some(first)
                && lower(&person.last_name).as_ref() == Some(last)
        }
        PersonKey::DisplayName(name) => person.display_name.to_lowercase() == *name,
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn existing_ids(&self, kind: EntityKind) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let graph = self.lock();
        let ids = match kind {
            EntityKind::Publication => graph.publications.keys().cloned().collect(),
            EntityKind::Person => graph.persons.keys().cloned().collect(),
            EntityKind::Organization => graph.organizations.keys().cloned().collect(),
        };
        Ok(ids)
    }

    async fn existing_people(&self) -> Result<Vec<PersonIdentity>, StoreError> {
        self.check_available()?;
        Ok(self.lock().persons.values().map(PersonIdentity::from).collect())
    }

    async fn node_exists(&self, kind: EntityKind, id: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.lock().contains(kind, id))
    }

    async fn find_person(&self, key: &PersonKey) -> Result<Vec<PersonIdentity>, StoreError> {
        self.check_available()?;
        Ok(self
            .lock()
            .persons
            .values()
            .filter(|p| identity_matches(p, key))
            .map(PersonIdentity::from)
            .collect())
    }

    async fn commit(&self, writes: &WriteSet) -> Result<(), StoreError> {
        self.check_available()?;
        let rejected = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(StoreError::Rejected("injected write failure".into()));
        }

        let mut graph = self.lock();
        Self::validate(&graph, writes)?;
        Self::apply(&mut graph, writes);
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PublicationType;

    fn publication(id: &str) -> Publication {
        Publication {
            id: id.to_string(),
            title: format!("Title {id}"),
            year: 2020,
            publication_type: PublicationType::Article,
            abstract_text: None,
            doi: None,
            language: None,
            keywords: Vec::new(),
        }
    }

    fn authored(person: &str, publication: &str, order: u32) -> RelationshipWrite {
        RelationshipWrite::Authored {
            person_id: person.into(),
            publication_id: publication.into(),
            order,
            role: "Author".into(),
        }
    }

    #[tokio::test]
    async fn commit_is_all_or_nothing() {
        let store = MemoryGraphStore::new();
        let writes = WriteSet {
            nodes: vec![
                NodeWrite::Publication(publication("pub1")),
                NodeWrite::Person(Person::new("p1", "One")),
            ],
            relationships: vec![authored("p1", "pub1", 0), authored("ghost", "pub1", 1)],
        };
        let err = store.commit(&writes).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(store.count(EntityKind::Publication), 0);
        assert_eq!(store.count(EntityKind::Person), 0);
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn writes_merge_instead_of_duplicating() {
        let store = MemoryGraphStore::new();
        let writes = WriteSet {
            nodes: vec![
                NodeWrite::Publication(publication("pub1")),
                NodeWrite::Person(Person::new("p1", "One")),
            ],
            relationships: vec![authored("p1", "pub1", 0)],
        };
        store.commit(&writes).await.unwrap();
        store.commit(&writes).await.unwrap();
        assert_eq!(store.count(EntityKind::Publication), 1);
        assert_eq!(store.relationship_count(), 1);
    }

    #[tokio::test]
    async fn author_order_is_unique_per_publication() {
        let store = MemoryGraphStore::new();
        store
            .commit(&WriteSet {
                nodes: vec![
                    NodeWrite::Publication(publication("pub1")),
                    NodeWrite::Person(Person::new("p1", "One")),
                    NodeWrite::Person(Person::new("p2", "Two")),
                ],
                relationships: vec![authored("p1", "pub1", 0)],
            })
            .await
            .unwrap();
        let clash = WriteSet {
            nodes: Vec::new(),
            relationships: vec![authored("p2", "pub1", 0)],
        };
        assert!(store.commit(&clash).await.is_err());
        assert_eq!(store.authorship("pub1"), vec![(0, "p1".into(), "Author".into())]);
    }

    #[tokio::test]
    async fn identifiers_fill_but_never_overwrite() {
        let store = MemoryGraphStore::new();
        let mut person = Person::new("p1", "One");
        person.orcid = Some("0000-0002-1825-0097".into());
        store.insert_person(person);

        store
            .commit(&WriteSet {
                nodes: vec![NodeWrite::PersonIdentifiers {
                    id: "p1".into(),
                    orcid: Some("0000-0001-5109-3700".into()),
                    scopus_author_id: Some("42".into()),
                    birth_year: None,
                }],
                relationships: Vec::new(),
            })
            .await
            .unwrap();

        let stored = store.person("p1").unwrap();
        assert_eq!(stored.orcid.as_deref(), Some("0000-0002-1825-0097"));
        assert_eq!(stored.scopus_author_id.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn injected_failures() {
        let store = MemoryGraphStore::new();
        store.reject_next_commits(1);
        let empty = WriteSet::default();
        assert!(matches!(
            store.commit(&empty).await,
            Err(StoreError::Rejected(_))
        ));
        assert!(store.commit(&empty).await.is_ok());

        store.set_unavailable(true);
        assert!(store.ping().await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn find_person_by_name_is_case_insensitive() {
        let store = MemoryGraphStore::new();
        let mut person = Person::new("p1", "Ada Lovelace");
        person.first_name = Some("Ada".into());
        person.last_name = Some("Lovelace".into());
        person.birth_year = Some(1985);
        store.insert_person(person);

        let found = store
            .find_person(&PersonKey::NameYear {
                first: "ada".into(),
                last: "lovelace".into(),
                birth_year: 1985,
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        let none = store
            .find_person(&PersonKey::NameYear {
                first: "ada".into(),
                last: "lovelace".into(),
                birth_year: 1986,
            })
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
