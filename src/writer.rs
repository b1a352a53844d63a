use crate::checkpoint::EntityCounters;
use crate::config::RetryPolicy;
use crate::dedup::DedupIndex;
use crate::error::{DuplicateConflict, StoreError};
use crate::hierarchy::{EdgeDecision, HierarchyGuard};
use crate::models::{EntityKind, ExcludedAffiliation, HierarchyEdge, NormalizedRecord};
use crate::store::{GraphStore, NodeWrite, RelationshipWrite, WriteSet};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// A batch turned into store writes, plus what was learned while preparing it.
#[derive(Debug, Default)]
pub struct PreparedBatch {
    pub writes: WriteSet,
    pub created: EntityCounters,
    pub merged: EntityCounters,
    /// (record offset, conflict)
    pub conflicts: Vec<(u64, DuplicateConflict)>,
    pub cycles: Vec<(u64, HierarchyEdge)>,
    pub excluded: Vec<(u64, ExcludedAffiliation)>,
    pub skipped_authors: u64,
    pub deferred_edges: u64,
}

#[derive(Debug, Error)]
#[error("batch write failed after {attempts} attempt(s): {error}")]
pub struct WriteFailure {
    pub attempts: u32,
    pub error: StoreError,
}

impl WriteFailure {
    /// The store is gone rather than refusing this batch
    pub fn is_fatal(&self) -> bool {
        self.error.is_unavailable()
    }
}

pub struct BatchWriter {
    retry: RetryPolicy,
}

impl BatchWriter {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    /// Prepare and commit one batch, retrying the whole batch on failure.
    ///
    /// Dedup and hierarchy registrations become permanent only when the commit
    /// succeeds. After the last failed attempt nothing of the batch is kept.
    pub async fn write(
        &self,
        store: &dyn GraphStore,
        dedup: &mut DedupIndex,
        hierarchy: &mut HierarchyGuard,
        records: &[(u64, NormalizedRecord)],
    ) -> Result<PreparedBatch, WriteFailure> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match prepare(store, dedup, hierarchy, records).await {
                Ok(batch) if batch.writes.is_empty() => Ok(batch),
                Ok(batch) => store.commit(&batch.writes).await.map(|()| batch),
                Err(e) => Err(e),
            };

            match result {
                Ok(batch) => {
                    dedup.commit_staged();
                    hierarchy.commit_staged();
                    debug!(
                        attempt,
                        writes = batch.writes.len(),
                        "Batch committed"
                    );
                    return Ok(batch);
                }
                Err(error) => {
                    dedup.discard_staged();
                    hierarchy.discard_staged();
                    if attempt >= self.retry.max_attempts {
                        return Err(WriteFailure {
                            attempts: attempt,
                            error,
                        });
                    }
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Batch write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Resolve identities and build the write set for a batch.
///
/// Relationships count as created when their publication is new in this batch
/// and as merged otherwise. Authorship of an already stored publication is left
/// untouched since it was written together with the publication.
pub async fn prepare(
    store: &dyn GraphStore,
    dedup: &mut DedupIndex,
    hierarchy: &mut HierarchyGuard,
    records: &[(u64, NormalizedRecord)],
) -> Result<PreparedBatch, StoreError> {
    let mut batch = PreparedBatch::default();

    for (offset, record) in records {
        let offset = *offset;
        let publication = &record.publication;
        let publication_is_new = !dedup
            .node_exists(store, EntityKind::Publication, &publication.id)
            .await?;
        let mut rels = 0u64;

        if publication_is_new {
            batch
                .writes
                .nodes
                .push(NodeWrite::Publication(publication.clone()));
            dedup.stage(EntityKind::Publication, &publication.id);
            batch.created.publications += 1;
        } else {
            debug!(id = %publication.id, "Publication already loaded");
            batch.merged.publications += 1;
        }

        for organization in &record.organizations {
            if dedup
                .node_exists(store, EntityKind::Organization, &organization.id)
                .await?
            {
                batch.merged.organizations += 1;
            } else {
                batch
                    .writes
                    .nodes
                    .push(NodeWrite::Organization(organization.clone()));
                dedup.stage(EntityKind::Organization, &organization.id);
                batch.created.organizations += 1;
            }

            for edge in hierarchy.release(&organization.id) {
                debug!(child = %edge.child_id, parent = %edge.parent_id, "Resolving deferred PART_OF");
                rels += consider_edge(&mut batch, hierarchy, offset, &edge, true);
            }
        }

        for edge in &record.hierarchy {
            let parent_known = dedup
                .node_exists(store, EntityKind::Organization, &edge.parent_id)
                .await?;
            rels += consider_edge(&mut batch, hierarchy, offset, edge, parent_known);
        }

        let mut resolved_ids: FxHashMap<&str, String> = FxHashMap::default();
        for author in &record.authors {
            let resolved = dedup.resolve_person(store, &author.person).await?;
            if resolved.created {
                batch
                    .writes
                    .nodes
                    .push(NodeWrite::Person(author.person.clone()));
                batch.created.persons += 1;
            } else {
                batch.merged.persons += 1;
                if let Some(fill) = resolved.fill {
                    batch.writes.nodes.push(fill);
                }
            }
            for conflict in resolved.conflicts {
                batch.conflicts.push((offset, conflict));
            }

            if publication_is_new {
                batch.writes.relationships.push(RelationshipWrite::Authored {
                    person_id: resolved.id.clone(),
                    publication_id: publication.id.clone(),
                    order: author.position,
                    role: author.role.clone(),
                });
                rels += 1;
            }
            resolved_ids.insert(author.person.id.as_str(), resolved.id);
        }

        for affiliation in &record.affiliations {
            let Some(person_id) = resolved_ids.get(affiliation.person_id.as_str()) else {
                continue;
            };
            let mut affiliation = affiliation.clone();
            affiliation.person_id = person_id.clone();
            batch
                .writes
                .relationships
                .push(RelationshipWrite::Affiliation(affiliation));
            rels += 1;
        }

        for excluded in &record.excluded_affiliations {
            debug!(
                person = %excluded.person_id,
                organization = %excluded.organization_id,
                reason = %excluded.reason,
                "Affiliation excluded"
            );
            batch.excluded.push((offset, excluded.clone()));
        }

        batch.skipped_authors += u64::from(record.skipped_authors);
        if publication_is_new {
            batch.created.relationships += rels;
        } else {
            batch.merged.relationships += rels;
        }
    }

    Ok(batch)
}

fn consider_edge(
    batch: &mut PreparedBatch,
    hierarchy: &mut HierarchyGuard,
    offset: u64,
    edge: &HierarchyEdge,
    parent_known: bool,
) -> u64 {
    match hierarchy.consider(edge, parent_known) {
        EdgeDecision::Write => {
            batch.writes.relationships.push(RelationshipWrite::PartOf {
                child_id: edge.child_id.clone(),
                parent_id: edge.parent_id.clone(),
            });
            1
        }
        EdgeDecision::Deferred => {
            batch.deferred_edges += 1;
            0
        }
        EdgeDecision::Cycle => {
            batch.cycles.push((offset, edge.clone()));
            0
        }
        EdgeDecision::Duplicate => 0,
    }
}
