use crate::config;
use crate::error::StoreError;
use crate::models::{AffiliationKind, EntityKind};
use crate::store::{GraphStore, NodeWrite, PersonIdentity, PersonKey, RelationshipWrite, WriteSet};
use async_trait::async_trait;
use chrono::NaiveDate;
use neo4rs::{query, Graph, Query, Row};
use tracing::{debug, info};

/// Cypher templates. Every write is create-or-merge so replaying a batch is harmless.
const CYPHER_MERGE_PUBLICATION: &str = r#"MERGE (p:Publication {id: $id})
ON CREATE SET p.title = $title, p.year = $year, p.publicationType = $publicationType,
    p.abstract = $abstract, p.doi = $doi, p.language = $language, p.keywords = $keywords"#;

const CYPHER_MERGE_PERSON: &str = r#"MERGE (p:Person {id: $id})
ON CREATE SET p.displayName = $displayName, p.firstName = $firstName, p.lastName = $lastName,
    p.birthYear = $birthYear, p.orcid = $orcid, p.scopusAuthorId = $scopusAuthorId"#;

const CYPHER_MERGE_ORGANIZATION: &str = r#"MERGE (o:Organization {id: $id})
ON CREATE SET o.nameEng = $nameEng, o.nameSwe = $nameSwe, o.type = $type, o.level = $level"#;

const CYPHER_FILL_PERSON_IDENTIFIERS: &str = r#"MATCH (p:Person {id: $id})
SET p.orcid = coalesce(p.orcid, $orcid),
    p.scopusAuthorId = coalesce(p.scopusAuthorId, $scopusAuthorId),
    p.birthYear = coalesce(p.birthYear, $birthYear)"#;

const CYPHER_MERGE_AUTHORED: &str = r#"MATCH (p:Person {id: $personId}), (pub:Publication {id: $publicationId})
MERGE (p)-[r:AUTHORED {order: $order}]->(pub)
ON CREATE SET r.role = $role"#;

const CYPHER_MERGE_AFFILIATED: &str = r#"MATCH (p:Person {id: $personId}), (o:Organization {id: $organizationId})
MERGE (p)-[r:AFFILIATED_WITH]->(o)
ON CREATE SET r.title = $title, r.priority = $priority,
    r.startDate = CASE WHEN $startDate IS NULL THEN null ELSE date($startDate) END,
    r.endDate = CASE WHEN $endDate IS NULL THEN null ELSE date($endDate) END"#;

const CYPHER_MERGE_CURRENTLY_AFFILIATED: &str = r#"MATCH (p:Person {id: $personId}), (o:Organization {id: $organizationId})
MERGE (p)-[r:CURRENTLY_AFFILIATED_WITH]->(o)
ON CREATE SET r.title = $title, r.priority = $priority,
    r.startDate = CASE WHEN $startDate IS NULL THEN null ELSE date($startDate) END,
    r.endDate = CASE WHEN $endDate IS NULL THEN null ELSE date($endDate) END"#;

const CYPHER_MERGE_PART_OF: &str = r#"MATCH (c:Organization {id: $childId}), (p:Organization {id: $parentId})
MERGE (c)-[:PART_OF]->(p)"#;

const PERSON_RETURN: &str = "RETURN p.id AS id, p.displayName AS displayName, \
    p.firstName AS firstName, p.lastName AS lastName, p.birthYear AS birthYear, \
    p.orcid AS orcid, p.scopusAuthorId AS scopusAuthorId";

/// Bolt-backed [`GraphStore`]. Each batch runs in one explicit transaction.
pub struct Neo4jStore {
    graph: Graph,
    uri: String,
}

impl Neo4jStore {
    /// Connect and run a test query, retrying while the server comes up.
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self, StoreError> {
        let max_retries = config::CONNECT_MAX_RETRIES;
        let delay = tokio::time::Duration::from_secs(config::CONNECT_RETRY_DELAY_SECS);

        for attempt in 1..=max_retries {
            match Graph::new(uri, user, password) {
                Ok(graph) => match graph.run(query("RETURN 1;")).await {
                    Ok(_) => {
                        info!(uri, "Connected to Neo4j");
                        return Ok(Self {
                            graph,
                            uri: uri.to_string(),
                        });
                    }
                    Err(e) if attempt < max_retries => {
                        info!(attempt, "Connection test failed, retrying: {e}");
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        return Err(StoreError::Unavailable(format!(
                            "cannot connect to Neo4j at {uri} after {max_retries} attempts: {e}"
                        )));
                    }
                },
                Err(e) if attempt < max_retries => {
                    info!(attempt, "Cannot connect to Neo4j at {uri}, retrying: {e}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(StoreError::Unavailable(format!(
                        "cannot connect to Neo4j at {uri} after {max_retries} attempts: {e}"
                    )));
                }
            }
        }

        Err(StoreError::Unavailable(format!(
            "cannot connect to Neo4j at {uri} after {max_retries} attempts"
        )))
    }

    /// A failed statement is a rejection if the server still answers, an outage otherwise.
    async fn classify(&self, e: neo4rs::Error) -> StoreError {
        let message = e.to_string();
        match self.graph.run(query("RETURN 1;")).await {
            Ok(_) => StoreError::Rejected(message),
            Err(_) => StoreError::Unavailable(message),
        }
    }

    async fn fetch(&self, q: Query) -> Result<Vec<Row>, StoreError> {
        let mut stream = match self.graph.execute(q).await {
            Ok(stream) => stream,
            Err(e) => return Err(self.classify(e).await),
        };
        let mut rows = Vec::new();
        loop {
            match stream.next().await {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => return Ok(rows),
                Err(e) => return Err(self.classify(e).await),
            }
        }
    }
}

fn date_param(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

fn affiliation_cypher(kind: AffiliationKind) -> &'static str {
    match kind {
        AffiliationKind::Historical => CYPHER_MERGE_AFFILIATED,
        AffiliationKind::Current => CYPHER_MERGE_CURRENTLY_AFFILIATED,
    }
}

fn node_query(node: &NodeWrite) -> Query {
    match node {
        NodeWrite::Publication(p) => query(CYPHER_MERGE_PUBLICATION)
            .param("id", p.id.as_str())
            .param("title", p.title.as_str())
            .param("year", i64::from(p.year))
            .param("publicationType", p.publication_type.as_str())
            .param("abstract", p.abstract_text.clone())
            .param("doi", p.doi.clone())
            .param("language", p.language.clone())
            .param("keywords", p.keywords.clone()),
        NodeWrite::Person(p) => query(CYPHER_MERGE_PERSON)
            .param("id", p.id.as_str())
            .param("displayName", p.display_name.as_str())
            .param("firstName", p.first_name.clone())
            .param("lastName", p.last_name.clone())
            .param("birthYear", p.birth_year.map(i64::from))
            .param("orcid", p.orcid.clone())
            .param("scopusAuthorId", p.scopus_author_id.clone()),
        NodeWrite::Organization(o) => query(CYPHER_MERGE_ORGANIZATION)
            .param("id", o.id.as_str())
            .param("nameEng", o.name_eng.as_str())
            .param("nameSwe", o.name_swe.clone())
            .param("type", o.organization_type.as_str())
            .param("level", o.level.map(|l| l.as_str().to_string())),
        NodeWrite::PersonIdentifiers {
            id,
            orcid,
            scopus_author_id,
            birth_year,
        } => query(CYPHER_FILL_PERSON_IDENTIFIERS)
            .param("id", id.as_str())
            .param("orcid", orcid.clone())
            .param("scopusAuthorId", scopus_author_id.clone())
            .param("birthYear", birth_year.map(i64::from)),
    }
}

fn relationship_query(rel: &RelationshipWrite) -> Query {
    match rel {
        RelationshipWrite::Authored {
            person_id,
            publication_id,
            order,
            role,
        } => query(CYPHER_MERGE_AUTHORED)
            .param("personId", person_id.as_str())
            .param("publicationId", publication_id.as_str())
            .param("order", i64::from(*order))
            .param("role", role.as_str()),
        RelationshipWrite::Affiliation(a) => query(affiliation_cypher(a.kind))
            .param("personId", a.person_id.as_str())
            .param("organizationId", a.organization_id.as_str())
            .param("title", a.title.clone())
            .param("priority", a.priority.clone())
            .param("startDate", date_param(a.start_date))
            .param("endDate", date_param(a.end_date)),
        RelationshipWrite::PartOf { child_id, parent_id } => query(CYPHER_MERGE_PART_OF)
            .param("childId", child_id.as_str())
            .param("parentId", parent_id.as_str()),
    }
}

fn person_query(key: &PersonKey) -> Query {
    match key {
        PersonKey::Id(id) => {
            query(&format!("MATCH (p:Person {{id: $value}}) {PERSON_RETURN}")).param("value", id.as_str())
        }
        PersonKey::Orcid(orcid) => query(&format!("MATCH (p:Person {{orcid: $value}}) {PERSON_RETURN}"))
            .param("value", orcid.as_str()),
        PersonKey::Scopus(scopus) => {
            query(&format!("MATCH (p:Person {{scopusAuthorId: $value}}) {PERSON_RETURN}"))
                .param("value", scopus.as_str())
        }
        PersonKey::NameYear {
            first,
            last,
            birth_year,
        } => query(&format!(
            "MATCH (p:Person) WHERE toLower(p.firstName) = $first \
             AND toLower(p.lastName) = $last AND p.birthYear = $birthYear {PERSON_RETURN}"
        ))
        .param("first", first.as_str())
        .param("last", last.as_str())
        .param("birthYear", i64::from(*birth_year)),
        PersonKey::DisplayName(name) => query(&format!(
            "MATCH (p:Person) WHERE toLower(p.displayName) = $value {PERSON_RETURN}"
        ))
        .param("value", name.as_str()),
    }
}

fn person_from_row(row: &Row) -> Option<PersonIdentity> {
    let id: String = row.get("id").ok()?;
    Some(PersonIdentity {
        id,
        display_name: row.get("displayName").unwrap_or_default(),
        first_name: row.get::<Option<String>>("firstName").ok().flatten(),
        last_name: row.get::<Option<String>>("lastName").ok().flatten(),
        birth_year: row
            .get::<Option<i64>>("birthYear")
            .ok()
            .flatten()
            .and_then(|y| i32::try_from(y).ok()),
        orcid: row.get::<Option<String>>("orcid").ok().flatten(),
        scopus_author_id: row.get::<Option<String>>("scopusAuthorId").ok().flatten(),
    })
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.graph
            .run(query("RETURN 1;"))
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn existing_ids(&self, kind: EntityKind) -> Result<Vec<String>, StoreError> {
        let cypher = format!("MATCH (n:{}) RETURN n.id AS id", kind.label());
        let rows = self.fetch(query(&cypher)).await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get::<String>("id").ok())
            .collect())
    }

    async fn existing_people(&self) -> Result<Vec<PersonIdentity>, StoreError> {
        let cypher = format!("MATCH (p:Person) {PERSON_RETURN}");
        let rows = self.fetch(query(&cypher)).await?;
        Ok(rows.iter().filter_map(person_from_row).collect())
    }

    async fn node_exists(&self, kind: EntityKind, id: &str) -> Result<bool, StoreError> {
        let cypher = format!("MATCH (n:{} {{id: $id}}) RETURN count(n) AS c", kind.label());
        let rows = self.fetch(query(&cypher).param("id", id)).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get::<i64>("c").ok())
            .unwrap_or(0)
            > 0)
    }

    async fn find_person(&self, key: &PersonKey) -> Result<Vec<PersonIdentity>, StoreError> {
        let rows = self.fetch(person_query(key)).await?;
        Ok(rows.iter().filter_map(person_from_row).collect())
    }

    async fn commit(&self, writes: &WriteSet) -> Result<(), StoreError> {
        let mut txn = match self.graph.start_txn().await {
            Ok(txn) => txn,
            Err(e) => return Err(self.classify(e).await),
        };

        let queries = writes
            .nodes
            .iter()
            .map(node_query)
            .chain(writes.relationships.iter().map(relationship_query));
        for q in queries {
            if let Err(e) = txn.run(q).await {
                if let Err(rollback) = txn.rollback().await {
                    debug!(error = %rollback, "Rollback failed");
                }
                return Err(self.classify(e).await);
            }
        }

        match txn.commit().await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.classify(e).await),
        }
    }

    async fn close(&self) -> Result<(), StoreError> {
        // The pool closes its connections when the graph handle is dropped
        debug!(uri = %self.uri, "Releasing Neo4j connection");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affiliation_templates_match_kind() {
        assert!(affiliation_cypher(AffiliationKind::Historical).contains("[r:AFFILIATED_WITH]"));
        assert!(affiliation_cypher(AffiliationKind::Current)
            .contains("[r:CURRENTLY_AFFILIATED_WITH]"));
    }

    #[test]
    fn writes_never_create_blindly() {
        for cypher in [
            CYPHER_MERGE_PUBLICATION,
            CYPHER_MERGE_PERSON,
            CYPHER_MERGE_ORGANIZATION,
            CYPHER_MERGE_AUTHORED,
            CYPHER_MERGE_AFFILIATED,
            CYPHER_MERGE_CURRENTLY_AFFILIATED,
            CYPHER_MERGE_PART_OF,
        ] {
            assert!(cypher.contains("MERGE"));
            assert!(!cypher.contains("CREATE ("));
        }
    }

    #[test]
    fn authored_is_keyed_by_order() {
        assert!(CYPHER_MERGE_AUTHORED.contains("AUTHORED {order: $order}"));
    }

    #[test]
    fn identifier_fill_never_overwrites() {
        assert_eq!(CYPHER_FILL_PERSON_IDENTIFIERS.matches("coalesce(p.").count(), 3);
    }

    #[test]
    fn dates_are_iso_formatted() {
        let date = NaiveDate::from_ymd_opt(2020, 3, 7);
        assert_eq!(date_param(date).as_deref(), Some("2020-03-07"));
        assert_eq!(date_param(None), None);
    }
}
