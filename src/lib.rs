//! Pubgraph: incremental loader from bibliographic search-index exports into Neo4j
//!
//! An export is a large (optionally BZ2-compressed) file of publication records.
//! Each record is normalized into publications, people, organizations and the
//! relationships between them, then merged into a property graph in batches:
//!
//! 1. **Read** -- Stream records with a stable offset (NDJSON, a JSON array or a
//!    search-engine hits export)
//! 2. **Normalize** -- Validate required fields, map types, split author and
//!    affiliation data, apply the affiliation policy
//! 3. **Deduplicate** -- Resolve every entity against an identity index seeded from
//!    the store; people are matched by id, ORCID, Scopus id, name plus birth year and
//!    finally display name
//! 4. **Write** -- Apply each batch as one transaction with bounded retry
//! 5. **Checkpoint** -- Persist the offset and counters so an interrupted run resumes
//!    where it stopped
//!
//! # Guarantees
//!
//! - **Idempotent** -- Loading the same export twice creates nothing the second time
//! - **Resumable** -- `k` batches then a restart produce the same graph as one run
//! - **Atomic batches** -- A batch is either fully in the graph or fully reported as failed
//! - **Acyclic hierarchy** -- PART_OF edges that would close a cycle are refused
//!
//! # Key Modules
//!
//! - [`source`] -- Streaming record reader with BZ2 decompression and format detection
//! - [`normalize`] -- Raw record to [`models::NormalizedRecord`]
//! - [`dedup`] -- Identity index and person resolution
//! - [`hierarchy`] -- PART_OF cycle guard and deferred edges
//! - [`writer`] -- Batch preparation and retrying commit
//! - [`loader`] -- The batch loop
//! - [`store`] -- [`store::GraphStore`] seam, with [`neo4j`] and [`memory`] backends
//! - [`checkpoint`] -- Progress persistence
//! - [`stats`] -- Atomic counters for the run summary
//! - [`config`] -- Defaults and loader configuration
//!
//! # Example Usage
//!
//! ```bash
//! # Load an export, checkpointing every 5 batches
//! pubgraph load -i research_publications.json.bz2
//!
//! # Load at most 10 batches, then resume later
//! pubgraph load -i export.jsonl --max-batches 10
//!
//! # Show the saved checkpoint
//! pubgraph status
//! ```

pub mod checkpoint;
pub mod config;
pub mod dedup;
pub mod error;
pub mod hierarchy;
pub mod loader;
pub mod memory;
pub mod models;
pub mod neo4j;
pub mod normalize;
pub mod source;
pub mod stats;
pub mod store;
pub mod writer;
