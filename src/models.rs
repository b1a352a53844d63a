use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Publication,
    Person,
    Organization,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [
        EntityKind::Publication,
        EntityKind::Person,
        EntityKind::Organization,
    ];

    /// Node label in the graph
    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Publication => "Publication",
            EntityKind::Person => "Person",
            EntityKind::Organization => "Organization",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationType {
    Article,
    Book,
    Conference,
    Thesis,
}

impl PublicationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublicationType::Article => "article",
            PublicationType::Book => "book",
            PublicationType::Conference => "conference",
            PublicationType::Thesis => "thesis",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub id: String,
    pub title: String,
    pub year: i32,
    pub publication_type: PublicationType,
    pub abstract_text: Option<String>,
    pub doi: Option<String>,
    pub language: Option<String>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Person {
    pub id: String,
    pub display_name: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub birth_year: Option<i32>,
    pub orcid: Option<String>,
    pub scopus_author_id: Option<String>,
}

impl Person {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            first_name: None,
            last_name: None,
            birth_year: None,
            orcid: None,
            scopus_author_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrganizationType {
    Academic,
    ResearchInstitute,
    Administrative,
}

impl OrganizationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrganizationType::Academic => "academic",
            OrganizationType::ResearchInstitute => "research_institute",
            OrganizationType::Administrative => "administrative",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrganizationLevel {
    University,
    Department,
    Unit,
}

impl OrganizationLevel {
    pub fn from_depth(depth: i64) -> Option<Self> {
        match depth {
            0 => Some(OrganizationLevel::University),
            1 => Some(OrganizationLevel::Department),
            d if d >= 2 => Some(OrganizationLevel::Unit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrganizationLevel::University => "university",
            OrganizationLevel::Department => "department",
            OrganizationLevel::Unit => "unit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Organization {
    pub id: String,
    pub name_eng: String,
    pub name_swe: Option<String>,
    pub organization_type: OrganizationType,
    pub level: Option<OrganizationLevel>,
}

impl Organization {
    pub fn new(id: impl Into<String>, name_eng: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name_eng: name_eng.into(),
            name_swe: None,
            organization_type: OrganizationType::Academic,
            level: None,
        }
    }
}

/// One author slot on a publication. `position` is the 0-based source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorship {
    pub position: u32,
    pub person: Person,
    pub role: String,
    pub organization_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AffiliationKind {
    /// AFFILIATED_WITH
    Historical,
    /// CURRENTLY_AFFILIATED_WITH
    Current,
}

impl AffiliationKind {
    pub fn rel_type(&self) -> &'static str {
        match self {
            AffiliationKind::Historical => "AFFILIATED_WITH",
            AffiliationKind::Current => "CURRENTLY_AFFILIATED_WITH",
        }
    }
}

/// Person → Organization edge. `person_id` is the source id until the writer
/// resolves it to the canonical node id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Affiliation {
    pub person_id: String,
    pub organization_id: String,
    pub kind: AffiliationKind,
    pub title: Option<String>,
    pub priority: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExclusionReason {
    /// End year at or beyond the "never closed" sentinel
    OpenEndSentinel { end_year: i32 },
    TooShort { months: u32 },
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionReason::OpenEndSentinel { end_year } => {
                write!(f, "end year {end_year} is the open-ended sentinel")
            }
            ExclusionReason::TooShort { months } => {
                write!(f, "duration of {months} month(s) is below the minimum")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedAffiliation {
    pub person_id: String,
    pub organization_id: String,
    pub reason: ExclusionReason,
}

/// Organization child → parent edge (PART_OF)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyEdge {
    pub child_id: String,
    pub parent_id: String,
}

impl HierarchyEdge {
    pub fn new(child_id: impl Into<String>, parent_id: impl Into<String>) -> Self {
        Self {
            child_id: child_id.into(),
            parent_id: parent_id.into(),
        }
    }
}

/// Everything extracted from one source record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRecord {
    pub publication: Publication,
    pub authors: Vec<Authorship>,
    /// Deduplicated by id, first-seen order
    pub organizations: Vec<Organization>,
    pub hierarchy: Vec<HierarchyEdge>,
    pub affiliations: Vec<Affiliation>,
    pub excluded_affiliations: Vec<ExcludedAffiliation>,
    /// Author entries dropped for lacking an id or a name
    pub skipped_authors: u32,
}
