use crate::config::{AFFILIATION_OPEN_END_YEAR, DEFAULT_MIN_AFFILIATION_MONTHS};
use crate::error::ValidationError;
use crate::models::{
    Affiliation, AffiliationKind, Authorship, ExcludedAffiliation, ExclusionReason, HierarchyEdge,
    NormalizedRecord, Organization, OrganizationLevel, OrganizationType, Person, Publication,
    PublicationType,
};
use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashSet;
use serde_json::{Map, Value};
use tracing::debug;

static ORCID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{4}-\d{4}-\d{3}[\dX]$").unwrap());

const LANGUAGES: &[&str] = &["en", "sv", "de", "fr", "es"];

const DEFAULT_ROLE: &str = "Author";

#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    /// Reference date for deciding whether an affiliation is still current
    pub as_of: NaiveDate,
    pub min_affiliation_months: u32,
}

impl NormalizeOptions {
    pub fn new(as_of: NaiveDate) -> Self {
        Self {
            as_of,
            min_affiliation_months: DEFAULT_MIN_AFFILIATION_MONTHS,
        }
    }
}

/// Maps one raw export record to canonical entities.
///
/// Accepts both bare records and search hits (`{"_id": .., "_source": {..}}`).
/// Fails only when the publication itself is unusable; broken author or
/// organization entries are dropped and counted.
pub fn normalize(record: &Value, options: &NormalizeOptions) -> Result<NormalizedRecord, ValidationError> {
    let outer = record.as_object().ok_or(ValidationError::NotAnObject)?;
    let source = match outer.get("_source") {
        Some(Value::Object(inner)) => inner,
        Some(_) => return Err(ValidationError::NotAnObject),
        None => outer,
    };

    let id = id_field(source, "Id")
        .or_else(|| id_field(outer, "_id"))
        .ok_or(ValidationError::MissingField("id"))?;
    let title = str_field(source, "Title").ok_or(ValidationError::MissingField("title"))?;
    let year = match source.get("Year") {
        None | Some(Value::Null) => return Err(ValidationError::MissingField("year")),
        Some(value) => int_value(value).ok_or_else(|| ValidationError::InvalidField {
            field: "year",
            value: value.to_string(),
        })?,
    };
    let year = i32::try_from(year).map_err(|_| ValidationError::InvalidField {
        field: "year",
        value: year.to_string(),
    })?;

    let publication = Publication {
        id,
        title,
        year,
        publication_type: publication_type(source),
        abstract_text: str_field(source, "Abstract"),
        doi: first_str(source, "IdentifierDoi"),
        language: language(source),
        keywords: normalize_keywords(keyword_strings(source)),
    };

    let mut out = NormalizedRecord {
        publication,
        authors: Vec::new(),
        organizations: Vec::new(),
        hierarchy: Vec::new(),
        affiliations: Vec::new(),
        excluded_affiliations: Vec::new(),
        skipped_authors: 0,
    };
    let mut seen_orgs = FxHashSet::default();

    let persons = source.get("Persons").and_then(Value::as_array);
    for (position, entry) in persons.into_iter().flatten().enumerate() {
        let Some(entry) = entry.as_object() else {
            out.skipped_authors += 1;
            continue;
        };
        let Some(person_data) = entry.get("PersonData").and_then(Value::as_object) else {
            out.skipped_authors += 1;
            continue;
        };
        let Some(person) = person(person_data) else {
            debug!(
                publication = %out.publication.id,
                position,
                "Skipping author without id or name"
            );
            out.skipped_authors += 1;
            continue;
        };

        let role = str_field(entry, "Role")
            .or_else(|| {
                entry
                    .get("Role")
                    .and_then(Value::as_object)
                    .and_then(|r| str_field(r, "NameEng"))
            })
            .unwrap_or_else(|| DEFAULT_ROLE.to_string());

        let mut organization_ids = Vec::new();
        for org_entry in array(entry, "Organizations") {
            let Some(data) = org_entry.get("OrganizationData").and_then(Value::as_object) else {
                continue;
            };
            if let Some(org_id) = collect_organization(data, &mut out, &mut seen_orgs) {
                if !organization_ids.contains(&org_id) {
                    organization_ids.push(org_id);
                }
            }
        }

        for home in array(person_data, "OrganizationHome") {
            let Some(home) = home.as_object() else { continue };
            let Some(data) = home.get("OrganizationData").and_then(Value::as_object) else {
                continue;
            };
            let Some(org_id) = collect_organization(data, &mut out, &mut seen_orgs) else {
                continue;
            };
            match home_affiliation(&person.id, &org_id, home, options) {
                Ok(affiliation) => out.affiliations.push(affiliation),
                Err(reason) => out.excluded_affiliations.push(ExcludedAffiliation {
                    person_id: person.id.clone(),
                    organization_id: org_id,
                    reason,
                }),
            }
        }

        for org_id in &organization_ids {
            out.affiliations.push(Affiliation {
                person_id: person.id.clone(),
                organization_id: org_id.clone(),
                kind: AffiliationKind::Historical,
                title: Some(role.clone()),
                priority: None,
                start_date: None,
                end_date: None,
            });
        }

        out.authors.push(Authorship {
            position: position as u32,
            person,
            role,
            organization_ids,
        });
    }

    Ok(out)
}

/// Trims, lowercases and deduplicates keywords, keeping first-seen order.
pub fn normalize_keywords<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = FxHashSet::default();
    let mut out = Vec::new();
    for keyword in raw {
        let keyword = keyword.as_ref().trim().to_lowercase();
        if keyword.is_empty() {
            continue;
        }
        if seen.insert(keyword.clone()) {
            out.push(keyword);
        }
    }
    out
}

/// Canonical `XXXX-XXXX-XXXX-XXXX` form, or `None` when the value is not an ORCID.
pub fn normalize_orcid(raw: &str) -> Option<String> {
    let trimmed = raw
        .trim()
        .trim_start_matches("https://orcid.org/")
        .trim_start_matches("http://orcid.org/")
        .trim()
        .to_ascii_uppercase();
    if trimmed.is_empty() {
        return None;
    }
    if !trimmed.is_ascii() {
        debug!(orcid = %trimmed, "Dropping non-ASCII ORCID");
        return None;
    }
    if trimmed.len() == 16 && !trimmed.contains('-') {
        let dashed = format!(
            "{}-{}-{}-{}",
            &trimmed[0..4],
            &trimmed[4..8],
            &trimmed[8..12],
            &trimmed[12..16]
        );
        if ORCID_REGEX.is_match(&dashed) {
            return Some(dashed);
        }
    }
    if ORCID_REGEX.is_match(&trimmed) {
        Some(trimmed)
    } else {
        debug!(orcid = %trimmed, "Dropping malformed ORCID");
        None
    }
}

/// Whole months between two dates; a partial month does not count.
pub fn whole_months_between(start: NaiveDate, end: NaiveDate) -> u32 {
    if end <= start {
        return 0;
    }
    let mut months = (end.year() - start.year()) * 12 + end.month() as i32 - start.month() as i32;
    if end.day() < start.day() {
        months -= 1;
    }
    months.max(0) as u32
}

fn home_affiliation(
    person_id: &str,
    organization_id: &str,
    home: &Map<String, Value>,
    options: &NormalizeOptions,
) -> Result<Affiliation, ExclusionReason> {
    let start_date = date_field(home, "StartDate");
    let end_date = date_field(home, "EndDate");

    if let Some(end) = end_date {
        if end.year() >= AFFILIATION_OPEN_END_YEAR {
            return Err(ExclusionReason::OpenEndSentinel {
                end_year: end.year(),
            });
        }
    }

    if let Some(start) = start_date {
        let until = end_date.unwrap_or(options.as_of);
        let months = whole_months_between(start, until);
        if months < options.min_affiliation_months {
            return Err(ExclusionReason::TooShort { months });
        }
    }

    let kind = match end_date {
        Some(end) if end <= options.as_of => AffiliationKind::Historical,
        _ => AffiliationKind::Current,
    };

    Ok(Affiliation {
        person_id: person_id.to_string(),
        organization_id: organization_id.to_string(),
        kind,
        title: str_field(home, "TitleEng"),
        priority: home.get("Priority").and_then(scalar_string),
        start_date,
        end_date,
    })
}

fn person(data: &Map<String, Value>) -> Option<Person> {
    let id = id_field(data, "Id")?;
    let first_name = str_field(data, "FirstName");
    let last_name = str_field(data, "LastName");
    let display_name = str_field(data, "DisplayName").or_else(|| {
        match (&first_name, &last_name) {
            (Some(f), Some(l)) => Some(format!("{f} {l}")),
            (Some(n), None) | (None, Some(n)) => Some(n.clone()),
            (None, None) => None,
        }
    })?;

    let birth_year = data
        .get("BirthYear")
        .and_then(int_value)
        .filter(|y| *y > 0)
        .and_then(|y| i32::try_from(y).ok());

    let orcid = first_str(data, "IdentifierOrcid")
        .or_else(|| typed_identifier(data, "ORCID"))
        .and_then(|raw| normalize_orcid(&raw));
    let scopus_author_id = typed_identifier(data, "SCOPUS_AUTHID");

    Some(Person {
        id,
        display_name,
        first_name,
        last_name,
        birth_year,
        orcid,
        scopus_author_id,
    })
}

/// Adds the organization (once) and its parent edges; returns its id.
fn collect_organization(
    data: &Map<String, Value>,
    out: &mut NormalizedRecord,
    seen: &mut FxHashSet<String>,
) -> Option<String> {
    let id = id_field(data, "Id")?;
    if seen.contains(&id) {
        return Some(id);
    }
    let name_eng = str_field(data, "NameEng").or_else(|| str_field(data, "DisplayNameEng"))?;

    let organization_type = data
        .get("OrganizationTypes")
        .and_then(Value::as_array)
        .and_then(|types| types.first())
        .and_then(Value::as_object)
        .and_then(|t| str_field(t, "NameEng"))
        .map(|name| {
            let name = name.to_lowercase();
            if name.contains("research") {
                OrganizationType::ResearchInstitute
            } else if name.contains("admin") {
                OrganizationType::Administrative
            } else {
                OrganizationType::Academic
            }
        })
        .unwrap_or(OrganizationType::Academic);

    for parent in array(data, "OrganizationParents") {
        if let Some(parent_id) = parent
            .as_object()
            .and_then(|p| id_field(p, "ParentOrganizationId"))
        {
            out.hierarchy.push(HierarchyEdge::new(id.clone(), parent_id));
        }
    }

    out.organizations.push(Organization {
        id: id.clone(),
        name_eng,
        name_swe: str_field(data, "NameSwe"),
        organization_type,
        level: data
            .get("Level")
            .and_then(int_value)
            .and_then(OrganizationLevel::from_depth),
    });
    seen.insert(id.clone());
    Some(id)
}

fn publication_type(source: &Map<String, Value>) -> PublicationType {
    let name = source
        .get("PublicationType")
        .and_then(Value::as_object)
        .and_then(|t| str_field(t, "NameEng"))
        .map(|n| n.to_lowercase())
        .unwrap_or_default();

    if name.contains("book") {
        PublicationType::Book
    } else if name.contains("conference") || name.contains("proceeding") {
        PublicationType::Conference
    } else if name.contains("thesis") || name.contains("dissertation") {
        PublicationType::Thesis
    } else {
        PublicationType::Article
    }
}

fn language(source: &Map<String, Value>) -> Option<String> {
    source
        .get("Language")
        .and_then(Value::as_object)
        .and_then(|l| str_field(l, "Iso"))
        .map(|iso| iso.to_lowercase())
        .filter(|iso| LANGUAGES.contains(&iso.as_str()))
}

fn keyword_strings(source: &Map<String, Value>) -> Vec<String> {
    array(source, "Keywords")
        .filter_map(|kw| match kw {
            Value::String(s) => Some(s.clone()),
            Value::Object(o) => o.get("Value").and_then(scalar_string),
            _ => None,
        })
        .collect()
}

/// Value of the first active identifier whose `Type.Value` equals `kind`.
fn typed_identifier(data: &Map<String, Value>, kind: &str) -> Option<String> {
    array(data, "Identifiers")
        .filter_map(Value::as_object)
        .filter(|ident| ident.get("IsActive").and_then(Value::as_bool) != Some(false))
        .find(|ident| {
            ident
                .get("Type")
                .and_then(Value::as_object)
                .and_then(|t| t.get("Value"))
                .and_then(Value::as_str)
                == Some(kind)
        })
        .and_then(|ident| ident.get("Value").and_then(scalar_string))
}

fn array<'a>(obj: &'a Map<String, Value>, key: &str) -> impl Iterator<Item = &'a Value> {
    obj.get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Ids arrive as strings or numbers depending on the exporter.
fn id_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(scalar_string)
}

fn first_str(obj: &Map<String, Value>, key: &str) -> Option<String> {
    array(obj, key).next().and_then(scalar_string)
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn int_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn date_field(obj: &Map<String, Value>, key: &str) -> Option<NaiveDate> {
    let raw = obj.get(key).and_then(Value::as_str)?.trim();
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options() -> NormalizeOptions {
        NormalizeOptions::new(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap())
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sample() -> Value {
        json!({
            "_id": "pub-1",
            "_source": {
                "Title": "  Graph loading at scale ",
                "Year": "2021",
                "PublicationType": {"NameEng": "Conference paper"},
                "Language": {"Iso": "EN"},
                "IdentifierDoi": ["10.1000/xyz"],
                "Keywords": [" Graphs", "graphs", {"Value": "Neo4j"}, ""],
                "Persons": [
                    {
                        "PersonData": {
                            "Id": "p-1",
                            "DisplayName": "Ada Lovelace",
                            "FirstName": "Ada",
                            "LastName": "Lovelace",
                            "BirthYear": 1985,
                            "IdentifierOrcid": ["https://orcid.org/0000000218250097"],
                            "Identifiers": [
                                {"Type": {"Value": "SCOPUS_AUTHID"}, "Value": "111", "IsActive": false},
                                {"Type": {"Value": "SCOPUS_AUTHID"}, "Value": "222"}
                            ],
                            "OrganizationHome": [
                                {"OrganizationData": {"Id": 10, "NameEng": "Dept of CS", "Level": 1},
                                 "StartDate": "2015-01-01T00:00:00", "TitleEng": "Professor", "Priority": 1}
                            ]
                        },
                        "Organizations": [
                            {"OrganizationData": {"Id": 10, "NameEng": "Dept of CS",
                              "OrganizationParents": [{"ParentOrganizationId": 1}]}}
                        ]
                    },
                    {"PersonData": {"DisplayName": "No Id"}},
                    {"PersonData": {"Id": "p-3", "FirstName": "Alan", "LastName": "Turing"}, "Role": "Editor"}
                ]
            }
        })
    }

    #[test]
    fn normalizes_publication_fields() {
        let rec = normalize(&sample(), &options()).unwrap();
        let p = &rec.publication;
        assert_eq!(p.id, "pub-1");
        assert_eq!(p.title, "Graph loading at scale");
        assert_eq!(p.year, 2021);
        assert_eq!(p.publication_type, PublicationType::Conference);
        assert_eq!(p.language.as_deref(), Some("en"));
        assert_eq!(p.doi.as_deref(), Some("10.1000/xyz"));
        assert_eq!(p.keywords, vec!["graphs", "neo4j"]);
    }

    #[test]
    fn authors_keep_source_positions() {
        let rec = normalize(&sample(), &options()).unwrap();
        let positions: Vec<u32> = rec.authors.iter().map(|a| a.position).collect();
        assert_eq!(positions, vec![0, 2]);
        assert_eq!(rec.skipped_authors, 1);
        assert_eq!(rec.authors[0].role, "Author");
        assert_eq!(rec.authors[1].role, "Editor");
        assert_eq!(rec.authors[1].person.display_name, "Alan Turing");
    }

    #[test]
    fn person_identifiers_are_extracted() {
        let rec = normalize(&sample(), &options()).unwrap();
        let ada = &rec.authors[0].person;
        assert_eq!(ada.orcid.as_deref(), Some("0000-0002-1825-0097"));
        assert_eq!(ada.scopus_author_id.as_deref(), Some("222"));
        assert_eq!(ada.birth_year, Some(1985));
    }

    #[test]
    fn organizations_deduplicated_with_hierarchy() {
        let rec = normalize(&sample(), &options()).unwrap();
        assert_eq!(rec.organizations.len(), 1);
        assert_eq!(rec.organizations[0].id, "10");
        assert_eq!(rec.organizations[0].level, Some(OrganizationLevel::Department));
        assert_eq!(rec.hierarchy, vec![HierarchyEdge::new("10", "1")]);
        assert_eq!(rec.authors[0].organization_ids, vec!["10".to_string()]);
    }

    #[test]
    fn open_home_affiliation_is_current() {
        let rec = normalize(&sample(), &options()).unwrap();
        let home: Vec<_> = rec
            .affiliations
            .iter()
            .filter(|a| a.kind == AffiliationKind::Current)
            .collect();
        assert_eq!(home.len(), 1);
        assert_eq!(home[0].title.as_deref(), Some("Professor"));
        assert_eq!(home[0].priority.as_deref(), Some("1"));
    }

    #[test]
    fn author_organizations_become_affiliations_titled_by_role() {
        let rec = normalize(&sample(), &options()).unwrap();
        let authored: Vec<_> = rec
            .affiliations
            .iter()
            .filter(|a| a.kind == AffiliationKind::Historical)
            .collect();
        assert_eq!(authored.len(), 1);
        assert_eq!(authored[0].person_id, "p-1");
        assert_eq!(authored[0].organization_id, "10");
        assert_eq!(authored[0].title.as_deref(), Some("Author"));
        assert_eq!(authored[0].start_date, None);
    }

    #[test]
    fn missing_year_names_the_field() {
        let rec = json!({"Id": "x", "Title": "No year"});
        assert_eq!(
            normalize(&rec, &options()),
            Err(ValidationError::MissingField("year"))
        );
    }

    #[test]
    fn missing_id_and_title_are_validation_errors() {
        assert_eq!(
            normalize(&json!({"Title": "t", "Year": 2020}), &options()),
            Err(ValidationError::MissingField("id"))
        );
        assert_eq!(
            normalize(&json!({"Id": "x", "Title": "  ", "Year": 2020}), &options()),
            Err(ValidationError::MissingField("title"))
        );
        assert_eq!(normalize(&json!([1, 2]), &options()), Err(ValidationError::NotAnObject));
    }

    #[test]
    fn unparsable_year_is_invalid() {
        let err = normalize(&json!({"Id": "x", "Title": "t", "Year": "soon"}), &options()).unwrap_err();
        assert_eq!(err.field(), Some("year"));
    }

    fn record_with_home(start: &str, end: Option<&str>) -> Value {
        let mut home = json!({"OrganizationData": {"Id": "o1", "NameEng": "Org"}, "StartDate": start});
        if let Some(end) = end {
            home["EndDate"] = json!(end);
        }
        json!({"Id": "x", "Title": "t", "Year": 2020, "Persons": [
            {"PersonData": {"Id": "p", "DisplayName": "P", "OrganizationHome": [home]}}
        ]})
    }

    #[test]
    fn sentinel_end_year_is_excluded() {
        let rec = normalize(&record_with_home("2010-01-01", Some("9999-12-31")), &options()).unwrap();
        assert!(rec.affiliations.is_empty());
        assert_eq!(
            rec.excluded_affiliations[0].reason,
            ExclusionReason::OpenEndSentinel { end_year: 9999 }
        );
        // The organization itself is still loaded
        assert_eq!(rec.organizations.len(), 1);
    }

    #[test]
    fn duration_boundary_is_inclusive_of_minimum() {
        // Exactly six whole months: kept
        let rec = normalize(&record_with_home("2020-01-15", Some("2020-07-15")), &options()).unwrap();
        assert_eq!(rec.affiliations.len(), 1);
        assert_eq!(rec.affiliations[0].kind, AffiliationKind::Historical);

        // One day short of six months: five whole months, excluded
        let rec = normalize(&record_with_home("2020-01-15", Some("2020-07-14")), &options()).unwrap();
        assert!(rec.affiliations.is_empty());
        assert_eq!(
            rec.excluded_affiliations[0].reason,
            ExclusionReason::TooShort { months: 5 }
        );
    }

    #[test]
    fn minimum_duration_is_configurable() {
        let mut opts = options();
        opts.min_affiliation_months = 12;
        let rec = normalize(&record_with_home("2020-01-01", Some("2020-10-01")), &opts).unwrap();
        assert!(rec.affiliations.is_empty());
    }

    #[test]
    fn open_affiliation_measured_until_reference_date() {
        // Started two months before the reference date
        let rec = normalize(&record_with_home("2024-04-01", None), &options()).unwrap();
        assert!(rec.affiliations.is_empty());
        assert_eq!(
            rec.excluded_affiliations[0].reason,
            ExclusionReason::TooShort { months: 2 }
        );
    }

    #[test]
    fn keyword_normalization_is_deterministic() {
        let a = normalize_keywords(["B", " a ", "b", "A", "c"]);
        let b = normalize_keywords(["B", " a ", "b", "A", "c"]);
        assert_eq!(a, vec!["b", "a", "c"]);
        assert_eq!(a, b);
    }

    #[test]
    fn orcid_normalization() {
        assert_eq!(
            normalize_orcid("0000-0002-1825-009x").as_deref(),
            Some("0000-0002-1825-009X")
        );
        assert_eq!(
            normalize_orcid("http://orcid.org/0000-0002-1825-0097").as_deref(),
            Some("0000-0002-1825-0097")
        );
        assert_eq!(normalize_orcid("0000-0001"), None);
        assert_eq!(normalize_orcid("   "), None);
    }

    #[test]
    fn orcid_with_multibyte_characters_is_dropped() {
        // 16 bytes, but 'é' straddles the first group boundary
        assert_eq!("abcéxxxxxxxxxxx".len(), 16);
        assert_eq!(normalize_orcid("abcéxxxxxxxxxxx"), None);
        assert_eq!(normalize_orcid("0000-0002-1825-00９7"), None);
    }

    #[test]
    fn record_with_multibyte_orcid_still_normalizes() {
        let record = json!({
            "Id": "pub-1",
            "Title": "T",
            "Year": 2020,
            "Persons": [{"PersonData": {"Id": "p-1", "DisplayName": "Ada",
                "IdentifierOrcid": ["abcéxxxxxxxxxxx"]}}]
        });
        let rec = normalize(&record, &options()).unwrap();
        assert_eq!(rec.authors.len(), 1);
        assert_eq!(rec.authors[0].person.orcid, None);
    }

    #[test]
    fn whole_months() {
        assert_eq!(whole_months_between(date(2020, 1, 31), date(2020, 2, 29)), 0);
        assert_eq!(whole_months_between(date(2020, 1, 1), date(2021, 1, 1)), 12);
        assert_eq!(whole_months_between(date(2021, 1, 1), date(2020, 1, 1)), 0);
    }
}
