//! Core domain model and per-row outcome types for TEIM.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod identity;
pub mod normalize;

pub const CRATE_NAME: &str = "teim-core";

/// One decoded CSV row: canonical header name -> raw field value.
///
/// Header canonicalization happens once at decode time; resolvers only ever
/// see canonical lower-snake keys (`dni`, `cif`, `center_name`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub index: usize,
    pub fields: BTreeMap<String, String>,
}

impl Row {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            fields: BTreeMap::new(),
        }
    }

    /// Trimmed field value, `None` when missing or blank.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }
}

/// The five mutually exclusive import phases. One phase per invocation;
/// phases are never chained automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportPhase {
    Users,
    Companies,
    Associate,
    Courses,
    Groups,
}

impl ImportPhase {
    pub const ALL: [ImportPhase; 5] = [
        ImportPhase::Users,
        ImportPhase::Companies,
        ImportPhase::Associate,
        ImportPhase::Courses,
        ImportPhase::Groups,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImportPhase::Users => "users",
            ImportPhase::Companies => "companies",
            ImportPhase::Associate => "associate",
            ImportPhase::Courses => "courses",
            ImportPhase::Groups => "groups",
        }
    }
}

impl fmt::Display for ImportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "users" => Ok(ImportPhase::Users),
            "companies" => Ok(ImportPhase::Companies),
            "associate" => Ok(ImportPhase::Associate),
            "courses" => Ok(ImportPhase::Courses),
            "groups" => Ok(ImportPhase::Groups),
            other => Err(format!("unknown import phase: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    Ok,
    Skipped,
    Error,
}

/// Reason codes for recoverable skips. A skip never aborts the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    InsufficientUserData,
    UserNotFound,
    CompanyNotFound,
    CenterNotFound,
    CourseNotFound,
    GroupNotFound,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::InsufficientUserData => "insufficient_user_data",
            SkipReason::UserNotFound => "user_not_found",
            SkipReason::CompanyNotFound => "company_not_found",
            SkipReason::CenterNotFound => "center_not_found",
            SkipReason::CourseNotFound => "course_not_found",
            SkipReason::GroupNotFound => "group_not_found",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an `ok` row was matched against an existing or newly created entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    Nss,
    Dni,
    ExternalId,
    FullName,
    NameScan,
    TaxId,
    ImportKey,
    RunCache,
    ExactName,
    GlobalName,
    Containment,
    EmployerNumber,
    UnknownCenter,
    Created,
}

/// Per-row outcome, one entry per consumed CSV row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowOutcome {
    pub row: usize,
    pub phase: ImportPhase,
    pub status: RowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_user: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_company: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_center: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_course: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_group: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_by: Option<MatchedBy>,
}

impl RowOutcome {
    pub fn new(row: usize, phase: ImportPhase, status: RowStatus) -> Self {
        Self {
            row,
            phase,
            status,
            reason: None,
            id_user: None,
            id_company: None,
            id_center: None,
            id_course: None,
            id_group: None,
            matched_by: None,
        }
    }

    pub fn skipped(row: usize, phase: ImportPhase, reason: SkipReason) -> Self {
        let mut outcome = Self::new(row, phase, RowStatus::Skipped);
        outcome.reason = Some(reason);
        outcome
    }
}

/// Unexpected per-row failure, captured with its row index; never aborts the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub row: usize,
    pub phase: ImportPhase,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub surname1: Option<String>,
    pub surname2: Option<String>,
    /// Normalized (uppercase alphanumeric) DNI/NIE.
    pub dni: Option<String>,
    /// Normalized social-security number.
    pub nss: Option<String>,
    /// External LMS numeric id.
    pub external_id: Option<i64>,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Display full name: given name followed by both surnames.
    pub fn full_name(&self) -> String {
        let mut parts = vec![self.name.as_str()];
        if let Some(s1) = self.surname1.as_deref() {
            parts.push(s1);
        }
        if let Some(s2) = self.surname2.as_deref() {
            parts.push(s2);
        }
        parts.join(" ").trim().to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub surname1: Option<String>,
    pub surname2: Option<String>,
    pub dni: Option<String>,
    pub nss: Option<String>,
    pub external_id: Option<i64>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: Uuid,
    /// Tax identifier (CIF). A company is never created without one.
    pub tax_id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewCompany {
    pub tax_id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Center {
    pub id: Uuid,
    pub company_id: Uuid,
    pub name: String,
    /// Synthetic `<company_id>_<folded_name>` key persisted at creation so
    /// future runs re-match exactly.
    pub import_key: Option<String>,
    /// Weak signal only: reused across distinct centers in source data.
    pub employer_number: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewCenter {
    pub company_id: Uuid,
    pub name: String,
    pub import_key: Option<String>,
    pub employer_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub id: Uuid,
    /// External LMS numeric id; authoritative when present.
    pub external_id: Option<i64>,
    pub name: String,
    pub description: Option<String>,
    pub hours: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewCourse {
    pub external_id: Option<i64>,
    pub name: String,
    pub description: Option<String>,
    pub hours: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub external_id: Option<i64>,
    pub name: String,
    pub course_id: Option<Uuid>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewGroup {
    pub external_id: Option<i64>,
    pub name: String,
    pub course_id: Option<Uuid>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

/// User<->Center association. Exactly one `is_main` per user across all of
/// their affiliations is a hard invariant restored by the repair sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Affiliation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub center_id: Uuid,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub is_main: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewAffiliation {
    pub user_id: Uuid,
    pub center_id: Uuid,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub is_main: bool,
}

/// User<->Course/Group training record carrying progress data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub group_id: Option<Uuid>,
    pub progress_pct: Option<f64>,
    pub time_spent_secs: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewEnrollment {
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub group_id: Option<Uuid>,
    pub progress_pct: Option<f64>,
    pub time_spent_secs: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_str() {
        for phase in ImportPhase::ALL {
            assert_eq!(phase.as_str().parse::<ImportPhase>().unwrap(), phase);
        }
        assert!("moodle".parse::<ImportPhase>().is_err());
    }

    #[test]
    fn row_get_trims_and_drops_blanks() {
        let mut row = Row::new(3);
        row.set("dni", "  12345678Z ");
        row.set("cif", "   ");
        assert_eq!(row.get("dni"), Some("12345678Z"));
        assert_eq!(row.get("cif"), None);
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn outcome_serializes_without_absent_ids() {
        let outcome = RowOutcome::skipped(7, ImportPhase::Companies, SkipReason::CompanyNotFound);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "company_not_found");
        assert!(json.get("id_company").is_none());
    }

    #[test]
    fn full_name_skips_missing_surnames() {
        let user = User {
            id: Uuid::new_v4(),
            name: "Ana".into(),
            surname1: Some("García".into()),
            surname2: None,
            dni: None,
            nss: None,
            external_id: None,
            email: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(user.full_name(), "Ana García");
    }
}
