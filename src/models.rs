use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::repository::RecordError;

pub const PASSING_AVERAGE: f64 = 7.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdKind {
    Matricula,
    Cpf,
}

impl FromStr for IdKind {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MATRICULA" => Ok(IdKind::Matricula),
            "CPF" => Ok(IdKind::Cpf),
            other => Err(RecordError::InvalidInput(format!(
                "unknown identifier kind `{}`",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    E1,
    E2,
    E3,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::E1, Stage::E2, Stage::E3];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::E1 => "E1",
            Stage::E2 => "E2",
            Stage::E3 => "E3",
        };
        f.write_str(name)
    }
}

/// Accepts `E1`/`1`, `E2`/`2`, `E3`/`3` in any case; anything else is rejected.
impl FromStr for Stage {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "E1" | "1" => Ok(Stage::E1),
            "E2" | "2" => Ok(Stage::E2),
            "E3" | "3" => Ok(Stage::E3),
            other => Err(RecordError::InvalidInput(format!("invalid stage `{}`", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CourseStatus {
    InProgress,
    Approved,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Grades {
    #[serde(rename = "E1", default)]
    pub e1: Option<f64>,
    #[serde(rename = "E2", default)]
    pub e2: Option<f64>,
    #[serde(rename = "E3", default)]
    pub e3: Option<f64>,
}

/// Rounds from the exact binary value, so 6.475 (stored just below) becomes 6.47.
fn round2(value: f64) -> f64 {
    format!("{:.2}", value).parse().unwrap_or(value)
}

impl Grades {
    pub fn get(&self, stage: Stage) -> Option<f64> {
        match stage {
            Stage::E1 => self.e1,
            Stage::E2 => self.e2,
            Stage::E3 => self.e3,
        }
    }

    pub fn set(&mut self, stage: Stage, value: f64) {
        let slot = match stage {
            Stage::E1 => &mut self.e1,
            Stage::E2 => &mut self.e2,
            Stage::E3 => &mut self.e3,
        };
        *slot = Some(value);
    }

    /// Weighted 30/30/40, rounded to two decimals. `None` until every stage has a grade.
    pub fn average(&self) -> Option<f64> {
        let (e1, e2, e3) = (self.e1?, self.e2?, self.e3?);
        Some(round2(e1 * 0.30 + e2 * 0.30 + e3 * 0.40))
    }

    pub fn status(&self) -> CourseStatus {
        match self.average() {
            None => CourseStatus::InProgress,
            Some(avg) if avg >= PASSING_AVERAGE => CourseStatus::Approved,
            Some(_) => CourseStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub id: Uuid,
    pub name: String,
    pub registered_on: NaiveDate,
    #[serde(default)]
    pub grades: Grades,
}

impl Course {
    pub fn new(name: String, registered_on: NaiveDate) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            registered_on,
            grades: Grades::default(),
        }
    }

    pub fn average(&self) -> Option<f64> {
        self.grades.average()
    }

    pub fn status(&self) -> CourseStatus {
        self.grades.status()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Student {
    pub id: Uuid,
    pub name: String,
    pub id_kind: IdKind,
    pub identifier: String,
    pub registered_on: NaiveDate,
    pub active: bool,
    /// Newest first.
    pub courses: Vec<Course>,
}

impl Student {
    pub fn same_identity(&self, id_kind: IdKind, identifier: &str) -> bool {
        self.id_kind == id_kind && self.identifier == identifier
    }

    pub fn course(&self, course_id: Uuid) -> Option<&Course> {
        self.courses.iter().find(|c| c.id == course_id)
    }

    pub fn course_mut(&mut self, course_id: Uuid) -> Option<&mut Course> {
        self.courses.iter_mut().find(|c| c.id == course_id)
    }
}

/// On-disk shape of a student. The identifier lives in `identifier_enc`; the clear
/// `identifier` is only written for stores that still need it and only read as a fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentRecord {
    pub id: Uuid,
    pub name: String,
    pub id_kind: IdKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier_enc: Option<String>,
    pub registered_on: NaiveDate,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub courses: Vec<Course>,
}

fn default_active() -> bool {
    true
}

/// Course as handed to the request layer, derived fields included.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseView {
    pub id: Uuid,
    pub name: String,
    pub registered_on: NaiveDate,
    pub grades: Grades,
    pub average: Option<f64>,
    pub status: CourseStatus,
}

impl From<&Course> for CourseView {
    fn from(course: &Course) -> Self {
        Self {
            id: course.id,
            name: course.name.clone(),
            registered_on: course.registered_on,
            grades: course.grades,
            average: course.average(),
            status: course.status(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentView {
    pub id: Uuid,
    pub name: String,
    pub id_kind: IdKind,
    pub identifier: String,
    pub registered_on: NaiveDate,
    pub active: bool,
    pub courses: Vec<CourseView>,
}

impl From<&Student> for StudentView {
    fn from(student: &Student) -> Self {
        Self {
            id: student.id,
            name: student.name.clone(),
            id_kind: student.id_kind,
            identifier: student.identifier.clone(),
            registered_on: student.registered_on,
            active: student.active,
            courses: student.courses.iter().map(CourseView::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    StudentCreated,
    StudentUpdated,
    StudentRemoved,
    StudentStatusChanged,
    CourseCreated,
    CourseUpdated,
    CourseRemoved,
    GradeUpdated,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditAction::StudentCreated => "STUDENT_CREATED",
            AuditAction::StudentUpdated => "STUDENT_UPDATED",
            AuditAction::StudentRemoved => "STUDENT_REMOVED",
            AuditAction::StudentStatusChanged => "STUDENT_STATUS_CHANGED",
            AuditAction::CourseCreated => "COURSE_CREATED",
            AuditAction::CourseUpdated => "COURSE_UPDATED",
            AuditAction::CourseRemoved => "COURSE_REMOVED",
            AuditAction::GradeUpdated => "GRADE_UPDATED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: AuditAction,
    #[serde(default)]
    pub student_id: Option<Uuid>,
    #[serde(default)]
    pub details: Map<String, Value>,
    /// Rotated summary line; decoded only when the log is read.
    #[serde(default)]
    pub message: Option<String>,
}

/// Audit entry with its summary message decoded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditView {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: AuditAction,
    pub student_id: Option<Uuid>,
    pub details: Map<String, Value>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminCredential {
    pub username: String,
    pub salt: String,
    pub password_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graded(e1: Option<f64>, e2: Option<f64>, e3: Option<f64>) -> Grades {
        Grades { e1, e2, e3 }
    }

    #[test]
    fn test_incomplete_grades_are_in_progress() {
        let partial = [
            graded(None, None, None),
            graded(Some(8.0), None, Some(9.0)),
            graded(Some(10.0), Some(10.0), None),
        ];
        for grades in partial {
            assert_eq!(grades.average(), None);
            assert_eq!(grades.status(), CourseStatus::InProgress);
        }
    }

    #[test]
    fn test_weighted_average_approves() {
        let grades = graded(Some(8.0), Some(7.0), Some(9.0));
        assert_eq!(grades.average(), Some(8.1));
        assert_eq!(grades.status(), CourseStatus::Approved);
    }

    #[test]
    fn test_weighted_average_fails() {
        let grades = graded(Some(5.0), Some(5.0), Some(5.0));
        assert_eq!(grades.average(), Some(5.0));
        assert_eq!(grades.status(), CourseStatus::Failed);
    }

    #[test]
    fn test_threshold_is_inclusive_after_rounding() {
        assert_eq!(graded(Some(7.0), Some(7.0), Some(7.0)).status(), CourseStatus::Approved);
        // 6.994 rounds to 6.99
        let grades = graded(Some(6.98), Some(7.0), Some(7.0));
        assert_eq!(grades.average(), Some(6.99));
        assert_eq!(grades.status(), CourseStatus::Failed);
    }

    #[test]
    fn test_average_rounds_from_stored_value() {
        let grades = graded(Some(6.01), Some(7.0), Some(6.43));
        assert_eq!(grades.average(), Some(6.47));
        assert_eq!(grades.status(), CourseStatus::Failed);
    }

    #[test]
    fn test_stage_aliases() {
        assert_eq!("E1".parse::<Stage>().unwrap(), Stage::E1);
        assert_eq!("e2".parse::<Stage>().unwrap(), Stage::E2);
        assert_eq!(" 3 ".parse::<Stage>().unwrap(), Stage::E3);
        assert!(matches!("E4".parse::<Stage>(), Err(RecordError::InvalidInput(_))));
        assert!(matches!("".parse::<Stage>(), Err(RecordError::InvalidInput(_))));
    }

    #[test]
    fn test_grades_persist_as_stage_map() {
        let mut grades = Grades::default();
        grades.set(Stage::E2, 6.5);
        let json = serde_json::to_value(grades).unwrap();
        assert_eq!(json, serde_json::json!({"E1": null, "E2": 6.5, "E3": null}));
    }

    #[test]
    fn test_action_display_matches_serialization() {
        let serialized = serde_json::to_value(AuditAction::StudentStatusChanged).unwrap();
        assert_eq!(serialized, Value::String(AuditAction::StudentStatusChanged.to_string()));
    }
}
