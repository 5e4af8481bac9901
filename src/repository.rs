//! File-backed student/course store.
//!
//! Every mutation reads the whole student collection, applies the change in memory,
//! writes the whole collection back and then appends exactly one audit entry (two for
//! [`Repository::set_active`]). Mutations are serialised through a single writer gate so
//! concurrent callers cannot drop each other's changes. Reads take no lock.

use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::cipher::{EncryptError, FieldCipher};
use crate::io::{read_json, write_json, Storage, StorageError};
use crate::models::{AuditAction, Course, IdKind, Stage, Student, StudentRecord};
use crate::util::today;

pub const STUDENT_DOCUMENT: &str = "students.json";

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Cipher(#[from] EncryptError),
}

#[derive(Debug, Clone, Default)]
pub struct StudentFilter {
    /// Case-insensitive substring of the name.
    pub name: Option<String>,
    pub id_kind: Option<IdKind>,
    pub identifier: Option<String>,
    pub registered_from: Option<NaiveDate>,
    pub registered_to: Option<NaiveDate>,
}

impl StudentFilter {
    pub fn matches(&self, student: &Student) -> bool {
        if let Some(name) = &self.name {
            if !student.name.to_lowercase().contains(&name.to_lowercase()) {
                return false;
            }
        }
        if let Some(kind) = self.id_kind {
            if student.id_kind != kind {
                return false;
            }
        }
        if let Some(identifier) = &self.identifier {
            if &student.identifier != identifier {
                return false;
            }
        }
        within(student.registered_on, self.registered_from, self.registered_to)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CourseFilter {
    pub name: Option<String>,
    /// Only courses with a grade in this stage. Accepts the same aliases as `set_grade`.
    pub graded_stage: Option<String>,
    pub registered_from: Option<NaiveDate>,
    pub registered_to: Option<NaiveDate>,
}

fn within(date: NaiveDate, from: Option<NaiveDate>, to: Option<NaiveDate>) -> bool {
    from.map_or(true, |from| date >= from) && to.map_or(true, |to| date <= to)
}

#[derive(Debug, Clone)]
pub struct NewStudent {
    pub name: String,
    pub id_kind: IdKind,
    pub identifier: String,
    pub registered_on: Option<NaiveDate>,
    pub active: bool,
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct StudentPatch {
    pub name: Option<String>,
    pub id_kind: Option<IdKind>,
    pub identifier: Option<String>,
    pub registered_on: Option<NaiveDate>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct CoursePatch {
    pub name: Option<String>,
    pub registered_on: Option<NaiveDate>,
}

fn student_not_found(id: Uuid) -> RecordError {
    RecordError::NotFound(format!("Student `{}` does not exist!", id))
}

fn course_not_found(id: Uuid) -> RecordError {
    RecordError::NotFound(format!("Course `{}` does not exist!", id))
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn patch_details(patch: &StudentPatch) -> Value {
    json!({
        "fields": {
            "name": patch.name,
            "id_kind": patch.id_kind,
            "identifier": patch.identifier,
            "registered_on": patch.registered_on,
            "active": patch.active,
        }
    })
}

fn apply_patch(
    students: &mut [Student],
    student_id: Uuid,
    patch: &StudentPatch,
) -> Result<Student, RecordError> {
    let student = students
        .iter_mut()
        .find(|s| s.id == student_id)
        .ok_or_else(|| student_not_found(student_id))?;

    if let Some(name) = &patch.name {
        student.name = name.clone();
    }
    if let Some(kind) = patch.id_kind {
        student.id_kind = kind;
    }
    if let Some(identifier) = &patch.identifier {
        student.identifier = identifier.clone();
    }
    if let Some(date) = patch.registered_on {
        student.registered_on = date;
    }
    if let Some(active) = patch.active {
        student.active = active;
    }
    let updated = student.clone();

    // uniqueness is only enforced on create
    if students
        .iter()
        .any(|s| s.id != updated.id && s.same_identity(updated.id_kind, &updated.identifier))
    {
        log::warn!(
            "Update of student {} duplicates {:?} `{}`",
            updated.id,
            updated.id_kind,
            updated.identifier
        );
    }
    Ok(updated)
}

pub struct Repository {
    storage: Arc<dyn Storage>,
    cipher: FieldCipher,
    audit: Arc<AuditLog>,
    actor: String,
    keep_plain_identifier: bool,
    writer: Mutex<()>,
}

impl Repository {
    pub fn new(
        storage: Arc<dyn Storage>,
        cipher: FieldCipher,
        audit: Arc<AuditLog>,
        actor: impl Into<String>,
        keep_plain_identifier: bool,
    ) -> Self {
        Self {
            storage,
            cipher,
            audit,
            actor: actor.into(),
            keep_plain_identifier,
            writer: Mutex::new(()),
        }
    }

    fn restore(&self, record: StudentRecord) -> Result<Student, RecordError> {
        let deciphered = record.identifier_enc.as_deref().and_then(|token| {
            self.cipher
                .decrypt(token)
                .map_err(|err| {
                    log::warn!("Identifier of student {} is unreadable: {}", record.id, err)
                })
                .ok()
        });

        let identifier = match (deciphered, record.identifier) {
            (Some(identifier), _) => identifier,
            (None, Some(plain)) => plain,
            (None, None) => {
                return Err(StorageError::Corrupt {
                    name: STUDENT_DOCUMENT.to_string(),
                    message: format!("identifier of student {} cannot be recovered", record.id),
                }
                .into())
            }
        };

        Ok(Student {
            id: record.id,
            name: record.name,
            id_kind: record.id_kind,
            identifier,
            registered_on: record.registered_on,
            active: record.active,
            courses: record.courses,
        })
    }

    fn seal(&self, student: &Student) -> Result<StudentRecord, RecordError> {
        Ok(StudentRecord {
            id: student.id,
            name: student.name.clone(),
            id_kind: student.id_kind,
            identifier: self
                .keep_plain_identifier
                .then(|| student.identifier.clone()),
            identifier_enc: Some(self.cipher.encrypt(&student.identifier)?),
            registered_on: student.registered_on,
            active: student.active,
            courses: student.courses.clone(),
        })
    }

    fn load(&self) -> Result<Vec<Student>, RecordError> {
        let records: Vec<StudentRecord> =
            read_json(self.storage.as_ref(), STUDENT_DOCUMENT)?.unwrap_or_default();
        records.into_iter().map(|r| self.restore(r)).collect()
    }

    fn save(&self, students: &[Student]) -> Result<(), RecordError> {
        let records = students
            .iter()
            .map(|s| self.seal(s))
            .collect::<Result<Vec<_>, _>>()?;
        write_json(self.storage.as_ref(), STUDENT_DOCUMENT, &records)?;
        Ok(())
    }

    fn log(
        &self,
        action: AuditAction,
        student_id: Uuid,
        details: Value,
    ) -> Result<(), RecordError> {
        self.audit
            .record(action, &self.actor, Some(student_id), object(details))?;
        Ok(())
    }

    /// Runs `change` against a fresh snapshot under the writer gate, persists the result
    /// and appends the audit entry `describe` builds from it.
    fn mutate<T>(
        &self,
        action: AuditAction,
        student_id: Uuid,
        change: impl FnOnce(&mut Vec<Student>) -> Result<T, RecordError>,
        describe: impl FnOnce(&T) -> Value,
    ) -> Result<T, RecordError> {
        self.mutate_logged(student_id, change, |outcome| vec![(action, describe(outcome))])
    }

    /// Like [`Repository::mutate`], appending every entry in order before the gate opens.
    fn mutate_logged<T>(
        &self,
        student_id: Uuid,
        change: impl FnOnce(&mut Vec<Student>) -> Result<T, RecordError>,
        describe: impl FnOnce(&T) -> Vec<(AuditAction, Value)>,
    ) -> Result<T, RecordError> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut students = self.load()?;
        let outcome = change(&mut students)?;
        self.save(&students)?;
        for (action, details) in describe(&outcome) {
            self.log(action, student_id, details)?;
            log::debug!("{} applied to student {}", action, student_id);
        }
        Ok(outcome)
    }

    /// Stored order, newest first.
    pub fn list(&self, filter: &StudentFilter) -> Result<Vec<Student>, RecordError> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|s| filter.matches(s))
            .collect())
    }

    pub fn get(&self, student_id: Uuid) -> Result<Student, RecordError> {
        self.load()?
            .into_iter()
            .find(|s| s.id == student_id)
            .ok_or_else(|| student_not_found(student_id))
    }

    pub fn create(&self, new: NewStudent) -> Result<Student, RecordError> {
        let student = Student {
            id: Uuid::new_v4(),
            name: new.name,
            id_kind: new.id_kind,
            identifier: new.identifier,
            registered_on: new.registered_on.unwrap_or_else(today),
            active: new.active,
            courses: Vec::new(),
        };

        self.mutate(
            AuditAction::StudentCreated,
            student.id,
            |students| {
                if students
                    .iter()
                    .any(|s| s.same_identity(student.id_kind, &student.identifier))
                {
                    return Err(RecordError::Conflict(format!(
                        "{:?} `{}` is already registered",
                        student.id_kind, student.identifier
                    )));
                }
                students.insert(0, student.clone());
                Ok(student)
            },
            |student| {
                json!({
                    "name": student.name,
                    "id_kind": student.id_kind,
                    "identifier": student.identifier,
                    "active": student.active,
                })
            },
        )
    }

    pub fn update(&self, student_id: Uuid, patch: StudentPatch) -> Result<Student, RecordError> {
        let fields = patch_details(&patch);
        self.mutate(
            AuditAction::StudentUpdated,
            student_id,
            |students| apply_patch(students, student_id, &patch),
            |_| fields,
        )
    }

    /// Logs STUDENT_UPDATED then STUDENT_STATUS_CHANGED with no other entry between them.
    pub fn set_active(&self, student_id: Uuid, active: bool) -> Result<Student, RecordError> {
        let patch = StudentPatch {
            active: Some(active),
            ..StudentPatch::default()
        };
        let fields = patch_details(&patch);
        self.mutate_logged(
            student_id,
            |students| apply_patch(students, student_id, &patch),
            |_| {
                vec![
                    (AuditAction::StudentUpdated, fields),
                    (AuditAction::StudentStatusChanged, json!({ "active": active })),
                ]
            },
        )
    }

    pub fn delete(&self, student_id: Uuid) -> Result<(), RecordError> {
        self.mutate(
            AuditAction::StudentRemoved,
            student_id,
            |students| {
                let position = students
                    .iter()
                    .position(|s| s.id == student_id)
                    .ok_or_else(|| student_not_found(student_id))?;
                Ok(students.remove(position))
            },
            |removed| json!({ "courses_removed": removed.courses.len() }),
        )?;
        Ok(())
    }

    pub fn list_courses(
        &self,
        student_id: Uuid,
        filter: &CourseFilter,
    ) -> Result<Vec<Course>, RecordError> {
        let stage = filter
            .graded_stage
            .as_deref()
            .map(str::parse::<Stage>)
            .transpose()?;
        let needle = filter.name.as_ref().map(|n| n.to_lowercase());

        let student = self.get(student_id)?;
        Ok(student
            .courses
            .into_iter()
            .filter(|c| {
                needle
                    .as_ref()
                    .map_or(true, |n| c.name.to_lowercase().contains(n))
            })
            .filter(|c| stage.map_or(true, |stage| c.grades.get(stage).is_some()))
            .filter(|c| within(c.registered_on, filter.registered_from, filter.registered_to))
            .collect())
    }

    pub fn get_course(&self, student_id: Uuid, course_id: Uuid) -> Result<Course, RecordError> {
        self.get(student_id)?
            .course(course_id)
            .cloned()
            .ok_or_else(|| course_not_found(course_id))
    }

    pub fn add_course(
        &self,
        student_id: Uuid,
        name: String,
        registered_on: Option<NaiveDate>,
    ) -> Result<Course, RecordError> {
        self.mutate(
            AuditAction::CourseCreated,
            student_id,
            |students| {
                let student = students
                    .iter_mut()
                    .find(|s| s.id == student_id)
                    .ok_or_else(|| student_not_found(student_id))?;
                let course = Course::new(name, registered_on.unwrap_or_else(today));
                student.courses.insert(0, course.clone());
                Ok(course)
            },
            |course| json!({ "course_id": course.id, "name": course.name }),
        )
    }

    pub fn update_course(
        &self,
        student_id: Uuid,
        course_id: Uuid,
        patch: CoursePatch,
    ) -> Result<Course, RecordError> {
        let details = json!({
            "course_id": course_id,
            "name": patch.name,
            "registered_on": patch.registered_on,
        });

        self.mutate(
            AuditAction::CourseUpdated,
            student_id,
            |students| {
                let course = students
                    .iter_mut()
                    .find(|s| s.id == student_id)
                    .ok_or_else(|| student_not_found(student_id))?
                    .course_mut(course_id)
                    .ok_or_else(|| course_not_found(course_id))?;

                if let Some(name) = patch.name {
                    course.name = name;
                }
                if let Some(date) = patch.registered_on {
                    course.registered_on = date;
                }
                Ok(course.clone())
            },
            |_| details,
        )
    }

    pub fn remove_course(&self, student_id: Uuid, course_id: Uuid) -> Result<(), RecordError> {
        self.mutate(
            AuditAction::CourseRemoved,
            student_id,
            |students| {
                let student = students
                    .iter_mut()
                    .find(|s| s.id == student_id)
                    .ok_or_else(|| student_not_found(student_id))?;
                let before = student.courses.len();
                student.courses.retain(|c| c.id != course_id);
                if student.courses.len() == before {
                    return Err(course_not_found(course_id));
                }
                Ok(())
            },
            |_| json!({ "course_id": course_id }),
        )
    }

    pub fn set_grade(
        &self,
        student_id: Uuid,
        course_id: Uuid,
        stage: &str,
        value: f64,
    ) -> Result<Course, RecordError> {
        let stage: Stage = stage.parse()?;

        self.mutate(
            AuditAction::GradeUpdated,
            student_id,
            |students| {
                let course = students
                    .iter_mut()
                    .find(|s| s.id == student_id)
                    .ok_or_else(|| student_not_found(student_id))?
                    .course_mut(course_id)
                    .ok_or_else(|| course_not_found(course_id))?;
                course.grades.set(stage, value);
                Ok(course.clone())
            },
            |course| {
                json!({
                    "course_id": course_id,
                    "stage": stage,
                    "value": value,
                    "average": course.average(),
                    "status": course.status(),
                })
            },
        )
    }
}
