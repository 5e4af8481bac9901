use std::fs;
use std::path::PathBuf;

use gradebook::config::Config;
use gradebook::models::{AuditAction, CourseStatus, IdKind};
use gradebook::repository::{NewStudent, RecordError, StudentFilter};
use gradebook::Gradebook;

fn scratch_config() -> Config {
    let data_dir: PathBuf =
        std::env::temp_dir().join(format!("gradebook-e2e-{}", rand::random::<u32>()));
    Config {
        data_dir,
        keep_plain_identifier: false,
        ..Config::default()
    }
}

#[test]
fn test_enrolment_grading_and_audit_trail() {
    let config = scratch_config();
    let book = Gradebook::open(&config).unwrap();

    let token = book.login("admin", "1234").unwrap();
    assert!(book.tokens.validate(&token).unwrap());

    let student = book
        .records
        .create(NewStudent {
            name: "João Teste".to_string(),
            id_kind: IdKind::Matricula,
            identifier: "2025A0001".to_string(),
            registered_on: Some(gradebook::util::parse_date("2025-11-11").unwrap()),
            active: true,
        })
        .unwrap();
    let course = book
        .records
        .add_course(student.id, "Segurança da Informação".to_string(), None)
        .unwrap();

    for (stage, value) in [("E1", 8.0), ("E2", 7.0), ("E3", 9.0)] {
        book.records
            .set_grade(student.id, course.id, stage, value)
            .unwrap();
    }

    let graded = book.records.get_course(student.id, course.id).unwrap();
    assert_eq!(graded.average(), Some(8.1));
    assert_eq!(graded.status(), CourseStatus::Approved);

    let trail = book.audit.list(Some(student.id), 100).unwrap();
    let actions: Vec<AuditAction> = trail.iter().map(|entry| entry.action).collect();
    assert_eq!(
        actions,
        vec![
            AuditAction::GradeUpdated,
            AuditAction::GradeUpdated,
            AuditAction::GradeUpdated,
            AuditAction::CourseCreated,
            AuditAction::StudentCreated,
        ]
    );
    let stages: Vec<&str> = trail[..3]
        .iter()
        .map(|entry| entry.details["stage"].as_str().unwrap())
        .collect();
    assert_eq!(stages, vec!["E3", "E2", "E1"]);
    assert_eq!(
        trail[0].message,
        format!("GRADE_UPDATED - student={}", student.id)
    );

    // nothing sensitive in clear on disk
    let students_file = fs::read_to_string(config.data_dir.join("students.json")).unwrap();
    assert!(!students_file.contains("2025A0001"));
    let logs_file = fs::read_to_string(config.data_dir.join("logs.json")).unwrap();
    assert!(!logs_file.contains("GRADE_UPDATED - student"));

    book.close().unwrap();
    let _ = fs::remove_dir_all(&config.data_dir);
}

#[test]
fn test_state_survives_reopen() {
    let config = scratch_config();
    let student_id = {
        let book = Gradebook::open(&config).unwrap();
        book.credentials.change_password("1234", "nova_senha").unwrap();
        let student = book
            .records
            .create(NewStudent {
                name: "Ana".to_string(),
                id_kind: IdKind::Cpf,
                identifier: "12345678900".to_string(),
                registered_on: None,
                active: true,
            })
            .unwrap();
        book.close().unwrap();
        student.id
    };

    let book = Gradebook::open(&config).unwrap();
    assert!(book.credentials.verify("admin", "nova_senha").unwrap());
    assert!(!book.credentials.verify("admin", "1234").unwrap());

    let found = book
        .records
        .list(&StudentFilter {
            identifier: Some("12345678900".to_string()),
            ..StudentFilter::default()
        })
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, student_id);

    book.records.delete(student_id).unwrap();
    assert!(matches!(
        book.records.get(student_id),
        Err(RecordError::NotFound(_))
    ));

    let _ = fs::remove_dir_all(&config.data_dir);
}
