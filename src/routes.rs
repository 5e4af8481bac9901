use std::sync::Arc;

use axum::extract::{FromRequest, Path, Query, RequestParts, TypedHeader};
use axum::handler::Handler;
use axum::headers::authorization::Bearer;
use axum::headers::Authorization;
use axum::routing::{get, patch, post};
use axum::{async_trait, Extension, Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use uuid::Uuid;

use gradebook::audit::DEFAULT_LIMIT;
use gradebook::auth::AuthResult;
use gradebook::models::{AuditView, CourseView, IdKind, StudentView};
use gradebook::repository::{
    CourseFilter, CoursePatch, NewStudent, RecordError, StudentFilter, StudentPatch,
};
use gradebook::util::{nonempty, parse_date};
use gradebook::Gradebook;

use crate::err::{handler404, Error, Success};

pub type Shared = Arc<Gradebook>;
pub type Payload<T> = Result<Json<Success<T>>, Error>;

pub fn proceeds<V: Serialize>(value: V) -> Payload<V> {
    Ok(Json(Success::of(value)))
}

/// Runs a store call on the blocking pool; every store operation touches the disk.
pub async fn blocking<T, E>(
    book: &Shared,
    call: impl FnOnce(&Gradebook) -> Result<T, E> + Send + 'static,
) -> Result<T, Error>
where
    T: Send + 'static,
    E: Into<Error> + Send + 'static,
{
    let book = book.clone();
    tokio::task::spawn_blocking(move || call(&book))
        .await?
        .map_err(Into::into)
}

pub fn router(book: Shared) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/change-password", post(change_password))
        .route("/students", get(list_students).post(create_student))
        .route(
            "/students/:id",
            get(read_student).put(update_student).delete(delete_student),
        )
        .route("/students/:id/status", patch(set_status))
        .route("/students/:id/courses", get(list_courses).post(create_course))
        .route(
            "/students/:id/courses/:course_id",
            get(read_course).put(update_course).delete(delete_course),
        )
        .route("/students/:id/courses/:course_id/grade", patch(set_grade))
        .route("/logs", get(list_logs))
        .fallback(handler404.into_service())
        .layer(ServiceBuilder::new().layer(Extension(book)))
}

/// A request carrying a live bearer token.
pub struct Session {
    pub token: String,
}

#[async_trait]
impl<B> FromRequest<B> for Session
where
    B: Send,
{
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request(req)
                .await
                .map_err(|_| Error::unauthorized("Missing bearer token"))?;
        let Extension(book) = Extension::<Shared>::from_request(req)
            .await
            .map_err(|err| Error::InternalError {
                kind: "ExtensionError",
                message: err.to_string(),
            })?;

        let token = bearer.token().to_string();
        let checked = token.clone();
        match blocking(&book, move |book| book.tokens.check(&checked)).await? {
            AuthResult::Success => Ok(Session { token }),
            AuthResult::SessionExpired => Err(Error::unauthorized("Token expired")),
            AuthResult::InvalidSession => Err(Error::unauthorized("Invalid token")),
        }
    }
}

fn optional_date(raw: Option<&str>) -> Result<Option<NaiveDate>, RecordError> {
    nonempty(raw).map(|s| parse_date(&s)).transpose()
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub service: &'static str,
    pub version: &'static str,
}

async fn service_info() -> Payload<ServiceInfo> {
    proceeds(ServiceInfo {
        service: "Gradebook API",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginBody {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub message: &'static str,
}

async fn login(
    Extension(book): Extension<Shared>,
    Json(body): Json<LoginBody>,
) -> Payload<IssuedToken> {
    if body.password.is_empty() {
        return Err(Error::InvalidPayload {
            message: "`password` parameter was empty".to_string(),
        });
    }
    let token = blocking(&book, move |book| book.login(&body.username, &body.password)).await?;
    proceeds(IssuedToken { token })
}

async fn logout(Extension(book): Extension<Shared>, session: Session) -> Payload<Message> {
    blocking(&book, move |book| book.tokens.revoke(&session.token)).await?;
    proceeds(Message {
        message: "Logged out",
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangePasswordBody {
    pub old_password: String,
    pub new_password: String,
}

async fn change_password(
    Extension(book): Extension<Shared>,
    session: Session,
    Json(body): Json<ChangePasswordBody>,
) -> Payload<Message> {
    blocking(&book, move |book| {
        book.credentials
            .change_password(&body.old_password, &body.new_password)
            .map_err(|err| match err {
                gradebook::auth::AuthError::InvalidCredential => Error::InvalidPayload {
                    message: "Old password is incorrect".to_string(),
                },
                other => other.into(),
            })?;
        book.tokens.revoke(&session.token).map_err(Error::from)
    })
    .await?;
    proceeds(Message {
        message: "Password changed, log in again",
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StudentQuery {
    pub name: Option<String>,
    pub id_kind: Option<String>,
    pub identifier: Option<String>,
    pub date_min: Option<String>,
    pub date_max: Option<String>,
}

impl StudentQuery {
    fn into_filter(self) -> Result<StudentFilter, RecordError> {
        Ok(StudentFilter {
            name: nonempty(self.name.as_deref()),
            id_kind: nonempty(self.id_kind.as_deref())
                .map(|kind| kind.parse::<IdKind>())
                .transpose()?,
            identifier: nonempty(self.identifier.as_deref()),
            registered_from: optional_date(self.date_min.as_deref())?,
            registered_to: optional_date(self.date_max.as_deref())?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Students {
    pub students: Vec<StudentView>,
}

async fn list_students(
    Extension(book): Extension<Shared>,
    _session: Session,
    Query(query): Query<StudentQuery>,
) -> Payload<Students> {
    let filter = query.into_filter()?;
    let students = blocking(&book, move |book| book.records.list(&filter)).await?;
    proceeds(Students {
        students: students.iter().map(StudentView::from).collect(),
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateStudent {
    pub name: String,
    pub id_kind: IdKind,
    pub identifier: String,
    pub registered_on: Option<String>,
    pub active: Option<bool>,
}

async fn create_student(
    Extension(book): Extension<Shared>,
    _session: Session,
    Json(body): Json<CreateStudent>,
) -> Payload<StudentView> {
    let new = NewStudent {
        name: body.name,
        id_kind: body.id_kind,
        identifier: body.identifier,
        registered_on: optional_date(body.registered_on.as_deref())?,
        active: body.active.unwrap_or(true),
    };
    let student = blocking(&book, move |book| book.records.create(new)).await?;
    proceeds(StudentView::from(&student))
}

async fn read_student(
    Extension(book): Extension<Shared>,
    _session: Session,
    Path(id): Path<Uuid>,
) -> Payload<StudentView> {
    let student = blocking(&book, move |book| book.records.get(id)).await?;
    proceeds(StudentView::from(&student))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateStudent {
    pub name: Option<String>,
    pub id_kind: Option<IdKind>,
    pub identifier: Option<String>,
    pub registered_on: Option<String>,
    pub active: Option<bool>,
}

async fn update_student(
    Extension(book): Extension<Shared>,
    _session: Session,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateStudent>,
) -> Payload<StudentView> {
    let registered_on = body
        .registered_on
        .as_deref()
        .map(parse_date)
        .transpose()?;
    let patch = StudentPatch {
        name: body.name,
        id_kind: body.id_kind,
        identifier: body.identifier,
        registered_on,
        active: body.active,
    };
    let student = blocking(&book, move |book| book.records.update(id, patch)).await?;
    proceeds(StudentView::from(&student))
}

async fn delete_student(
    Extension(book): Extension<Shared>,
    _session: Session,
    Path(id): Path<Uuid>,
) -> Payload<Message> {
    blocking(&book, move |book| book.records.delete(id)).await?;
    proceeds(Message {
        message: "Student removed",
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusBody {
    pub active: bool,
}

async fn set_status(
    Extension(book): Extension<Shared>,
    _session: Session,
    Path(id): Path<Uuid>,
    Json(body): Json<StatusBody>,
) -> Payload<StudentView> {
    let student = blocking(&book, move |book| book.records.set_active(id, body.active)).await?;
    proceeds(StudentView::from(&student))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CourseQuery {
    pub name: Option<String>,
    pub stage_with_grade: Option<String>,
    pub date_min: Option<String>,
    pub date_max: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Courses {
    pub courses: Vec<CourseView>,
}

async fn list_courses(
    Extension(book): Extension<Shared>,
    _session: Session,
    Path(id): Path<Uuid>,
    Query(query): Query<CourseQuery>,
) -> Payload<Courses> {
    let filter = CourseFilter {
        name: nonempty(query.name.as_deref()),
        graded_stage: nonempty(query.stage_with_grade.as_deref()),
        registered_from: optional_date(query.date_min.as_deref())?,
        registered_to: optional_date(query.date_max.as_deref())?,
    };
    let courses = blocking(&book, move |book| book.records.list_courses(id, &filter)).await?;
    proceeds(Courses {
        courses: courses.iter().map(CourseView::from).collect(),
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCourse {
    pub name: String,
    pub registered_on: Option<String>,
}

async fn create_course(
    Extension(book): Extension<Shared>,
    _session: Session,
    Path(id): Path<Uuid>,
    Json(body): Json<CreateCourse>,
) -> Payload<CourseView> {
    let registered_on = optional_date(body.registered_on.as_deref())?;
    let course =
        blocking(&book, move |book| book.records.add_course(id, body.name, registered_on)).await?;
    proceeds(CourseView::from(&course))
}

async fn read_course(
    Extension(book): Extension<Shared>,
    _session: Session,
    Path((id, course_id)): Path<(Uuid, Uuid)>,
) -> Payload<CourseView> {
    let course = blocking(&book, move |book| book.records.get_course(id, course_id)).await?;
    proceeds(CourseView::from(&course))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateCourse {
    pub name: Option<String>,
    pub registered_on: Option<String>,
}

async fn update_course(
    Extension(book): Extension<Shared>,
    _session: Session,
    Path((id, course_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<UpdateCourse>,
) -> Payload<CourseView> {
    let registered_on = body
        .registered_on
        .as_deref()
        .map(parse_date)
        .transpose()?;
    let patch = CoursePatch {
        name: body.name,
        registered_on,
    };
    let course =
        blocking(&book, move |book| book.records.update_course(id, course_id, patch)).await?;
    proceeds(CourseView::from(&course))
}

async fn delete_course(
    Extension(book): Extension<Shared>,
    _session: Session,
    Path((id, course_id)): Path<(Uuid, Uuid)>,
) -> Payload<Message> {
    blocking(&book, move |book| book.records.remove_course(id, course_id)).await?;
    proceeds(Message {
        message: "Course removed",
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct GradeBody {
    pub stage: String,
    pub value: f64,
}

async fn set_grade(
    Extension(book): Extension<Shared>,
    _session: Session,
    Path((id, course_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<GradeBody>,
) -> Payload<CourseView> {
    let course = blocking(&book, move |book| {
        book.records.set_grade(id, course_id, &body.stage, body.value)
    })
    .await?;
    proceeds(CourseView::from(&course))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogQuery {
    pub student_id: Option<Uuid>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Logs {
    pub logs: Vec<AuditView>,
}

async fn list_logs(
    Extension(book): Extension<Shared>,
    _session: Session,
    Query(query): Query<LogQuery>,
) -> Payload<Logs> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    let logs = blocking(&book, move |book| book.audit.list(query.student_id, limit)).await?;
    proceeds(Logs { logs })
}
