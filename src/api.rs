use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::body::StreamBody;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;

use crate::config::Config;
use crate::error::ApiError;
use crate::model::{Role, User};
use crate::ws::RoomRegistry;
use crate::{auth, cart, courses, db, files, messages, rooms, ws};

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool<SqliteConnectionManager>,
    pub config: Config,
    pub registry: Arc<RoomRegistry>,
    pub video_dir: PathBuf,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let video_dir = config.data_dir.join("videos");
        std::fs::create_dir_all(&video_dir)?;
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pool = db::init_pool(&config.db_path)?;
        Ok(Self {
            pool,
            config,
            registry: Arc::new(RoomRegistry::new()),
            video_dir,
        })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/courses", get(list_courses).post(create_course))
        .route("/api/courses/filter", get(filter_courses))
        .route("/api/courses/search", get(search_courses))
        .route(
            "/api/courses/:id",
            get(get_course).put(update_course).delete(delete_course),
        )
        .route("/api/courses/:id/review", post(review_course))
        .route("/api/cart", post(add_to_cart).delete(remove_from_cart))
        .route("/api/cart/:id", get(get_cart))
        .route("/api/rooms/create", post(create_room))
        .route("/api/rooms/join", post(join_room))
        .route("/api/rooms/:id", get(get_room))
        .route("/api/chats/send", post(send_chat))
        .route("/api/chats/:room_id", get(list_chats))
        .route("/uploads/videos/:id", get(serve_video))
        .route("/ws", get(ws_handler))
        .layer(DefaultBodyLimit::max(
            state.config.max_upload_bytes() as usize
        ))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Bearer-token gate for protected handlers. A missing token maps to 401,
/// a token that fails verification to 400.
#[axum::async_trait]
impl FromRequestParts<AppState> for auth::Claims {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| ApiError::Unauthorized("Access Denied".into()))?;
        auth::verify_jwt(state.config.jwt_secret.as_bytes(), token)
            .map_err(|_| ApiError::BadCredentials("Invalid Token".into()))
    }
}

fn conn(state: &AppState) -> Result<PooledConnection<SqliteConnectionManager>, ApiError> {
    state
        .pool
        .get()
        .map_err(|e| ApiError::Server(anyhow::Error::new(e)))
}

/// Translate domain-layer error tags into API outcomes.
fn map_domain(e: anyhow::Error) -> ApiError {
    match e.to_string().as_str() {
        "invalid_rating" => ApiError::Validation("Rating must be between 0 and 5".into()),
        "duplicate_email" => ApiError::Validation("User already exists!".into()),
        "room_not_found" => ApiError::NotFound("Room not found".into()),
        "missing_field" => ApiError::Validation("All fields are required".into()),
        "not_found" => ApiError::NotFound("Not found".into()),
        _ => ApiError::Server(e),
    }
}

fn current_user(state: &AppState, claims: &auth::Claims) -> Result<User, ApiError> {
    let conn = conn(state)?;
    auth::get_user(&conn, &claims.sub)
        .map_err(ApiError::Server)?
        .ok_or_else(|| ApiError::Unauthorized("Access Denied".into()))
}

// ---- auth ----

#[derive(Deserialize)]
struct RegisterReq {
    username: String,
    email: String,
    password: String,
    role: String,
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterReq>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(role) = Role::parse(&req.role) else {
        return Err(ApiError::Validation(
            "Invalid role. Must be 'teacher' or 'student'.".into(),
        ));
    };
    let conn = conn(&state)?;
    if auth::find_user_by_email(&conn, &req.email)
        .map_err(ApiError::Server)?
        .is_some()
    {
        return Err(ApiError::Validation("User already exists!".into()));
    }
    let hash = auth::hash_password(&req.password).map_err(ApiError::Server)?;
    auth::create_user(&conn, &req.username, &req.email, &hash, role).map_err(map_domain)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "User registered successfully!" })),
    ))
}

#[derive(Deserialize)]
struct LoginReq {
    email: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginReq>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = conn(&state)?;
    let found = auth::find_user_by_email(&conn, &req.email).map_err(ApiError::Server)?;
    // same outcome for unknown email and wrong password
    let Some((user, hash)) = found else {
        return Err(ApiError::BadCredentials("Invalid email or password!".into()));
    };
    if !auth::verify_password(&req.password, &hash) {
        return Err(ApiError::BadCredentials("Invalid email or password!".into()));
    }
    let token = auth::issue_jwt(
        state.config.jwt_secret.as_bytes(),
        &user.id.to_string(),
        user.role,
        auth::TOKEN_TTL,
    )
    .map_err(ApiError::Server)?;
    Ok(Json(json!({ "message": "Login successful!", "token": token })))
}

// ---- courses ----

async fn list_courses(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let conn = conn(&state)?;
    let courses = courses::list_courses(&conn).map_err(ApiError::Server)?;
    Ok(Json(courses))
}

async fn filter_courses(
    State(state): State<AppState>,
    Query(filter): Query<courses::CourseFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = conn(&state)?;
    let courses = courses::filter_courses(&conn, &filter).map_err(ApiError::Server)?;
    Ok(Json(courses))
}

#[derive(Deserialize)]
struct SearchQuery {
    title: Option<String>,
}

async fn search_courses(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(title) = query.title.filter(|t| !t.is_empty()) else {
        return Err(ApiError::Validation(
            "Please provide a search query!".into(),
        ));
    };
    let conn = conn(&state)?;
    let courses = courses::search_courses(&conn, &title).map_err(ApiError::Server)?;
    if courses.is_empty() {
        return Err(ApiError::NotFound("No courses found!".into()));
    }
    Ok(Json(courses))
}

async fn get_course(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = conn(&state)?;
    let detail = courses::get_course(&conn, &id)
        .map_err(ApiError::Server)?
        .ok_or_else(|| ApiError::NotFound("Course not found!".into()))?;
    Ok(Json(detail))
}

#[derive(Deserialize)]
struct CreateCourseReq {
    title: String,
    description: String,
    price: f64,
    category: String,
    rating: Option<f64>,
    video_url: Option<String>,
}

async fn create_course(
    claims: auth::Claims,
    State(state): State<AppState>,
    Json(req): Json<CreateCourseReq>,
) -> Result<impl IntoResponse, ApiError> {
    if claims.role != Role::Teacher {
        return Err(ApiError::Forbidden("Only teachers can add courses!".into()));
    }
    let teacher = current_user(&state, &claims)?;
    let conn = conn(&state)?;
    let course = courses::create_course(
        &conn,
        &teacher,
        &req.title,
        &req.description,
        req.price,
        &req.category,
        req.rating,
        req.video_url.as_deref(),
    )
    .map_err(map_domain)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Course added successfully!", "course": course })),
    ))
}

#[derive(Deserialize)]
struct ReviewReq {
    rating: f64,
    comment: String,
}

async fn review_course(
    claims: auth::Claims,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ReviewReq>,
) -> Result<impl IntoResponse, ApiError> {
    if claims.role != Role::Student {
        return Err(ApiError::Forbidden(
            "Only students can review courses!".into(),
        ));
    }
    let student = current_user(&state, &claims)?;
    let conn = conn(&state)?;
    if courses::get_course(&conn, &id)
        .map_err(ApiError::Server)?
        .is_none()
    {
        return Err(ApiError::NotFound("Course not found!".into()));
    }
    let detail =
        courses::add_review(&conn, &id, &student, req.rating, &req.comment).map_err(map_domain)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Review added successfully!", "course": detail })),
    ))
}

/// Multipart update: text fields override stored values, an optional
/// `video` file part is validated as video/* and appended to the course's
/// video list.
async fn update_course(
    claims: auth::Claims,
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let conn = conn(&state)?;
    let detail = courses::get_course(&conn, &id)
        .map_err(ApiError::Server)?
        .ok_or_else(|| ApiError::NotFound("Course not found!".into()))?;
    let course = detail.course;
    if claims.role != Role::Teacher || claims.sub != course.teacher.id.to_string() {
        return Err(ApiError::Forbidden(
            "Unauthorized to update this course!".into(),
        ));
    }

    let mut title = course.title.clone();
    let mut description = course.description.clone();
    let mut price = course.price;
    let mut category = course.category.clone();
    let mut rating = course.rating;
    let mut video_id = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::Validation("Malformed multipart body".into()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "title" => title = field_text(field).await?,
            "description" => description = field_text(field).await?,
            "price" => price = field_number(field).await?,
            "category" => category = field_text(field).await?,
            "rating" => rating = field_number(field).await?,
            "video" => {
                let mime = field.content_type().map(|m| m.to_string());
                if !mime.as_deref().unwrap_or_default().starts_with("video/") {
                    return Err(ApiError::Validation("Only video files are allowed!".into()));
                }
                let ext = field
                    .file_name()
                    .and_then(|n| std::path::Path::new(n).extension())
                    .and_then(|e| e.to_str())
                    .map(|e| e.to_string());
                let data = field
                    .bytes()
                    .await
                    .map_err(|_| ApiError::Validation("Malformed multipart body".into()))?;
                let saved = files::save_video(&state.video_dir, data, ext.as_deref())
                    .await
                    .map_err(ApiError::Server)?;
                video_id = Some(saved);
            }
            _ => {}
        }
    }

    courses::update_course(&conn, &id, &title, &description, price, &category, rating)
        .map_err(map_domain)?;
    if let Some(video_id) = video_id {
        let url = format!("/uploads/videos/{video_id}");
        courses::append_video(&conn, &course.id, &url).map_err(ApiError::Server)?;
    }
    let updated = courses::get_course(&conn, &id)
        .map_err(ApiError::Server)?
        .ok_or_else(|| ApiError::NotFound("Course not found!".into()))?;
    Ok(Json(
        json!({ "message": "Course updated!", "course": updated }),
    ))
}

async fn field_text(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|_| ApiError::Validation("Malformed multipart body".into()))
}

async fn field_number(field: axum::extract::multipart::Field<'_>) -> Result<f64, ApiError> {
    field_text(field)
        .await?
        .parse()
        .map_err(|_| ApiError::Validation("Malformed multipart body".into()))
}

async fn delete_course(
    claims: auth::Claims,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = conn(&state)?;
    let detail = courses::get_course(&conn, &id)
        .map_err(ApiError::Server)?
        .ok_or_else(|| ApiError::NotFound("Course not found!".into()))?;
    if claims.role != Role::Teacher || claims.sub != detail.course.teacher.id.to_string() {
        return Err(ApiError::Forbidden(
            "Unauthorized to delete this course!".into(),
        ));
    }
    courses::delete_course(&conn, &id).map_err(map_domain)?;
    Ok(Json(json!({ "message": "Course deleted successfully!" })))
}

// ---- cart ----

async fn get_cart(
    _claims: auth::Claims,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = conn(&state)?;
    let entries = cart::list_cart(&conn, &user_id).map_err(ApiError::Server)?;
    Ok(Json(entries))
}

#[derive(Deserialize)]
struct AddCartReq {
    course_id: String,
}

async fn add_to_cart(
    claims: auth::Claims,
    State(state): State<AppState>,
    Json(req): Json<AddCartReq>,
) -> Result<impl IntoResponse, ApiError> {
    if claims.role != Role::Student {
        return Err(ApiError::Forbidden(
            "Only students can add courses to the cart!".into(),
        ));
    }
    let conn = conn(&state)?;
    if cart::find_item(&conn, &claims.sub, &req.course_id).map_err(ApiError::Server)? {
        return Err(ApiError::Validation(
            "Course is already in your cart!".into(),
        ));
    }
    cart::add_item(&conn, &claims.sub, &req.course_id).map_err(ApiError::Server)?;
    Ok(Json(json!({ "message": "Course added to cart!" })))
}

#[derive(Deserialize)]
struct RemoveCartReq {
    user_id: String,
    course_id: String,
}

async fn remove_from_cart(
    _claims: auth::Claims,
    State(state): State<AppState>,
    Json(req): Json<RemoveCartReq>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = conn(&state)?;
    let deleted = cart::remove_item(&conn, &req.user_id, &req.course_id).map_err(ApiError::Server)?;
    Ok(Json(json!({ "deleted_count": deleted })))
}

// ---- rooms ----

#[derive(Deserialize)]
struct CreateRoomReq {
    #[serde(default)]
    name: String,
    #[serde(default)]
    teacher_id: String,
}

async fn create_room(
    State(state): State<AppState>,
    Json(req): Json<CreateRoomReq>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.is_empty() || req.teacher_id.is_empty() {
        return Err(ApiError::Validation(
            "Room name and teacher ID are required".into(),
        ));
    }
    let conn = conn(&state)?;
    let room = rooms::create_room(&conn, &req.name, &req.teacher_id).map_err(ApiError::Server)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Room created successfully", "room": room })),
    ))
}

#[derive(Deserialize)]
struct JoinRoomReq {
    room_id: String,
    student_id: String,
}

async fn join_room(
    State(state): State<AppState>,
    Json(req): Json<JoinRoomReq>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = conn(&state)?;
    let room = rooms::join_room(&conn, &req.room_id, &req.student_id).map_err(map_domain)?;
    Ok(Json(
        json!({ "message": "Joined room successfully", "room": room }),
    ))
}

async fn get_room(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = conn(&state)?;
    let detail = rooms::get_room_detail(&conn, &id)
        .map_err(ApiError::Server)?
        .ok_or_else(|| ApiError::NotFound("Room not found".into()))?;
    Ok(Json(detail))
}

// ---- chats (top-level message collection) ----

#[derive(Deserialize)]
struct SendChatReq {
    #[serde(default)]
    room_id: String,
    #[serde(default)]
    sender_id: String,
    #[serde(default)]
    text: String,
}

async fn send_chat(
    State(state): State<AppState>,
    Json(req): Json<SendChatReq>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = conn(&state)?;
    let message = messages::create_message(&conn, &req.room_id, &req.sender_id, &req.text)
        .map_err(map_domain)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Message sent", "message_data": message })),
    ))
}

async fn list_chats(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = conn(&state)?;
    let msgs = messages::list_messages(&conn, &room_id).map_err(ApiError::Server)?;
    Ok(Json(msgs))
}

// ---- videos ----

async fn serve_video(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let path = files::video_path(&state.video_dir, &id);
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| ApiError::NotFound("Video not found".into()))?;
    let stream = ReaderStream::new(file);
    let body = StreamBody::new(stream);
    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_str(mime.as_ref())
            .unwrap_or(header::HeaderValue::from_static("application/octet-stream")),
    );
    Ok((headers, body))
}

// ---- gateway ----

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::handle_socket(socket, state))
}

/// Run the HTTP server bound to the configured address.
pub async fn run_http_server(config: Config) -> Result<()> {
    let addr: SocketAddr = config.bind.parse()?;
    let state = AppState::new(config)?;
    tracing::info!("listening on http://{addr}");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
