//! HTTP request handlers.

use crate::db::{
    Book, BookUpdate, BorrowingHistoryEntry, BorrowingStatistics, Feedback, FeedbackKind,
    FeedbackWithUser, NewBook, Role, User, UserStatistics,
};
use crate::error::{AppError, Result};
use crate::server::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ============================================================================
// SERVICE INFO
// ============================================================================

/// API root: service name and endpoint groups.
pub async fn api_index() -> Json<Value> {
    Json(json!({
        "name": "librarian-rs",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/api/auth", "/api/books", "/api/admin"],
    }))
}

/// Health check.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

// ============================================================================
// AUTH API
// ============================================================================

/// Registration request.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    username: String,
    password: String,
    email: Option<String>,
    phone: Option<String>,
}

/// Registration response.
#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    user_id: i64,
}

/// Register a new reader account.
pub async fn auth_register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>)> {
    let user = state.auth.register(
        &req.username,
        &req.password,
        req.email.as_deref(),
        req.phone.as_deref(),
    )?;

    Ok((StatusCode::CREATED, Json(RegisterResponse { user_id: user.id })))
}

/// Login request.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

/// Login response: the user profile without credential material.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    id: i64,
    username: String,
    email: Option<String>,
    role: Role,
    special_reader_type: Option<String>,
}

/// Authenticate a user.
pub async fn auth_login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    let user = state.auth.authenticate(&req.username, &req.password)?;

    Ok(Json(LoginResponse {
        id: user.id,
        username: user.username,
        email: user.email,
        role: user.role,
        special_reader_type: user.special_reader_type,
    }))
}

/// Profile update request.
#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    user_id: i64,
    email: Option<String>,
    phone: Option<String>,
    special_reader_type: Option<String>,
}

/// Update contact details and special reader type.
pub async fn auth_update_profile(
    State(state): State<AppState>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<StatusCode> {
    state.auth.update_profile(
        req.user_id,
        req.email.as_deref(),
        req.phone.as_deref(),
        req.special_reader_type.as_deref(),
    )?;
    Ok(StatusCode::OK)
}

/// Password reset request.
#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    username: String,
    phone: String,
    new_password: String,
}

/// Reset a password against a username + phone match.
pub async fn auth_reset_password(
    State(state): State<AppState>,
    Json(req): Json<ResetPasswordRequest>,
) -> Result<StatusCode> {
    state
        .auth
        .reset_password(&req.username, &req.phone, &req.new_password)?;
    Ok(StatusCode::OK)
}

// ============================================================================
// CATALOG API
// ============================================================================

/// Search query parameters.
#[derive(Debug, Deserialize)]
pub struct SearchParams {
    query: Option<String>,
    category: Option<String>,
}

/// Search the catalog by title/author/ISBN substring or exact category.
pub async fn books_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<Book>>> {
    let books = match (params.category.as_deref(), params.query.as_deref()) {
        (Some(category), _) if !category.is_empty() => state.db.books_by_category(category)?,
        (_, Some(query)) if !query.is_empty() => state.db.search_books(query)?,
        _ => state.db.browse_books(50)?,
    };
    Ok(Json(books))
}

/// List all books, newest first.
pub async fn books_list(State(state): State<AppState>) -> Result<Json<Vec<Book>>> {
    Ok(Json(state.db.list_books()?))
}

/// Book detail.
pub async fn book_detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Book>> {
    let book = state
        .db
        .get_book(id)?
        .ok_or_else(|| AppError::NotFound(format!("Book {}", id)))?;
    Ok(Json(book))
}

/// Distinct category names.
pub async fn book_categories(State(state): State<AppState>) -> Result<Json<Vec<String>>> {
    Ok(Json(state.db.list_categories()?))
}

// ============================================================================
// LENDING API
// ============================================================================

/// Borrow request.
#[derive(Debug, Deserialize)]
pub struct BorrowRequest {
    user_id: i64,
    book_id: i64,
}

/// Borrow response.
#[derive(Debug, Serialize)]
pub struct BorrowResponse {
    record_id: i64,
    due_date: String,
}

/// Borrow a book.
pub async fn borrow_book(
    State(state): State<AppState>,
    Json(req): Json<BorrowRequest>,
) -> Result<(StatusCode, Json<BorrowResponse>)> {
    let (record_id, due_date) = state.db.borrow_book(req.user_id, req.book_id)?;

    tracing::info!(user_id = req.user_id, book_id = req.book_id, record_id, "Book borrowed");

    Ok((
        StatusCode::CREATED,
        Json(BorrowResponse {
            record_id,
            due_date,
        }),
    ))
}

/// Return request.
#[derive(Debug, Deserialize)]
pub struct ReturnRequest {
    record_id: i64,
}

/// Return a borrowed book.
pub async fn return_book(
    State(state): State<AppState>,
    Json(req): Json<ReturnRequest>,
) -> Result<StatusCode> {
    state.db.return_book(req.record_id)?;
    tracing::info!(record_id = req.record_id, "Book returned");
    Ok(StatusCode::OK)
}

/// Renewal request.
#[derive(Debug, Deserialize)]
pub struct RenewRequest {
    record_id: i64,
}

/// Renewal response.
#[derive(Debug, Serialize)]
pub struct RenewResponse {
    new_due_date: String,
}

/// Renew a loan.
pub async fn renew_book(
    State(state): State<AppState>,
    Json(req): Json<RenewRequest>,
) -> Result<Json<RenewResponse>> {
    let new_due_date = state.db.renew_book(req.record_id)?;
    Ok(Json(RenewResponse { new_due_date }))
}

/// Rating request.
#[derive(Debug, Deserialize)]
pub struct RateRequest {
    record_id: i64,
    rating: i64,
}

/// Rate a returned book.
pub async fn rate_book(
    State(state): State<AppState>,
    Json(req): Json<RateRequest>,
) -> Result<StatusCode> {
    state.db.rate_record(req.record_id, req.rating)?;
    Ok(StatusCode::OK)
}

/// Borrowing history of a user.
pub async fn my_borrowings(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<Vec<BorrowingHistoryEntry>>> {
    Ok(Json(state.db.user_borrowings(user_id)?))
}

// ============================================================================
// FEEDBACK API
// ============================================================================

/// Feedback submission request.
#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    user_id: i64,
    #[serde(default)]
    kind: Option<FeedbackKind>,
    content: String,
}

/// Feedback submission response.
#[derive(Debug, Serialize)]
pub struct FeedbackResponse {
    feedback_id: i64,
}

/// Submit feedback. A missing kind defaults to suggestion.
pub async fn feedback_submit(
    State(state): State<AppState>,
    Json(req): Json<FeedbackRequest>,
) -> Result<(StatusCode, Json<FeedbackResponse>)> {
    if req.content.trim().is_empty() {
        return Err(AppError::InvalidInput(
            "Feedback content must not be empty".to_string(),
        ));
    }

    let kind = req.kind.unwrap_or(FeedbackKind::Suggestion);
    let feedback_id = state.db.submit_feedback(req.user_id, kind, &req.content)?;

    Ok((StatusCode::CREATED, Json(FeedbackResponse { feedback_id })))
}

/// Feedback entries of a user.
pub async fn feedback_my(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<Vec<Feedback>>> {
    Ok(Json(state.db.user_feedback(user_id)?))
}

// ============================================================================
// ADMIN API
// ============================================================================

/// Book creation response.
#[derive(Debug, Serialize)]
pub struct AddBookResponse {
    book_id: i64,
}

/// Add a catalog entry.
pub async fn admin_add_book(
    State(state): State<AppState>,
    Json(book): Json<NewBook>,
) -> Result<(StatusCode, Json<AddBookResponse>)> {
    if book.title.trim().is_empty() {
        return Err(AppError::InvalidInput(
            "Book title must not be empty".to_string(),
        ));
    }
    if book.total_quantity < 0 {
        return Err(AppError::InvalidInput(
            "Total quantity must not be negative".to_string(),
        ));
    }

    let book_id = state.db.add_book(&book)?;
    Ok((StatusCode::CREATED, Json(AddBookResponse { book_id })))
}

/// Update a catalog entry; returns the updated book.
pub async fn admin_update_book(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<BookUpdate>,
) -> Result<Json<Book>> {
    if update.total_quantity.is_some_and(|q| q < 0) {
        return Err(AppError::InvalidInput(
            "Total quantity must not be negative".to_string(),
        ));
    }

    Ok(Json(state.db.update_book(id, &update)?))
}

/// Delete a catalog entry.
pub async fn admin_delete_book(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    state.db.delete_book(id)?;
    Ok(StatusCode::OK)
}

/// List all users.
pub async fn admin_list_users(State(state): State<AppState>) -> Result<Json<Vec<User>>> {
    Ok(Json(state.auth.list_users()?))
}

/// Aggregate user statistics.
pub async fn admin_user_statistics(
    State(state): State<AppState>,
) -> Result<Json<UserStatistics>> {
    Ok(Json(state.db.user_statistics()?))
}

/// Aggregate borrowing statistics.
pub async fn admin_borrowing_statistics(
    State(state): State<AppState>,
) -> Result<Json<BorrowingStatistics>> {
    Ok(Json(state.db.borrowing_statistics()?))
}

/// All feedback entries with submitter usernames.
pub async fn admin_list_feedback(
    State(state): State<AppState>,
) -> Result<Json<Vec<FeedbackWithUser>>> {
    Ok(Json(state.db.list_feedback()?))
}

/// Feedback reply request.
#[derive(Debug, Deserialize)]
pub struct ReplyRequest {
    admin_reply: String,
}

/// Reply to a feedback entry.
pub async fn admin_reply_feedback(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ReplyRequest>,
) -> Result<StatusCode> {
    if req.admin_reply.trim().is_empty() {
        return Err(AppError::InvalidInput(
            "Reply must not be empty".to_string(),
        ));
    }

    state.db.reply_feedback(id, &req.admin_reply)?;
    Ok(StatusCode::OK)
}
