mod schema;

pub use schema::Database;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Loan period added to the borrow date, and to the due date on renewal.
pub const LOAN_PERIOD_DAYS: i64 = 30;

/// User account role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular library member.
    Reader,
    /// Library administrator.
    Admin,
}

impl Role {
    /// Stored text representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Reader => "reader",
            Role::Admin => "admin",
        }
    }

    /// Parse the stored text representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reader" => Some(Role::Reader),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Role::parse(value.as_str()?).ok_or(FromSqlError::InvalidType)
    }
}

/// Lifecycle state of a borrowing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoanStatus {
    /// Book is out on loan.
    Borrowed,
    /// Book has been given back.
    Returned,
}

impl LoanStatus {
    /// Stored text representation.
    pub fn as_str(self) -> &'static str {
        match self {
            LoanStatus::Borrowed => "borrowed",
            LoanStatus::Returned => "returned",
        }
    }

    /// Parse the stored text representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "borrowed" => Some(LoanStatus::Borrowed),
            "returned" => Some(LoanStatus::Returned),
            _ => None,
        }
    }
}

impl ToSql for LoanStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for LoanStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        LoanStatus::parse(value.as_str()?).ok_or(FromSqlError::InvalidType)
    }
}

/// Category of user feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackKind {
    /// Improvement idea.
    Suggestion,
    /// Complaint about the service.
    Complaint,
    /// Acquisition request.
    Request,
}

impl FeedbackKind {
    /// Stored text representation.
    pub fn as_str(self) -> &'static str {
        match self {
            FeedbackKind::Suggestion => "suggestion",
            FeedbackKind::Complaint => "complaint",
            FeedbackKind::Request => "request",
        }
    }

    /// Parse the stored text representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "suggestion" => Some(FeedbackKind::Suggestion),
            "complaint" => Some(FeedbackKind::Complaint),
            "request" => Some(FeedbackKind::Request),
            _ => None,
        }
    }
}

impl ToSql for FeedbackKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for FeedbackKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        FeedbackKind::parse(value.as_str()?).ok_or(FromSqlError::InvalidType)
    }
}

/// Processing state of a feedback entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackStatus {
    /// Waiting for an admin reply.
    Pending,
    /// Answered by an admin.
    Replied,
}

impl FeedbackStatus {
    /// Stored text representation.
    pub fn as_str(self) -> &'static str {
        match self {
            FeedbackStatus::Pending => "pending",
            FeedbackStatus::Replied => "replied",
        }
    }

    /// Parse the stored text representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FeedbackStatus::Pending),
            "replied" => Some(FeedbackStatus::Replied),
            _ => None,
        }
    }
}

impl ToSql for FeedbackStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for FeedbackStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        FeedbackStatus::parse(value.as_str()?).ok_or(FromSqlError::InvalidType)
    }
}

/// User account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique user ID.
    pub id: i64,
    /// Username for login.
    pub username: String,
    /// Argon2 password hash.
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// Email address.
    pub email: Option<String>,
    /// Phone number, used for password reset.
    pub phone: Option<String>,
    /// Account role.
    pub role: Role,
    /// Special reader category (e.g. student, senior).
    pub special_reader_type: Option<String>,
    /// Account creation timestamp (RFC 3339).
    pub created_at: String,
    /// Consecutive failed login attempts since the last success.
    pub login_attempts: u32,
    /// Lock expiry timestamp (RFC 3339), if the account is locked.
    pub locked_until: Option<String>,
}

/// Catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    /// Unique book ID.
    pub id: i64,
    /// Book title.
    pub title: String,
    /// Primary author.
    pub author: Option<String>,
    /// ISBN.
    pub isbn: Option<String>,
    /// Category name.
    pub category: Option<String>,
    /// Publisher.
    pub publisher: Option<String>,
    /// Total copies owned by the library.
    pub total_quantity: i64,
    /// Copies currently on the shelf.
    pub available_quantity: i64,
    /// Short description.
    pub description: Option<String>,
    /// Catalog entry creation timestamp (RFC 3339).
    pub created_at: String,
}

/// One loan of one book to one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BorrowingRecord {
    /// Unique record ID.
    pub id: i64,
    /// Borrowing user.
    pub user_id: i64,
    /// Borrowed book.
    pub book_id: i64,
    /// Loan start timestamp (RFC 3339).
    pub borrow_date: String,
    /// Due timestamp (RFC 3339).
    pub due_date: String,
    /// Return timestamp (RFC 3339), set exactly once.
    pub return_date: Option<String>,
    /// Loan lifecycle state.
    pub status: LoanStatus,
    /// Post-return rating, 1 to 5.
    pub rating: Option<i64>,
}

/// Borrowing record joined with book details, for history listings.
#[derive(Debug, Clone, Serialize)]
pub struct BorrowingHistoryEntry {
    /// The borrowing record.
    #[serde(flatten)]
    pub record: BorrowingRecord,
    /// Book title.
    pub title: String,
    /// Book author.
    pub author: Option<String>,
    /// Book ISBN.
    pub isbn: Option<String>,
}

/// User feedback entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    /// Unique feedback ID.
    pub id: i64,
    /// Submitting user.
    pub user_id: i64,
    /// Feedback category.
    pub kind: FeedbackKind,
    /// Feedback text.
    pub content: String,
    /// Processing state.
    pub status: FeedbackStatus,
    /// Admin reply text.
    pub admin_reply: Option<String>,
    /// Submission timestamp (RFC 3339).
    pub created_at: String,
}

/// Feedback entry joined with the submitting username, for admin listings.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackWithUser {
    /// The feedback entry.
    #[serde(flatten)]
    pub feedback: Feedback,
    /// Username of the submitter.
    pub username: String,
}

/// Fields for a new catalog entry. Available quantity starts equal to total.
#[derive(Debug, Clone, Deserialize)]
pub struct NewBook {
    /// Book title.
    pub title: String,
    /// Primary author.
    pub author: Option<String>,
    /// ISBN.
    pub isbn: Option<String>,
    /// Category name.
    pub category: Option<String>,
    /// Publisher.
    pub publisher: Option<String>,
    /// Total copies owned by the library.
    pub total_quantity: i64,
    /// Short description.
    pub description: Option<String>,
}

/// Partial update for a catalog entry. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookUpdate {
    /// New title.
    pub title: Option<String>,
    /// New author.
    pub author: Option<String>,
    /// New ISBN.
    pub isbn: Option<String>,
    /// New category.
    pub category: Option<String>,
    /// New publisher.
    pub publisher: Option<String>,
    /// New total quantity; available is recomputed against active loans.
    pub total_quantity: Option<i64>,
    /// New description.
    pub description: Option<String>,
}

/// Number of users holding a given role.
#[derive(Debug, Clone, Serialize)]
pub struct RoleCount {
    /// Role name.
    pub role: Role,
    /// Users with that role.
    pub count: i64,
}

/// Number of users of a given special reader type.
#[derive(Debug, Clone, Serialize)]
pub struct SpecialReaderCount {
    /// Special reader type.
    pub special_reader_type: String,
    /// Users of that type.
    pub count: i64,
}

/// Aggregate user statistics.
#[derive(Debug, Clone, Serialize)]
pub struct UserStatistics {
    /// Total registered users.
    pub total_users: i64,
    /// Breakdown by role.
    pub role_stats: Vec<RoleCount>,
    /// Breakdown by special reader type.
    pub special_reader_stats: Vec<SpecialReaderCount>,
}

/// Borrow count for one title.
#[derive(Debug, Clone, Serialize)]
pub struct PopularBook {
    /// Book title.
    pub title: String,
    /// Book author.
    pub author: Option<String>,
    /// Times borrowed.
    pub borrow_count: i64,
}

/// Borrow count for one category.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryCount {
    /// Category name.
    pub category: String,
    /// Times books in the category were borrowed.
    pub borrow_count: i64,
}

/// Aggregate borrowing statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BorrowingStatistics {
    /// All borrowing records, past and present.
    pub total_borrowings: i64,
    /// Records currently in the borrowed state.
    pub current_borrowings: i64,
    /// Ten most borrowed titles.
    pub popular_books: Vec<PopularBook>,
    /// Borrow counts per category.
    pub category_stats: Vec<CategoryCount>,
}

/// Current time.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp as an RFC 3339 string for storage.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a stored RFC 3339 timestamp.
pub fn parse_timestamp(s: &str) -> crate::error::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| crate::error::AppError::Storage(format!("Invalid stored timestamp '{s}': {e}")))
}

/// Due date for a loan starting (or renewed) at the given instant.
pub fn extend_by_loan_period(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt + Duration::days(LOAN_PERIOD_DAYS)
}
