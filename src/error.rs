use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// Entity absent (user, book or borrowing record).
    #[error("{0} not found")]
    NotFound(String),

    /// No available copies left to borrow.
    #[error("No copies of book {0} are available")]
    OutOfStock(i64),

    /// The user already holds an active loan for this book.
    #[error("Book {0} is already borrowed and not yet returned")]
    AlreadyBorrowed(i64),

    /// The borrowing record is already in the returned state.
    #[error("Borrowing record {0} has already been returned")]
    AlreadyReturned(i64),

    /// Operation requires an active loan.
    #[error("Borrowing record {0} is not in the borrowed state")]
    NotBorrowed(i64),

    /// Rating requires the book to be returned first.
    #[error("Borrowing record {0} has not been returned yet")]
    NotReturned(i64),

    /// Rating outside the 1..=5 range.
    #[error("Rating must be between 1 and 5, got {0}")]
    InvalidRating(i64),

    /// Book still referenced by active loans.
    #[error("Book {0} has active loans and cannot be removed or shrunk")]
    HasActiveLoans(i64),

    /// Wrong password; attempts left before lockout.
    #[error("Invalid username or password, {remaining} attempts remaining")]
    InvalidCredentials {
        /// Attempts left before the account is locked.
        remaining: u32,
    },

    /// Account locked by repeated failed logins.
    #[error("Account is locked, try again in {minutes} minutes")]
    AccountLocked {
        /// Whole minutes until the lock expires.
        minutes: i64,
    },

    /// Username or phone number already registered.
    #[error("{0}")]
    DuplicateIdentity(String),

    /// Malformed or missing input value.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// SQLite transaction or connectivity failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidCredentials { .. } => StatusCode::UNAUTHORIZED,
            AppError::AccountLocked { .. } => StatusCode::FORBIDDEN,
            AppError::OutOfStock(_)
            | AppError::AlreadyBorrowed(_)
            | AppError::AlreadyReturned(_)
            | AppError::NotBorrowed(_)
            | AppError::NotReturned(_)
            | AppError::InvalidRating(_)
            | AppError::HasActiveLoans(_)
            | AppError::DuplicateIdentity(_)
            | AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::Storage(_) | AppError::Config(_) | AppError::Io(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request error");
        }

        (status, self.to_string()).into_response()
    }
}

/// Result type alias for the application.
pub type Result<T> = std::result::Result<T, AppError>;
