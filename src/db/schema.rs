use crate::db::*;
use crate::error::{AppError, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;

/// Database wrapper for thread-safe access.
///
/// A single connection behind a mutex gives every operation a single-writer
/// boundary; the read-modify-write operations below additionally run inside
/// one SQL transaction so partial writes never become visible.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| AppError::Storage(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Open in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Storage(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Initialize database schema.
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Users table
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                email TEXT,
                phone TEXT,
                role TEXT NOT NULL DEFAULT 'reader',
                special_reader_type TEXT,
                created_at TEXT NOT NULL,
                login_attempts INTEGER NOT NULL DEFAULT 0,
                locked_until TEXT
            );

            -- Books table
            CREATE TABLE IF NOT EXISTS books (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                author TEXT,
                isbn TEXT UNIQUE,
                category TEXT,
                publisher TEXT,
                total_quantity INTEGER NOT NULL DEFAULT 1,
                available_quantity INTEGER NOT NULL DEFAULT 1,
                description TEXT,
                created_at TEXT NOT NULL
            );

            -- Borrowing records table.
            -- book_id carries no foreign key: records are never deleted and
            -- must outlive their catalog entry once every copy is returned.
            CREATE TABLE IF NOT EXISTS borrowing_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                book_id INTEGER NOT NULL,
                borrow_date TEXT NOT NULL,
                due_date TEXT NOT NULL,
                return_date TEXT,
                status TEXT NOT NULL DEFAULT 'borrowed',
                rating INTEGER,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            -- Feedback table
            CREATE TABLE IF NOT EXISTS feedback (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                admin_reply TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_records_user ON borrowing_records(user_id);
            CREATE INDEX IF NOT EXISTS idx_records_book_status ON borrowing_records(book_id, status);
            CREATE INDEX IF NOT EXISTS idx_books_category ON books(category);
            CREATE INDEX IF NOT EXISTS idx_feedback_user ON feedback(user_id);
            "#,
        )
        .map_err(|e| AppError::Storage(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    // ========== USER OPERATIONS ==========

    /// Register a new reader account.
    ///
    /// Username and phone collisions are checked inside the same transaction
    /// as the insert, so two concurrent registrations cannot both pass.
    pub fn register_user(
        &self,
        username: &str,
        password_hash: &str,
        email: Option<&str>,
        phone: Option<&str>,
        role: Role,
    ) -> Result<i64> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Storage(format!("Failed to start transaction: {}", e)))?;

        let username_taken: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1)",
                params![username],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Storage(format!("Failed to check username: {}", e)))?;
        if username_taken {
            return Err(AppError::DuplicateIdentity(format!(
                "Username '{}' is already registered",
                username
            )));
        }

        if let Some(phone) = phone {
            let phone_taken: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM users WHERE phone = ?1)",
                    params![phone],
                    |row| row.get(0),
                )
                .map_err(|e| AppError::Storage(format!("Failed to check phone: {}", e)))?;
            if phone_taken {
                return Err(AppError::DuplicateIdentity(
                    "Phone number is already registered".to_string(),
                ));
            }
        }

        tx.execute(
            "INSERT INTO users (username, password_hash, email, phone, role, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                username,
                password_hash,
                email,
                phone,
                role,
                format_timestamp(now()),
            ],
        )
        .map_err(|e| AppError::Storage(format!("Failed to create user: {}", e)))?;

        let id = tx.last_insert_rowid();
        tx.commit()
            .map_err(|e| AppError::Storage(format!("Failed to commit registration: {}", e)))?;
        Ok(id)
    }

    /// Create the default admin account if no admin exists yet.
    ///
    /// Returns true if an account was created.
    pub fn ensure_default_admin(&self, username: &str, password_hash: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Storage(format!("Failed to start transaction: {}", e)))?;

        let admins: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM users WHERE role = ?1",
                params![Role::Admin],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Storage(format!("Failed to count admins: {}", e)))?;
        if admins > 0 {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO users (username, password_hash, role, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                username,
                password_hash,
                Role::Admin,
                format_timestamp(now()),
            ],
        )
        .map_err(|e| AppError::Storage(format!("Failed to create admin: {}", e)))?;

        tx.commit()
            .map_err(|e| AppError::Storage(format!("Failed to commit admin: {}", e)))?;
        Ok(true)
    }

    /// Get user by username.
    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, username, password_hash, email, phone, role, special_reader_type,
                    created_at, login_attempts, locked_until
             FROM users WHERE username = ?1",
            params![username],
            Self::row_to_user,
        )
        .optional()
        .map_err(|e| AppError::Storage(format!("Failed to get user: {}", e)))
    }

    /// Get user by ID.
    pub fn get_user_by_id(&self, id: i64) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, username, password_hash, email, phone, role, special_reader_type,
                    created_at, login_attempts, locked_until
             FROM users WHERE id = ?1",
            params![id],
            Self::row_to_user,
        )
        .optional()
        .map_err(|e| AppError::Storage(format!("Failed to get user: {}", e)))
    }

    /// Get user matching both username and phone, for password reset.
    pub fn find_user_by_username_and_phone(
        &self,
        username: &str,
        phone: &str,
    ) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, username, password_hash, email, phone, role, special_reader_type,
                    created_at, login_attempts, locked_until
             FROM users WHERE username = ?1 AND phone = ?2",
            params![username, phone],
            Self::row_to_user,
        )
        .optional()
        .map_err(|e| AppError::Storage(format!("Failed to get user: {}", e)))
    }

    /// List all users, newest first.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, username, password_hash, email, phone, role, special_reader_type,
                        created_at, login_attempts, locked_until
                 FROM users ORDER BY created_at DESC, id DESC",
            )
            .map_err(|e| AppError::Storage(format!("Failed to prepare query: {}", e)))?;

        let users = stmt
            .query_map([], Self::row_to_user)
            .map_err(|e| AppError::Storage(format!("Failed to list users: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Storage(format!("Failed to collect users: {}", e)))?;

        Ok(users)
    }

    /// Record a failed login attempt.
    ///
    /// The increment is a relative UPDATE inside one transaction, so two
    /// concurrent failures cannot race past the lockout threshold. When the
    /// post-increment count reaches `threshold` the given lock expiry is
    /// stored. Returns the post-increment attempt count.
    pub fn record_login_failure(
        &self,
        user_id: i64,
        threshold: u32,
        locked_until: &str,
    ) -> Result<u32> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Storage(format!("Failed to start transaction: {}", e)))?;

        tx.execute(
            "UPDATE users SET login_attempts = login_attempts + 1 WHERE id = ?1",
            params![user_id],
        )
        .map_err(|e| AppError::Storage(format!("Failed to record login failure: {}", e)))?;

        let attempts: u32 = tx
            .query_row(
                "SELECT login_attempts FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Storage(format!("Failed to read login attempts: {}", e)))?;

        if attempts >= threshold {
            tx.execute(
                "UPDATE users SET locked_until = ?1 WHERE id = ?2",
                params![locked_until, user_id],
            )
            .map_err(|e| AppError::Storage(format!("Failed to lock account: {}", e)))?;
        }

        tx.commit()
            .map_err(|e| AppError::Storage(format!("Failed to commit login failure: {}", e)))?;
        Ok(attempts)
    }

    /// Clear the failed-attempt counter and any lockout after a successful login.
    pub fn reset_login_state(&self, user_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET login_attempts = 0, locked_until = NULL WHERE id = ?1",
            params![user_id],
        )
        .map_err(|e| AppError::Storage(format!("Failed to reset login state: {}", e)))?;
        Ok(())
    }

    /// Replace a user's password hash and unlock the account.
    pub fn update_password_and_unlock(&self, user_id: i64, password_hash: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users
             SET password_hash = ?1, login_attempts = 0, locked_until = NULL
             WHERE id = ?2",
            params![password_hash, user_id],
        )
        .map_err(|e| AppError::Storage(format!("Failed to update password: {}", e)))?;
        Ok(())
    }

    /// Update user contact details and special reader type.
    pub fn update_profile(
        &self,
        user_id: i64,
        email: Option<&str>,
        phone: Option<&str>,
        special_reader_type: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE users SET email = ?1, phone = ?2, special_reader_type = ?3 WHERE id = ?4",
                params![email, phone, special_reader_type, user_id],
            )
            .map_err(|e| AppError::Storage(format!("Failed to update profile: {}", e)))?;
        if rows == 0 {
            return Err(AppError::NotFound(format!("User {}", user_id)));
        }
        Ok(())
    }

    /// Helper to convert a row to User.
    fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            username: row.get(1)?,
            password_hash: row.get(2)?,
            email: row.get(3)?,
            phone: row.get(4)?,
            role: row.get(5)?,
            special_reader_type: row.get(6)?,
            created_at: row.get(7)?,
            login_attempts: row.get(8)?,
            locked_until: row.get(9)?,
        })
    }

    // ========== BOOK OPERATIONS ==========

    /// Add a catalog entry. Available quantity starts equal to total.
    pub fn add_book(&self, book: &NewBook) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO books (title, author, isbn, category, publisher,
                                total_quantity, available_quantity, description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                book.title,
                book.author,
                book.isbn,
                book.category,
                book.publisher,
                book.total_quantity,
                book.total_quantity,
                book.description,
                format_timestamp(now()),
            ],
        )
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint") {
                AppError::DuplicateIdentity(format!(
                    "ISBN '{}' is already in the catalog",
                    book.isbn.as_deref().unwrap_or("")
                ))
            } else {
                AppError::Storage(format!("Failed to add book: {}", e))
            }
        })?;
        Ok(conn.last_insert_rowid())
    }

    /// Get book by ID.
    pub fn get_book(&self, id: i64) -> Result<Option<Book>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, title, author, isbn, category, publisher,
                    total_quantity, available_quantity, description, created_at
             FROM books WHERE id = ?1",
            params![id],
            Self::row_to_book,
        )
        .optional()
        .map_err(|e| AppError::Storage(format!("Failed to get book: {}", e)))
    }

    /// List all books, newest first.
    pub fn list_books(&self) -> Result<Vec<Book>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, title, author, isbn, category, publisher,
                        total_quantity, available_quantity, description, created_at
                 FROM books ORDER BY created_at DESC, id DESC",
            )
            .map_err(|e| AppError::Storage(format!("Failed to prepare query: {}", e)))?;

        let books = stmt
            .query_map([], Self::row_to_book)
            .map_err(|e| AppError::Storage(format!("Failed to list books: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Storage(format!("Failed to collect books: {}", e)))?;

        Ok(books)
    }

    /// Search by title, author or ISBN substring.
    pub fn search_books(&self, query: &str) -> Result<Vec<Book>> {
        let conn = self.conn.lock();
        let pattern = format!("%{}%", query);
        let mut stmt = conn
            .prepare(
                "SELECT id, title, author, isbn, category, publisher,
                        total_quantity, available_quantity, description, created_at
                 FROM books
                 WHERE title LIKE ?1 OR author LIKE ?1 OR isbn LIKE ?1
                 ORDER BY title",
            )
            .map_err(|e| AppError::Storage(format!("Failed to prepare query: {}", e)))?;

        let books = stmt
            .query_map(params![pattern], Self::row_to_book)
            .map_err(|e| AppError::Storage(format!("Failed to search books: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Storage(format!("Failed to collect books: {}", e)))?;

        Ok(books)
    }

    /// Books in an exact category.
    pub fn books_by_category(&self, category: &str) -> Result<Vec<Book>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, title, author, isbn, category, publisher,
                        total_quantity, available_quantity, description, created_at
                 FROM books WHERE category = ?1 ORDER BY title",
            )
            .map_err(|e| AppError::Storage(format!("Failed to prepare query: {}", e)))?;

        let books = stmt
            .query_map(params![category], Self::row_to_book)
            .map_err(|e| AppError::Storage(format!("Failed to get books: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Storage(format!("Failed to collect books: {}", e)))?;

        Ok(books)
    }

    /// First `limit` books by title, for browsing without a query.
    pub fn browse_books(&self, limit: i64) -> Result<Vec<Book>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, title, author, isbn, category, publisher,
                        total_quantity, available_quantity, description, created_at
                 FROM books ORDER BY title LIMIT ?1",
            )
            .map_err(|e| AppError::Storage(format!("Failed to prepare query: {}", e)))?;

        let books = stmt
            .query_map(params![limit], Self::row_to_book)
            .map_err(|e| AppError::Storage(format!("Failed to browse books: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Storage(format!("Failed to collect books: {}", e)))?;

        Ok(books)
    }

    /// Distinct category names.
    pub fn list_categories(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT category FROM books
                 WHERE category IS NOT NULL ORDER BY category",
            )
            .map_err(|e| AppError::Storage(format!("Failed to prepare query: {}", e)))?;

        let categories = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| AppError::Storage(format!("Failed to list categories: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Storage(format!("Failed to collect categories: {}", e)))?;

        Ok(categories)
    }

    /// Update a catalog entry.
    ///
    /// When `total_quantity` changes, `available_quantity` is recomputed as
    /// `new_total - active loans` so the quantity invariant survives admin
    /// edits made while copies are out. Shrinking the total below the number
    /// of copies on loan is rejected.
    pub fn update_book(&self, book_id: i64, update: &BookUpdate) -> Result<Book> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Storage(format!("Failed to start transaction: {}", e)))?;

        let book = tx
            .query_row(
                "SELECT id, title, author, isbn, category, publisher,
                        total_quantity, available_quantity, description, created_at
                 FROM books WHERE id = ?1",
                params![book_id],
                Self::row_to_book,
            )
            .optional()
            .map_err(|e| AppError::Storage(format!("Failed to get book: {}", e)))?
            .ok_or_else(|| AppError::NotFound(format!("Book {}", book_id)))?;

        let borrowed: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM borrowing_records WHERE book_id = ?1 AND status = ?2",
                params![book_id, LoanStatus::Borrowed],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Storage(format!("Failed to count active loans: {}", e)))?;

        let total = update.total_quantity.unwrap_or(book.total_quantity);
        if total < borrowed {
            return Err(AppError::HasActiveLoans(book_id));
        }
        let available = total - borrowed;

        let updated = Book {
            id: book.id,
            title: update.title.clone().unwrap_or(book.title),
            author: update.author.clone().or(book.author),
            isbn: update.isbn.clone().or(book.isbn),
            category: update.category.clone().or(book.category),
            publisher: update.publisher.clone().or(book.publisher),
            total_quantity: total,
            available_quantity: available,
            description: update.description.clone().or(book.description),
            created_at: book.created_at,
        };

        tx.execute(
            "UPDATE books
             SET title = ?1, author = ?2, isbn = ?3, category = ?4, publisher = ?5,
                 total_quantity = ?6, available_quantity = ?7, description = ?8
             WHERE id = ?9",
            params![
                updated.title,
                updated.author,
                updated.isbn,
                updated.category,
                updated.publisher,
                updated.total_quantity,
                updated.available_quantity,
                updated.description,
                book_id,
            ],
        )
        .map_err(|e| AppError::Storage(format!("Failed to update book: {}", e)))?;

        tx.commit()
            .map_err(|e| AppError::Storage(format!("Failed to commit book update: {}", e)))?;
        Ok(updated)
    }

    /// Delete a catalog entry. Rejected while any copy is out on loan.
    pub fn delete_book(&self, book_id: i64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Storage(format!("Failed to start transaction: {}", e)))?;

        let borrowed: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM borrowing_records WHERE book_id = ?1 AND status = ?2",
                params![book_id, LoanStatus::Borrowed],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Storage(format!("Failed to count active loans: {}", e)))?;
        if borrowed > 0 {
            return Err(AppError::HasActiveLoans(book_id));
        }

        let rows = tx
            .execute("DELETE FROM books WHERE id = ?1", params![book_id])
            .map_err(|e| AppError::Storage(format!("Failed to delete book: {}", e)))?;
        if rows == 0 {
            return Err(AppError::NotFound(format!("Book {}", book_id)));
        }

        tx.commit()
            .map_err(|e| AppError::Storage(format!("Failed to commit book delete: {}", e)))?;
        Ok(())
    }

    /// Helper to convert a row to Book.
    fn row_to_book(row: &rusqlite::Row<'_>) -> rusqlite::Result<Book> {
        Ok(Book {
            id: row.get(0)?,
            title: row.get(1)?,
            author: row.get(2)?,
            isbn: row.get(3)?,
            category: row.get(4)?,
            publisher: row.get(5)?,
            total_quantity: row.get(6)?,
            available_quantity: row.get(7)?,
            description: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    // ========== LENDING OPERATIONS ==========

    /// Borrow a book: create an active record and take one copy off the shelf.
    ///
    /// Returns the record ID and the computed due date.
    pub fn borrow_book(&self, user_id: i64, book_id: i64) -> Result<(i64, String)> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Storage(format!("Failed to start transaction: {}", e)))?;

        let user_exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Storage(format!("Failed to check user: {}", e)))?;
        if !user_exists {
            return Err(AppError::NotFound(format!("User {}", user_id)));
        }

        let available: i64 = tx
            .query_row(
                "SELECT available_quantity FROM books WHERE id = ?1",
                params![book_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| AppError::Storage(format!("Failed to get book: {}", e)))?
            .ok_or_else(|| AppError::NotFound(format!("Book {}", book_id)))?;
        if available <= 0 {
            return Err(AppError::OutOfStock(book_id));
        }

        let already_borrowed: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM borrowing_records
                               WHERE user_id = ?1 AND book_id = ?2 AND status = ?3)",
                params![user_id, book_id, LoanStatus::Borrowed],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Storage(format!("Failed to check active loan: {}", e)))?;
        if already_borrowed {
            return Err(AppError::AlreadyBorrowed(book_id));
        }

        let borrow_date = now();
        let due_date = format_timestamp(extend_by_loan_period(borrow_date));

        tx.execute(
            "INSERT INTO borrowing_records (user_id, book_id, borrow_date, due_date, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user_id,
                book_id,
                format_timestamp(borrow_date),
                due_date,
                LoanStatus::Borrowed,
            ],
        )
        .map_err(|e| AppError::Storage(format!("Failed to create borrowing record: {}", e)))?;
        let record_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE books SET available_quantity = available_quantity - 1 WHERE id = ?1",
            params![book_id],
        )
        .map_err(|e| AppError::Storage(format!("Failed to update availability: {}", e)))?;

        tx.commit()
            .map_err(|e| AppError::Storage(format!("Failed to commit borrow: {}", e)))?;
        Ok((record_id, due_date))
    }

    /// Return a borrowed book: close the record and put the copy back.
    pub fn return_book(&self, record_id: i64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Storage(format!("Failed to start transaction: {}", e)))?;

        let (book_id, status): (i64, LoanStatus) = tx
            .query_row(
                "SELECT book_id, status FROM borrowing_records WHERE id = ?1",
                params![record_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| AppError::Storage(format!("Failed to get borrowing record: {}", e)))?
            .ok_or_else(|| AppError::NotFound(format!("Borrowing record {}", record_id)))?;
        if status == LoanStatus::Returned {
            return Err(AppError::AlreadyReturned(record_id));
        }

        tx.execute(
            "UPDATE borrowing_records SET return_date = ?1, status = ?2 WHERE id = ?3",
            params![
                format_timestamp(now()),
                LoanStatus::Returned,
                record_id,
            ],
        )
        .map_err(|e| AppError::Storage(format!("Failed to update borrowing record: {}", e)))?;

        // The paired decrement at borrow time guarantees this never exceeds total.
        tx.execute(
            "UPDATE books SET available_quantity = available_quantity + 1 WHERE id = ?1",
            params![book_id],
        )
        .map_err(|e| AppError::Storage(format!("Failed to update availability: {}", e)))?;

        tx.commit()
            .map_err(|e| AppError::Storage(format!("Failed to commit return: {}", e)))?;
        Ok(())
    }

    /// Renew a loan: push the due date out by one loan period.
    ///
    /// Extends from the current due date, not from now, so repeated renewals
    /// compound even when the loan is overdue. Returns the new due date.
    pub fn renew_book(&self, record_id: i64) -> Result<String> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Storage(format!("Failed to start transaction: {}", e)))?;

        let (due_date, status): (String, LoanStatus) = tx
            .query_row(
                "SELECT due_date, status FROM borrowing_records WHERE id = ?1",
                params![record_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| AppError::Storage(format!("Failed to get borrowing record: {}", e)))?
            .ok_or_else(|| AppError::NotFound(format!("Borrowing record {}", record_id)))?;
        if status != LoanStatus::Borrowed {
            return Err(AppError::NotBorrowed(record_id));
        }

        let new_due = format_timestamp(extend_by_loan_period(parse_timestamp(&due_date)?));

        tx.execute(
            "UPDATE borrowing_records SET due_date = ?1 WHERE id = ?2",
            params![new_due, record_id],
        )
        .map_err(|e| AppError::Storage(format!("Failed to update due date: {}", e)))?;

        tx.commit()
            .map_err(|e| AppError::Storage(format!("Failed to commit renewal: {}", e)))?;
        Ok(new_due)
    }

    /// Rate a returned book, 1 to 5.
    pub fn rate_record(&self, record_id: i64, rating: i64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Storage(format!("Failed to start transaction: {}", e)))?;

        let status: LoanStatus = tx
            .query_row(
                "SELECT status FROM borrowing_records WHERE id = ?1",
                params![record_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| AppError::Storage(format!("Failed to get borrowing record: {}", e)))?
            .ok_or_else(|| AppError::NotFound(format!("Borrowing record {}", record_id)))?;
        if status != LoanStatus::Returned {
            return Err(AppError::NotReturned(record_id));
        }
        if !(1..=5).contains(&rating) {
            return Err(AppError::InvalidRating(rating));
        }

        tx.execute(
            "UPDATE borrowing_records SET rating = ?1 WHERE id = ?2",
            params![rating, record_id],
        )
        .map_err(|e| AppError::Storage(format!("Failed to store rating: {}", e)))?;

        tx.commit()
            .map_err(|e| AppError::Storage(format!("Failed to commit rating: {}", e)))?;
        Ok(())
    }

    /// Get borrowing record by ID.
    pub fn get_record(&self, record_id: i64) -> Result<Option<BorrowingRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, user_id, book_id, borrow_date, due_date, return_date, status, rating
             FROM borrowing_records WHERE id = ?1",
            params![record_id],
            Self::row_to_record,
        )
        .optional()
        .map_err(|e| AppError::Storage(format!("Failed to get borrowing record: {}", e)))
    }

    /// All borrowing records of a user, newest first, with book details.
    pub fn user_borrowings(&self, user_id: i64) -> Result<Vec<BorrowingHistoryEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT r.id, r.user_id, r.book_id, r.borrow_date, r.due_date, r.return_date,
                        r.status, r.rating, b.title, b.author, b.isbn
                 FROM borrowing_records r
                 JOIN books b ON r.book_id = b.id
                 WHERE r.user_id = ?1
                 ORDER BY r.borrow_date DESC, r.id DESC",
            )
            .map_err(|e| AppError::Storage(format!("Failed to prepare query: {}", e)))?;

        let records = stmt
            .query_map(params![user_id], |row| {
                Ok(BorrowingHistoryEntry {
                    record: BorrowingRecord {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        book_id: row.get(2)?,
                        borrow_date: row.get(3)?,
                        due_date: row.get(4)?,
                        return_date: row.get(5)?,
                        status: row.get(6)?,
                        rating: row.get(7)?,
                    },
                    title: row.get(8)?,
                    author: row.get(9)?,
                    isbn: row.get(10)?,
                })
            })
            .map_err(|e| AppError::Storage(format!("Failed to get borrowings: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Storage(format!("Failed to collect borrowings: {}", e)))?;

        Ok(records)
    }

    /// Number of active loans referencing a book.
    pub fn active_loan_count(&self, book_id: i64) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM borrowing_records WHERE book_id = ?1 AND status = ?2",
            params![book_id, LoanStatus::Borrowed],
            |row| row.get(0),
        )
        .map_err(|e| AppError::Storage(format!("Failed to count active loans: {}", e)))
    }

    /// Helper to convert a row to BorrowingRecord.
    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<BorrowingRecord> {
        Ok(BorrowingRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            book_id: row.get(2)?,
            borrow_date: row.get(3)?,
            due_date: row.get(4)?,
            return_date: row.get(5)?,
            status: row.get(6)?,
            rating: row.get(7)?,
        })
    }

    // ========== FEEDBACK OPERATIONS ==========

    /// Submit a feedback entry.
    pub fn submit_feedback(&self, user_id: i64, kind: FeedbackKind, content: &str) -> Result<i64> {
        let conn = self.conn.lock();

        let user_exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Storage(format!("Failed to check user: {}", e)))?;
        if !user_exists {
            return Err(AppError::NotFound(format!("User {}", user_id)));
        }

        conn.execute(
            "INSERT INTO feedback (user_id, kind, content, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user_id,
                kind,
                content,
                FeedbackStatus::Pending,
                format_timestamp(now()),
            ],
        )
        .map_err(|e| AppError::Storage(format!("Failed to submit feedback: {}", e)))?;
        Ok(conn.last_insert_rowid())
    }

    /// Feedback entries of a user, newest first.
    pub fn user_feedback(&self, user_id: i64) -> Result<Vec<Feedback>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, kind, content, status, admin_reply, created_at
                 FROM feedback WHERE user_id = ?1
                 ORDER BY created_at DESC, id DESC",
            )
            .map_err(|e| AppError::Storage(format!("Failed to prepare query: {}", e)))?;

        let entries = stmt
            .query_map(params![user_id], Self::row_to_feedback)
            .map_err(|e| AppError::Storage(format!("Failed to get feedback: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Storage(format!("Failed to collect feedback: {}", e)))?;

        Ok(entries)
    }

    /// All feedback entries with submitter usernames, newest first.
    pub fn list_feedback(&self) -> Result<Vec<FeedbackWithUser>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT f.id, f.user_id, f.kind, f.content, f.status, f.admin_reply,
                        f.created_at, u.username
                 FROM feedback f
                 JOIN users u ON f.user_id = u.id
                 ORDER BY f.created_at DESC, f.id DESC",
            )
            .map_err(|e| AppError::Storage(format!("Failed to prepare query: {}", e)))?;

        let entries = stmt
            .query_map([], |row| {
                Ok(FeedbackWithUser {
                    feedback: Feedback {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        kind: row.get(2)?,
                        content: row.get(3)?,
                        status: row.get(4)?,
                        admin_reply: row.get(5)?,
                        created_at: row.get(6)?,
                    },
                    username: row.get(7)?,
                })
            })
            .map_err(|e| AppError::Storage(format!("Failed to list feedback: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Storage(format!("Failed to collect feedback: {}", e)))?;

        Ok(entries)
    }

    /// Store an admin reply and mark the entry replied.
    pub fn reply_feedback(&self, feedback_id: i64, reply: &str) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE feedback SET admin_reply = ?1, status = ?2 WHERE id = ?3",
                params![reply, FeedbackStatus::Replied, feedback_id],
            )
            .map_err(|e| AppError::Storage(format!("Failed to reply to feedback: {}", e)))?;
        if rows == 0 {
            return Err(AppError::NotFound(format!("Feedback {}", feedback_id)));
        }
        Ok(())
    }

    /// Helper to convert a row to Feedback.
    fn row_to_feedback(row: &rusqlite::Row<'_>) -> rusqlite::Result<Feedback> {
        Ok(Feedback {
            id: row.get(0)?,
            user_id: row.get(1)?,
            kind: row.get(2)?,
            content: row.get(3)?,
            status: row.get(4)?,
            admin_reply: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    // ========== STATISTICS ==========

    /// Aggregate user statistics for the admin dashboard.
    pub fn user_statistics(&self) -> Result<UserStatistics> {
        let conn = self.conn.lock();

        let total_users: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .map_err(|e| AppError::Storage(format!("Failed to count users: {}", e)))?;

        let mut stmt = conn
            .prepare("SELECT role, COUNT(*) FROM users GROUP BY role")
            .map_err(|e| AppError::Storage(format!("Failed to prepare query: {}", e)))?;
        let role_stats = stmt
            .query_map([], |row| {
                Ok(RoleCount {
                    role: row.get(0)?,
                    count: row.get(1)?,
                })
            })
            .map_err(|e| AppError::Storage(format!("Failed to get role stats: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Storage(format!("Failed to collect role stats: {}", e)))?;

        let mut stmt = conn
            .prepare(
                "SELECT special_reader_type, COUNT(*) FROM users
                 WHERE special_reader_type IS NOT NULL
                 GROUP BY special_reader_type",
            )
            .map_err(|e| AppError::Storage(format!("Failed to prepare query: {}", e)))?;
        let special_reader_stats = stmt
            .query_map([], |row| {
                Ok(SpecialReaderCount {
                    special_reader_type: row.get(0)?,
                    count: row.get(1)?,
                })
            })
            .map_err(|e| AppError::Storage(format!("Failed to get reader stats: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Storage(format!("Failed to collect reader stats: {}", e)))?;

        Ok(UserStatistics {
            total_users,
            role_stats,
            special_reader_stats,
        })
    }

    /// Aggregate borrowing statistics for the admin dashboard.
    pub fn borrowing_statistics(&self) -> Result<BorrowingStatistics> {
        let conn = self.conn.lock();

        let total_borrowings: i64 = conn
            .query_row("SELECT COUNT(*) FROM borrowing_records", [], |row| {
                row.get(0)
            })
            .map_err(|e| AppError::Storage(format!("Failed to count borrowings: {}", e)))?;

        let current_borrowings: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM borrowing_records WHERE status = ?1",
                params![LoanStatus::Borrowed],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Storage(format!("Failed to count active loans: {}", e)))?;

        let mut stmt = conn
            .prepare(
                "SELECT b.title, b.author, COUNT(*) as borrow_count
                 FROM borrowing_records r
                 JOIN books b ON r.book_id = b.id
                 GROUP BY r.book_id
                 ORDER BY borrow_count DESC
                 LIMIT 10",
            )
            .map_err(|e| AppError::Storage(format!("Failed to prepare query: {}", e)))?;
        let popular_books = stmt
            .query_map([], |row| {
                Ok(PopularBook {
                    title: row.get(0)?,
                    author: row.get(1)?,
                    borrow_count: row.get(2)?,
                })
            })
            .map_err(|e| AppError::Storage(format!("Failed to get popular books: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Storage(format!("Failed to collect popular books: {}", e)))?;

        let mut stmt = conn
            .prepare(
                "SELECT b.category, COUNT(*) as borrow_count
                 FROM borrowing_records r
                 JOIN books b ON r.book_id = b.id
                 WHERE b.category IS NOT NULL
                 GROUP BY b.category
                 ORDER BY borrow_count DESC",
            )
            .map_err(|e| AppError::Storage(format!("Failed to prepare query: {}", e)))?;
        let category_stats = stmt
            .query_map([], |row| {
                Ok(CategoryCount {
                    category: row.get(0)?,
                    borrow_count: row.get(1)?,
                })
            })
            .map_err(|e| AppError::Storage(format!("Failed to get category stats: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Storage(format!("Failed to collect category stats: {}", e)))?;

        Ok(BorrowingStatistics {
            total_borrowings,
            current_borrowings,
            popular_books,
            category_stats,
        })
    }

    // ========== SEEDING ==========

    /// Insert sample catalog data on first run. No-op once books exist.
    ///
    /// Returns the number of books inserted.
    pub fn seed_sample_books(&self) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Storage(format!("Failed to start transaction: {}", e)))?;

        let existing: i64 = tx
            .query_row("SELECT COUNT(*) FROM books", [], |row| row.get(0))
            .map_err(|e| AppError::Storage(format!("Failed to count books: {}", e)))?;
        if existing > 0 {
            return Ok(0);
        }

        let samples: &[(&str, &str, &str, &str, &str, i64, &str)] = &[
            (
                "The Rust Programming Language",
                "Steve Klabnik",
                "9781718503106",
                "Programming",
                "No Starch Press",
                5,
                "The official book on Rust",
            ),
            (
                "Structure and Interpretation of Computer Programs",
                "Harold Abelson",
                "9780262510875",
                "Computer Science",
                "MIT Press",
                3,
                "Classic introduction to computation",
            ),
            (
                "Introduction to Algorithms",
                "Thomas H. Cormen",
                "9780262046305",
                "Algorithms",
                "MIT Press",
                4,
                "Comprehensive algorithms reference",
            ),
            (
                "Artificial Intelligence: A Modern Approach",
                "Stuart Russell",
                "9780134610993",
                "Artificial Intelligence",
                "Pearson",
                3,
                "Standard AI textbook",
            ),
            (
                "Database System Concepts",
                "Abraham Silberschatz",
                "9780078022159",
                "Databases",
                "McGraw-Hill",
                4,
                "Foundations of database systems",
            ),
            (
                "The Pragmatic Programmer",
                "David Thomas",
                "9780135957059",
                "Software Engineering",
                "Addison-Wesley",
                3,
                "From journeyman to master",
            ),
            (
                "Computer Networks",
                "Andrew S. Tanenbaum",
                "9780132126953",
                "Networking",
                "Pearson",
                4,
                "Authoritative networking text",
            ),
            (
                "Operating System Concepts",
                "Abraham Silberschatz",
                "9781119800361",
                "Operating Systems",
                "Wiley",
                3,
                "The dinosaur book",
            ),
        ];

        let created_at = format_timestamp(now());
        for (title, author, isbn, category, publisher, quantity, description) in samples {
            tx.execute(
                "INSERT INTO books (title, author, isbn, category, publisher,
                                    total_quantity, available_quantity, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    title, author, isbn, category, publisher, quantity, quantity, description,
                    created_at,
                ],
            )
            .map_err(|e| AppError::Storage(format!("Failed to seed books: {}", e)))?;
        }

        tx.commit()
            .map_err(|e| AppError::Storage(format!("Failed to commit seed: {}", e)))?;
        Ok(samples.len())
    }
}
