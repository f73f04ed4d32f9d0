//! Authentication and account security.
//!
//! Implements the login lockout state machine: consecutive failed attempts
//! are counted per account, the fifth failure locks the account for a fixed
//! window, and a successful login or password reset clears both. Lock expiry
//! is lazy; a stale `locked_until` stays in storage until the next attempt
//! re-evaluates it.

use crate::db::{self, Database, Role, User};
use crate::error::{AppError, Result};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chrono::Duration;

/// Consecutive failed attempts before an account is locked.
pub const MAX_LOGIN_ATTEMPTS: u32 = 5;

/// How long a lockout lasts, in minutes.
pub const LOCKOUT_MINUTES: i64 = 15;

/// Hash a password using Argon2.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))
}

/// Verify a password against a hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| AppError::Internal(format!("Invalid password hash: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Authentication service.
pub struct AuthService {
    db: Database,
}

impl AuthService {
    /// Create a new auth service.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a new reader account.
    pub fn register(
        &self,
        username: &str,
        password: &str,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<User> {
        self.create_user(username, password, email, phone, Role::Reader)
    }

    /// Create a new user with an explicit role (CLI/admin function).
    pub fn create_user(
        &self,
        username: &str,
        password: &str,
        email: Option<&str>,
        phone: Option<&str>,
        role: Role,
    ) -> Result<User> {
        // Validate username
        if username.is_empty() || username.len() > 64 {
            return Err(AppError::InvalidInput(
                "Username must be 1-64 characters".to_string(),
            ));
        }

        if !username
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            return Err(AppError::InvalidInput(
                "Username can only contain letters, numbers, _ and -".to_string(),
            ));
        }

        // Validate password
        if password.len() < 4 {
            return Err(AppError::InvalidInput(
                "Password must be at least 4 characters".to_string(),
            ));
        }

        let password_hash = hash_password(password)?;
        let id = self
            .db
            .register_user(username, &password_hash, email, phone, role)?;

        self.db
            .get_user_by_id(id)?
            .ok_or_else(|| AppError::Internal(format!("User {} missing after insert", id)))
    }

    /// Authenticate a user, driving the lockout state machine.
    ///
    /// Returns the user profile on success with the attempt counter reset.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<User> {
        let mut user = self
            .db
            .get_user_by_username(username)?
            .ok_or_else(|| AppError::NotFound(format!("User '{}'", username)))?;

        // Attempts are not incremented while the lock is active.
        if let Some(ref locked) = user.locked_until {
            let locked_until = db::parse_timestamp(locked)?;
            let now = db::now();
            if now < locked_until {
                let minutes = (locked_until - now).num_seconds() / 60;
                return Err(AppError::AccountLocked { minutes });
            }
        }

        if verify_password(password, &user.password_hash)? {
            self.db.reset_login_state(user.id)?;
            user.login_attempts = 0;
            user.locked_until = None;
            return Ok(user);
        }

        let locked_until =
            db::format_timestamp(db::now() + Duration::minutes(LOCKOUT_MINUTES));
        let attempts =
            self.db
                .record_login_failure(user.id, MAX_LOGIN_ATTEMPTS, &locked_until)?;

        if attempts >= MAX_LOGIN_ATTEMPTS {
            Err(AppError::AccountLocked {
                minutes: LOCKOUT_MINUTES,
            })
        } else {
            Err(AppError::InvalidCredentials {
                remaining: MAX_LOGIN_ATTEMPTS - attempts,
            })
        }
    }

    /// Reset a password after matching username and phone.
    ///
    /// The same NotFound is returned whether the username or the phone was
    /// wrong, so the response does not reveal which field mismatched.
    /// A successful reset also unlocks the account.
    pub fn reset_password(&self, username: &str, phone: &str, new_password: &str) -> Result<()> {
        if new_password.len() < 4 {
            return Err(AppError::InvalidInput(
                "Password must be at least 4 characters".to_string(),
            ));
        }

        let user = self
            .db
            .find_user_by_username_and_phone(username, phone)?
            .ok_or_else(|| AppError::NotFound("User".to_string()))?;

        let password_hash = hash_password(new_password)?;
        self.db.update_password_and_unlock(user.id, &password_hash)
    }

    /// Change a user's password (CLI function). Returns false if no such user.
    pub fn change_password(&self, username: &str, new_password: &str) -> Result<bool> {
        if new_password.len() < 4 {
            return Err(AppError::InvalidInput(
                "Password must be at least 4 characters".to_string(),
            ));
        }

        let Some(user) = self.db.get_user_by_username(username)? else {
            return Ok(false);
        };

        let password_hash = hash_password(new_password)?;
        self.db.update_password_and_unlock(user.id, &password_hash)?;
        Ok(true)
    }

    /// Update contact details and special reader type.
    pub fn update_profile(
        &self,
        user_id: i64,
        email: Option<&str>,
        phone: Option<&str>,
        special_reader_type: Option<&str>,
    ) -> Result<()> {
        self.db
            .update_profile(user_id, email, phone, special_reader_type)
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        self.db.list_users()
    }

    /// Check if a user is admin.
    pub fn is_admin(&self, user: &User) -> bool {
        user.role == Role::Admin
    }
}
