use crate::auth::{AuthService, LOCKOUT_MINUTES, MAX_LOGIN_ATTEMPTS};
use crate::config::Config;
use crate::db::{
    self, BookUpdate, Database, FeedbackKind, FeedbackStatus, LoanStatus, NewBook, Role,
    LOAN_PERIOD_DAYS,
};
use crate::error::AppError;
use chrono::Duration;

fn test_db() -> Database {
    Database::open_memory().unwrap()
}

fn create_reader(db: &Database, username: &str) -> i64 {
    db.register_user(username, "hash", None, None, Role::Reader)
        .unwrap()
}

fn create_book(db: &Database, title: &str, quantity: i64) -> i64 {
    db.add_book(&NewBook {
        title: title.to_string(),
        author: Some("Test Author".to_string()),
        isbn: None,
        category: Some("Testing".to_string()),
        publisher: None,
        total_quantity: quantity,
        description: None,
    })
    .unwrap()
}

// ============================================================================
// USERS
// ============================================================================

#[test]
fn db_register_and_get_user() {
    let db = test_db();
    let id = db
        .register_user(
            "alice",
            "hash",
            Some("alice@example.com"),
            Some("555-0100"),
            Role::Reader,
        )
        .unwrap();

    let found = db.get_user_by_username("alice").unwrap().unwrap();
    assert_eq!(found.id, id);
    assert_eq!(found.email.as_deref(), Some("alice@example.com"));
    assert_eq!(found.role, Role::Reader);
    assert_eq!(found.login_attempts, 0);
    assert!(found.locked_until.is_none());

    let by_id = db.get_user_by_id(id).unwrap().unwrap();
    assert_eq!(by_id.username, "alice");
}

#[test]
fn db_duplicate_username_fails() {
    let db = test_db();
    create_reader(&db, "alice");

    let err = db
        .register_user("alice", "hash2", None, None, Role::Reader)
        .unwrap_err();
    assert!(matches!(err, AppError::DuplicateIdentity(_)));
}

#[test]
fn db_duplicate_phone_fails() {
    let db = test_db();
    db.register_user("alice", "hash", None, Some("555-0100"), Role::Reader)
        .unwrap();

    let err = db
        .register_user("bob", "hash", None, Some("555-0100"), Role::Reader)
        .unwrap_err();
    assert!(matches!(err, AppError::DuplicateIdentity(_)));
}

#[test]
fn db_default_admin_created_once() {
    let db = test_db();
    assert!(db.ensure_default_admin("admin", "hash").unwrap());
    assert!(!db.ensure_default_admin("admin", "other-hash").unwrap());

    let admin = db.get_user_by_username("admin").unwrap().unwrap();
    assert_eq!(admin.role, Role::Admin);
    // The second call must not have touched the stored hash.
    assert_eq!(admin.password_hash, "hash");
}

#[test]
fn db_update_profile() {
    let db = test_db();
    let id = create_reader(&db, "alice");

    db.update_profile(id, Some("new@example.com"), Some("555-0199"), Some("student"))
        .unwrap();

    let user = db.get_user_by_id(id).unwrap().unwrap();
    assert_eq!(user.email.as_deref(), Some("new@example.com"));
    assert_eq!(user.phone.as_deref(), Some("555-0199"));
    assert_eq!(user.special_reader_type.as_deref(), Some("student"));

    let err = db.update_profile(9999, None, None, None).unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

// ============================================================================
// AUTHENTICATION AND LOCKOUT
// ============================================================================

#[test]
fn auth_register_and_login() {
    let db = test_db();
    let auth = AuthService::new(db);

    let user = auth
        .register("alice", "secret", Some("alice@example.com"), None)
        .unwrap();
    assert_eq!(user.role, Role::Reader);

    let logged_in = auth.authenticate("alice", "secret").unwrap();
    assert_eq!(logged_in.id, user.id);
}

#[test]
fn auth_rejects_bad_usernames_and_short_passwords() {
    let db = test_db();
    let auth = AuthService::new(db);

    assert!(matches!(
        auth.register("", "secret", None, None).unwrap_err(),
        AppError::InvalidInput(_)
    ));
    assert!(matches!(
        auth.register("bad name!", "secret", None, None).unwrap_err(),
        AppError::InvalidInput(_)
    ));
    assert!(matches!(
        auth.register("alice", "abc", None, None).unwrap_err(),
        AppError::InvalidInput(_)
    ));
}

#[test]
fn auth_failed_attempts_count_down_then_lock() {
    let db = test_db();
    let auth = AuthService::new(db.clone());
    auth.register("alice", "secret", None, None).unwrap();

    for attempt in 1..MAX_LOGIN_ATTEMPTS {
        let err = auth.authenticate("alice", "wrong").unwrap_err();
        match err {
            AppError::InvalidCredentials { remaining } => {
                assert_eq!(remaining, MAX_LOGIN_ATTEMPTS - attempt);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    // The fifth failure trips the lock.
    let err = auth.authenticate("alice", "wrong").unwrap_err();
    assert!(matches!(
        err,
        AppError::AccountLocked {
            minutes: LOCKOUT_MINUTES
        }
    ));

    let user = db.get_user_by_username("alice").unwrap().unwrap();
    assert_eq!(user.login_attempts, MAX_LOGIN_ATTEMPTS);
    assert!(user.locked_until.is_some());
}

#[test]
fn auth_locked_account_rejects_correct_password() {
    let db = test_db();
    let auth = AuthService::new(db.clone());
    auth.register("alice", "secret", None, None).unwrap();

    for _ in 0..MAX_LOGIN_ATTEMPTS {
        let _ = auth.authenticate("alice", "wrong");
    }

    // While locked, even the right password is refused and the
    // attempt counter stays where it is.
    let err = auth.authenticate("alice", "secret").unwrap_err();
    assert!(matches!(err, AppError::AccountLocked { .. }));

    let user = db.get_user_by_username("alice").unwrap().unwrap();
    assert_eq!(user.login_attempts, MAX_LOGIN_ATTEMPTS);
}

#[test]
fn auth_locked_account_does_not_count_further_failures() {
    let db = test_db();
    let auth = AuthService::new(db.clone());
    auth.register("alice", "secret", None, None).unwrap();

    for _ in 0..MAX_LOGIN_ATTEMPTS {
        let _ = auth.authenticate("alice", "wrong");
    }

    // A wrong password during the lock window fails with the lock error
    // and leaves the attempt counter at the threshold.
    let err = auth.authenticate("alice", "wrong").unwrap_err();
    assert!(matches!(err, AppError::AccountLocked { .. }));

    let user = db.get_user_by_username("alice").unwrap().unwrap();
    assert_eq!(user.login_attempts, MAX_LOGIN_ATTEMPTS);
}

#[test]
fn auth_expired_lock_allows_login_and_resets_counters() {
    let db = test_db();
    let auth = AuthService::new(db.clone());
    let user = auth.register("alice", "secret", None, None).unwrap();

    // Simulate a lock that has already run out.
    let past = db::format_timestamp(db::now() - Duration::minutes(1));
    for _ in 0..MAX_LOGIN_ATTEMPTS {
        db.record_login_failure(user.id, MAX_LOGIN_ATTEMPTS, &past)
            .unwrap();
    }
    let locked = db.get_user_by_username("alice").unwrap().unwrap();
    assert!(locked.locked_until.is_some());

    let logged_in = auth.authenticate("alice", "secret").unwrap();
    assert_eq!(logged_in.login_attempts, 0);
    assert!(logged_in.locked_until.is_none());

    let stored = db.get_user_by_username("alice").unwrap().unwrap();
    assert_eq!(stored.login_attempts, 0);
    assert!(stored.locked_until.is_none());
}

#[test]
fn auth_expired_lock_relocks_on_next_failure() {
    let db = test_db();
    let auth = AuthService::new(db.clone());
    let user = auth.register("alice", "secret", None, None).unwrap();

    let past = db::format_timestamp(db::now() - Duration::minutes(1));
    for _ in 0..MAX_LOGIN_ATTEMPTS {
        db.record_login_failure(user.id, MAX_LOGIN_ATTEMPTS, &past)
            .unwrap();
    }

    // Attempts are still at the threshold, so one more failure
    // locks the account again immediately.
    let err = auth.authenticate("alice", "wrong").unwrap_err();
    assert!(matches!(err, AppError::AccountLocked { .. }));
}

#[test]
fn auth_reset_password_requires_matching_phone() {
    let db = test_db();
    let auth = AuthService::new(db.clone());
    auth.register("alice", "secret", None, Some("555-0100"))
        .unwrap();

    let err = auth
        .reset_password("alice", "555-9999", "newpass")
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    auth.reset_password("alice", "555-0100", "newpass").unwrap();
    assert!(auth.authenticate("alice", "newpass").is_ok());
    assert!(auth.authenticate("alice", "secret").is_err());
}

#[test]
fn auth_reset_password_clears_lockout() {
    let db = test_db();
    let auth = AuthService::new(db.clone());
    auth.register("alice", "secret", None, Some("555-0100"))
        .unwrap();

    for _ in 0..MAX_LOGIN_ATTEMPTS {
        let _ = auth.authenticate("alice", "wrong");
    }
    assert!(matches!(
        auth.authenticate("alice", "secret").unwrap_err(),
        AppError::AccountLocked { .. }
    ));

    auth.reset_password("alice", "555-0100", "newpass").unwrap();
    assert!(auth.authenticate("alice", "newpass").is_ok());
}

#[test]
fn auth_change_password() {
    let db = test_db();
    let auth = AuthService::new(db);
    auth.register("alice", "secret", None, None).unwrap();

    assert!(auth.change_password("alice", "newpass").unwrap());
    assert!(!auth.change_password("nobody", "newpass").unwrap());
    assert!(auth.authenticate("alice", "newpass").is_ok());
}

// ============================================================================
// CATALOG
// ============================================================================

#[test]
fn db_add_and_get_book() {
    let db = test_db();
    let id = create_book(&db, "The Rust Programming Language", 3);

    let book = db.get_book(id).unwrap().unwrap();
    assert_eq!(book.title, "The Rust Programming Language");
    assert_eq!(book.total_quantity, 3);
    assert_eq!(book.available_quantity, 3);

    assert!(db.get_book(9999).unwrap().is_none());
}

#[test]
fn db_duplicate_isbn_fails() {
    let db = test_db();
    let book = NewBook {
        title: "First".to_string(),
        author: None,
        isbn: Some("978-0-13-468599-1".to_string()),
        category: None,
        publisher: None,
        total_quantity: 1,
        description: None,
    };
    db.add_book(&book).unwrap();

    let dup = NewBook {
        title: "Second".to_string(),
        ..book
    };
    assert!(matches!(
        db.add_book(&dup).unwrap_err(),
        AppError::DuplicateIdentity(_)
    ));
}

#[test]
fn db_search_books_matches_title_author_isbn() {
    let db = test_db();
    create_book(&db, "Structure and Interpretation", 1);
    db.add_book(&NewBook {
        title: "Other".to_string(),
        author: Some("Abelson".to_string()),
        isbn: Some("978-0-262-51087-5".to_string()),
        category: None,
        publisher: None,
        total_quantity: 1,
        description: None,
    })
    .unwrap();

    assert_eq!(db.search_books("Interpretation").unwrap().len(), 1);
    assert_eq!(db.search_books("abelson").unwrap().len(), 1);
    assert_eq!(db.search_books("51087").unwrap().len(), 1);
    assert!(db.search_books("nonexistent").unwrap().is_empty());
}

#[test]
fn db_categories_and_browse() {
    let db = test_db();
    create_book(&db, "A", 1);
    create_book(&db, "B", 1);
    db.add_book(&NewBook {
        title: "C".to_string(),
        author: None,
        isbn: None,
        category: Some("Networking".to_string()),
        publisher: None,
        total_quantity: 1,
        description: None,
    })
    .unwrap();

    let categories = db.list_categories().unwrap();
    assert_eq!(categories.len(), 2);
    assert!(categories.contains(&"Testing".to_string()));
    assert!(categories.contains(&"Networking".to_string()));

    assert_eq!(db.books_by_category("Testing").unwrap().len(), 2);
    assert_eq!(db.browse_books(2).unwrap().len(), 2);
    assert_eq!(db.list_books().unwrap().len(), 3);
}

#[test]
fn db_update_book_recomputes_availability() {
    let db = test_db();
    let user = create_reader(&db, "alice");
    let other = create_reader(&db, "bob");
    let book = create_book(&db, "Popular", 5);

    db.borrow_book(user, book).unwrap();
    db.borrow_book(other, book).unwrap();

    let updated = db
        .update_book(
            book,
            &BookUpdate {
                total_quantity: Some(3),
                ..BookUpdate::default()
            },
        )
        .unwrap();
    assert_eq!(updated.total_quantity, 3);
    assert_eq!(updated.available_quantity, 1);

    // Unset fields keep their current values.
    assert_eq!(updated.title, "Popular");

    // Shrinking below the number of active loans is refused.
    let err = db
        .update_book(
            book,
            &BookUpdate {
                total_quantity: Some(1),
                ..BookUpdate::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, AppError::HasActiveLoans(_)));
}

#[test]
fn db_delete_book_blocked_by_active_loan() {
    let db = test_db();
    let user = create_reader(&db, "alice");
    let book = create_book(&db, "Loaned", 1);
    let (record, _) = db.borrow_book(user, book).unwrap();

    assert!(matches!(
        db.delete_book(book).unwrap_err(),
        AppError::HasActiveLoans(_)
    ));

    db.return_book(record).unwrap();
    db.delete_book(book).unwrap();
    assert!(db.get_book(book).unwrap().is_none());

    // Returned history rows outlive the deleted catalog entry.
    let kept = db.get_record(record).unwrap().unwrap();
    assert_eq!(kept.status, LoanStatus::Returned);

    assert!(matches!(
        db.delete_book(book).unwrap_err(),
        AppError::NotFound(_)
    ));
}

// ============================================================================
// LENDING
// ============================================================================

#[test]
fn db_borrow_decrements_and_return_increments() {
    let db = test_db();
    let user = create_reader(&db, "alice");
    let book = create_book(&db, "Copies", 2);

    let (record, due) = db.borrow_book(user, book).unwrap();
    assert_eq!(db.get_book(book).unwrap().unwrap().available_quantity, 1);

    let stored = db.get_record(record).unwrap().unwrap();
    assert_eq!(stored.status, LoanStatus::Borrowed);
    assert_eq!(stored.due_date, due);
    assert!(stored.return_date.is_none());

    let expected = db::parse_timestamp(&stored.borrow_date).unwrap()
        + Duration::days(LOAN_PERIOD_DAYS);
    assert_eq!(db::parse_timestamp(&due).unwrap(), expected);

    db.return_book(record).unwrap();
    assert_eq!(db.get_book(book).unwrap().unwrap().available_quantity, 2);

    let returned = db.get_record(record).unwrap().unwrap();
    assert_eq!(returned.status, LoanStatus::Returned);
    assert!(returned.return_date.is_some());
}

#[test]
fn db_borrow_fails_for_unknown_user() {
    let db = test_db();
    let book = create_book(&db, "Unclaimed", 1);

    assert!(matches!(
        db.borrow_book(9999, book).unwrap_err(),
        AppError::NotFound(_)
    ));
    assert_eq!(db.get_book(book).unwrap().unwrap().available_quantity, 1);
}

#[test]
fn db_borrow_fails_when_out_of_stock() {
    let db = test_db();
    let alice = create_reader(&db, "alice");
    let bob = create_reader(&db, "bob");
    let book = create_book(&db, "Single Copy", 1);

    db.borrow_book(alice, book).unwrap();
    assert!(matches!(
        db.borrow_book(bob, book).unwrap_err(),
        AppError::OutOfStock(_)
    ));
}

#[test]
fn db_borrow_rejects_second_copy_of_same_book() {
    let db = test_db();
    let user = create_reader(&db, "alice");
    let book = create_book(&db, "Plenty", 5);

    let (record, _) = db.borrow_book(user, book).unwrap();
    assert!(matches!(
        db.borrow_book(user, book).unwrap_err(),
        AppError::AlreadyBorrowed(_)
    ));

    // After returning, the same user may borrow again.
    db.return_book(record).unwrap();
    db.borrow_book(user, book).unwrap();
}

#[test]
fn db_return_twice_fails() {
    let db = test_db();
    let user = create_reader(&db, "alice");
    let book = create_book(&db, "Once", 1);
    let (record, _) = db.borrow_book(user, book).unwrap();

    db.return_book(record).unwrap();
    assert!(matches!(
        db.return_book(record).unwrap_err(),
        AppError::AlreadyReturned(_)
    ));
    // Availability was incremented only once.
    assert_eq!(db.get_book(book).unwrap().unwrap().available_quantity, 1);

    assert!(matches!(
        db.return_book(9999).unwrap_err(),
        AppError::NotFound(_)
    ));
}

#[test]
fn db_renew_extends_from_due_date() {
    let db = test_db();
    let user = create_reader(&db, "alice");
    let book = create_book(&db, "Renewable", 1);
    let (record, due) = db.borrow_book(user, book).unwrap();

    let first = db.renew_book(record).unwrap();
    let second = db.renew_book(record).unwrap();

    let original = db::parse_timestamp(&due).unwrap();
    assert_eq!(
        db::parse_timestamp(&first).unwrap(),
        original + Duration::days(LOAN_PERIOD_DAYS)
    );
    assert_eq!(
        db::parse_timestamp(&second).unwrap(),
        original + Duration::days(2 * LOAN_PERIOD_DAYS)
    );

    db.return_book(record).unwrap();
    assert!(matches!(
        db.renew_book(record).unwrap_err(),
        AppError::NotBorrowed(_)
    ));
}

#[test]
fn db_rate_requires_returned_record_and_valid_range() {
    let db = test_db();
    let user = create_reader(&db, "alice");
    let book = create_book(&db, "Rated", 1);
    let (record, _) = db.borrow_book(user, book).unwrap();

    assert!(matches!(
        db.rate_record(record, 5).unwrap_err(),
        AppError::NotReturned(_)
    ));

    db.return_book(record).unwrap();
    assert!(matches!(
        db.rate_record(record, 0).unwrap_err(),
        AppError::InvalidRating(0)
    ));
    assert!(matches!(
        db.rate_record(record, 6).unwrap_err(),
        AppError::InvalidRating(6)
    ));

    db.rate_record(record, 5).unwrap();
    assert_eq!(db.get_record(record).unwrap().unwrap().rating, Some(5));

    // A rating may be revised.
    db.rate_record(record, 1).unwrap();
    assert_eq!(db.get_record(record).unwrap().unwrap().rating, Some(1));
}

#[test]
fn db_user_borrowings_newest_first() {
    let db = test_db();
    let user = create_reader(&db, "alice");
    let first = create_book(&db, "First", 1);
    let second = create_book(&db, "Second", 1);

    db.borrow_book(user, first).unwrap();
    db.borrow_book(user, second).unwrap();

    let history = db.user_borrowings(user).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].title, "Second");
    assert_eq!(history[1].title, "First");
    assert!(db.user_borrowings(9999).unwrap().is_empty());
}

// ============================================================================
// FEEDBACK
// ============================================================================

#[test]
fn db_feedback_requires_existing_user() {
    let db = test_db();

    assert!(matches!(
        db.submit_feedback(9999, FeedbackKind::Suggestion, "Hello")
            .unwrap_err(),
        AppError::NotFound(_)
    ));
}

#[test]
fn db_feedback_submit_and_reply() {
    let db = test_db();
    let user = create_reader(&db, "alice");

    let id = db
        .submit_feedback(user, FeedbackKind::Complaint, "Too few study seats")
        .unwrap();

    let mine = db.user_feedback(user).unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].status, FeedbackStatus::Pending);
    assert!(mine[0].admin_reply.is_none());

    db.reply_feedback(id, "More seats are on order").unwrap();

    let all = db.list_feedback().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].username, "alice");
    assert_eq!(all[0].feedback.status, FeedbackStatus::Replied);
    assert_eq!(
        all[0].feedback.admin_reply.as_deref(),
        Some("More seats are on order")
    );

    assert!(matches!(
        db.reply_feedback(9999, "reply").unwrap_err(),
        AppError::NotFound(_)
    ));
}

// ============================================================================
// STATISTICS
// ============================================================================

#[test]
fn db_statistics_reflect_activity() {
    let db = test_db();
    db.ensure_default_admin("admin", "hash").unwrap();
    let alice = create_reader(&db, "alice");
    db.register_user("bob", "hash", None, None, Role::Reader)
        .unwrap();
    db.update_profile(alice, None, None, Some("student")).unwrap();

    let book = create_book(&db, "Tracked", 2);
    let (record, _) = db.borrow_book(alice, book).unwrap();
    db.return_book(record).unwrap();
    db.borrow_book(alice, book).unwrap();

    let users = db.user_statistics().unwrap();
    assert_eq!(users.total_users, 3);
    assert!(users
        .role_stats
        .iter()
        .any(|r| r.role == Role::Admin && r.count == 1));
    assert!(users
        .role_stats
        .iter()
        .any(|r| r.role == Role::Reader && r.count == 2));
    assert!(users
        .special_reader_stats
        .iter()
        .any(|s| s.special_reader_type == "student" && s.count == 1));

    let borrowings = db.borrowing_statistics().unwrap();
    assert_eq!(borrowings.total_borrowings, 2);
    assert_eq!(borrowings.current_borrowings, 1);
    assert_eq!(borrowings.popular_books[0].title, "Tracked");
    assert_eq!(borrowings.popular_books[0].borrow_count, 2);
    assert!(borrowings
        .category_stats
        .iter()
        .any(|c| c.category == "Testing" && c.borrow_count == 2));
}

// ============================================================================
// BOOTSTRAP AND PERSISTENCE
// ============================================================================

#[test]
fn db_seed_sample_books_only_on_empty_catalog() {
    let db = test_db();
    let seeded = db.seed_sample_books().unwrap();
    assert!(seeded > 0);
    assert_eq!(db.list_books().unwrap().len(), seeded);

    // A populated catalog is left alone.
    assert_eq!(db.seed_sample_books().unwrap(), 0);
    assert_eq!(db.list_books().unwrap().len(), seeded);
}

#[test]
fn db_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("library.db");

    {
        let db = Database::open(&path).unwrap();
        create_reader(&db, "alice");
        create_book(&db, "Durable", 1);
    }

    let db = Database::open(&path).unwrap();
    assert!(db.get_user_by_username("alice").unwrap().is_some());
    assert_eq!(db.list_books().unwrap().len(), 1);
}

// ============================================================================
// CONFIG
// ============================================================================

#[test]
fn config_defaults() {
    let config = Config::default();
    assert_eq!(config.server.bind.port(), 8080);
    assert_eq!(config.bootstrap.admin_username, "admin");
    assert!(config.bootstrap.seed_books);
}

#[test]
fn config_parses_partial_toml() {
    let toml = r#"
[server]
bind = "127.0.0.1:9090"

[bootstrap]
seed_books = false
"#;
    let config: Config = toml::from_str(toml).unwrap();
    assert_eq!(config.server.bind.port(), 9090);
    assert!(!config.bootstrap.seed_books);
    // Unspecified sections fall back to defaults.
    assert_eq!(config.bootstrap.admin_username, "admin");
    assert_eq!(
        config.database.path,
        std::path::PathBuf::from("data/library.db")
    );
}

#[test]
fn config_generate_default_round_trips() {
    let config: Config = toml::from_str(&Config::generate_default()).unwrap();
    assert_eq!(config.server.bind.port(), 8080);
}
