//! HTTP server and routes.

mod handlers;
mod state;

pub use state::AppState;

use axum::{
    Router,
    routing::{delete, get, post, put},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let auth_routes = Router::new()
        .route("/register", post(handlers::auth_register))
        .route("/login", post(handlers::auth_login))
        .route("/update-profile", put(handlers::auth_update_profile))
        .route("/reset-password", post(handlers::auth_reset_password));

    let book_routes = Router::new()
        .route("/search", get(handlers::books_search))
        .route("/list", get(handlers::books_list))
        .route("/detail/{id}", get(handlers::book_detail))
        .route("/categories", get(handlers::book_categories))
        .route("/borrow", post(handlers::borrow_book))
        .route("/return", post(handlers::return_book))
        .route("/renew", post(handlers::renew_book))
        .route("/rate", post(handlers::rate_book))
        .route("/my-borrowings/{user_id}", get(handlers::my_borrowings))
        .route("/feedback/submit", post(handlers::feedback_submit))
        .route("/feedback/my/{user_id}", get(handlers::feedback_my));

    let admin_routes = Router::new()
        .route("/books/add", post(handlers::admin_add_book))
        .route("/books/update/{id}", put(handlers::admin_update_book))
        .route("/books/delete/{id}", delete(handlers::admin_delete_book))
        .route("/users/list", get(handlers::admin_list_users))
        .route("/users/statistics", get(handlers::admin_user_statistics))
        .route(
            "/borrowings/statistics",
            get(handlers::admin_borrowing_statistics),
        )
        .route("/feedback/list", get(handlers::admin_list_feedback))
        .route("/feedback/reply/{id}", put(handlers::admin_reply_feedback));

    Router::new()
        .route("/api", get(handlers::api_index))
        .route("/api/health", get(handlers::health))
        .nest("/api/auth", auth_routes)
        .nest("/api/books", book_routes)
        .nest("/api/admin", admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
