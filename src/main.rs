//! librarian-rs server entry point.

use clap::Parser;
use librarian_rs::{
    auth::{self, AuthService},
    config::{Cli, Command, Config, UserCommand},
    db::{Database, Role},
    server,
};
use std::io::{self, Write};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Find or load config
    let config_path = cli.config.clone().or_else(Config::find_config_file);

    let config = if let Some(ref path) = config_path {
        Config::load(path)?
    } else {
        Config::default()
    };

    // Handle command
    match cli.command {
        Some(Command::Init { force }) => cmd_init(force).await,
        Some(Command::User { action }) => cmd_user(action, &config).await,
        Some(Command::Serve { bind }) => cmd_serve(config, bind).await,
        None => {
            // Default: start server
            cmd_serve(config, None).await
        }
    }
}

/// Initialize config, database, default admin and sample catalog.
async fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    // Write default config
    std::fs::write(&config_path, Config::generate_default())?;
    println!("Created config file: {}", config_path.display());

    // Initialize database
    let config = Config::default();
    if let Some(parent) = config.database.path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = Database::open(&config.database.path)?;
    println!("Initialized database: {}", config.database.path.display());

    let (admin_created, seeded) = bootstrap(&db, &config)?;
    if admin_created {
        println!(
            "Created default admin account: {}",
            config.bootstrap.admin_username
        );
    }
    if seeded > 0 {
        println!("Seeded {} sample books", seeded);
    }

    println!("\nEdit config.toml to configure your server.");
    println!("Then run: librarian-rs serve");

    Ok(())
}

/// Apply the bootstrap section: default admin account and sample catalog.
///
/// Returns whether an admin was created and how many books were seeded.
fn bootstrap(db: &Database, config: &Config) -> anyhow::Result<(bool, usize)> {
    let hash = auth::hash_password(&config.bootstrap.admin_password)?;
    let admin_created = db.ensure_default_admin(&config.bootstrap.admin_username, &hash)?;

    let seeded = if config.bootstrap.seed_books {
        db.seed_sample_books()?
    } else {
        0
    };

    Ok((admin_created, seeded))
}

/// User management commands.
async fn cmd_user(action: UserCommand, config: &Config) -> anyhow::Result<()> {
    let db = Database::open(&config.database.path)?;
    let auth = AuthService::new(db);

    match action {
        UserCommand::Add {
            username,
            password,
            role,
        } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password("Password: ")?,
            };

            let role = Role::parse(&role)
                .ok_or_else(|| anyhow::anyhow!("Invalid role: {} (use admin or reader)", role))?;

            let user = auth.create_user(&username, &password, None, None, role)?;
            println!(
                "Created user: {} (role: {}, id: {})",
                user.username,
                user.role.as_str(),
                user.id
            );
        }

        UserCommand::List => {
            let users = auth.list_users()?;
            if users.is_empty() {
                println!("No users found.");
            } else {
                println!("{:<6} {:<20} {:<8} {:<20} CREATED", "ID", "USERNAME", "ROLE", "PHONE");
                println!("{}", "-".repeat(80));
                for user in users {
                    println!(
                        "{:<6} {:<20} {:<8} {:<20} {}",
                        user.id,
                        user.username,
                        user.role.as_str(),
                        user.phone.as_deref().unwrap_or("-"),
                        user.created_at
                    );
                }
            }
        }

        UserCommand::Passwd { username, password } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password("New password: ")?,
            };

            if auth.change_password(&username, &password)? {
                println!("Password changed for: {}", username);
            } else {
                println!("User not found: {}", username);
            }
        }
    }

    Ok(())
}

/// Start the server.
async fn cmd_serve(mut config: Config, bind: Option<std::net::SocketAddr>) -> anyhow::Result<()> {
    // Override bind address if specified
    if let Some(addr) = bind {
        config.server.bind = addr;
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "librarian_rs=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Open database
    if let Some(parent) = config.database.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::open(&config.database.path)?;

    let (admin_created, seeded) = bootstrap(&db, &config)?;
    if admin_created {
        tracing::info!(
            username = %config.bootstrap.admin_username,
            "Created default admin account"
        );
    }
    if seeded > 0 {
        tracing::info!(count = seeded, "Seeded sample catalog");
    }

    // Create auth service
    let auth = AuthService::new(db.clone());

    tracing::info!(
        bind = %config.server.bind,
        database = %config.database.path.display(),
        "Starting librarian-rs server"
    );

    // Create application state
    let state = server::AppState::new(config.clone(), db, auth);

    // Create router
    let app = server::create_router(state);

    let listener = TcpListener::bind(config.server.bind).await?;
    tracing::info!(address = %config.server.bind, "Server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Prompt for password input.
fn prompt_password(prompt: &str) -> anyhow::Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut password = String::new();
    io::stdin().read_line(&mut password)?;

    Ok(password.trim().to_string())
}
