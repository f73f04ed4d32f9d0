use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Self-service library management server.
#[derive(Parser, Debug, Clone)]
#[command(name = "librarian-rs")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "LIBRARIAN_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the server (default if no command given).
    Serve {
        /// Address to bind the server to.
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// User management commands.
    User {
        /// User subcommand action.
        #[command(subcommand)]
        action: UserCommand,
    },

    /// Initialize database, default admin account and sample catalog.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },
}

/// User management subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum UserCommand {
    /// Add a new user.
    Add {
        /// Username.
        username: String,
        /// Password (will prompt if not provided).
        #[arg(short, long)]
        password: Option<String>,
        /// User role (admin or reader).
        #[arg(short, long, default_value = "reader")]
        role: String,
    },

    /// List all users.
    List,

    /// Change user password.
    Passwd {
        /// Username.
        username: String,
        /// New password (will prompt if not provided).
        #[arg(short, long)]
        password: Option<String>,
    },
}

/// Main configuration from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Bootstrap configuration.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
        8080,
    )
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/library.db")
}

/// First-run bootstrap configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Username of the default admin account.
    #[serde(default = "default_admin_username")]
    pub admin_username: String,

    /// Password of the default admin account, used only when no admin exists.
    #[serde(default = "default_admin_password")]
    pub admin_password: String,

    /// Whether to insert sample catalog data into an empty books table.
    #[serde(default = "default_seed_books")]
    pub seed_books: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            admin_username: default_admin_username(),
            admin_password: default_admin_password(),
            seed_books: default_seed_books(),
        }
    }
}

fn default_admin_username() -> String {
    "admin".to_string()
}

fn default_admin_password() -> String {
    "admin123".to_string()
}

fn default_seed_books() -> bool {
    true
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &PathBuf) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to read config file: {}", e))
        })?;

        toml::from_str(&content).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to parse config file: {}", e))
        })
    }

    /// Find config file in default locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from("config.toml"),
            PathBuf::from("librarian-rs.toml"),
            dirs::config_dir()
                .map(|p| p.join("librarian-rs").join("config.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/librarian-rs/config.toml"),
        ];

        candidates.into_iter().find(|p| p.exists())
    }

    /// Generate default config file content.
    pub fn generate_default() -> String {
        r#"# librarian-rs configuration

[server]
bind = "0.0.0.0:8080"

[database]
# path = "/var/lib/librarian-rs/library.db"

[bootstrap]
# Default admin account, created on first run if no admin exists.
admin_username = "admin"
admin_password = "admin123"
# Insert sample catalog data when the books table is empty.
seed_books = true
"#
        .to_string()
    }
}
