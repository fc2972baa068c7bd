//! Server settings and their command line / environment sources

use clap::Parser;
use shared::DEFAULT_PORT;
use std::path::PathBuf;

/// Command line of the table server
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Shared tabletop server")]
pub struct Args {
    /// Port for both the reliable (TCP) and stream (UDP) channels
    #[arg(env = "TABLETOP_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    pub host: String,

    /// Password that grants admin rights through /login
    #[arg(long, env = "TABLETOP_ADMIN_PASSWORD", hide_env_values = true)]
    pub admin_password: Option<String>,

    /// Accept admin logins at all
    #[arg(long)]
    pub allow_admin: bool,

    /// Directory holding one sub-directory per class package
    #[arg(short, long, default_value = "packages")]
    pub packages: PathBuf,

    /// Name announced to the directory service
    #[arg(short, long, default_value = "Tabletop")]
    pub name: String,

    /// Directory service to register with, as host:port
    #[arg(short, long)]
    pub directory: Option<String>,
}

/// Typed settings consumed by the game state and the network loop
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub admin_password: Option<String>,
    pub allow_admin: bool,
    pub packages: PathBuf,
    pub name: String,
    pub directory: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            admin_password: None,
            allow_admin: false,
            packages: PathBuf::from("packages"),
            name: "Tabletop".to_string(),
            directory: None,
        }
    }
}

impl From<Args> for Settings {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            admin_password: args.admin_password.filter(|p| !p.is_empty()),
            allow_admin: args.allow_admin,
            packages: args.packages,
            name: args.name,
            directory: args.directory,
        }
    }
}

impl Settings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// True when `password` grants admin rights under these settings
    pub fn admits(&self, password: &str) -> bool {
        self.allow_admin && self.admin_password.as_deref() == Some(password)
    }
}
