use std::{
    env,
    fs::File,
    io::prelude::*,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use colored::*;
use serde::{Deserialize, Serialize};

use wgfleet_shared as shared;

pub mod alerts;
pub mod alloc;
pub mod api;
pub mod audit;
pub mod backup;
pub mod db;
pub mod deploy;
pub mod error;
pub mod failover;
pub mod generator;
pub mod import;
pub mod journal;
pub mod policy;
#[cfg(test)]
mod test;
pub mod vault;

pub use error::Error;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The database file inside a datastore directory.
pub const DATABASE_FILE: &str = "wireguard.db";
/// Optional operator configuration next to the database.
pub const CONFIG_FILE: &str = "fleet.toml";

/// One datastore working directory. Multi-tenancy is just multiple of
/// these; nothing is shared between them.
#[derive(Clone, Debug)]
pub struct Datastore {
    root: PathBuf,
}

impl Datastore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolution order: explicit flag, then `WGF_DB` (which names the
    /// database file), then the default system directory.
    pub fn resolve(flag: Option<PathBuf>) -> Self {
        if let Some(root) = flag {
            return Self::new(root);
        }
        if let Some(db_file) = env::var_os(shared::WGF_DB_ENV) {
            let db_file = PathBuf::from(db_file);
            let root = db_file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            return Self::new(root);
        }
        Self::new(PathBuf::from("/var/lib/wgfleet"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join(DATABASE_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Operator-supplied `.conf` drop for `import`.
    pub fn import_dir(&self) -> PathBuf {
        self.root.join("import")
    }

    /// Generator output.
    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    /// Local backup bundles.
    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn ensure_layout(&self) -> Result<(), Error> {
        shared::ensure_dirs_exist(&[
            &self.root,
            &self.import_dir(),
            &self.output_dir(),
            &self.backups_dir(),
        ])?;
        Ok(())
    }
}

/// `fleet.toml`: optional operator settings for a datastore.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FleetConfig {
    /// Name recorded as `operator` in audit entries.
    pub operator: Option<String>,

    /// Listen address for the read-only HTTP API; API disabled if unset.
    pub api_listen: Option<SocketAddr>,

    /// Webhook endpoints notified by the alert dispatcher.
    pub webhooks: Vec<alerts::WebhookEndpoint>,

    /// Alert rules; an empty list means every event of severity >= warning
    /// is dispatched.
    pub alert_rules: Vec<alerts::AlertRule>,
}

impl FleetConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            return Ok(Self::default());
        }
        shared::warn_on_dangerous_mode(path)?;
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::validation("fleet.toml", e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let mut file = File::create(path)?;
        shared::chmod(&file, 0o600)?;
        file.write_all(
            toml::to_string(self)
                .map_err(|e| Error::validation("fleet.toml", e.to_string()))?
                .as_bytes(),
        )?;
        Ok(())
    }
}

/// Everything a service-layer operation needs.
#[derive(Clone)]
pub struct Context {
    pub db: db::Db,
    pub vault: Arc<vault::Vault>,
    pub store: Datastore,
    pub config: FleetConfig,
    pub bus: journal::EventBus,
}

impl Context {
    /// Opens an existing datastore.
    pub fn open(store: Datastore, passphrase: Option<&str>) -> Result<Self, Error> {
        let config = FleetConfig::load(&store.config_path())?;
        let conn = db::open(&store.database_path())?;
        let vault = Arc::new(vault::Vault::open(&conn, passphrase)?);
        Ok(Context {
            db: db::into_shared(conn),
            vault,
            store,
            config,
            bus: journal::EventBus::new(),
        })
    }

    /// Creates a fresh datastore directory and empty database.
    pub fn init(store: Datastore, passphrase: Option<&str>) -> Result<Self, Error> {
        store.ensure_layout()?;
        let db_path = store.database_path();
        if db_path.exists() {
            return Err(Error::Conflict(format!(
                "datastore already initialized at {}",
                db_path.display()
            )));
        }
        let conn = db::create(&db_path)?;
        let vault = if let Some(pass) = passphrase {
            Arc::new(vault::Vault::initialize(&conn, pass)?)
        } else {
            Arc::new(vault::Vault::plaintext())
        };
        println!(
            "{} initialized datastore at {}",
            "[*]".dimmed(),
            store.root().display()
        );
        Ok(Context {
            db: db::into_shared(conn),
            vault,
            store,
            config: FleetConfig::default(),
            bus: journal::EventBus::new(),
        })
    }

    pub fn operator(&self) -> String {
        self.config
            .operator
            .clone()
            .or_else(|| env::var("USER").ok())
            .unwrap_or_else(|| "operator".to_string())
    }
}
