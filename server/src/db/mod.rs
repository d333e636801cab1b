use std::{
    net::IpAddr,
    path::Path,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Transaction, TransactionBehavior};

use crate::Error;

pub mod migrations;

mod documents;
mod exit;
mod extramural;
mod hooks;
mod order;
mod remote;
mod rotation;
mod router;
mod server;
mod ssh;
mod tokens;

pub use documents::DatabaseConfigDocument;
pub use exit::{DatabaseExit, DatabaseExitGroup, DatabaseExitHealth, DatabaseFailover};
pub use extramural::{
    DatabaseExtramuralConfig, DatabaseExtramuralPeer, DatabaseLocalPeer, DatabaseSponsor,
};
pub use hooks::{DatabaseHooks, HookOwner};
pub use order::DatabasePeerOrder;
pub use remote::DatabaseRemote;
pub use rotation::{DatabaseRotation, RotationRecord};
pub use router::DatabaseRouter;
pub use server::DatabaseServer;
pub use ssh::DatabaseSshHost;
pub use tokens::{DatabaseApiToken, TokenScope};

/// All mutating operations go through this single shared handle; the mutex
/// is the writer worker of the design. Read-only callers may open their own
/// connection with [`open_read_only`].
pub type Db = Arc<Mutex<Connection>>;

pub fn into_shared(conn: Connection) -> Db {
    Arc::new(Mutex::new(conn))
}

fn configure(conn: &Connection) -> Result<(), Error> {
    // Foreign key constraints aren't on in SQLite by default. Enable.
    conn.pragma_update(None, "foreign_keys", 1)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

/// Opens an existing datastore database, running any pending migrations.
pub fn open(path: &Path) -> Result<Connection, Error> {
    if !path.exists() {
        return Err(Error::not_found("datastore", path.display().to_string()));
    }
    let mut conn = Connection::open(path)?;
    configure(&conn)?;
    migrations::run(&mut conn)?;
    Ok(conn)
}

/// Creates a new database file and brings it to the current schema version.
pub fn create(path: &Path) -> Result<Connection, Error> {
    let mut conn = Connection::open(path)?;
    configure(&conn)?;
    migrations::run(&mut conn)?;
    Ok(conn)
}

/// A read-only connection for the generator and the HTTP API. Never taken
/// through the writer mutex.
pub fn open_read_only(path: &Path) -> Result<Connection, Error> {
    let conn = Connection::open_with_flags(
        path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

/// Begins an IMMEDIATE transaction, taking the write lock up front so
/// concurrent deciders (failover, operator commands) serialize instead of
/// interleaving.
pub fn immediate(conn: &mut Connection) -> Result<Transaction<'_>, Error> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

/// Checks VPN address uniqueness across every keyed entity table.
pub fn vpn_address_in_use(conn: &Connection, addr: IpAddr) -> Result<bool, Error> {
    let text = addr.to_string();
    let column = if addr.is_ipv4() { "ipv4_addr" } else { "ipv6_addr" };
    for table in ["servers", "routers", "remotes", "exits"] {
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE {column} = ?1"),
            params![text],
            |row| row.get(0),
        )?;
        if count > 0 {
            return Ok(true);
        }
    }
    Ok(false)
}

pub(crate) fn to_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn now_ts() -> String {
    to_ts(Utc::now())
}

pub(crate) fn parse_ts(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn opt_ts(row: Option<String>) -> Option<DateTime<Utc>> {
    row.as_deref().and_then(parse_ts)
}
