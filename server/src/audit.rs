//! The append-only audit log.
//!
//! Every state-changing operation writes exactly one entry, inside the same
//! transaction as the mutation. Entries are hash-chained
//! (`entry_hash = SHA-256(id || event_type || timestamp || canonical(details)
//! || previous_hash)`), and every [`CHECKPOINT_INTERVAL`] entries a Merkle
//! root over the range is stored so bulk verification can anchor itself.
//! Old entries may be archived to a side table; each archive keeps its own
//! contiguous chain.

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::{db, Error};

/// A Merkle checkpoint is cut every this many entries.
pub const CHECKPOINT_INTERVAL: i64 = 1000;

/// Hash chained to by the first entry.
const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// What a service-layer operation reports about itself.
#[derive(Clone, Debug)]
pub struct AuditEvent {
    pub event_type: String,
    pub category: String,
    pub severity: Severity,
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub entity_guid: Option<String>,
    pub operator: String,
    pub operator_source: String,
    pub details: serde_json::Value,
}

impl AuditEvent {
    pub fn new(event_type: &str, category: &str, operator: &str) -> Self {
        AuditEvent {
            event_type: event_type.to_string(),
            category: category.to_string(),
            severity: Severity::Info,
            entity_type: None,
            entity_id: None,
            entity_guid: None,
            operator: operator.to_string(),
            operator_source: "cli".to_string(),
            details: serde_json::Value::Null,
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn entity(mut self, entity_type: &str, id: i64, guid: &str) -> Self {
        self.entity_type = Some(entity_type.to_string());
        self.entity_id = Some(id);
        self.entity_guid = Some(guid.to_string());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[derive(Clone, Debug)]
pub struct AuditEntry {
    pub id: i64,
    pub event_type: String,
    pub severity: String,
    pub timestamp: String,
    pub details: String,
    pub previous_hash: String,
    pub entry_hash: String,
}

fn sha256_hex(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

/// Deterministic encoding of the details value. serde_json objects iterate
/// in sorted key order, so serialization is already canonical.
fn canonical(details: &serde_json::Value) -> String {
    serde_json::to_string(details).unwrap_or_else(|_| "null".to_string())
}

fn entry_hash(
    id: i64,
    event_type: &str,
    timestamp: &str,
    canonical_details: &str,
    previous_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.to_string());
    hasher.update(event_type);
    hasher.update(timestamp);
    hasher.update(canonical_details);
    hasher.update(previous_hash);
    hex::encode(hasher.finalize())
}

/// Root of a Merkle tree over entry hashes, odd nodes paired with
/// themselves.
fn merkle_root(hashes: &[String]) -> String {
    if hashes.is_empty() {
        return GENESIS_HASH.to_string();
    }
    let mut level: Vec<String> = hashes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                sha256_hex(format!("{}{}", pair[0], right).as_bytes())
            })
            .collect();
    }
    level.remove(0)
}

pub struct AuditLog;

impl AuditLog {
    /// Appends one entry. Must run inside the mutating transaction so the
    /// model change and its audit record land or roll back together.
    pub fn append(conn: &Connection, event: AuditEvent) -> Result<AuditEntry, Error> {
        let previous_hash: String = conn
            .query_row(
                "SELECT entry_hash FROM audit_log ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let id: i64 = conn.query_row(
            "SELECT COALESCE(MAX(id), 0) + 1 FROM audit_log",
            [],
            |row| row.get(0),
        )?;
        let timestamp = db::now_ts();
        let details = canonical(&event.details);
        let hash = entry_hash(id, &event.event_type, &timestamp, &details, &previous_hash);

        conn.execute(
            "INSERT INTO audit_log
               (id, event_type, category, severity, entity_type, entity_id, entity_guid,
                operator, operator_source, details, timestamp, previous_hash, entry_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                id,
                event.event_type,
                event.category,
                event.severity.as_str(),
                event.entity_type,
                event.entity_id,
                event.entity_guid,
                event.operator,
                event.operator_source,
                details,
                timestamp,
                previous_hash,
                hash,
            ],
        )?;

        if id % CHECKPOINT_INTERVAL == 0 {
            Self::checkpoint(conn, id - CHECKPOINT_INTERVAL + 1, id)?;
        }

        Ok(AuditEntry {
            id,
            event_type: event.event_type,
            severity: event.severity.as_str().to_string(),
            timestamp,
            details,
            previous_hash,
            entry_hash: hash,
        })
    }

    fn checkpoint(conn: &Connection, start_id: i64, end_id: i64) -> Result<(), Error> {
        let mut stmt = conn.prepare(
            "SELECT id, entry_hash FROM audit_log WHERE id >= ?1 AND id <= ?2 ORDER BY id",
        )?;
        let rows: Vec<(i64, String)> = stmt
            .query_map(params![start_id, end_id], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<_, _>>()?;
        let hashes: Vec<String> = rows.iter().map(|(_, h)| h.clone()).collect();
        let root = merkle_root(&hashes);

        conn.execute(
            "INSERT INTO audit_checkpoints (start_id, end_id, merkle_root, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![start_id, end_id, root, db::now_ts()],
        )?;
        for (index, (id, _)) in rows.iter().enumerate() {
            conn.execute(
                "UPDATE audit_log SET merkle_root = ?1, merkle_tree_index = ?2 WHERE id = ?3",
                params![root, index as i64, id],
            )?;
        }
        log::debug!("audit checkpoint {start_id}..{end_id} rooted at {root}");
        Ok(())
    }

    /// Walks the chain left to right, recomputing every hash, then checks
    /// every Merkle checkpoint. The live log and each archive table verify
    /// independently (archival keeps each chain contiguous).
    pub fn verify_integrity(conn: &Connection) -> Result<u64, Error> {
        let mut checked = Self::verify_table(conn, "audit_archive")?;
        checked += Self::verify_table(conn, "audit_log")?;
        Self::verify_checkpoints(conn)?;
        Ok(checked)
    }

    fn verify_table(conn: &Connection, table: &str) -> Result<u64, Error> {
        let mut stmt = conn.prepare(&format!(
            "SELECT id, event_type, timestamp, details, previous_hash, entry_hash
             FROM {table} ORDER BY id"
        ))?;
        let rows: Vec<(i64, String, String, String, String, String)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<Result<_, _>>()?;

        let mut expected_prev: Option<String> = None;
        let mut checked = 0u64;
        for (id, event_type, timestamp, details, previous_hash, stored_hash) in rows {
            if let Some(prev) = &expected_prev {
                if prev != &previous_hash {
                    return Err(Error::Integrity {
                        entry_id: id,
                        expected: prev.clone(),
                        actual: previous_hash,
                    });
                }
            }
            let computed = entry_hash(id, &event_type, &timestamp, &details, &previous_hash);
            if computed != stored_hash {
                return Err(Error::Integrity {
                    entry_id: id,
                    expected: computed,
                    actual: stored_hash,
                });
            }
            expected_prev = Some(stored_hash);
            checked += 1;
        }
        Ok(checked)
    }

    fn verify_checkpoints(conn: &Connection) -> Result<(), Error> {
        let mut stmt = conn
            .prepare("SELECT start_id, end_id, merkle_root FROM audit_checkpoints ORDER BY id")?;
        let checkpoints: Vec<(i64, i64, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<_, _>>()?;

        for (start_id, end_id, stored_root) in checkpoints {
            let mut stmt = conn.prepare(
                "SELECT entry_hash FROM audit_log WHERE id >= ?1 AND id <= ?2 ORDER BY id",
            )?;
            let mut hashes: Vec<String> = stmt
                .query_map(params![start_id, end_id], |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            if hashes.is_empty() {
                // The range was archived; recompute from the archive.
                let mut stmt = conn.prepare(
                    "SELECT entry_hash FROM audit_archive WHERE id >= ?1 AND id <= ?2 ORDER BY id",
                )?;
                hashes = stmt
                    .query_map(params![start_id, end_id], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;
            }
            let computed = merkle_root(&hashes);
            if computed != stored_root {
                return Err(Error::Integrity {
                    entry_id: start_id,
                    expected: computed,
                    actual: stored_root,
                });
            }
        }
        Ok(())
    }

    /// Moves entries older than the cutoff (RFC 3339) to the archive table.
    /// Only whole checkpoint ranges move, so each chain stays contiguous.
    pub fn archive_before(conn: &Connection, cutoff: &str) -> Result<u64, Error> {
        let boundary: Option<i64> = conn
            .query_row(
                "SELECT MAX(end_id) FROM audit_checkpoints
                 WHERE end_id <= (SELECT COALESCE(MAX(id), 0) FROM audit_log WHERE timestamp < ?1)",
                params![cutoff],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let Some(boundary) = boundary else {
            return Ok(0);
        };
        conn.execute(
            "INSERT INTO audit_archive SELECT * FROM audit_log WHERE id <= ?1",
            params![boundary],
        )?;
        let moved = conn.execute("DELETE FROM audit_log WHERE id <= ?1", params![boundary])?;
        log::info!("archived {moved} audit entries up to id {boundary}");
        Ok(moved as u64)
    }

    pub fn list_recent(conn: &Connection, limit: u32) -> Result<Vec<AuditEntry>, Error> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, event_type, severity, timestamp, details, previous_hash, entry_hash
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], |row| {
                Ok(AuditEntry {
                    id: row.get(0)?,
                    event_type: row.get(1)?,
                    severity: row.get(2)?,
                    timestamp: row.get(3)?,
                    details: row.get(4)?,
                    previous_hash: row.get(5)?,
                    entry_hash: row.get(6)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn test_conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        crate::db::migrations::run(&mut conn).unwrap();
        conn
    }

    fn append_n(conn: &Connection, n: usize) {
        for i in 0..n {
            AuditLog::append(
                conn,
                AuditEvent::new("peer_added", "topology", "tester")
                    .details(serde_json::json!({ "n": i })),
            )
            .unwrap();
        }
    }

    #[test]
    fn chain_verifies_after_legal_operations() {
        let conn = test_conn();
        append_n(&conn, 25);
        assert_eq!(AuditLog::verify_integrity(&conn).unwrap(), 25);
    }

    #[test]
    fn single_byte_tamper_is_detected_with_the_tampered_id() {
        let conn = test_conn();
        append_n(&conn, 10);

        conn.execute(
            "UPDATE audit_log SET details = '{\"n\":999}' WHERE id = 4",
            [],
        )
        .unwrap();
        match AuditLog::verify_integrity(&conn) {
            Err(Error::Integrity { entry_id, .. }) => assert_eq!(entry_id, 4),
            other => panic!("expected integrity failure, got {other:?}"),
        }
    }

    #[test]
    fn tampered_hash_is_detected() {
        let conn = test_conn();
        append_n(&conn, 10);

        let hash: String = conn
            .query_row("SELECT entry_hash FROM audit_log WHERE id = 7", [], |r| {
                r.get(0)
            })
            .unwrap();
        let mut tampered = hash.into_bytes();
        tampered[0] = if tampered[0] == b'0' { b'1' } else { b'0' };
        conn.execute(
            "UPDATE audit_log SET entry_hash = ?1 WHERE id = 7",
            params![String::from_utf8(tampered).unwrap()],
        )
        .unwrap();

        match AuditLog::verify_integrity(&conn) {
            // Either entry 7's own hash or entry 8's previous_hash link
            // trips first; both point inside the tampered region.
            Err(Error::Integrity { entry_id, .. }) => assert!(entry_id == 7 || entry_id == 8),
            other => panic!("expected integrity failure, got {other:?}"),
        }
    }

    #[test]
    fn canonical_details_are_key_ordered() {
        let a = canonical(&serde_json::json!({"b": 1, "a": 2}));
        let b = canonical(&serde_json::json!({"a": 2, "b": 1}));
        assert_eq!(a, b);
        assert_eq!(a, "{\"a\":2,\"b\":1}");
    }

    #[test]
    fn merkle_root_is_deterministic() {
        let hashes: Vec<String> = (0..5).map(|i| sha256_hex(&[i])).collect();
        assert_eq!(merkle_root(&hashes), merkle_root(&hashes));
        assert_ne!(merkle_root(&hashes[..4]), merkle_root(&hashes));
    }
}
