use rusqlite::{params, Connection};

use super::now_ts;
use crate::Error;

/// One row per key rotation, keyed by the entity's permanent GUID so the
/// whole key lineage of an identity can be read back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RotationRecord {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: i64,
    pub permanent_guid: String,
    pub old_public_key: String,
    pub new_public_key: String,
    pub rotated_at: String,
    pub reason: String,
}

pub struct DatabaseRotation;

impl DatabaseRotation {
    pub fn record(
        conn: &Connection,
        entity_type: &str,
        entity_id: i64,
        permanent_guid: &str,
        old_public_key: &str,
        new_public_key: &str,
        reason: &str,
    ) -> Result<i64, Error> {
        conn.execute(
            "INSERT INTO key_rotation_history
               (entity_type, entity_id, permanent_guid, old_public_key,
                new_public_key, rotated_at, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entity_type,
                entity_id,
                permanent_guid,
                old_public_key,
                new_public_key,
                now_ts(),
                reason,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn history_for_guid(
        conn: &Connection,
        permanent_guid: &str,
    ) -> Result<Vec<RotationRecord>, Error> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, entity_type, entity_id, permanent_guid, old_public_key,
                    new_public_key, rotated_at, reason
             FROM key_rotation_history WHERE permanent_guid = ?1 ORDER BY id",
        )?;
        let records = stmt
            .query_map(params![permanent_guid], |row| {
                Ok(RotationRecord {
                    id: row.get(0)?,
                    entity_type: row.get(1)?,
                    entity_id: row.get(2)?,
                    permanent_guid: row.get(3)?,
                    old_public_key: row.get(4)?,
                    new_public_key: row.get(5)?,
                    rotated_at: row.get(6)?,
                    reason: row.get(7)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(records)
    }
}
