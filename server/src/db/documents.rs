use rusqlite::{params, Connection, OptionalExtension};

use super::now_ts;
use crate::Error;

/// The rendered `.conf` document for each entity, kept so regeneration can
/// reconcile model state into the existing layout instead of rewriting the
/// file. Imported files land here verbatim; generated files land here
/// canonically; either way later edits only touch the lines whose meaning
/// changed.
pub struct DatabaseConfigDocument;

impl DatabaseConfigDocument {
    pub fn get(
        conn: &Connection,
        owner_type: &str,
        owner_id: i64,
    ) -> Result<Option<String>, Error> {
        Ok(conn
            .query_row(
                "SELECT text FROM config_documents WHERE owner_type = ?1 AND owner_id = ?2",
                params![owner_type, owner_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn put(
        conn: &Connection,
        owner_type: &str,
        owner_id: i64,
        text: &str,
    ) -> Result<(), Error> {
        conn.execute(
            "INSERT INTO config_documents (owner_type, owner_id, text, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (owner_type, owner_id) DO UPDATE SET text = ?3, updated_at = ?4",
            params![owner_type, owner_id, text, now_ts()],
        )?;
        Ok(())
    }

    pub fn delete(conn: &Connection, owner_type: &str, owner_id: i64) -> Result<(), Error> {
        conn.execute(
            "DELETE FROM config_documents WHERE owner_type = ?1 AND owner_id = ?2",
            params![owner_type, owner_id],
        )?;
        Ok(())
    }
}
