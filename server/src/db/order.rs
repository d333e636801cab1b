use rusqlite::{params, Connection};
use wgfleet_shared::{PeerOrderEntry, PeerRole};

use crate::Error;

/// The total order of `[Peer]` blocks in the hub's config. Imports persist
/// the observed order exactly; new peers append at the end of their
/// category, with routers always ahead of remotes and exits.
pub struct DatabasePeerOrder;

impl DatabasePeerOrder {
    pub fn list(conn: &Connection, server_id: i64) -> Result<Vec<PeerOrderEntry>, Error> {
        let mut stmt = conn.prepare_cached(
            "SELECT seq, role, peer_id FROM peer_order WHERE server_id = ?1 ORDER BY seq",
        )?;
        let entries = stmt
            .query_map(params![server_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        entries
            .into_iter()
            .map(|(seq, role, peer_id)| {
                Ok(PeerOrderEntry {
                    seq,
                    role: role
                        .parse()
                        .map_err(|_| Error::Fatal(format!("bad peer role {role}")))?,
                    peer_id,
                })
            })
            .collect()
    }

    /// Replaces the whole order, e.g. with the order observed by an import.
    pub fn set(
        conn: &Connection,
        server_id: i64,
        entries: &[(PeerRole, i64)],
    ) -> Result<(), Error> {
        conn.execute(
            "DELETE FROM peer_order WHERE server_id = ?1",
            params![server_id],
        )?;
        for (seq, (role, peer_id)) in entries.iter().enumerate() {
            conn.execute(
                "INSERT INTO peer_order (server_id, seq, role, peer_id) VALUES (?1, ?2, ?3, ?4)",
                params![server_id, seq as i64, role.as_str(), peer_id],
            )?;
        }
        Ok(())
    }

    /// Appends a new peer at the end of its category.
    pub fn append(
        conn: &Connection,
        server_id: i64,
        role: PeerRole,
        peer_id: i64,
    ) -> Result<(), Error> {
        let current = Self::list(conn, server_id)?;
        let position = match role {
            // Routers go after the last router, before any remote or exit.
            PeerRole::Router => current
                .iter()
                .rposition(|e| e.role == PeerRole::Router)
                .map(|idx| idx + 1)
                .unwrap_or_else(|| {
                    current
                        .iter()
                        .position(|e| e.role != PeerRole::Router)
                        .unwrap_or(current.len())
                }),
            PeerRole::Remote | PeerRole::Exit => current.len(),
        };

        let mut reordered: Vec<(PeerRole, i64)> =
            current.iter().map(|e| (e.role, e.peer_id)).collect();
        reordered.insert(position, (role, peer_id));
        Self::set(conn, server_id, &reordered)
    }

    pub fn remove(
        conn: &Connection,
        server_id: i64,
        role: PeerRole,
        peer_id: i64,
    ) -> Result<(), Error> {
        conn.execute(
            "DELETE FROM peer_order WHERE server_id = ?1 AND role = ?2 AND peer_id = ?3",
            params![server_id, role.as_str(), peer_id],
        )?;
        Ok(())
    }
}
