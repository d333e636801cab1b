//! Linear, additive schema migrations, versioned in `PRAGMA user_version`.
//! Each step runs in its own transaction; a datastore at version N gets
//! every step after N applied in order.

use rusqlite::Connection;

use crate::Error;

/// v1: the mesh core - hub, routers, remotes, exits, failover, ordering,
/// identity, audit, at-rest encryption metadata.
const V1_MESH: &str = "
CREATE TABLE ssh_hosts (
    id          INTEGER PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    host        TEXT NOT NULL,
    port        INTEGER NOT NULL DEFAULT 22,
    user        TEXT NOT NULL DEFAULT 'root',
    key_path    TEXT,
    config_dir  TEXT NOT NULL
);

CREATE TABLE servers (
    id             INTEGER PRIMARY KEY,
    hostname       TEXT NOT NULL UNIQUE,
    endpoint       TEXT NOT NULL,
    ipv4_cidr      TEXT,
    ipv6_cidr      TEXT,
    ipv4_addr      TEXT UNIQUE,
    ipv6_addr      TEXT UNIQUE,
    public_key     TEXT NOT NULL UNIQUE,
    private_key    TEXT NOT NULL,
    permanent_guid TEXT NOT NULL UNIQUE,
    listen_port    INTEGER NOT NULL,
    mtu            INTEGER,
    ssh_host_id    INTEGER REFERENCES ssh_hosts (id) ON DELETE SET NULL
);

CREATE TABLE exits (
    id             INTEGER PRIMARY KEY,
    server_id      INTEGER NOT NULL,
    hostname       TEXT NOT NULL UNIQUE,
    endpoint       TEXT NOT NULL,
    listen_port    INTEGER NOT NULL,
    ipv4_addr      TEXT UNIQUE,
    ipv6_addr      TEXT UNIQUE,
    public_key     TEXT NOT NULL UNIQUE,
    private_key    TEXT,
    permanent_guid TEXT NOT NULL UNIQUE,
    ssh_host_id    INTEGER REFERENCES ssh_hosts (id) ON DELETE SET NULL,
    FOREIGN KEY (server_id) REFERENCES servers (id) ON DELETE CASCADE
);

CREATE TABLE exit_groups (
    id                  INTEGER PRIMARY KEY,
    name                TEXT NOT NULL UNIQUE,
    strategy            TEXT NOT NULL DEFAULT 'priority',
    check_interval_secs INTEGER NOT NULL DEFAULT 30,
    check_timeout_secs  INTEGER NOT NULL DEFAULT 5,
    rr_cursor           INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE exit_group_members (
    group_id            INTEGER NOT NULL,
    exit_id             INTEGER NOT NULL,
    seq                 INTEGER NOT NULL,
    static_priority     INTEGER NOT NULL DEFAULT 0,
    priority_adjustment INTEGER NOT NULL DEFAULT 0,
    weight              INTEGER NOT NULL DEFAULT 1,
    enabled             INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (group_id, exit_id),
    FOREIGN KEY (group_id) REFERENCES exit_groups (id) ON DELETE CASCADE,
    FOREIGN KEY (exit_id) REFERENCES exits (id) ON DELETE CASCADE
);

CREATE TABLE exit_health (
    exit_id               INTEGER PRIMARY KEY,
    state                 TEXT NOT NULL DEFAULT 'healthy',
    last_check_at         TEXT,
    latency_ms            INTEGER,
    consecutive_failures  INTEGER NOT NULL DEFAULT 0,
    consecutive_successes INTEGER NOT NULL DEFAULT 0,
    last_success_at       TEXT,
    last_failure_at       TEXT,
    failure_reason        TEXT,
    FOREIGN KEY (exit_id) REFERENCES exits (id) ON DELETE CASCADE
);

CREATE TABLE failover_history (
    id             INTEGER PRIMARY KEY,
    remote_id      INTEGER NOT NULL,
    group_id       INTEGER NOT NULL,
    from_exit_id   INTEGER,
    to_exit_id     INTEGER,
    trigger_reason TEXT NOT NULL,
    success        INTEGER NOT NULL,
    error_message  TEXT,
    timestamp      TEXT NOT NULL
);

CREATE TABLE remotes (
    id                 INTEGER PRIMARY KEY,
    server_id          INTEGER NOT NULL,
    hostname           TEXT NOT NULL UNIQUE,
    ipv4_addr          TEXT UNIQUE,
    ipv6_addr          TEXT UNIQUE,
    public_key         TEXT NOT NULL UNIQUE,
    private_key        TEXT,
    permanent_guid     TEXT NOT NULL UNIQUE,
    access_level       TEXT NOT NULL DEFAULT 'vpn_only',
    custom_allowed_ips TEXT,
    exit_node_id       INTEGER REFERENCES exits (id) ON DELETE SET NULL,
    exit_group_id      INTEGER REFERENCES exit_groups (id) ON DELETE SET NULL,
    active_exit_id     INTEGER REFERENCES exits (id) ON DELETE SET NULL,
    preshared_key      TEXT,
    keepalive          INTEGER,
    last_rotated_at    TEXT,
    FOREIGN KEY (server_id) REFERENCES servers (id) ON DELETE CASCADE
);

CREATE TABLE remote_lans (
    remote_id INTEGER NOT NULL,
    seq       INTEGER NOT NULL,
    cidr      TEXT NOT NULL,
    PRIMARY KEY (remote_id, seq),
    FOREIGN KEY (remote_id) REFERENCES remotes (id) ON DELETE CASCADE
);

CREATE TABLE routers (
    id             INTEGER PRIMARY KEY,
    server_id      INTEGER NOT NULL,
    hostname       TEXT NOT NULL UNIQUE,
    ipv4_addr      TEXT UNIQUE,
    ipv6_addr      TEXT UNIQUE,
    endpoint       TEXT,
    has_endpoint   INTEGER NOT NULL DEFAULT 0,
    allowed_ips    TEXT NOT NULL,
    public_key     TEXT NOT NULL UNIQUE,
    private_key    TEXT,
    permanent_guid TEXT NOT NULL UNIQUE,
    ssh_host_id    INTEGER REFERENCES ssh_hosts (id) ON DELETE SET NULL,
    FOREIGN KEY (server_id) REFERENCES servers (id) ON DELETE CASCADE
);

CREATE TABLE router_lans (
    router_id INTEGER NOT NULL,
    seq       INTEGER NOT NULL,
    cidr      TEXT NOT NULL,
    PRIMARY KEY (router_id, seq),
    FOREIGN KEY (router_id) REFERENCES routers (id) ON DELETE CASCADE
);

CREATE TABLE hooks (
    id         INTEGER PRIMARY KEY,
    owner_type TEXT NOT NULL,
    owner_id   INTEGER NOT NULL,
    direction  TEXT NOT NULL,
    seq        INTEGER NOT NULL,
    text       TEXT,
    tag        TEXT,
    template   TEXT,
    UNIQUE (owner_type, owner_id, direction, seq)
);

CREATE TABLE peer_order (
    server_id INTEGER NOT NULL,
    seq       INTEGER NOT NULL,
    role      TEXT NOT NULL,
    peer_id   INTEGER NOT NULL,
    PRIMARY KEY (server_id, seq),
    UNIQUE (server_id, role, peer_id),
    FOREIGN KEY (server_id) REFERENCES servers (id) ON DELETE CASCADE
);

CREATE TABLE key_rotation_history (
    id             INTEGER PRIMARY KEY,
    entity_type    TEXT NOT NULL,
    entity_id      INTEGER NOT NULL,
    permanent_guid TEXT NOT NULL,
    old_public_key TEXT NOT NULL,
    new_public_key TEXT NOT NULL,
    rotated_at     TEXT NOT NULL,
    reason         TEXT NOT NULL
);

CREATE TABLE audit_log (
    id                INTEGER PRIMARY KEY,
    event_type        TEXT NOT NULL,
    category          TEXT NOT NULL,
    severity          TEXT NOT NULL,
    entity_type       TEXT,
    entity_id         INTEGER,
    entity_guid       TEXT,
    operator          TEXT NOT NULL,
    operator_source   TEXT NOT NULL,
    details           TEXT NOT NULL,
    timestamp         TEXT NOT NULL,
    previous_hash     TEXT NOT NULL,
    entry_hash        TEXT NOT NULL,
    merkle_root       TEXT,
    merkle_tree_index INTEGER
);

CREATE TABLE audit_checkpoints (
    id          INTEGER PRIMARY KEY,
    start_id    INTEGER NOT NULL,
    end_id      INTEGER NOT NULL,
    merkle_root TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE vault_meta (
    id     INTEGER PRIMARY KEY CHECK (id = 1),
    kdf    TEXT NOT NULL,
    m_cost INTEGER NOT NULL,
    t_cost INTEGER NOT NULL,
    p_cost INTEGER NOT NULL,
    salt   TEXT NOT NULL,
    canary TEXT NOT NULL
);

CREATE TABLE config_documents (
    owner_type TEXT NOT NULL,
    owner_id   INTEGER NOT NULL,
    text       TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (owner_type, owner_id)
);
";

/// v2: extramural configs - sponsors, local peers, per-config peers with the
/// single-active invariant enforced by triggers.
const V2_EXTRAMURAL: &str = "
CREATE TABLE sponsors (
    id      INTEGER PRIMARY KEY,
    name    TEXT NOT NULL UNIQUE,
    website TEXT
);

CREATE TABLE local_peers (
    id             INTEGER PRIMARY KEY,
    name           TEXT NOT NULL UNIQUE,
    permanent_guid TEXT UNIQUE,
    ssh_host_id    INTEGER REFERENCES ssh_hosts (id) ON DELETE SET NULL
);

CREATE TABLE extramural_configs (
    id                    INTEGER PRIMARY KEY,
    local_peer_id         INTEGER NOT NULL,
    sponsor_id            INTEGER NOT NULL,
    permanent_guid        TEXT NOT NULL UNIQUE,
    public_key            TEXT NOT NULL,
    private_key           TEXT NOT NULL,
    ipv4_addr             TEXT,
    ipv6_addr             TEXT,
    dns                   TEXT NOT NULL DEFAULT '',
    mtu                   INTEGER,
    listen_port           INTEGER,
    interface_name        TEXT NOT NULL,
    pending_remote_update INTEGER NOT NULL DEFAULT 0,
    last_deployed_at      TEXT,
    last_key_rotation_at  TEXT,
    UNIQUE (local_peer_id, sponsor_id),
    FOREIGN KEY (local_peer_id) REFERENCES local_peers (id) ON DELETE CASCADE,
    FOREIGN KEY (sponsor_id) REFERENCES sponsors (id) ON DELETE CASCADE
);

CREATE TABLE extramural_peers (
    id            INTEGER PRIMARY KEY,
    config_id     INTEGER NOT NULL,
    name          TEXT NOT NULL,
    public_key    TEXT NOT NULL,
    endpoint      TEXT NOT NULL,
    allowed_ips   TEXT NOT NULL,
    preshared_key TEXT,
    keepalive     INTEGER,
    is_active     INTEGER NOT NULL DEFAULT 0,
    UNIQUE (config_id, name),
    FOREIGN KEY (config_id) REFERENCES extramural_configs (id) ON DELETE CASCADE
);

CREATE TRIGGER extramural_single_active_on_update
AFTER UPDATE OF is_active ON extramural_peers
WHEN NEW.is_active = 1
BEGIN
    UPDATE extramural_peers SET is_active = 0
    WHERE config_id = NEW.config_id AND id != NEW.id AND is_active = 1;
END;

CREATE TRIGGER extramural_single_active_on_insert
AFTER INSERT ON extramural_peers
WHEN NEW.is_active = 1
BEGIN
    UPDATE extramural_peers SET is_active = 0
    WHERE config_id = NEW.config_id AND id != NEW.id AND is_active = 1;
END;
";

/// v3: read-only API tokens and audit archival.
const V3_API_AND_ARCHIVE: &str = "
CREATE TABLE api_tokens (
    id         INTEGER PRIMARY KEY,
    name       TEXT NOT NULL UNIQUE,
    token_hash TEXT NOT NULL,
    salt       TEXT NOT NULL,
    scope      TEXT NOT NULL DEFAULT 'read',
    created_at TEXT NOT NULL
);

CREATE TABLE audit_archive (
    id                INTEGER PRIMARY KEY,
    event_type        TEXT NOT NULL,
    category          TEXT NOT NULL,
    severity          TEXT NOT NULL,
    entity_type       TEXT,
    entity_id         INTEGER,
    entity_guid       TEXT,
    operator          TEXT NOT NULL,
    operator_source   TEXT NOT NULL,
    details           TEXT NOT NULL,
    timestamp         TEXT NOT NULL,
    previous_hash     TEXT NOT NULL,
    entry_hash        TEXT NOT NULL,
    merkle_root       TEXT,
    merkle_tree_index INTEGER
);
";

/// v4: rolling latency window on exit health rows, feeding the median-based
/// `latency` selection strategy. Stored as a comma-separated list, oldest
/// sample first.
const V4_LATENCY_WINDOW: &str = "
ALTER TABLE exit_health ADD COLUMN latency_samples TEXT NOT NULL DEFAULT '';
";

const MIGRATIONS: &[&str] = &[V1_MESH, V2_EXTRAMURAL, V3_API_AND_ARCHIVE, V4_LATENCY_WINDOW];

pub fn current_version(conn: &Connection) -> Result<i64, Error> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

pub fn run(conn: &mut Connection) -> Result<(), Error> {
    let version = current_version(conn)? as usize;
    if version > MIGRATIONS.len() {
        return Err(Error::Fatal(format!(
            "datastore schema version {} is newer than this binary understands ({})",
            version,
            MIGRATIONS.len()
        )));
    }
    for (idx, sql) in MIGRATIONS.iter().enumerate().skip(version) {
        log::info!("migrating datastore schema to version {}", idx + 1);
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", (idx + 1) as i64)?;
        tx.commit()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_cleanly_and_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", 1).unwrap();
        run(&mut conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), MIGRATIONS.len() as i64);
        // A second run is a no-op.
        run(&mut conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), MIGRATIONS.len() as i64);
    }

    #[test]
    fn newer_schema_is_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 99).unwrap();
        assert!(matches!(run(&mut conn), Err(Error::Fatal(_))));
    }
}
