use rusqlite::{params, Connection};
use wgfleet_shared::hooks::{HookCommand, HookDirection, HookSource, HookTemplate};

use crate::Error;

/// Which entity a hook row belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookOwner {
    Server(i64),
    Router(i64),
    Exit(i64),
    ExtramuralConfig(i64),
}

impl HookOwner {
    fn parts(&self) -> (&'static str, i64) {
        match self {
            HookOwner::Server(id) => ("server", *id),
            HookOwner::Router(id) => ("router", *id),
            HookOwner::Exit(id) => ("exit", *id),
            HookOwner::ExtramuralConfig(id) => ("extramural_config", *id),
        }
    }
}

/// Command pairs (PreUp/PostUp/PreDown/PostDown) per entity. Foreign
/// commands keep their verbatim text; system-originated commands store
/// template parameters as JSON and re-render on write.
pub struct DatabaseHooks;

impl DatabaseHooks {
    pub fn replace(
        conn: &Connection,
        owner: HookOwner,
        commands: &[HookCommand],
    ) -> Result<(), Error> {
        let (owner_type, owner_id) = owner.parts();
        conn.execute(
            "DELETE FROM hooks WHERE owner_type = ?1 AND owner_id = ?2",
            params![owner_type, owner_id],
        )?;
        for command in commands {
            let (text, tag, template) = match &command.source {
                HookSource::Verbatim { text, tag } => (
                    Some(text.clone()),
                    tag.map(|t| {
                        serde_json::to_string(&t).expect("hook tags serialize infallibly")
                    }),
                    None,
                ),
                HookSource::Template(template) => (
                    None,
                    None,
                    Some(serde_json::to_string(template).map_err(|e| {
                        Error::validation("hook", format!("unserializable template: {e}"))
                    })?),
                ),
            };
            conn.execute(
                "INSERT INTO hooks (owner_type, owner_id, direction, seq, text, tag, template)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    owner_type,
                    owner_id,
                    command.direction.as_str(),
                    command.seq,
                    text,
                    tag,
                    template,
                ],
            )?;
        }
        Ok(())
    }

    pub fn list(conn: &Connection, owner: HookOwner) -> Result<Vec<HookCommand>, Error> {
        let (owner_type, owner_id) = owner.parts();
        let mut stmt = conn.prepare_cached(
            "SELECT direction, seq, text, tag, template FROM hooks
             WHERE owner_type = ?1 AND owner_id = ?2 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![owner_type, owner_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut commands = Vec::with_capacity(rows.len());
        for (direction, seq, text, tag, template) in rows {
            let direction: HookDirection = direction
                .parse()
                .map_err(|_| Error::Fatal(format!("bad hook direction {direction}")))?;
            let source = match (text, template) {
                (Some(text), _) => HookSource::Verbatim {
                    text,
                    tag: tag.and_then(|t| serde_json::from_str(&t).ok()),
                },
                (None, Some(template)) => {
                    let template: HookTemplate = serde_json::from_str(&template)
                        .map_err(|e| Error::Fatal(format!("corrupt hook template: {e}")))?;
                    HookSource::Template(template)
                },
                (None, None) => {
                    return Err(Error::Fatal("hook row with neither text nor template".into()))
                },
            };
            commands.push(HookCommand {
                direction,
                seq,
                source,
            });
        }
        Ok(commands)
    }
}
