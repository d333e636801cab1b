use rand_core::{OsRng, RngCore};
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::now_ts;
use crate::Error;

/// Bearer token scope for the read-only HTTP surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TokenScope {
    Read,
    Write,
    Admin,
}

impl TokenScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenScope::Read => "read",
            TokenScope::Write => "write",
            TokenScope::Admin => "admin",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(TokenScope::Read),
            "write" => Some(TokenScope::Write),
            "admin" => Some(TokenScope::Admin),
            _ => None,
        }
    }
}

/// API tokens are stored as salted SHA-256 hashes; the plaintext is shown
/// once at creation and never again.
pub struct DatabaseApiToken;

impl DatabaseApiToken {
    /// Creates a token and returns the plaintext to hand to the operator.
    pub fn create(conn: &Connection, name: &str, scope: TokenScope) -> Result<String, Error> {
        let mut token_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut token_bytes);
        let token = base64::encode_config(token_bytes, base64::URL_SAFE_NO_PAD);

        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        let hash = Self::hash(&salt, &token);

        conn.execute(
            "INSERT INTO api_tokens (name, token_hash, salt, scope, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                name,
                hex::encode(hash),
                hex::encode(salt),
                scope.as_str(),
                now_ts()
            ],
        )?;
        Ok(token)
    }

    fn hash(salt: &[u8], token: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(token.as_bytes());
        hasher.finalize().into()
    }

    /// Constant-time verification against every stored token. Returns the
    /// token's scope when one matches.
    pub fn verify(conn: &Connection, token: &str) -> Result<Option<TokenScope>, Error> {
        let mut stmt = conn.prepare_cached("SELECT token_hash, salt, scope FROM api_tokens")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut matched = None;
        for (stored_hash, salt, scope) in rows {
            let (Ok(stored_hash), Ok(salt)) = (hex::decode(&stored_hash), hex::decode(&salt))
            else {
                continue;
            };
            let computed = Self::hash(&salt, token);
            if computed.ct_eq(stored_hash.as_slice()).into() {
                matched = TokenScope::parse(&scope);
            }
        }
        Ok(matched)
    }

    pub fn revoke(conn: &Connection, name: &str) -> Result<(), Error> {
        match conn.execute("DELETE FROM api_tokens WHERE name = ?1", params![name])? {
            0 => Err(Error::not_found("api token", name)),
            _ => Ok(()),
        }
    }
}
