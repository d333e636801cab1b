//! At-rest encryption of secret columns.
//!
//! Secret values (private keys, preshared keys) pass through the vault at
//! the repository boundary. Ciphertext is AES-256-GCM with a fresh 12-byte
//! nonce per record, tagged `enc:v1:`; a value without the tag is returned
//! unchanged, which is how datastores that were never encrypted keep
//! working. The master key is derived from an operator passphrase with
//! Argon2id; KDF parameters, salt and a verification canary live in the
//! singleton `vault_meta` row.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use rand_core::{OsRng, RngCore};
use rusqlite::{params, Connection, OptionalExtension};

use crate::Error;

/// Versioned marker prefixing every encrypted column value.
pub const ENC_TAG: &str = "enc:v1:";

/// Known plaintext sealed at initialization; decrypting it proves the
/// passphrase before any payload column is touched.
const CANARY: &str = "wgfleet vault canary";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfParams {
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // Argon2id defaults: 64 MiB, 3 passes, single lane.
        KdfParams {
            m_cost: 64 * 1024,
            t_cost: 3,
            p_cost: 1,
        }
    }
}

/// A handle for sealing and unsealing secret columns. `Vault::plaintext()`
/// is the degenerate form used by unencrypted datastores.
pub struct Vault {
    key: Option<[u8; 32]>,
}

impl Vault {
    pub fn plaintext() -> Self {
        Vault { key: None }
    }

    #[cfg(test)]
    pub fn with_key(key: [u8; 32]) -> Self {
        Vault { key: Some(key) }
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    /// Opens the vault for an existing datastore. The canary is verified
    /// before returning, so a wrong passphrase fails here and never reaches
    /// payload decryption.
    pub fn open(conn: &Connection, passphrase: Option<&str>) -> Result<Self, Error> {
        let meta = conn
            .query_row(
                "SELECT kdf, m_cost, t_cost, p_cost, salt, canary FROM vault_meta WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        match (meta, passphrase) {
            (None, None) => Ok(Vault::plaintext()),
            (None, Some(_)) => Err(Error::Crypto(
                "datastore is not encrypted; run `wgfleet backup` then re-init to encrypt"
                    .to_string(),
            )),
            (Some(_), None) => Err(Error::Crypto(
                "datastore is encrypted; a passphrase is required".to_string(),
            )),
            (Some((kdf, m_cost, t_cost, p_cost, salt, canary)), Some(pass)) => {
                if kdf != "argon2id" {
                    return Err(Error::Crypto(format!("unsupported KDF {kdf}")));
                }
                let salt = base64::decode(&salt)
                    .map_err(|_| Error::Crypto("corrupt vault salt".to_string()))?;
                let key = derive_key(
                    pass,
                    &salt,
                    KdfParams {
                        m_cost,
                        t_cost,
                        p_cost,
                    },
                )?;
                let vault = Vault { key: Some(key) };
                match vault.unseal(&canary) {
                    Ok(text) if text == CANARY => Ok(vault),
                    _ => Err(Error::Crypto(
                        "passphrase verification failed".to_string(),
                    )),
                }
            },
        }
    }

    /// Creates vault metadata for a fresh datastore and returns the open
    /// vault.
    pub fn initialize(conn: &Connection, passphrase: &str) -> Result<Self, Error> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let kdf = KdfParams::default();
        let key = derive_key(passphrase, &salt, kdf)?;
        let vault = Vault { key: Some(key) };
        let canary = vault.seal(CANARY)?;
        conn.execute(
            "INSERT INTO vault_meta (id, kdf, m_cost, t_cost, p_cost, salt, canary)
             VALUES (1, 'argon2id', ?1, ?2, ?3, ?4, ?5)",
            params![kdf.m_cost, kdf.t_cost, kdf.p_cost, base64::encode(salt), canary],
        )?;
        Ok(vault)
    }

    /// Encrypts a secret for storage. On a plaintext vault the value is
    /// stored as-is (no tag).
    pub fn seal(&self, plaintext: &str) -> Result<String, Error> {
        let key = match &self.key {
            None => return Ok(plaintext.to_string()),
            Some(key) => key,
        };
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| Error::Crypto("invalid master key length".to_string()))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| Error::Crypto("encryption failed".to_string()))?;
        let mut blob = nonce_bytes.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(format!("{ENC_TAG}{}", base64::encode(blob)))
    }

    /// Decrypts a stored secret. Untagged values pass through unchanged.
    pub fn unseal(&self, stored: &str) -> Result<String, Error> {
        let encoded = match stored.strip_prefix(ENC_TAG) {
            None => return Ok(stored.to_string()),
            Some(encoded) => encoded,
        };
        let key = self.key.as_ref().ok_or_else(|| {
            Error::Crypto("encrypted value in an unencrypted datastore".to_string())
        })?;
        let blob = base64::decode(encoded)
            .map_err(|_| Error::Crypto("corrupt ciphertext encoding".to_string()))?;
        if blob.len() < NONCE_LEN {
            return Err(Error::Crypto("ciphertext too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| Error::Crypto("invalid master key length".to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Crypto("decryption failed (wrong passphrase or corrupt ciphertext)".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|_| Error::Crypto("decrypted value is not UTF-8".to_string()))
    }

    /// Optional convenience for `Option`-valued columns.
    pub fn unseal_opt(&self, stored: Option<String>) -> Result<Option<String>, Error> {
        stored.map(|s| self.unseal(&s)).transpose()
    }
}

fn derive_key(passphrase: &str, salt: &[u8], kdf: KdfParams) -> Result<[u8; 32], Error> {
    let params = Params::new(kdf.m_cost, kdf.t_cost, kdf.p_cost, Some(32))
        .map_err(|e| Error::Crypto(format!("bad KDF parameters: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; 32];
    argon
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| Error::Crypto(format!("key derivation failed: {e}")))?;
    Ok(key)
}

/// Every (table, column) pair that holds secret material.
const SECRET_COLUMNS: &[(&str, &str)] = &[
    ("servers", "private_key"),
    ("routers", "private_key"),
    ("remotes", "private_key"),
    ("remotes", "preshared_key"),
    ("exits", "private_key"),
    ("extramural_configs", "private_key"),
    ("extramural_peers", "preshared_key"),
];

/// Re-encrypts every secret column under a new passphrase. Runs inside the
/// caller's transaction so a failure part-way leaves the store untouched.
pub fn change_passphrase(
    tx: &rusqlite::Transaction,
    old: &Vault,
    new_passphrase: &str,
) -> Result<Vault, Error> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let kdf = KdfParams::default();
    let new_vault = Vault {
        key: Some(derive_key(new_passphrase, &salt, kdf)?),
    };

    for (table, column) in SECRET_COLUMNS {
        let mut stmt = tx.prepare(&format!(
            "SELECT rowid, {column} FROM {table} WHERE {column} IS NOT NULL"
        ))?;
        let rows: Vec<(i64, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        for (rowid, stored) in rows {
            let resealed = new_vault.seal(&old.unseal(&stored)?)?;
            tx.execute(
                &format!("UPDATE {table} SET {column} = ?1 WHERE rowid = ?2"),
                params![resealed, rowid],
            )?;
        }
    }

    let canary = new_vault.seal(CANARY)?;
    tx.execute(
        "INSERT INTO vault_meta (id, kdf, m_cost, t_cost, p_cost, salt, canary)
         VALUES (1, 'argon2id', ?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (id) DO UPDATE SET
             kdf = 'argon2id', m_cost = ?1, t_cost = ?2, p_cost = ?3,
             salt = ?4, canary = ?5",
        params![
            kdf.m_cost,
            kdf.t_cost,
            kdf.p_cost,
            base64::encode(salt),
            canary
        ],
    )?;

    Ok(new_vault)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_unseal_round_trip() {
        let vault = Vault::with_key([7u8; 32]);
        let sealed = vault.seal("SGb+ojrRNDuMePufwtIYhXzA//k6wF3R21tEBgKlzlM=").unwrap();
        assert!(sealed.starts_with(ENC_TAG));
        assert_eq!(
            vault.unseal(&sealed).unwrap(),
            "SGb+ojrRNDuMePufwtIYhXzA//k6wF3R21tEBgKlzlM="
        );
    }

    #[test]
    fn nonces_differ_per_record() {
        let vault = Vault::with_key([7u8; 32]);
        let a = vault.seal("same secret").unwrap();
        let b = vault.seal("same secret").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn untagged_values_pass_through() {
        let vault = Vault::with_key([7u8; 32]);
        assert_eq!(vault.unseal("legacy-plaintext").unwrap(), "legacy-plaintext");
        let plain = Vault::plaintext();
        assert_eq!(plain.seal("secret").unwrap(), "secret");
        assert_eq!(plain.unseal("secret").unwrap(), "secret");
    }

    #[test]
    fn wrong_key_fails_closed() {
        let vault = Vault::with_key([7u8; 32]);
        let sealed = vault.seal("secret").unwrap();
        let other = Vault::with_key([8u8; 32]);
        assert!(matches!(other.unseal(&sealed), Err(Error::Crypto(_))));
    }
}
