use std::fmt;

use x25519_dalek::{PublicKey, StaticSecret};

/// Returned when text is not a valid base64 curve25519 key.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct InvalidKey;

impl std::error::Error for InvalidKey {}

impl fmt::Display for InvalidKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid key format")
    }
}

/// A WireGuard curve25519 key.
///
/// WireGuard does not distinguish between public, private and preshared keys
/// at the type level; all are 32 bytes. Callers are responsible for keeping
/// track of which is which, and for never logging private material - use
/// [`Key::redacted`] when a key has to appear in user-facing output.
#[derive(PartialEq, Eq, Clone, Hash)]
pub struct Key(pub [u8; 32]);

impl Key {
    /// Generates a new private key, applying the curve25519 clamp.
    pub fn generate_private() -> Self {
        use rand_core::{OsRng, RngCore};

        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);

        bytes[0] &= 248;
        bytes[31] &= 127;
        bytes[31] |= 64;
        Self(bytes)
    }

    /// Generates a new preshared key (plain random bytes, no clamp).
    #[must_use]
    pub fn generate_preshared() -> Self {
        use rand_core::{OsRng, RngCore};

        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Derives the public key for this private key.
    #[must_use]
    pub fn get_public(&self) -> Self {
        let secret = StaticSecret::from(self.0);
        let public = PublicKey::from(&secret);

        Self(public.to_bytes())
    }

    #[must_use]
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The standard 44-character base64 form used by `wg(8)`.
    pub fn to_base64(&self) -> String {
        base64::encode(self.0)
    }

    /// Parses the standard base64 form. Rejects anything that does not decode
    /// to exactly 32 bytes.
    pub fn from_base64(key: &str) -> Result<Self, InvalidKey> {
        let decoded = base64::decode(key).map_err(|_| InvalidKey)?;
        if decoded.len() != 32 {
            return Err(InvalidKey);
        }

        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, InvalidKey> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_str, &mut bytes).map_err(|_| InvalidKey)?;
        Ok(Self(bytes))
    }

    /// A short prefix suitable for logs and error messages. Never enough to
    /// reconstruct the key.
    pub fn redacted(&self) -> String {
        let full = self.to_base64();
        format!("{}…", &full[..6])
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Key(\"{}\")", self.redacted())
    }
}

/// A private key together with its derived public key.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct KeyPair {
    pub private: Key,
    pub public: Key,
}

impl KeyPair {
    pub fn generate() -> Self {
        let private = Key::generate_private();
        let public = private.get_public();
        KeyPair { private, public }
    }

    pub fn from_private(key: Key) -> Self {
        let public = key.get_public();
        KeyPair {
            private: key,
            public,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_derivation_matches_wg() {
        let private = Key::from_base64("SGb+ojrRNDuMePufwtIYhXzA//k6wF3R21tEBgKlzlM=").unwrap();
        assert_eq!(
            private.get_public().to_base64(),
            "DD5yKRfzExcV5+kDnTroDgCU15latdMjiQ59j1hEuk8="
        );
    }

    #[test]
    fn base64_round_trip() {
        let key = Key::generate_preshared();
        let encoded = key.to_base64();
        assert_eq!(encoded.len(), 44);
        assert_eq!(Key::from_base64(&encoded).unwrap(), key);
    }

    #[test]
    fn wrong_length_rejected() {
        // Valid base64, but 16 bytes.
        assert_eq!(
            Key::from_base64("AAAAAAAAAAAAAAAAAAAAAA=="),
            Err(InvalidKey)
        );
        assert_eq!(Key::from_base64("!!!"), Err(InvalidKey));
    }

    #[test]
    fn generated_keys_are_distinct_and_nonzero() {
        let first = Key::generate_private();
        assert_ne!(first.as_bytes(), &[0u8; 32]);
        for _ in 0..1000 {
            let key = Key::generate_private();
            assert_ne!(first, key);
        }
    }

    #[test]
    fn redaction_is_short() {
        let key = KeyPair::generate().private;
        let redacted = key.redacted();
        assert!(redacted.len() < 12);
        assert!(!key.to_base64().starts_with(&redacted));
    }
}
