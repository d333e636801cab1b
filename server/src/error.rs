use thiserror::Error;

/// The service-layer error taxonomy. Low-level failures are converted into
/// one of these kinds at the boundary where they occur, so callers (CLI,
/// API, tests) only ever see structured errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(#[from] wgfleet_conf::ParseError),

    #[error("validation failed on {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: &'static str, name: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("audit integrity failure at entry {entry_id}: expected {expected}, found {actual}")]
    Integrity {
        entry_id: i64,
        expected: String,
        actual: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("internal database error: {0}")]
    Database(rusqlite::Error),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// CLI exit code for this error kind: 1 user error, 2 validation
    /// failure, 3 I/O or network failure, 4 integrity failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Validation { .. } | Error::Parse(_) | Error::Conflict(_) => 2,
            Error::Io(_) | Error::Network(_) | Error::Database(_) => 3,
            Error::Integrity { .. } => 4,
            Error::NotFound { .. } | Error::Auth(_) | Error::Crypto(_) | Error::Fatal(_) => 1,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound {
                kind: "record",
                name: String::new(),
            },
            rusqlite::Error::SqliteFailure(libsqlite3_sys::Error { code, .. }, ref message)
                if code == libsqlite3_sys::ErrorCode::ConstraintViolation =>
            {
                Error::Conflict(
                    message
                        .clone()
                        .unwrap_or_else(|| "constraint violation".to_string()),
                )
            },
            other => Error::Database(other),
        }
    }
}

impl From<wgfleet_conf::InvalidKey> for Error {
    fn from(_: wgfleet_conf::InvalidKey) -> Self {
        Error::validation("key", "keys must be 44 characters of base64 encoding 32 bytes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(Error::validation("ip", "taken").exit_code(), 2);
        assert_eq!(Error::not_found("remote", "carol").exit_code(), 1);
        assert_eq!(Error::Network("timed out".to_string()).exit_code(), 3);
        assert_eq!(
            Error::Integrity {
                entry_id: 7,
                expected: "aa".to_string(),
                actual: "bb".to_string()
            }
            .exit_code(),
            4
        );
    }

    #[test]
    fn no_rows_becomes_not_found() {
        let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
