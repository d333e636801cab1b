//! Lossless WireGuard `.conf` handling for wgfleet.
//!
//! This crate has two halves: the curve25519 key primitives shared by the
//! whole workspace, and a `.conf` document model that can reproduce a parsed
//! file byte for byte while still offering typed access to the fields the
//! control plane understands. Anything the parser does not understand is kept
//! verbatim and written back verbatim.

pub mod ast;
pub mod key;
pub mod parser;
pub mod writer;

pub use ast::{
    ConfDocument, Field, FieldValue, FormatProfile, Item, LineEnding, Placement, Section,
    SectionKind,
};
pub use key::{InvalidKey, Key, KeyPair};
pub use parser::{parse, parse_strict, ParseError, ParseErrorKind};

/// Keys `[Interface]` sections may carry that the control plane interprets.
pub const INTERFACE_KEYS: &[&str] = &[
    "PrivateKey",
    "Address",
    "ListenPort",
    "DNS",
    "MTU",
    "Table",
    "PreUp",
    "PostUp",
    "PreDown",
    "PostDown",
];

/// Keys `[Peer]` sections may carry that the control plane interprets.
pub const PEER_KEYS: &[&str] = &[
    "PublicKey",
    "PresharedKey",
    "AllowedIPs",
    "Endpoint",
    "PersistentKeepalive",
];

/// Keys whose values are comma-separated ordered lists.
pub const LIST_KEYS: &[&str] = &["Address", "DNS", "AllowedIPs"];

/// Keys whose values are opaque shell strings, taken to end of line.
pub const HOOK_KEYS: &[&str] = &["PreUp", "PostUp", "PreDown", "PostDown"];

pub(crate) fn is_list_key(key: &str) -> bool {
    LIST_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key))
}

pub(crate) fn is_hook_key(key: &str) -> bool {
    HOOK_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key))
}
