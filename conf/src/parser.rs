//! `.conf` text to [`ConfDocument`].
//!
//! The parser rejects only structural breakage: unterminated or unknown
//! section headers, a duplicate `[Interface]`, keys outside any section, and
//! known keys in the wrong section. Everything else - unknown keys, odd
//! spacing, comments anywhere - is captured losslessly.

use std::fmt;

use thiserror::Error;

use crate::{
    ast::{
        ConfDocument, Field, FieldValue, FormatProfile, Item, LineEnding, Placement, Section,
        SectionKind,
    },
    is_hook_key, is_list_key, INTERFACE_KEYS, PEER_KEYS,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    #[error("section header is missing its closing bracket")]
    UnterminatedSection,
    #[error("unknown section [{0}]")]
    UnknownSection(String),
    #[error("duplicate [Interface] section")]
    DuplicateInterface,
    #[error("no [Interface] section in file")]
    MissingInterface,
    #[error("key/value line before any section header")]
    KeyOutsideSection,
    #[error("key {key} is not valid in a [{section}] section")]
    WrongSection { key: String, section: String },
    #[error("line is neither a section header, a comment, nor Key = Value")]
    MalformedLine,
    #[error("unknown field {0} (strict mode)")]
    UnknownField(String),
}

/// Structural parse failure with a 1-based position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: usize,
    pub col: usize,
    pub kind: ParseErrorKind,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, col {}: {}", self.line, self.col, self.kind)
    }
}

impl std::error::Error for ParseError {}

impl ParseError {
    fn at(line: usize, col: usize, kind: ParseErrorKind) -> Self {
        ParseError { line, col, kind }
    }
}

/// Parse in "preserve" mode: unknown keys become unknown AST fields.
pub fn parse(text: &str) -> Result<ConfDocument, ParseError> {
    Parser::new(text, false).run()
}

/// Parse in "strict" mode: the first unknown key is an error.
pub fn parse_strict(text: &str) -> Result<ConfDocument, ParseError> {
    Parser::new(text, true).run()
}

struct RawLine<'a> {
    content: &'a str,
    ending: LineEnding,
    number: usize,
}

fn split_lines(text: &str) -> Vec<RawLine<'_>> {
    let mut lines = Vec::new();
    let mut rest = text;
    let mut number = 1;
    while !rest.is_empty() {
        match rest.find('\n') {
            Some(idx) => {
                let (content, ending) = if idx > 0 && rest.as_bytes()[idx - 1] == b'\r' {
                    (&rest[..idx - 1], LineEnding::CrLf)
                } else {
                    (&rest[..idx], LineEnding::Lf)
                };
                lines.push(RawLine {
                    content,
                    ending,
                    number,
                });
                rest = &rest[idx + 1..];
            },
            None => {
                lines.push(RawLine {
                    content: rest,
                    ending: LineEnding::None,
                    number,
                });
                rest = "";
            },
        }
        number += 1;
    }
    lines
}

struct Parser<'a> {
    text: &'a str,
    strict: bool,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str, strict: bool) -> Self {
        Parser { text, strict }
    }

    fn run(self) -> Result<ConfDocument, ParseError> {
        let lines = split_lines(self.text);
        let mut sections: Vec<Section> = Vec::new();
        let mut current: Option<Section> = None;
        let mut pending: Vec<Item> = Vec::new();
        let mut seen_interface = false;
        let mut profile_eq: Option<(String, String)> = None;
        let mut profile_ending: Option<LineEnding> = None;
        let mut first_peer_blanks: Option<usize> = None;

        for line in &lines {
            let content = line.content;
            if profile_ending.is_none() && line.ending != LineEnding::None {
                profile_ending = Some(line.ending);
            }
            let trimmed = content.trim_start();
            let ws_len = content.len() - trimmed.len();
            let leading_ws = &content[..ws_len];

            if trimmed.is_empty() {
                pending.push(Item::Blank {
                    ws: content.to_string(),
                    ending: line.ending,
                });
            } else if trimmed.starts_with('#') {
                pending.push(Item::Comment {
                    leading_ws: leading_ws.to_string(),
                    text: trimmed.to_string(),
                    ending: line.ending,
                    placement: Placement::BeforeField, // fixed up on flush
                });
            } else if trimmed.starts_with('[') {
                let close = trimmed.find(']').ok_or_else(|| {
                    ParseError::at(
                        line.number,
                        content.len() + 1,
                        ParseErrorKind::UnterminatedSection,
                    )
                })?;
                let name = &trimmed[1..close];
                let kind = match name.trim() {
                    n if n.eq_ignore_ascii_case("interface") => SectionKind::Interface,
                    n if n.eq_ignore_ascii_case("peer") => SectionKind::Peer,
                    n => {
                        return Err(ParseError::at(
                            line.number,
                            ws_len + 2,
                            ParseErrorKind::UnknownSection(n.to_string()),
                        ))
                    },
                };
                if kind == SectionKind::Interface {
                    if seen_interface {
                        return Err(ParseError::at(
                            line.number,
                            ws_len + 1,
                            ParseErrorKind::DuplicateInterface,
                        ));
                    }
                    seen_interface = true;
                }

                let after = &trimmed[close + 1..];
                let after_trim = after.trim_start();
                let (header_trailing, header_comment) = if after_trim.is_empty() {
                    (after.to_string(), None)
                } else if after_trim.starts_with('#') {
                    let ws = &after[..after.len() - after_trim.len()];
                    (ws.to_string(), Some(after_trim.to_string()))
                } else {
                    return Err(ParseError::at(
                        line.number,
                        ws_len + close + 2,
                        ParseErrorKind::MalformedLine,
                    ));
                };

                if let Some(section) = current.take() {
                    sections.push(section);
                }
                let leading = flush_leading(&mut pending);
                if kind == SectionKind::Peer && first_peer_blanks.is_none() {
                    first_peer_blanks = Some(
                        leading
                            .iter()
                            .filter(|i| matches!(i, Item::Blank { .. }))
                            .count(),
                    );
                }
                current = Some(Section {
                    kind,
                    leading,
                    header_ws: leading_ws.to_string(),
                    header_name: name.to_string(),
                    header_trailing,
                    header_comment,
                    header_ending: line.ending,
                    items: Vec::new(),
                });
            } else {
                let section = current.as_mut().ok_or_else(|| {
                    ParseError::at(line.number, ws_len + 1, ParseErrorKind::KeyOutsideSection)
                })?;
                let field =
                    parse_field(content, leading_ws, line, section.kind, self.strict)?;
                if profile_eq.is_none() {
                    profile_eq = Some((field.ws_before_eq.clone(), field.ws_after_eq.clone()));
                }
                section.items.append(&mut pending);
                section.items.push(Item::Field(field));
            }
        }

        if let Some(section) = current.take() {
            sections.push(section);
        }
        if !seen_interface {
            return Err(ParseError::at(
                lines.len().max(1),
                1,
                ParseErrorKind::MissingInterface,
            ));
        }

        let mut trailing = pending;
        for item in &mut trailing {
            if let Item::Comment { placement, .. } = item {
                *placement = Placement::EndOfFile;
            }
        }

        let (ws_before_eq, ws_after_eq) =
            profile_eq.unwrap_or_else(|| (" ".to_string(), " ".to_string()));
        Ok(ConfDocument {
            sections,
            trailing,
            profile: FormatProfile {
                ws_before_eq,
                ws_after_eq,
                blank_between_sections: first_peer_blanks.unwrap_or(1),
                ending: profile_ending.unwrap_or(LineEnding::Lf),
            },
        })
    }
}

/// Pending blanks/comments become the next section's leading items. The
/// comment block adjacent to the header reads as that section's preamble;
/// comment blocks separated from the header by a blank line belong to the
/// section above.
fn flush_leading(pending: &mut Vec<Item>) -> Vec<Item> {
    let mut items = std::mem::take(pending);
    let tail_start = items
        .iter()
        .rposition(|i| matches!(i, Item::Blank { .. }))
        .map(|idx| idx + 1)
        .unwrap_or(0);
    for (idx, item) in items.iter_mut().enumerate() {
        if let Item::Comment { placement, .. } = item {
            *placement = if idx >= tail_start {
                Placement::BeforeSection
            } else {
                Placement::AfterSection
            };
        }
    }
    items
}

fn parse_field(
    content: &str,
    leading_ws: &str,
    line: &RawLine<'_>,
    kind: SectionKind,
    strict: bool,
) -> Result<Field, ParseError> {
    let body = &content[leading_ws.len()..];
    let eq = body.find('=').ok_or_else(|| {
        ParseError::at(line.number, content.len() + 1, ParseErrorKind::MalformedLine)
    })?;
    let key_part = &body[..eq];
    let key = key_part.trim_end();
    if key.is_empty() {
        return Err(ParseError::at(
            line.number,
            leading_ws.len() + 1,
            ParseErrorKind::MalformedLine,
        ));
    }
    let ws_before_eq = &key_part[key.len()..];

    let rest = &body[eq + 1..];
    let rest_trim = rest.trim_start();
    let ws_after_eq = &rest[..rest.len() - rest_trim.len()];

    let known_here = kind.known_keys().iter().any(|k| k.eq_ignore_ascii_case(key));
    let known_elsewhere = match kind {
        SectionKind::Interface => PEER_KEYS,
        SectionKind::Peer => INTERFACE_KEYS,
    }
    .iter()
    .any(|k| k.eq_ignore_ascii_case(key));
    if !known_here && known_elsewhere {
        return Err(ParseError::at(
            line.number,
            leading_ws.len() + 1,
            ParseErrorKind::WrongSection {
                key: key.to_string(),
                section: kind.canonical().to_string(),
            },
        ));
    }
    if !known_here && strict {
        return Err(ParseError::at(
            line.number,
            leading_ws.len() + 1,
            ParseErrorKind::UnknownField(key.to_string()),
        ));
    }

    // Hook values are opaque shell strings: everything to end of line,
    // trailing whitespace and '#' characters included.
    let (value_str, trailing_ws, comment) = if is_hook_key(key) {
        (rest_trim, "", None)
    } else {
        split_inline_comment(rest_trim)
    };

    let value = if is_list_key(key) {
        FieldValue::List {
            parts: value_str.split(',').map(str::to_string).collect(),
        }
    } else {
        FieldValue::Text(value_str.to_string())
    };

    Ok(Field {
        leading_ws: leading_ws.to_string(),
        key: key.to_string(),
        ws_before_eq: ws_before_eq.to_string(),
        ws_after_eq: ws_after_eq.to_string(),
        value,
        trailing_ws: trailing_ws.to_string(),
        comment: comment.map(str::to_string),
        ending: line.ending,
        known: known_here,
    })
}

/// Splits `value   # comment` into (value, whitespace, comment). A `#` only
/// starts a comment at the beginning of the value or after whitespace.
fn split_inline_comment(rest: &str) -> (&str, &str, Option<&str>) {
    let hash = rest.char_indices().find_map(|(idx, ch)| {
        if ch != '#' {
            return None;
        }
        if idx == 0 || rest[..idx].ends_with(|c: char| c.is_whitespace()) {
            Some(idx)
        } else {
            None
        }
    });
    match hash {
        Some(idx) => {
            let before = &rest[..idx];
            let value = before.trim_end();
            (value, &before[value.len()..], Some(&rest[idx..]))
        },
        None => {
            let value = rest.trim_end();
            (value, &rest[value.len()..], None)
        },
    }
}
