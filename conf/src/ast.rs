//! The `.conf` document model.
//!
//! Every syntactic atom of a parsed file is kept as a component: leading
//! whitespace, key spelling, the spacing around `=`, the value, trailing
//! whitespace, the inline comment, and the line terminator. Writing a
//! document reassembles those components, so an unmodified parse reproduces
//! the input byte for byte, and editing one field's value disturbs nothing
//! else in the file.

use crate::{is_list_key, INTERFACE_KEYS, PEER_KEYS};

/// Line terminator of a single line. `None` only ever appears on the last
/// line of a file that does not end with a newline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineEnding {
    Lf,
    CrLf,
    None,
}

impl LineEnding {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
            LineEnding::None => "",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Interface,
    Peer,
}

impl SectionKind {
    /// Canonical spelling used when rendering generated sections.
    pub fn canonical(&self) -> &'static str {
        match self {
            SectionKind::Interface => "Interface",
            SectionKind::Peer => "Peer",
        }
    }

    pub fn known_keys(&self) -> &'static [&'static str] {
        match self {
            SectionKind::Interface => INTERFACE_KEYS,
            SectionKind::Peer => PEER_KEYS,
        }
    }
}

/// Where a standalone comment sits relative to its neighbors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    BeforeSection,
    BeforeField,
    AfterSection,
    EndOfFile,
}

/// A field value: either opaque text or an ordered comma-separated list.
///
/// List parts are stored verbatim (including any padding around the item),
/// so rejoining with a bare `,` reproduces the source text exactly. The
/// original delimiter style therefore survives inside the parts themselves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    List { parts: Vec<String> },
}

impl FieldValue {
    /// Builds a canonical list value: items joined by `", "`.
    pub fn list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parts: Vec<String> = items.into_iter().map(Into::into).collect();
        for part in parts.iter_mut().skip(1) {
            part.insert(0, ' ');
        }
        FieldValue::List { parts }
    }

    /// Whether two values mean the same thing, ignoring padding.
    pub fn semantic_eq(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Text(a), FieldValue::Text(b)) => a.trim() == b.trim(),
            _ => self.items() == other.items(),
        }
    }

    /// The ordered items of a list value, trimmed. A text value yields
    /// itself as a single item.
    pub fn items(&self) -> Vec<&str> {
        match self {
            FieldValue::Text(text) => vec![text.as_str()],
            FieldValue::List { parts } => parts.iter().map(|p| p.trim()).collect(),
        }
    }

    /// The value as it appears on the line.
    pub fn render(&self) -> String {
        match self {
            FieldValue::Text(text) => text.clone(),
            FieldValue::List { parts } => parts.join(","),
        }
    }
}

/// One `Key = Value` line, fully exploded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub leading_ws: String,
    /// Key exactly as spelled in the source.
    pub key: String,
    pub ws_before_eq: String,
    pub ws_after_eq: String,
    pub value: FieldValue,
    /// Whitespace between the value and the inline comment or terminator.
    pub trailing_ws: String,
    /// Inline comment, `#` included, running to end of line.
    pub comment: Option<String>,
    pub ending: LineEnding,
    /// Whether the control plane interprets this key. Unknown fields are
    /// preserved but never touched.
    pub known: bool,
}

impl Field {
    /// A canonically formatted field (`Key = Value`, LF terminated).
    pub fn new(key: &str, value: FieldValue) -> Self {
        Field {
            leading_ws: String::new(),
            key: key.to_string(),
            ws_before_eq: " ".to_string(),
            ws_after_eq: " ".to_string(),
            value,
            trailing_ws: String::new(),
            comment: None,
            ending: LineEnding::Lf,
            known: true,
        }
    }

    pub fn is(&self, key: &str) -> bool {
        self.key.eq_ignore_ascii_case(key)
    }

    /// Trimmed value text.
    pub fn value_text(&self) -> String {
        match &self.value {
            FieldValue::Text(text) => text.trim().to_string(),
            FieldValue::List { .. } => self.value.render().trim().to_string(),
        }
    }

    /// Replaces the value, leaving layout untouched.
    pub fn set_value(&mut self, value: FieldValue) {
        self.value = value;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Item {
    Blank {
        ws: String,
        ending: LineEnding,
    },
    Comment {
        leading_ws: String,
        /// Comment text, `#` included.
        text: String,
        ending: LineEnding,
        placement: Placement,
    },
    Field(Field),
}

/// A `[Interface]` or `[Peer]` block together with the blank lines and
/// comments that precede its header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub kind: SectionKind,
    /// Blanks and comments between the previous section and this header.
    pub leading: Vec<Item>,
    pub header_ws: String,
    /// Header name exactly as spelled inside the brackets.
    pub header_name: String,
    /// Whitespace between `]` and the comment or terminator.
    pub header_trailing: String,
    pub header_comment: Option<String>,
    pub header_ending: LineEnding,
    pub items: Vec<Item>,
}

impl Section {
    /// A canonically formatted empty section.
    pub fn new(kind: SectionKind) -> Self {
        Section {
            kind,
            leading: Vec::new(),
            header_ws: String::new(),
            header_name: kind.canonical().to_string(),
            header_trailing: String::new(),
            header_comment: None,
            header_ending: LineEnding::Lf,
            items: Vec::new(),
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.items.iter().filter_map(|item| match item {
            Item::Field(field) => Some(field),
            _ => None,
        })
    }

    /// First field with the given key, case-insensitively.
    pub fn field(&self, key: &str) -> Option<&Field> {
        self.fields().find(|f| f.is(key))
    }

    pub fn field_mut(&mut self, key: &str) -> Option<&mut Field> {
        self.items.iter_mut().find_map(|item| match item {
            Item::Field(field) if field.is(key) => Some(field),
            _ => None,
        })
    }

    /// Trimmed value of the first field with the given key.
    pub fn get(&self, key: &str) -> Option<String> {
        self.field(key).map(Field::value_text)
    }

    /// All values for a key, in file order (for repeated keys like PostUp).
    pub fn get_all(&self, key: &str) -> Vec<String> {
        self.fields()
            .filter(|f| f.is(key))
            .map(Field::value_text)
            .collect()
    }

    /// Updates the first matching field in place, or appends a canonical
    /// field at the end of the section.
    pub fn set(&mut self, key: &str, value: FieldValue) {
        match self.field_mut(key) {
            Some(field) => field.set_value(value),
            None => self.items.push(Item::Field(Field::new(key, value))),
        }
    }

    /// Updates the field only when the new value differs semantically, so
    /// untouched lines keep their exact bytes.
    pub fn set_if_changed(&mut self, key: &str, value: FieldValue) {
        match self.field_mut(key) {
            Some(field) if field.value.semantic_eq(&value) => {},
            Some(field) => field.set_value(value),
            None => self.items.push(Item::Field(Field::new(key, value))),
        }
    }

    /// Reconciles a repeated key (e.g. `PostUp`) against a target list of
    /// values. Existing fields are updated pairwise in place; surplus old
    /// fields are dropped; surplus new values are appended. A file whose
    /// lines already match is left byte-identical.
    pub fn set_repeated(&mut self, key: &str, values: &[FieldValue]) {
        let existing: Vec<usize> = self
            .items
            .iter()
            .enumerate()
            .filter_map(|(idx, item)| match item {
                Item::Field(field) if field.is(key) => Some(idx),
                _ => None,
            })
            .collect();

        for (idx, value) in existing.iter().zip(values.iter()) {
            if let Item::Field(field) = &mut self.items[*idx] {
                if !field.value.semantic_eq(value) {
                    field.set_value(value.clone());
                }
            }
        }
        if existing.len() > values.len() {
            for idx in existing[values.len()..].iter().rev() {
                self.items.remove(*idx);
            }
        } else {
            for value in &values[existing.len()..] {
                self.items.push(Item::Field(Field::new(key, value.clone())));
            }
        }
    }

    /// Removes every field with the given key. Returns whether any existed.
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|item| match item {
            Item::Field(field) => !field.is(key),
            _ => true,
        });
        self.items.len() != before
    }

    pub fn push_field(&mut self, key: &str, value: FieldValue) {
        self.items.push(Item::Field(Field::new(key, value)));
    }

    /// Fields the control plane does not interpret, preserved verbatim.
    pub fn unknown_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields().filter(|f| !f.known)
    }

    /// Normalized (key, value) pairs for semantic comparison: known keys in
    /// canonical spelling, values trimmed, list items rejoined canonically.
    pub fn normalized(&self) -> Vec<(String, String)> {
        self.fields()
            .map(|f| {
                let key = self
                    .kind
                    .known_keys()
                    .iter()
                    .find(|k| f.is(k))
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| f.key.clone());
                let value = if is_list_key(&f.key) {
                    f.value.items().join(", ")
                } else {
                    f.value_text()
                };
                (key, value)
            })
            .collect()
    }
}

/// Formatting conventions observed in a parsed file, used when appending
/// generated content so new sections match the operator's style.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatProfile {
    pub ws_before_eq: String,
    pub ws_after_eq: String,
    /// Blank lines separating consecutive sections.
    pub blank_between_sections: usize,
    pub ending: LineEnding,
}

impl Default for FormatProfile {
    fn default() -> Self {
        FormatProfile {
            ws_before_eq: " ".to_string(),
            ws_after_eq: " ".to_string(),
            blank_between_sections: 1,
            ending: LineEnding::Lf,
        }
    }
}

/// A whole `.conf` file: its sections in file order plus trailing items.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfDocument {
    pub sections: Vec<Section>,
    /// Blanks and comments after the last section.
    pub trailing: Vec<Item>,
    pub profile: FormatProfile,
}

impl Default for ConfDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfDocument {
    /// An empty document with a canonical `[Interface]` section.
    pub fn new() -> Self {
        ConfDocument {
            sections: vec![Section::new(SectionKind::Interface)],
            trailing: Vec::new(),
            profile: FormatProfile::default(),
        }
    }

    pub fn interface(&self) -> &Section {
        self.sections
            .iter()
            .find(|s| s.kind == SectionKind::Interface)
            .expect("document invariant: exactly one [Interface]")
    }

    pub fn interface_mut(&mut self) -> &mut Section {
        self.sections
            .iter_mut()
            .find(|s| s.kind == SectionKind::Interface)
            .expect("document invariant: exactly one [Interface]")
    }

    pub fn peers(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(|s| s.kind == SectionKind::Peer)
    }

    pub fn peers_mut(&mut self) -> impl Iterator<Item = &mut Section> {
        self.sections
            .iter_mut()
            .filter(|s| s.kind == SectionKind::Peer)
    }

    /// Appends a peer section, separating it from the previous section with
    /// the profile's blank-line convention.
    pub fn push_peer(&mut self, mut section: Section) {
        if section.leading.is_empty() {
            for _ in 0..self.profile.blank_between_sections.max(1) {
                section.leading.push(Item::Blank {
                    ws: String::new(),
                    ending: self.profile.ending,
                });
            }
        }
        self.sections.push(section);
    }

    /// Drops peer sections the predicate rejects.
    pub fn retain_peers<F: FnMut(&Section) -> bool>(&mut self, mut keep: F) {
        self.sections
            .retain(|s| s.kind != SectionKind::Peer || keep(s));
    }

    /// Reorders peer sections to match a target key order. Sections move as
    /// whole units (their comments and blank lines travel with them); a
    /// document already in order is untouched. Keys not found in the
    /// document are ignored.
    pub fn order_peers_by_key<F: Fn(&Section) -> Option<String>>(
        &mut self,
        target: &[String],
        key_of: F,
    ) {
        let current: Vec<Option<String>> = self
            .sections
            .iter()
            .map(|s| {
                if s.kind == SectionKind::Peer {
                    key_of(s)
                } else {
                    None
                }
            })
            .collect();
        let peer_keys: Vec<&String> = current.iter().flatten().collect();
        let want: Vec<&String> = target
            .iter()
            .filter(|k| peer_keys.contains(k))
            .collect();
        if peer_keys == want {
            return;
        }

        let mut peers: Vec<(Option<String>, Section)> = Vec::new();
        let mut rest: Vec<Section> = Vec::new();
        for section in self.sections.drain(..) {
            if section.kind == SectionKind::Peer {
                let key = key_of(&section);
                peers.push((key, section));
            } else {
                rest.push(section);
            }
        }
        let mut ordered: Vec<Section> = Vec::new();
        for key in want {
            if let Some(pos) = peers.iter().position(|(k, _)| k.as_ref() == Some(key)) {
                ordered.push(peers.remove(pos).1);
            }
        }
        // Anything without a target slot keeps its relative position at the
        // end.
        ordered.extend(peers.into_iter().map(|(_, s)| s));

        self.sections = rest;
        let profile_blanks = self.profile.blank_between_sections.max(1);
        let ending = self.profile.ending;
        for mut section in ordered {
            if !section
                .leading
                .iter()
                .any(|i| matches!(i, Item::Blank { .. }))
            {
                for _ in 0..profile_blanks {
                    section.leading.insert(
                        0,
                        Item::Blank {
                            ws: String::new(),
                            ending,
                        },
                    );
                }
            }
            self.sections.push(section);
        }
    }

    /// Semantic equality: same sections in order, same normalized fields.
    /// Layout, comments and blank lines are ignored.
    pub fn semantic_eq(&self, other: &ConfDocument) -> bool {
        self.sections.len() == other.sections.len()
            && self
                .sections
                .iter()
                .zip(other.sections.iter())
                .all(|(a, b)| a.kind == b.kind && a.normalized() == b.normalized())
    }
}
