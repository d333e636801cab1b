//! Rendering a [`ConfDocument`] back to text.
//!
//! Two laws hold. A document obtained from [`crate::parse`] renders to the
//! exact input bytes. A document built by hand renders to canonically
//! formatted text that re-parses to a semantically equal document.

use std::fmt::{self, Display, Formatter};

use crate::ast::{ConfDocument, Field, Item, Section};

impl Display for Field {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}={}{}{}",
            self.leading_ws,
            self.key,
            self.ws_before_eq,
            self.ws_after_eq,
            self.value.render(),
            self.trailing_ws,
        )?;
        if let Some(comment) = &self.comment {
            f.write_str(comment)?;
        }
        f.write_str(self.ending.as_str())
    }
}

impl Display for Item {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Item::Blank { ws, ending } => {
                f.write_str(ws)?;
                f.write_str(ending.as_str())
            },
            Item::Comment {
                leading_ws,
                text,
                ending,
                ..
            } => {
                f.write_str(leading_ws)?;
                f.write_str(text)?;
                f.write_str(ending.as_str())
            },
            Item::Field(field) => field.fmt(f),
        }
    }
}

impl Display for Section {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for item in &self.leading {
            item.fmt(f)?;
        }
        write!(f, "{}[{}]{}", self.header_ws, self.header_name, self.header_trailing)?;
        if let Some(comment) = &self.header_comment {
            f.write_str(comment)?;
        }
        f.write_str(self.header_ending.as_str())?;
        for item in &self.items {
            item.fmt(f)?;
        }
        Ok(())
    }
}

impl Display for ConfDocument {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for section in &self.sections {
            section.fmt(f)?;
        }
        for item in &self.trailing {
            item.fmt(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use crate::ast::{FieldValue, Section, SectionKind};
    use crate::parser::{parse, parse_strict, ParseErrorKind};
    use crate::ConfDocument;

    const HUB: &str = indoc! {"
        [Interface]
        # hub interface
        PrivateKey = SGb+ojrRNDuMePufwtIYhXzA//k6wF3R21tEBgKlzlM=
        Address = 10.66.0.1/24, fd66::1/64
        ListenPort = 51820
        PostUp = iptables -A FORWARD -i %i -j ACCEPT; iptables -t nat -A POSTROUTING -o eth0 -j MASQUERADE
        PostDown = iptables -D FORWARD -i %i -j ACCEPT


        [Peer]
        # office router
        PublicKey = DD5yKRfzExcV5+kDnTroDgCU15latdMjiQ59j1hEuk8=
        AllowedIPs = 10.66.0.20/32, 192.168.10.0/24
        Endpoint = office.example.com:51820


        [Peer]
        PublicKey = xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=
        AllowedIPs = 10.66.0.30/32, fd66::30/128
    "};

    #[test]
    fn round_trips_byte_for_byte() {
        let doc = parse(HUB).unwrap();
        assert_eq!(doc.to_string(), HUB);
    }

    #[test]
    fn round_trips_crlf_and_missing_final_newline() {
        let text = "[Interface]\r\nPrivateKey = SGb+ojrRNDuMePufwtIYhXzA//k6wF3R21tEBgKlzlM=\r\n\r\n[Peer]\r\nPublicKey = DD5yKRfzExcV5+kDnTroDgCU15latdMjiQ59j1hEuk8=\r\nAllowedIPs = 10.0.0.2/32";
        let doc = parse(text).unwrap();
        assert_eq!(doc.to_string(), text);
    }

    #[test]
    fn round_trips_odd_spacing_comments_and_unknown_keys() {
        let text = indoc! {"
            # fleet hub   (managed)
            [Interface]  # inline on header
            PrivateKey=SGb+ojrRNDuMePufwtIYhXzA//k6wF3R21tEBgKlzlM=
              Address =  10.66.0.1/24 ,fd66::1/64
            FwMark = 0x8888
            SaveConfig = true

            [Peer]
            PublicKey = DD5yKRfzExcV5+kDnTroDgCU15latdMjiQ59j1hEuk8=   # router
            AllowedIPs = 10.66.0.20/32
        "};
        let doc = parse(text).unwrap();
        assert_eq!(doc.to_string(), text);

        let unknown: Vec<_> = doc
            .interface()
            .unknown_fields()
            .map(|f| (f.key.clone(), f.value_text()))
            .collect();
        assert_eq!(
            unknown,
            vec![
                ("FwMark".to_string(), "0x8888".to_string()),
                ("SaveConfig".to_string(), "true".to_string()),
            ]
        );
    }

    #[test]
    fn hook_values_keep_hash_characters() {
        let text = "[Interface]\nPrivateKey = SGb+ojrRNDuMePufwtIYhXzA//k6wF3R21tEBgKlzlM=\nPostUp = echo '#marker' >> /var/log/wg.log\n";
        let doc = parse(text).unwrap();
        assert_eq!(doc.to_string(), text);
        assert_eq!(
            doc.interface().get_all("PostUp"),
            vec!["echo '#marker' >> /var/log/wg.log".to_string()]
        );
    }

    #[test]
    fn editing_one_field_leaves_the_rest_byte_identical() {
        let mut doc = parse(HUB).unwrap();
        let peers: Vec<_> = doc.peers().cloned().collect();
        assert_eq!(peers.len(), 2);

        let mut edited = false;
        for peer in doc.peers_mut() {
            if peer.get("PublicKey").as_deref()
                == Some("DD5yKRfzExcV5+kDnTroDgCU15latdMjiQ59j1hEuk8=")
            {
                peer.set(
                    "AllowedIPs",
                    FieldValue::list(["10.66.0.20/32", "192.168.20.0/24"]),
                );
                edited = true;
            }
        }
        assert!(edited);

        let expected = HUB.replace(
            "AllowedIPs = 10.66.0.20/32, 192.168.10.0/24",
            "AllowedIPs = 10.66.0.20/32, 192.168.20.0/24",
        );
        assert_eq!(doc.to_string(), expected);
    }

    #[test]
    fn generated_document_reparses_semantically_equal() {
        let mut doc = ConfDocument::new();
        doc.interface_mut().set(
            "PrivateKey",
            FieldValue::Text("SGb+ojrRNDuMePufwtIYhXzA//k6wF3R21tEBgKlzlM=".to_string()),
        );
        doc.interface_mut()
            .set("Address", FieldValue::list(["10.66.0.5/32", "fd66::5/128"]));
        let mut peer = Section::new(SectionKind::Peer);
        peer.push_field(
            "PublicKey",
            FieldValue::Text("DD5yKRfzExcV5+kDnTroDgCU15latdMjiQ59j1hEuk8=".to_string()),
        );
        peer.push_field("AllowedIPs", FieldValue::list(["10.66.0.0/24", "fd66::/64"]));
        peer.push_field("Endpoint", FieldValue::Text("hub.example.com:51820".to_string()));
        doc.push_peer(peer);

        let rendered = doc.to_string();
        let reparsed = parse(&rendered).unwrap();
        assert!(doc.semantic_eq(&reparsed));
        assert_eq!(reparsed.to_string(), rendered);
    }

    #[test]
    fn structural_errors_carry_positions() {
        let err = parse("[Interface\nPrivateKey = x\n").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnterminatedSection);
        assert_eq!(err.line, 1);

        let err = parse("[Interface]\n[Interface]\n").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::DuplicateInterface);
        assert_eq!(err.line, 2);

        let err = parse("PrivateKey = x\n").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::KeyOutsideSection);

        let err = parse("[Peer]\nPublicKey = x\n").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::MissingInterface);

        let err = parse("[Interface]\nPublicKey = x\n").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::WrongSection { .. }));

        let err = parse("[Wormhole]\n").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::UnknownSection(_)));
    }

    #[test]
    fn strict_mode_rejects_unknown_fields() {
        let text = "[Interface]\nPrivateKey = x\nFwMark = 17\n";
        assert!(parse(text).is_ok());
        let err = parse_strict(text).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnknownField("FwMark".to_string()));
        assert_eq!(err.line, 3);
    }

    #[test]
    fn comment_placement_is_tagged() {
        use crate::ast::{Item, Placement};

        let text = indoc! {"
            # about the hub
            [Interface]
            PrivateKey = SGb+ojrRNDuMePufwtIYhXzA//k6wF3R21tEBgKlzlM=

            [Peer]
            PublicKey = DD5yKRfzExcV5+kDnTroDgCU15latdMjiQ59j1hEuk8=
            AllowedIPs = 10.0.0.2/32
            # end of fleet
        "};
        let doc = parse(text).unwrap();
        let leading_placements: Vec<_> = doc.sections[0]
            .leading
            .iter()
            .filter_map(|i| match i {
                Item::Comment { placement, .. } => Some(*placement),
                _ => None,
            })
            .collect();
        assert_eq!(leading_placements, vec![Placement::BeforeSection]);

        let trailing: Vec<_> = doc
            .trailing
            .iter()
            .filter_map(|i| match i {
                Item::Comment { placement, .. } => Some(*placement),
                _ => None,
            })
            .collect();
        assert_eq!(trailing, vec![Placement::EndOfFile]);
    }
}
