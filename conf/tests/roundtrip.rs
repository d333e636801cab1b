use indoc::indoc;
use wgfleet_conf::{parse, parse_strict, ConfDocument, FieldValue, Key, ParseErrorKind};

#[test]
fn real_world_client_config_round_trips() {
    let text = indoc! {"
        # Generated by a commercial VPN provider
        [Interface]
        PrivateKey = SGb+ojrRNDuMePufwtIYhXzA//k6wF3R21tEBgKlzlM=
        Address = 10.64.12.7/32,fc00:bbbb:bbbb:bb01::1:b06/128
        DNS = 10.64.0.1
        PostUp = iptables -I OUTPUT ! -o %i -m mark ! --mark $(wg show %i fwmark) -m addrtype ! --dst-type LOCAL -j REJECT

        [Peer]
        PublicKey = DD5yKRfzExcV5+kDnTroDgCU15latdMjiQ59j1hEuk8=
        AllowedIPs = 0.0.0.0/0,::0/0
        Endpoint = 198.51.100.7:51820
    "};
    let doc = parse(text).unwrap();
    assert_eq!(doc.to_string(), text);

    let peer = doc.peers().next().unwrap();
    assert_eq!(
        peer.field("AllowedIPs").unwrap().value.items(),
        vec!["0.0.0.0/0", "::0/0"]
    );
}

#[test]
fn tabs_and_uppercase_section_names_round_trip() {
    let text = "[INTERFACE]\n\tPrivateKey\t=\tSGb+ojrRNDuMePufwtIYhXzA//k6wF3R21tEBgKlzlM=\n\n[peer]\nPublicKey = DD5yKRfzExcV5+kDnTroDgCU15latdMjiQ59j1hEuk8=\nAllowedIPs = 10.0.0.2/32\n";
    let doc = parse(text).unwrap();
    assert_eq!(doc.to_string(), text);
    assert_eq!(doc.interface().header_name, "INTERFACE");
    assert!(doc.interface().get("PrivateKey").is_some());
}

#[test]
fn building_a_config_from_scratch_is_parseable() {
    let keypair = wgfleet_conf::KeyPair::generate();
    let mut doc = ConfDocument::new();
    doc.interface_mut().set(
        "PrivateKey",
        FieldValue::Text(keypair.private.to_base64()),
    );
    doc.interface_mut()
        .set("Address", FieldValue::list(["10.10.0.2/32"]));

    let mut peer = wgfleet_conf::Section::new(wgfleet_conf::SectionKind::Peer);
    peer.push_field(
        "PublicKey",
        FieldValue::Text(keypair.public.to_base64()),
    );
    peer.push_field("AllowedIPs", FieldValue::list(["10.10.0.0/24"]));
    doc.push_peer(peer);

    let rendered = doc.to_string();
    let reparsed = parse(&rendered).unwrap();
    assert!(doc.semantic_eq(&reparsed));
}

#[test]
fn strict_mode_matches_preserve_mode_on_clean_input() {
    let text = "[Interface]\nPrivateKey = SGb+ojrRNDuMePufwtIYhXzA//k6wF3R21tEBgKlzlM=\n";
    assert_eq!(
        parse(text).unwrap().to_string(),
        parse_strict(text).unwrap().to_string()
    );

    let with_unknown = "[Interface]\nPrivateKey = x\nJc = 4\n";
    assert!(parse(with_unknown).is_ok());
    assert!(matches!(
        parse_strict(with_unknown).unwrap_err().kind,
        ParseErrorKind::UnknownField(_)
    ));
}

#[test]
fn keys_parsed_from_configs_are_usable() {
    let text = "[Interface]\nPrivateKey = SGb+ojrRNDuMePufwtIYhXzA//k6wF3R21tEBgKlzlM=\n";
    let doc = parse(text).unwrap();
    let private = Key::from_base64(&doc.interface().get("PrivateKey").unwrap()).unwrap();
    assert_eq!(
        private.get_public().to_base64(),
        "DD5yKRfzExcV5+kDnTroDgCU15latdMjiQ59j1hEuk8="
    );
}
