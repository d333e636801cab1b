#![allow(dead_code)]
use std::{fs, path::PathBuf};

use anyhow::Result;
use tempfile::TempDir;
use wgfleet_conf::KeyPair;
use wgfleet_shared::cli::{AddExitGroupOpts, AddExitOpts, AddRemoteOpts, AddRouterOpts};

use crate::{journal, Context, Datastore};

pub const HUB_V4: &str = "10.66.0.0/24";
pub const HUB_V6: &str = "fd66::/64";
pub const HUB_ENDPOINT: &str = "hub.example.com:51820";

/// A whole fleet in a temp directory, initialized through the real service
/// layer.
pub struct Fleet {
    pub ctx: Context,
    // The directory is removed during destruction.
    _test_dir: TempDir,
}

impl Fleet {
    pub fn new() -> Result<Self> {
        Self::with_passphrase(None)
    }

    pub fn encrypted(passphrase: &str) -> Result<Self> {
        Self::with_passphrase(Some(passphrase))
    }

    fn with_passphrase(passphrase: Option<&str>) -> Result<Self> {
        let test_dir = tempfile::tempdir()?;
        let store = Datastore::new(test_dir.path().to_path_buf());
        store.ensure_layout()?;
        let ctx = Context::init(store, passphrase)?;
        journal::init_topology(
            &ctx,
            "hub".parse().unwrap(),
            HUB_ENDPOINT.parse().unwrap(),
            Some(HUB_V4.parse()?),
            Some(HUB_V6.parse()?),
            51820,
        )?;
        Ok(Fleet {
            ctx,
            _test_dir: test_dir,
        })
    }

    /// An empty datastore (no hub yet), for import tests.
    pub fn empty() -> Result<Self> {
        let test_dir = tempfile::tempdir()?;
        let store = Datastore::new(test_dir.path().to_path_buf());
        store.ensure_layout()?;
        let ctx = Context::init(store, None)?;
        Ok(Fleet {
            ctx,
            _test_dir: test_dir,
        })
    }

    pub fn import_dir(&self) -> PathBuf {
        self.ctx.store.import_dir()
    }

    pub fn write_import_file(&self, name: &str, text: &str) -> Result<PathBuf> {
        let path = self.import_dir().join(name);
        fs::write(&path, text)?;
        Ok(path)
    }

    pub fn add_remote(&self, name: &str) -> Result<journal::NewPeer<wgfleet_shared::Remote>> {
        Ok(journal::add_remote(
            &self.ctx,
            &AddRemoteOpts {
                name: Some(name.to_string()),
                ..Default::default()
            },
        )?)
    }

    pub fn add_remote_at(
        &self,
        name: &str,
        ip: &str,
    ) -> Result<journal::NewPeer<wgfleet_shared::Remote>> {
        Ok(journal::add_remote(
            &self.ctx,
            &AddRemoteOpts {
                name: Some(name.to_string()),
                ip: Some(ip.parse()?),
                ..Default::default()
            },
        )?)
    }

    pub fn add_router(
        &self,
        name: &str,
        ip: &str,
        lans: &[&str],
    ) -> Result<journal::NewPeer<wgfleet_shared::Router>> {
        Ok(journal::add_router(
            &self.ctx,
            &AddRouterOpts {
                name: Some(name.to_string()),
                ip: Some(ip.parse()?),
                lans: lans.iter().map(|l| l.parse().unwrap()).collect(),
                ..Default::default()
            },
        )?)
    }

    pub fn add_exit(&self, name: &str, endpoint: &str) -> Result<journal::NewPeer<wgfleet_shared::Exit>> {
        Ok(journal::add_exit(
            &self.ctx,
            &AddExitOpts {
                name: Some(name.to_string()),
                endpoint: Some(endpoint.to_string()),
                listen_port: 51820,
                ip: None,
                wan_interface: "eth0".to_string(),
                group: None,
            },
        )?)
    }

    pub fn add_exit_group(&self, name: &str, strategy: &str) -> Result<wgfleet_shared::ExitGroup> {
        Ok(journal::add_exit_group(
            &self.ctx,
            &AddExitGroupOpts {
                name: Some(name.to_string()),
                strategy: strategy.parse().unwrap(),
                check_interval: 30,
                check_timeout: 5,
            },
        )?)
    }
}

/// A parseable hub fixture with the given key material, two blank lines
/// between peers, two PostUp lines and an inline comment.
pub fn hub_fixture(
    hub_private: &KeyPair,
    router_pub: &str,
    remote1_pub: &str,
    remote2_pub: &str,
    exit_pub: &str,
) -> String {
    format!(
        "[Interface]\n\
         PrivateKey = {}\n\
         Address = 10.66.0.1/24, fd66::1/64\n\
         ListenPort = 51820  # keep in sync with the firewall\n\
         PostUp = iptables -A FORWARD -i %i -j ACCEPT\n\
         PostUp = sysctl -w net.ipv4.ip_forward=1\n\
         PostDown = iptables -D FORWARD -i %i -j ACCEPT\n\
         \n\
         \n\
         # office\n\
         [Peer]\n\
         PublicKey = {}\n\
         AllowedIPs = 10.66.0.20/32, 192.168.10.0/24\n\
         Endpoint = office.example.com:51820\n\
         \n\
         \n\
         # bob\n\
         [Peer]\n\
         PublicKey = {}\n\
         AllowedIPs = 10.66.0.30/32, fd66::30/128\n\
         \n\
         \n\
         # carol\n\
         [Peer]\n\
         PublicKey = {}\n\
         AllowedIPs = 10.66.0.31/32, fd66::31/128\n\
         \n\
         \n\
         # frankfurt\n\
         [Peer]\n\
         PublicKey = {}\n\
         AllowedIPs = 10.66.0.5/32\n\
         Endpoint = exit1.example.com:51820\n",
        hub_private.private.to_base64(),
        router_pub,
        remote1_pub,
        remote2_pub,
        exit_pub,
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        audit::AuditLog,
        db::{
            DatabaseExitGroup, DatabaseExtramuralConfig, DatabaseExtramuralPeer, DatabaseFailover,
            DatabasePeerOrder, DatabaseRemote, DatabaseRotation, DatabaseServer,
        },
        failover::{run_group_decision, ProbeOutcome},
        generator::Generator,
        journal,
        Error,
    };
    use wgfleet_shared::{AccessLevel, HealthState, PeerRole};

    #[test]
    fn import_preserves_bytes_end_to_end() {
        // S1: import a hub file, generate, diff is empty.
        let fleet = Fleet::empty().unwrap();
        let hub_keys = KeyPair::generate();
        let text = hub_fixture(
            &hub_keys,
            &KeyPair::generate().public.to_base64(),
            &KeyPair::generate().public.to_base64(),
            &KeyPair::generate().public.to_base64(),
            &KeyPair::generate().public.to_base64(),
        );
        fleet.write_import_file("cs.conf", &text).unwrap();

        let opts = wgfleet_shared::cli::ImportOpts {
            endpoint: Some(HUB_ENDPOINT.to_string()),
            ..Default::default()
        };
        let summary = journal::import_fleet(&fleet.ctx, &opts).unwrap();
        assert_eq!(summary.hub, "cs");
        assert_eq!(summary.routers, 1);
        assert_eq!(summary.remotes, 2);
        assert_eq!(summary.exits, 1);

        let out = fleet.ctx.store.output_dir();
        let configs = journal::generate_all(&fleet.ctx, &out).unwrap();
        let hub = configs.iter().find(|(label, _)| label == "hub").unwrap();
        assert_eq!(hub.1.text, text, "regenerated hub config must be byte-identical");
    }

    #[test]
    fn import_preserves_observed_peer_order() {
        let fleet = Fleet::empty().unwrap();
        let hub_keys = KeyPair::generate();
        let text = hub_fixture(
            &hub_keys,
            &KeyPair::generate().public.to_base64(),
            &KeyPair::generate().public.to_base64(),
            &KeyPair::generate().public.to_base64(),
            &KeyPair::generate().public.to_base64(),
        );
        fleet.write_import_file("cs.conf", &text).unwrap();
        let opts = wgfleet_shared::cli::ImportOpts {
            endpoint: Some(HUB_ENDPOINT.to_string()),
            ..Default::default()
        };
        journal::import_fleet(&fleet.ctx, &opts).unwrap();

        let guard = fleet.ctx.db.lock();
        let server = DatabaseServer::get(&guard).unwrap();
        let order = DatabasePeerOrder::list(&guard, server.id).unwrap();
        let roles: Vec<PeerRole> = order.iter().map(|e| e.role).collect();
        assert_eq!(
            roles,
            vec![
                PeerRole::Router,
                PeerRole::Remote,
                PeerRole::Remote,
                PeerRole::Exit
            ]
        );
    }

    #[test]
    fn new_remote_fills_the_address_gap() {
        // S2: with remotes at .30, .31 and .33, alice gets .32.
        let fleet = Fleet::new().unwrap();
        fleet.add_router("office", "10.66.0.20", &["192.168.10.0/24"]).unwrap();
        fleet.add_remote_at("bob", "10.66.0.30").unwrap();
        fleet.add_remote_at("carol", "10.66.0.31").unwrap();
        fleet.add_remote_at("dave", "10.66.0.33").unwrap();

        let alice = fleet.add_remote("alice").unwrap();
        assert_eq!(
            alice.entity.ipv4_addr,
            Some("10.66.0.32".parse().unwrap())
        );

        // And she lands at the end of the hub's peer order.
        let guard = fleet.ctx.db.lock();
        let server = DatabaseServer::get(&guard).unwrap();
        let order = DatabasePeerOrder::list(&guard, server.id).unwrap();
        assert_eq!(order.last().unwrap().peer_id, alice.entity.id);
        assert_eq!(order.last().unwrap().role, PeerRole::Remote);
    }

    #[test]
    fn access_level_change_touches_exactly_one_line() {
        // S3: full_access -> vpn_only rewrites AllowedIPs and nothing else.
        let fleet = Fleet::new().unwrap();
        fleet.add_router("office", "10.66.0.20", &["192.168.10.0/24"]).unwrap();
        journal::add_remote(
            &fleet.ctx,
            &AddRemoteOpts {
                name: Some("bob".to_string()),
                access_level: AccessLevel::FullAccess,
                ..Default::default()
            },
        )
        .unwrap();

        let out = fleet.ctx.store.output_dir();
        let configs = journal::generate_all(&fleet.ctx, &out).unwrap();
        let first = configs
            .iter()
            .find(|(label, _)| label == "remote/bob")
            .unwrap()
            .1
            .text
            .clone();
        assert!(first.contains("AllowedIPs = 10.66.0.0/24, 192.168.10.0/24, fd66::/64"));

        journal::set_access_level(&fleet.ctx, "bob", AccessLevel::VpnOnly, vec![], None).unwrap();
        let configs = journal::generate_all(&fleet.ctx, &out).unwrap();
        let second = configs
            .iter()
            .find(|(label, _)| label == "remote/bob")
            .unwrap()
            .1
            .text
            .clone();

        let expected = first.replace(
            "AllowedIPs = 10.66.0.0/24, 192.168.10.0/24, fd66::/64",
            "AllowedIPs = 10.66.0.0/24, fd66::/64",
        );
        assert_eq!(second, expected);
    }

    #[test]
    fn rotation_keeps_the_permanent_guid() {
        // S4: rotate carol; guid frozen, configs show the new key, one
        // history row.
        let fleet = Fleet::new().unwrap();
        let carol = fleet.add_remote("carol").unwrap();
        let first_public = carol.entity.public_key.clone();
        assert_eq!(carol.entity.permanent_guid, first_public);

        let out = fleet.ctx.store.output_dir();
        journal::generate_all(&fleet.ctx, &out).unwrap();

        let new_pair = journal::rotate_keys(&fleet.ctx, Some("remote/carol"), "test").unwrap();
        let new_public = new_pair.public.to_base64();
        assert_ne!(new_public, first_public);

        let guard = fleet.ctx.db.lock();
        let carol_row = DatabaseRemote::get_by_name(&guard, "carol").unwrap();
        assert_eq!(carol_row.permanent_guid, first_public);
        assert_eq!(carol_row.public_key, new_public);
        let history = DatabaseRotation::history_for_guid(&guard, &first_public).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].old_public_key, first_public);
        assert_eq!(history[0].new_public_key, new_public);
        drop(guard);

        let configs = journal::generate_all(&fleet.ctx, &out).unwrap();
        let hub = &configs.iter().find(|(l, _)| l == "hub").unwrap().1.text;
        assert!(hub.contains(&new_public));
        assert!(!hub.contains(&first_public));
        let carol_conf = &configs
            .iter()
            .find(|(l, _)| l == "remote/carol")
            .unwrap()
            .1
            .text;
        assert!(carol_conf.contains(&new_pair.private.to_base64()));
    }

    #[test]
    fn failover_moves_remotes_and_never_fails_back() {
        // S5: E1 fails over five checks, dave moves to E2, E1's recovery
        // does not move him back.
        let fleet = Fleet::new().unwrap();
        let e1 = fleet.add_exit("frankfurt", "e1.example.com:51820").unwrap();
        let e2 = fleet.add_exit("amsterdam", "e2.example.com:51820").unwrap();
        let group = fleet.add_exit_group("europe", "priority").unwrap();
        {
            let guard = fleet.ctx.db.lock();
            let db_group = DatabaseExitGroup::get(&guard, group.id).unwrap();
            db_group.add_member(&guard, e1.entity.id, 1, 1).unwrap();
            db_group.add_member(&guard, e2.entity.id, 2, 1).unwrap();
        }
        journal::add_remote(
            &fleet.ctx,
            &AddRemoteOpts {
                name: Some("dave".to_string()),
                exit_group: Some("europe".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        {
            let guard = fleet.ctx.db.lock();
            let dave = DatabaseRemote::get_by_name(&guard, "dave").unwrap();
            assert_eq!(dave.active_exit_id, Some(e1.entity.id));
        }

        let mut down = HashMap::new();
        down.insert(e1.entity.id, ProbeOutcome::down("icmp echo timed out"));
        down.insert(e2.entity.id, ProbeOutcome::up(20));

        // Three failures: degraded, still serving.
        for _ in 0..3 {
            let mut guard = fleet.ctx.db.lock();
            run_group_decision(&mut guard, group.id, &down, "health_check_failed").unwrap();
        }
        {
            let guard = fleet.ctx.db.lock();
            let health = crate::db::DatabaseExitHealth::get(&guard, e1.entity.id).unwrap();
            assert_eq!(health.state, HealthState::Degraded);
            let dave = DatabaseRemote::get_by_name(&guard, "dave").unwrap();
            assert_eq!(dave.active_exit_id, Some(e1.entity.id));
        }

        // Two more: failed, and dave moves to E2 in the same decision.
        for _ in 0..2 {
            let mut guard = fleet.ctx.db.lock();
            run_group_decision(&mut guard, group.id, &down, "health_check_failed").unwrap();
        }
        {
            let guard = fleet.ctx.db.lock();
            let health = crate::db::DatabaseExitHealth::get(&guard, e1.entity.id).unwrap();
            assert_eq!(health.state, HealthState::Failed);
            let dave = DatabaseRemote::get_by_name(&guard, "dave").unwrap();
            assert_eq!(dave.active_exit_id, Some(e2.entity.id));

            let records = DatabaseFailover::list_for_remote(&guard, dave.id).unwrap();
            let moved = records.last().unwrap();
            assert_eq!(moved.from_exit_id, Some(e1.entity.id));
            assert_eq!(moved.to_exit_id, Some(e2.entity.id));
            assert_eq!(moved.trigger_reason, "health_check_failed");
            assert!(moved.success);
        }

        // E1 recovers with a single success; no automatic failback.
        let mut up = HashMap::new();
        up.insert(e1.entity.id, ProbeOutcome::up(5));
        up.insert(e2.entity.id, ProbeOutcome::up(20));
        {
            let mut guard = fleet.ctx.db.lock();
            run_group_decision(&mut guard, group.id, &up, "health_check_failed").unwrap();
        }
        let guard = fleet.ctx.db.lock();
        let health = crate::db::DatabaseExitHealth::get(&guard, e1.entity.id).unwrap();
        assert_eq!(health.state, HealthState::Healthy);
        let dave = DatabaseRemote::get_by_name(&guard, "dave").unwrap();
        assert_eq!(dave.active_exit_id, Some(e2.entity.id));
    }

    #[test]
    fn no_healthy_member_parks_remotes_on_the_sentinel() {
        let fleet = Fleet::new().unwrap();
        let e1 = fleet.add_exit("solo", "solo.example.com:51820").unwrap();
        let group = fleet.add_exit_group("lonely", "priority").unwrap();
        {
            let guard = fleet.ctx.db.lock();
            DatabaseExitGroup::get(&guard, group.id)
                .unwrap()
                .add_member(&guard, e1.entity.id, 1, 1)
                .unwrap();
        }
        journal::add_remote(
            &fleet.ctx,
            &AddRemoteOpts {
                name: Some("erin".to_string()),
                exit_group: Some("lonely".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        let mut down = HashMap::new();
        down.insert(e1.entity.id, ProbeOutcome::down("dead"));
        for _ in 0..5 {
            let mut guard = fleet.ctx.db.lock();
            run_group_decision(&mut guard, group.id, &down, "health_check_failed").unwrap();
        }

        let guard = fleet.ctx.db.lock();
        let erin = DatabaseRemote::get_by_name(&guard, "erin").unwrap();
        assert_eq!(erin.active_exit_id, None);
        let records = DatabaseFailover::list_for_remote(&guard, erin.id).unwrap();
        let parked = records.last().unwrap();
        assert_eq!(parked.trigger_reason, "no_healthy_member");
        assert!(!parked.success);
        assert_eq!(parked.to_exit_id, None);
    }

    #[test]
    fn exit_only_remote_renders_exit_peer_only() {
        let fleet = Fleet::new().unwrap();
        let exit = fleet.add_exit("cairo", "cairo.example.com:51820").unwrap();
        journal::add_remote(
            &fleet.ctx,
            &AddRemoteOpts {
                name: Some("frank".to_string()),
                access_level: AccessLevel::ExitOnly,
                exit: Some("cairo".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        let guard = fleet.ctx.db.lock();
        let frank = DatabaseRemote::get_by_name(&guard, "frank").unwrap();
        let generator = Generator::new(&guard, &fleet.ctx.vault);
        let config = generator.remote_config(&frank.inner).unwrap();
        let doc = wgfleet_conf::parse(&config.text).unwrap();
        let peer_keys: Vec<_> = doc.peers().filter_map(|p| p.get("PublicKey")).collect();
        assert_eq!(peer_keys, vec![exit.entity.public_key.clone()]);
        assert!(config.text.contains("AllowedIPs = 0.0.0.0/0, ::/0"));

        // And the hub config has no entry for frank at all.
        let hub = generator.hub_config().unwrap();
        assert!(!hub.text.contains(&frank.public_key));
    }

    #[test]
    fn extramural_switch_renders_the_new_active_peer_only() {
        // S6: switching the active sponsor peer flips the old one off via
        // the trigger and regeneration emits exactly one [Peer].
        let fleet = Fleet::new().unwrap();
        journal::add_local_peer(
            &fleet.ctx,
            &wgfleet_shared::cli::AddLocalPeerOpts {
                name: Some("laptop".to_string()),
                ssh_host: None,
            },
        )
        .unwrap();
        journal::add_sponsor(
            &fleet.ctx,
            &wgfleet_shared::cli::AddSponsorOpts {
                name: Some("mullvad".to_string()),
                website: None,
            },
        )
        .unwrap();

        let us_west = KeyPair::generate().public.to_base64();
        let sponsor_conf = format!(
            "[Interface]\nPrivateKey = {}\nAddress = 10.99.0.7/32\nDNS = 10.64.0.1\n\n[Peer]\nPublicKey = {}\nAllowedIPs = 0.0.0.0/0, ::/0\nEndpoint = us-west.mullvad.net:51820\n",
            KeyPair::generate().private.to_base64(),
            us_west,
        );
        let path = fleet._test_dir.path().join("mullvad.conf");
        fs::write(&path, &sponsor_conf).unwrap();
        journal::import_extramural(&fleet.ctx, "laptop", "mullvad", &path, Some("wg-mullvad"))
            .unwrap();

        let eu_central = KeyPair::generate().public.to_base64();
        journal::add_extramural_peer(
            &fleet.ctx,
            &wgfleet_shared::cli::ExtramuralAddPeerOpts {
                config: "laptop/mullvad".to_string(),
                name: "eu-central".to_string(),
                public_key: eu_central.clone(),
                endpoint: "eu-central.mullvad.net:51820".to_string(),
                allowed_ips: "0.0.0.0/0, ::/0".to_string(),
                keepalive: None,
                activate: false,
            },
        )
        .unwrap();

        journal::switch_extramural_peer(&fleet.ctx, "laptop/mullvad", "eu-central").unwrap();

        let guard = fleet.ctx.db.lock();
        let config = DatabaseExtramuralConfig::get_by_ref(&guard, "laptop/mullvad").unwrap();
        let peers = DatabaseExtramuralPeer::list_for_config(&guard, config.id).unwrap();
        let active: Vec<_> = peers.iter().filter(|p| p.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "eu-central");

        let generator = Generator::new(&guard, &fleet.ctx.vault);
        let generated = generator.extramural_config(&config.inner).unwrap();
        let doc = wgfleet_conf::parse(&generated.text).unwrap();
        let keys: Vec<_> = doc.peers().filter_map(|p| p.get("PublicKey")).collect();
        assert_eq!(keys, vec![eu_central]);
        assert!(generated.text.contains("eu-central.mullvad.net:51820"));
        assert!(!generated.text.contains(&us_west));
    }

    #[test]
    fn every_operation_lands_in_a_verifiable_audit_chain() {
        let fleet = Fleet::new().unwrap();
        fleet.add_router("office", "10.66.0.20", &["192.168.10.0/24"]).unwrap();
        fleet.add_remote("alice").unwrap();
        journal::rotate_keys(&fleet.ctx, Some("remote/alice"), "test").unwrap();
        journal::set_psk(&fleet.ctx, "alice", false).unwrap();
        journal::remove_entity(&fleet.ctx, "remote", "alice").unwrap();

        let guard = fleet.ctx.db.lock();
        let checked = AuditLog::verify_integrity(&guard).unwrap();
        // init + router + remote + rotate + psk + remove
        assert_eq!(checked, 6);
    }

    #[test]
    fn encrypted_store_round_trips_and_wrong_passphrase_fails() {
        let fleet = Fleet::encrypted("hunter2 but longer").unwrap();
        let alice = fleet.add_remote("alice").unwrap();
        let expected_private = alice.keypair.as_ref().unwrap().private.to_base64();

        {
            let guard = fleet.ctx.db.lock();
            // The column itself is ciphertext.
            let stored: String = guard
                .query_row(
                    "SELECT private_key FROM remotes WHERE hostname = 'alice'",
                    [],
                    |row| row.get(0),
                )
                .unwrap();
            assert!(stored.starts_with(crate::vault::ENC_TAG));

            // The repository unseals transparently.
            let row = DatabaseRemote::get_by_name(&guard, "alice").unwrap();
            let unsealed = row.private_key(&guard, &fleet.ctx.vault).unwrap();
            assert_eq!(unsealed.as_deref(), Some(expected_private.as_str()));
        }

        // Reopen with the right and wrong passphrases.
        let store = fleet.ctx.store.clone();
        assert!(Context::open(store.clone(), Some("hunter2 but longer")).is_ok());
        assert!(matches!(
            Context::open(store.clone(), Some("wrong")),
            Err(Error::Crypto(_))
        ));
        assert!(matches!(
            Context::open(store, None),
            Err(Error::Crypto(_))
        ));
    }

    #[test]
    fn passphrase_change_reencrypts_in_one_transaction() {
        let fleet = Fleet::encrypted("first passphrase").unwrap();
        let alice = fleet.add_remote("alice").unwrap();
        let expected_private = alice.keypair.as_ref().unwrap().private.to_base64();

        journal::change_passphrase(&fleet.ctx, "second passphrase").unwrap();

        let store = fleet.ctx.store.clone();
        drop(fleet);
        let reopened = Context::open(store.clone(), Some("second passphrase")).unwrap();
        let guard = reopened.db.lock();
        let row = DatabaseRemote::get_by_name(&guard, "alice").unwrap();
        let unsealed = row.private_key(&guard, &reopened.vault).unwrap();
        assert_eq!(unsealed.as_deref(), Some(expected_private.as_str()));
        drop(guard);
        drop(reopened);

        assert!(matches!(
            Context::open(store, Some("first passphrase")),
            Err(Error::Crypto(_))
        ));
    }

    #[test]
    fn vpn_addresses_are_unique_across_entity_kinds() {
        let fleet = Fleet::new().unwrap();
        fleet.add_remote_at("bob", "10.66.0.30").unwrap();

        // Same address for another remote, and for a router.
        assert!(matches!(
            fleet.add_remote_at("carol", "10.66.0.30"),
            Err(_)
        ));
        assert!(matches!(
            fleet.add_router("office", "10.66.0.30", &[]),
            Err(_)
        ));

        // The hub's own address is taken too.
        assert!(matches!(fleet.add_remote_at("dave", "10.66.0.1"), Err(_)));

        // Out-of-range requests are refused outright.
        let err = journal::add_remote(
            &fleet.ctx,
            &AddRemoteOpts {
                name: Some("erin".to_string()),
                ip: Some("192.0.2.9".parse().unwrap()),
                ..Default::default()
            },
        );
        assert!(matches!(err, Err(Error::Validation { .. })));
    }

    #[test]
    fn provisional_remote_has_no_renderable_config() {
        let fleet = Fleet::new().unwrap();
        let public_key = KeyPair::generate().public.to_base64();
        journal::add_remote(
            &fleet.ctx,
            &AddRemoteOpts {
                name: Some("byod".to_string()),
                public_key: Some(public_key.clone()),
                ..Default::default()
            },
        )
        .unwrap();

        let guard = fleet.ctx.db.lock();
        let byod = DatabaseRemote::get_by_name(&guard, "byod").unwrap();
        assert_eq!(byod.public_key, public_key);
        assert!(byod.private_key(&guard, &fleet.ctx.vault).unwrap().is_none());

        let generator = Generator::new(&guard, &fleet.ctx.vault);
        assert!(matches!(
            generator.remote_config(&byod.inner),
            Err(Error::Validation { .. })
        ));

        // But the hub still lists it.
        let hub = generator.hub_config().unwrap();
        assert!(hub.text.contains(&public_key));
    }
}
