use std::{env, path::PathBuf, sync::Arc, time::Duration};

use clap::{CommandFactory, Parser, Subcommand};
use colored::*;
use dialoguer::{Confirm, Password};
use wgfleet_server::{
    alerts::AlertDispatcher,
    api,
    audit::AuditLog,
    backup,
    db::{DatabaseApiToken, DatabaseExitGroup, DatabaseExitHealth, DatabaseRemote,
        DatabaseRouter, DatabaseServer, DatabaseSshHost, DatabaseExit, TokenScope},
    deploy,
    failover::{FailoverController, FailoverJob, PingProber},
    generator::Generator,
    journal, Context, Datastore, Error, VERSION,
};
use wgfleet_shared::cli::{
    AddExitGroupOpts, AddExitOpts, AddLocalPeerOpts, AddRemoteOpts, AddRouterOpts, AddSponsorOpts,
    AddSshHostOpts, DeployOpts, ExtramuralAddPeerOpts, ExtramuralImportOpts, ExtramuralSwitchOpts,
    GenerateOpts, ImportOpts, PskOpts, RemoveOpts, RotateOpts, StatusOpts,
};

#[derive(Debug, Parser)]
#[clap(name = "wgfleet", author, version, about = "Control plane for hub-and-spoke WireGuard fleets")]
struct Opts {
    #[clap(subcommand)]
    command: Command,

    /// Datastore working directory (falls back to $WGF_DB's directory)
    #[clap(short, long)]
    datastore: Option<PathBuf>,

    /// Read the vault passphrase from this file instead of prompting
    #[clap(long)]
    passphrase_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new datastore and hub topology.
    Init {
        /// Hub hostname
        hostname: String,

        /// Public endpoint of the hub (host:port)
        #[clap(long)]
        endpoint: String,

        /// v4 VPN range, e.g. 10.66.0.0/24
        #[clap(long)]
        ipv4_cidr: Option<ipnet::Ipv4Net>,

        /// v6 VPN range, e.g. fd66::/64
        #[clap(long)]
        ipv6_cidr: Option<ipnet::Ipv6Net>,

        #[clap(long, default_value = "51820")]
        listen_port: u16,

        /// Encrypt secret columns with a passphrase
        #[clap(long)]
        encrypt: bool,
    },

    /// Import an existing fleet from a directory of .conf files.
    Import {
        #[clap(flatten)]
        args: ImportOpts,
    },

    /// Add an entity to the fleet.
    Add {
        #[clap(subcommand)]
        entity: AddCommand,
    },

    /// Remove an entity.
    Remove {
        #[clap(flatten)]
        args: RemoveOpts,
    },

    /// Rotate a key pair (the hub's when no entity is given).
    Rotate {
        #[clap(flatten)]
        args: RotateOpts,
    },

    /// Generate or remove a remote's preshared key.
    Psk {
        #[clap(flatten)]
        args: PskOpts,
    },

    /// Print a remote's client config (what a QR renderer would encode).
    Qr { peer: String },

    /// Render all configs into the output directory.
    Generate {
        #[clap(flatten)]
        args: GenerateOpts,
    },

    /// Push configs to their hosts.
    Deploy {
        #[clap(flatten)]
        args: DeployOpts,
    },

    /// Show the fleet.
    Status {
        #[clap(flatten)]
        args: StatusOpts,
    },

    /// Change a remote's access level.
    Access {
        peer: String,

        /// full_access, vpn_only, lan_only, custom or exit_only
        level: wgfleet_shared::AccessLevel,

        /// For lan_only: the LAN prefixes to grant
        #[clap(long = "lan")]
        lans: Vec<ipnet::IpNet>,

        /// For custom: the exact AllowedIPs text
        #[clap(long)]
        allowed_ips: Option<String>,
    },

    /// Attach a remote to an exit node or group (or detach it).
    AssignExit {
        peer: String,

        #[clap(long)]
        exit: Option<String>,

        #[clap(long)]
        group: Option<String>,
    },

    /// Force a failover decision for an exit group now.
    Failover {
        group: String,

        #[clap(long, default_value = "operator_forced")]
        reason: String,
    },

    /// Check SSH connectivity to every configured host.
    SshSetup {
        /// Only check this host
        name: Option<String>,
    },

    /// Manage extramural (sponsor-side) configs.
    Extramural {
        #[clap(subcommand)]
        command: ExtramuralCommand,
    },

    /// Inspect or verify the audit log.
    Audit {
        #[clap(subcommand)]
        command: AuditCommand,
    },

    /// Create, verify or restore backup bundles.
    Backup {
        #[clap(subcommand)]
        command: BackupCommand,
    },

    /// Change the vault passphrase, re-encrypting all secrets.
    Passphrase,

    /// Manage bearer tokens for the read-only API.
    ApiToken {
        #[clap(subcommand)]
        command: ApiTokenCommand,
    },

    /// Run the monitoring daemon: health checks plus the read-only API.
    Serve,

    /// Generate shell completion scripts.
    Completions { shell: clap_complete::Shell },
}

#[derive(Debug, Subcommand)]
enum AddCommand {
    /// Add a remote (client) peer.
    Peer {
        #[clap(flatten)]
        args: AddRemoteOpts,
    },
    /// Add a subnet router.
    Router {
        #[clap(flatten)]
        args: AddRouterOpts,
    },
    /// Add an exit node.
    Exit {
        #[clap(flatten)]
        args: AddExitOpts,
    },
    /// Add an exit group.
    ExitGroup {
        #[clap(flatten)]
        args: AddExitGroupOpts,
    },
    /// Add an extramural sponsor.
    Sponsor {
        #[clap(flatten)]
        args: AddSponsorOpts,
    },
    /// Add a local peer that holds extramural configs.
    LocalPeer {
        #[clap(flatten)]
        args: AddLocalPeerOpts,
    },
    /// Add a shared SSH host.
    SshHost {
        #[clap(flatten)]
        args: AddSshHostOpts,
    },
}

#[derive(Debug, Subcommand)]
enum ExtramuralCommand {
    /// List configs and their active peers.
    List,
    /// Show one config in detail.
    Show { config: String },
    /// Import a sponsor-provided .conf file.
    Import {
        #[clap(flatten)]
        args: ExtramuralImportOpts,
    },
    /// Render one config.
    Generate { config: String },
    /// Switch the active sponsor peer.
    SwitchPeer {
        #[clap(flatten)]
        args: ExtramuralSwitchOpts,
    },
    /// Add a sponsor.
    AddSponsor {
        #[clap(flatten)]
        args: AddSponsorOpts,
    },
    /// Add a sponsor-side peer to a config.
    AddPeer {
        #[clap(flatten)]
        args: ExtramuralAddPeerOpts,
    },
    /// Add a shared SSH host.
    AddSshHost {
        #[clap(flatten)]
        args: AddSshHostOpts,
    },
    /// Confirm the sponsor has our rotated key.
    ConfirmRemote { config: String },
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    /// Walk the whole chain and every Merkle checkpoint.
    Verify,
    /// Show the most recent entries.
    Recent {
        #[clap(long, default_value = "20")]
        limit: u32,
    },
    /// Move entries older than N days to the archive table.
    Archive {
        #[clap(long, default_value = "365")]
        days: u32,
    },
}

#[derive(Debug, Subcommand)]
enum BackupCommand {
    Create,
    Verify { bundle: PathBuf },
    Restore {
        bundle: PathBuf,

        /// Bypass confirmation
        #[clap(long)]
        yes: bool,
    },
    List,
}

#[derive(Debug, Subcommand)]
enum ApiTokenCommand {
    Create {
        name: String,

        #[clap(long, default_value = "read")]
        scope: String,
    },
    Revoke { name: String },
}

#[tokio::main]
async fn main() {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", "warn,wgfleet=info");
    }
    pretty_env_logger::init();

    let opts = Opts::parse();
    if let Err(e) = run(opts).await {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(e.exit_code());
    }
}

fn read_passphrase_file(path: &PathBuf) -> Result<String, Error> {
    Ok(std::fs::read_to_string(path)?.trim_end().to_string())
}

fn open_context(
    store: Datastore,
    passphrase_file: Option<&PathBuf>,
) -> Result<Context, Error> {
    let passphrase = passphrase_file.map(read_passphrase_file).transpose()?;
    match Context::open(store.clone(), passphrase.as_deref()) {
        Err(Error::Crypto(message)) if passphrase.is_none() && message.contains("required") => {
            let typed = Password::new()
                .with_prompt("Vault passphrase")
                .interact()
                .map_err(|e| Error::Crypto(e.to_string()))?;
            Context::open(store, Some(&typed))
        },
        other => other,
    }
}

async fn run(opts: Opts) -> Result<(), Error> {
    let store = Datastore::resolve(opts.datastore.clone());

    match opts.command {
        Command::Init {
            hostname,
            endpoint,
            ipv4_cidr,
            ipv6_cidr,
            listen_port,
            encrypt,
        } => {
            let passphrase = if encrypt {
                Some(match &opts.passphrase_file {
                    Some(path) => read_passphrase_file(path)?,
                    None => Password::new()
                        .with_prompt("New vault passphrase")
                        .with_confirmation("Repeat passphrase", "Passphrases do not match")
                        .interact()
                        .map_err(|e| Error::Crypto(e.to_string()))?,
                })
            } else {
                None
            };
            let ctx = Context::init(store, passphrase.as_deref())?;
            let hostname = hostname
                .parse()
                .map_err(|e: &str| Error::validation("hostname", e))?;
            let endpoint = endpoint
                .parse()
                .map_err(|e: &str| Error::validation("endpoint", e))?;
            let server =
                journal::init_topology(&ctx, hostname, endpoint, ipv4_cidr, ipv6_cidr, listen_port)?;
            println!(
                "{} hub {} created (public key {})",
                "[*]".dimmed(),
                (*server.hostname).bold(),
                server.public_key
            );
            Ok(())
        },

        Command::Import { args } => {
            let ctx = open_context(store, opts.passphrase_file.as_ref())?;
            let summary = journal::import_fleet(&ctx, &args)?;
            println!(
                "{} imported hub {} with {} routers, {} remotes, {} exits ({} client configs matched)",
                "[*]".dimmed(),
                summary.hub.bold(),
                summary.routers,
                summary.remotes,
                summary.exits,
                summary.client_configs_matched,
            );
            Ok(())
        },

        Command::Add { entity } => {
            let ctx = open_context(store, opts.passphrase_file.as_ref())?;
            match entity {
                AddCommand::Peer { args } => {
                    let new = journal::add_remote(&ctx, &args)?;
                    println!("{} remote {} added", "[*]".dimmed(), (*new.entity.hostname).bold());
                    if let Some(keypair) = &new.keypair {
                        println!("    private key (hand to the device): {}", keypair.private.to_base64());
                    }
                    if let Some(psk) = &new.preshared_key {
                        println!("    preshared key: {psk}");
                    }
                },
                AddCommand::Router { args } => {
                    let new = journal::add_router(&ctx, &args)?;
                    println!("{} router {} added", "[*]".dimmed(), (*new.entity.hostname).bold());
                },
                AddCommand::Exit { args } => {
                    let new = journal::add_exit(&ctx, &args)?;
                    println!("{} exit {} added", "[*]".dimmed(), (*new.entity.hostname).bold());
                },
                AddCommand::ExitGroup { args } => {
                    let group = journal::add_exit_group(&ctx, &args)?;
                    println!("{} exit group {} added", "[*]".dimmed(), group.name.bold());
                },
                AddCommand::Sponsor { args } => {
                    let sponsor = journal::add_sponsor(&ctx, &args)?;
                    println!("{} sponsor {} added", "[*]".dimmed(), sponsor.name.bold());
                },
                AddCommand::LocalPeer { args } => {
                    let peer = journal::add_local_peer(&ctx, &args)?;
                    println!("{} local peer {} added", "[*]".dimmed(), peer.name.bold());
                },
                AddCommand::SshHost { args } => {
                    let host = journal::add_ssh_host(&ctx, &args)?;
                    println!("{} ssh host {} added", "[*]".dimmed(), host.name.bold());
                },
            }
            Ok(())
        },

        Command::Remove { args } => {
            let ctx = open_context(store, opts.passphrase_file.as_ref())?;
            if !args.yes
                && !Confirm::new()
                    .with_prompt(format!("Permanently remove {} \"{}\"?", args.kind, args.name))
                    .default(false)
                    .interact()
                    .unwrap_or(false)
            {
                println!("exited without removing anything.");
                return Ok(());
            }
            journal::remove_entity(&ctx, &args.kind, &args.name)?;
            println!("{} {} {} removed", "[*]".dimmed(), args.kind, args.name.bold());
            Ok(())
        },

        Command::Rotate { args } => {
            let ctx = open_context(store, opts.passphrase_file.as_ref())?;
            let keypair = journal::rotate_keys(&ctx, args.entity.as_deref(), &args.reason)?;
            println!(
                "{} keys rotated; new public key {}",
                "[*]".dimmed(),
                keypair.public.to_base64()
            );
            println!("    regenerate and deploy to make it effective.");
            Ok(())
        },

        Command::Psk { args } => {
            let ctx = open_context(store, opts.passphrase_file.as_ref())?;
            match journal::set_psk(&ctx, &args.peer, args.remove)? {
                Some(psk) => {
                    println!("{} preshared key for {}:", "[*]".dimmed(), args.peer.bold());
                    println!("    {psk}");
                },
                None => println!("{} preshared key removed from {}", "[*]".dimmed(), args.peer),
            }
            Ok(())
        },

        Command::Qr { peer } => {
            let ctx = open_context(store, opts.passphrase_file.as_ref())?;
            let guard = ctx.db.lock();
            let remote = DatabaseRemote::get_by_name(&guard, &peer)?;
            let generator = Generator::new(&guard, &ctx.vault);
            let config = generator.remote_config(&remote.inner)?;
            print!("{}", config.text);
            Ok(())
        },

        Command::Generate { args } => {
            let ctx = open_context(store, opts.passphrase_file.as_ref())?;
            let out = args.out.unwrap_or_else(|| ctx.store.output_dir());
            let configs = journal::generate_all(&ctx, &out)?;
            for (label, config) in &configs {
                println!("{} {} -> {}", "[*]".dimmed(), label, out.join(&config.name).display());
            }
            Ok(())
        },

        Command::Deploy { args } => {
            let ctx = open_context(store, opts.passphrase_file.as_ref())?;
            deploy_fleet(&ctx, &args)
        },

        Command::Status { args } => {
            let ctx = open_context(store, opts.passphrase_file.as_ref())?;
            loop {
                print_status(&ctx)?;
                if !args.live {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
                println!();
            }
            Ok(())
        },

        Command::Access {
            peer,
            level,
            lans,
            allowed_ips,
        } => {
            let ctx = open_context(store, opts.passphrase_file.as_ref())?;
            journal::set_access_level(&ctx, &peer, level, lans, allowed_ips)?;
            println!(
                "{} {} is now {}; regenerate and deploy to apply",
                "[*]".dimmed(),
                peer.bold(),
                level.as_str()
            );
            Ok(())
        },

        Command::AssignExit { peer, exit, group } => {
            let ctx = open_context(store, opts.passphrase_file.as_ref())?;
            let remote =
                journal::assign_exit(&ctx, &peer, exit.as_deref(), group.as_deref())?;
            match remote.active_exit_id {
                Some(_) => println!("{} {} routed through its exit", "[*]".dimmed(), peer.bold()),
                None => println!("{} {} has no exit", "[*]".dimmed(), peer.bold()),
            }
            Ok(())
        },

        Command::Failover { group, reason } => {
            let ctx = open_context(store, opts.passphrase_file.as_ref())?;
            let decisions = journal::force_failover(&ctx, &group, &reason)?;
            if decisions.is_empty() {
                println!("no remotes needed to move.");
            }
            for decision in decisions {
                println!(
                    "{} remote {} moved {:?} -> {:?} ({})",
                    "[*]".dimmed(),
                    decision.remote_id,
                    decision.from_exit_id,
                    decision.to_exit_id,
                    decision.reason
                );
            }
            Ok(())
        },

        Command::SshSetup { name } => {
            let ctx = open_context(store, opts.passphrase_file.as_ref())?;
            let guard = ctx.db.lock();
            let hosts = match name {
                Some(name) => vec![DatabaseSshHost::get_by_name(&guard, &name)?],
                None => DatabaseSshHost::list(&guard)?,
            };
            drop(guard);
            if hosts.is_empty() {
                println!("no ssh hosts configured; add one with `wgfleet add ssh-host`.");
            }
            for host in hosts {
                match deploy::check_ssh_host(&host, Duration::from_secs(10)) {
                    Ok(()) => println!("{} {} reachable", "[ok]".green(), host.name.bold()),
                    Err(e) => println!("{} {}: {}", "[!!]".red(), host.name.bold(), e),
                }
            }
            Ok(())
        },

        Command::Extramural { command } => {
            let ctx = open_context(store, opts.passphrase_file.as_ref())?;
            extramural(&ctx, command)
        },

        Command::Audit { command } => {
            let ctx = open_context(store, opts.passphrase_file.as_ref())?;
            let guard = ctx.db.lock();
            match command {
                AuditCommand::Verify => {
                    let checked = AuditLog::verify_integrity(&guard)?;
                    println!(
                        "{} audit log verified: {} entries, hash chain and checkpoints intact",
                        "[ok]".green(),
                        checked
                    );
                },
                AuditCommand::Recent { limit } => {
                    for entry in AuditLog::list_recent(&guard, limit)?.iter().rev() {
                        println!(
                            "{:>6}  {}  {:<24} {}",
                            entry.id,
                            entry.timestamp,
                            entry.event_type,
                            entry.details.dimmed()
                        );
                    }
                },
                AuditCommand::Archive { days } => {
                    let cutoff = (chrono::Utc::now()
                        - chrono::Duration::days(days as i64))
                    .to_rfc3339();
                    let moved = AuditLog::archive_before(&guard, &cutoff)?;
                    println!("{} {} entries archived", "[*]".dimmed(), moved);
                },
            }
            Ok(())
        },

        Command::Backup { command } => {
            let ctx = open_context(store, opts.passphrase_file.as_ref())?;
            match command {
                BackupCommand::Create => {
                    let bundle = backup::create(&ctx.store)?;
                    ctx.bus.publish(&journal::Event::BackupCreated {
                        path: bundle.display().to_string(),
                    });
                    println!("{} bundle created at {}", "[*]".dimmed(), bundle.display());
                },
                BackupCommand::Verify { bundle } => {
                    let manifest = backup::verify(&bundle)?;
                    println!(
                        "{} bundle verified ({} files, created {})",
                        "[ok]".green(),
                        manifest.files.len(),
                        manifest.created_at
                    );
                },
                BackupCommand::Restore { bundle, yes } => {
                    if !yes
                        && !Confirm::new()
                            .with_prompt("Replace the current database with this bundle?")
                            .default(false)
                            .interact()
                            .unwrap_or(false)
                    {
                        println!("exited without restoring.");
                        return Ok(());
                    }
                    backup::restore(&ctx.store, &bundle)?;
                    ctx.bus.publish(&journal::Event::BackupRestored {
                        path: bundle.display().to_string(),
                    });
                    println!("{} restored from {}", "[*]".dimmed(), bundle.display());
                },
                BackupCommand::List => {
                    for bundle in backup::list(&ctx.store)? {
                        println!("{}", bundle.display());
                    }
                },
            }
            Ok(())
        },

        Command::Passphrase => {
            let ctx = open_context(store, opts.passphrase_file.as_ref())?;
            let new_passphrase = Password::new()
                .with_prompt("New vault passphrase")
                .with_confirmation("Repeat passphrase", "Passphrases do not match")
                .interact()
                .map_err(|e| Error::Crypto(e.to_string()))?;
            journal::change_passphrase(&ctx, &new_passphrase)?;
            println!("{} all secret columns re-encrypted.", "[*]".dimmed());
            Ok(())
        },

        Command::ApiToken { command } => {
            let ctx = open_context(store, opts.passphrase_file.as_ref())?;
            let guard = ctx.db.lock();
            match command {
                ApiTokenCommand::Create { name, scope } => {
                    let scope = match scope.as_str() {
                        "read" => TokenScope::Read,
                        "write" => TokenScope::Write,
                        "admin" => TokenScope::Admin,
                        other => {
                            return Err(Error::validation(
                                "scope",
                                format!("unknown scope {other}"),
                            ))
                        },
                    };
                    let token = DatabaseApiToken::create(&guard, &name, scope)?;
                    println!("{} token {} (shown once):", "[*]".dimmed(), name.bold());
                    println!("    {token}");
                },
                ApiTokenCommand::Revoke { name } => {
                    DatabaseApiToken::revoke(&guard, &name)?;
                    println!("{} token {} revoked", "[*]".dimmed(), name.bold());
                },
            }
            Ok(())
        },

        Command::Serve => {
            let ctx = open_context(store, opts.passphrase_file.as_ref())?;
            serve(ctx).await
        },

        Command::Completions { shell } => {
            let mut app = Opts::command();
            let app_name = app.get_name().to_string();
            clap_complete::generate(shell, &mut app, app_name, &mut std::io::stdout());
            Ok(())
        },
    }
}

fn print_status(ctx: &Context) -> Result<(), Error> {
    let guard = ctx.db.lock();
    let server = DatabaseServer::get_opt(&guard)?;
    match &server {
        None => {
            println!("datastore is empty; run `wgfleet init` or `wgfleet import`.");
            return Ok(());
        },
        Some(server) => {
            println!(
                "{} {} ({})",
                "hub".bold(),
                &*server.hostname,
                server.endpoint.to_string().dimmed()
            );
        },
    }

    for router in DatabaseRouter::list(&guard)? {
        let lans: Vec<String> = router.lans.iter().map(|l| l.to_string()).collect();
        println!(
            "  {} {:<20} {}",
            "router".cyan(),
            &*router.hostname,
            lans.join(", ").dimmed()
        );
    }
    for remote in DatabaseRemote::list(&guard)? {
        println!(
            "  {} {:<20} {}",
            "remote".blue(),
            &*remote.hostname,
            remote.access_level.as_str().dimmed()
        );
    }
    let health = DatabaseExitHealth::list(&guard)?;
    for exit in DatabaseExit::list(&guard)? {
        let state = health
            .iter()
            .find(|h| h.exit_id == exit.id)
            .map(|h| h.state)
            .unwrap_or(wgfleet_shared::HealthState::Healthy);
        let state_str = match state {
            wgfleet_shared::HealthState::Healthy => "healthy".green(),
            wgfleet_shared::HealthState::Degraded => "degraded".yellow(),
            wgfleet_shared::HealthState::Failed => "failed".red(),
        };
        println!("  {} {:<20} {}", "exit".magenta(), &*exit.hostname, state_str);
    }
    Ok(())
}

fn deploy_fleet(ctx: &Context, args: &DeployOpts) -> Result<(), Error> {
    let outcomes = journal::deploy_fleet(ctx, args)?;
    if outcomes.is_empty() {
        println!("nothing to deploy.");
        return Ok(());
    }
    for outcome in outcomes {
        match &outcome.error {
            None => {
                let note = if outcome.changed { "updated" } else { "unchanged" };
                println!(
                    "{} {} {} ({})",
                    "[ok]".green(),
                    outcome.label.bold(),
                    note,
                    outcome.path.display()
                );
                if let Some(backup) = outcome.backup_path {
                    println!("     backup: {backup}");
                }
            },
            Some(error) => {
                println!("{} {}: {}", "[!!]".red(), outcome.label.bold(), error);
            },
        }
    }
    Ok(())
}

fn extramural(ctx: &Context, command: ExtramuralCommand) -> Result<(), Error> {
    use wgfleet_server::db::{
        DatabaseExtramuralConfig, DatabaseExtramuralPeer, DatabaseLocalPeer, DatabaseSponsor,
    };

    match command {
        ExtramuralCommand::List => {
            let guard = ctx.db.lock();
            let sponsors = DatabaseSponsor::list(&guard)?;
            let locals = DatabaseLocalPeer::list(&guard)?;
            for config in DatabaseExtramuralConfig::list(&guard)? {
                let sponsor = sponsors
                    .iter()
                    .find(|s| s.id == config.sponsor_id)
                    .map(|s| s.name.as_str())
                    .unwrap_or("?");
                let local = locals
                    .iter()
                    .find(|l| l.id == config.local_peer_id)
                    .map(|l| l.name.as_str())
                    .unwrap_or("?");
                let active = DatabaseExtramuralPeer::active_for(&guard, config.id)?
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| "none".to_string());
                let pending = if config.pending_remote_update {
                    " (pending remote update)".yellow().to_string()
                } else {
                    String::new()
                };
                println!(
                    "{}/{} -> {} active {}{}",
                    local.bold(),
                    sponsor,
                    config.interface_name,
                    active.green(),
                    pending
                );
            }
            Ok(())
        },
        ExtramuralCommand::Show { config } => {
            let guard = ctx.db.lock();
            let found = DatabaseExtramuralConfig::get_by_ref(&guard, &config)?;
            println!("interface   {}", found.interface_name);
            println!("public key  {}", found.public_key);
            println!("guid        {}", found.permanent_guid);
            if found.pending_remote_update {
                println!("{}", "pending remote update: sponsor still has the old key".yellow());
            }
            for peer in DatabaseExtramuralPeer::list_for_config(&guard, found.id)? {
                let marker = if peer.is_active { "*" } else { " " };
                println!(
                    "  {marker} {:<16} {} {}",
                    peer.name,
                    peer.endpoint.to_string().dimmed(),
                    peer.allowed_ips.dimmed()
                );
            }
            Ok(())
        },
        ExtramuralCommand::Import { args } => {
            let summary = journal::import_extramural(
                ctx,
                &args.local_peer,
                &args.sponsor,
                &args.path,
                args.interface.as_deref(),
            )?;
            println!(
                "{} imported {} with {} sponsor peers",
                "[*]".dimmed(),
                summary.reference.bold(),
                summary.peers
            );
            Ok(())
        },
        ExtramuralCommand::Generate { config } => {
            let guard = ctx.db.lock();
            let found = DatabaseExtramuralConfig::get_by_ref(&guard, &config)?;
            let generator = Generator::new(&guard, &ctx.vault);
            let generated = generator.extramural_config(&found.inner)?;
            drop(guard);
            let out = ctx.store.output_dir().join(&generated.name);
            std::fs::create_dir_all(ctx.store.output_dir())?;
            std::fs::write(&out, &generated.text)?;
            println!("{} {} -> {}", "[*]".dimmed(), config, out.display());
            Ok(())
        },
        ExtramuralCommand::SwitchPeer { args } => {
            journal::switch_extramural_peer(ctx, &args.config, &args.peer)?;
            println!(
                "{} {} now uses peer {}",
                "[*]".dimmed(),
                args.config.bold(),
                args.peer.green()
            );
            Ok(())
        },
        ExtramuralCommand::AddSponsor { args } => {
            let sponsor = journal::add_sponsor(ctx, &args)?;
            println!("{} sponsor {} added", "[*]".dimmed(), sponsor.name.bold());
            Ok(())
        },
        ExtramuralCommand::AddPeer { args } => {
            journal::add_extramural_peer(ctx, &args)?;
            println!("{} peer added", "[*]".dimmed());
            Ok(())
        },
        ExtramuralCommand::AddSshHost { args } => {
            let host = journal::add_ssh_host(ctx, &args)?;
            println!("{} ssh host {} added", "[*]".dimmed(), host.name.bold());
            Ok(())
        },
        ExtramuralCommand::ConfirmRemote { config } => {
            journal::confirm_remote_update(ctx, &config)?;
            println!("{} {} marked up to date", "[*]".dimmed(), config.bold());
            Ok(())
        },
    }
}

/// Daemon mode: periodic exit health checks plus the read-only API.
async fn serve(ctx: Context) -> Result<(), Error> {
    log::info!("wgfleet {VERSION} starting");

    let dispatcher = AlertDispatcher::spawn(
        ctx.config.webhooks.clone(),
        ctx.config.alert_rules.clone(),
    );
    dispatcher.register(&ctx.bus);

    // Failover decisions are fire-and-report: the assignment is already
    // committed, so a failed redeploy only logs and stays retryable.
    {
        let redeploy_ctx = ctx.clone();
        ctx.bus.subscribe(Arc::new(move |event| {
            if matches!(event, journal::Event::FailoverOccurred { .. }) {
                let ctx = redeploy_ctx.clone();
                std::thread::spawn(move || {
                    let opts = wgfleet_shared::cli::DeployOpts {
                        restart: true,
                        ..Default::default()
                    };
                    match journal::deploy_fleet(&ctx, &opts) {
                        Ok(outcomes) => {
                            for outcome in outcomes.iter().filter(|o| o.error.is_some()) {
                                log::error!(
                                    "post-failover deploy of {} failed: {}",
                                    outcome.label,
                                    outcome.error.as_deref().unwrap_or("unknown")
                                );
                            }
                        },
                        Err(e) => log::error!("post-failover deployment failed: {e}"),
                    }
                });
            }
        }));
    }

    let controller = Arc::new(FailoverController::spawn(
        ctx.db.clone(),
        ctx.bus.clone(),
        Box::new(PingProber),
    ));

    // One scheduler tick per group interval; the controller serializes the
    // actual decisions.
    {
        let db = ctx.db.clone();
        let controller = Arc::clone(&controller);
        tokio::task::spawn_blocking(move || loop {
            let groups = {
                let guard = db.lock();
                DatabaseExitGroup::list(&guard)
            };
            let min_interval = match groups {
                Ok(groups) => {
                    let mut min_interval = 60;
                    for group in groups {
                        controller.enqueue(FailoverJob::CheckGroup { group_id: group.id });
                        min_interval = min_interval.min(group.check_interval_secs.max(5));
                    }
                    min_interval
                },
                Err(e) => {
                    log::error!("cannot list exit groups: {e}");
                    60
                },
            };
            std::thread::sleep(Duration::from_secs(min_interval as u64));
        });
    }

    match ctx.config.api_listen {
        Some(listen) => {
            api::serve(
                api::ApiContext {
                    database_path: ctx.store.database_path(),
                },
                listen,
            )
            .await
        },
        None => {
            log::info!("no api-listen configured; running health checks only");
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        },
    }
}

