//! vpnfw - VPN server firewall manager
//!
//! Installs and maintains the iptables policy of one VPN server described by
//! a profile file.
//!
//! # Usage
//!
//! ```bash
//! vpnfw render server.json                # Print the compiled rules, touch nothing
//! vpnfw render server.json --format json  # Same, as JSON
//! vpnfw apply server.json                 # Install the policy and exit
//! vpnfw run server.json --interval 10     # Install, keep reconciling, clear on exit
//! vpnfw history --count 20                # Show recent audit events
//! ```
//!
//! `RUST_LOG` controls verbosity (default `info`).

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use vpnfw::command::SystemRunner;
use vpnfw::config::{self, Settings};
use vpnfw::core::compiler::{self, Band, RuleSet};
use vpnfw::core::error::IptablesErrorPattern;
use vpnfw::core::network::Family;
use vpnfw::core::profiles::{self, ServerProfile};
use vpnfw::core::sets::{self, SetNames};
use vpnfw::{BackendKind, KernelLock, ServerFirewall, audit};

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "vpnfw")]
#[command(about = "Per-server iptables policy manager for VPN servers", long_about = None)]
#[command(version, long_version = build::CLAP_LONG_VERSION)]
struct Cli {
    /// Settings file (default: $XDG_DATA_HOME/vpnfw/config.json or $VPNFW_CONFIG)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the configured backend (native or command)
    #[arg(long, global = true, value_name = "KIND")]
    backend: Option<BackendKind>,

    /// Also write logs to vpnfw.log in the state directory
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a profile and print the rules without touching the kernel
    Render {
        profile: PathBuf,
        /// Output format (args or json)
        #[arg(short, long, default_value = "args")]
        format: String,
    },
    /// Install a profile's policy and exit, leaving it in place
    Apply { profile: PathBuf },
    /// Install a profile's policy, reconcile periodically, clear on Ctrl-C/SIGTERM
    Run {
        profile: PathBuf,
        /// Reconciliation interval (seconds, default from settings)
        #[arg(short, long, value_name = "SECONDS")]
        interval: Option<u64>,
    },
    /// Show the most recent audit log events
    History {
        /// Number of events to show
        #[arg(short, long, default_value_t = 20)]
        count: usize,
    },
}

fn main() -> ExitCode {
    let _ = vpnfw::utils::ensure_dirs();
    let cli = Cli::parse();
    init_logging(cli.log_file);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            if let Some(err) = e.downcast_ref::<vpnfw::Error>()
                && let Some(stderr) = err.stderr()
            {
                let translation = IptablesErrorPattern::match_error(stderr);
                eprintln!("  {}", translation.user_message);
                for suggestion in &translation.suggestions {
                    eprintln!("  - {suggestion}");
                }
                if let Some(url) = &translation.help_url {
                    eprintln!("  See: {url}");
                }
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(to_file: bool) {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if to_file
        && let Some(mut log_path) = vpnfw::utils::get_state_dir()
    {
        log_path.push("vpnfw.log");
        if let Ok(file) = std::fs::File::create(log_path) {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
            return;
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(path: Option<&Path>, backend: Option<BackendKind>) -> vpnfw::Result<Settings> {
    let mut settings = match path.map(Path::to_path_buf).or_else(config::default_config_path) {
        Some(path) => config::load_settings(&path)?,
        None => Settings::default().with_env_overrides(),
    };
    if let Some(backend) = backend {
        settings.backend = backend;
    }
    Ok(settings)
}

async fn handle_cli(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_settings(cli.config.as_deref(), cli.backend)?;

    match cli.command {
        Commands::Render { profile, format } => {
            let profile = profiles::load_profile(&profile).await?;
            let ipv6 = profile.topology.ipv6 && settings.ipv6;
            let names = SetNames::new(&profile.identity);
            let ledger = profile.ledger()?;
            let rules = compiler::compile(&ledger, &profile.topology, &names, ipv6)?;

            match format.as_str() {
                "args" => {
                    for set in sets::derive_sets(&ledger, &names) {
                        let members: Vec<&str> = set.members.iter().map(String::as_str).collect();
                        println!("# set {} ({}): {}", set.name, set.family, members.join(" "));
                    }
                    print_rules(&rules, &settings, &profile);
                }
                "json" => println!("{}", serde_json::to_string_pretty(&rules)?),
                _ => return Err("Invalid format. Use 'args' or 'json'.".into()),
            }
        }
        Commands::Apply { profile } => {
            let profile = profiles::load_profile(&profile).await?;
            warn_if_not_root();
            let firewall = install(&profile, &settings).await?;
            println!(
                "✓ Policy for server {} installed ({} backend).",
                profile.identity.server_id,
                firewall.backend_kind()
            );
        }
        Commands::Run { profile, interval } => {
            let profile = profiles::load_profile(&profile).await?;
            warn_if_not_root();
            let firewall = install(&profile, &settings).await?;
            let secs = interval.unwrap_or(settings.reconcile_interval_secs).max(1);
            println!(
                "✓ Policy for server {} installed, reconciling every {secs}s. Ctrl-C to clear.",
                profile.identity.server_id
            );

            let outcome = reconcile_until_shutdown(&firewall, Duration::from_secs(secs)).await;

            println!("Clearing policy...");
            teardown(&firewall).await?;
            println!("✓ Policy cleared.");
            outcome?;
        }
        Commands::History { count } => {
            let log = audit::AuditLog::new()?;
            let events = match log.read_recent(count).await {
                Ok(events) => events,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(e.into()),
            };
            if events.is_empty() {
                println!("No audit events recorded.");
            }
            for event in events {
                let status = if event.success { "ok" } else { "FAILED" };
                print!(
                    "{} {} {} {status}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.server_id,
                    event.event_type
                );
                match event.error {
                    Some(error) => println!(": {error}"),
                    None => println!(),
                }
            }
        }
    }
    Ok(())
}

/// Removes everything `firewall` installed and records the outcome.
async fn teardown(firewall: &Arc<ServerFirewall>) -> Result<(), Box<dyn std::error::Error>> {
    let fw = Arc::clone(firewall);
    let result = tokio::task::spawn_blocking(move || fw.clear_rules()).await?;
    audit::log_clear(
        &firewall.identity().server_id,
        result.is_ok(),
        result.as_ref().err().map(ToString::to_string),
    )
    .await;
    result?;
    Ok(())
}

fn warn_if_not_root() {
    if !nix::unistd::getuid().is_root() {
        println!("Note: Not running as root. iptables and ipset will likely refuse changes.");
    }
}

/// Builds the engine, generates, runs one reconciliation and attaches ad-hoc rules.
///
/// On failure whatever was already created is torn down before returning.
async fn install(
    profile: &ServerProfile,
    settings: &Settings,
) -> Result<Arc<ServerFirewall>, Box<dyn std::error::Error>> {
    let firewall = Arc::new(ServerFirewall::new(
        profile.identity.clone(),
        profile.topology.clone(),
        settings,
        KernelLock::new(),
        Arc::new(SystemRunner),
    )?);

    let fw = Arc::clone(&firewall);
    let owned = profile.clone();
    let joined = tokio::task::spawn_blocking(move || -> vpnfw::Result<usize> {
        owned.populate(&fw)?;
        fw.generate()?;
        fw.upsert_rules(false)?;
        owned.attach_rules(&fw)?;
        Ok(fw.compiled().map_or(0, |rules| rules.len()))
    })
    .await;
    let result: Result<usize, Box<dyn std::error::Error>> = match joined {
        Ok(result) => result.map_err(Into::into),
        Err(e) => Err(e.into()),
    };

    audit::log_generate(
        &profile.identity.server_id,
        result.as_ref().copied().unwrap_or(0),
        result.is_ok(),
        result.as_ref().err().map(ToString::to_string),
    )
    .await;

    if let Err(e) = result {
        tracing::warn!(error = %e, "Install failed, removing partial policy");
        if let Err(clear_err) = teardown(&firewall).await {
            tracing::error!(error = %clear_err, "Failed to remove partial policy");
        }
        return Err(e);
    }
    Ok(firewall)
}

async fn reconcile_until_shutdown(
    firewall: &Arc<ServerFirewall>,
    period: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately; install() already reconciled
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let fw = Arc::clone(firewall);
                match tokio::task::spawn_blocking(move || fw.upsert_rules(true)).await? {
                    Ok(()) => tracing::debug!("Reconciliation pass complete"),
                    Err(e) => {
                        tracing::error!(error = %e, "Reconciliation failed");
                        audit::log_reconcile_failure(&firewall.identity().server_id, e.to_string()).await;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupt received");
                return Ok(());
            }
            _ = terminate.recv() => {
                tracing::info!("SIGTERM received");
                return Ok(());
            }
        }
    }
}

fn print_rules(rules: &RuleSet, settings: &Settings, profile: &ServerProfile) {
    let owner = profile.identity.owner_tag(&settings.owner_prefix);

    for family in [Family::Ipv4, Family::Ipv6] {
        let tool = match family {
            Family::Ipv4 => &settings.iptables_cmd,
            Family::Ipv6 => &settings.ip6tables_cmd,
        };
        let bands = rules.family(family);
        for band in [Band::Accept, Band::Drop, Band::Deny] {
            let op = if band == Band::Drop { "-A" } else { "-I" };
            let band_rules = bands.band(band);
            if band_rules.is_empty() {
                continue;
            }
            println!("# {family} {band}");
            for rule in band_rules {
                println!("{tool} {op} {}", rule.to_args(&owner).join(" "));
            }
        }
    }
}
