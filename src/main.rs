//! appwall - per-application firewall control plane
//!
//! Command-line front end for rooted and broker-enabled devices.
//!
//! # Features
//!
//! - AUTO backend selection across iptables, connectivity chain, network policy and VPN
//! - Per-app, per-profile rules for Wi-Fi, mobile, roaming, background and LAN
//! - Automatic re-apply on network and screen changes
//! - Boot restore with optional boot-time protection
//! - Audit logging for privileged operations
//!
//! # Usage
//!
//! ```bash
//! appwall privileges                       # Probe root and broker
//! appwall plan                             # Show which backend AUTO would pick
//! appwall run                              # Start and keep rules in sync until Ctrl-C
//! appwall run --mode kernel-rules          # Force a backend
//! appwall boot                             # Restore after restart (from a boot script)
//! appwall stop                             # Remove all enforcement
//! appwall rules sync                       # Create rules for installed apps
//! appwall rules set com.example.app --wifi true
//! appwall evaluate com.example.app --network mobile
//! ```

use appwall::audit::AuditLog;
use appwall::backend::connectivity::ConnectivityBackend;
use appwall::backend::kernel::{DEFAULT_BOOT_SCRIPT, KernelBackend};
use appwall::backend::legacy_policy::LegacyPolicyBackend;
use appwall::backend::vpn::{HeadlessVpnPlatform, VpnBackend};
use appwall::backend::{Backend, BackendSet};
use appwall::boot::{BootOutcome, restore_on_boot};
use appwall::config::SettingsStore;
use appwall::core::inventory::{ShellInventory, reconcile};
use appwall::core::store::{RuleStore, RuleTable};
use appwall::device::{DeviceProbe, SystemProbe, spawn_condition_watch};
use appwall::privilege::PrivilegeMonitor;
use appwall::privilege::broker::{BrokerChannel, BrokerProbe, RishBroker};
use appwall::privilege::root::RootProbe;
use appwall::shell::{RootShell, SuShell};
use appwall::upgrade::{LogNotifier, UpgradeMonitor};
use appwall::orchestrator::ModeChange;
use appwall::{
    DefaultPolicy, FirewallMode, NetworkClass, Orchestrator, RuleChange, RuleKey, is_blocked,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

shadow_rs::shadow!(build);

/// How often privilege sources and device conditions are re-checked while running
const PRIVILEGE_POLL: Duration = Duration::from_secs(30);
const CONDITION_POLL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "appwall")]
#[command(version = build::CLAP_LONG_VERSION)]
#[command(about = "Per-application firewall with root, broker and VPN backends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show persisted settings and rule counts
    Status,
    /// Probe root and broker availability
    Privileges,
    /// Show which backend would be used, without starting anything
    Plan {
        /// auto, vpn, kernel-rules, broker-connectivity or broker-legacy-policy
        #[arg(short, long)]
        mode: Option<FirewallMode>,
    },
    /// Start the firewall and keep rules in sync until interrupted
    Run {
        /// auto, vpn, kernel-rules, broker-connectivity or broker-legacy-policy
        #[arg(short, long)]
        mode: Option<FirewallMode>,
    },
    /// Restore the firewall after a device restart
    Boot,
    /// Remove all enforcement and disable restore on boot
    Stop,
    /// Set what happens to apps without an enabled rule
    Policy {
        /// block-all or allow-all
        policy: DefaultPolicy,
    },
    /// Choose the firewall mode used by `run` and `boot`
    Mode {
        /// auto, vpn, kernel-rules, broker-connectivity or broker-legacy-policy
        mode: FirewallMode,
    },
    /// Evaluate the stored rule for one package
    Evaluate {
        package: String,
        #[arg(short, long, default_value_t = 0)]
        profile: u32,
        /// wifi, mobile, roaming or none
        #[arg(short, long, default_value = "wifi")]
        network: NetworkClass,
        #[arg(long)]
        screen_off: bool,
    },
    /// Manage per-app rules
    Rules {
        #[command(subcommand)]
        command: RulesCommand,
    },
}

#[derive(Subcommand)]
enum RulesCommand {
    /// List stored rules
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change block flags of one rule (true = block)
    Set {
        package: String,
        #[arg(short, long, default_value_t = 0)]
        profile: u32,
        #[arg(long)]
        wifi: Option<bool>,
        #[arg(long)]
        mobile: Option<bool>,
        #[arg(long)]
        roaming: Option<bool>,
        #[arg(long)]
        background: Option<bool>,
        #[arg(long)]
        lan: Option<bool>,
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long, conflicts_with = "allow_all")]
        block_all: bool,
        #[arg(long)]
        allow_all: bool,
    },
    /// Create rules for installed apps and drop rules of removed ones
    Sync,
}

fn main() -> ExitCode {
    let _ = appwall::utils::ensure_dirs();
    init_logging();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(handle_cli(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            if let Some(err) = e.downcast_ref::<appwall::Error>() {
                for suggestion in err.translate().suggestions {
                    eprintln!("  - {suggestion}");
                }
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // Set up logging to file
    if let Some(mut log_path) = appwall::utils::get_state_dir() {
        log_path.push("appwall.log");
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
        {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file)
                .init();
            return;
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Everything a command needs, wired to the real device.
struct Runtime {
    orchestrator: Orchestrator,
    store: Arc<RuleTable>,
    root: PrivilegeMonitor,
    broker: PrivilegeMonitor,
    device: Arc<SystemProbe>,
}

impl Runtime {
    async fn new() -> appwall::Result<Self> {
        let settings = Arc::new(SettingsStore::load_default().await);
        let current = settings.get().await;
        let timeout = current.privilege_timeout();

        let store = Arc::new(RuleTable::open_default().await?);
        let audit = AuditLog::from_settings(current.enable_event_log);

        let shell: Arc<dyn RootShell> = Arc::new(SuShell::new());
        let channel: Arc<dyn BrokerChannel> = Arc::new(RishBroker::new(timeout));
        let root = PrivilegeMonitor::new(Arc::new(RootProbe::new(shell.clone(), timeout)), timeout);
        let broker = PrivilegeMonitor::new(Arc::new(BrokerProbe::new(channel.clone())), timeout);

        let device = Arc::new(SystemProbe::default());
        let sdk = device.sdk_version().await.unwrap_or_else(|e| {
            warn!("Could not read SDK level, assuming the legacy network policy API: {}", e);
            0
        });

        let kernel = KernelBackend::new(shell, root.clone(), timeout).with_boot_protection(
            current.boot_protection,
            PathBuf::from(DEFAULT_BOOT_SCRIPT),
        );
        let backends = BackendSet::new()
            .with(Arc::new(kernel))
            .with(Arc::new(ConnectivityBackend::new(
                channel.clone(),
                broker.clone(),
                sdk,
            )))
            .with(Arc::new(LegacyPolicyBackend::new(
                channel,
                broker.clone(),
                sdk,
            )))
            .with(Arc::new(VpnBackend::new(Arc::new(HeadlessVpnPlatform))));

        let rules: Arc<dyn RuleStore> = store.clone();
        let inventory = Arc::new(ShellInventory::new(timeout));
        let orchestrator =
            Orchestrator::with_inventory(backends, rules, inventory, settings, audit).await;

        Ok(Self {
            orchestrator,
            store,
            root,
            broker,
            device,
        })
    }

    async fn recheck_privileges(&self) {
        tokio::join!(self.root.recheck(), self.broker.recheck());
    }

    /// Keeps rules in sync with device and store changes until a shutdown signal.
    async fn serve(&self, start_upgrade_monitor: bool) -> Result<(), Box<dyn std::error::Error>> {
        let initial = self.device.conditions().await;
        let (conditions, watcher) =
            spawn_condition_watch(self.device.clone(), initial, CONDITION_POLL);
        let events = self.orchestrator.spawn_event_loop(conditions);
        let root_poll = self.root.spawn_periodic(PRIVILEGE_POLL);
        let broker_poll = self.broker.spawn_periodic(PRIVILEGE_POLL);

        let upgrade = if start_upgrade_monitor {
            let timeout = self.orchestrator.settings().get().await.upgrade_timeout();
            UpgradeMonitor::new(
                self.orchestrator.clone(),
                self.broker.clone(),
                Arc::new(LogNotifier),
                timeout,
            )
            .spawn_if_needed()
            .await
        } else {
            None
        };

        println!("Firewall {}. Press Ctrl-C to exit.", self.orchestrator.state());
        wait_for_shutdown().await?;

        if let Some(handle) = upgrade {
            handle.cancel();
        }
        for task in [watcher, events, root_poll, broker_poll] {
            task.abort();
        }
        // Kernel and broker rules outlive the process; `appwall stop` removes them
        info!("Exiting with firewall {}", self.orchestrator.state());
        Ok(())
    }
}

async fn wait_for_shutdown() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = term.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

async fn handle_cli(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    let rt = Runtime::new().await?;

    match command {
        Commands::Status => {
            let settings = rt.orchestrator.settings().get().await;
            let rules = rt.store.all().await?;
            println!(
                "Enabled:        {}",
                if settings.enabled { "yes" } else { "no" }
            );
            println!("Mode:           {}", settings.mode);
            println!("Default policy: {}", settings.default_policy);
            println!(
                "Boot protection: {}",
                if settings.boot_protection { "on" } else { "off" }
            );
            println!(
                "Rules:          {} ({} enabled)",
                rules.len(),
                rules.iter().filter(|r| r.enabled).count()
            );
        }
        Commands::Privileges => {
            rt.recheck_privileges().await;
            for monitor in [&rt.root, &rt.broker] {
                let status = monitor.status();
                match status.corrective_action() {
                    Some(action) => {
                        println!("{:<7} {} (fix: {action})", monitor.kind().to_string(), status);
                    }
                    None => println!("{:<7} {}", monitor.kind().to_string(), status),
                }
            }
        }
        Commands::Plan { mode } => {
            rt.recheck_privileges().await;
            let mode = match mode {
                Some(mode) => mode,
                None => rt.orchestrator.settings().get().await.mode,
            };
            let plan = rt.orchestrator.select(mode).await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Commands::Run { mode } => {
            rt.recheck_privileges().await;
            let mode = match mode {
                Some(mode) => mode,
                None => rt.orchestrator.settings().get().await.mode,
            };
            let backend = rt.orchestrator.start_with_mode(mode).await?;
            println!("✓ Firewall running on {}", backend.display_name());
            rt.serve(true).await?;
        }
        Commands::Boot => match restore_on_boot(&rt.orchestrator, &rt.root, &rt.broker).await? {
            BootOutcome::Skipped => println!("Firewall was disabled; nothing to restore."),
            BootOutcome::ConsentRequired { .. } => {
                println!("VPN consent required; open appwall to finish restoring.");
            }
            BootOutcome::Restored {
                backend,
                normalized,
                start_upgrade_monitor,
            } => {
                println!("✓ Firewall restored on {}", backend.display_name());
                if normalized {
                    println!("✓ Boot-time protection lifted");
                }
                rt.serve(start_upgrade_monitor).await?;
            }
        },
        Commands::Stop => {
            rt.recheck_privileges().await;
            rt.orchestrator.stop().await?;
            // Enforcement left behind by an earlier `run` or `boot` process
            let mut failures = Vec::new();
            for backend_type in rt.orchestrator.backends().types() {
                let Some(backend) = rt.orchestrator.backends().get(backend_type) else {
                    continue;
                };
                if backend.check_availability().await.is_ok()
                    && let Err(e) = backend.stop().await
                {
                    failures.push(format!("{backend_type}: {e}"));
                }
            }
            if failures.is_empty() {
                println!("✓ Firewall stopped.");
            } else {
                return Err(format!("Some backends did not stop:\n{}", failures.join("\n")).into());
            }
        }
        Commands::Policy { policy } => {
            rt.orchestrator.set_default_policy(policy).await?;
            println!("✓ Default policy set to {policy}");
        }
        Commands::Mode { mode } => {
            rt.recheck_privileges().await;
            match rt.orchestrator.apply_mode(mode).await? {
                ModeChange::Saved => println!("✓ Mode set to {mode}; used on the next run"),
                ModeChange::Unchanged => println!("✓ Mode set to {mode}; backend unchanged"),
                ModeChange::Switched(backend) => {
                    println!("✓ Switched to {}", backend.display_name());
                }
                ModeChange::ConsentRequired(plan) => {
                    println!(
                        "Mode set to {mode}; {} needs VPN consent before it can start",
                        plan.backend.display_name()
                    );
                }
            }
        }
        Commands::Evaluate {
            package,
            profile,
            network,
            screen_off,
        } => {
            let rule = rt.store.get(&RuleKey::new(package.clone(), profile)).await?;
            let settings = rt.orchestrator.settings().get().await;
            let blocked = is_blocked(rule.as_ref(), network, !screen_off, settings.default_policy);
            println!(
                "{package}@{profile} on {network}: {}",
                if blocked { "blocked" } else { "allowed" }
            );
            if rule.is_none() {
                println!("(no rule; default policy {})", settings.default_policy);
            }
        }
        Commands::Rules { command } => handle_rules(&rt, command).await?,
    }
    Ok(())
}

async fn handle_rules(rt: &Runtime, command: RulesCommand) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        RulesCommand::List { json } => {
            let rules = rt.store.all().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rules)?);
                return Ok(());
            }
            println!("{:<48} {:>4} {:>9}  blocks", "package", "user", "uid");
            for rule in rules {
                let mut blocks = Vec::new();
                for (on, name) in [
                    (rule.wifi, "wifi"),
                    (rule.mobile, "mobile"),
                    (rule.roaming, "roaming"),
                    (rule.background, "background"),
                    (rule.lan, "lan"),
                ] {
                    if on {
                        blocks.push(name);
                    }
                }
                let blocks = if !rule.enabled {
                    "(disabled)".to_string()
                } else if blocks.is_empty() {
                    "-".to_string()
                } else {
                    blocks.join(",")
                };
                println!(
                    "{:<48} {:>4} {:>9}  {}",
                    rule.package, rule.profile_id, rule.uid, blocks
                );
            }
        }
        RulesCommand::Set {
            package,
            profile,
            wifi,
            mobile,
            roaming,
            background,
            lan,
            enabled,
            block_all,
            allow_all,
        } => {
            let mut changes = Vec::new();
            if block_all {
                changes.push(RuleChange::BlockAll);
            }
            if allow_all {
                changes.push(RuleChange::AllowAll);
            }
            match (mobile, roaming) {
                (Some(mobile), Some(roaming)) => {
                    changes.push(RuleChange::MobileAndRoaming { mobile, roaming });
                }
                (Some(mobile), None) => changes.push(RuleChange::Mobile(mobile)),
                (None, Some(roaming)) => changes.push(RuleChange::Roaming(roaming)),
                (None, None) => {}
            }
            changes.extend(wifi.map(RuleChange::Wifi));
            changes.extend(background.map(RuleChange::Background));
            changes.extend(lan.map(RuleChange::Lan));
            changes.extend(enabled.map(RuleChange::Enabled));
            if changes.is_empty() {
                return Err("Nothing to change. Pass --wifi, --mobile, --roaming, --background, --lan, --enabled, --block-all or --allow-all.".into());
            }

            let key = RuleKey::new(package, profile);
            let rule = rt.store.update_with(&key, &changes).await?;
            println!("✓ Updated {}", rule.key());
        }
        RulesCommand::Sync => {
            let timeout = rt.orchestrator.settings().get().await.privilege_timeout();
            let inventory = ShellInventory::new(timeout);
            let report = reconcile(rt.store.as_ref(), &inventory).await?;
            println!(
                "✓ {} added, {} updated, {} removed",
                report.added, report.updated, report.removed
            );
        }
    }
    Ok(())
}
