//! Root iptables backend
//!
//! Rules live in a dedicated `appwall` chain (IPv4 and IPv6) jumped to from
//! `OUTPUT`. Every apply rebuilds the chain in a single root shell session:
//!
//! ```text
//! iptables -N appwall            (ignore "exists")
//! iptables -F appwall
//! iptables -C OUTPUT -j appwall || iptables -I OUTPUT -j appwall
//! iptables -A appwall -m owner --uid-owner <uid> -j REJECT        blocked apps
//! iptables -A appwall -d <lan> -m owner --uid-owner <uid> -j REJECT  LAN-blocked apps
//! iptables -A appwall -m owner --uid-owner <uid> -j RETURN        allowed apps (block-all only)
//! iptables -A appwall -m owner --uid-owner <range> -j REJECT      app UID ranges (block-all only)
//! ```
//!
//! With boot protection enabled a boot script installs an `appwall_boot`
//! chain that rejects every application UID until this backend starts and
//! [`Backend::normalize_boot_policy`] removes it.

use super::{Backend, fingerprint, require_privilege};
use crate::core::error::{Error, Result};
use crate::core::evaluator::{ApplyContext, Verdict, evaluate_all};
use crate::core::rule::{
    FIRST_APPLICATION_UID, LAST_APPLICATION_UID, PER_USER_RANGE, Rule, absolute_uid,
};
use crate::core::state::BackendType;
use crate::privilege::{PrivilegeKind, PrivilegeMonitor};
use crate::shell::{RootShell, ShellOutput};
use crate::validators::validate_app_uid;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CHAIN: &str = "appwall";
pub const BOOT_CHAIN: &str = "appwall_boot";

/// Default location picked up by root managers' late-start service hooks
pub const DEFAULT_BOOT_SCRIPT: &str = "/data/adb/service.d/appwall_boot.sh";

const LAN_V4: [&str; 4] = [
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
];
const LAN_V6: [&str; 2] = ["fc00::/7", "fe80::/10"];

const TOOLS: [(&str, &[&str]); 2] = [("iptables", &LAN_V4), ("ip6tables", &LAN_V6)];

/// Builds the shell script that rebuilds the `appwall` chain for `verdicts`.
pub fn build_apply_script(verdicts: &[Verdict], ctx: &ApplyContext) -> String {
    let block_all = ctx.default_policy.blocks();
    let profiles: BTreeSet<u32> = std::iter::once(0)
        .chain(verdicts.iter().map(|v| v.profile_id))
        .collect();

    let mut script = String::new();
    for (tool, lan_ranges) in TOOLS {
        let ipt = format!("{tool} -w");
        let _ = writeln!(script, "{ipt} -N {CHAIN} 2>/dev/null || true");
        let _ = writeln!(script, "{ipt} -F {CHAIN}");
        let _ = writeln!(
            script,
            "{ipt} -C OUTPUT -j {CHAIN} 2>/dev/null || {ipt} -I OUTPUT -j {CHAIN}"
        );

        for v in verdicts {
            if v.blocked {
                let _ = writeln!(
                    script,
                    "{ipt} -A {CHAIN} -m owner --uid-owner {} -j REJECT",
                    v.uid
                );
                continue;
            }
            if v.lan_blocked {
                for range in lan_ranges {
                    let _ = writeln!(
                        script,
                        "{ipt} -A {CHAIN} -d {range} -m owner --uid-owner {} -j REJECT",
                        v.uid
                    );
                }
            }
            if block_all {
                let _ = writeln!(
                    script,
                    "{ipt} -A {CHAIN} -m owner --uid-owner {} -j RETURN",
                    v.uid
                );
            }
        }

        if block_all {
            for profile in &profiles {
                let _ = writeln!(
                    script,
                    "{ipt} -A {CHAIN} -m owner --uid-owner {}-{} -j REJECT",
                    absolute_uid(*profile, FIRST_APPLICATION_UID),
                    absolute_uid(*profile, LAST_APPLICATION_UID)
                );
            }
        }
    }
    script
}

/// Script that removes the `appwall` chain and its jump.
pub fn build_teardown_script() -> String {
    let mut script = String::new();
    for (tool, _) in TOOLS {
        let _ = writeln!(
            script,
            "{tool} -w -D OUTPUT -j {CHAIN} 2>/dev/null; {tool} -w -F {CHAIN} 2>/dev/null; {tool} -w -X {CHAIN} 2>/dev/null"
        );
    }
    script.push_str("true\n");
    script
}

/// Boot script body: rejects every application UID until normalised.
fn boot_chain_script() -> String {
    let mut script = String::from("#!/system/bin/sh\n");
    for (tool, _) in TOOLS {
        let _ = writeln!(script, "{tool} -w -N {BOOT_CHAIN} 2>/dev/null || true");
        let _ = writeln!(script, "{tool} -w -F {BOOT_CHAIN}");
        let _ = writeln!(
            script,
            "{tool} -w -A {BOOT_CHAIN} -m owner --uid-owner {}-{} -j REJECT",
            FIRST_APPLICATION_UID,
            PER_USER_RANGE * 1000 - 1
        );
        let _ = writeln!(
            script,
            "{tool} -w -C OUTPUT -j {BOOT_CHAIN} 2>/dev/null || {tool} -w -I OUTPUT -j {BOOT_CHAIN}"
        );
    }
    script
}

/// Script that drops the boot chain.
fn boot_normalize_script() -> String {
    let mut script = String::new();
    for (tool, _) in TOOLS {
        let _ = writeln!(
            script,
            "{tool} -w -D OUTPUT -j {BOOT_CHAIN} 2>/dev/null; {tool} -w -F {BOOT_CHAIN} 2>/dev/null; {tool} -w -X {BOOT_CHAIN} 2>/dev/null"
        );
    }
    script.push_str("true\n");
    script
}

#[derive(Debug, Default)]
struct Applied {
    fingerprint: Option<String>,
}

pub struct KernelBackend {
    shell: Arc<dyn RootShell>,
    root: PrivilegeMonitor,
    timeout: Duration,
    boot_protection: bool,
    boot_script: PathBuf,
    applied: Mutex<Applied>,
    active: AtomicBool,
}

impl KernelBackend {
    pub fn new(shell: Arc<dyn RootShell>, root: PrivilegeMonitor, timeout: Duration) -> Self {
        Self {
            shell,
            root,
            timeout,
            boot_protection: false,
            boot_script: PathBuf::from(DEFAULT_BOOT_SCRIPT),
            applied: Mutex::new(Applied::default()),
            active: AtomicBool::new(false),
        }
    }

    /// Installs the boot-time blocking script on start, removes it on stop.
    pub fn with_boot_protection(mut self, enabled: bool, script: PathBuf) -> Self {
        self.boot_protection = enabled;
        self.boot_script = script;
        self
    }

    async fn run(&self, script: &str) -> Result<ShellOutput> {
        self.shell
            .exec(script, self.timeout)
            .await?
            .check(|message| Error::ApplyFailed {
                backend: BackendType::KernelRules,
                message,
            })
    }

    async fn install_boot_script(&self) -> Result<()> {
        let path = self.boot_script.display();
        let script = format!(
            "mkdir -p \"$(dirname '{path}')\"\ncat > '{path}' <<'APPWALL_EOF'\n{}APPWALL_EOF\nchmod 755 '{path}'\n",
            boot_chain_script()
        );
        self.run(&script).await?;
        info!("Installed boot protection script at {}", path);
        Ok(())
    }

    async fn remove_boot_script(&self) -> Result<()> {
        let path = self.boot_script.display();
        self.run(&format!("rm -f '{path}'\n")).await?;
        debug!("Removed boot protection script {}", path);
        Ok(())
    }
}

#[async_trait]
impl Backend for KernelBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::KernelRules
    }

    async fn check_availability(&self) -> Result<()> {
        require_privilege(PrivilegeKind::Root, self.root.status())
    }

    async fn start(&self) -> Result<()> {
        self.check_availability().await?;
        let _guard = self.applied.lock().await;
        if self.boot_protection {
            self.install_boot_script().await?;
        }
        self.active.store(true, Ordering::SeqCst);
        info!("Kernel backend started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut applied = self.applied.lock().await;
        let result = self.run(&build_teardown_script()).await.map(|_| ());
        if self.boot_protection
            && let Err(e) = self.remove_boot_script().await
        {
            warn!("Failed to remove boot protection script: {}", e);
        }
        applied.fingerprint = None;
        self.active.store(false, Ordering::SeqCst);
        info!("Kernel backend stopped");
        result
    }

    async fn apply_rules(&self, rules: &[Rule], ctx: &ApplyContext) -> Result<()> {
        let verdicts = evaluate_all(rules, ctx);
        for v in &verdicts {
            validate_app_uid(v.uid).map_err(|message| Error::ApplyFailed {
                backend: BackendType::KernelRules,
                message,
            })?;
        }

        let script = build_apply_script(&verdicts, ctx);
        let digest = fingerprint(&script)?;

        let mut applied = self.applied.lock().await;
        if applied.fingerprint.as_deref() == Some(digest.as_str()) {
            debug!("Kernel rules unchanged, skipping apply");
            return Ok(());
        }

        self.run(&script).await?;
        applied.fingerprint = Some(digest);
        info!(
            "Applied kernel rules: {} blocked of {} apps",
            verdicts.iter().filter(|v| v.blocked).count(),
            verdicts.len()
        );
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn normalize_boot_policy(&self) -> Result<()> {
        self.run(&boot_normalize_script()).await?;
        info!("Removed boot-time blocking chain");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::{DefaultPolicy, NetworkClass, RuleChange};
    use crate::privilege::PrivilegeStatus;
    use crate::privilege::testing::FixedSource;

    /// Records scripts instead of running them.
    #[derive(Default)]
    struct RecordingShell {
        scripts: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RootShell for RecordingShell {
        fn is_present(&self) -> bool {
            true
        }

        async fn exec(&self, script: &str, _timeout: Duration) -> Result<ShellOutput> {
            self.scripts.lock().unwrap().push(script.to_string());
            Ok(ShellOutput {
                exit_code: Some(0),
                ..ShellOutput::default()
            })
        }
    }

    async fn backend(status: PrivilegeStatus) -> (KernelBackend, Arc<RecordingShell>) {
        let monitor = PrivilegeMonitor::new(
            FixedSource::new(PrivilegeKind::Root, status),
            Duration::from_secs(1),
        );
        monitor.recheck().await;
        let shell = Arc::new(RecordingShell::default());
        (
            KernelBackend::new(shell.clone(), monitor, Duration::from_secs(5)),
            shell,
        )
    }

    fn wifi_ctx(default_policy: DefaultPolicy) -> ApplyContext {
        ApplyContext {
            network: NetworkClass::Wifi,
            screen_on: true,
            default_policy,
        }
    }

    fn rules() -> Vec<Rule> {
        let mut blocked = Rule::new("com.blocked", 0, 10_100, "Blocked");
        blocked.apply_change(RuleChange::Wifi(true));
        let mut lan = Rule::new("com.lan", 10, 10_200, "Lan");
        lan.apply_change(RuleChange::Lan(true));
        let open = Rule::new("com.open", 0, 10_300, "Open");
        vec![blocked, lan, open]
    }

    #[test]
    fn test_script_allow_all() {
        let ctx = wifi_ctx(DefaultPolicy::AllowAll);
        let script = build_apply_script(&evaluate_all(&rules(), &ctx), &ctx);

        assert!(script.contains("iptables -w -A appwall -m owner --uid-owner 10100 -j REJECT"));
        assert!(script.contains("ip6tables -w -A appwall -m owner --uid-owner 10100 -j REJECT"));
        assert!(script.contains("-d 192.168.0.0/16 -m owner --uid-owner 1010200 -j REJECT"));
        assert!(script.contains("-d fc00::/7 -m owner --uid-owner 1010200 -j REJECT"));
        assert!(!script.contains("10300"));
        assert!(!script.contains("RETURN"));
    }

    #[test]
    fn test_script_block_all_has_catch_all() {
        let ctx = wifi_ctx(DefaultPolicy::BlockAll);
        let script = build_apply_script(&evaluate_all(&rules(), &ctx), &ctx);

        // Disabled rule falls back to block-all
        assert!(script.contains("--uid-owner 10300 -j REJECT"));
        assert!(script.contains("--uid-owner 1010200 -j RETURN"));
        assert!(script.contains("--uid-owner 10000-19999 -j REJECT"));
        assert!(script.contains("--uid-owner 1010000-1019999 -j REJECT"));

        let ret = script.find("1010200 -j RETURN").unwrap();
        let catch_all = script.find("10000-19999 -j REJECT").unwrap();
        assert!(ret < catch_all);
    }

    #[tokio::test]
    async fn test_requires_root_permission() {
        let (backend, _) = backend(PrivilegeStatus::AvailableNoPermission).await;
        assert!(matches!(
            backend.check_availability().await,
            Err(Error::PermissionDenied(_))
        ));
        assert!(backend.start().await.is_err());
        assert!(!backend.is_active());
    }

    #[tokio::test]
    async fn test_identical_apply_is_skipped() {
        let (backend, shell) = backend(PrivilegeStatus::AvailableWithPermission).await;
        backend.start().await.unwrap();

        let ctx = wifi_ctx(DefaultPolicy::AllowAll);
        backend.apply_rules(&rules(), &ctx).await.unwrap();
        backend.apply_rules(&rules(), &ctx).await.unwrap();
        assert_eq!(shell.scripts.lock().unwrap().len(), 1);

        let mobile = ApplyContext {
            network: NetworkClass::Mobile,
            ..ctx
        };
        backend.apply_rules(&rules(), &mobile).await.unwrap();
        assert_eq!(shell.scripts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_tears_down_and_forgets_fingerprint() {
        let (backend, shell) = backend(PrivilegeStatus::AvailableWithPermission).await;
        backend.start().await.unwrap();
        let ctx = wifi_ctx(DefaultPolicy::AllowAll);
        backend.apply_rules(&rules(), &ctx).await.unwrap();
        backend.stop().await.unwrap();
        assert!(!backend.is_active());
        assert!(
            shell.scripts.lock().unwrap()[1].contains("iptables -w -D OUTPUT -j appwall")
        );

        backend.start().await.unwrap();
        backend.apply_rules(&rules(), &ctx).await.unwrap();
        assert_eq!(shell.scripts.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_boot_protection_script_lifecycle() {
        let (backend, shell) = backend(PrivilegeStatus::AvailableWithPermission).await;
        let backend =
            backend.with_boot_protection(true, PathBuf::from("/data/adb/service.d/test.sh"));
        backend.start().await.unwrap();
        backend.normalize_boot_policy().await.unwrap();
        backend.stop().await.unwrap();

        let scripts = shell.scripts.lock().unwrap();
        assert!(scripts[0].contains("cat > '/data/adb/service.d/test.sh'"));
        assert!(scripts[0].contains("appwall_boot -m owner --uid-owner 10000-99999999 -j REJECT"));
        assert!(scripts[1].contains("-D OUTPUT -j appwall_boot"));
        assert!(scripts.last().unwrap().contains("rm -f '/data/adb/service.d/test.sh'"));
    }
}
