//! Local VPN backend
//!
//! The tunnel claims default routes for IPv4 and IPv6 and never forwards
//! anything it receives. Allowed applications are excluded from the tunnel
//! (the bypass set) and keep their normal connectivity; every other app's
//! traffic ends up in the tunnel and is dropped.
//!
//! This backend cannot distinguish network classes per app beyond that
//! allow list, and it occupies the OS's single VPN slot. It never evicts a
//! VPN owned by another app.

use super::{Backend, fingerprint};
use crate::core::error::{Error, Result};
use crate::core::evaluator::{ApplyContext, allowed_packages};
use crate::core::rule::Rule;
use crate::core::state::BackendType;
use async_trait::async_trait;
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::Serialize;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const SESSION_NAME: &str = "appwall";
pub const TUNNEL_MTU: u16 = 1500;

const TUNNEL_V4: Ipv4Addr = Ipv4Addr::new(10, 111, 222, 1);
const TUNNEL_V6: Ipv6Addr = Ipv6Addr::new(0xfd00, 0x1, 0xfd00, 0x1, 0xfd00, 0x1, 0xfd00, 0x1);

/// Everything the platform needs to (re)establish the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelConfig {
    pub session: String,
    pub mtu: u16,
    pub addresses: Vec<IpNetwork>,
    pub routes: Vec<IpNetwork>,
    /// Packages excluded from the tunnel
    pub bypass_packages: Vec<String>,
}

impl TunnelConfig {
    pub fn new(bypass_packages: Vec<String>) -> Result<Self> {
        let net = |e: ipnetwork::IpNetworkError| Error::Internal(format!("tunnel address: {e}"));
        Ok(Self {
            session: SESSION_NAME.to_string(),
            mtu: TUNNEL_MTU,
            addresses: vec![
                IpNetwork::V4(Ipv4Network::new(TUNNEL_V4, 32).map_err(net)?),
                IpNetwork::V6(Ipv6Network::new(TUNNEL_V6, 128).map_err(net)?),
            ],
            routes: vec![
                IpNetwork::V4(Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).map_err(net)?),
                IpNetwork::V6(Ipv6Network::new(Ipv6Addr::UNSPECIFIED, 0).map_err(net)?),
            ],
            bypass_packages,
        })
    }
}

/// OS VPN service hooks
#[async_trait]
pub trait VpnPlatform: Send + Sync {
    /// Whether this host can run a VPN service at all.
    fn is_supported(&self) -> bool;

    /// Whether a VPN owned by another app currently holds the slot.
    async fn foreign_vpn_active(&self) -> bool;

    /// Whether the one-time OS consent has already been given.
    async fn consent_granted(&self) -> bool;

    /// Establishes the tunnel, replacing an existing one of ours.
    async fn establish(&self, config: &TunnelConfig) -> Result<()>;

    async fn teardown(&self) -> Result<()>;
}

/// Platform for hosts without a VPN service (CLI, tests on desktop)
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessVpnPlatform;

#[async_trait]
impl VpnPlatform for HeadlessVpnPlatform {
    fn is_supported(&self) -> bool {
        false
    }

    async fn foreign_vpn_active(&self) -> bool {
        false
    }

    async fn consent_granted(&self) -> bool {
        false
    }

    async fn establish(&self, _config: &TunnelConfig) -> Result<()> {
        Err(Error::Unavailable("no VPN service on this host".to_string()))
    }

    async fn teardown(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Tunnel {
    fingerprint: Option<String>,
}

pub struct VpnBackend {
    platform: Arc<dyn VpnPlatform>,
    tunnel: Mutex<Tunnel>,
    active: AtomicBool,
}

impl VpnBackend {
    pub fn new(platform: Arc<dyn VpnPlatform>) -> Self {
        Self {
            platform,
            tunnel: Mutex::new(Tunnel::default()),
            active: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Backend for VpnBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Vpn
    }

    fn supports_granular_control(&self) -> bool {
        false
    }

    async fn check_availability(&self) -> Result<()> {
        if !self.platform.is_supported() {
            return Err(Error::Unavailable(
                "VPN service not supported on this host".to_string(),
            ));
        }
        // Our own tunnel is not a competitor
        if !self.is_active() && self.platform.foreign_vpn_active().await {
            return Err(Error::CompetingResourceHeld(
                "another app's VPN is active".to_string(),
            ));
        }
        Ok(())
    }

    async fn needs_consent(&self) -> bool {
        !self.platform.consent_granted().await
    }

    async fn start(&self) -> Result<()> {
        self.check_availability().await?;
        if !self.platform.consent_granted().await {
            return Err(Error::PermissionDenied(
                "VPN consent has not been granted".to_string(),
            ));
        }
        let _guard = self.tunnel.lock().await;
        self.active.store(true, Ordering::SeqCst);
        info!("VPN backend started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut tunnel = self.tunnel.lock().await;
        let result = self.platform.teardown().await;
        tunnel.fingerprint = None;
        self.active.store(false, Ordering::SeqCst);
        info!("VPN backend stopped");
        result
    }

    async fn apply_rules(&self, rules: &[Rule], ctx: &ApplyContext) -> Result<()> {
        let config = TunnelConfig::new(allowed_packages(rules, ctx))?;
        let digest = fingerprint(&config)?;

        let mut tunnel = self.tunnel.lock().await;
        if tunnel.fingerprint.as_deref() == Some(digest.as_str()) {
            debug!("Tunnel config unchanged, skipping re-establish");
            return Ok(());
        }

        self.platform
            .establish(&config)
            .await
            .map_err(|e| match e {
                Error::PermissionDenied(_) | Error::CompetingResourceHeld(_) => e,
                other => Error::ApplyFailed {
                    backend: BackendType::Vpn,
                    message: other.to_string(),
                },
            })?;
        tunnel.fingerprint = Some(digest);
        info!(
            "Established VPN tunnel with {} bypassing packages",
            config.bypass_packages.len()
        );
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
