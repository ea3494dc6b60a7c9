//! NAT traversal through a port-forwarding client.
//!
//! On startup the node asks the gateway for a public UDP mapping of its
//! message socket. A few attempts are made with a fixed wait in between; if
//! none succeeds the node keeps running with only its local port advertised.
//! An obtained mapping is renewed before its lease runs out.

use crate::utils::{MessengerError, NetworkError, Result};
use async_trait::async_trait;
use igd_next::aio::tokio::{search_gateway, Tokio};
use igd_next::aio::Gateway;
use igd_next::{PortMappingProtocol, SearchOptions};
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lease requested for a gateway mapping
pub const MAPPING_LEASE: Duration = Duration::from_secs(3600);

const MAPPING_DESCRIPTION: &str = "overlay-messenger";

/// A port-forwarding client
#[async_trait]
pub trait PortMapper: Send + Sync {
    /// Prepare the client; fails if port forwarding is not possible at all
    async fn activate(&self) -> Result<()>;

    /// Try once to map `local_port`; `Ok(None)` means no answer yet
    async fn request_mapping(&self, local_port: u16) -> Result<Option<SocketAddr>>;

    /// Release the client and any mapping it holds
    async fn deactivate(&self);
}

/// Outcome of port mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMapping {
    /// Reachable from outside at `external`, and on the LAN at `local_port`
    Mapped {
        /// Endpoint on the gateway's public side
        external: SocketAddr,
        /// Port of the local socket
        local_port: u16,
    },
    /// Degraded: only the local port is advertised
    LocalOnly(u16),
}

impl PortMapping {
    /// Port peers outside the NAT should use
    pub fn public_port(&self) -> u16 {
        match self {
            Self::Mapped { external, .. } => external.port(),
            Self::LocalOnly(port) => *port,
        }
    }

    /// Port of the local socket, valid on the local network
    pub fn local_port(&self) -> u16 {
        match self {
            Self::Mapped { local_port, .. } | Self::LocalOnly(local_port) => *local_port,
        }
    }

    /// The gateway endpoint, if a mapping was obtained
    pub fn external(&self) -> Option<SocketAddr> {
        match self {
            Self::Mapped { external, .. } => Some(*external),
            Self::LocalOnly(_) => None,
        }
    }

    /// Whether a mapping was obtained
    pub fn is_mapped(&self) -> bool {
        matches!(self, Self::Mapped { .. })
    }
}

fn nat_error(reason: impl std::fmt::Display) -> MessengerError {
    NetworkError::NatTraversal {
        reason: reason.to_string(),
    }
    .into()
}

/// [`PortMapper`] asking an Internet Gateway Device for UDP mappings
pub struct IgdPortMapper {
    enabled: bool,
    search_timeout: Duration,
    gateway: tokio::sync::Mutex<Option<Gateway<Tokio>>>,
    mapped: Mutex<Option<u16>>,
}

impl IgdPortMapper {
    /// A mapper that searches the gateway for at most `search_timeout`
    pub fn new(enabled: bool, search_timeout: Duration) -> Self {
        Self {
            enabled,
            search_timeout,
            gateway: tokio::sync::Mutex::new(None),
            mapped: Mutex::new(None),
        }
    }

    /// External port currently held on the gateway
    pub fn mapped_port(&self) -> Option<u16> {
        *self.mapped.lock()
    }
}

#[async_trait]
impl PortMapper for IgdPortMapper {
    async fn activate(&self) -> Result<()> {
        if !self.enabled {
            return Err(nat_error("UPnP is disabled"));
        }

        let options = SearchOptions {
            timeout: Some(self.search_timeout),
            ..Default::default()
        };
        let gateway = search_gateway(options).await.map_err(nat_error)?;
        log::info!("Found UPnP gateway at {}", gateway.addr);
        *self.gateway.lock().await = Some(gateway);
        Ok(())
    }

    async fn request_mapping(&self, local_port: u16) -> Result<Option<SocketAddr>> {
        let guard = self.gateway.lock().await;
        let Some(gateway) = guard.as_ref() else {
            return Err(nat_error("no gateway"));
        };

        let local_ip = local_ip_address::local_ip().map_err(nat_error)?;
        let local = SocketAddr::new(local_ip, local_port);
        let lease = MAPPING_LEASE.as_secs() as u32;
        // Renewals ask for the port the gateway handed out before
        let wanted = self.mapped_port().unwrap_or(local_port);

        let external_port = match gateway
            .add_port(PortMappingProtocol::UDP, wanted, local, lease, MAPPING_DESCRIPTION)
            .await
        {
            Ok(()) => wanted,
            Err(e) => {
                log::debug!("Gateway refused UDP port {}: {}", wanted, e);
                gateway
                    .add_any_port(PortMappingProtocol::UDP, local, lease, MAPPING_DESCRIPTION)
                    .await
                    .map_err(nat_error)?
            }
        };
        *self.mapped.lock() = Some(external_port);

        let external_ip: IpAddr = gateway.get_external_ip().await.map_err(nat_error)?.into();
        Ok(Some(SocketAddr::new(external_ip, external_port)))
    }

    async fn deactivate(&self) {
        let port = self.mapped.lock().take();
        let guard = self.gateway.lock().await;
        let (Some(port), Some(gateway)) = (port, guard.as_ref()) else {
            return;
        };
        match gateway.remove_port(PortMappingProtocol::UDP, port).await {
            Ok(()) => log::info!("Released UDP port {} on the gateway", port),
            Err(e) => log::warn!("Could not release UDP port {}: {}", port, e),
        }
    }
}

/// Port mapping with bounded retries
pub struct NatTraversal {
    mapper: Arc<dyn PortMapper>,
    attempts: u32,
    retry_wait: Duration,
    renew_every: Duration,
}

impl NatTraversal {
    /// Create a traversal that tries `attempts` times, `retry_wait` apart
    pub fn new(mapper: Arc<dyn PortMapper>, attempts: u32, retry_wait: Duration) -> Self {
        Self {
            mapper,
            attempts: attempts.max(1),
            retry_wait,
            renew_every: MAPPING_LEASE / 2,
        }
    }

    /// Renew an obtained mapping every `interval`
    pub fn with_renewal(mut self, interval: Duration) -> Self {
        self.renew_every = interval;
        self
    }

    /// Obtain a public mapping for `local_port`, degrading to the local port
    pub async fn map_port(&self, local_port: u16, cancel: &CancellationToken) -> PortMapping {
        if let Err(e) = self.mapper.activate().await {
            log::warn!("Port forwarding unavailable, advertising local port {}: {}", local_port, e);
            return PortMapping::LocalOnly(local_port);
        }

        for attempt in 1..=self.attempts {
            match self.mapper.request_mapping(local_port).await {
                Ok(Some(external)) => {
                    log::info!("Port {} mapped to {}", local_port, external);
                    return PortMapping::Mapped {
                        external,
                        local_port,
                    };
                }
                Ok(None) => log::debug!("Port mapping attempt {}/{}: no answer", attempt, self.attempts),
                Err(e) => log::warn!("Port mapping attempt {}/{} failed: {}", attempt, self.attempts, e),
            }

            if attempt < self.attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return PortMapping::LocalOnly(local_port),
                    _ = tokio::time::sleep(self.retry_wait) => {}
                }
            }
        }

        log::warn!(
            "No port mapping after {} attempts, advertising local port {}",
            self.attempts,
            local_port
        );
        PortMapping::LocalOnly(local_port)
    }

    /// Map `local_port`, publish the outcome on `advertised` and keep an
    /// obtained mapping alive until `cancel` fires
    pub async fn run(
        &self,
        local_port: u16,
        advertised: watch::Sender<PortMapping>,
        cancel: CancellationToken,
    ) {
        let mapping = self.map_port(local_port, &cancel).await;
        advertised.send_replace(mapping);
        if !mapping.is_mapped() {
            return;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.renew_every) => {}
            }

            let renewed = match self.mapper.request_mapping(local_port).await {
                Ok(Some(external)) => PortMapping::Mapped {
                    external,
                    local_port,
                },
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("Port mapping renewal failed, advertising local port: {}", e);
                    PortMapping::LocalOnly(local_port)
                }
            };
            if *advertised.borrow() != renewed {
                log::info!("Advertised mapping changed to {:?}", renewed);
                advertised.send_replace(renewed);
            }
        }
    }

    /// Release the port-forwarding client
    pub async fn stop(&self) {
        self.mapper.deactivate().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Answers with a mapping from the `succeed_on`-th request on, failing
    /// every request after `fail_after`
    struct FakeMapper {
        active: bool,
        succeed_on: Option<u32>,
        fail_after: Option<u32>,
        requests: AtomicU32,
        deactivated: Mutex<bool>,
    }

    impl FakeMapper {
        fn new(active: bool, succeed_on: Option<u32>) -> Arc<Self> {
            Self::failing_after(active, succeed_on, None)
        }

        fn failing_after(active: bool, succeed_on: Option<u32>, fail_after: Option<u32>) -> Arc<Self> {
            Arc::new(Self {
                active,
                succeed_on,
                fail_after,
                requests: AtomicU32::new(0),
                deactivated: Mutex::new(false),
            })
        }
    }

    #[async_trait]
    impl PortMapper for FakeMapper {
        async fn activate(&self) -> Result<()> {
            if self.active {
                Ok(())
            } else {
                Err(nat_error("no gateway"))
            }
        }

        async fn request_mapping(&self, local_port: u16) -> Result<Option<SocketAddr>> {
            let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
            if matches!(self.fail_after, Some(limit) if n > limit) {
                return Err(nat_error("lease refused"));
            }
            match self.succeed_on {
                Some(k) if n >= k => Ok(Some(SocketAddr::from(([203, 0, 113, 7], local_port + 1)))),
                _ => Ok(None),
            }
        }

        async fn deactivate(&self) {
            *self.deactivated.lock() = true;
        }
    }

    fn traversal(mapper: Arc<FakeMapper>) -> NatTraversal {
        NatTraversal::new(mapper, 3, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_mapping_obtained_after_retry() {
        let mapper = FakeMapper::new(true, Some(2));
        let mapping = traversal(mapper.clone())
            .map_port(6303, &CancellationToken::new())
            .await;

        let external = SocketAddr::from(([203, 0, 113, 7], 6304));
        assert_eq!(mapping.external(), Some(external));
        assert_eq!(mapping.public_port(), 6304);
        assert_eq!(mapping.local_port(), 6303);
        assert_eq!(mapper.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_degrades_after_three_attempts() {
        let mapper = FakeMapper::new(true, None);
        let nat = traversal(mapper.clone());
        let mapping = nat.map_port(6303, &CancellationToken::new()).await;

        assert_eq!(mapping, PortMapping::LocalOnly(6303));
        assert!(!mapping.is_mapped());
        assert_eq!(mapping.external(), None);
        assert_eq!(mapper.requests.load(Ordering::SeqCst), 3);

        nat.stop().await;
        assert!(*mapper.deactivated.lock());
    }

    #[tokio::test]
    async fn test_inactive_client_degrades_immediately() {
        let mapper = FakeMapper::new(false, Some(1));
        let mapping = traversal(mapper.clone())
            .map_port(6303, &CancellationToken::new())
            .await;

        assert_eq!(mapping.public_port(), 6303);
        assert_eq!(mapper.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retries() {
        let mapper = FakeMapper::new(true, None);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let nat = NatTraversal::new(mapper.clone(), 3, Duration::from_secs(60));
        assert_eq!(nat.map_port(6303, &cancel).await, PortMapping::LocalOnly(6303));
        assert_eq!(mapper.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_publishes_and_renews_mapping() {
        let mapper = FakeMapper::failing_after(true, Some(1), Some(2));
        let nat = traversal(mapper.clone()).with_renewal(Duration::from_millis(50));
        let (tx, mut rx) = watch::channel(PortMapping::LocalOnly(6303));
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { nat.run(6303, tx, cancel).await })
        };

        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_mapped());

        // The third request, the second renewal, is refused
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*rx.borrow(), PortMapping::LocalOnly(6303));
        assert!(mapper.requests.load(Ordering::SeqCst) >= 3);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_without_mapping_returns() {
        let mapper = FakeMapper::new(false, None);
        let (tx, rx) = watch::channel(PortMapping::LocalOnly(0));

        traversal(mapper)
            .run(6303, tx, CancellationToken::new())
            .await;
        assert_eq!(*rx.borrow(), PortMapping::LocalOnly(6303));
    }

    #[tokio::test]
    async fn test_igd_mapper_needs_activation() {
        let disabled = IgdPortMapper::new(false, Duration::from_millis(10));
        assert!(disabled.activate().await.is_err());
        assert!(disabled.request_mapping(6303).await.is_err());
        assert_eq!(disabled.mapped_port(), None);
        disabled.deactivate().await;
    }
}
