use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Reports whether a network interface can carry traffic.
#[async_trait]
pub trait LinkProbe: Send + Sync {
    async fn is_link_up(&self, interface: &str) -> io::Result<bool>;
}

/// Reads `operstate` (and `carrier` when the driver reports `unknown`) from
/// sysfs.
#[derive(Debug, Clone)]
pub struct SysfsLinkProbe {
    root: PathBuf,
}

impl Default for SysfsLinkProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsLinkProbe {
    pub fn new() -> Self {
        Self::with_root("/sys/class/net")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        SysfsLinkProbe { root: root.into() }
    }

    async fn read_attr(&self, interface: &str, attr: &str) -> io::Result<Option<String>> {
        match tokio::fs::read_to_string(self.root.join(interface).join(attr)).await {
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl LinkProbe for SysfsLinkProbe {
    async fn is_link_up(&self, interface: &str) -> io::Result<bool> {
        let Some(operstate) = self.read_attr(interface, "operstate").await? else {
            debug!("Interface {} not present", interface);
            return Ok(false);
        };
        match operstate.as_str() {
            "up" => Ok(true),
            // Some drivers (tun, ppp) never report an operstate.
            "unknown" => match self.read_attr(interface, "carrier").await {
                Ok(carrier) => Ok(carrier.as_deref() == Some("1")),
                // carrier is unreadable while the interface is down
                Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(false),
                Err(e) => Err(e),
            },
            _ => Ok(false),
        }
    }
}

/// A probe whose answer is set by hand.
#[derive(Debug, Default)]
pub struct StaticLinkProbe {
    up: AtomicBool,
}

impl StaticLinkProbe {
    pub fn new(up: bool) -> Self {
        StaticLinkProbe {
            up: AtomicBool::new(up),
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

#[async_trait]
impl LinkProbe for StaticLinkProbe {
    async fn is_link_up(&self, _interface: &str) -> io::Result<bool> {
        Ok(self.up.load(Ordering::SeqCst))
    }
}

/// Probes `interface` within `timeout`. Errors and timeouts count as down.
pub async fn probe_uplink(probe: &dyn LinkProbe, interface: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, probe.is_link_up(interface)).await {
        Ok(Ok(up)) => up,
        Ok(Err(e)) => {
            warn!("Link probe for {} failed: {}", interface, e);
            false
        }
        Err(_) => {
            warn!("Link probe for {} timed out after {:?}", interface, timeout);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sysfs_with(iface: &str, operstate: &str, carrier: Option<&str>) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let iface_dir = dir.path().join(iface);
        std::fs::create_dir_all(&iface_dir).unwrap();
        std::fs::write(iface_dir.join("operstate"), format!("{}\n", operstate)).unwrap();
        if let Some(carrier) = carrier {
            std::fs::write(iface_dir.join("carrier"), format!("{}\n", carrier)).unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_sysfs_operstate() {
        let dir = sysfs_with("eth0", "up", None);
        let probe = SysfsLinkProbe::with_root(dir.path());
        assert!(probe.is_link_up("eth0").await.unwrap());

        let dir = sysfs_with("eth0", "down", Some("0"));
        let probe = SysfsLinkProbe::with_root(dir.path());
        assert!(!probe.is_link_up("eth0").await.unwrap());
    }

    #[tokio::test]
    async fn test_sysfs_unknown_defers_to_carrier() {
        let dir = sysfs_with("tun0", "unknown", Some("1"));
        let probe = SysfsLinkProbe::with_root(dir.path());
        assert!(probe.is_link_up("tun0").await.unwrap());

        let dir = sysfs_with("tun0", "unknown", None);
        let probe = SysfsLinkProbe::with_root(dir.path());
        assert!(!probe.is_link_up("tun0").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_interface_is_down() {
        let dir = tempfile::tempdir().unwrap();
        let probe = SysfsLinkProbe::with_root(dir.path());
        assert!(!probe.is_link_up("eth9").await.unwrap());
        assert!(!probe_uplink(&probe, "eth9", Duration::from_millis(100)).await);
    }

    struct HangingProbe;

    #[async_trait]
    impl LinkProbe for HangingProbe {
        async fn is_link_up(&self, _interface: &str) -> io::Result<bool> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_probe_timeout_counts_as_down() {
        assert!(!probe_uplink(&HangingProbe, "eth0", Duration::from_millis(20)).await);

        let probe = StaticLinkProbe::new(false);
        assert!(!probe_uplink(&probe, "eth0", Duration::from_millis(20)).await);
        probe.set_up(true);
        assert!(probe_uplink(&probe, "eth0", Duration::from_millis(20)).await);
    }
}
