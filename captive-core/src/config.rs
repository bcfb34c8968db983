use crate::error::PortalError;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

/// The log level for the application, corresponding to syslog levels.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Emerg,
    Alert,
    Crit,
    Err,
    Warning,
    Notice,
    Info,
    Debug,
}

impl LogLevel {
    /// The `tracing` filter directive closest to this syslog level.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Emerg | LogLevel::Alert | LogLevel::Crit | LogLevel::Err => "error",
            LogLevel::Warning => "warn",
            LogLevel::Notice | LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// How credential submissions are checked.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorKind {
    /// Any submission carrying a username is accepted.
    AcceptAll,
    /// `username:password` lines from `users_file`.
    LocalUsers,
}

/// Connectivity-check hosts probed by client operating systems.
pub const DEFAULT_PROBE_DOMAINS: &[&str] = &[
    "captive.apple.com",
    "www.apple.com",
    "connectivitycheck.gstatic.com",
    "connectivitycheck.android.com",
    "clients3.google.com",
    "www.msftconnecttest.com",
    "www.msftncsi.com",
    "detectportal.firefox.com",
    "nmcheck.gnome.org",
];

/// Paths served by the portal itself.
pub const RESERVED_PATHS: &[&str] = &["/", "/portal", "/login", "/logout", "/status"];

// Helper functions for default values
fn default_loglevel() -> LogLevel { LogLevel::Info }
fn default_gateway() -> Ipv4Addr { Ipv4Addr::new(10, 0, 0, 1) }
fn default_netmask() -> Ipv4Addr { Ipv4Addr::new(255, 255, 255, 0) }
fn default_portal_port() -> u16 { 80 }
fn default_dns_port() -> u16 { 53 }
fn default_upstream_dns() -> Option<Ipv4Addr> { Some(Ipv4Addr::new(8, 8, 8, 8)) }
fn default_upstream_dns_port() -> u16 { 53 }
fn default_hijacked_domains() -> Vec<String> {
    DEFAULT_PROBE_DOMAINS.iter().map(|d| d.to_string()).collect()
}
fn default_landing_domain() -> Option<String> { Some("portal.wifi".to_string()) }
fn default_uplink_interface() -> String { "eth0".to_string() }
fn default_lan_interface() -> String { "wlan0".to_string() }
fn default_dhcpstart() -> Ipv4Addr { Ipv4Addr::new(10, 0, 0, 10) }
fn default_dhcpend() -> Ipv4Addr { Ipv4Addr::new(10, 0, 0, 250) }
fn default_lease() -> u64 { 43200 }
fn default_grant_ttl() -> u64 { 300 }
fn default_session_ttl() -> u64 { 3600 }
fn default_reap_interval() -> u64 { 5 }
fn default_sync_interval() -> u64 { 10 }
fn default_link_probe_timeout_ms() -> u64 { 1000 }
fn default_validation_timeout() -> u64 { 5 }
fn default_dns_timeout_ms() -> u64 { 2000 }
fn default_rule_timeout_ms() -> u64 { 2000 }
fn default_rule_retry_attempts() -> u32 { 5 }
fn default_rule_retry_base_ms() -> u64 { 100 }
fn default_validator() -> ValidatorKind { ValidatorKind::AcceptAll }
fn default_audit_log() -> Option<String> { Some("/var/log/captive/submissions.log".to_string()) }
fn default_cmdsocket() -> Option<String> { Some("/var/run/captive.sock".to_string()) }
fn default_success_path() -> String { "/success".to_string() }

/// Process-wide configuration, built once at startup and shared read-only.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RedirectPolicy {
    #[serde(default = "default_loglevel")]
    pub loglevel: LogLevel,

    /// Address of the gateway on the managed segment.
    #[serde(default = "default_gateway")]
    pub gateway: Ipv4Addr,
    #[serde(default = "default_netmask")]
    pub netmask: Ipv4Addr,
    #[serde(default = "default_portal_port")]
    pub portal_port: u16,
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,
    #[serde(default = "default_upstream_dns")]
    pub upstream_dns: Option<Ipv4Addr>,
    #[serde(default = "default_upstream_dns_port")]
    pub upstream_dns_port: u16,
    #[serde(default = "default_dns_timeout_ms")]
    pub dns_timeout_ms: u64,

    #[serde(default = "default_hijacked_domains")]
    pub hijacked_domains: Vec<String>,
    #[serde(default = "default_landing_domain")]
    pub landing_domain: Option<String>,
    #[serde(default)]
    pub hijack_after_admission: bool,
    #[serde(default)]
    pub hijack_ttl: u32,

    #[serde(default = "default_uplink_interface")]
    pub uplink_interface: String,
    #[serde(default = "default_lan_interface")]
    pub lan_interface: String,
    /// Keep dropping non-portal traffic from unadmitted clients even when the
    /// uplink is up.
    #[serde(default)]
    pub isolate_unadmitted: bool,

    // Consumed by the DHCP collaborator, carried here so one file describes
    // the segment.
    #[serde(default = "default_dhcpstart")]
    pub dhcpstart: Ipv4Addr,
    #[serde(default = "default_dhcpend")]
    pub dhcpend: Ipv4Addr,
    #[serde(default = "default_lease")]
    pub lease: u64,

    #[serde(default = "default_grant_ttl")]
    pub grant_ttl: u64,
    #[serde(default = "default_session_ttl")]
    pub session_ttl: u64,
    #[serde(default)]
    pub sliding_ttl: bool,

    #[serde(default = "default_reap_interval")]
    pub reap_interval: u64,
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,
    #[serde(default = "default_link_probe_timeout_ms")]
    pub link_probe_timeout_ms: u64,
    #[serde(default = "default_validation_timeout")]
    pub validation_timeout: u64,
    #[serde(default = "default_rule_timeout_ms")]
    pub rule_timeout_ms: u64,
    #[serde(default = "default_rule_retry_attempts")]
    pub rule_retry_attempts: u32,
    #[serde(default = "default_rule_retry_base_ms")]
    pub rule_retry_base_ms: u64,

    #[serde(default = "default_validator")]
    pub validator: ValidatorKind,
    pub users_file: Option<String>,
    #[serde(default = "default_audit_log")]
    pub audit_log: Option<String>,
    #[serde(default = "default_cmdsocket")]
    pub cmdsocket: Option<String>,
    #[serde(default = "default_success_path")]
    pub success_path: String,
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self {
            loglevel: default_loglevel(),
            gateway: default_gateway(),
            netmask: default_netmask(),
            portal_port: default_portal_port(),
            dns_port: default_dns_port(),
            upstream_dns: default_upstream_dns(),
            upstream_dns_port: default_upstream_dns_port(),
            dns_timeout_ms: default_dns_timeout_ms(),
            hijacked_domains: default_hijacked_domains(),
            landing_domain: default_landing_domain(),
            hijack_after_admission: false,
            hijack_ttl: 0,
            uplink_interface: default_uplink_interface(),
            lan_interface: default_lan_interface(),
            isolate_unadmitted: false,
            dhcpstart: default_dhcpstart(),
            dhcpend: default_dhcpend(),
            lease: default_lease(),
            grant_ttl: default_grant_ttl(),
            session_ttl: default_session_ttl(),
            sliding_ttl: false,
            reap_interval: default_reap_interval(),
            sync_interval: default_sync_interval(),
            link_probe_timeout_ms: default_link_probe_timeout_ms(),
            validation_timeout: default_validation_timeout(),
            rule_timeout_ms: default_rule_timeout_ms(),
            rule_retry_attempts: default_rule_retry_attempts(),
            rule_retry_base_ms: default_rule_retry_base_ms(),
            validator: default_validator(),
            users_file: None,
            audit_log: default_audit_log(),
            cmdsocket: default_cmdsocket(),
            success_path: default_success_path(),
        }
    }
}

impl RedirectPolicy {
    /// Rejects configurations the gateway cannot run with.
    pub fn validate(&self) -> Result<(), PortalError> {
        let invalid = |msg: String| Err(PortalError::InvalidPolicy(msg));

        if u32::from(self.dhcpstart) > u32::from(self.dhcpend) {
            return invalid(format!(
                "dhcpstart {} is after dhcpend {}",
                self.dhcpstart, self.dhcpend
            ));
        }
        for addr in [self.dhcpstart, self.dhcpend] {
            if !self.in_segment(addr) {
                return invalid(format!(
                    "{} is outside the {}/{} segment",
                    addr, self.gateway, self.netmask
                ));
            }
        }
        if self.grant_ttl == 0 {
            return invalid("grant_ttl must be positive".to_string());
        }
        if self.reap_interval == 0 || self.sync_interval == 0 {
            return invalid("reap_interval and sync_interval must be positive".to_string());
        }
        if self.uplink_interface == self.lan_interface {
            return invalid(format!(
                "uplink and LAN interface are both {}",
                self.lan_interface
            ));
        }
        if self.validator == ValidatorKind::LocalUsers && self.users_file.is_none() {
            return invalid("validator local_users requires users_file".to_string());
        }
        if !self.success_path.starts_with('/') {
            return invalid(format!("success_path {} is not absolute", self.success_path));
        }
        if RESERVED_PATHS.contains(&self.success_path.as_str()) {
            return invalid(format!("success_path {} is reserved", self.success_path));
        }
        Ok(())
    }

    pub fn in_segment(&self, addr: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(addr) & mask == u32::from(self.gateway) & mask
    }

    /// Every domain answered with the gateway address, lowercased and without
    /// a trailing dot.
    pub fn hijack_set(&self) -> Vec<String> {
        let mut domains: Vec<String> = self
            .hijacked_domains
            .iter()
            .chain(self.landing_domain.iter())
            .map(|d| d.trim_end_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        domains.sort();
        domains.dedup();
        domains
    }

    /// Resolver for non-hijacked queries. `0.0.0.0` disables forwarding.
    pub fn upstream(&self) -> Option<SocketAddrV4> {
        self.upstream_dns
            .filter(|addr| !addr.is_unspecified())
            .map(|addr| SocketAddrV4::new(addr, self.upstream_dns_port))
    }

    /// Absolute URL of the login page, used for redirects.
    pub fn portal_url(&self) -> String {
        if self.portal_port == 80 {
            format!("http://{}/portal", self.gateway)
        } else {
            format!("http://{}:{}/portal", self.gateway, self.portal_port)
        }
    }

    pub fn grant_ttl(&self) -> Duration {
        Duration::from_secs(self.grant_ttl)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval)
    }

    pub fn link_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.link_probe_timeout_ms)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }

    pub fn rule_timeout(&self) -> Duration {
        Duration::from_millis(self.rule_timeout_ms)
    }

    pub fn rule_retry_base(&self) -> Duration {
        Duration::from_millis(self.rule_retry_base_ms)
    }

    /// Longest a submission can take: validation, then every attempt at the
    /// allow rule with the backoff between them.
    pub fn admission_budget(&self) -> Duration {
        let attempts = self.rule_retry_attempts.max(1);
        let backoff: Duration = (0..attempts - 1)
            .map(|i| self.rule_retry_base().saturating_mul(1u32 << i.min(31)))
            .sum();
        self.validation_timeout() + self.rule_timeout().saturating_mul(attempts) + backoff
    }
}
