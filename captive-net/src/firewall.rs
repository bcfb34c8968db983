use async_trait::async_trait;
use captive_core::{Protocol, RedirectPolicy, Rule, RuleInstallError};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

pub const ADMITTED_SET: &str = "captive_admitted";
pub const NAT_CHAIN: &str = "captive_nat";
pub const FILTER_CHAIN: &str = "captive_fwd";

/// Where rules end up. Implementations must treat `install` of a present rule
/// and `remove` of an absent one as successful no-ops.
#[async_trait]
pub trait RuleBackend: Send + Sync {
    async fn install(&self, rule: &Rule) -> Result<(), RuleInstallError>;
    async fn remove(&self, rule: &Rule) -> Result<(), RuleInstallError>;
    async fn list_active(&self) -> Result<BTreeSet<Rule>, RuleInstallError>;
}

/// Every non-membership rule the iptables backend knows how to express.
const FIXED_RULES: [Rule; 6] = [
    Rule::RedirectDns(Protocol::Udp),
    Rule::RedirectDns(Protocol::Tcp),
    Rule::RedirectHttp,
    Rule::RedirectHttps,
    Rule::DropUnadmitted,
    Rule::UplinkNat,
];

/// A single iptables rule: table, chain and match/target arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IptablesSpec {
    pub table: &'static str,
    pub chain: String,
    pub args: Vec<String>,
}

impl IptablesSpec {
    fn command(&self, op: &str) -> Vec<String> {
        let mut cmd = vec![
            "-t".to_string(),
            self.table.to_string(),
            op.to_string(),
            self.chain.clone(),
        ];
        cmd.extend(self.args.iter().cloned());
        cmd
    }
}

/// Admitted clients live in an ipset; the redirect, drop and NAT rules are
/// plain iptables entries in dedicated chains.
pub struct IptablesBackend {
    gateway: Ipv4Addr,
    dns_port: u16,
    portal_port: u16,
    lan_interface: String,
    uplink_interface: String,
    command_timeout: Duration,
}

impl IptablesBackend {
    pub fn new(policy: &RedirectPolicy) -> Self {
        IptablesBackend {
            gateway: policy.gateway,
            dns_port: policy.dns_port,
            portal_port: policy.portal_port,
            lan_interface: policy.lan_interface.clone(),
            uplink_interface: policy.uplink_interface.clone(),
            command_timeout: policy.rule_timeout(),
        }
    }

    /// The iptables form of `rule`, or `None` for membership rules.
    pub fn spec_for(&self, rule: &Rule) -> Result<Option<IptablesSpec>, RuleInstallError> {
        let dnat = |proto: &str, dport: u16, to_port: u16| {
            vec![
                "-p".to_string(),
                proto.to_string(),
                "--dport".to_string(),
                dport.to_string(),
                "-j".to_string(),
                "DNAT".to_string(),
                "--to-destination".to_string(),
                format!("{}:{}", self.gateway, to_port),
            ]
        };
        let spec = match rule {
            Rule::AllowClient(_) => return Ok(None),
            Rule::RedirectDns(Protocol::Other) => {
                return Err(RuleInstallError::Rejected(rule.to_string()))
            }
            Rule::RedirectDns(proto) => IptablesSpec {
                table: "nat",
                chain: NAT_CHAIN.to_string(),
                args: dnat(proto.as_str(), 53, self.dns_port),
            },
            Rule::RedirectHttp => IptablesSpec {
                table: "nat",
                chain: NAT_CHAIN.to_string(),
                args: dnat("tcp", 80, self.portal_port),
            },
            Rule::RedirectHttps => IptablesSpec {
                table: "nat",
                chain: NAT_CHAIN.to_string(),
                args: dnat("tcp", 443, self.portal_port),
            },
            Rule::DropUnadmitted => IptablesSpec {
                table: "filter",
                chain: FILTER_CHAIN.to_string(),
                args: vec!["-j".to_string(), "DROP".to_string()],
            },
            Rule::UplinkNat => IptablesSpec {
                table: "nat",
                chain: "POSTROUTING".to_string(),
                args: vec![
                    "-o".to_string(),
                    self.uplink_interface.clone(),
                    "-j".to_string(),
                    "MASQUERADE".to_string(),
                ],
            },
        };
        Ok(Some(spec))
    }

    /// Creates the ipset and the chains every rule hangs off. Safe to call on a
    /// host where a previous run left them behind.
    pub async fn prepare(&self) -> Result<(), RuleInstallError> {
        info!("Preparing firewall structure on {}", self.lan_interface);

        self.run("ipset", &["create", ADMITTED_SET, "hash:ip", "-exist"])
            .await?;

        self.ensure_chain("nat", NAT_CHAIN).await?;
        self.ensure_chain("filter", FILTER_CHAIN).await?;

        let lan = self.lan_interface.as_str();
        self.ensure_rule("nat", "PREROUTING", &["-i", lan, "-j", NAT_CHAIN])
            .await?;
        self.ensure_rule("filter", "FORWARD", &["-i", lan, "-j", FILTER_CHAIN])
            .await?;

        // Members skip the redirects and the drop.
        let member = ["-m", "set", "--match-set", ADMITTED_SET, "src"];
        let mut bypass_nat = member.to_vec();
        bypass_nat.extend(["-j", "RETURN"]);
        self.ensure_first("nat", NAT_CHAIN, &bypass_nat).await?;
        let mut accept = member.to_vec();
        accept.extend(["-j", "ACCEPT"]);
        self.ensure_first("filter", FILTER_CHAIN, &accept).await?;

        Ok(())
    }

    /// Tears down everything `prepare` and `install` created. Keeps going past
    /// individual failures so a partial structure is still removed.
    pub async fn cleanup(&self) -> Result<(), RuleInstallError> {
        info!("Cleaning up firewall rules");
        let lan = self.lan_interface.as_str();

        if let Ok(Some(nat)) = self.spec_for(&Rule::UplinkNat) {
            let args = nat.command("-D");
            self.run_args("iptables", &args).await.ok();
        }

        self.run("iptables", &["-t", "nat", "-D", "PREROUTING", "-i", lan, "-j", NAT_CHAIN])
            .await
            .ok();
        self.run("iptables", &["-t", "nat", "-F", NAT_CHAIN]).await.ok();
        self.run("iptables", &["-t", "nat", "-X", NAT_CHAIN]).await.ok();

        self.run("iptables", &["-t", "filter", "-D", "FORWARD", "-i", lan, "-j", FILTER_CHAIN])
            .await
            .ok();
        self.run("iptables", &["-t", "filter", "-F", FILTER_CHAIN]).await.ok();
        self.run("iptables", &["-t", "filter", "-X", FILTER_CHAIN]).await.ok();

        self.run("ipset", &["destroy", ADMITTED_SET]).await
    }

    async fn ensure_chain(&self, table: &str, chain: &str) -> Result<(), RuleInstallError> {
        if self.probe("iptables", &["-t", table, "-n", "-L", chain]).await? {
            debug!("Chain {}/{} already present", table, chain);
            return Ok(());
        }
        self.run("iptables", &["-t", table, "-N", chain]).await
    }

    async fn ensure_rule(&self, table: &str, chain: &str, args: &[&str]) -> Result<(), RuleInstallError> {
        let mut check = vec!["-t", table, "-C", chain];
        check.extend_from_slice(args);
        if self.probe("iptables", &check).await? {
            return Ok(());
        }
        let mut append = vec!["-t", table, "-A", chain];
        append.extend_from_slice(args);
        self.run("iptables", &append).await
    }

    async fn ensure_first(&self, table: &str, chain: &str, args: &[&str]) -> Result<(), RuleInstallError> {
        let mut check = vec!["-t", table, "-C", chain];
        check.extend_from_slice(args);
        if self.probe("iptables", &check).await? {
            return Ok(());
        }
        let mut insert = vec!["-t", table, "-I", chain, "1"];
        insert.extend_from_slice(args);
        self.run("iptables", &insert).await
    }

    async fn spawn(&self, program: &str, args: &[String], capture: bool) -> Result<std::process::Output, RuleInstallError> {
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        if !capture {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        match tokio::time::timeout(self.command_timeout, cmd.output()).await {
            Ok(output) => Ok(output?),
            Err(_) => {
                error!("'{} {}' timed out", program, args.join(" "));
                Err(RuleInstallError::Timeout(self.command_timeout))
            }
        }
    }

    /// Runs a command whose exit status is an answer rather than an outcome.
    async fn probe(&self, program: &str, args: &[&str]) -> Result<bool, RuleInstallError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        Ok(self.spawn(program, &args, false).await?.status.success())
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<(), RuleInstallError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.run_args(program, &args).await
    }

    async fn run_args(&self, program: &str, args: &[String]) -> Result<(), RuleInstallError> {
        let output = self.spawn(program, args, true).await?;
        if !output.status.success() {
            let err = RuleInstallError::Command {
                program: program.to_string(),
                args: args.join(" "),
                status: format!(
                    "{} ({})",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            };
            error!("{}", err);
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl RuleBackend for IptablesBackend {
    async fn install(&self, rule: &Rule) -> Result<(), RuleInstallError> {
        if let Rule::AllowClient(ip) = rule {
            info!("Adding {} to {}", ip, ADMITTED_SET);
            return self
                .run("ipset", &["add", ADMITTED_SET, &ip.to_string(), "-exist"])
                .await;
        }
        let Some(spec) = self.spec_for(rule)? else {
            return Ok(());
        };
        if self.probe_spec(&spec).await? {
            return Ok(());
        }
        info!("Installing rule: {}", rule);
        self.run_args("iptables", &spec.command("-A")).await
    }

    async fn remove(&self, rule: &Rule) -> Result<(), RuleInstallError> {
        if let Rule::AllowClient(ip) = rule {
            info!("Removing {} from {}", ip, ADMITTED_SET);
            return self
                .run("ipset", &["del", ADMITTED_SET, &ip.to_string(), "-exist"])
                .await;
        }
        let Some(spec) = self.spec_for(rule)? else {
            return Ok(());
        };
        if !self.probe_spec(&spec).await? {
            return Ok(());
        }
        info!("Removing rule: {}", rule);
        self.run_args("iptables", &spec.command("-D")).await
    }

    async fn list_active(&self) -> Result<BTreeSet<Rule>, RuleInstallError> {
        let args = vec!["list".to_string(), ADMITTED_SET.to_string()];
        let output = self.spawn("ipset", &args, true).await?;
        if !output.status.success() {
            return Err(RuleInstallError::Command {
                program: "ipset".to_string(),
                args: args.join(" "),
                status: output.status.to_string(),
            });
        }
        let mut active: BTreeSet<Rule> = parse_ipset_members(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .map(Rule::AllowClient)
            .collect();

        for rule in FIXED_RULES {
            if let Some(spec) = self.spec_for(&rule)? {
                if self.probe_spec(&spec).await? {
                    active.insert(rule);
                }
            }
        }
        Ok(active)
    }
}

impl IptablesBackend {
    async fn probe_spec(&self, spec: &IptablesSpec) -> Result<bool, RuleInstallError> {
        Ok(self
            .spawn("iptables", &spec.command("-C"), false)
            .await?
            .status
            .success())
    }
}

/// Addresses listed under `Members:` in `ipset list` output.
pub fn parse_ipset_members(listing: &str) -> Vec<Ipv4Addr> {
    listing
        .lines()
        .skip_while(|line| !line.starts_with("Members:"))
        .skip(1)
        .filter_map(|line| {
            let addr = line.split_whitespace().next()?;
            match addr.parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!("Ignoring unparsable ipset member '{}'", line);
                    None
                }
            }
        })
        .collect()
}

/// One effective change applied to a `MemoryBackend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Installed(Rule),
    Removed(Rule),
}

#[derive(Debug, Default)]
struct MemoryState {
    rules: BTreeSet<Rule>,
    journal: Vec<Change>,
    installs: usize,
    removals: usize,
    fail_next: usize,
    failing: bool,
    ignore_installs: bool,
}

impl MemoryState {
    fn check_fault(&mut self, what: &str) -> Result<(), RuleInstallError> {
        if self.failing {
            return Err(RuleInstallError::Rejected(what.to_string()));
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(RuleInstallError::Rejected(what.to_string()));
        }
        Ok(())
    }
}

/// An in-process backend with the same idempotence contract as iptables.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rules(&self) -> BTreeSet<Rule> {
        self.state.lock().rules.clone()
    }

    /// Successful `install` calls that changed the rule set.
    pub fn install_count(&self) -> usize {
        self.state.lock().installs
    }

    /// Successful `remove` calls that changed the rule set.
    pub fn removal_count(&self) -> usize {
        self.state.lock().removals
    }

    /// Effective changes, oldest first.
    pub fn changes(&self) -> Vec<Change> {
        self.state.lock().journal.clone()
    }

    /// The next `n` calls fail.
    pub fn fail_next(&self, n: usize) {
        self.state.lock().fail_next = n;
    }

    /// Every call fails until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    /// Installs report success without taking effect.
    pub fn set_ignore_installs(&self, ignore: bool) {
        self.state.lock().ignore_installs = ignore;
    }

    /// Changes the rule set behind the synchronizer's back.
    pub fn inject(&self, rule: Rule) {
        self.state.lock().rules.insert(rule);
    }

    pub fn forget(&self, rule: &Rule) {
        self.state.lock().rules.remove(rule);
    }
}

#[async_trait]
impl RuleBackend for MemoryBackend {
    async fn install(&self, rule: &Rule) -> Result<(), RuleInstallError> {
        let mut state = self.state.lock();
        state.check_fault(&rule.to_string())?;
        if state.ignore_installs {
            return Ok(());
        }
        if state.rules.insert(*rule) {
            state.installs += 1;
            state.journal.push(Change::Installed(*rule));
        }
        Ok(())
    }

    async fn remove(&self, rule: &Rule) -> Result<(), RuleInstallError> {
        let mut state = self.state.lock();
        state.check_fault(&rule.to_string())?;
        if state.rules.remove(rule) {
            state.removals += 1;
            state.journal.push(Change::Removed(*rule));
        }
        Ok(())
    }

    async fn list_active(&self) -> Result<BTreeSet<Rule>, RuleInstallError> {
        let mut state = self.state.lock();
        state.check_fault("list")?;
        Ok(state.rules.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> IptablesBackend {
        let policy = RedirectPolicy {
            portal_port: 8080,
            dns_port: 5353,
            ..RedirectPolicy::default()
        };
        IptablesBackend::new(&policy)
    }

    #[test]
    fn test_redirects_target_gateway_services() {
        let fw = backend();
        let dns = fw.spec_for(&Rule::RedirectDns(Protocol::Udp)).unwrap().unwrap();
        assert_eq!(dns.table, "nat");
        assert_eq!(dns.chain, NAT_CHAIN);
        assert_eq!(
            dns.command("-A").join(" "),
            "-t nat -A captive_nat -p udp --dport 53 -j DNAT --to-destination 10.0.0.1:5353"
        );

        let https = fw.spec_for(&Rule::RedirectHttps).unwrap().unwrap();
        assert_eq!(
            https.command("-C").join(" "),
            "-t nat -C captive_nat -p tcp --dport 443 -j DNAT --to-destination 10.0.0.1:8080"
        );
    }

    #[test]
    fn test_nat_and_drop_specs() {
        let fw = backend();
        let nat = fw.spec_for(&Rule::UplinkNat).unwrap().unwrap();
        assert_eq!(nat.command("-D").join(" "), "-t nat -D POSTROUTING -o eth0 -j MASQUERADE");
        let drop = fw.spec_for(&Rule::DropUnadmitted).unwrap().unwrap();
        assert_eq!(drop.command("-A").join(" "), "-t filter -A captive_fwd -j DROP");
    }

    #[test]
    fn test_membership_rules_have_no_iptables_form() {
        let fw = backend();
        assert_eq!(
            fw.spec_for(&Rule::AllowClient(Ipv4Addr::new(10, 0, 0, 10))).unwrap(),
            None
        );
        assert!(fw.spec_for(&Rule::RedirectDns(Protocol::Other)).is_err());
    }

    #[test]
    fn test_parse_ipset_members() {
        let listing = "Name: captive_admitted\nType: hash:ip\nRevision: 4\n\
                       Header: family inet hashsize 1024 maxelem 65536\n\
                       Size in memory: 168\nReferences: 2\nNumber of entries: 2\n\
                       Members:\n10.0.0.10\n10.0.0.23 timeout 0\n";
        assert_eq!(
            parse_ipset_members(listing),
            vec![Ipv4Addr::new(10, 0, 0, 10), Ipv4Addr::new(10, 0, 0, 23)]
        );
        assert!(parse_ipset_members("Name: captive_admitted\nMembers:\n").is_empty());
    }

    #[tokio::test]
    async fn test_memory_backend_is_idempotent() {
        let backend = MemoryBackend::new();
        let rule = Rule::AllowClient(Ipv4Addr::new(10, 0, 0, 10));
        backend.install(&rule).await.unwrap();
        backend.install(&rule).await.unwrap();
        assert_eq!(backend.install_count(), 1);
        assert_eq!(backend.list_active().await.unwrap().len(), 1);

        backend.remove(&rule).await.unwrap();
        backend.remove(&rule).await.unwrap();
        assert_eq!(backend.removal_count(), 1);
        assert!(backend.rules().is_empty());
    }

    #[tokio::test]
    async fn test_memory_backend_fault_injection() {
        let backend = MemoryBackend::new();
        backend.fail_next(2);
        assert!(backend.install(&Rule::RedirectHttp).await.is_err());
        assert!(backend.list_active().await.is_err());
        assert!(backend.install(&Rule::RedirectHttp).await.is_ok());

        backend.set_failing(true);
        assert!(backend.remove(&Rule::RedirectHttp).await.is_err());
        backend.set_failing(false);
        assert!(backend.rules().contains(&Rule::RedirectHttp));
    }
}
