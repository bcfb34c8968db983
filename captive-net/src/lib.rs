pub mod dns;
pub mod firewall;
pub mod link;
pub mod sync;

pub use dns::DnsInterceptor;
pub use firewall::{IptablesBackend, MemoryBackend, RuleBackend};
pub use link::{LinkProbe, StaticLinkProbe, SysfsLinkProbe};
pub use sync::{RuleSynchronizer, SyncReport};
