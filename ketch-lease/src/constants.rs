/// How often the service loop retransmits an outstanding prepare or
/// propose round, in uptime seconds.
pub const RETRANSMIT_INTERVAL: u16 = 1;

/// Renew a held lease this many seconds before it would otherwise expire.
pub const LEASE_RENEW_BEFORE: u16 = 3;

/// Duration a freshly proposed lease is valid for, in uptime seconds.
pub const LEASE_PERIOD: u16 = 9;

/// Slack added to an acceptor's promise window past the requested
/// timeout, covering clock skew and in-flight retransmits.
pub const LEASE_GRACE: u16 = 1;
