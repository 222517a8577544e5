//! Who may create sessions, and how often.
//!
//! Addresses are matched against IPv4 patterns of four dot-separated octets, each `*`, a
//! number or an inclusive range `a-b`. Every created session is appended to a connection log,
//! which is also the source of the per-address rate limits.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    str::FromStr,
};

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use privas::session_id::SessionId;
use tokio::{
    io::AsyncWriteExt,
    sync::{Mutex, MutexGuard},
};
use tracing::{info, warn};

/// Why a connection may not create a session.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("address {0} is blacklisted")]
    Blacklisted(IpAddr),
    #[error("address {0} is not whitelisted")]
    NotWhitelisted(IpAddr),
    /// Too many sessions were created from this address recently.
    #[error("address {address} exceeded the limit of {limit} sessions per {window}")]
    RateLimited {
        address: IpAddr,
        window: &'static str,
        limit: u32,
    },
    /// The connection log could not be read or written.
    #[error("unable to access the connection log")]
    Log(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OctetPattern {
    Any,
    Exact(u8),
    Range(u8, u8),
}

impl OctetPattern {
    fn matches(self, octet: u8) -> bool {
        match self {
            OctetPattern::Any => true,
            OctetPattern::Exact(n) => octet == n,
            OctetPattern::Range(a, b) => a <= octet && octet <= b,
        }
    }
}

impl FromStr for OctetPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octet = |n: &str| {
            n.trim()
                .parse::<u8>()
                .map_err(|_| format!("invalid octet '{n}'"))
        };
        match s.trim() {
            "*" => Ok(OctetPattern::Any),
            range if range.contains('-') => {
                let (a, b) = range.split_once('-').unwrap_or_default();
                let (a, b) = (octet(a)?, octet(b)?);
                if a > b {
                    return Err(format!("empty range '{range}'"));
                }
                Ok(OctetPattern::Range(a, b))
            }
            n => Ok(OctetPattern::Exact(octet(n)?)),
        }
    }
}

impl fmt::Display for OctetPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OctetPattern::Any => f.write_str("*"),
            OctetPattern::Exact(n) => write!(f, "{n}"),
            OctetPattern::Range(a, b) => write!(f, "{a}-{b}"),
        }
    }
}

/// An IPv4 address pattern such as `192.168.*.10-20`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPattern([OctetPattern; 4]);

impl AddressPattern {
    /// Whether `address` matches. IPv6 addresses only match through their IPv4 mapping.
    pub fn matches(&self, address: IpAddr) -> bool {
        let v4: Option<Ipv4Addr> = match address {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(v6) => v6.to_ipv4_mapped(),
        };
        v4.is_some_and(|v4| {
            self.0
                .iter()
                .zip(v4.octets())
                .all(|(pattern, octet)| pattern.matches(octet))
        })
    }
}

impl FromStr for AddressPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octets: Vec<OctetPattern> = s
            .trim()
            .split('.')
            .map(str::parse)
            .collect::<Result<_, _>>()?;
        let octets: [OctetPattern; 4] = octets
            .try_into()
            .map_err(|_| format!("'{s}' must have four octets"))?;
        Ok(Self(octets))
    }
}

impl fmt::Display for AddressPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

/// Parses a comma-separated list of patterns, the empty string is the empty list.
pub fn parse_patterns(s: &str) -> Result<Vec<AddressPattern>, String> {
    s.split(',')
        .filter(|p| !p.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// Maximum number of sessions per address and window, `0` disables a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimits {
    pub per_day: u32,
    pub per_week: u32,
    pub per_month: u32,
}

impl RateLimits {
    fn windows(&self) -> [(&'static str, TimeDelta, u32); 3] {
        [
            ("day", TimeDelta::days(1), self.per_day),
            ("week", TimeDelta::days(7), self.per_week),
            ("month", TimeDelta::days(30), self.per_month),
        ]
    }
}

/// The lists, limits and log deciding who may create sessions.
#[derive(Debug)]
pub struct AccessPolicy {
    whitelist: Vec<AddressPattern>,
    blacklist: Vec<AddressPattern>,
    limits: RateLimits,
    log: ConnectionLog,
}

impl AccessPolicy {
    pub fn new(
        whitelist: Vec<AddressPattern>,
        blacklist: Vec<AddressPattern>,
        limits: RateLimits,
        log: PathBuf,
    ) -> Self {
        Self {
            whitelist,
            blacklist,
            limits,
            log: ConnectionLog::new(log),
        }
    }

    /// Decides whether `address` may create a session at `now`.
    pub async fn check(&self, address: IpAddr, now: DateTime<Utc>) -> Result<(), AccessError> {
        self.admit(address, now).await.map(drop)
    }

    /// Like [`AccessPolicy::check`], but keeps the connection log locked until the returned
    /// [`Admission`] is recorded or dropped, so that concurrent requests of one address can
    /// not all pass the same rate limit.
    pub async fn admit(
        &self,
        address: IpAddr,
        now: DateTime<Utc>,
    ) -> Result<Admission<'_>, AccessError> {
        if self.blacklist.iter().any(|p| p.matches(address)) {
            warn!(%address, "rejected blacklisted address");
            return Err(AccessError::Blacklisted(address));
        }
        let guard = self.log.lock.lock().await;
        let admission = Admission {
            log: &self.log,
            address,
            now,
            _guard: guard,
        };
        if !self.whitelist.is_empty() {
            if self.whitelist.iter().any(|p| p.matches(address)) {
                return Ok(admission);
            }
            warn!(%address, "rejected address missing from whitelist");
            return Err(AccessError::NotWhitelisted(address));
        }
        let windows = self.limits.windows();
        if windows.iter().all(|(_, _, limit)| *limit == 0) {
            return Ok(admission);
        }
        let entries = self.log.entries_for(address).await?;
        for (window, length, limit) in windows {
            if limit == 0 {
                continue;
            }
            let since = now - length;
            let count = entries.iter().filter(|t| **t > since).count();
            if count >= limit as usize {
                warn!(%address, window, limit, "rate limit exceeded");
                return Err(AccessError::RateLimited {
                    address,
                    window,
                    limit,
                });
            }
        }
        Ok(admission)
    }

    /// Records that `address` created `session` at `now`.
    pub async fn record(
        &self,
        address: IpAddr,
        session: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<(), AccessError> {
        let _guard = self.log.lock.lock().await;
        self.log.append(address, session, now).await?;
        info!(%address, %session, "session created");
        Ok(())
    }
}

/// A passed access check, holding the connection log until the session is recorded.
#[derive(Debug)]
pub struct Admission<'a> {
    log: &'a ConnectionLog,
    address: IpAddr,
    now: DateTime<Utc>,
    _guard: MutexGuard<'a, ()>,
}

impl Admission<'_> {
    /// Logs the created session and releases the connection log.
    pub async fn record(self, session: &SessionId) -> Result<(), AccessError> {
        self.log.append(self.address, session, self.now).await?;
        info!(address = %self.address, %session, "session created");
        Ok(())
    }
}

/// Append-only log of created sessions: `rfc3339<TAB>address<TAB>sessionId` lines.
///
/// Readers and writers hold `lock`.
#[derive(Debug)]
struct ConnectionLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ConnectionLog {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    async fn append(
        &self,
        address: IpAddr,
        session: &SessionId,
        now: DateTime<Utc>,
    ) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let line = format!(
            "{}\t{address}\t{session}\n",
            now.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    /// Timestamps of the sessions created by `address`. Malformed lines are skipped.
    async fn entries_for(&self, address: IpAddr) -> std::io::Result<Vec<DateTime<Utc>>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(err),
        };
        Ok(text
            .lines()
            .filter_map(|line| {
                let mut fields = line.split('\t');
                let timestamp = DateTime::parse_from_rfc3339(fields.next()?).ok()?;
                let logged: IpAddr = fields.next()?.parse().ok()?;
                (logged == address).then(|| timestamp.with_timezone(&Utc))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn patterns() {
        let p: AddressPattern = "192.168.*.10-20".parse().unwrap();
        assert!(p.matches(ip("192.168.3.10")));
        assert!(p.matches(ip("192.168.255.20")));
        assert!(!p.matches(ip("192.168.3.21")));
        assert!(!p.matches(ip("10.168.3.15")));
        assert!(p.matches(ip("::ffff:192.168.1.15")));
        assert!(!p.matches(ip("::1")));
        assert_eq!(p.to_string(), "192.168.*.10-20");
        for invalid in ["1.2.3", "1.2.3.4.5", "1.2.3.256", "1.2.3.9-2", "a.b.c.d"] {
            assert!(invalid.parse::<AddressPattern>().is_err(), "{invalid}");
        }
        assert_eq!(parse_patterns("").unwrap(), vec![]);
        assert_eq!(parse_patterns("10.*.*.*, 127.0.0.1").unwrap().len(), 2);
    }

    fn policy(white: &str, black: &str, limits: RateLimits) -> (AccessPolicy, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let policy = AccessPolicy::new(
            parse_patterns(white).unwrap(),
            parse_patterns(black).unwrap(),
            limits,
            dir.path().join("connections.log"),
        );
        (policy, dir)
    }

    #[tokio::test]
    async fn lists() {
        let now = Utc::now();
        let (open, _dir) = policy("", "10.0.0.*", RateLimits::default());
        assert!(open.check(ip("192.168.0.1"), now).await.is_ok());
        assert!(matches!(
            open.check(ip("10.0.0.7"), now).await,
            Err(AccessError::Blacklisted(_))
        ));
        let (closed, _dir) = policy("192.168.*.*", "192.168.0.66", RateLimits::default());
        assert!(closed.check(ip("192.168.1.1"), now).await.is_ok());
        assert!(matches!(
            closed.check(ip("172.16.0.1"), now).await,
            Err(AccessError::NotWhitelisted(_))
        ));
        assert!(matches!(
            closed.check(ip("192.168.0.66"), now).await,
            Err(AccessError::Blacklisted(_))
        ));
    }

    #[tokio::test]
    async fn rate_limits() {
        let limits = RateLimits {
            per_day: 2,
            per_week: 3,
            per_month: 0,
        };
        let (policy, _dir) = policy("", "", limits);
        let now = Utc::now();
        let client = ip("192.168.0.1");
        let other = ip("192.168.0.2");
        policy
            .record(client, &SessionId::generate(), now - TimeDelta::days(3))
            .await
            .unwrap();
        policy
            .record(client, &SessionId::generate(), now - TimeDelta::hours(1))
            .await
            .unwrap();
        assert!(policy.check(client, now).await.is_ok());
        policy
            .record(client, &SessionId::generate(), now)
            .await
            .unwrap();
        let err = policy.check(client, now).await.unwrap_err();
        assert!(
            matches!(err, AccessError::RateLimited { window: "day", .. }),
            "{err}"
        );
        assert!(policy.check(other, now).await.is_ok());
        // the day window is free again, the week window is not
        let err = policy
            .check(client, now + TimeDelta::days(2))
            .await
            .unwrap_err();
        assert!(
            matches!(err, AccessError::RateLimited { window: "week", .. }),
            "{err}"
        );
        assert!(policy.check(client, now + TimeDelta::days(8)).await.is_ok());
    }

    #[tokio::test]
    async fn whitelisted_addresses_bypass_limits() {
        let limits = RateLimits {
            per_day: 1,
            per_week: 0,
            per_month: 0,
        };
        let (policy, _dir) = policy("127.0.0.1", "", limits);
        let now = Utc::now();
        for _ in 0..3 {
            policy
                .record(ip("127.0.0.1"), &SessionId::generate(), now)
                .await
                .unwrap();
        }
        assert!(policy.check(ip("127.0.0.1"), now).await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_admissions_share_the_limit() {
        let limits = RateLimits {
            per_day: 1,
            per_week: 0,
            per_month: 0,
        };
        let (shared, _dir) = policy("", "", limits);
        let shared = std::sync::Arc::new(shared);
        let now = Utc::now();
        let client = ip("192.168.0.1");
        let attempts: Vec<_> = (0..4)
            .map(|_| {
                let policy = std::sync::Arc::clone(&shared);
                tokio::spawn(async move {
                    let admission = policy.admit(client, now).await?;
                    tokio::task::yield_now().await;
                    admission.record(&SessionId::generate()).await
                })
            })
            .collect();
        let mut admitted = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(()) => admitted += 1,
                Err(err) => assert!(matches!(err, AccessError::RateLimited { .. }), "{err}"),
            }
        }
        assert_eq!(admitted, 1);

        // an admission that is dropped leaves the log untouched
        let (fresh, _fresh_dir) = policy("", "", limits);
        drop(fresh.admit(client, now).await.unwrap());
        assert!(fresh.check(client, now).await.is_ok());
    }

    proptest! {
        #[test]
        fn wildcards_and_ranges_cover_the_address(
            octets: [u8; 4],
            wildcard in 0..4usize,
            below in 0..=255u8,
            above in 0..=255u8,
        ) {
            let address = IpAddr::from(octets);
            let mut parts: Vec<String> = octets.iter().map(u8::to_string).collect();
            let exact: AddressPattern = parts.join(".").parse().unwrap();
            prop_assert!(exact.matches(address));

            let n = octets[wildcard];
            parts[wildcard] = format!("{}-{}", n.saturating_sub(below), n.saturating_add(above));
            let range: AddressPattern = parts.join(".").parse().unwrap();
            prop_assert!(range.matches(address));
            prop_assert_eq!(range.to_string().parse::<AddressPattern>().unwrap(), range);

            parts[wildcard] = "*".to_string();
            let any: AddressPattern = parts.join(".").parse().unwrap();
            prop_assert!(any.matches(address));
        }
    }
}
