//! Session identifiers: `YYYYMMDD-HHMMSS-xxxxxxxx`, a UTC creation timestamp followed by a
//! random suffix.

use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use rand::{Rng, distr::Alphanumeric};
use serde::{Deserialize, Serialize};

/// How long a session is kept after its creation.
pub const RETENTION_DAYS: i64 = 14;

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
const SUFFIX_LEN: usize = 8;

/// A malformed session id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid session id '{0}'")]
pub struct InvalidSessionId(pub String);

/// Identifies one session across the three parties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SessionId {
    id: String,
    created_at: DateTime<Utc>,
}

impl SessionId {
    /// A new id created now.
    pub fn generate() -> Self {
        Self::generate_at(Utc::now())
    }

    /// A new id with the creation timestamp `now` (truncated to seconds).
    pub fn generate_at(now: DateTime<Utc>) -> Self {
        let suffix: String = rand::rng()
            .sample_iter(Alphanumeric)
            .map(|c| char::from(c).to_ascii_lowercase())
            .take(SUFFIX_LEN)
            .collect();
        let id = format!("{}-{suffix}", now.format(TIMESTAMP_FORMAT));
        // the id was just formatted with the same layout
        id.parse().unwrap_or_else(|_| unreachable!("generated id {id} must parse"))
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// The creation timestamp embedded in the id.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time elapsed between creation and `now`.
    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.created_at
    }

    /// Whether the retention window has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age(now) > TimeDelta::days(RETENTION_DAYS)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl FromStr for SessionId {
    type Err = InvalidSessionId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidSessionId(s.to_string());
        let s = s.trim();
        let (timestamp, suffix) = s.rsplit_once('-').ok_or_else(invalid)?;
        if suffix.len() != SUFFIX_LEN
            || !suffix
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        {
            return Err(invalid());
        }
        let created_at = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
            .map_err(|_| invalid())?
            .and_utc();
        Ok(Self {
            id: s.to_string(),
            created_at,
        })
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.id
    }
}

impl TryFrom<String> for SessionId {
    type Error = InvalidSessionId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn generated_ids_embed_their_timestamp() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 17, 5, 42).unwrap();
        let id = SessionId::generate_at(now);
        assert!(id.as_str().starts_with("20240309-170542-"), "{id}");
        assert_eq!(id.as_str().len(), 24);
        assert_eq!(id.created_at(), now);
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
    }

    #[test]
    fn ids_are_unique_with_high_probability() {
        let now = Utc::now();
        let a = SessionId::generate_at(now);
        let b = SessionId::generate_at(now);
        assert_ne!(a, b);
    }

    #[test]
    fn expiry_after_fourteen_days() {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let id = SessionId::generate_at(created);
        assert!(!id.is_expired(created + TimeDelta::days(14)));
        assert!(id.is_expired(created + TimeDelta::days(14) + TimeDelta::seconds(1)));
        assert_eq!(id.age(created + TimeDelta::hours(5)), TimeDelta::hours(5));
    }

    #[test]
    fn rejects_malformed_ids() {
        for id in [
            "",
            "20240101-000000",
            "20240101-000000-ABCDEFGH",
            "20240101-000000-abc",
            "20241301-000000-abcdefgh",
            "../../etc-passwd-abcdefgh",
        ] {
            assert!(id.parse::<SessionId>().is_err(), "{id}");
        }
    }

    #[test]
    fn serializes_as_string() {
        let id = SessionId::generate();
        let bytes = bincode::serialize(&id).unwrap();
        let plain = bincode::serialize(id.as_str()).unwrap();
        assert_eq!(bytes, plain);
        assert_eq!(bincode::deserialize::<SessionId>(&bytes).unwrap(), id);
    }
}
