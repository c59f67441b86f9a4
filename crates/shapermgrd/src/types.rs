//! Value types for sessions and policies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use shaper_common::{ShaperError, ShaperResult};

/// A validated, lowercase-normalized MAC address.
///
/// Ordering is lexical on the normalized form, which is what makes
/// policy builds deterministic regardless of input order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(String);

impl MacAddr {
    /// Parses and normalizes a MAC address (six colon-separated hex
    /// octets).
    pub fn parse(s: &str) -> ShaperResult<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        let octets: Vec<&str> = normalized.split(':').collect();
        let valid = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(ShaperError::invalid_policy(
                "mac",
                format!("'{}' is not a MAC address", s),
            ));
        }
        Ok(Self(normalized))
    }

    /// The normalized address string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MacAddr {
    type Err = ShaperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MacAddr {
    type Error = ShaperError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.0
    }
}

/// A bandwidth rate normalized to a `tc`-accepted `<n><unit>` string.
///
/// Unitless numeric input is interpreted as megabits per second.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rate(String);

impl Rate {
    /// Parses a rate: `"100"` and `"100mbit"` both normalize to
    /// `100mbit`; `kbit` and `gbit` suffixes are accepted.
    pub fn parse(s: &str) -> ShaperResult<Self> {
        let trimmed = s.trim().to_ascii_lowercase();
        if trimmed.is_empty() {
            return Err(ShaperError::invalid_policy("rate", "empty rate"));
        }
        let (digits, unit) = match trimmed.find(|c: char| !c.is_ascii_digit()) {
            Some(idx) => trimmed.split_at(idx),
            None => (trimmed.as_str(), "mbit"),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| ShaperError::invalid_policy("rate", format!("'{}' has no numeric value", s)))?;
        if value == 0 {
            return Err(ShaperError::invalid_policy("rate", "rate must be non-zero"));
        }
        match unit {
            "kbit" | "mbit" | "gbit" => Ok(Self(format!("{}{}", value, unit))),
            other => Err(ShaperError::invalid_policy(
                "rate",
                format!("unsupported rate unit '{}'", other),
            )),
        }
    }

    /// The normalized rate string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Rate {
    type Error = ShaperError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Rate> for String {
    fn from(rate: Rate) -> Self {
        rate.0
    }
}

/// Access-control mode of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// No device-specific treatment; chains stay empty.
    None,
    /// Listed devices keep full rate; everyone else is limited.
    Whitelist,
    /// Listed devices are limited; everyone else keeps full rate.
    Blacklist,
}

impl Mode {
    /// Returns the mode name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::None => "none",
            Mode::Whitelist => "whitelist",
            Mode::Blacklist => "blacklist",
        }
    }
}

impl FromStr for Mode {
    type Err = ShaperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Mode::None),
            "whitelist" => Ok(Mode::Whitelist),
            "blacklist" => Ok(Mode::Blacklist),
            other => Err(ShaperError::invalid_policy(
                "mode",
                format!("unknown mode '{}'", other),
            )),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declarative policy snapshot for one router.
///
/// Read in full from the external policy store by the caller; the
/// engine never partial-reads or writes it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Access-control mode.
    pub mode: Mode,
    /// Devices the mode applies to. Set semantics: duplicates collapse,
    /// iteration order is the normalized lexical order.
    pub device_set: BTreeSet<MacAddr>,
    /// Rate of the limited class.
    pub limited_rate: Rate,
    /// Rate of the unrestricted class.
    pub full_rate: Rate,
}

impl Policy {
    /// Builds a validated policy from raw inputs. Rejects malformed
    /// MACs and rates before any remote command is issued.
    pub fn new<'a, I>(mode: Mode, devices: I, limited_rate: &str, full_rate: &str) -> ShaperResult<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let device_set = devices
            .into_iter()
            .map(MacAddr::parse)
            .collect::<ShaperResult<BTreeSet<_>>>()?;
        Ok(Self {
            mode,
            device_set,
            limited_rate: Rate::parse(limited_rate)?,
            full_rate: Rate::parse(full_rate)?,
        })
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// The session may issue commands.
    Active,
    /// Explicitly ended by the client.
    Ended,
    /// Timed out by the expiry sweep.
    Expired,
}

impl SessionStatus {
    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
            SessionStatus::Expired => "expired",
        }
    }
}

/// A logical client-to-router authorization window.
///
/// Many sessions may address one router; the router's transport is
/// keyed by router id, not session id.
#[derive(Debug, Clone)]
pub struct Session {
    /// Server-generated session identifier.
    pub session_id: String,
    /// The router this session addresses.
    pub router_id: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last refresh or executed command.
    pub last_activity_at: Instant,
    /// Lifecycle status.
    pub status: SessionStatus,
}

impl Session {
    /// Creates a new active session.
    pub fn new(session_id: impl Into<String>, router_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            router_id: router_id.into(),
            created_at: Utc::now(),
            last_activity_at: Instant::now(),
            status: SessionStatus::Active,
        }
    }

    /// Whether the session may issue commands.
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

/// Read-only session view for the list surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Session identifier.
    pub session_id: String,
    /// Router identifier.
    pub router_id: String,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Seconds since the last refresh or command.
    pub idle_secs: u64,
}

impl From<&Session> for SessionInfo {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.session_id.clone(),
            router_id: s.router_id.clone(),
            status: s.status,
            created_at: s.created_at,
            idle_secs: s.last_activity_at.elapsed().as_secs(),
        }
    }
}
