//! Point-in-time visibility boundaries for reads.
//!
//! A [`SnapshotToken`] is derived from the store's transaction counter:
//! every transaction id below `xmin` had finished when the token was taken,
//! every id at or above `xmax` had not started, and ids in between are
//! finished unless listed in `xip` (in progress).

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotToken {
    xmin: u64,
    xmax: u64,
    xip: BTreeSet<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotTokenError {
    #[error("malformed snapshot token '{0}': expected 'xmin:xmax:xip'")]
    Malformed(String),
    #[error("invalid transaction id '{0}' in snapshot token")]
    InvalidId(String),
    #[error("snapshot xmin {xmin} is greater than xmax {xmax}")]
    InvertedBounds { xmin: u64, xmax: u64 },
    #[error("in-progress id {xid} lies outside [{xmin}, {xmax})")]
    InProgressOutOfRange { xid: u64, xmin: u64, xmax: u64 },
    #[error("in-progress id {xid} follows {previous}: ids must be strictly increasing")]
    InProgressNotIncreasing { previous: u64, xid: u64 },
}

impl SnapshotToken {
    pub fn new(
        xmin: u64,
        xmax: u64,
        xip: impl IntoIterator<Item = u64>,
    ) -> Result<Self, SnapshotTokenError> {
        if xmin > xmax {
            return Err(SnapshotTokenError::InvertedBounds { xmin, xmax });
        }
        let xip: BTreeSet<u64> = xip.into_iter().collect();
        if let Some(&xid) = xip.iter().find(|&&xid| xid < xmin || xid >= xmax) {
            return Err(SnapshotTokenError::InProgressOutOfRange { xid, xmin, xmax });
        }
        Ok(Self { xmin, xmax, xip })
    }

    /// A token with no transactions in flight: everything below `xmax` is visible.
    pub fn at(xmax: u64) -> Self {
        Self {
            xmin: xmax,
            xmax,
            xip: BTreeSet::new(),
        }
    }

    pub fn xmin(&self) -> u64 {
        self.xmin
    }

    pub fn xmax(&self) -> u64 {
        self.xmax
    }

    pub fn xip(&self) -> &BTreeSet<u64> {
        &self.xip
    }

    pub fn is_visible(&self, xid: u64) -> bool {
        if xid >= self.xmax {
            return false;
        }
        if xid < self.xmin {
            return true;
        }
        !self.xip.contains(&xid)
    }

    /// True when every transaction visible under `other` is also visible here.
    pub fn includes(&self, other: &SnapshotToken) -> bool {
        if self.xmax < other.xmax {
            return false;
        }
        !self
            .xip
            .iter()
            .any(|&xid| xid < other.xmax && other.is_visible(xid))
    }
}

impl fmt::Display for SnapshotToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:", self.xmin, self.xmax)?;
        for (i, xid) in self.xip.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{xid}")?;
        }
        Ok(())
    }
}

/// Accepts only the canonical decimal form: ASCII digits, no sign, and no
/// leading zeros.
fn parse_id(raw: &str) -> Result<u64, SnapshotTokenError> {
    let invalid = || SnapshotTokenError::InvalidId(raw.to_string());
    let canonical = !raw.is_empty()
        && raw.bytes().all(|b| b.is_ascii_digit())
        && (raw == "0" || !raw.starts_with('0'));
    if !canonical {
        return Err(invalid());
    }
    raw.parse().map_err(|_| invalid())
}

impl FromStr for SnapshotToken {
    type Err = SnapshotTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(xmin), Some(xmax), Some(xip)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(SnapshotTokenError::Malformed(s.to_string()));
        };

        let xmin = parse_id(xmin)?;
        let xmax = parse_id(xmax)?;
        let xip = if xip.is_empty() {
            Vec::new()
        } else {
            xip.split(',').map(parse_id).collect::<Result<Vec<_>, _>>()?
        };
        if let Some(pair) = xip.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(SnapshotTokenError::InProgressNotIncreasing {
                previous: pair[0],
                xid: pair[1],
            });
        }

        Self::new(xmin, xmax, xip)
    }
}

impl TryFrom<String> for SnapshotToken {
    type Error = SnapshotTokenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SnapshotToken> for String {
    fn from(token: SnapshotToken) -> Self {
        token.to_string()
    }
}
