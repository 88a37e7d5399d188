//! Port allow-list and race-safe port allocation

use portway_proto::ProtocolError;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::fmt;
use std::net::TcpListener;
use std::ops::RangeInclusive;
use std::sync::Mutex;
use thiserror::Error;

/// Invalid port allow-list expression.
#[derive(Debug, Error)]
#[error("invalid port range expression: {0:?}")]
pub struct InvalidPortRange(pub String);

/// Set of allowed ports, parsed from a comma-separated list of single ports
/// and inclusive `low-high` ranges, e.g. `"4000-4010,8080"`.
#[derive(Debug, Clone)]
pub struct PortRange {
    ranges: Vec<RangeInclusive<u16>>,
}

impl PortRange {
    pub fn parse(expr: &str) -> Result<Self, InvalidPortRange> {
        let mut ranges = Vec::new();
        for token in expr.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            match token.split_once('-') {
                Some((low, high)) => {
                    let low: u16 = low
                        .trim()
                        .parse()
                        .map_err(|_| InvalidPortRange(expr.to_string()))?;
                    let high: u16 = high
                        .trim()
                        .parse()
                        .map_err(|_| InvalidPortRange(expr.to_string()))?;
                    if low > high {
                        return Err(InvalidPortRange(expr.to_string()));
                    }
                    ranges.push(low..=high);
                }
                None => {
                    let port: u16 = token
                        .parse()
                        .map_err(|_| InvalidPortRange(expr.to_string()))?;
                    ranges.push(port..=port);
                }
            }
        }
        if ranges.is_empty() {
            return Err(InvalidPortRange(expr.to_string()));
        }
        Ok(Self { ranges })
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ranges.iter().any(|range| range.contains(&port))
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ranges.iter().flat_map(|range| range.clone())
    }
}

impl Default for PortRange {
    /// Full ephemeral range.
    fn default() -> Self {
        Self {
            ranges: vec![1024..=65535],
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            if range.start() == range.end() {
                write!(f, "{}", range.start())?;
            } else {
                write!(f, "{}-{}", range.start(), range.end())?;
            }
        }
        Ok(())
    }
}

/// Race-safe allocator over an allow-list of TCP ports.
///
/// A candidate is reserved before its bind probe runs, so two concurrent
/// allocations can never be handed the same port; the lock is held only for
/// the set insert/remove, never across the probe. Allocated ports stay
/// reserved until [`PortAllocator::release`].
pub struct PortAllocator {
    range: PortRange,
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn range(&self) -> &PortRange {
        &self.range
    }

    /// Pick a uniformly random unreserved port that is actually bindable
    /// right now.
    pub fn allocate(&self) -> Result<u16, ProtocolError> {
        let mut candidates: Vec<u16> = self.range.ports().collect();
        candidates.shuffle(&mut rand::thread_rng());

        for port in candidates {
            {
                let mut reserved = self.reserved.lock().unwrap();
                if !reserved.insert(port) {
                    continue;
                }
            }
            match TcpListener::bind(("0.0.0.0", port)) {
                Ok(probe) => {
                    drop(probe);
                    return Ok(port);
                }
                Err(_) => {
                    self.reserved.lock().unwrap().remove(&port);
                }
            }
        }
        Err(ProtocolError::PortUnavailable(self.range.to_string()))
    }

    /// Return a previously allocated port to the pool.
    pub fn release(&self, port: u16) {
        self.reserved.lock().unwrap().remove(&port);
    }
}
