//! Per-device logical clocks
//!
//! A [`VectorStamp`] is a snapshot of `device id → counter`. The
//! [`VectorClock`] owns the local device's counter, advances it by exactly one
//! per completed dispatcher job, and persists it into the meta partition.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use rkyv::rancor::Error as RkyvError;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::Partition;

const CLOCK_KEY: &[u8] = b"clock";
const DEVICE_KEY: &[u8] = b"device";

/// An immutable vector-clock value.
#[derive(
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
)]
#[rkyv(derive(Debug))]
#[serde(transparent)]
pub struct VectorStamp(pub BTreeMap<String, u64>);

impl VectorStamp {
    #[must_use]
    pub fn get(&self, device: &str) -> u64 {
        self.0.get(device).copied().unwrap_or(0)
    }

    /// Component-wise maximum.
    #[must_use]
    pub fn join(&self, other: &Self) -> Self {
        let mut out = self.0.clone();
        for (device, &counter) in &other.0 {
            let slot = out.entry(device.clone()).or_insert(0);
            *slot = (*slot).max(counter);
        }
        Self(out)
    }

    /// Happens-before order; `None` for concurrent stamps.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        let mut less = false;
        let mut greater = false;
        for device in self.0.keys().chain(other.0.keys()) {
            match self.get(device).cmp(&other.get(device)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
        }
        match (less, greater) {
            (false, false) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (true, true) => None,
        }
    }
}

impl std::fmt::Display for VectorStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, (device, counter)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{device}:{counter}")?;
        }
        write!(f, "]")
    }
}

/// The local device's clock.
#[derive(Debug, Clone)]
pub struct VectorClock {
    local: String,
    counters: BTreeMap<String, u64>,
}

impl VectorClock {
    #[must_use]
    pub fn new(local: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            counters: BTreeMap::new(),
        }
    }

    /// Load the persisted clock for `local` from the meta partition.
    ///
    /// # Errors
    /// Returns `NoHeader`, `Codec` or a storage error.
    pub fn load(meta: &Partition, local: impl Into<String>) -> Result<Self> {
        let mut clock = Self::new(local);
        if let Some(bytes) = meta.try_get(CLOCK_KEY)? {
            let stamp = decode_stamp(&bytes)?;
            clock.counters = stamp.0;
        }
        debug!(device = %clock.local, counter = clock.local_counter(), "loaded clock");
        Ok(clock)
    }

    /// # Errors
    /// Returns `NoHeader`, `Codec` or a storage error.
    pub fn persist(&self, meta: &Partition) -> Result<()> {
        let bytes = rkyv::to_bytes::<RkyvError>(&self.snapshot())
            .map_err(|e| Error::Codec(e.to_string()))?;
        meta.put(CLOCK_KEY, &bytes)
    }

    #[must_use]
    pub fn local(&self) -> &str {
        &self.local
    }

    #[must_use]
    pub fn local_counter(&self) -> u64 {
        self.counters.get(&self.local).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn snapshot(&self) -> VectorStamp {
        VectorStamp(self.counters.clone())
    }

    /// Advance the local component by one.
    pub fn tick(&mut self) -> VectorStamp {
        *self.counters.entry(self.local.clone()).or_insert(0) += 1;
        self.snapshot()
    }

    /// Fold in a remote stamp. The local component only moves forward.
    pub fn merge(&mut self, remote: &VectorStamp) {
        for (device, &counter) in &remote.0 {
            let slot = self.counters.entry(device.clone()).or_insert(0);
            *slot = (*slot).max(counter);
        }
    }
}

/// The device id: configured, or a persisted random UUID.
///
/// # Errors
/// Returns `NoHeader` or a storage error.
pub fn device_id(meta: &Partition, configured: Option<&str>) -> Result<String> {
    if let Some(id) = configured {
        return Ok(id.to_string());
    }
    if let Some(bytes) = meta.try_get(DEVICE_KEY)? {
        return String::from_utf8(bytes).map_err(|e| Error::Codec(e.to_string()));
    }
    let id = uuid::Uuid::new_v4().to_string();
    meta.put(DEVICE_KEY, id.as_bytes())?;
    Ok(id)
}

fn decode_stamp(bytes: &[u8]) -> Result<VectorStamp> {
    let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    rkyv::from_bytes::<VectorStamp, RkyvError>(&aligned).map_err(|e| Error::Codec(e.to_string()))
}
