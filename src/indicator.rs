//! AG telephony indicators and generic (HF) status indicators.
//!
//! The global indicator table lives in the [`AgConfig`](crate::AgConfig) and
//! never changes once the driver exists. Each session keeps a snapshot of it
//! so status values and the per-connection `enabled` bits (writable through
//! `AT+BIA`) stay local; the snapshot refreshes lazily when its length no
//! longer matches the global table.

use heapless::{String, Vec};

use crate::config::{MAX_AG_INDICATORS, MAX_INDICATOR_NAME_LEN};
use crate::error::Error;

/// Well-known indicator names.
pub mod names {
    pub const SERVICE: &str = "service";
    pub const CALL: &str = "call";
    pub const CALL_SETUP: &str = "callsetup";
    pub const SIGNAL: &str = "signal";
    pub const ROAM: &str = "roam";
    pub const BATTERY_CHARGE: &str = "battchg";
}

/// Values of the `call` indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CallStatus {
    None = 0,
    Active = 1,
}

/// Values of the `callsetup` indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CallSetupStatus {
    None = 0,
    Incoming = 1,
    OutgoingDialing = 2,
    OutgoingAlerting = 3,
}

/// One AG telephony indicator as advertised in the `+CIND` definition list.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AgIndicator {
    pub name: String<MAX_INDICATOR_NAME_LEN>,
    /// 1-based position in the AG's canonical list, stable for a session.
    pub index: u8,
    pub min_range: u8,
    pub max_range: u8,
    pub status: u8,
    /// Whether unsolicited `+CIEV` updates are reported for this indicator.
    pub enabled: bool,
    pub mandatory: bool,
}

impl AgIndicator {
    pub fn new(name: &str, index: u8, min: u8, max: u8, status: u8) -> Result<Self, Error> {
        Ok(Self {
            name: String::try_from(name).map_err(|_| Error::NameTooLong)?,
            index,
            min_range: min,
            max_range: max,
            status,
            enabled: true,
            mandatory: true,
        })
    }
}

/// A generic status indicator `(uuid, state)` pair, HFP v1.7 section 4.36.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GenericIndicator {
    pub uuid: u16,
    pub state: u8,
}

impl GenericIndicator {
    pub fn new(uuid: u16, state: u8) -> Self {
        Self { uuid, state }
    }
}

/// Checks the registry invariants: contiguous 1-based indices, unique names,
/// every status within `[min, max]`.
pub(crate) fn validate_indicators(indicators: &[AgIndicator]) -> Result<(), Error> {
    for (position, indicator) in indicators.iter().enumerate() {
        if usize::from(indicator.index) != position + 1 {
            return Err(Error::IndicatorIndex);
        }
        if indicator.status < indicator.min_range || indicator.status > indicator.max_range {
            return Err(Error::IndicatorRange);
        }
        if indicators[..position]
            .iter()
            .any(|other| other.name == indicator.name)
        {
            return Err(Error::DuplicateIndicator);
        }
    }
    Ok(())
}

/// A session's view of the AG indicator table.
#[derive(Debug, Clone, Default)]
pub(crate) struct IndicatorSnapshot {
    indicators: Vec<AgIndicator, MAX_AG_INDICATORS>,
}

impl IndicatorSnapshot {
    /// Re-copies the global table when the cached count differs, preserving
    /// the global ordering. Status values and `enabled` bits reset with it.
    pub fn refresh(&mut self, global: &[AgIndicator]) {
        if self.indicators.len() != global.len() {
            self.indicators.clear();
            // Capacity matches the config bound, the copy cannot fail.
            let _ = self.indicators.extend_from_slice(global);
        }
    }

    pub fn indicators(&self) -> &[AgIndicator] {
        &self.indicators
    }

    /// Position of the indicator named `name`, if present.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.indicators.iter().position(|ind| ind.name.as_str() == name)
    }

    pub fn get(&self, position: usize) -> Option<&AgIndicator> {
        self.indicators.get(position)
    }

    pub fn get_mut(&mut self, position: usize) -> Option<&mut AgIndicator> {
        self.indicators.get_mut(position)
    }

    /// Applies an `AT+BIA` activation mask. Entries for the call status
    /// indicators are ignored, those must always be reported.
    pub fn apply_activation_mask(&mut self, mask: &[Option<bool>]) {
        for (indicator, entry) in self.indicators.iter_mut().zip(mask.iter()) {
            if indicator.name.as_str() == names::CALL
                || indicator.name.as_str() == names::CALL_SETUP
            {
                continue;
            }
            if let Some(enabled) = entry {
                indicator.enabled = *enabled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> [AgIndicator; 3] {
        [
            AgIndicator::new(names::SERVICE, 1, 0, 1, 1).unwrap(),
            AgIndicator::new(names::CALL, 2, 0, 1, 0).unwrap(),
            AgIndicator::new(names::CALL_SETUP, 3, 0, 3, 0).unwrap(),
        ]
    }

    #[test]
    fn validation_accepts_canonical_table() {
        assert_eq!(validate_indicators(&table()), Ok(()));
    }

    #[test]
    fn validation_rejects_index_gap() {
        let mut indicators = table();
        indicators[2].index = 5;
        assert_eq!(validate_indicators(&indicators), Err(Error::IndicatorIndex));
    }

    #[test]
    fn validation_rejects_status_out_of_range() {
        let mut indicators = table();
        indicators[1].status = 7;
        assert_eq!(validate_indicators(&indicators), Err(Error::IndicatorRange));
    }

    #[test]
    fn validation_rejects_duplicate_name() {
        let mut indicators = table();
        indicators[2].name = String::try_from(names::CALL).unwrap();
        assert_eq!(
            validate_indicators(&indicators),
            Err(Error::DuplicateIndicator)
        );
    }

    #[test]
    fn snapshot_refreshes_only_on_size_change() {
        let indicators = table();
        let mut snapshot = IndicatorSnapshot::default();
        snapshot.refresh(&indicators);
        assert_eq!(snapshot.indicators().len(), 3);

        // A local status change survives a refresh against an unchanged table.
        snapshot.get_mut(1).unwrap().status = 1;
        snapshot.refresh(&indicators);
        assert_eq!(snapshot.get(1).unwrap().status, 1);
    }

    #[test]
    fn activation_mask_skips_call_indicators() {
        let mut snapshot = IndicatorSnapshot::default();
        snapshot.refresh(&table());
        snapshot.apply_activation_mask(&[Some(false), Some(false), None]);
        assert!(!snapshot.get(0).unwrap().enabled);
        // `call` may not be masked out.
        assert!(snapshot.get(1).unwrap().enabled);
        assert!(snapshot.get(2).unwrap().enabled);
    }
}
