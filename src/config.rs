//! Driver configuration.
//!
//! Everything the AG advertises to its peers - features, codec preference,
//! the telephony indicator table, generic status indicators and the call-hold
//! service list - is fixed at construction. Sessions copy what they need, so
//! nothing here can change underneath an open connection.

use heapless::{String, Vec};

use crate::error::Error;
use crate::features::{AgFeatures, CodecList};
use crate::indicator::{validate_indicators, AgIndicator, GenericIndicator};

pub const MAX_CODECS: usize = 8;
pub const MAX_AG_INDICATORS: usize = 16;
pub const MAX_GENERIC_INDICATORS: usize = 8;
pub const MAX_CALL_HOLD_SERVICES: usize = 6;
pub const MAX_SESSIONS: usize = 4;
pub const MAX_INDICATOR_NAME_LEN: usize = 10;
pub const MAX_OPERATOR_NAME_LEN: usize = 16;
pub const MAX_CALL_HOLD_LEN: usize = 4;

/// Network operator reported in answer to `AT+COPS?`.
///
/// Only format 0 (long alphanumeric) is representable; the HF asking for any
/// other format is refused on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NetworkOperator {
    pub mode: u8,
    pub format: u8,
    pub name: String<MAX_OPERATOR_NAME_LEN>,
}

impl NetworkOperator {
    pub fn new(mode: u8, name: &str) -> Result<Self, Error> {
        Ok(Self {
            mode,
            format: 0,
            name: String::try_from(name).map_err(|_| Error::NameTooLong)?,
        })
    }
}

/// Immutable AG-side configuration, assembled with the builder methods and
/// handed to [`AudioGateway::new`](crate::AudioGateway::new).
#[derive(Debug, Clone, Default)]
pub struct AgConfig {
    pub(crate) features: AgFeatures,
    pub(crate) codecs: CodecList,
    pub(crate) indicators: Vec<AgIndicator, MAX_AG_INDICATORS>,
    pub(crate) generic_indicators: Vec<GenericIndicator, MAX_GENERIC_INDICATORS>,
    pub(crate) call_hold_services: Vec<String<MAX_CALL_HOLD_LEN>, MAX_CALL_HOLD_SERVICES>,
}

impl AgConfig {
    pub fn new(features: AgFeatures) -> Self {
        AgConfig {
            features,
            ..Self::default()
        }
    }

    /// Install the codec preference list, most preferred first.
    pub fn with_codecs(mut self, codecs: &[u8]) -> Result<Self, Error> {
        self.codecs = CodecList::from_slice(codecs).map_err(|_| Error::TooManyCodecs)?;
        Ok(self)
    }

    /// Install the AG indicator table. Indices must be contiguous starting at
    /// 1, names unique, and every status within its range.
    pub fn with_indicators(mut self, indicators: &[AgIndicator]) -> Result<Self, Error> {
        validate_indicators(indicators)?;
        self.indicators =
            Vec::from_slice(indicators).map_err(|_| Error::TooManyIndicators)?;
        Ok(self)
    }

    /// Install the generic (HF) status indicators advertised via `+BIND`.
    pub fn with_generic_indicators(
        mut self,
        indicators: &[GenericIndicator],
    ) -> Result<Self, Error> {
        self.generic_indicators =
            Vec::from_slice(indicators).map_err(|_| Error::TooManyGenericIndicators)?;
        Ok(self)
    }

    /// Install the call-hold and multiparty services advertised via `+CHLD`,
    /// e.g. `["1", "1x", "2", "2x", "3"]`.
    pub fn with_call_hold_services(mut self, services: &[&str]) -> Result<Self, Error> {
        self.call_hold_services.clear();
        for service in services {
            let service = String::try_from(*service).map_err(|_| Error::NameTooLong)?;
            self.call_hold_services
                .push(service)
                .map_err(|_| Error::TooManyCallHoldServices)?;
        }
        Ok(self)
    }

    pub fn features(&self) -> AgFeatures {
        self.features
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{CODEC_CVSD, CODEC_MSBC};

    #[test]
    fn builder_accepts_valid_configuration() {
        let indicators = [
            AgIndicator::new("service", 1, 0, 1, 1).unwrap(),
            AgIndicator::new("call", 2, 0, 1, 0).unwrap(),
        ];
        let config = AgConfig::new(AgFeatures::CODEC_NEGOTIATION)
            .with_codecs(&[CODEC_CVSD, CODEC_MSBC])
            .unwrap()
            .with_indicators(&indicators)
            .unwrap()
            .with_call_hold_services(&["1", "1x", "2", "2x", "3"])
            .unwrap();
        assert_eq!(config.codecs.len(), 2);
        assert_eq!(config.indicators.len(), 2);
        assert_eq!(config.call_hold_services.len(), 5);
    }

    #[test]
    fn builder_refuses_oversized_codec_list() {
        let codecs = [1u8; MAX_CODECS + 1];
        assert!(matches!(
            AgConfig::new(AgFeatures::empty()).with_codecs(&codecs),
            Err(Error::TooManyCodecs)
        ));
    }

    #[test]
    fn operator_name_must_fit() {
        assert!(NetworkOperator::new(0, "Reasonable Ltd").is_ok());
        assert_eq!(
            NetworkOperator::new(0, "An Operator With A Very Long Name"),
            Err(Error::NameTooLong)
        );
    }
}
