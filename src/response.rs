//! Serialization of outbound AT responses and unsolicited reports.
//!
//! Every response follows the `\r\n<payload>\r\n` framing, with final result
//! codes appended as `\r\nOK\r\n` or `\r\nERROR\r\n`. A [`Response`] is one
//! complete logical message: the session hands the whole buffer to RFCOMM in
//! a single write, or defers the tick when the channel is not writable.
//! Assembly happens in a bounded buffer; a payload that does not fit fails
//! with [`Error::ResponseOverflow`] instead of truncating on the wire.

use core::fmt::Write as _;

use heapless::String;

use crate::config::{NetworkOperator, MAX_CALL_HOLD_LEN};
use crate::error::Error;
use crate::indicator::{AgIndicator, GenericIndicator};

/// Sized for the largest legal payload, the `+CIND` definition list with a
/// full indicator table.
const MAX_RESPONSE_LEN: usize = 512;

const SUPPORTED_FEATURES: &str = "+BRSF";
const INDICATOR: &str = "+CIND";
const CALL_HOLD_SERVICES: &str = "+CHLD";
const GENERIC_STATUS_INDICATOR: &str = "+BIND";
const OPERATOR_SELECTION: &str = "+COPS";
const EXTENDED_ERROR: &str = "+CMEE";
const INDICATOR_STATUS: &str = "+CIEV";
const COMMON_CODEC: &str = "+BCS";

/// One fully serialized outbound message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Response {
    buf: String<MAX_RESPONSE_LEN>,
}

impl Response {
    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_bytes()
    }

    fn push(&mut self, args: core::fmt::Arguments<'_>) -> Result<(), Error> {
        self.buf
            .write_fmt(args)
            .map_err(|_| Error::ResponseOverflow)
    }

    pub fn ok() -> Result<Self, Error> {
        let mut response = Self::default();
        response.push(format_args!("\r\nOK\r\n"))?;
        Ok(response)
    }

    pub fn error() -> Result<Self, Error> {
        let mut response = Self::default();
        response.push(format_args!("\r\nERROR\r\n"))?;
        Ok(response)
    }

    /// `+BRSF:<features>` followed by `OK`.
    pub fn supported_features(features: u32) -> Result<Self, Error> {
        let mut response = Self::default();
        response.push(format_args!(
            "\r\n{}:{}\r\n\r\nOK\r\n",
            SUPPORTED_FEATURES, features
        ))?;
        Ok(response)
    }

    /// The parenthesized `+CIND` definition list followed by `OK`.
    pub fn indicator_definitions(indicators: &[AgIndicator]) -> Result<Self, Error> {
        let mut response = Self::default();
        response.push(format_args!("\r\n{}:", INDICATOR))?;
        for (position, indicator) in indicators.iter().enumerate() {
            if position > 0 {
                response.push(format_args!(","))?;
            }
            response.push(format_args!(
                "(\"{}\",({},{}))",
                indicator.name, indicator.min_range, indicator.max_range
            ))?;
        }
        response.push(format_args!("\r\n\r\nOK\r\n"))?;
        Ok(response)
    }

    /// The comma-separated `+CIND` status tuple followed by `OK`.
    pub fn indicator_status(indicators: &[AgIndicator]) -> Result<Self, Error> {
        let mut response = Self::default();
        response.push(format_args!("\r\n{}:", INDICATOR))?;
        for (position, indicator) in indicators.iter().enumerate() {
            if position > 0 {
                response.push(format_args!(","))?;
            }
            response.push(format_args!("{}", indicator.status))?;
        }
        response.push(format_args!("\r\n\r\nOK\r\n"))?;
        Ok(response)
    }

    /// `+CHLD:(<svc>,...)` followed by `OK`.
    pub fn call_hold_services(services: &[String<MAX_CALL_HOLD_LEN>]) -> Result<Self, Error> {
        let mut response = Self::default();
        response.push(format_args!("\r\n{}:(", CALL_HOLD_SERVICES))?;
        for (position, service) in services.iter().enumerate() {
            if position > 0 {
                response.push(format_args!(","))?;
            }
            response.push(format_args!("{}", service))?;
        }
        response.push(format_args!(")\r\n\r\nOK\r\n"))?;
        Ok(response)
    }

    /// `+BIND:(<uuid>,...)` followed by `OK`.
    pub fn generic_indicator_uuids(indicators: &[GenericIndicator]) -> Result<Self, Error> {
        let mut response = Self::default();
        response.push(format_args!("\r\n{}:(", GENERIC_STATUS_INDICATOR))?;
        for (position, indicator) in indicators.iter().enumerate() {
            if position > 0 {
                response.push(format_args!(","))?;
            }
            response.push(format_args!("{}", indicator.uuid))?;
        }
        response.push(format_args!(")\r\n\r\nOK\r\n"))?;
        Ok(response)
    }

    /// One `+BIND:<uuid>,<state>` line per indicator, then `OK`, emitted as a
    /// single message.
    pub fn generic_indicator_states(indicators: &[GenericIndicator]) -> Result<Self, Error> {
        let mut response = Self::default();
        for indicator in indicators {
            response.push(format_args!(
                "\r\n{}:{},{}\r\n",
                GENERIC_STATUS_INDICATOR, indicator.uuid, indicator.state
            ))?;
        }
        response.push(format_args!("\r\nOK\r\n"))?;
        Ok(response)
    }

    /// `+COPS:<mode>,<format>,"<name>"` followed by `OK`; the short
    /// `<mode>,,` form when no operator name is known.
    pub fn operator(operator: &NetworkOperator) -> Result<Self, Error> {
        let mut response = Self::default();
        if operator.name.is_empty() {
            response.push(format_args!(
                "\r\n{}:{},,\r\n\r\nOK\r\n",
                OPERATOR_SELECTION, operator.mode
            ))?;
        } else {
            response.push(format_args!(
                "\r\n{}:{},{},\"{}\"\r\n\r\nOK\r\n",
                OPERATOR_SELECTION, operator.mode, operator.format, operator.name
            ))?;
        }
        Ok(response)
    }

    /// Unsolicited `+CMEE=<code>` extended error report.
    pub fn extended_error(code: u8) -> Result<Self, Error> {
        let mut response = Self::default();
        response.push(format_args!("\r\n{}={}\r\n", EXTENDED_ERROR, code))?;
        Ok(response)
    }

    /// Unsolicited `+CIEV:<index>,<status>` indicator report.
    pub fn indicator_update(index: u8, status: u8) -> Result<Self, Error> {
        let mut response = Self::default();
        response.push(format_args!(
            "\r\n{}:{},{}\r\n",
            INDICATOR_STATUS, index, status
        ))?;
        Ok(response)
    }

    /// `+BCS:<codec>` codec suggestion.
    pub fn suggest_codec(codec: u8) -> Result<Self, Error> {
        let mut response = Self::default();
        response.push(format_args!("\r\n{}:{}\r\n", COMMON_CODEC, codec))?;
        Ok(response)
    }
}
