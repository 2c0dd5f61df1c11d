//! Decoded inbound AT commands.
//!
//! The AT lexer itself lives outside this crate: the integration parses the
//! RFCOMM byte stream and hands the driver one [`HfCommand`] per terminal
//! character via
//! [`AudioGateway::received_command`](crate::AudioGateway::received_command).
//! Anything the lexer cannot classify arrives as [`HfCommand::Unknown`] and
//! is answered with a single `ERROR`.

use heapless::Vec;

use crate::config::{MAX_AG_INDICATORS, MAX_GENERIC_INDICATORS};
use crate::features::CodecList;

/// Per-indicator entries of an `AT+BIA` activation mask; `None` for positions
/// the HF left empty.
pub type IndicatorMask = Vec<Option<bool>, MAX_AG_INDICATORS>;

/// Generic status indicator uuids listed in `AT+BIND=`.
pub type UuidList = Vec<u16, MAX_GENERIC_INDICATORS>;

/// One command received from the Hands-Free unit.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HfCommand {
    /// `AT+BRSF=<bitmap>` - the HF's supported features.
    SupportedFeatures(u32),
    /// `AT+BAC=<c1>,<c2>,...` - the HF's available codecs.
    AvailableCodecs(CodecList),
    /// `AT+CIND=?` - retrieve the indicator definition list.
    RetrieveIndicators,
    /// `AT+CIND?` - retrieve the current indicator status tuple.
    RetrieveIndicatorsStatus,
    /// `AT+CMER=3,0,0,<n>` - enable or disable unsolicited `+CIEV` reports.
    EnableIndicatorStatusUpdate(bool),
    /// `AT+BIA=...` - per-indicator activation mask.
    EnableIndividualIndicators(IndicatorMask),
    /// `AT+CHLD=?` - retrieve the call-hold and multiparty services.
    RetrieveCallHoldServices,
    /// `AT+BIND=<u1>,<u2>,...` - the generic indicators the HF supports.
    ListGenericStatusIndicators(UuidList),
    /// `AT+BIND=?` - retrieve the generic indicators the AG supports.
    RetrieveGenericStatusIndicators,
    /// `AT+BIND?` - retrieve the initial generic indicator states.
    RetrieveGenericStatusIndicatorsState,
    /// `AT+COPS?` - query the network operator.
    QueryOperatorSelection,
    /// `AT+COPS=3,<format>` - select the operator name format.
    SetOperatorFormat { format: u8 },
    /// `AT+CMEE=<n>` - enable or disable extended error reporting.
    EnableExtendedErrors(bool),
    /// `AT+BCC` - the HF asks for codec connection setup.
    TriggerCodecConnectionSetup,
    /// `AT+BCS=<codec>` - the HF confirms the suggested codec.
    ConfirmedCodec(u8),
    /// `ATA` - the HF answers the ringing call.
    CallAnswered,
    /// `AT+CHUP` - the HF hangs up.
    CallTerminated,
    /// Anything the lexer could not classify.
    Unknown,
}
