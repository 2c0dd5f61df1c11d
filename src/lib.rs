#![cfg_attr(not(test), no_std)]

//! # HFP Audio Gateway
//!
//! This crate implements the Audio Gateway (AG) role of the Bluetooth
//! Hands-Free Profile v1.7 on top of an RFCOMM serial channel. The AG is the
//! "phone side" of a hands-free pairing: it answers the Hands-Free unit's
//! feature and indicator queries, negotiates a voice codec, reports telephony
//! indicator changes and brokers the synchronous (SCO) voice link.
//!
//! The driver is transport-agnostic and `no_std`: RFCOMM and HCI are reached
//! through the [`RfcommControl`] and [`HciControl`] traits, and the AT lexer
//! is external - the integration feeds one decoded [`HfCommand`] per received
//! command line. All work happens on a single cooperative run loop; API calls
//! only stage intent and the next run tick acts on it, so the driver never
//! emits more than one AT frame per writable transport slot.
//!
//! ```ignore
//! let config = AgConfig::new(AgFeatures::CODEC_NEGOTIATION)
//!     .with_codecs(&[CODEC_CVSD, CODEC_MSBC])?
//!     .with_indicators(&indicators)?;
//! let mut ag = AudioGateway::new(config, rfcomm, hci, |event| handle(event))?;
//!
//! ag.channel_opened(peer, channel_id, acl_handle)?;
//! ag.received_command(channel_id, HfCommand::SupportedFeatures(hf_bits))?;
//! ```

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod ag;
pub mod command;
pub mod config;
pub mod error;
mod event;
pub mod features;
pub mod indicator;
mod response;
mod session;
mod set;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use ag::AudioGateway;
pub use command::HfCommand;
pub use config::{AgConfig, NetworkOperator};
pub use error::Error;
pub use event::{AgEvent, EventSink};
pub use features::{AgFeatures, HfFeatures, CODEC_CVSD, CODEC_MSBC};
pub use indicator::{AgIndicator, CallSetupStatus, CallStatus, GenericIndicator};
pub use session::SessionPhase;
pub use transport::{AclHandle, BdAddr, ChannelId, HciControl, RfcommControl, ScoHandle};
