//! Shared fixtures for driver tests: recording transports, an event log and
//! a canonical configuration.

use std::cell::RefCell;
use std::rc::Rc;
use std::vec::Vec;

use crate::config::AgConfig;
use crate::event::AgEvent;
use crate::features::{AgFeatures, CODEC_CVSD, CODEC_MSBC};
use crate::indicator::{names, AgIndicator, GenericIndicator};
use crate::transport::{
    AclHandle, BdAddr, ChannelId, HciControl, RfcommControl, ScoHandle, ScoParams, TransportError,
};

pub const ADDR: BdAddr = BdAddr([0x00, 0x1B, 0xDC, 0x07, 0x32, 0xF3]);
pub const CHANNEL: ChannelId = 0x2A;
pub const ACL: AclHandle = 0x0B;
pub const SCO: ScoHandle = 0x44;

#[derive(Default)]
pub struct MockRfcomm {
    pub blocked: bool,
    pub sent: Vec<Vec<u8>>,
    pub connects: Vec<BdAddr>,
    pub disconnects: Vec<ChannelId>,
}

impl MockRfcomm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains and returns the recorded frames.
    pub fn take_sent(&mut self) -> Vec<Vec<u8>> {
        core::mem::take(&mut self.sent)
    }
}

impl RfcommControl for MockRfcomm {
    fn connect(&mut self, addr: BdAddr) {
        self.connects.push(addr);
    }

    fn can_send_now(&self, _channel: ChannelId) -> bool {
        !self.blocked
    }

    fn send(&mut self, _channel: ChannelId, data: &[u8]) -> Result<(), TransportError> {
        if self.blocked {
            return Err(TransportError::NotReady);
        }
        self.sent.push(data.to_vec());
        Ok(())
    }

    fn disconnect(&mut self, channel: ChannelId) {
        self.disconnects.push(channel);
    }
}

#[derive(Default)]
pub struct MockHci {
    pub voice_setting: u16,
    pub sco_requests: Vec<(AclHandle, ScoParams)>,
    pub sco_disconnects: Vec<ScoHandle>,
}

impl MockHci {
    pub fn new() -> Self {
        Self {
            voice_setting: 0x0060,
            ..Self::default()
        }
    }
}

impl HciControl for MockHci {
    fn sco_voice_setting(&self) -> u16 {
        self.voice_setting
    }

    fn setup_synchronous_connection(&mut self, handle: AclHandle, params: ScoParams) {
        self.sco_requests.push((handle, params));
    }

    fn disconnect_sco(&mut self, handle: ScoHandle) {
        self.sco_disconnects.push(handle);
    }
}

/// An event sink that records into a shared log.
pub fn event_log() -> (Rc<RefCell<Vec<AgEvent>>>, impl FnMut(AgEvent)) {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = {
        let log = log.clone();
        move |event| log.borrow_mut().push(event)
    };
    (log, sink)
}

/// The canonical indicator table used throughout the tests: `service` at
/// index 1, `call` at 2, `callsetup` at 3.
pub fn indicators() -> [AgIndicator; 3] {
    [
        AgIndicator::new(names::SERVICE, 1, 0, 1, 1).unwrap(),
        AgIndicator::new(names::CALL, 2, 0, 1, 0).unwrap(),
        AgIndicator::new(names::CALL_SETUP, 3, 0, 3, 0).unwrap(),
    ]
}

pub fn config(features: AgFeatures) -> AgConfig {
    AgConfig::new(features)
        .with_codecs(&[CODEC_CVSD, CODEC_MSBC])
        .unwrap()
        .with_indicators(&indicators())
        .unwrap()
        .with_call_hold_services(&["1", "1x", "2", "2x", "3"])
        .unwrap()
        .with_generic_indicators(&[GenericIndicator::new(1, 1), GenericIndicator::new(2, 0)])
        .unwrap()
}
