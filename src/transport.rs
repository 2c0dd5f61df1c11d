//! Seams to the lower Bluetooth layers.
//!
//! The driver never talks to a controller directly. RFCOMM and HCI reach it
//! through these traits, and the integration feeds transport events back via
//! the corresponding [`AudioGateway`](crate::AudioGateway) entry points
//! (`channel_opened`, `channel_closed`, `sco_connected`, `sco_disconnected`).

/// Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BdAddr(pub [u8; 6]);

/// RFCOMM data channel id.
pub type ChannelId = u16;

/// ACL connection handle, needed to request a synchronous connection.
pub type AclHandle = u16;

/// Handle of an established SCO/eSCO link.
pub type ScoHandle = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// The channel cannot accept a frame right now.
    NotReady,
    /// The channel is gone.
    Closed,
}

/// eSCO parameters for a synchronous connection request.
///
/// The driver always uses the fixed template from [`ScoParams::template`];
/// only the voice setting is taken from the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScoParams {
    pub tx_bandwidth: u32,
    pub rx_bandwidth: u32,
    pub max_latency: u16,
    pub voice_setting: u16,
    pub retransmission_effort: u8,
    pub packet_type: u16,
}

impl ScoParams {
    pub fn template(voice_setting: u16) -> Self {
        Self {
            tx_bandwidth: 8000,
            rx_bandwidth: 8000,
            max_latency: 0xFFFF,
            voice_setting,
            retransmission_effort: 0xFF,
            packet_type: 0x003F,
        }
    }
}

/// Control surface of the RFCOMM multiplexer.
///
/// `send` is only called after `can_send_now` reported a free slot for the
/// same channel within the same run tick, and always with one complete AT
/// response; implementations must not split the buffer across frames.
pub trait RfcommControl {
    /// Open a data channel to `addr` bound to the Hands-Free service. The
    /// result arrives later as a `channel_opened` event.
    fn connect(&mut self, addr: BdAddr);

    /// Whether `channel` can accept another frame right now.
    fn can_send_now(&self, channel: ChannelId) -> bool;

    /// Queue one frame on `channel`.
    fn send(&mut self, channel: ChannelId, data: &[u8]) -> Result<(), TransportError>;

    /// Start channel teardown. Completion arrives as a `channel_closed` event.
    fn disconnect(&mut self, channel: ChannelId);
}

/// Control surface of the HCI layer for synchronous connections.
pub trait HciControl {
    /// The controller's current SCO voice setting.
    fn sco_voice_setting(&self) -> u16;

    /// Request an (e)SCO link on the ACL connection `handle`.
    fn setup_synchronous_connection(&mut self, handle: AclHandle, params: ScoParams);

    /// Release an established SCO link.
    fn disconnect_sco(&mut self, handle: ScoHandle);
}
