//! The Audio Gateway driver.
//!
//! [`AudioGateway`] owns the configuration, the transports and the set of
//! active sessions. Every entry point - telephony API, decoded inbound
//! command, transport event - stages its effect on the affected session and
//! then runs the cooperative scheduler, which ticks each session while its
//! channel is writable. Integrations should additionally call [`run`] when a
//! previously blocked RFCOMM channel becomes writable again.
//!
//! [`run`]: AudioGateway::run

use crate::config::{AgConfig, NetworkOperator};
use crate::command::HfCommand;
use crate::error::Error;
use crate::event::{AgEvent, EventSink};
use crate::indicator::validate_indicators;
use crate::session::Session;
use crate::set::SessionSet;
use crate::transport::{AclHandle, BdAddr, ChannelId, HciControl, RfcommControl, ScoHandle};

pub struct AudioGateway<R, H, S>
where
    R: RfcommControl,
    H: HciControl,
    S: EventSink,
{
    config: AgConfig,
    operator: NetworkOperator,
    rfcomm: R,
    hci: H,
    sink: S,
    pub(crate) sessions: SessionSet,
}

impl<R, H, S> AudioGateway<R, H, S>
where
    R: RfcommControl,
    H: HciControl,
    S: EventSink,
{
    /// Builds the driver. The configuration is checked here; a rejected
    /// configuration leaves no partial state behind.
    pub fn new(config: AgConfig, rfcomm: R, hci: H, sink: S) -> Result<Self, Error> {
        validate_indicators(&config.indicators)?;
        Ok(Self {
            config,
            operator: NetworkOperator::default(),
            rfcomm,
            hci,
            sink,
            sessions: SessionSet::new(),
        })
    }

    /// Installs the network operator reported in answer to `AT+COPS?`.
    pub fn set_network_operator(&mut self, operator: NetworkOperator) {
        self.operator = operator;
    }

    /// Opens a service level connection to `addr`. Completion arrives via
    /// [`channel_opened`](Self::channel_opened) once RFCOMM is up.
    pub fn connect(&mut self, addr: BdAddr) -> Result<(), Error> {
        if self.sessions.by_addr_mut(addr).is_some() {
            return self.run();
        }
        self.rfcomm.connect(addr);
        Ok(())
    }

    /// Releases the service level connection to `addr`.
    pub fn disconnect(&mut self, addr: BdAddr) -> Result<(), Error> {
        self.sessions
            .by_addr_mut(addr)
            .ok_or(Error::UnknownPeer)?
            .release_connection();
        self.run()
    }

    /// RFCOMM accepted or opened a data channel bound to the HFP service.
    pub fn channel_opened(
        &mut self,
        addr: BdAddr,
        channel: ChannelId,
        acl: AclHandle,
    ) -> Result<(), Error> {
        debug!("channel {} opened", channel);
        self.sessions.add(Session::new(addr, channel, acl))?;
        self.run()
    }

    /// The RFCOMM channel is gone; the session dies with it.
    pub fn channel_closed(&mut self, channel: ChannelId) -> Result<(), Error> {
        let session = self
            .sessions
            .remove_by_channel(channel)
            .ok_or(Error::UnknownChannel)?;
        info!("channel {} closed", channel);
        self.sink.on_event(AgEvent::Disconnected { addr: session.addr });
        self.run()
    }

    /// Feeds one decoded inbound AT command from the external parser.
    pub fn received_command(
        &mut self,
        channel: ChannelId,
        command: HfCommand,
    ) -> Result<(), Error> {
        self.sessions
            .by_channel_mut(channel)
            .ok_or(Error::UnknownChannel)?
            .on_command(command);
        self.run()
    }

    /// The controller confirmed the synchronous connection.
    pub fn sco_connected(&mut self, addr: BdAddr, handle: ScoHandle) -> Result<(), Error> {
        let sink = &mut self.sink;
        self.sessions
            .by_addr_mut(addr)
            .ok_or(Error::UnknownPeer)?
            .on_sco_connected(handle, sink);
        self.run()
    }

    /// The synchronous connection went away, expectedly or not.
    pub fn sco_disconnected(&mut self, handle: ScoHandle) -> Result<(), Error> {
        let sink = &mut self.sink;
        self.sessions
            .by_sco_mut(handle)
            .ok_or(Error::UnknownPeer)?
            .on_sco_disconnected(sink);
        self.run()
    }

    /// Establishes the audio connection: codec negotiation, then SCO.
    pub fn establish_audio(&mut self, addr: BdAddr) -> Result<(), Error> {
        let features = self.config.features;
        self.sessions
            .by_addr_mut(addr)
            .ok_or(Error::UnknownPeer)?
            .request_audio(features);
        self.run()
    }

    /// Releases the audio connection, keeping the SLC.
    pub fn release_audio(&mut self, addr: BdAddr) -> Result<(), Error> {
        self.sessions
            .by_addr_mut(addr)
            .ok_or(Error::UnknownPeer)?
            .request_audio_release();
        self.run()
    }

    /// Starts an outgoing call towards the HF: call setup indication, audio
    /// connection, ring alert.
    pub fn call(&mut self, addr: BdAddr) -> Result<(), Error> {
        self.sessions
            .by_addr_mut(addr)
            .ok_or(Error::UnknownPeer)?
            .request_call();
        self.run()
    }

    /// Terminates the call on the session, releasing the audio connection.
    pub fn terminate(&mut self, addr: BdAddr) -> Result<(), Error> {
        self.sessions
            .by_addr_mut(addr)
            .ok_or(Error::UnknownPeer)?
            .request_terminate();
        self.run()
    }

    /// Reports an extended AG error code. Silently dropped unless the HF
    /// enabled extended error reporting with `AT+CMEE=1`.
    pub fn report_extended_error(&mut self, addr: BdAddr, code: u8) -> Result<(), Error> {
        self.sessions
            .by_addr_mut(addr)
            .ok_or(Error::UnknownPeer)?
            .report_extended_error(code);
        self.run()
    }

    /// Ticks every session once, in insertion order. Sessions whose channel
    /// cannot accept a frame right now are skipped and picked up on the next
    /// run.
    pub fn run(&mut self) -> Result<(), Error> {
        for session in self.sessions.iter_mut() {
            session.run(
                &mut self.rfcomm,
                &mut self.hci,
                &mut self.sink,
                &self.config,
                &self.operator,
            )?;
        }
        Ok(())
    }
}
