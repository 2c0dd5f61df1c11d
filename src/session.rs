//! Per-connection protocol state machine.
//!
//! One [`Session`] drives the combined Service Level Connection setup, codec
//! negotiation and call/audio lifecycle of a single RFCOMM channel. The
//! machine is tick based: [`Session::run`] performs a single decision pass
//! and emits at most one AT message, which keeps outbound ordering
//! deterministic and matches RFCOMM credit-based flow control. API entry
//! points only stage intent; their effect materializes on the next tick.

use heapless::Deque;

use crate::command::HfCommand;
use crate::config::{AgConfig, NetworkOperator};
use crate::error::Error;
use crate::event::{AgEvent, EventSink};
use crate::features::{common_codec, AgFeatures, CodecList, HfFeatures};
use crate::indicator::{names, CallSetupStatus, CallStatus, IndicatorSnapshot};
use crate::response::Response;
use crate::transport::{
    AclHandle, BdAddr, ChannelId, HciControl, RfcommControl, ScoHandle, ScoParams,
};

/// Pending `+CIEV` reports; call answer queues two, termination at most two.
const MAX_PENDING_INDICATOR_UPDATES: usize = 8;

/// Combined SLC, codec and call/audio phase of one session.
///
/// The SLC portion (everything up to
/// [`ServiceLevelConnectionEstablished`](SessionPhase::ServiceLevelConnectionEstablished))
/// is strictly non-decreasing; the later phases move freely as audio comes
/// and goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionPhase {
    ExchangeSupportedFeatures,
    W4ExchangeSupportedFeatures,
    W4NotifyOnCodecs,
    W4RetrieveIndicators,
    W4RetrieveIndicatorsStatus,
    W4EnableIndicatorsStatusUpdate,
    W4RetrieveCanHoldCall,
    W4ListGenericStatusIndicators,
    W4RetrieveGenericStatusIndicators,
    W4RetrieveInitialStateGenericStatusIndicators,
    ServiceLevelConnectionEstablished,
    SleW2ExchangeCommonCodec,
    SleW4ExchangeCommonCodec,
    CodecsConnectionEstablished,
    W4ScoConnected,
    AudioConnectionEstablished,
    RingAlert,
    CallActive,
    W2DisconnectSco,
    W4ScoDisconnected,
    W2DisconnectRfcomm,
    W4RfcommDisconnected,
}

/// Final result code staged by the dispatcher for pure state-update commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum FinalReply {
    Ok,
    Error,
}

/// API-driven intent, one slot per session. The machine-internal steps a
/// consumed intent fans out into (codec suggestion, ringing, SCO setup) are
/// tracked separately because they overlap in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum PendingAction {
    None,
    StartCall,
    TerminateCall,
    ReleaseAudio,
}

pub(crate) struct Session {
    pub addr: BdAddr,
    pub channel: ChannelId,
    pub acl: AclHandle,
    pub phase: SessionPhase,
    pub hf_features: HfFeatures,
    pub hf_codecs: CodecList,
    pub suggested_codec: u8,
    pub negotiated_codec: u8,
    pub sco_handle: Option<ScoHandle>,
    pub snapshot: IndicatorSnapshot,

    /// Most recently decoded inbound command, cleared once answered.
    command: Option<HfCommand>,
    final_reply: Option<FinalReply>,
    pending: PendingAction,
    /// A `+BCS` suggestion is due.
    suggest_codec_pending: bool,
    /// Audio setup (codec exchange, then SCO) is armed.
    establish_audio: bool,
    /// Enter the ring alert once the audio connection is up.
    start_ringing: bool,
    /// Call teardown in progress: drain indicator reports, then drop SCO.
    terminating: bool,
    status_update_enabled: bool,
    extended_errors_enabled: bool,
    extended_error: Option<u8>,
    indicator_updates: Deque<(u8, u8), MAX_PENDING_INDICATOR_UPDATES>,
}

impl Session {
    pub fn new(addr: BdAddr, channel: ChannelId, acl: AclHandle) -> Self {
        Self {
            addr,
            channel,
            acl,
            phase: SessionPhase::ExchangeSupportedFeatures,
            hf_features: HfFeatures::empty(),
            hf_codecs: CodecList::new(),
            suggested_codec: 0,
            negotiated_codec: 0,
            sco_handle: None,
            snapshot: IndicatorSnapshot::default(),
            command: None,
            final_reply: None,
            pending: PendingAction::None,
            suggest_codec_pending: false,
            establish_audio: false,
            start_ringing: false,
            terminating: false,
            status_update_enabled: false,
            extended_errors_enabled: false,
            extended_error: None,
            indicator_updates: Deque::new(),
        }
    }

    fn codec_negotiation(&self, ag_features: AgFeatures) -> bool {
        ag_features.contains(AgFeatures::CODEC_NEGOTIATION)
            && self.hf_features.contains(HfFeatures::CODEC_NEGOTIATION)
    }

    fn three_way_calling(&self, ag_features: AgFeatures) -> bool {
        ag_features.contains(AgFeatures::THREE_WAY_CALLING)
            && self.hf_features.contains(HfFeatures::THREE_WAY_CALLING)
    }

    fn hf_indicators(&self, ag_features: AgFeatures) -> bool {
        ag_features.contains(AgFeatures::HF_INDICATORS)
            && self.hf_features.contains(HfFeatures::HF_INDICATORS)
    }

    /// Stages a decoded inbound command on the session (the dispatcher).
    ///
    /// Pure state updates that need no state machine involvement are applied
    /// here and acknowledged through the staged final reply; everything else
    /// waits for the next tick. During SLC setup nothing is staged - the SLC
    /// ladder alone decides what is in order.
    pub fn on_command(&mut self, command: HfCommand) {
        if self.phase == SessionPhase::ExchangeSupportedFeatures {
            self.phase = SessionPhase::W4ExchangeSupportedFeatures;
        }
        if self.phase >= SessionPhase::ServiceLevelConnectionEstablished {
            match &command {
                HfCommand::EnableExtendedErrors(enable) => {
                    self.extended_errors_enabled = *enable;
                    self.final_reply = Some(FinalReply::Ok);
                }
                HfCommand::EnableIndicatorStatusUpdate(enable) => {
                    self.status_update_enabled = *enable;
                    self.final_reply = Some(FinalReply::Ok);
                }
                HfCommand::EnableIndividualIndicators(mask) => {
                    self.snapshot.apply_activation_mask(mask);
                    self.final_reply = Some(FinalReply::Ok);
                }
                HfCommand::SetOperatorFormat { format } => {
                    // Only format 0, long alphanumeric, is supported.
                    self.final_reply = Some(if *format == 0 {
                        FinalReply::Ok
                    } else {
                        FinalReply::Error
                    });
                }
                HfCommand::CallTerminated => {
                    let call_in_progress = self
                        .indicator_status(names::CALL)
                        .unwrap_or(0)
                        != 0
                        || self.indicator_status(names::CALL_SETUP).unwrap_or(0) != 0;
                    if call_in_progress {
                        self.pending = PendingAction::TerminateCall;
                    }
                    self.final_reply = Some(FinalReply::Ok);
                }
                _ => {}
            }
        }
        self.command = Some(command);
    }

    pub fn request_call(&mut self) {
        self.pending = PendingAction::StartCall;
    }

    pub fn request_terminate(&mut self) {
        self.pending = PendingAction::TerminateCall;
    }

    pub fn request_audio_release(&mut self) {
        self.pending = PendingAction::ReleaseAudio;
    }

    pub fn request_audio(&mut self, ag_features: AgFeatures) {
        if !self.codec_negotiation(ag_features) {
            info!("audio connection requires mutual codec negotiation support");
            return;
        }
        if self.phase == SessionPhase::AudioConnectionEstablished
            || self.phase >= SessionPhase::W2DisconnectSco
        {
            return;
        }
        self.establish_audio = true;
    }

    /// Stages an extended AG error report. Dropped unless the HF enabled
    /// extended error reporting with `AT+CMEE=1`.
    pub fn report_extended_error(&mut self, code: u8) {
        self.extended_error = None;
        if !self.extended_errors_enabled {
            return;
        }
        self.extended_error = Some(code);
    }

    /// Requests SLC teardown; the next idle tick issues the RFCOMM disconnect.
    pub fn release_connection(&mut self) {
        if self.phase < SessionPhase::W2DisconnectRfcomm {
            self.phase = SessionPhase::W2DisconnectRfcomm;
        }
    }

    pub fn on_sco_connected<S: EventSink>(&mut self, handle: ScoHandle, sink: &mut S) {
        self.sco_handle = Some(handle);
        if self.phase == SessionPhase::W4ScoConnected {
            self.phase = SessionPhase::AudioConnectionEstablished;
            sink.on_event(AgEvent::AudioConnectionEstablished {
                addr: self.addr,
                handle,
            });
        }
    }

    pub fn on_sco_disconnected<S: EventSink>(&mut self, sink: &mut S) {
        self.sco_handle = None;
        if self.terminating {
            self.terminating = false;
            self.phase = SessionPhase::ServiceLevelConnectionEstablished;
            sink.on_event(AgEvent::CallTerminated { addr: self.addr });
        } else if self.phase >= SessionPhase::W4ScoConnected
            && self.phase <= SessionPhase::W4ScoDisconnected
        {
            self.phase = SessionPhase::ServiceLevelConnectionEstablished;
        }
    }

    fn send<R: RfcommControl>(&self, rfcomm: &mut R, response: &Response) -> Result<(), Error> {
        rfcomm.send(self.channel, response.as_bytes())?;
        Ok(())
    }

    /// Updates an indicator status and queues the matching `+CIEV` report,
    /// honouring the `AT+CMER` switch and the per-indicator enable bit.
    fn queue_indicator_update(&mut self, position: usize, status: u8) {
        let report = self.status_update_enabled;
        if let Some(indicator) = self.snapshot.get_mut(position) {
            indicator.status = status;
            if report && indicator.enabled {
                let update = (indicator.index, status);
                if self.indicator_updates.push_back(update).is_err() {
                    warn!("indicator update queue overflow");
                }
            }
        }
    }

    fn indicator_status(&self, name: &str) -> Option<u8> {
        let position = self.snapshot.position(name)?;
        self.snapshot.get(position).map(|indicator| indicator.status)
    }

    fn establish_service_level_connection<S: EventSink>(&mut self, sink: &mut S) {
        self.phase = SessionPhase::ServiceLevelConnectionEstablished;
        info!("service level connection established");
        sink.on_event(AgEvent::ServiceLevelConnectionEstablished { addr: self.addr });
    }

    /// A single decision pass, at most one outbound emission.
    pub fn run<R, H, S>(
        &mut self,
        rfcomm: &mut R,
        hci: &mut H,
        sink: &mut S,
        config: &AgConfig,
        operator: &NetworkOperator,
    ) -> Result<(), Error>
    where
        R: RfcommControl,
        H: HciControl,
        S: EventSink,
    {
        if !rfcomm.can_send_now(self.channel) {
            return Ok(());
        }
        self.snapshot.refresh(&config.indicators);

        if matches!(self.command, Some(HfCommand::Unknown)) {
            self.send(rfcomm, &Response::error()?)?;
            self.command = None;
            self.final_reply = None;
            return Ok(());
        }

        if let Some(reply) = self.final_reply.take() {
            let response = match reply {
                FinalReply::Ok => Response::ok()?,
                FinalReply::Error => Response::error()?,
            };
            self.send(rfcomm, &response)?;
            self.command = None;
            return Ok(());
        }

        let mut done = self.run_service_level_connection(rfcomm, sink, config)?;
        if !done && rfcomm.can_send_now(self.channel) {
            done = self.run_slc_queries(rfcomm, config, operator)?;
        }
        if !done && rfcomm.can_send_now(self.channel) {
            done = self.run_codecs_and_call(rfcomm, hci, sink, config)?;
        }

        if !done && rfcomm.can_send_now(self.channel) && self.command.is_some() {
            // No driver accepted the command in the current phase.
            warn!("command out of order, answering ERROR");
            self.send(rfcomm, &Response::error()?)?;
            self.command = None;
            return Ok(());
        }

        if !done && self.command.is_none() && self.phase == SessionPhase::W2DisconnectRfcomm {
            self.phase = SessionPhase::W4RfcommDisconnected;
            rfcomm.disconnect(self.channel);
        }
        if done {
            self.command = None;
        }
        Ok(())
    }

    /// The SLC setup ladder, HFP v1.7 section 4.2. Each inbound step answers
    /// and advances; the feature-gated rungs only appear when both sides
    /// support them.
    fn run_service_level_connection<R, S>(
        &mut self,
        rfcomm: &mut R,
        sink: &mut S,
        config: &AgConfig,
    ) -> Result<bool, Error>
    where
        R: RfcommControl,
        S: EventSink,
    {
        if self.phase >= SessionPhase::CodecsConnectionEstablished {
            return Ok(false);
        }
        let Some(command) = self.command.clone() else {
            return Ok(false);
        };
        match (command, self.phase) {
            (HfCommand::SupportedFeatures(bits), SessionPhase::W4ExchangeSupportedFeatures) => {
                self.hf_features = HfFeatures::from_bits_truncate(bits);
                debug!("HF features {:#x}", bits);
                self.send(
                    rfcomm,
                    &Response::supported_features(config.features.bits())?,
                )?;
                self.phase = if self.codec_negotiation(config.features) {
                    SessionPhase::W4NotifyOnCodecs
                } else {
                    SessionPhase::W4RetrieveIndicators
                };
                Ok(true)
            }
            (HfCommand::AvailableCodecs(codecs), SessionPhase::W4NotifyOnCodecs) => {
                self.hf_codecs = codecs;
                self.send(rfcomm, &Response::ok()?)?;
                self.phase = SessionPhase::W4RetrieveIndicators;
                Ok(true)
            }
            (HfCommand::RetrieveIndicators, SessionPhase::W4RetrieveIndicators) => {
                self.send(
                    rfcomm,
                    &Response::indicator_definitions(self.snapshot.indicators())?,
                )?;
                self.phase = SessionPhase::W4RetrieveIndicatorsStatus;
                Ok(true)
            }
            (HfCommand::RetrieveIndicatorsStatus, SessionPhase::W4RetrieveIndicatorsStatus) => {
                self.send(
                    rfcomm,
                    &Response::indicator_status(self.snapshot.indicators())?,
                )?;
                self.phase = SessionPhase::W4EnableIndicatorsStatusUpdate;
                Ok(true)
            }
            (
                HfCommand::EnableIndicatorStatusUpdate(enable),
                SessionPhase::W4EnableIndicatorsStatusUpdate,
            ) => {
                self.status_update_enabled = enable;
                self.send(rfcomm, &Response::ok()?)?;
                if self.three_way_calling(config.features) {
                    self.phase = SessionPhase::W4RetrieveCanHoldCall;
                } else if self.hf_indicators(config.features) {
                    self.phase = SessionPhase::W4ListGenericStatusIndicators;
                } else {
                    self.establish_service_level_connection(sink);
                }
                Ok(true)
            }
            (HfCommand::RetrieveCallHoldServices, SessionPhase::W4RetrieveCanHoldCall) => {
                self.send(
                    rfcomm,
                    &Response::call_hold_services(&config.call_hold_services)?,
                )?;
                if self.hf_indicators(config.features) {
                    self.phase = SessionPhase::W4ListGenericStatusIndicators;
                } else {
                    self.establish_service_level_connection(sink);
                }
                Ok(true)
            }
            (
                HfCommand::ListGenericStatusIndicators(_),
                SessionPhase::W4ListGenericStatusIndicators,
            ) => {
                self.send(rfcomm, &Response::ok()?)?;
                self.phase = SessionPhase::W4RetrieveGenericStatusIndicators;
                Ok(true)
            }
            (
                HfCommand::RetrieveGenericStatusIndicators,
                SessionPhase::W4RetrieveGenericStatusIndicators,
            ) => {
                self.send(
                    rfcomm,
                    &Response::generic_indicator_uuids(&config.generic_indicators)?,
                )?;
                self.phase = SessionPhase::W4RetrieveInitialStateGenericStatusIndicators;
                Ok(true)
            }
            (
                HfCommand::RetrieveGenericStatusIndicatorsState,
                SessionPhase::W4RetrieveInitialStateGenericStatusIndicators,
            ) => {
                self.send(
                    rfcomm,
                    &Response::generic_indicator_states(&config.generic_indicators)?,
                )?;
                self.establish_service_level_connection(sink);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Queries and unsolicited reports served while the SLC is established
    /// and no codec exchange or call is in flight.
    fn run_slc_queries<R: RfcommControl>(
        &mut self,
        rfcomm: &mut R,
        config: &AgConfig,
        operator: &NetworkOperator,
    ) -> Result<bool, Error> {
        if self.phase != SessionPhase::ServiceLevelConnectionEstablished {
            return Ok(false);
        }
        match self.command.clone() {
            Some(HfCommand::AvailableCodecs(codecs)) => {
                self.hf_codecs = codecs;
                self.send(rfcomm, &Response::ok()?)?;
                Ok(true)
            }
            Some(HfCommand::QueryOperatorSelection) => {
                self.send(rfcomm, &Response::operator(operator)?)?;
                Ok(true)
            }
            Some(HfCommand::TriggerCodecConnectionSetup) => {
                if !self.codec_negotiation(config.features) {
                    self.send(rfcomm, &Response::error()?)?;
                    return Ok(true);
                }
                self.suggest_codec_pending = true;
                self.phase = SessionPhase::SleW2ExchangeCommonCodec;
                self.send(rfcomm, &Response::ok()?)?;
                Ok(true)
            }
            None => {
                if let Some(code) = self.extended_error.take() {
                    self.send(rfcomm, &Response::extended_error(code)?)?;
                    return Ok(true);
                }
                if self.pending == PendingAction::StartCall {
                    return self.start_call(rfcomm, config);
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    /// Consumes a deferred call intent once `callsetup` is idle: reports the
    /// setup indicator and arms codec exchange, SCO setup and ringing.
    fn start_call<R: RfcommControl>(
        &mut self,
        rfcomm: &mut R,
        config: &AgConfig,
    ) -> Result<bool, Error> {
        let Some(position) = self.snapshot.position(names::CALL_SETUP) else {
            warn!("no callsetup indicator, dropping call intent");
            self.pending = PendingAction::None;
            return Ok(false);
        };
        if self.indicator_status(names::CALL_SETUP) != Some(CallSetupStatus::None as u8) {
            // A setup is still in progress; keep the intent pending.
            return Ok(false);
        }
        self.pending = PendingAction::None;

        let status = CallSetupStatus::Incoming as u8;
        let report = self.status_update_enabled;
        let mut update = None;
        if let Some(indicator) = self.snapshot.get_mut(position) {
            indicator.status = status;
            if report && indicator.enabled {
                update = Some(indicator.index);
            }
        }
        let mut emitted = false;
        if let Some(index) = update {
            self.send(rfcomm, &Response::indicator_update(index, status)?)?;
            emitted = true;
        }

        if self.codec_negotiation(config.features) {
            self.phase = SessionPhase::SleW2ExchangeCommonCodec;
            self.suggest_codec_pending = true;
        }
        self.establish_audio = true;
        self.start_ringing = true;
        Ok(emitted)
    }

    /// Codec negotiation, SCO management and the call ladder.
    fn run_codecs_and_call<R, H, S>(
        &mut self,
        rfcomm: &mut R,
        hci: &mut H,
        sink: &mut S,
        config: &AgConfig,
    ) -> Result<bool, Error>
    where
        R: RfcommControl,
        H: HciControl,
        S: EventSink,
    {
        if self.phase < SessionPhase::ServiceLevelConnectionEstablished
            || self.phase > SessionPhase::W2DisconnectSco
        {
            return Ok(false);
        }

        // A hang-up intent turns into indicator traffic first; SCO teardown
        // follows once the reports drained.
        if self.pending == PendingAction::TerminateCall
            && matches!(
                self.phase,
                SessionPhase::AudioConnectionEstablished
                    | SessionPhase::RingAlert
                    | SessionPhase::CallActive
            )
        {
            self.pending = PendingAction::None;
            self.terminating = true;
            self.start_ringing = false;
            if let Some(position) = self.snapshot.position(names::CALL_SETUP) {
                if self.indicator_status(names::CALL_SETUP) != Some(CallSetupStatus::None as u8) {
                    self.queue_indicator_update(position, CallSetupStatus::None as u8);
                }
            }
            if let Some(position) = self.snapshot.position(names::CALL) {
                if self.indicator_status(names::CALL) != Some(CallStatus::None as u8) {
                    self.queue_indicator_update(position, CallStatus::None as u8);
                }
            }
        }

        let mut done = false;
        match self.phase {
            SessionPhase::SleW2ExchangeCommonCodec => {
                if let Some(HfCommand::AvailableCodecs(codecs)) = self.command.clone() {
                    // A fresh list before our suggestion went out; the next
                    // `+BCS` picks it up.
                    self.hf_codecs = codecs;
                    self.send(rfcomm, &Response::ok()?)?;
                    done = true;
                } else if self.suggest_codec_pending {
                    self.suggest_codec_pending = false;
                    self.suggested_codec = common_codec(&config.codecs, &self.hf_codecs);
                    self.phase = SessionPhase::SleW4ExchangeCommonCodec;
                    debug!("suggesting codec {}", self.suggested_codec);
                    self.send(rfcomm, &Response::suggest_codec(self.suggested_codec)?)?;
                    done = true;
                }
            }
            SessionPhase::SleW4ExchangeCommonCodec
            | SessionPhase::CodecsConnectionEstablished => match self.command.clone() {
                Some(HfCommand::AvailableCodecs(codecs)) => {
                    self.hf_codecs = codecs;
                    let recomputed = common_codec(&config.codecs, &self.hf_codecs);
                    if recomputed != self.suggested_codec {
                        // Restart the exchange with the new suggestion.
                        self.suggested_codec = recomputed;
                        self.phase = SessionPhase::SleW2ExchangeCommonCodec;
                        self.suggest_codec_pending = true;
                    }
                    self.send(rfcomm, &Response::ok()?)?;
                    done = true;
                }
                Some(HfCommand::ConfirmedCodec(codec))
                    if self.phase == SessionPhase::SleW4ExchangeCommonCodec =>
                {
                    if codec == self.suggested_codec {
                        self.negotiated_codec = codec;
                        self.phase = SessionPhase::CodecsConnectionEstablished;
                        info!("codecs connection established, codec {}", codec);
                        sink.on_event(AgEvent::CodecsConnectionComplete { addr: self.addr });
                        self.send(rfcomm, &Response::ok()?)?;
                    } else {
                        warn!(
                            "HF confirmed codec {}, suggested {}",
                            codec, self.suggested_codec
                        );
                        self.phase = SessionPhase::ServiceLevelConnectionEstablished;
                        self.send(rfcomm, &Response::error()?)?;
                    }
                    done = true;
                }
                _ => {}
            },
            SessionPhase::W2DisconnectSco => {
                self.phase = SessionPhase::W4ScoDisconnected;
                if let Some(handle) = self.sco_handle {
                    hci.disconnect_sco(handle);
                }
                done = true;
            }
            SessionPhase::AudioConnectionEstablished => {
                if self.start_ringing {
                    self.start_ringing = false;
                    self.phase = SessionPhase::RingAlert;
                    sink.on_event(AgEvent::StartRinging { addr: self.addr });
                }
            }
            SessionPhase::RingAlert => {
                if matches!(self.command, Some(HfCommand::CallAnswered)) {
                    self.phase = SessionPhase::CallActive;
                    sink.on_event(AgEvent::StopRinging { addr: self.addr });
                    sink.on_event(AgEvent::CallActive { addr: self.addr });
                    if let Some(position) = self.snapshot.position(names::CALL) {
                        self.queue_indicator_update(position, CallStatus::Active as u8);
                    }
                    if let Some(position) = self.snapshot.position(names::CALL_SETUP) {
                        self.queue_indicator_update(position, CallSetupStatus::None as u8);
                    }
                    self.send(rfcomm, &Response::ok()?)?;
                    done = true;
                }
            }
            _ => {}
        }

        // One queued +CIEV per tick keeps report ordering deterministic.
        if !done {
            if let Some((index, status)) = self.indicator_updates.pop_front() {
                self.send(rfcomm, &Response::indicator_update(index, status)?)?;
                done = true;
            }
        }

        if !done && self.terminating && self.indicator_updates.is_empty() {
            match self.sco_handle {
                Some(_) if self.phase < SessionPhase::W2DisconnectSco => {
                    self.phase = SessionPhase::W2DisconnectSco;
                    done = true;
                }
                None => {
                    self.terminating = false;
                    self.phase = SessionPhase::ServiceLevelConnectionEstablished;
                    sink.on_event(AgEvent::CallTerminated { addr: self.addr });
                }
                _ => {}
            }
        }

        if !done && self.establish_audio {
            if self.codec_negotiation(config.features)
                && self.phase < SessionPhase::SleW4ExchangeCommonCodec
            {
                self.suggest_codec_pending = false;
                self.suggested_codec = common_codec(&config.codecs, &self.hf_codecs);
                self.phase = SessionPhase::SleW4ExchangeCommonCodec;
                self.send(rfcomm, &Response::suggest_codec(self.suggested_codec)?)?;
                done = true;
            } else if self.phase == SessionPhase::CodecsConnectionEstablished
                || (!self.codec_negotiation(config.features)
                    && self.phase == SessionPhase::ServiceLevelConnectionEstablished)
            {
                self.establish_audio = false;
                self.phase = SessionPhase::W4ScoConnected;
                let params = ScoParams::template(hci.sco_voice_setting());
                hci.setup_synchronous_connection(self.acl, params);
                done = true;
            }
        }

        if !done && self.pending == PendingAction::ReleaseAudio {
            match self.sco_handle {
                Some(handle)
                    if matches!(
                        self.phase,
                        SessionPhase::AudioConnectionEstablished
                            | SessionPhase::RingAlert
                            | SessionPhase::CallActive
                    ) =>
                {
                    self.pending = PendingAction::None;
                    self.phase = SessionPhase::W4ScoDisconnected;
                    hci.disconnect_sco(handle);
                    done = true;
                }
                None => self.pending = PendingAction::None,
                _ => {}
            }
        }

        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::boxed::Box;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::vec::Vec as StdVec;

    use assert_matches::assert_matches;

    use crate::features::{CODEC_CVSD, CODEC_MSBC};
    use crate::test_helpers::{config, event_log, MockHci, MockRfcomm, ACL, ADDR, CHANNEL, SCO};

    struct Harness {
        session: Session,
        rfcomm: MockRfcomm,
        hci: MockHci,
        config: AgConfig,
        operator: NetworkOperator,
        events: Rc<RefCell<StdVec<AgEvent>>>,
        sink: Box<dyn FnMut(AgEvent)>,
    }

    impl Harness {
        fn new(features: AgFeatures) -> Self {
            let (events, sink) = event_log();
            Self {
                session: Session::new(ADDR, CHANNEL, ACL),
                rfcomm: MockRfcomm::new(),
                hci: MockHci::new(),
                config: config(features),
                operator: NetworkOperator::default(),
                events,
                sink: Box::new(sink),
            }
        }

        fn tick(&mut self) {
            self.session
                .run(
                    &mut self.rfcomm,
                    &mut self.hci,
                    &mut self.sink,
                    &self.config,
                    &self.operator,
                )
                .unwrap();
        }

        /// Stages a decoded command and runs one tick.
        fn command(&mut self, command: HfCommand) {
            self.session.on_command(command);
            self.tick();
        }

        fn sent(&mut self) -> StdVec<StdVec<u8>> {
            self.rfcomm.take_sent()
        }

        fn expect_sent(&mut self, expected: &[&[u8]]) {
            let sent = self.sent();
            assert_eq!(sent.len(), expected.len(), "frames: {:?}", sent);
            for (frame, expected) in sent.iter().zip(expected.iter()) {
                assert_eq!(frame.as_slice(), *expected);
            }
        }

        fn events(&mut self) -> StdVec<AgEvent> {
            self.events.borrow_mut().drain(..).collect()
        }

        /// Drives the mandatory SLC ladder for the given HF feature bitmap
        /// and drains the exchanged frames and events.
        fn establish_slc(&mut self, hf_features: HfFeatures) {
            self.command(HfCommand::SupportedFeatures(hf_features.bits()));
            if self.session.codec_negotiation(self.config.features) {
                let codecs = CodecList::from_slice(&[CODEC_MSBC, CODEC_CVSD]).unwrap();
                self.command(HfCommand::AvailableCodecs(codecs));
            }
            self.command(HfCommand::RetrieveIndicators);
            self.command(HfCommand::RetrieveIndicatorsStatus);
            self.command(HfCommand::EnableIndicatorStatusUpdate(true));
            assert!(self.session.phase >= SessionPhase::ServiceLevelConnectionEstablished);
            let _ = self.sent();
            let _ = self.events();
        }
    }

    fn codecs(list: &[u8]) -> CodecList {
        CodecList::from_slice(list).unwrap()
    }

    #[test]
    fn slc_happy_path_without_optional_features() {
        let mut harness = Harness::new(AgFeatures::empty());

        harness.command(HfCommand::SupportedFeatures(0));
        harness.expect_sent(&[b"\r\n+BRSF:0\r\n\r\nOK\r\n"]);
        assert_eq!(harness.session.phase, SessionPhase::W4RetrieveIndicators);

        harness.command(HfCommand::RetrieveIndicators);
        harness.expect_sent(&[
            b"\r\n+CIND:(\"service\",(0,1)),(\"call\",(0,1)),(\"callsetup\",(0,3))\r\n\r\nOK\r\n",
        ]);

        harness.command(HfCommand::RetrieveIndicatorsStatus);
        harness.expect_sent(&[b"\r\n+CIND:1,0,0\r\n\r\nOK\r\n"]);

        harness.command(HfCommand::EnableIndicatorStatusUpdate(true));
        harness.expect_sent(&[b"\r\nOK\r\n"]);
        assert_eq!(
            harness.session.phase,
            SessionPhase::ServiceLevelConnectionEstablished
        );
        assert_eq!(
            harness.events(),
            [AgEvent::ServiceLevelConnectionEstablished { addr: ADDR }]
        );
    }

    #[test]
    fn slc_includes_codec_step_when_mutually_supported() {
        let mut harness = Harness::new(AgFeatures::CODEC_NEGOTIATION);

        harness.command(HfCommand::SupportedFeatures(
            HfFeatures::CODEC_NEGOTIATION.bits(),
        ));
        assert_eq!(harness.session.phase, SessionPhase::W4NotifyOnCodecs);

        harness.command(HfCommand::AvailableCodecs(codecs(&[CODEC_MSBC, CODEC_CVSD])));
        assert_eq!(harness.session.phase, SessionPhase::W4RetrieveIndicators);
        let sent = harness.sent();
        assert_eq!(sent.last().unwrap().as_slice(), b"\r\nOK\r\n");
    }

    #[test]
    fn slc_skips_codec_step_without_mutual_support() {
        // The AG offers codec negotiation but the HF does not.
        let mut harness = Harness::new(AgFeatures::CODEC_NEGOTIATION);
        harness.command(HfCommand::SupportedFeatures(HfFeatures::NR_EC.bits()));
        assert_eq!(harness.session.phase, SessionPhase::W4RetrieveIndicators);
    }

    #[test]
    fn slc_full_optional_ladder() {
        let ag = AgFeatures::CODEC_NEGOTIATION
            | AgFeatures::THREE_WAY_CALLING
            | AgFeatures::HF_INDICATORS;
        let hf = HfFeatures::CODEC_NEGOTIATION
            | HfFeatures::THREE_WAY_CALLING
            | HfFeatures::HF_INDICATORS;
        let mut harness = Harness::new(ag);

        harness.command(HfCommand::SupportedFeatures(hf.bits()));
        harness.command(HfCommand::AvailableCodecs(codecs(&[CODEC_CVSD])));
        harness.command(HfCommand::RetrieveIndicators);
        harness.command(HfCommand::RetrieveIndicatorsStatus);
        harness.command(HfCommand::EnableIndicatorStatusUpdate(true));
        assert_eq!(harness.session.phase, SessionPhase::W4RetrieveCanHoldCall);
        let _ = harness.sent();

        harness.command(HfCommand::RetrieveCallHoldServices);
        harness.expect_sent(&[b"\r\n+CHLD:(1,1x,2,2x,3)\r\n\r\nOK\r\n"]);
        assert_eq!(
            harness.session.phase,
            SessionPhase::W4ListGenericStatusIndicators
        );

        harness.command(HfCommand::ListGenericStatusIndicators(
            heapless::Vec::from_slice(&[1, 2]).unwrap(),
        ));
        harness.expect_sent(&[b"\r\nOK\r\n"]);

        harness.command(HfCommand::RetrieveGenericStatusIndicators);
        harness.expect_sent(&[b"\r\n+BIND:(1,2)\r\n\r\nOK\r\n"]);

        assert!(harness.events().is_empty());
        harness.command(HfCommand::RetrieveGenericStatusIndicatorsState);
        harness.expect_sent(&[b"\r\n+BIND:1,1\r\n\r\n+BIND:2,0\r\n\r\nOK\r\n"]);
        assert_eq!(
            harness.session.phase,
            SessionPhase::ServiceLevelConnectionEstablished
        );
        assert_eq!(
            harness.events(),
            [AgEvent::ServiceLevelConnectionEstablished { addr: ADDR }]
        );
    }

    #[test]
    fn out_of_order_command_during_slc_answers_error() {
        let mut harness = Harness::new(AgFeatures::empty());
        harness.command(HfCommand::SupportedFeatures(0));
        let _ = harness.sent();

        // The status query must not come before the definition query.
        harness.command(HfCommand::RetrieveIndicatorsStatus);
        harness.expect_sent(&[b"\r\nERROR\r\n"]);
        assert_eq!(harness.session.phase, SessionPhase::W4RetrieveIndicators);

        // The ladder continues where it stood.
        harness.command(HfCommand::RetrieveIndicators);
        let sent = harness.sent();
        assert!(sent[0].starts_with(b"\r\n+CIND:("));
    }

    #[test]
    fn unknown_command_answers_single_error() {
        let mut harness = Harness::new(AgFeatures::empty());
        harness.command(HfCommand::Unknown);
        harness.expect_sent(&[b"\r\nERROR\r\n"]);

        // The command was discarded; further ticks stay silent.
        harness.tick();
        harness.tick();
        assert!(harness.sent().is_empty());
    }

    #[test]
    fn run_is_idempotent_when_idle() {
        let mut harness = Harness::new(AgFeatures::empty());
        harness.establish_slc(HfFeatures::empty());
        for _ in 0..5 {
            harness.tick();
        }
        assert!(harness.sent().is_empty());
        assert!(harness.events().is_empty());
    }

    #[test]
    fn blocked_channel_defers_the_response() {
        let mut harness = Harness::new(AgFeatures::empty());
        harness.rfcomm.blocked = true;
        harness.command(HfCommand::SupportedFeatures(0));
        assert!(harness.sent().is_empty());

        harness.rfcomm.blocked = false;
        harness.tick();
        harness.expect_sent(&[b"\r\n+BRSF:0\r\n\r\nOK\r\n"]);
    }

    #[test]
    fn hf_initiated_codec_connection() {
        let mut harness = Harness::new(AgFeatures::CODEC_NEGOTIATION);
        harness.establish_slc(HfFeatures::CODEC_NEGOTIATION);

        harness.command(HfCommand::TriggerCodecConnectionSetup);
        harness.expect_sent(&[b"\r\nOK\r\n"]);
        assert_eq!(harness.session.phase, SessionPhase::SleW2ExchangeCommonCodec);

        harness.tick();
        harness.expect_sent(&[b"\r\n+BCS:1\r\n"]);
        assert_eq!(harness.session.phase, SessionPhase::SleW4ExchangeCommonCodec);

        harness.command(HfCommand::ConfirmedCodec(CODEC_CVSD));
        harness.expect_sent(&[b"\r\nOK\r\n"]);
        assert_eq!(
            harness.session.phase,
            SessionPhase::CodecsConnectionEstablished
        );
        assert_eq!(harness.session.negotiated_codec, CODEC_CVSD);
        assert_eq!(
            harness.events(),
            [AgEvent::CodecsConnectionComplete { addr: ADDR }]
        );
    }

    #[test]
    fn codec_mismatch_reverts_to_slc() {
        let mut harness = Harness::new(AgFeatures::CODEC_NEGOTIATION);
        harness.establish_slc(HfFeatures::CODEC_NEGOTIATION);

        harness.command(HfCommand::TriggerCodecConnectionSetup);
        harness.tick();
        let _ = harness.sent();

        harness.command(HfCommand::ConfirmedCodec(CODEC_MSBC));
        harness.expect_sent(&[b"\r\nERROR\r\n"]);
        assert_eq!(
            harness.session.phase,
            SessionPhase::ServiceLevelConnectionEstablished
        );
        assert!(harness.events().is_empty());
    }

    #[test]
    fn fresh_codec_list_restarts_the_exchange() {
        let mut harness = Harness::new(AgFeatures::CODEC_NEGOTIATION);
        harness.establish_slc(HfFeatures::CODEC_NEGOTIATION);

        harness.command(HfCommand::TriggerCodecConnectionSetup);
        harness.tick();
        harness.command(HfCommand::ConfirmedCodec(CODEC_CVSD));
        let _ = harness.sent();
        let _ = harness.events();

        // CVSD disappears from the HF list, the common codec becomes mSBC.
        harness.command(HfCommand::AvailableCodecs(codecs(&[3, CODEC_MSBC])));
        harness.expect_sent(&[b"\r\nOK\r\n"]);
        assert_eq!(harness.session.phase, SessionPhase::SleW2ExchangeCommonCodec);

        harness.tick();
        harness.expect_sent(&[b"\r\n+BCS:2\r\n"]);
    }

    #[test]
    fn fresh_codec_list_before_suggestion_is_sent() {
        let mut harness = Harness::new(AgFeatures::CODEC_NEGOTIATION);
        harness.establish_slc(HfFeatures::CODEC_NEGOTIATION);

        harness.command(HfCommand::TriggerCodecConnectionSetup);
        let _ = harness.sent();

        // The list arrives while the suggestion is still queued; the
        // suggestion must reflect it.
        harness.command(HfCommand::AvailableCodecs(codecs(&[CODEC_MSBC])));
        harness.expect_sent(&[b"\r\nOK\r\n"]);

        harness.tick();
        harness.expect_sent(&[b"\r\n+BCS:2\r\n"]);
    }

    #[test]
    fn matching_confirmation_keeps_suggested_codec_stable() {
        let mut harness = Harness::new(AgFeatures::CODEC_NEGOTIATION);
        harness.establish_slc(HfFeatures::CODEC_NEGOTIATION);

        harness.command(HfCommand::TriggerCodecConnectionSetup);
        harness.tick();
        harness.command(HfCommand::ConfirmedCodec(CODEC_CVSD));
        let _ = harness.sent();

        // Re-advertising the same list must not restart the exchange.
        harness.command(HfCommand::AvailableCodecs(codecs(&[CODEC_MSBC, CODEC_CVSD])));
        harness.expect_sent(&[b"\r\nOK\r\n"]);
        assert_eq!(
            harness.session.phase,
            SessionPhase::CodecsConnectionEstablished
        );
    }

    #[test]
    fn operator_query_and_format_selection() {
        let mut harness = Harness::new(AgFeatures::empty());
        harness.establish_slc(HfFeatures::empty());
        harness.operator = NetworkOperator::new(0, "Operator").unwrap();

        harness.command(HfCommand::SetOperatorFormat { format: 0 });
        harness.expect_sent(&[b"\r\nOK\r\n"]);

        harness.command(HfCommand::QueryOperatorSelection);
        harness.expect_sent(&[b"\r\n+COPS:0,0,\"Operator\"\r\n\r\nOK\r\n"]);

        // Only the long alphanumeric format is supported.
        harness.command(HfCommand::SetOperatorFormat { format: 1 });
        harness.expect_sent(&[b"\r\nERROR\r\n"]);
    }

    #[test]
    fn extended_error_report_requires_opt_in() {
        let mut harness = Harness::new(AgFeatures::EXTENDED_ERROR_CODES);
        harness.establish_slc(HfFeatures::empty());

        // Not enabled: the report is dropped without wire traffic.
        harness.session.report_extended_error(4);
        harness.tick();
        assert!(harness.sent().is_empty());

        harness.command(HfCommand::EnableExtendedErrors(true));
        harness.expect_sent(&[b"\r\nOK\r\n"]);

        harness.session.report_extended_error(4);
        harness.tick();
        harness.expect_sent(&[b"\r\n+CMEE=4\r\n"]);

        // The report fires exactly once.
        harness.tick();
        assert!(harness.sent().is_empty());
    }

    #[test]
    fn individual_indicator_mask_is_applied() {
        let mut harness = Harness::new(AgFeatures::empty());
        harness.establish_slc(HfFeatures::empty());

        let mask = heapless::Vec::from_slice(&[Some(false), Some(false), None]).unwrap();
        harness.command(HfCommand::EnableIndividualIndicators(mask));
        harness.expect_sent(&[b"\r\nOK\r\n"]);
        assert!(!harness.session.snapshot.get(0).unwrap().enabled);
        // The call indicator may not be disabled.
        assert!(harness.session.snapshot.get(1).unwrap().enabled);
    }

    #[test]
    fn call_intent_defers_while_setup_in_progress() {
        let mut harness = Harness::new(AgFeatures::CODEC_NEGOTIATION);
        harness.establish_slc(HfFeatures::CODEC_NEGOTIATION);

        // Another call setup is still in flight.
        let position = harness.session.snapshot.position(names::CALL_SETUP).unwrap();
        harness.session.snapshot.get_mut(position).unwrap().status =
            CallSetupStatus::OutgoingDialing as u8;

        harness.session.request_call();
        harness.tick();
        assert!(harness.sent().is_empty());
        assert_eq!(
            harness.session.phase,
            SessionPhase::ServiceLevelConnectionEstablished
        );

        // Once the setup settles the intent fires.
        harness.session.snapshot.get_mut(position).unwrap().status =
            CallSetupStatus::None as u8;
        harness.tick();
        harness.expect_sent(&[b"\r\n+CIEV:3,1\r\n"]);
        assert_eq!(harness.session.phase, SessionPhase::SleW2ExchangeCommonCodec);
    }

    #[test]
    fn call_without_codec_negotiation_goes_straight_to_sco() {
        let mut harness = Harness::new(AgFeatures::empty());
        harness.establish_slc(HfFeatures::empty());

        harness.session.request_call();
        harness.tick();
        harness.expect_sent(&[b"\r\n+CIEV:3,1\r\n"]);
        assert_eq!(
            harness.session.phase,
            SessionPhase::ServiceLevelConnectionEstablished
        );

        // No codec rungs to climb; the next tick requests the SCO link.
        harness.tick();
        assert_eq!(harness.session.phase, SessionPhase::W4ScoConnected);
        assert_eq!(harness.hci.sco_requests.len(), 1);

        harness.session.on_sco_connected(SCO, &mut harness.sink);
        harness.tick();
        assert_eq!(harness.session.phase, SessionPhase::RingAlert);
    }

    #[test]
    fn answer_outside_ring_alert_answers_error() {
        let mut harness = Harness::new(AgFeatures::empty());
        harness.establish_slc(HfFeatures::empty());
        harness.command(HfCommand::CallAnswered);
        harness.expect_sent(&[b"\r\nERROR\r\n"]);
        assert_eq!(
            harness.session.phase,
            SessionPhase::ServiceLevelConnectionEstablished
        );
    }

    #[test]
    fn hang_up_from_active_call_reports_and_releases() {
        let mut harness = Harness::new(AgFeatures::CODEC_NEGOTIATION);
        harness.establish_slc(HfFeatures::CODEC_NEGOTIATION);

        // Jump to an active call with audio up.
        let call = harness.session.snapshot.position(names::CALL).unwrap();
        harness.session.snapshot.get_mut(call).unwrap().status = CallStatus::Active as u8;
        harness.session.phase = SessionPhase::CallActive;
        harness.session.sco_handle = Some(SCO);

        harness.command(HfCommand::CallTerminated);
        harness.expect_sent(&[b"\r\nOK\r\n"]);

        harness.tick();
        harness.expect_sent(&[b"\r\n+CIEV:2,0\r\n"]);

        harness.tick();
        assert_eq!(harness.session.phase, SessionPhase::W2DisconnectSco);
        harness.tick();
        assert_eq!(harness.session.phase, SessionPhase::W4ScoDisconnected);
        assert_eq!(harness.hci.sco_disconnects, [SCO]);

        harness.session.on_sco_disconnected(&mut harness.sink);
        assert_eq!(
            harness.session.phase,
            SessionPhase::ServiceLevelConnectionEstablished
        );
        assert_eq!(harness.events(), [AgEvent::CallTerminated { addr: ADDR }]);
    }

    #[test]
    fn rfcomm_teardown_happens_on_idle_tick() {
        let mut harness = Harness::new(AgFeatures::empty());
        harness.establish_slc(HfFeatures::empty());

        harness.session.release_connection();
        assert_eq!(harness.session.phase, SessionPhase::W2DisconnectRfcomm);

        harness.tick();
        assert_eq!(harness.session.phase, SessionPhase::W4RfcommDisconnected);
        assert_eq!(harness.rfcomm.disconnects, [CHANNEL]);
        assert!(harness.sent().is_empty());
    }

    #[test]
    fn audio_request_needs_mutual_codec_negotiation() {
        let mut harness = Harness::new(AgFeatures::empty());
        harness.establish_slc(HfFeatures::CODEC_NEGOTIATION);

        harness.session.request_audio(harness.config.features);
        harness.tick();
        assert!(harness.sent().is_empty());
        assert!(harness.hci.sco_requests.is_empty());
        assert_matches!(
            harness.session.phase,
            SessionPhase::ServiceLevelConnectionEstablished
        );
    }
}
