//! Events reported to the upper layer.

use crate::transport::{BdAddr, ScoHandle};

/// Session lifecycle events, published in the order the state machine
/// produces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AgEvent {
    ServiceLevelConnectionEstablished { addr: BdAddr },
    CodecsConnectionComplete { addr: BdAddr },
    AudioConnectionEstablished { addr: BdAddr, handle: ScoHandle },
    StartRinging { addr: BdAddr },
    StopRinging { addr: BdAddr },
    CallActive { addr: BdAddr },
    CallTerminated { addr: BdAddr },
    Disconnected { addr: BdAddr },
}

/// Receiver of [`AgEvent`]s. Any `FnMut(AgEvent)` closure qualifies.
pub trait EventSink {
    fn on_event(&mut self, event: AgEvent);
}

impl<F> EventSink for F
where
    F: FnMut(AgEvent),
{
    fn on_event(&mut self, event: AgEvent) {
        self(event)
    }
}
