//! EP0 control transfer state machine

use usb_device::UsbDirection;

use crate::error::Error;

/// Where EP0 is in a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ep0State {
    /// The host is detached
    #[default]
    Disconnected,
    /// Waiting for a setup packet
    Idle,
    InDataPhase,
    OutDataPhase,
    InStatusPhase,
    OutStatusPhase,
    /// A protocol error stalled the endpoint
    Stalled,
}

/// Something that moves EP0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ep0Event {
    /// The host attached
    Attach,
    /// A setup packet arrived
    Setup { direction: UsbDirection, length: u16 },
    /// The data phase completed
    DataDone,
    /// The status phase completed
    StatusDone,
    /// The transfer failed
    Stall,
    /// The stall was cleared
    ClearHalt,
    /// The host detached
    Detach,
}

impl Ep0State {
    /// The state after `event`
    ///
    /// Events that don't apply to the current state are errors, and leave
    /// the state alone.
    pub fn next(self, event: Ep0Event) -> Result<Ep0State, Error> {
        use Ep0State::*;
        match (self, event) {
            (_, Ep0Event::Detach) => Ok(Disconnected),
            (Disconnected, Ep0Event::Attach) => Ok(Idle),
            (state, Ep0Event::Attach) => Ok(state),
            (Disconnected, _) => Err(Error::NotReady),
            (_, Ep0Event::Setup { length: 0, .. }) => Ok(InStatusPhase),
            (_, Ep0Event::Setup { direction, .. }) => Ok(match direction {
                UsbDirection::In => InDataPhase,
                UsbDirection::Out => OutDataPhase,
            }),
            (InDataPhase, Ep0Event::DataDone) => Ok(OutStatusPhase),
            (OutDataPhase, Ep0Event::DataDone) => Ok(InStatusPhase),
            (InStatusPhase | OutStatusPhase, Ep0Event::StatusDone) => Ok(Idle),
            (_, Ep0Event::Stall) => Ok(Stalled),
            (Stalled, Ep0Event::ClearHalt) => Ok(Idle),
            (state, Ep0Event::ClearHalt) => Ok(state),
            (_, Ep0Event::DataDone | Ep0Event::StatusDone) => Err(Error::InvalidArgument),
        }
    }

    /// Indicates a control transfer between setup and status completion
    pub fn in_transfer(self) -> bool {
        matches!(
            self,
            Ep0State::InDataPhase
                | Ep0State::OutDataPhase
                | Ep0State::InStatusPhase
                | Ep0State::OutStatusPhase
        )
    }

    /// The direction of the data phase, if EP0 is in one
    pub fn data_direction(self) -> Option<UsbDirection> {
        match self {
            Ep0State::InDataPhase => Some(UsbDirection::In),
            Ep0State::OutDataPhase => Some(UsbDirection::Out),
            _ => None,
        }
    }

    /// The direction of the status phase that follows the current data
    /// phase, or that's running now
    pub fn status_direction(self) -> Option<UsbDirection> {
        match self {
            Ep0State::InStatusPhase | Ep0State::OutDataPhase => Some(UsbDirection::In),
            Ep0State::OutStatusPhase | Ep0State::InDataPhase => Some(UsbDirection::Out),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Ep0Event, Ep0State};
    use crate::error::Error;
    use usb_device::UsbDirection;

    const ALL: [Ep0State; 7] = [
        Ep0State::Disconnected,
        Ep0State::Idle,
        Ep0State::InDataPhase,
        Ep0State::OutDataPhase,
        Ep0State::InStatusPhase,
        Ep0State::OutStatusPhase,
        Ep0State::Stalled,
    ];

    fn setup(direction: UsbDirection, length: u16) -> Ep0Event {
        Ep0Event::Setup { direction, length }
    }

    #[test]
    fn detach_from_anywhere() {
        for state in ALL {
            assert_eq!(state.next(Ep0Event::Detach), Ok(Ep0State::Disconnected));
        }
    }

    #[test]
    fn attach() {
        assert_eq!(
            Ep0State::Disconnected.next(Ep0Event::Attach),
            Ok(Ep0State::Idle)
        );
        assert_eq!(
            Ep0State::InDataPhase.next(Ep0Event::Attach),
            Ok(Ep0State::InDataPhase)
        );
    }

    #[test]
    fn in_transfer() {
        let state = Ep0State::Idle;
        let state = state.next(setup(UsbDirection::In, 18)).unwrap();
        assert_eq!(state, Ep0State::InDataPhase);
        assert_eq!(state.data_direction(), Some(UsbDirection::In));
        let state = state.next(Ep0Event::DataDone).unwrap();
        assert_eq!(state, Ep0State::OutStatusPhase);
        assert_eq!(state.next(Ep0Event::StatusDone), Ok(Ep0State::Idle));
    }

    #[test]
    fn out_transfer() {
        let state = Ep0State::Idle.next(setup(UsbDirection::Out, 4)).unwrap();
        assert_eq!(state, Ep0State::OutDataPhase);
        assert_eq!(state.status_direction(), Some(UsbDirection::In));
        let state = state.next(Ep0Event::DataDone).unwrap();
        assert_eq!(state, Ep0State::InStatusPhase);
        assert_eq!(state.next(Ep0Event::StatusDone), Ok(Ep0State::Idle));
    }

    #[test]
    fn zero_length_skips_data() {
        for direction in [UsbDirection::In, UsbDirection::Out] {
            assert_eq!(
                Ep0State::Idle.next(setup(direction, 0)),
                Ok(Ep0State::InStatusPhase)
            );
        }
    }

    #[test]
    fn no_setup_while_detached() {
        assert_eq!(
            Ep0State::Disconnected.next(setup(UsbDirection::In, 8)),
            Err(Error::NotReady)
        );
        assert_eq!(
            Ep0State::Disconnected.next(Ep0Event::Stall),
            Err(Error::NotReady)
        );
    }

    #[test]
    fn stall_cleared_by_setup_or_clear_halt() {
        let stalled = Ep0State::OutDataPhase.next(Ep0Event::Stall).unwrap();
        assert_eq!(stalled, Ep0State::Stalled);
        assert_eq!(stalled.next(Ep0Event::ClearHalt), Ok(Ep0State::Idle));
        assert_eq!(
            stalled.next(setup(UsbDirection::Out, 0)),
            Ok(Ep0State::InStatusPhase)
        );
        assert_eq!(stalled.next(Ep0Event::DataDone), Err(Error::InvalidArgument));
    }

    #[test]
    fn out_of_order_completions() {
        assert_eq!(
            Ep0State::Idle.next(Ep0Event::DataDone),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            Ep0State::InDataPhase.next(Ep0Event::StatusDone),
            Err(Error::InvalidArgument)
        );
        assert!(!Ep0State::Idle.in_transfer());
        assert!(Ep0State::OutStatusPhase.in_transfer());
    }
}
