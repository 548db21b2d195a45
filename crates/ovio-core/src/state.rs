//! State enums shared by operations, channels and sessions.
//!
//! All are `#[repr(u8)]` so they can live in an atomic where a lock
//! would be overkill.

use core::fmt;

/// Status of a pending asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpStatus {
    /// Issued, not yet complete
    Pending = 0,
    /// Completed successfully
    Complete = 1,
    /// Failed at completion time (or aborted)
    Error = 2,
}

impl OpStatus {
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, OpStatus::Pending)
    }
}

impl From<u8> for OpStatus {
    fn from(v: u8) -> Self {
        match v {
            1 => OpStatus::Complete,
            2 => OpStatus::Error,
            _ => OpStatus::Pending,
        }
    }
}

/// Connection state of a duplex channel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Disconnected = 0,
    /// Waiting for a peer (overlapped connect in flight)
    Listening = 1,
    Connected = 2,
    /// Released; no further operations
    Closed = 3,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Listening => "listening",
            ChannelState::Connected => "connected",
            ChannelState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Connection status of a streaming protocol session.
///
/// `NotInitialised → Connecting → Connected → (Closing →) Closed`, with
/// `Error` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    NotInitialised = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
    Closed = 4,
    Error = 5,
}

impl SessionStatus {
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Error)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub const fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (*self, next) {
            (Closed, _) | (Error, _) => false,
            (_, Error) => true,
            (NotInitialised, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Closing) | (Connected, Closed) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }
}

impl From<u8> for SessionStatus {
    fn from(v: u8) -> Self {
        match v {
            1 => SessionStatus::Connecting,
            2 => SessionStatus::Connected,
            3 => SessionStatus::Closing,
            4 => SessionStatus::Closed,
            5 => SessionStatus::Error,
            _ => SessionStatus::NotInitialised,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Receive-side state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadState {
    NotInitiated = 0,
    Initiated = 1,
    /// At least one fragment of the current message has arrived
    PartialRead = 2,
    Finished = 3,
    Error = 4,
}

impl ReadState {
    /// A receive is outstanding.
    #[inline]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, ReadState::Initiated | ReadState::PartialRead)
    }
}

/// Send-side state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WriteState {
    NotInitiated = 0,
    Initiated = 1,
    Finished = 2,
    Error = 3,
}

impl WriteState {
    #[inline]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, WriteState::Initiated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_transitions() {
        use SessionStatus::*;
        assert!(NotInitialised.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(Connected.can_transition_to(Closed));

        for s in [NotInitialised, Connecting, Connected, Closing] {
            assert!(s.can_transition_to(Error), "{s} -> Error");
        }
        for s in [Closed, Error] {
            assert!(s.is_terminal());
            assert!(!s.can_transition_to(Error));
            assert!(!s.can_transition_to(Connecting));
        }
        assert!(!NotInitialised.can_transition_to(Connected));
    }

    #[test]
    fn test_u8_roundtrip() {
        for s in [OpStatus::Pending, OpStatus::Complete, OpStatus::Error] {
            assert_eq!(OpStatus::from(s as u8), s);
        }
        assert_eq!(SessionStatus::from(5), SessionStatus::Error);
        assert_eq!(SessionStatus::from(200), SessionStatus::NotInitialised);
    }

    #[test]
    fn test_in_flight() {
        assert!(ReadState::Initiated.is_in_flight());
        assert!(ReadState::PartialRead.is_in_flight());
        assert!(!ReadState::Finished.is_in_flight());
        assert!(WriteState::Initiated.is_in_flight());
        assert!(!WriteState::Error.is_in_flight());
    }
}
