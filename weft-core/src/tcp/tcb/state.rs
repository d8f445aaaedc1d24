/// The connection states a [`Tcb`](super::Tcb) moves through, per RFC 9293
/// section 3.3.2. CLOSED and LISTEN are not represented here: an endpoint
/// without a TCB is closed, and listening is the business of the engine's
/// listener registry. The reachable transitions:
///
/// ```text
///   (active open / deferred open)          (adopted from a listener)
///        SYN_SENT ------------------------------ SYN_RECEIVED
///            \  rcv SYN+ACK        rcv ACK of SYN  /
///             \                                   /
///              +--------- ESTABLISHED -----------+
///               close /        |        \ rcv FIN
///              snd FIN         |         \
///            FIN_WAIT_1        |        CLOSE_WAIT --- close --> LAST_ACK
///             |       \     rcv FIN                                 |
///  rcv ACK of FIN      \ rcv FIN                            rcv ACK of FIN
///             |         \                                           |
///        FIN_WAIT_2     CLOSING                                  (closed)
///             | rcv FIN     | rcv ACK of FIN
///             +------- TIME_WAIT ------ 2MSL elapsed ------> (closed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// A connection request is on the wire and unanswered.
    SynSent,
    /// A connection request was received and answered; the final
    /// acknowledgment is outstanding.
    SynReceived,
    /// The data-transfer state.
    Established,
    /// We closed first and our FIN is unacknowledged.
    FinWait1,
    /// Our FIN is acknowledged; waiting for the peer's.
    FinWait2,
    /// The peer closed first; the application may still send.
    CloseWait,
    /// Both sides closed simultaneously; our FIN is unacknowledged.
    Closing,
    /// The peer closed, then we did; waiting for the final acknowledgment.
    LastAck,
    /// Quarantine after a full close, lasting twice the maximum segment
    /// lifetime.
    TimeWait,
}

impl State {
    /// Whether the receive side has been synchronized with the peer.
    pub fn synchronized(self) -> bool {
        self != State::SynSent
    }

    /// Whether the application may queue new data for transmission.
    pub fn may_send(self) -> bool {
        matches!(
            self,
            State::SynSent | State::SynReceived | State::Established | State::CloseWait
        )
    }

    /// Whether segment text from the peer is still accepted.
    pub fn may_receive(self) -> bool {
        matches!(
            self,
            State::SynSent
                | State::SynReceived
                | State::Established
                | State::FinWait1
                | State::FinWait2
        )
    }
}
