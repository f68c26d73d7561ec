//! Transport Protocol (TP, ISO 11783-3 / SAE J1939-21): peer-to-peer segmentation for payloads
//! up to 1785 bytes.
//!
//! The source implementation kept one session record shared between the sending and receiving
//! roles, so a connection-mode transfer in one direction could corrupt an in-progress transfer
//! in the other. This engine keeps the two roles as independent session records
//! ([TpTxSession], [TpRxSession]); nothing about RX state is touched by TX traffic or vice
//! versa.
//!
//! BAM (control byte 32, broadcast) is deliberately not implemented: neither this design nor the
//! reference it's grounded on handle it, so connection-mode RTS/CTS is the only TP path.

use std::time::{Duration, Instant};

use crate::error::{link_error, LinkErrorKind};
use crate::frame::CanFrame;
use crate::identifier::{
    decode_pgn_bytes, encode_pgn_bytes, pack_id, IdFields, PRIORITY_TRANSPORT,
};

pub const PF_TP_DATA_TRANSFER: u8 = 235;
pub const PF_TP_CONNECTION_MANAGEMENT: u8 = 236;

const CB_RTS: u8 = 16;
const CB_CTS: u8 = 17;
const CB_END_OF_MSG_ACK: u8 = 19;
const CB_ABORT: u8 = 255;

/// Largest payload this engine will segment; larger messages are ETP's job.
pub const MAX_TP_SIZE: u16 = 1785;
const BYTES_PER_PACKET: usize = 7;

/// T1: max time between sending RTS and receiving CTS.
pub const T1: Duration = Duration::from_millis(750);
/// T2: max time between sending CTS and receiving the first data packet.
pub const T2: Duration = Duration::from_millis(1250);
/// T3: max time between successive data packets of the same burst.
pub const T3: Duration = Duration::from_millis(1250);
/// T4: max time between the last data packet sent and the EndOfMsgAck.
pub const T4: Duration = Duration::from_millis(1050);

/// Reason carried in a TP.CM Abort (SAE J1939-21 Table 6-ish reason codes; only the ones this
/// engine can itself produce).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    AlreadyInSession = 1,
    Timeout = 3,
    BadSequenceNumber = 5,
    DuplicateSequenceNumber = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    AwaitingCts,
    /// Burst sent; waiting on either another CTS (more to send) or EndOfMsgAck (done).
    SendingBurst,
}

/// An in-progress outbound (this node is the sender) TP transfer.
#[derive(Debug)]
pub struct TpTxSession {
    dest: u8,
    pgn: u32,
    payload: Vec<u8>,
    total_packets: u8,
    state: TxState,
    deadline: Instant,
}

impl TpTxSession {
    fn total_packets(payload_len: usize) -> u8 {
        payload_len.div_ceil(BYTES_PER_PACKET) as u8
    }

    fn data_packet(&self, seq: u8) -> CanFrame {
        let mut data = [0xFFu8; 8];
        data[0] = seq;
        let start = (seq as usize - 1) * BYTES_PER_PACKET;
        let end = (start + BYTES_PER_PACKET).min(self.payload.len());
        data[1..1 + (end - start)].copy_from_slice(&self.payload[start..end]);
        let id = pack_id(IdFields {
            priority: PRIORITY_TRANSPORT,
            data_page: 0,
            pf: PF_TP_DATA_TRANSFER,
            ps: self.dest,
            sa: 0, // filled in by the caller, which knows our own address
        });
        CanFrame::new(id, &data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    AwaitingData { next_seq: u8 },
}

/// An in-progress inbound (this node is the receiver) TP transfer.
#[derive(Debug)]
pub struct TpRxSession {
    source: u8,
    pgn: u32,
    total_size: u16,
    total_packets: u8,
    buffer: Vec<u8>,
    state: RxState,
    deadline: Instant,
}

/// A completed inbound TP message, ready for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub source: u8,
    pub pgn: u32,
    pub payload: Vec<u8>,
}

/// Outcome of feeding one TP.DT packet to a [TpEngine].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpDataTransferEvent {
    /// More packets are still expected.
    InProgress,
    /// The final packet arrived; here's the assembled message and the EndOfMsgAck to send.
    Completed(ReceivedMessage, CanFrame),
    /// The packet was out of sequence; the session was torn down and here's the Abort to send.
    Aborted(CanFrame),
}

/// Holds at most one TX session and one RX session, independently.
#[derive(Debug, Default)]
pub struct TpEngine {
    tx: Option<TpTxSession>,
    rx: Option<TpRxSession>,
}

impl TpEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn cm_frame(&self, dest: u8, our_sa: u8, bytes: [u8; 8]) -> CanFrame {
        let id = pack_id(IdFields {
            priority: PRIORITY_TRANSPORT,
            data_page: 0,
            pf: PF_TP_CONNECTION_MANAGEMENT,
            ps: dest,
            sa: our_sa,
        });
        CanFrame::new(id, &bytes)
    }

    fn abort_frame(&self, dest: u8, our_sa: u8, pgn: u32, reason: AbortReason) -> CanFrame {
        let pgn_bytes = encode_pgn_bytes(pgn);
        self.cm_frame(
            dest,
            our_sa,
            [
                CB_ABORT,
                reason as u8,
                0xFF,
                0xFF,
                0xFF,
                pgn_bytes[0],
                pgn_bytes[1],
                pgn_bytes[2],
            ],
        )
    }

    /// Start sending `payload` to `dest` under `pgn`. Fails if a TX session is already open, or
    /// the payload doesn't fit in TP: 9 bytes is the smallest a multi-frame message can be (below
    /// that it fits in a single frame), and [MAX_TP_SIZE] the largest (use ETP above it).
    pub fn send(
        &mut self,
        now: Instant,
        our_sa: u8,
        dest: u8,
        pgn: u32,
        payload: Vec<u8>,
    ) -> eyre::Result<CanFrame> {
        if self.tx.is_some() {
            eyre::bail!(link_error(LinkErrorKind::Session, "TP TX session already in progress"));
        }
        if payload.len() < 9 || payload.len() > MAX_TP_SIZE as usize {
            eyre::bail!(link_error(
                LinkErrorKind::Protocol,
                format!("TP payload length {} out of range 9..={MAX_TP_SIZE}", payload.len())
            ));
        }
        let total_packets = TpTxSession::total_packets(payload.len());
        let pgn_bytes = encode_pgn_bytes(pgn);
        let size = payload.len() as u16;
        self.tx = Some(TpTxSession {
            dest,
            pgn,
            payload,
            total_packets,
            state: TxState::AwaitingCts,
            deadline: now + T1,
        });
        Ok(self.cm_frame(
            dest,
            our_sa,
            [
                CB_RTS,
                (size & 0xFF) as u8,
                (size >> 8) as u8,
                total_packets,
                0xFF, // max packets per CTS: unlimited
                pgn_bytes[0],
                pgn_bytes[1],
                pgn_bytes[2],
            ],
        ))
    }

    /// Handle a CTS naming us as destination: emit the requested burst of data packets.
    pub fn on_cts(
        &mut self,
        now: Instant,
        our_sa: u8,
        from: u8,
        num_packets: u8,
        next_packet: u8,
    ) -> eyre::Result<Vec<CanFrame>> {
        let tx = self
            .tx
            .as_mut()
            .filter(|tx| tx.dest == from)
            .ok_or_else(|| link_error(LinkErrorKind::Session, "CTS with no matching TX session"))?;
        if !matches!(tx.state, TxState::AwaitingCts | TxState::SendingBurst) {
            eyre::bail!(link_error(LinkErrorKind::Session, "CTS received outside TX session"));
        }
        if num_packets == 0 {
            // Receiver asks us to hold off; session stays open, awaiting a later CTS.
            tx.state = TxState::AwaitingCts;
            tx.deadline = now + T1;
            return Ok(Vec::new());
        }
        if next_packet == 0 || next_packet > tx.total_packets {
            let frame = self.abort_frame(from, our_sa, tx.pgn, AbortReason::BadSequenceNumber);
            self.tx = None;
            return Ok(vec![frame]);
        }
        let burst_end_seq = next_packet
            .saturating_add(num_packets - 1)
            .min(tx.total_packets);
        let mut frames = Vec::with_capacity((burst_end_seq - next_packet + 1) as usize);
        for seq in next_packet..=burst_end_seq {
            let mut frame = tx.data_packet(seq);
            frame.id = set_sa(frame.id, our_sa);
            frames.push(frame);
        }
        let is_final_burst = burst_end_seq == tx.total_packets;
        tx.state = TxState::SendingBurst;
        tx.deadline = now + if is_final_burst { T4 } else { T3 };
        Ok(frames)
    }

    /// Handle an EndOfMsgAck naming us: closes the TX session.
    pub fn on_end_of_msg_ack(&mut self, from: u8) -> eyre::Result<()> {
        match &self.tx {
            Some(tx) if tx.dest == from => {
                self.tx = None;
                Ok(())
            }
            _ => eyre::bail!(link_error(
                LinkErrorKind::Session,
                "EndOfMsgAck with no matching TX session"
            )),
        }
    }

    /// Handle an RTS naming us as destination: open an RX session and emit a CTS requesting the
    /// whole message in one burst.
    pub fn on_rts(
        &mut self,
        now: Instant,
        our_sa: u8,
        from: u8,
        total_size: u16,
        total_packets: u8,
        pgn: u32,
    ) -> eyre::Result<CanFrame> {
        if self.rx.is_some() {
            let frame = self.abort_frame(from, our_sa, pgn, AbortReason::AlreadyInSession);
            return Ok(frame);
        }
        self.rx = Some(TpRxSession {
            source: from,
            pgn,
            total_size,
            total_packets,
            buffer: Vec::with_capacity(total_size as usize),
            state: RxState::AwaitingData { next_seq: 1 },
            deadline: now + T2,
        });
        let pgn_bytes = encode_pgn_bytes(pgn);
        Ok(self.cm_frame(
            from,
            our_sa,
            [
                CB_CTS,
                total_packets,
                1,
                0xFF,
                0xFF,
                pgn_bytes[0],
                pgn_bytes[1],
                pgn_bytes[2],
            ],
        ))
    }

    /// Handle one TP.DT data packet.
    pub fn on_data_transfer(
        &mut self,
        now: Instant,
        our_sa: u8,
        from: u8,
        data: [u8; 8],
    ) -> eyre::Result<TpDataTransferEvent> {
        let rx = self
            .rx
            .as_mut()
            .filter(|rx| rx.source == from)
            .ok_or_else(|| link_error(LinkErrorKind::Session, "TP.DT with no matching RX session"))?;
        let RxState::AwaitingData { next_seq } = rx.state;
        let seq = data[0];
        if seq != next_seq {
            let reason = if seq < next_seq {
                AbortReason::DuplicateSequenceNumber
            } else {
                AbortReason::BadSequenceNumber
            };
            tracing::warn!(
                "TP.DT out-of-order sequence {seq} from {from:#X}, expected {next_seq}; aborting"
            );
            let frame = self.abort_frame(from, our_sa, rx.pgn, reason);
            self.rx = None;
            return Ok(TpDataTransferEvent::Aborted(frame));
        }
        let remaining = rx.total_size as usize - rx.buffer.len();
        let take = remaining.min(BYTES_PER_PACKET);
        rx.buffer.extend_from_slice(&data[1..1 + take]);
        if seq == rx.total_packets {
            let session = self.rx.take().expect("checked Some above");
            let pgn_bytes = encode_pgn_bytes(session.pgn);
            let ack = self.cm_frame(
                from,
                our_sa,
                [
                    CB_END_OF_MSG_ACK,
                    (session.total_size & 0xFF) as u8,
                    (session.total_size >> 8) as u8,
                    session.total_packets,
                    0xFF,
                    pgn_bytes[0],
                    pgn_bytes[1],
                    pgn_bytes[2],
                ],
            );
            return Ok(TpDataTransferEvent::Completed(
                ReceivedMessage { source: session.source, pgn: session.pgn, payload: session.buffer },
                ack,
            ));
        }
        rx.state = RxState::AwaitingData { next_seq: next_seq + 1 };
        rx.deadline = now + T3;
        Ok(TpDataTransferEvent::InProgress)
    }

    /// Abort and tear down any session (TX or RX) matching `from`/`pgn`, e.g. on receiving a
    /// TP.CM Abort from the peer.
    pub fn on_abort(&mut self, from: u8) {
        if matches!(&self.tx, Some(tx) if tx.dest == from) {
            tracing::debug!("TP TX session with {from:#X} aborted by peer");
            self.tx = None;
        }
        if matches!(&self.rx, Some(rx) if rx.source == from) {
            tracing::debug!("TP RX session with {from:#X} aborted by peer");
            self.rx = None;
        }
    }

    /// Tear down any session past its deadline, returning an Abort frame for each to send.
    pub fn tick(&mut self, now: Instant, our_sa: u8) -> Vec<CanFrame> {
        let mut frames = Vec::new();
        if matches!(&self.tx, Some(tx) if now >= tx.deadline) {
            let tx = self.tx.take().expect("checked Some above");
            tracing::warn!("TP TX session with {:#X} timed out", tx.dest);
            frames.push(self.abort_frame(tx.dest, our_sa, tx.pgn, AbortReason::Timeout));
        }
        if matches!(&self.rx, Some(rx) if now >= rx.deadline) {
            let rx = self.rx.take().expect("checked Some above");
            tracing::warn!("TP RX session with {:#X} timed out", rx.source);
            frames.push(self.abort_frame(rx.source, our_sa, rx.pgn, AbortReason::Timeout));
        }
        frames
    }

    #[must_use]
    pub fn tx_in_progress(&self) -> bool {
        self.tx.is_some()
    }

    #[must_use]
    pub fn rx_in_progress(&self) -> bool {
        self.rx.is_some()
    }
}

fn set_sa(id: u32, sa: u8) -> u32 {
    (id & !0xFF) | sa as u32
}

/// Parse the 3 little-endian PGN bytes out of a TP.CM payload tail (bytes 5..=7 of every
/// RTS/CTS/EndOfMsgAck/Abort message). Exposed for `dispatch` callers that need to pull the PGN
/// before routing into [TpEngine].
#[must_use]
pub fn pgn_from_cm_payload(payload: &[u8; 8]) -> u32 {
    decode_pgn_bytes([payload[5], payload[6], payload[7]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const US: u8 = 0x10;
    const PEER: u8 = 0x20;
    const PGN: u32 = 0x00FECA;

    #[test]
    fn test_send_then_full_cts_yields_entire_burst() {
        let mut eng = TpEngine::new();
        let now = Instant::now();
        let payload = (0..20u8).collect::<Vec<_>>();
        let rts = eng.send(now, US, PEER, PGN, payload.clone()).unwrap();
        assert_eq!(rts.data()[0], CB_RTS);
        assert_eq!(rts.data()[3], 3); // ceil(20/7) = 3 packets

        let frames = eng.on_cts(now, US, PEER, 3, 1).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].data()[0], 1);
        assert_eq!(frames[0].data()[1..], payload[0..7]);
        assert_eq!(frames[1].data()[0], 2);
        assert_eq!(frames[2].data()[0], 3);
        assert_eq!(&frames[2].data()[1..7], &payload[14..20]);
        assert_eq!(frames[2].data()[7], 0xFF, "padded with 0xFF past the payload end");

        eng.on_end_of_msg_ack(PEER).unwrap();
        assert!(!eng.tx_in_progress());
    }

    #[test]
    fn test_rx_assembles_message_and_acks() {
        let mut eng = TpEngine::new();
        let now = Instant::now();
        let cts = eng.on_rts(now, US, PEER, 20, 3, PGN).unwrap();
        assert_eq!(cts.data()[0], CB_CTS);

        assert_eq!(
            eng.on_data_transfer(now, US, PEER, [1, 0, 1, 2, 3, 4, 5, 6]).unwrap(),
            TpDataTransferEvent::InProgress
        );
        assert_eq!(
            eng.on_data_transfer(now, US, PEER, [2, 7, 8, 9, 10, 11, 12, 13]).unwrap(),
            TpDataTransferEvent::InProgress
        );
        let event = eng
            .on_data_transfer(now, US, PEER, [3, 14, 15, 16, 17, 18, 19, 0xFF])
            .unwrap();
        let TpDataTransferEvent::Completed(msg, ack) = event else {
            panic!("expected Completed, got {event:?}");
        };
        assert_eq!(msg.source, PEER);
        assert_eq!(msg.pgn, PGN);
        assert_eq!(msg.payload, (0..20u8).collect::<Vec<_>>());
        assert_eq!(ack.data()[0], CB_END_OF_MSG_ACK);
        assert!(!eng.rx_in_progress());
    }

    #[test]
    fn test_second_rts_while_rx_busy_aborts_with_already_in_session() {
        let mut eng = TpEngine::new();
        let now = Instant::now();
        eng.on_rts(now, US, PEER, 20, 3, PGN).unwrap();
        let frame = eng.on_rts(now, US, 0x30, 9, 2, PGN).unwrap();
        assert_eq!(frame.data()[0], CB_ABORT);
        assert_eq!(frame.data()[1], AbortReason::AlreadyInSession as u8);
    }

    #[test]
    fn test_tx_and_rx_sessions_are_independent() {
        // A TX session to PEER and an RX session from PEER coexist: ticking one must not
        // disturb the other. This is the "single session state collision" the design fixes.
        let mut eng = TpEngine::new();
        let now = Instant::now();
        eng.send(now, US, PEER, PGN, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
        eng.on_rts(now, US, PEER, 20, 3, 0x00FEEE).unwrap();
        assert!(eng.tx_in_progress());
        assert!(eng.rx_in_progress());
        eng.on_end_of_msg_ack(PEER).unwrap();
        assert!(!eng.tx_in_progress());
        assert!(eng.rx_in_progress(), "RX session untouched by TX teardown");
    }

    #[test]
    fn test_tick_aborts_timed_out_rx_session() {
        let mut eng = TpEngine::new();
        let now = Instant::now();
        eng.on_rts(now, US, PEER, 20, 3, PGN).unwrap();
        let frames = eng.tick(now + T2 + Duration::from_millis(1), US);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data()[0], CB_ABORT);
        assert_eq!(frames[0].data()[1], AbortReason::Timeout as u8);
        assert!(!eng.rx_in_progress());
    }

    #[test]
    fn test_send_rejects_payloads_outside_tp_size_range() {
        let mut eng = TpEngine::new();
        let now = Instant::now();
        assert!(eng.send(now, US, PEER, PGN, vec![0; 8]).is_err(), "too short for TP, belongs in a single frame");
        assert!(eng.send(now, US, PEER, PGN, vec![0; MAX_TP_SIZE as usize + 1]).is_err(), "too long for TP, belongs in ETP");
        assert!(eng.send(now, US, PEER, PGN, vec![0; 9]).is_ok());
    }
}
