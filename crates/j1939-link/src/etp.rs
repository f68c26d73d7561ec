//! Extended Transport Protocol (ETP, ISO 11783-3 / SAE J1939-21): peer-to-peer segmentation for
//! payloads above [crate::tp::MAX_TP_SIZE], up to 117440505 bytes.
//!
//! Structurally this mirrors [crate::tp]: independent TX and RX session records, same
//! RTS/CTS/EndOfMsgAck/Abort shape, so the fix for the source implementation's session-collision
//! bug applies here too. ETP adds two things TP doesn't need: a 4-byte message size (TP's is
//! 2-byte) and a Data Packet Offset (DPO) message the sender transmits before each burst, giving
//! the 3-byte packet-sequence number the burst starts at.

use std::time::{Duration, Instant};

use crate::error::{link_error, LinkErrorKind};
use crate::frame::CanFrame;
use crate::identifier::{encode_pgn_bytes, pack_id, IdFields, PRIORITY_TRANSPORT};
use crate::tp::ReceivedMessage;

pub const PF_ETP_DATA_TRANSFER: u8 = 199;
pub const PF_ETP_CONNECTION_MANAGEMENT: u8 = 200;

const CB_RTS: u8 = 20;
const CB_CTS: u8 = 21;
const CB_DPO: u8 = 22;
const CB_END_OF_MSG_ACK: u8 = 23;
const CB_ABORT: u8 = 255;

const BYTES_PER_PACKET: usize = 7;
/// Largest payload ETP can carry: `2^24 - 1` packets of 7 bytes.
pub const MAX_ETP_SIZE: u32 = 0x00FF_FFFF * BYTES_PER_PACKET as u32;

pub const T1: Duration = Duration::from_millis(750);
pub const T2: Duration = Duration::from_millis(1250);
pub const T3: Duration = Duration::from_millis(1250);
pub const T4: Duration = Duration::from_millis(1050);

pub use crate::tp::AbortReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    AwaitingCts,
    /// DPO and its burst of data packets have been sent; waiting on the next CTS or an
    /// EndOfMsgAck.
    SendingBurst,
}

#[derive(Debug)]
pub struct EtpTxSession {
    dest: u8,
    pgn: u32,
    payload: Vec<u8>,
    total_packets: u32,
    state: TxState,
    deadline: Instant,
}

impl EtpTxSession {
    fn total_packets(payload_len: usize) -> u32 {
        payload_len.div_ceil(BYTES_PER_PACKET) as u32
    }

    /// Build one ETP.DT frame. `sn` is the burst-local sequence number (1-based, reset to 1 at
    /// the start of each burst); `dpo` is the offset the preceding DPO announced for this burst,
    /// so the packet's absolute position in the message is `dpo + sn`.
    fn data_packet(&self, sn: u8, dpo: u32) -> CanFrame {
        let mut data = [0xFFu8; 8];
        data[0] = sn;
        let abs = dpo + sn as u32;
        let start = (abs as usize - 1) * BYTES_PER_PACKET;
        let end = (start + BYTES_PER_PACKET).min(self.payload.len());
        data[1..1 + (end - start)].copy_from_slice(&self.payload[start..end]);
        let id = pack_id(IdFields {
            priority: PRIORITY_TRANSPORT,
            data_page: 0,
            pf: PF_ETP_DATA_TRANSFER,
            ps: self.dest,
            sa: 0,
        });
        CanFrame::new(id, &data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    AwaitingDpo,
    /// `dpo` is the offset the current burst's DPO announced; `next_sn` is the burst-local
    /// sequence number (1-based) expected on the next ETP.DT frame; `burst_count` is how many
    /// data packets this burst holds in total, so `next_sn > burst_count` marks burst completion.
    AwaitingData { dpo: u32, next_sn: u8, burst_count: u8 },
}

#[derive(Debug)]
pub struct EtpRxSession {
    source: u8,
    pgn: u32,
    total_size: u32,
    total_packets: u32,
    buffer: Vec<u8>,
    state: RxState,
    deadline: Instant,
}

/// Holds at most one ETP TX session and one ETP RX session, independently of each other and of
/// any [crate::tp::TpEngine] sessions running concurrently.
#[derive(Debug, Default)]
pub struct EtpEngine {
    tx: Option<EtpTxSession>,
    rx: Option<EtpRxSession>,
}

fn set_sa(id: u32, sa: u8) -> u32 {
    (id & !0xFF) | sa as u32
}

fn seq3_le(seq: u32) -> [u8; 3] {
    [(seq & 0xFF) as u8, ((seq >> 8) & 0xFF) as u8, ((seq >> 16) & 0xFF) as u8]
}

fn seq3_from_le(b: [u8; 3]) -> u32 {
    (b[0] as u32) | ((b[1] as u32) << 8) | ((b[2] as u32) << 16)
}

impl EtpEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn cm_frame(&self, dest: u8, our_sa: u8, bytes: [u8; 8]) -> CanFrame {
        let id = pack_id(IdFields {
            priority: PRIORITY_TRANSPORT,
            data_page: 0,
            pf: PF_ETP_CONNECTION_MANAGEMENT,
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
            [CB_ABORT, reason as u8, 0xFF, 0xFF, 0xFF, pgn_bytes[0], pgn_bytes[1], pgn_bytes[2]],
        )
    }

    /// Start sending `payload`. Payloads at or below [crate::tp::MAX_TP_SIZE] belong to TP, not
    /// here; this engine only accepts payloads above that threshold.
    pub fn send(
        &mut self,
        now: Instant,
        our_sa: u8,
        dest: u8,
        pgn: u32,
        payload: Vec<u8>,
    ) -> eyre::Result<CanFrame> {
        if self.tx.is_some() {
            eyre::bail!(link_error(LinkErrorKind::Session, "ETP TX session already in progress"));
        }
        if payload.len() <= crate::tp::MAX_TP_SIZE as usize || payload.len() > MAX_ETP_SIZE as usize {
            eyre::bail!(link_error(
                LinkErrorKind::Protocol,
                format!(
                    "ETP payload length {} out of range {}..={MAX_ETP_SIZE}",
                    payload.len(),
                    crate::tp::MAX_TP_SIZE as usize + 1
                )
            ));
        }
        let total_packets = EtpTxSession::total_packets(payload.len());
        let pgn_bytes = encode_pgn_bytes(pgn);
        let size = payload.len() as u32;
        self.tx = Some(EtpTxSession {
            dest,
            pgn,
            payload,
            total_packets,
            state: TxState::AwaitingCts,
            deadline: now + T1,
        });
        let size_bytes = size.to_le_bytes();
        Ok(self.cm_frame(
            dest,
            our_sa,
            [
                CB_RTS,
                size_bytes[0],
                size_bytes[1],
                size_bytes[2],
                size_bytes[3],
                pgn_bytes[0],
                pgn_bytes[1],
                pgn_bytes[2],
            ],
        ))
    }

    /// Handle a CTS: emit the DPO for the requested burst, followed by its data packets.
    pub fn on_cts(
        &mut self,
        now: Instant,
        our_sa: u8,
        from: u8,
        num_packets: u8,
        next_packet: u32,
    ) -> eyre::Result<Vec<CanFrame>> {
        let tx = self
            .tx
            .as_mut()
            .filter(|tx| tx.dest == from)
            .ok_or_else(|| link_error(LinkErrorKind::Session, "CTS with no matching ETP TX session"))?;
        if !matches!(tx.state, TxState::AwaitingCts | TxState::SendingBurst) {
            eyre::bail!(link_error(LinkErrorKind::Session, "CTS received outside ETP TX session"));
        }
        if num_packets == 0 {
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
            .saturating_add(num_packets as u32 - 1)
            .min(tx.total_packets);
        let burst_len = burst_end_seq - next_packet + 1;

        let pgn_bytes = encode_pgn_bytes(tx.pgn);
        let dpo = next_packet - 1;
        let seq_bytes = seq3_le(dpo);
        let mut frames = Vec::with_capacity(1 + burst_len as usize);
        frames.push(self.cm_frame(
            from,
            our_sa,
            [
                CB_DPO,
                num_packets,
                seq_bytes[0],
                seq_bytes[1],
                seq_bytes[2],
                pgn_bytes[0],
                pgn_bytes[1],
                pgn_bytes[2],
            ],
        ));
        for sn in 1..=burst_len as u8 {
            let mut frame = tx.data_packet(sn, dpo);
            frame.id = set_sa(frame.id, our_sa);
            frames.push(frame);
        }
        let is_final_burst = burst_end_seq == tx.total_packets;
        tx.state = TxState::SendingBurst;
        tx.deadline = now + if is_final_burst { T4 } else { T3 };
        Ok(frames)
    }

    pub fn on_end_of_msg_ack(&mut self, from: u8) -> eyre::Result<()> {
        match &self.tx {
            Some(tx) if tx.dest == from => {
                self.tx = None;
                Ok(())
            }
            _ => eyre::bail!(link_error(
                LinkErrorKind::Session,
                "EndOfMsgAck with no matching ETP TX session"
            )),
        }
    }

    /// Handle an RTS: open an RX session and emit a CTS requesting the first burst. The burst
    /// size offered is capped to keep per-burst memory bounded; larger transfers just take more
    /// CTS/DPO round trips.
    pub fn on_rts(
        &mut self,
        now: Instant,
        our_sa: u8,
        from: u8,
        total_size: u32,
        total_packets: u32,
        pgn: u32,
    ) -> eyre::Result<CanFrame> {
        if self.rx.is_some() {
            return Ok(self.abort_frame(from, our_sa, pgn, AbortReason::AlreadyInSession));
        }
        self.rx = Some(EtpRxSession {
            source: from,
            pgn,
            total_size,
            total_packets,
            buffer: vec![0u8; total_size as usize],
            state: RxState::AwaitingDpo,
            deadline: now + T2,
        });
        const MAX_BURST: u32 = 255;
        let burst = total_packets.min(MAX_BURST) as u8;
        let pgn_bytes = encode_pgn_bytes(pgn);
        Ok(self.cm_frame(
            from,
            our_sa,
            [CB_CTS, burst, 1, 0, 0, pgn_bytes[0], pgn_bytes[1], pgn_bytes[2]],
        ))
    }

    /// Handle the DPO that precedes a burst of ETP.DT packets.
    pub fn on_dpo(&mut self, from: u8, num_packets: u8, seq: [u8; 3]) -> eyre::Result<()> {
        let rx = self
            .rx
            .as_mut()
            .filter(|rx| rx.source == from)
            .ok_or_else(|| link_error(LinkErrorKind::Session, "DPO with no matching ETP RX session"))?;
        if rx.state != RxState::AwaitingDpo {
            eyre::bail!(link_error(LinkErrorKind::Session, "unexpected DPO mid-burst"));
        }
        let dpo = seq3_from_le(seq);
        rx.state = RxState::AwaitingData { dpo, next_sn: 1, burst_count: num_packets };
        Ok(())
    }

    /// Handle one ETP.DT data packet. Mirrors [crate::tp::TpEngine::on_data_transfer]'s return
    /// shape: when a burst completes short of the full message, a new CTS is emitted requesting
    /// the next burst instead of an EndOfMsgAck.
    pub fn on_data_transfer(
        &mut self,
        now: Instant,
        our_sa: u8,
        from: u8,
        data: [u8; 8],
    ) -> eyre::Result<EtpDataTransferEvent> {
        let rx = self
            .rx
            .as_mut()
            .filter(|rx| rx.source == from)
            .ok_or_else(|| link_error(LinkErrorKind::Session, "ETP.DT with no matching RX session"))?;
        let RxState::AwaitingData { dpo, next_sn, burst_count } = rx.state else {
            eyre::bail!(link_error(LinkErrorKind::Session, "ETP.DT received before a DPO"));
        };
        if data[0] != next_sn {
            tracing::warn!("ETP.DT out-of-order sequence from {from:#X}; aborting");
            let frame = self.abort_frame(from, our_sa, rx.pgn, AbortReason::BadSequenceNumber);
            self.rx = None;
            return Ok(EtpDataTransferEvent::Aborted(frame));
        }
        // Absolute packet position from testable property 7: ofs = (sn + dpo - 1) * 7.
        let abs_seq = dpo + next_sn as u32;
        let ofs = (abs_seq as usize - 1) * BYTES_PER_PACKET;
        if ofs >= rx.total_size as usize || abs_seq > rx.total_packets {
            tracing::warn!("ETP.DT offset out of range from {from:#X}; aborting");
            let frame = self.abort_frame(from, our_sa, rx.pgn, AbortReason::BadSequenceNumber);
            self.rx = None;
            return Ok(EtpDataTransferEvent::Aborted(frame));
        }
        let take = (rx.total_size as usize - ofs).min(BYTES_PER_PACKET);
        rx.buffer[ofs..ofs + take].copy_from_slice(&data[1..1 + take]);

        if abs_seq == rx.total_packets {
            let session = self.rx.take().expect("checked Some above");
            let pgn_bytes = encode_pgn_bytes(session.pgn);
            let size_bytes = session.total_size.to_le_bytes();
            let ack = self.cm_frame(
                from,
                our_sa,
                [
                    CB_END_OF_MSG_ACK,
                    size_bytes[0],
                    size_bytes[1],
                    size_bytes[2],
                    size_bytes[3],
                    pgn_bytes[0],
                    pgn_bytes[1],
                    pgn_bytes[2],
                ],
            );
            return Ok(EtpDataTransferEvent::Completed(
                ReceivedMessage { source: session.source, pgn: session.pgn, payload: session.buffer },
                ack,
            ));
        }
        if next_sn == burst_count {
            const MAX_BURST: u32 = 255;
            let next_burst_start = abs_seq + 1;
            let remaining_packets = rx.total_packets - abs_seq;
            let burst = remaining_packets.min(MAX_BURST) as u8;
            let pgn_bytes = encode_pgn_bytes(rx.pgn);
            let seq_bytes = seq3_le(next_burst_start);
            let cts = self.cm_frame(
                from,
                our_sa,
                [
                    CB_CTS,
                    burst,
                    seq_bytes[0],
                    seq_bytes[1],
                    seq_bytes[2],
                    pgn_bytes[0],
                    pgn_bytes[1],
                    pgn_bytes[2],
                ],
            );
            rx.state = RxState::AwaitingDpo;
            rx.deadline = now + T2;
            return Ok(EtpDataTransferEvent::BurstComplete(cts));
        }
        rx.state = RxState::AwaitingData { dpo, next_sn: next_sn + 1, burst_count };
        rx.deadline = now + T3;
        Ok(EtpDataTransferEvent::InProgress)
    }

    pub fn on_abort(&mut self, from: u8) {
        if matches!(&self.tx, Some(tx) if tx.dest == from) {
            tracing::debug!("ETP TX session with {from:#X} aborted by peer");
            self.tx = None;
        }
        if matches!(&self.rx, Some(rx) if rx.source == from) {
            tracing::debug!("ETP RX session with {from:#X} aborted by peer");
            self.rx = None;
        }
    }

    pub fn tick(&mut self, now: Instant, our_sa: u8) -> Vec<CanFrame> {
        let mut frames = Vec::new();
        if matches!(&self.tx, Some(tx) if now >= tx.deadline) {
            let tx = self.tx.take().expect("checked Some above");
            tracing::warn!("ETP TX session with {:#X} timed out", tx.dest);
            frames.push(self.abort_frame(tx.dest, our_sa, tx.pgn, AbortReason::Timeout));
        }
        if matches!(&self.rx, Some(rx) if now >= rx.deadline) {
            let rx = self.rx.take().expect("checked Some above");
            tracing::warn!("ETP RX session with {:#X} timed out", rx.source);
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

/// Outcome of feeding one ETP.DT packet to an [EtpEngine].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EtpDataTransferEvent {
    InProgress,
    /// The current burst finished but more of the message remains; here's the next CTS.
    BurstComplete(CanFrame),
    /// The whole message is assembled; here's it and the EndOfMsgAck to send.
    Completed(ReceivedMessage, CanFrame),
    Aborted(CanFrame),
}
