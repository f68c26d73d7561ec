//! [Link]: the facade tying the address-claim, TP, and ETP engines to a [CanSocket] and
//! delivering everything else to an [Application].
//!
//! The caller's reactor drives this: register [Link::as_raw_fd] for read interest always and
//! write interest whenever [Link::has_queued_frames] is true, call [Link::on_readable] /
//! [Link::on_writable] on the corresponding edges, and call [Link::tick] periodically for
//! session timeouts and the address-claim quiet interval.

use std::os::unix::io::RawFd;
use std::time::Instant;

use crate::address_claim::{AddressClaim, ClaimOutcome, ADDRESS_CLAIM_PGN};
use crate::dispatch::{self, Pdu};
use crate::error::{link_error, LinkErrorKind};
use crate::etp::{EtpDataTransferEvent, EtpEngine};
use crate::frame::{CanFrame, BROADCAST_ADDRESS};
use crate::identifier::{
    decode_pgn_bytes, encode_pgn_bytes, pack_id, unpack_id, unpack_pgn, IdFields, PRIORITY_DEFAULT,
};
use crate::name::Name;
use crate::queue::{SendQueue, DEFAULT_QUEUE_LEN};
use crate::socket::CanSocket;
use crate::tp::{self, ReceivedMessage, TpDataTransferEvent, TpEngine};

/// PGN requested (via PF 234) to trigger an address re-claim announcement.
const PF_ACK: u8 = 232;
const PF_REQUEST_FOR_PGN: u8 = 234;

/// Where the link is in its own lifecycle; the application only needs this to decide whether
/// it's safe to start sending application messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// No address yet, or within the post-claim quiet interval.
    Claiming,
    /// Addressed, but a TP or ETP transfer is in flight.
    Tp,
    /// Addressed and idle; safe to start new transfers.
    Ready,
}

/// The contract a caller implements to receive data this link doesn't itself consume.
pub trait Application {
    /// A message addressed to us (or broadcast), not otherwise handled by the link layer:
    /// `pf` is the PDU Format the message arrived (or was reassembled) under, `da` the
    /// destination address, `sa` the sender, and `payload` the full (possibly
    /// TP/ETP-reassembled) data.
    fn handle_data(&mut self, pf: u8, da: u8, sa: u8, payload: &[u8]);

    /// An Ack/Nack (PF 232) naming `pgn`, sent by `sa` to `da`.
    fn handle_ack(&mut self, da: u8, sa: u8, ok: bool, pgn: u32);
}

/// Ties an address-claim record, TP and ETP engines, and a bounded send queue to a concrete
/// [CanSocket] and an [Application].
pub struct Link<S: CanSocket, A: Application> {
    socket: S,
    app: A,
    address_claim: AddressClaim,
    tp: TpEngine,
    etp: EtpEngine,
    queue: SendQueue,
}

impl<S: CanSocket, A: Application> Link<S, A> {
    #[must_use]
    pub fn new(socket: S, app: A, preferred_sa: u8, name: Name) -> Self {
        Self::with_queue_capacity(socket, app, preferred_sa, name, DEFAULT_QUEUE_LEN)
    }

    /// As [Self::new], but with a bounded send queue of `queue_capacity` frames rather than
    /// [DEFAULT_QUEUE_LEN]. Oldest queued frames are dropped once a slower peer lets the queue
    /// fill, rather than growing without bound.
    #[must_use]
    pub fn with_queue_capacity(
        socket: S,
        app: A,
        preferred_sa: u8,
        name: Name,
        queue_capacity: usize,
    ) -> Self {
        Self {
            socket,
            app,
            address_claim: AddressClaim::new(preferred_sa, name),
            tp: TpEngine::new(),
            etp: EtpEngine::new(),
            queue: SendQueue::new(queue_capacity),
        }
    }

    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    #[must_use]
    pub fn has_queued_frames(&self) -> bool {
        !self.queue.is_empty()
    }

    /// The address currently held, if any.
    #[must_use]
    pub fn sa(&self) -> Option<u8> {
        self.address_claim.sa()
    }

    #[must_use]
    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }

    #[must_use]
    pub fn status(&self) -> LinkStatus {
        if self.address_claim.sa().is_none() || self.address_claim.is_claiming() {
            LinkStatus::Claiming
        } else if self.tp.tx_in_progress()
            || self.tp.rx_in_progress()
            || self.etp.tx_in_progress()
            || self.etp.rx_in_progress()
        {
            LinkStatus::Tp
        } else {
            LinkStatus::Ready
        }
    }

    fn our_sa(&self) -> eyre::Result<u8> {
        self.address_claim
            .sa()
            .ok_or_else(|| link_error(LinkErrorKind::Session, "no address claimed yet"))
    }

    /// Begin address-claim arbitration: enqueues the initial claim broadcast.
    pub fn start_address_claim(&mut self, now: Instant) {
        let frame = self.address_claim.start_claim(now);
        self.enqueue(frame);
    }

    /// Send `payload` to `dest` under `pgn`, picking single-frame, TP, or ETP transport by size.
    pub fn send_message(
        &mut self,
        now: Instant,
        dest: u8,
        pgn: u32,
        payload: Vec<u8>,
    ) -> eyre::Result<()> {
        let our_sa = self.our_sa()?;
        if payload.len() <= 8 {
            let frame = build_app_frame(PRIORITY_DEFAULT, pgn, dest, our_sa, &payload);
            self.enqueue(frame);
            return Ok(());
        }
        if payload.len() <= tp::MAX_TP_SIZE as usize {
            let frame = self.tp.send(now, our_sa, dest, pgn, payload)?;
            self.enqueue(frame);
        } else {
            let frame = self.etp.send(now, our_sa, dest, pgn, payload)?;
            self.enqueue(frame);
        }
        Ok(())
    }

    /// Convenience wrapper broadcasting `payload` under `pgn` (destination address 0xFF).
    pub fn send_message_pgn(&mut self, now: Instant, pgn: u32, payload: Vec<u8>) -> eyre::Result<()> {
        self.send_message(now, BROADCAST_ADDRESS, pgn, payload)
    }

    /// Request that `dest` (or everyone, if broadcast) (re-)announce `pgn` (PF 234).
    pub fn send_request_pgn(&mut self, dest: u8, pgn: u32) -> eyre::Result<()> {
        let our_sa = self.our_sa()?;
        let pgn_bytes = encode_pgn_bytes(pgn);
        let id = pack_id(IdFields {
            priority: PRIORITY_DEFAULT,
            data_page: 0,
            pf: PF_REQUEST_FOR_PGN,
            ps: dest,
            sa: our_sa,
        });
        let mut data = [0xFFu8; 8];
        data[0..3].copy_from_slice(&pgn_bytes);
        self.enqueue(CanFrame::new(id, &data[..3]));
        Ok(())
    }

    /// Send an Ack (`ok = true`) or Nack for `pgn` to `dest` (PF 232).
    pub fn send_ack(&mut self, dest: u8, pgn: u32, ok: bool) -> eyre::Result<()> {
        let our_sa = self.our_sa()?;
        let pgn_bytes = encode_pgn_bytes(pgn);
        let id = pack_id(IdFields {
            priority: PRIORITY_DEFAULT,
            data_page: 0,
            pf: PF_ACK,
            ps: dest,
            sa: our_sa,
        });
        let data = [
            u8::from(!ok),
            0xFF,
            0xFF,
            0xFF,
            0xFF,
            pgn_bytes[0],
            pgn_bytes[1],
            pgn_bytes[2],
        ];
        self.enqueue(CanFrame::new(id, &data));
        Ok(())
    }

    /// Drain every frame currently readable from the socket and process it.
    pub fn on_readable(&mut self, now: Instant) -> eyre::Result<()> {
        while let Some(frame) = self.socket.recv_frame()? {
            self.handle_frame(now, frame);
        }
        Ok(())
    }

    /// Attempt to drain the send queue while the socket is writable.
    pub fn on_writable(&mut self) -> eyre::Result<()> {
        while let Some(frame) = self.queue.pop() {
            match self.socket.send_frame(&frame) {
                Ok(true) => {}
                Ok(false) => {
                    self.queue.requeue_front(frame);
                    break;
                }
                Err(err) => {
                    self.queue.requeue_front(frame);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Periodic housekeeping: clears the address-claim quiet interval and aborts timed-out
    /// TP/ETP sessions.
    pub fn tick(&mut self, now: Instant) {
        self.address_claim.tick(now);
        if let Ok(our_sa) = self.our_sa() {
            for frame in self.tp.tick(now, our_sa) {
                self.queue.push(frame);
            }
            for frame in self.etp.tick(now, our_sa) {
                self.queue.push(frame);
            }
        }
    }

    fn enqueue(&mut self, frame: CanFrame) {
        self.queue.push(frame);
    }

    fn handle_frame(&mut self, now: Instant, frame: CanFrame) {
        let fields = unpack_id(frame.id);
        let pdu = match dispatch::filter(fields, self.address_claim.sa()) {
            dispatch::FilterOutcome::Drop => return,
            dispatch::FilterOutcome::Accept(pdu) => pdu,
        };
        match pdu {
            Pdu::AddressClaim => self.handle_address_claim(now, fields, &frame),
            Pdu::RequestForPgn => self.handle_request_for_pgn(fields, &frame),
            Pdu::Ack => self.handle_ack(fields, &frame),
            Pdu::TpConnectionManagement => self.handle_tp_cm(now, fields, &frame),
            Pdu::TpDataTransfer => self.handle_tp_dt(now, fields, &frame),
            Pdu::EtpConnectionManagement => self.handle_etp_cm(now, fields, &frame),
            Pdu::EtpDataTransfer => self.handle_etp_dt(now, fields, &frame),
            Pdu::Application => {
                self.app.handle_data(fields.pf, fields.destination(), fields.sa, frame.data());
            }
        }
    }

    fn handle_address_claim(&mut self, now: Instant, fields: IdFields, frame: &CanFrame) {
        let data = frame.data();
        if data.len() != 8 {
            tracing::warn!("malformed address claim from {:#X}", fields.sa);
            return;
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(data);
        let their_name = Name::from_bytes(bytes);
        match self.address_claim.handle_contending_claim(now, fields.sa, their_name) {
            ClaimOutcome::Reclaimed(frame) => self.enqueue(frame),
            ClaimOutcome::CannotClaim | ClaimOutcome::Unaffected => {}
        }
    }

    fn handle_request_for_pgn(&mut self, fields: IdFields, frame: &CanFrame) {
        let data = frame.data();
        if data.len() < 3 {
            tracing::warn!("malformed request-for-pgn from {:#X}", fields.sa);
            return;
        }
        let requested_pgn = decode_pgn_bytes([data[0], data[1], data[2]]);
        if requested_pgn == ADDRESS_CLAIM_PGN {
            if let Some(response) = self.address_claim.handle_request(requested_pgn) {
                self.enqueue(response);
            }
            return;
        }
        self.app.handle_data(fields.pf, fields.destination(), fields.sa, data);
    }

    fn handle_ack(&mut self, fields: IdFields, frame: &CanFrame) {
        let data = frame.data();
        if data.len() < 8 {
            tracing::warn!("malformed ack from {:#X}", fields.sa);
            return;
        }
        let ok = data[0] == 0;
        let pgn = decode_pgn_bytes([data[5], data[6], data[7]]);
        self.app.handle_ack(fields.destination(), fields.sa, ok, pgn);
    }

    fn handle_tp_cm(&mut self, now: Instant, fields: IdFields, frame: &CanFrame) {
        let Ok(our_sa) = self.our_sa() else { return };
        let data = frame.data();
        if data.is_empty() {
            return;
        }
        let mut cm = [0u8; 8];
        cm[..data.len()].copy_from_slice(data);
        match cm[0] {
            16 => {
                let total_size = u16::from_le_bytes([cm[1], cm[2]]);
                let total_packets = cm[3];
                let pgn = tp::pgn_from_cm_payload(&cm);
                match self.tp.on_rts(now, our_sa, fields.sa, total_size, total_packets, pgn) {
                    Ok(cts) => self.enqueue(cts),
                    Err(err) => tracing::warn!("TP RTS from {:#X} rejected: {err:#}", fields.sa),
                }
            }
            17 => match self.tp.on_cts(now, our_sa, fields.sa, cm[1], cm[2]) {
                Ok(frames) => frames.into_iter().for_each(|f| self.enqueue(f)),
                Err(err) => tracing::warn!("TP CTS from {:#X} rejected: {err:#}", fields.sa),
            },
            19 => {
                if let Err(err) = self.tp.on_end_of_msg_ack(fields.sa) {
                    tracing::warn!("TP EndOfMsgAck from {:#X} rejected: {err:#}", fields.sa);
                }
            }
            255 => self.tp.on_abort(fields.sa),
            other => tracing::debug!("unhandled TP.CM control byte {other} from {:#X}", fields.sa),
        }
    }

    fn handle_tp_dt(&mut self, now: Instant, fields: IdFields, frame: &CanFrame) {
        let Ok(our_sa) = self.our_sa() else { return };
        let data = frame.data();
        if data.len() < 8 {
            return;
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(data);
        match self.tp.on_data_transfer(now, our_sa, fields.sa, bytes) {
            Ok(TpDataTransferEvent::InProgress) => {}
            Ok(TpDataTransferEvent::Completed(msg, ack)) => {
                self.enqueue(ack);
                self.deliver_reassembled(msg);
            }
            Ok(TpDataTransferEvent::Aborted(frame)) => self.enqueue(frame),
            Err(err) => tracing::warn!("TP.DT from {:#X} rejected: {err:#}", fields.sa),
        }
    }

    fn handle_etp_cm(&mut self, now: Instant, fields: IdFields, frame: &CanFrame) {
        let Ok(our_sa) = self.our_sa() else { return };
        let data = frame.data();
        if data.is_empty() {
            return;
        }
        let mut cm = [0u8; 8];
        cm[..data.len()].copy_from_slice(data);
        match cm[0] {
            20 => {
                let total_size = u32::from_le_bytes([cm[1], cm[2], cm[3], cm[4]]);
                let total_packets = total_size.div_ceil(7);
                let pgn = decode_pgn_bytes([cm[5], cm[6], cm[7]]);
                match self.etp.on_rts(now, our_sa, fields.sa, total_size, total_packets, pgn) {
                    Ok(cts) => self.enqueue(cts),
                    Err(err) => tracing::warn!("ETP RTS from {:#X} rejected: {err:#}", fields.sa),
                }
            }
            21 => {
                let next_packet = u32::from_le_bytes([cm[2], cm[3], cm[4], 0]);
                match self.etp.on_cts(now, our_sa, fields.sa, cm[1], next_packet) {
                    Ok(frames) => frames.into_iter().for_each(|f| self.enqueue(f)),
                    Err(err) => tracing::warn!("ETP CTS from {:#X} rejected: {err:#}", fields.sa),
                }
            }
            22 => {
                if let Err(err) = self.etp.on_dpo(fields.sa, cm[1], [cm[2], cm[3], cm[4]]) {
                    tracing::warn!("ETP DPO from {:#X} rejected: {err:#}", fields.sa);
                }
            }
            23 => {
                if let Err(err) = self.etp.on_end_of_msg_ack(fields.sa) {
                    tracing::warn!("ETP EndOfMsgAck from {:#X} rejected: {err:#}", fields.sa);
                }
            }
            255 => self.etp.on_abort(fields.sa),
            other => tracing::debug!("unhandled ETP.CM control byte {other} from {:#X}", fields.sa),
        }
    }

    fn handle_etp_dt(&mut self, now: Instant, fields: IdFields, frame: &CanFrame) {
        let Ok(our_sa) = self.our_sa() else { return };
        let data = frame.data();
        if data.len() < 8 {
            return;
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(data);
        match self.etp.on_data_transfer(now, our_sa, fields.sa, bytes) {
            Ok(EtpDataTransferEvent::InProgress) => {}
            Ok(EtpDataTransferEvent::BurstComplete(cts)) => self.enqueue(cts),
            Ok(EtpDataTransferEvent::Completed(msg, ack)) => {
                self.enqueue(ack);
                self.deliver_reassembled(msg);
            }
            Ok(EtpDataTransferEvent::Aborted(frame)) => self.enqueue(frame),
            Err(err) => tracing::warn!("ETP.DT from {:#X} rejected: {err:#}", fields.sa),
        }
    }

    fn deliver_reassembled(&mut self, msg: ReceivedMessage) {
        let (_, pf, _) = unpack_pgn(msg.pgn);
        let our_sa = self.address_claim.sa().unwrap_or(BROADCAST_ADDRESS);
        self.app.handle_data(pf, our_sa, msg.source, &msg.payload);
    }
}

/// Build the single-frame identifier/payload for an application message under `pgn`.
fn build_app_frame(priority: u8, pgn: u32, dest: u8, our_sa: u8, payload: &[u8]) -> CanFrame {
    let (data_page, pf, pgn_ps) = unpack_pgn(pgn);
    let ps = if pf < 240 { dest } else { pgn_ps };
    let id = pack_id(IdFields { priority, data_page, pf, ps, sa: our_sa });
    CanFrame::new(id, payload)
}
