//! The 16-byte kernel CAN frame record and the J1939 identifier fields packed into it.

use std::io::Write;

/// CAN extended-frame flag, set in bit 31 of an on-the-wire identifier.
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;

/// Broadcast / "no destination" address.
pub const BROADCAST_ADDRESS: u8 = 0xFF;

/// A single 16-byte kernel CAN frame: `[id:u32 LE | EFF flag, dlc:u8, 3 pad bytes, data:[u8;8]]`.
///
/// [CanFrame]s are restricted to 8 bytes; callers that need more use the TP/ETP engines to
/// spread a larger message across several frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanFrame {
    /// 29-bit J1939 identifier, without the extended-frame flag.
    pub id: u32,
    pub dlc: u8,
    data: [u8; 8],
}

impl CanFrame {
    /// Build a frame from the given 29-bit id and payload (`payload.len() <= 8`).
    ///
    /// # Panics
    /// Panics if `payload` is longer than 8 bytes.
    pub fn new(id: u32, payload: &[u8]) -> Self {
        assert!(payload.len() <= 8, "CAN payload cannot exceed 8 bytes");
        let mut data = [0u8; 8];
        data[..payload.len()].copy_from_slice(payload);
        Self {
            id,
            dlc: payload.len() as u8,
            data,
        }
    }

    #[inline]
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// Serialize this frame into the kernel's 16-byte `struct can_frame` layout.
    pub fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        let id = self.id | CAN_EFF_FLAG;
        buf[0..4].copy_from_slice(&id.to_le_bytes());
        buf[4] = self.dlc;
        // buf[5..8] are padding, left as 0
        buf[8..8 + self.dlc as usize].copy_from_slice(self.data());
        buf
    }

    /// Parse the kernel's 16-byte `struct can_frame` layout.
    pub fn decode(buf: &[u8]) -> eyre::Result<Self> {
        if buf.len() != 16 {
            eyre::bail!("malformed CAN frame: expected 16 bytes, got {}", buf.len());
        }
        let id = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) & !CAN_EFF_FLAG;
        let dlc = buf[4];
        if dlc > 8 {
            eyre::bail!("malformed CAN frame: dlc {dlc} exceeds 8");
        }
        let mut data = [0u8; 8];
        data.copy_from_slice(&buf[8..16]);
        Ok(Self { id, dlc, data })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writeln!(
            writer,
            "{:08X}#{}",
            self.id,
            hex::encode_upper(self.data())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_sets_eff_flag_and_dlc() {
        let frame = CanFrame::new(0x18EF3801, &[1, 2, 3]);
        let encoded = frame.encode();
        let id = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(id & CAN_EFF_FLAG, CAN_EFF_FLAG);
        assert_eq!(id & !CAN_EFF_FLAG, 0x18EF3801);
        assert_eq!(encoded[4], 3);
        assert_eq!(&encoded[8..11], &[1, 2, 3]);
    }

    #[test]
    fn test_roundtrip() {
        let frame = CanFrame::new(0x0CF00401, &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x11, 0x22]);
        let encoded = frame.encode();
        let decoded = CanFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        assert!(CanFrame::decode(&[0u8; 15]).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_dlc() {
        let mut buf = [0u8; 16];
        buf[4] = 9;
        assert!(CanFrame::decode(&buf).is_err());
    }
}
