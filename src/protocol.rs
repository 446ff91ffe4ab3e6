//! The on-wire tunnel header: six bytes immediately following the ICMP
//! header, present on every tunnel message including empty-payload control
//! messages.

use thiserror::Error;

pub const HEADER_SIZE: usize = 6;

pub const MAGIC_CLIENT: [u8; 4] = *b"TUNC";
pub const MAGIC_SERVER: [u8; 4] = *b"TUNS";

pub const FLAG_EMULATION: u8 = 0x01;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("tunnel header shorter than {HEADER_SIZE} bytes")]
    TooShort,
    #[error("unrecognised tunnel magic")]
    BadMagic,
    #[error("unrecognised packet type {0}")]
    UnknownType(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    ConnectionRequest = 1,
    ConnectionAccept = 2,
    KeepAlive = 3,
    ServerFull = 4,
    Punchthru = 5,
}

impl PacketType {
    fn from_u8(value: u8) -> Option<PacketType> {
        match value {
            0 => Some(PacketType::Data),
            1 => Some(PacketType::ConnectionRequest),
            2 => Some(PacketType::ConnectionAccept),
            3 => Some(PacketType::KeepAlive),
            4 => Some(PacketType::ServerFull),
            5 => Some(PacketType::Punchthru),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TunnelHeader {
    pub magic: [u8; 4],
    pub flags: u8,
    pub packet_type: PacketType,
}

impl TunnelHeader {
    pub fn new(magic: [u8; 4], flags: u8, packet_type: PacketType) -> TunnelHeader {
        TunnelHeader {
            magic,
            flags,
            packet_type,
        }
    }

    /// Writes the header into the first `HEADER_SIZE` bytes of `buffer`.
    pub fn encode(&self, buffer: &mut [u8]) {
        buffer[0..4].copy_from_slice(&self.magic);
        buffer[4] = self.flags;
        buffer[5] = self.packet_type as u8;
    }

    pub fn decode(buffer: &[u8]) -> Result<TunnelHeader, DecodeError> {
        if buffer.len() < HEADER_SIZE {
            return Err(DecodeError::TooShort);
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buffer[0..4]);

        if magic != MAGIC_CLIENT && magic != MAGIC_SERVER {
            return Err(DecodeError::BadMagic);
        }

        let flags = buffer[4];
        let packet_type =
            PacketType::from_u8(buffer[5]).ok_or(DecodeError::UnknownType(buffer[5]))?;

        Ok(TunnelHeader {
            magic,
            flags,
            packet_type,
        })
    }

    pub fn emulation_requested(&self) -> bool {
        self.flags & FLAG_EMULATION != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_packet_type() {
        let types = [
            PacketType::Data,
            PacketType::ConnectionRequest,
            PacketType::ConnectionAccept,
            PacketType::KeepAlive,
            PacketType::ServerFull,
            PacketType::Punchthru,
        ];

        for packet_type in types {
            for flags in [0u8, FLAG_EMULATION] {
                let header = TunnelHeader::new(MAGIC_CLIENT, flags, packet_type);
                let mut buffer = [0u8; HEADER_SIZE];
                header.encode(&mut buffer);

                let decoded = TunnelHeader::decode(&buffer).unwrap();
                assert_eq!(decoded.magic, MAGIC_CLIENT);
                assert_eq!(decoded.flags, flags);
                assert_eq!(decoded.packet_type, packet_type);
            }
        }
    }

    #[test]
    fn rejects_short_buffer() {
        let buffer = [0u8; HEADER_SIZE - 1];
        assert!(matches!(
            TunnelHeader::decode(&buffer),
            Err(DecodeError::TooShort)
        ));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buffer = [0u8; HEADER_SIZE];
        buffer[0..4].copy_from_slice(b"NOPE");
        assert!(matches!(
            TunnelHeader::decode(&buffer),
            Err(DecodeError::BadMagic)
        ));
    }

    #[test]
    fn rejects_unknown_type() {
        let mut buffer = [0u8; HEADER_SIZE];
        buffer[0..4].copy_from_slice(&MAGIC_SERVER);
        buffer[5] = 0xee;
        assert!(matches!(
            TunnelHeader::decode(&buffer),
            Err(DecodeError::UnknownType(0xee))
        ));
    }

    #[test]
    fn emulation_flag_bit_is_bit_zero() {
        let header = TunnelHeader::new(MAGIC_CLIENT, FLAG_EMULATION, PacketType::ConnectionRequest);
        assert!(header.emulation_requested());

        let header = TunnelHeader::new(MAGIC_CLIENT, 0, PacketType::ConnectionRequest);
        assert!(!header.emulation_requested());
    }
}
