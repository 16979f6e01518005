//! On-disk format of the packet buffer file.
//!
//! The file is a fixed header followed by equally sized packet slots.
//! Version 2 is current; version 1 files (fixed 32-byte stream field) are
//! converted at startup by the recovery path.

use std::convert::TryInto;

/// Magic at the start of the packet buffer file.
pub const FILE_MAGIC: [u8; 4] = *b"RNGS";

/// Current packet buffer format version.
pub const CURRENT_VERSION: u16 = 2;

/// Total header length in bytes.
pub const HEADER_LEN: u64 = 32;

/// Magic marking an occupied packet slot.
pub const SLOT_MAGIC: u32 = 0x5250_4b54;

/// Fixed per-slot header length for the current version:
/// magic(4) + packet id(8) + stream len(2) + data len(4).
pub const SLOT_HEADER_LEN: usize = 18;

/// Version-1 slots carried a fixed 32-byte stream field:
/// magic(4) + packet id(8) + stream(32) + data len(4).
pub const V1_SLOT_HEADER_LEN: usize = 48;
pub const V1_STREAM_LEN: usize = 32;

/// Decoded packet buffer file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u16,
    pub ring_size: u64,
    pub pkt_size: u32,
}

impl FileHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN as usize] {
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&FILE_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.ring_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.pkt_size.to_le_bytes());
        buf
    }

    /// Decode a header, distinguishing "not a packet buffer" from a valid
    /// header of any version.
    pub fn decode(buf: &[u8]) -> Result<Self, String> {
        if buf.len() < HEADER_LEN as usize {
            return Err("file shorter than header".to_string());
        }
        if buf[0..4] != FILE_MAGIC {
            return Err("bad magic".to_string());
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().expect("sliced"));
        let ring_size = u64::from_le_bytes(buf[8..16].try_into().expect("sliced"));
        let pkt_size = u32::from_le_bytes(buf[16..20].try_into().expect("sliced"));
        Ok(Self {
            version,
            ring_size,
            pkt_size,
        })
    }
}

/// Encode one occupied slot (current version). The result is at most
/// `pkt_size` bytes; the caller enforces that.
pub fn encode_slot(pkt_id: u64, stream: &str, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(SLOT_HEADER_LEN + stream.len() + data.len());
    buf.extend_from_slice(&SLOT_MAGIC.to_le_bytes());
    buf.extend_from_slice(&pkt_id.to_le_bytes());
    buf.extend_from_slice(&(stream.len() as u16).to_le_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(stream.as_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Decoded slot contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotPacket {
    pub pkt_id: u64,
    pub stream: String,
    pub data: Vec<u8>,
}

/// Decode one slot (current version). `Ok(None)` means the slot is empty;
/// `Err` means the slot is occupied but inconsistent.
pub fn decode_slot(buf: &[u8]) -> Result<Option<SlotPacket>, String> {
    if buf.len() < SLOT_HEADER_LEN {
        return Ok(None);
    }
    let magic = u32::from_le_bytes(buf[0..4].try_into().expect("sliced"));
    if magic != SLOT_MAGIC {
        return Ok(None);
    }
    let pkt_id = u64::from_le_bytes(buf[4..12].try_into().expect("sliced"));
    let stream_len = u16::from_le_bytes(buf[12..14].try_into().expect("sliced")) as usize;
    let data_len = u32::from_le_bytes(buf[14..18].try_into().expect("sliced")) as usize;

    let total = SLOT_HEADER_LEN + stream_len + data_len;
    if total > buf.len() {
        return Err(format!("slot for packet {} overruns its bounds", pkt_id));
    }
    let stream = std::str::from_utf8(&buf[SLOT_HEADER_LEN..SLOT_HEADER_LEN + stream_len])
        .map_err(|_| format!("slot for packet {} has a non-UTF8 stream id", pkt_id))?
        .to_string();
    let data = buf[SLOT_HEADER_LEN + stream_len..total].to_vec();

    Ok(Some(SlotPacket {
        pkt_id,
        stream,
        data,
    }))
}

/// Encode one version-1 slot. Used by conversion tests and kept next to the
/// decoder so the two layouts stay in one place.
pub fn encode_v1_slot(pkt_id: u64, stream: &str, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(V1_SLOT_HEADER_LEN + data.len());
    buf.extend_from_slice(&SLOT_MAGIC.to_le_bytes());
    buf.extend_from_slice(&pkt_id.to_le_bytes());
    let mut stream_field = [0u8; V1_STREAM_LEN];
    let len = stream.len().min(V1_STREAM_LEN);
    stream_field[..len].copy_from_slice(&stream.as_bytes()[..len]);
    buf.extend_from_slice(&stream_field);
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Decode one version-1 slot.
pub fn decode_v1_slot(buf: &[u8]) -> Result<Option<SlotPacket>, String> {
    if buf.len() < V1_SLOT_HEADER_LEN {
        return Ok(None);
    }
    let magic = u32::from_le_bytes(buf[0..4].try_into().expect("sliced"));
    if magic != SLOT_MAGIC {
        return Ok(None);
    }
    let pkt_id = u64::from_le_bytes(buf[4..12].try_into().expect("sliced"));
    let stream_field = &buf[12..12 + V1_STREAM_LEN];
    let stream_end = stream_field
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(V1_STREAM_LEN);
    let stream = std::str::from_utf8(&stream_field[..stream_end])
        .map_err(|_| format!("v1 slot for packet {} has a non-UTF8 stream id", pkt_id))?
        .to_string();
    let data_len =
        u32::from_le_bytes(buf[44..48].try_into().expect("sliced")) as usize;
    if V1_SLOT_HEADER_LEN + data_len > buf.len() {
        return Err(format!("v1 slot for packet {} overruns its bounds", pkt_id));
    }
    let data = buf[V1_SLOT_HEADER_LEN..V1_SLOT_HEADER_LEN + data_len].to_vec();

    Ok(Some(SlotPacket {
        pkt_id,
        stream,
        data,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_codec() {
        let header = FileHeader {
            version: CURRENT_VERSION,
            ring_size: 4096,
            pkt_size: 256,
        };
        let decoded = FileHeader::decode(&header.encode()).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut buf = FileHeader {
            version: 2,
            ring_size: 4096,
            pkt_size: 256,
        }
        .encode();
        buf[0] = b'X';
        assert!(FileHeader::decode(&buf).is_err());
    }

    #[test]
    fn test_slot_codec() {
        let encoded = encode_slot(42, "NET_STA", b"payload");
        let decoded = decode_slot(&encoded).unwrap().unwrap();
        assert_eq!(decoded.pkt_id, 42);
        assert_eq!(decoded.stream, "NET_STA");
        assert_eq!(decoded.data, b"payload");
    }

    #[test]
    fn test_empty_slot_decodes_to_none() {
        assert_eq!(decode_slot(&[0u8; 64]).unwrap(), None);
        assert_eq!(decode_slot(&[]).unwrap(), None);
    }

    #[test]
    fn test_v1_slot_codec() {
        let encoded = encode_v1_slot(7, "OLD_STREAM", b"legacy");
        let decoded = decode_v1_slot(&encoded).unwrap().unwrap();
        assert_eq!(decoded.pkt_id, 7);
        assert_eq!(decoded.stream, "OLD_STREAM");
        assert_eq!(decoded.data, b"legacy");
    }

    #[test]
    fn test_truncated_slot_is_an_error() {
        let mut encoded = encode_slot(1, "S", &[0u8; 100]);
        encoded.truncate(40);
        assert!(decode_slot(&encoded).is_err());
    }
}
