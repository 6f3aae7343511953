use bytes::{BufMut, Bytes, BytesMut};

use crate::base::msg::{CSID_AMF, CSID_AUDIO, CSID_VIDEO, MSID1};
use crate::base::{RtmpHeader, RTMP_TYPE_ID_AUDIO, RTMP_TYPE_ID_METADATA, RTMP_TYPE_ID_VIDEO};

/// Chunk size this server advertises to its consumers.
pub const LOCAL_CHUNK_SIZE: usize = 4096;

/// Canonical header for re-emitting a message downstream: keep length, type
/// and timestamp, normalize csid and message stream id.
pub fn make_default_header(h: &RtmpHeader) -> RtmpHeader {
    let csid = match h.msg_type_id {
        RTMP_TYPE_ID_METADATA => CSID_AMF,
        RTMP_TYPE_ID_AUDIO => CSID_AUDIO,
        RTMP_TYPE_ID_VIDEO => CSID_VIDEO,
        _ => CSID_AMF,
    };
    RtmpHeader {
        csid,
        msg_len: h.msg_len,
        msg_type_id: h.msg_type_id,
        msg_stream_id: MSID1,
        timestamp_abs: h.timestamp_abs,
    }
}

pub fn message_to_chunks(payload: &[u8], header: &RtmpHeader) -> Bytes {
    message_to_chunks_with_size(payload, header, LOCAL_CHUNK_SIZE)
}

/// Split one message into a type-0 chunk followed by type-3 continuation
/// chunks of at most `chunk_size` payload bytes each. csid must fit the
/// single-byte basic header (< 64).
pub fn message_to_chunks_with_size(
    payload: &[u8],
    header: &RtmpHeader,
    chunk_size: usize,
) -> Bytes {
    debug_assert!(header.csid < 64);
    debug_assert!(chunk_size > 0);

    let ts = header.timestamp_abs;
    let extended_ts = ts >= 0xFF_FFFF;
    let chunk_count = payload.len().div_ceil(chunk_size).max(1);
    let mut buf =
        BytesMut::with_capacity(payload.len() + 16 + chunk_count * if extended_ts { 5 } else { 1 });

    // type-0 message header
    buf.put_u8(header.csid as u8);
    if extended_ts {
        buf.put_uint(0xFF_FFFF, 3);
    } else {
        buf.put_uint(u64::from(ts), 3);
    }
    buf.put_uint(u64::from(header.msg_len), 3);
    buf.put_u8(header.msg_type_id);
    buf.put_u32_le(header.msg_stream_id);
    if extended_ts {
        buf.put_u32(ts);
    }

    let mut pos = 0;
    loop {
        let n = chunk_size.min(payload.len() - pos);
        buf.put_slice(&payload[pos..pos + n]);
        pos += n;
        if pos >= payload.len() {
            break;
        }
        // type-3 continuation
        buf.put_u8(0xC0 | header.csid as u8);
        if extended_ts {
            buf.put_u32(ts);
        }
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(len: u32, ts: u32) -> RtmpHeader {
        RtmpHeader {
            csid: CSID_VIDEO,
            msg_len: len,
            msg_type_id: RTMP_TYPE_ID_VIDEO,
            msg_stream_id: MSID1,
            timestamp_abs: ts,
        }
    }

    #[test]
    fn single_chunk_message() {
        let payload = [1u8, 2, 3, 4];
        let chunks = message_to_chunks_with_size(&payload, &header(4, 100), 128);
        // basic(1) + msg header(11) + payload(4)
        assert_eq!(chunks.len(), 16);
        assert_eq!(chunks[0], CSID_VIDEO as u8);
        assert_eq!(&chunks[1..4], &[0, 0, 100]);
        assert_eq!(&chunks[4..7], &[0, 0, 4]);
        assert_eq!(chunks[7], RTMP_TYPE_ID_VIDEO);
        assert_eq!(&chunks[8..12], &[1, 0, 0, 0]); // msid little endian
        assert_eq!(&chunks[12..], &payload);
    }

    #[test]
    fn splits_into_continuation_chunks() {
        let payload = vec![0xAAu8; 300];
        let chunks = message_to_chunks_with_size(&payload, &header(300, 0), 128);
        // 12 header bytes + 300 payload + 2 continuation basic headers
        assert_eq!(chunks.len(), 12 + 300 + 2);
        assert_eq!(chunks[12 + 128], 0xC0 | CSID_VIDEO as u8);
        assert_eq!(chunks[12 + 128 + 1 + 128], 0xC0 | CSID_VIDEO as u8);
    }

    #[test]
    fn extended_timestamp_is_repeated_per_chunk() {
        let payload = vec![0u8; 200];
        let chunks = message_to_chunks_with_size(&payload, &header(200, 0x0100_0000), 128);
        assert_eq!(&chunks[1..4], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(&chunks[12..16], &[0x01, 0x00, 0x00, 0x00]);
        // continuation chunk carries the extended timestamp again
        let cont = 16 + 128;
        assert_eq!(chunks[cont], 0xC0 | CSID_VIDEO as u8);
        assert_eq!(&chunks[cont + 1..cont + 5], &[0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn default_header_normalizes_csid_and_msid() {
        let h = RtmpHeader {
            csid: 3,
            msg_len: 10,
            msg_type_id: RTMP_TYPE_ID_AUDIO,
            msg_stream_id: 42,
            timestamp_abs: 7,
        };
        let out = make_default_header(&h);
        assert_eq!(out.csid, CSID_AUDIO);
        assert_eq!(out.msg_stream_id, MSID1);
        assert_eq!(out.timestamp_abs, 7);
        assert_eq!(out.msg_len, 10);
    }
}
