use bytes::{BufMut, Bytes, BytesMut};

use crate::base::{RtmpHeader, RtmpMsg};
use crate::error::{Result, RillError};

/// 9-byte FLV file header (audio+video flags set) plus PreviousTagSize0.
pub const FLV_FILE_HEADER: [u8; 13] = [
    b'F', b'L', b'V', 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
];

pub const FLV_TAG_HEADER_SIZE: usize = 11;
pub const FLV_PREV_TAG_SIZE_LEN: usize = 4;

/// Serialize one message as a complete FLV tag: 11-byte header, body, and
/// trailing PreviousTagSize.
pub fn rtmp_msg_to_flv_tag(msg: &RtmpMsg) -> Bytes {
    let data_len = msg.payload.len();
    let ts = msg.header.timestamp_abs;

    let mut buf = BytesMut::with_capacity(FLV_TAG_HEADER_SIZE + data_len + FLV_PREV_TAG_SIZE_LEN);
    buf.put_u8(msg.header.msg_type_id);
    buf.put_uint(data_len as u64, 3);
    buf.put_uint(u64::from(ts & 0xFF_FFFF), 3);
    buf.put_u8((ts >> 24) as u8);
    buf.put_uint(0, 3); // stream id
    buf.put_slice(&msg.payload);
    buf.put_u32((FLV_TAG_HEADER_SIZE + data_len) as u32);
    buf.freeze()
}

/// Parse one complete FLV tag (header + body, PreviousTagSize optional) back
/// into a message. Used by relay ingress and tests.
pub fn flv_tag_to_rtmp_msg(tag: &[u8]) -> Result<RtmpMsg> {
    if tag.len() < FLV_TAG_HEADER_SIZE {
        return Err(RillError::ShortPayload {
            need: FLV_TAG_HEADER_SIZE,
            got: tag.len(),
        });
    }
    let data_len = usize::from(tag[1]) << 16 | usize::from(tag[2]) << 8 | usize::from(tag[3]);
    if tag.len() < FLV_TAG_HEADER_SIZE + data_len {
        return Err(RillError::ShortPayload {
            need: FLV_TAG_HEADER_SIZE + data_len,
            got: tag.len(),
        });
    }
    let ts = u32::from(tag[7]) << 24 | u32::from(tag[4]) << 16 | u32::from(tag[5]) << 8
        | u32::from(tag[6]);

    Ok(RtmpMsg {
        header: RtmpHeader {
            csid: 0,
            msg_len: data_len as u32,
            msg_type_id: tag[0],
            msg_stream_id: 0,
            timestamp_abs: ts,
        },
        payload: Bytes::copy_from_slice(&tag[FLV_TAG_HEADER_SIZE..FLV_TAG_HEADER_SIZE + data_len]),
    })
}
