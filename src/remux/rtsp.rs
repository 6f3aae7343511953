use bytes::{BufMut, Bytes, BytesMut};

use crate::base::{
    AvPacket, AvPacketPayloadType, RtmpHeader, RtmpMsg, RTMP_CODEC_ID_AVC, RTMP_CODEC_ID_HEVC,
    RTMP_SOUND_FORMAT_AAC, RTMP_TYPE_ID_AUDIO, RTMP_TYPE_ID_METADATA, RTMP_TYPE_ID_VIDEO,
};
use crate::codec::{avc, hevc};
use crate::error::{Result, RillError};
use crate::remux::amf::{build_on_metadata, Amf0Value};

/// RTMP messages synthesized from an RTSP publisher's decoder configs:
/// onMetaData, video seq header, AAC seq header. Any of them may be absent
/// when the corresponding config is.
pub fn av_config_to_rtmp_msgs(
    asc: Option<&[u8]>,
    vps: Option<&[u8]>,
    sps: Option<&[u8]>,
    pps: Option<&[u8]>,
) -> Result<(Option<RtmpMsg>, Option<RtmpMsg>, Option<RtmpMsg>)> {
    let mut width = 0u32;
    let mut height = 0u32;
    let mut video_codec_id = 0u8;

    let video_seq_header = match (sps, pps) {
        (Some(sps), Some(pps)) => {
            let payload = if let Some(vps) = vps {
                let ctx = hevc::parse_sps(sps)?;
                width = ctx.pic_width_in_luma_samples;
                height = ctx.pic_height_in_luma_samples;
                video_codec_id = RTMP_CODEC_ID_HEVC;
                build_hevc_seq_header(vps, sps, pps)
            } else {
                let ctx = avc::parse_sps(sps)?;
                width = ctx.width;
                height = ctx.height;
                video_codec_id = RTMP_CODEC_ID_AVC;
                build_avc_seq_header(sps, pps)
            };
            Some(video_msg(payload))
        }
        _ => None,
    };

    let aac_seq_header = asc.map(|asc| {
        let mut payload = BytesMut::with_capacity(2 + asc.len());
        payload.put_u8(RTMP_SOUND_FORMAT_AAC << 4 | 0x0F);
        payload.put_u8(0x00); // seq header packet type
        payload.put_slice(asc);
        audio_msg(payload.freeze(), 0)
    });

    let mut pairs: Vec<(&str, Amf0Value)> = Vec::new();
    if video_seq_header.is_some() {
        pairs.push(("width", Amf0Value::Number(f64::from(width))));
        pairs.push(("height", Amf0Value::Number(f64::from(height))));
        pairs.push((
            "videocodecid",
            Amf0Value::Number(f64::from(video_codec_id)),
        ));
    }
    if aac_seq_header.is_some() {
        pairs.push((
            "audiocodecid",
            Amf0Value::Number(f64::from(RTMP_SOUND_FORMAT_AAC)),
        ));
    }
    let metadata = if pairs.is_empty() {
        None
    } else {
        pairs.push((
            "version",
            Amf0Value::String(concat!("rill", env!("CARGO_PKG_VERSION")).to_string()),
        ));
        let body = build_on_metadata(&pairs);
        Some(RtmpMsg {
            header: RtmpHeader {
                msg_len: body.len() as u32,
                msg_type_id: RTMP_TYPE_ID_METADATA,
                ..Default::default()
            },
            payload: body,
        })
    };

    Ok((metadata, video_seq_header, aac_seq_header))
}

/// One depacketized access unit to an RTMP media message. Video payloads are
/// 4-byte length-prefixed NALUs; audio payloads are raw AAC frames.
pub fn av_packet_to_rtmp_msg(pkt: &AvPacket) -> Result<RtmpMsg> {
    match pkt.payload_type {
        AvPacketPayloadType::Aac => {
            let mut payload = BytesMut::with_capacity(2 + pkt.payload.len());
            payload.put_u8(RTMP_SOUND_FORMAT_AAC << 4 | 0x0F);
            payload.put_u8(0x01); // raw frame packet type
            payload.put_slice(&pkt.payload);
            Ok(audio_msg(payload.freeze(), pkt.timestamp))
        }
        AvPacketPayloadType::Avc | AvPacketPayloadType::Hevc => {
            let is_hevc = pkt.payload_type == AvPacketPayloadType::Hevc;
            let key = scan_for_key_nalu(&pkt.payload, is_hevc)?;
            let codec_id = if is_hevc {
                RTMP_CODEC_ID_HEVC
            } else {
                RTMP_CODEC_ID_AVC
            };

            let mut payload = BytesMut::with_capacity(5 + pkt.payload.len());
            payload.put_u8(if key { 1 << 4 } else { 2 << 4 } | codec_id);
            payload.put_u8(0x01); // NALU packet type
            payload.put_uint(0, 3); // composition time
            payload.put_slice(&pkt.payload);

            Ok(RtmpMsg {
                header: RtmpHeader {
                    msg_len: payload.len() as u32,
                    msg_type_id: RTMP_TYPE_ID_VIDEO,
                    timestamp_abs: pkt.timestamp,
                    ..Default::default()
                },
                payload: payload.freeze(),
            })
        }
    }
}

/// Walk the 4-byte length-prefixed NALUs looking for a key picture.
fn scan_for_key_nalu(payload: &[u8], is_hevc: bool) -> Result<bool> {
    let mut i = 0usize;
    while i < payload.len() {
        if i + 4 > payload.len() {
            return Err(RillError::InvalidCodecData("bad nalu length prefix".into()));
        }
        let len = usize::from(payload[i]) << 24
            | usize::from(payload[i + 1]) << 16
            | usize::from(payload[i + 2]) << 8
            | usize::from(payload[i + 3]);
        i += 4;
        if len == 0 || i + len > payload.len() {
            return Err(RillError::InvalidCodecData("bad nalu length prefix".into()));
        }
        let key = if is_hevc {
            // BLA..CRA range
            (16..=23).contains(&hevc::parse_nalu_type(payload[i]))
        } else {
            avc::parse_nalu_type(payload[i]) == avc::NALU_TYPE_IDR_SLICE
        };
        if key {
            return Ok(true);
        }
        i += len;
    }
    Ok(false)
}

fn build_avc_seq_header(sps: &[u8], pps: &[u8]) -> Bytes {
    let mut p = BytesMut::with_capacity(16 + sps.len() + pps.len());
    p.put_slice(&[0x17, 0x00, 0x00, 0x00, 0x00]);
    p.put_u8(0x01); // configurationVersion
    p.put_u8(sps.get(1).copied().unwrap_or(0));
    p.put_u8(sps.get(2).copied().unwrap_or(0));
    p.put_u8(sps.get(3).copied().unwrap_or(0));
    p.put_u8(0xFF); // 4-byte NALU lengths
    p.put_u8(0xE1); // one sps
    p.put_u16(sps.len() as u16);
    p.put_slice(sps);
    p.put_u8(0x01); // one pps
    p.put_u16(pps.len() as u16);
    p.put_slice(pps);
    p.freeze()
}

fn build_hevc_seq_header(vps: &[u8], sps: &[u8], pps: &[u8]) -> Bytes {
    let mut p = BytesMut::with_capacity(40 + vps.len() + sps.len() + pps.len());
    p.put_slice(&[0x1C, 0x00, 0x00, 0x00, 0x00]);

    p.put_u8(0x01); // configurationVersion
    // profile tier level copied out of the SPS when it is long enough
    if sps.len() >= 15 {
        p.put_slice(&sps[3..15]);
    } else {
        p.put_bytes(0, 12);
    }
    p.put_u16(0xF000); // min_spatial_segmentation_idc + reserved
    p.put_u8(0xFC); // parallelismType + reserved
    p.put_u8(0xFC | 0x01); // chromaFormat 4:2:0 + reserved
    p.put_u8(0xF8); // bitDepthLumaMinus8 + reserved
    p.put_u8(0xF8); // bitDepthChromaMinus8 + reserved
    p.put_u16(0); // avgFrameRate
    p.put_u8(0x0F); // numTemporalLayers=1, temporalIdNested, 4-byte lengths
    p.put_u8(0x03); // numOfArrays

    for (nalu_type, nalu) in [
        (hevc::NALU_TYPE_VPS, vps),
        (hevc::NALU_TYPE_SPS, sps),
        (hevc::NALU_TYPE_PPS, pps),
    ] {
        p.put_u8(0x80 | nalu_type); // array_completeness set
        p.put_u16(1);
        p.put_u16(nalu.len() as u16);
        p.put_slice(nalu);
    }
    p.freeze()
}

fn video_msg(payload: Bytes) -> RtmpMsg {
    RtmpMsg {
        header: RtmpHeader {
            msg_len: payload.len() as u32,
            msg_type_id: RTMP_TYPE_ID_VIDEO,
            ..Default::default()
        },
        payload,
    }
}

fn audio_msg(payload: Bytes, timestamp: u32) -> RtmpMsg {
    RtmpMsg {
        header: RtmpHeader {
            msg_len: payload.len() as u32,
            msg_type_id: RTMP_TYPE_ID_AUDIO,
            timestamp_abs: timestamp,
            ..Default::default()
        },
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS_720P: [u8; 24] = [
        0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9, 0x40, 0x50, 0x05, 0xBB, 0x01, 0x10, 0x00, 0x00,
        0x3E, 0x90, 0x00, 0x0E, 0xA6, 0x00, 0xF1, 0x83, 0x19, 0x60,
    ];
    const PPS: [u8; 4] = [0x68, 0xEB, 0xE3, 0xCB];
    const ASC: [u8; 2] = [0x12, 0x10];

    #[test]
    fn synthesizes_all_three_messages() {
        let (metadata, vsh, ash) =
            av_config_to_rtmp_msgs(Some(&ASC), None, Some(&SPS_720P), Some(&PPS)).unwrap();

        let metadata = metadata.unwrap();
        assert!(metadata.is_metadata());

        let vsh = vsh.unwrap();
        assert!(vsh.is_avc_key_seq_header());
        // the synthesized seq header parses back to the same sps/pps
        let (sps, pps) = avc::parse_sps_pps_from_seq_header(&vsh.payload).unwrap();
        assert_eq!(sps, &SPS_720P);
        assert_eq!(pps, &PPS);

        let ash = ash.unwrap();
        assert!(ash.is_aac_seq_header());
        assert_eq!(&ash.payload[2..], &ASC);
    }

    #[test]
    fn audio_only_config() {
        let (metadata, vsh, ash) = av_config_to_rtmp_msgs(Some(&ASC), None, None, None).unwrap();
        assert!(metadata.is_some());
        assert!(vsh.is_none());
        assert!(ash.is_some());
    }

    #[test]
    fn converts_aac_packet() {
        let pkt = AvPacket {
            payload_type: AvPacketPayloadType::Aac,
            timestamp: 23,
            payload: Bytes::from_static(&[0x21, 0x2b, 0x94]),
        };
        let msg = av_packet_to_rtmp_msg(&pkt).unwrap();
        assert_eq!(msg.header.msg_type_id, RTMP_TYPE_ID_AUDIO);
        assert_eq!(msg.header.timestamp_abs, 23);
        assert_eq!(&msg.payload[..2], &[0xAF, 0x01]);
    }

    #[test]
    fn converts_avc_packet_and_flags_key_frames() {
        // one IDR nalu, length-prefixed
        let mut body = vec![0, 0, 0, 2];
        body.extend_from_slice(&[0x65, 0x88]);
        let pkt = AvPacket {
            payload_type: AvPacketPayloadType::Avc,
            timestamp: 40,
            payload: Bytes::from(body),
        };
        let msg = av_packet_to_rtmp_msg(&pkt).unwrap();
        assert!(msg.is_video_key_nalu());

        // one non-IDR nalu
        let mut body = vec![0, 0, 0, 2];
        body.extend_from_slice(&[0x41, 0x9a]);
        let pkt = AvPacket {
            payload_type: AvPacketPayloadType::Avc,
            timestamp: 80,
            payload: Bytes::from(body),
        };
        let msg = av_packet_to_rtmp_msg(&pkt).unwrap();
        assert!(!msg.is_video_key_nalu());
        assert_eq!(msg.payload[0], 0x27);
    }

    #[test]
    fn rejects_bad_length_prefix() {
        let pkt = AvPacket {
            payload_type: AvPacketPayloadType::Avc,
            timestamp: 0,
            payload: Bytes::from_static(&[0, 0, 0, 200, 0x65]),
        };
        assert!(av_packet_to_rtmp_msg(&pkt).is_err());
    }
}
