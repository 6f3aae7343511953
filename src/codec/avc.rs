use crate::codec::bits::BitReader;
use crate::error::{Result, RillError};

pub const NALU_TYPE_SLICE: u8 = 1;
pub const NALU_TYPE_IDR_SLICE: u8 = 5;
pub const NALU_TYPE_SEI: u8 = 6;
pub const NALU_TYPE_SPS: u8 = 7;
pub const NALU_TYPE_PPS: u8 = 8;
pub const NALU_TYPE_AUD: u8 = 9;

pub const NALU_START_CODE_3: [u8; 3] = [0x00, 0x00, 0x01];
pub const NALU_START_CODE_4: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Access unit delimiter emitted in front of every AnnexB frame.
pub const AUD_NALU: [u8; 6] = [0x00, 0x00, 0x00, 0x01, 0x09, 0xf0];

pub fn parse_nalu_type(first_byte: u8) -> u8 {
    first_byte & 0x1F
}

/// Dimensions and profile derived from a sequence parameter set.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpsContext {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
}

/// Slice SPS and PPS out of an RTMP AVC seq header payload
/// (5-byte tag prefix followed by an AVCDecoderConfigurationRecord).
/// Only the first SPS and PPS are returned.
pub fn parse_sps_pps_from_seq_header(payload: &[u8]) -> Result<(&[u8], &[u8])> {
    if payload.len() < 13 {
        return Err(RillError::ShortPayload {
            need: 13,
            got: payload.len(),
        });
    }
    // 5-byte prefix, then configurationVersion, profile, compat, level,
    // lengthSizeMinusOne
    let mut i = 10;
    let num_sps = payload[i] & 0x1F;
    i += 1;
    if num_sps == 0 {
        return Err(RillError::InvalidCodecData("no sps in seq header".into()));
    }
    let sps_len = read_u16(payload, i)? as usize;
    i += 2;
    let sps = slice_checked(payload, i, sps_len)?;
    i += sps_len;

    if i >= payload.len() {
        return Err(RillError::InvalidCodecData("no pps in seq header".into()));
    }
    let num_pps = payload[i];
    i += 1;
    if num_pps == 0 {
        return Err(RillError::InvalidCodecData("no pps in seq header".into()));
    }
    let pps_len = read_u16(payload, i)? as usize;
    i += 2;
    let pps = slice_checked(payload, i, pps_len)?;

    Ok((sps, pps))
}

/// AnnexB rendition of the seq header: start code + SPS + start code + PPS.
pub fn sps_pps_seq_header_to_annexb(payload: &[u8]) -> Result<Vec<u8>> {
    let (sps, pps) = parse_sps_pps_from_seq_header(payload)?;
    let mut out = Vec::with_capacity(sps.len() + pps.len() + 8);
    out.extend_from_slice(&NALU_START_CODE_4);
    out.extend_from_slice(sps);
    out.extend_from_slice(&NALU_START_CODE_4);
    out.extend_from_slice(pps);
    Ok(out)
}

/// Parse the fields of an SPS NALU (header byte included) needed for
/// width/height derivation.
pub fn parse_sps(sps: &[u8]) -> Result<SpsContext> {
    if sps.len() < 4 {
        return Err(RillError::ShortPayload {
            need: 4,
            got: sps.len(),
        });
    }
    let mut ctx = SpsContext {
        profile_idc: sps[1],
        level_idc: sps[3],
        ..Default::default()
    };

    let mut br = BitReader::new(&sps[4..]);
    let _sps_id = br.read_ue()?;

    let mut chroma_format_idc = 1;
    if matches!(
        ctx.profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = br.read_ue()?;
        if chroma_format_idc == 3 {
            br.skip_bits(1)?; // separate_colour_plane_flag
        }
        let _bit_depth_luma = br.read_ue()?;
        let _bit_depth_chroma = br.read_ue()?;
        br.skip_bits(1)?; // qpprime_y_zero_transform_bypass_flag
        if br.read_bit()? == 1 {
            let count = if chroma_format_idc != 3 { 8 } else { 12 };
            for i in 0..count {
                if br.read_bit()? == 1 {
                    skip_scaling_list(&mut br, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    let _log2_max_frame_num = br.read_ue()?;
    let pic_order_cnt_type = br.read_ue()?;
    if pic_order_cnt_type == 0 {
        let _ = br.read_ue()?;
    } else if pic_order_cnt_type == 1 {
        br.skip_bits(1)?;
        let _ = br.read_se()?;
        let _ = br.read_se()?;
        let cycles = br.read_ue()?;
        for _ in 0..cycles {
            let _ = br.read_se()?;
        }
    }
    let _max_num_ref_frames = br.read_ue()?;
    br.skip_bits(1)?; // gaps_in_frame_num_value_allowed_flag

    let pic_width_in_mbs = br.read_ue()? + 1;
    let pic_height_in_map_units = br.read_ue()? + 1;
    let frame_mbs_only = br.read_bit()?;
    if frame_mbs_only == 0 {
        br.skip_bits(1)?; // mb_adaptive_frame_field_flag
    }
    br.skip_bits(1)?; // direct_8x8_inference_flag

    let (mut crop_x, mut crop_y) = (0u32, 0u32);
    if br.read_bit()? == 1 {
        let left = br.read_ue()?;
        let right = br.read_ue()?;
        let top = br.read_ue()?;
        let bottom = br.read_ue()?;
        let (unit_x, unit_y) = match chroma_format_idc {
            0 => (1, 2 - u32::from(frame_mbs_only)),
            1 => (2, 2 * (2 - u32::from(frame_mbs_only))),
            2 => (2, 2 - u32::from(frame_mbs_only)),
            _ => (1, 2 - u32::from(frame_mbs_only)),
        };
        crop_x = (left + right) * unit_x;
        crop_y = (top + bottom) * unit_y;
    }

    ctx.width = pic_width_in_mbs * 16 - crop_x;
    ctx.height = (2 - u32::from(frame_mbs_only)) * pic_height_in_map_units * 16 - crop_y;
    Ok(ctx)
}

fn skip_scaling_list(br: &mut BitReader<'_>, size: u32) -> Result<()> {
    let mut last: i32 = 8;
    let mut next: i32 = 8;
    for _ in 0..size {
        if next != 0 {
            let delta = br.read_se()?;
            next = (last + delta + 256) % 256;
        }
        if next != 0 {
            last = next;
        }
    }
    Ok(())
}

fn read_u16(b: &[u8], i: usize) -> Result<u16> {
    if i + 2 > b.len() {
        return Err(RillError::ShortPayload {
            need: i + 2,
            got: b.len(),
        });
    }
    Ok(u16::from(b[i]) << 8 | u16::from(b[i + 1]))
}

fn slice_checked(b: &[u8], i: usize, len: usize) -> Result<&[u8]> {
    if i + len > b.len() {
        return Err(RillError::ShortPayload {
            need: i + len,
            got: b.len(),
        });
    }
    Ok(&b[i..i + len])
}

#[cfg(test)]
mod tests {
    use super::*;

    // 1280x720 high-profile SPS as produced by a common encoder.
    const SPS_720P: [u8; 24] = [
        0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9, 0x40, 0x50, 0x05, 0xBB, 0x01, 0x10, 0x00, 0x00,
        0x3E, 0x90, 0x00, 0x0E, 0xA6, 0x00, 0xF1, 0x83, 0x19, 0x60,
    ];
    const PPS: [u8; 4] = [0x68, 0xEB, 0xE3, 0xCB];

    fn seq_header_payload() -> Vec<u8> {
        let mut p = vec![0x17, 0x00, 0x00, 0x00, 0x00];
        p.extend_from_slice(&[0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1]);
        p.extend_from_slice(&(SPS_720P.len() as u16).to_be_bytes());
        p.extend_from_slice(&SPS_720P);
        p.push(0x01);
        p.extend_from_slice(&(PPS.len() as u16).to_be_bytes());
        p.extend_from_slice(&PPS);
        p
    }

    #[test]
    fn splits_seq_header() {
        let payload = seq_header_payload();
        let (sps, pps) = parse_sps_pps_from_seq_header(&payload).unwrap();
        assert_eq!(sps, &SPS_720P);
        assert_eq!(pps, &PPS);
    }

    #[test]
    fn seq_header_to_annexb() {
        let payload = seq_header_payload();
        let annexb = sps_pps_seq_header_to_annexb(&payload).unwrap();
        assert!(annexb.starts_with(&NALU_START_CODE_4));
        let second = 4 + SPS_720P.len();
        assert_eq!(&annexb[second..second + 4], &NALU_START_CODE_4);
        assert_eq!(annexb.len(), 8 + SPS_720P.len() + PPS.len());
    }

    #[test]
    fn derives_dimensions_from_sps() {
        let ctx = parse_sps(&SPS_720P).unwrap();
        assert_eq!(ctx.profile_idc, 100);
        assert_eq!(ctx.width, 1280);
        assert_eq!(ctx.height, 720);
    }

    #[test]
    fn rejects_truncated_seq_header() {
        assert!(parse_sps_pps_from_seq_header(&[0x17, 0x00]).is_err());
        let mut payload = seq_header_payload();
        payload.truncate(16);
        assert!(parse_sps_pps_from_seq_header(&payload).is_err());
    }
}
