use crate::codec::bits::BitReader;
use crate::error::{Result, RillError};

pub const NALU_TYPE_VPS: u8 = 32;
pub const NALU_TYPE_SPS: u8 = 33;
pub const NALU_TYPE_PPS: u8 = 34;

/// HEVC NAL headers are two bytes; the type sits in the upper byte.
pub fn parse_nalu_type(first_byte: u8) -> u8 {
    (first_byte >> 1) & 0x3F
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HevcSpsContext {
    pub general_profile_idc: u8,
    pub general_level_idc: u8,
    pub pic_width_in_luma_samples: u32,
    pub pic_height_in_luma_samples: u32,
}

/// Slice VPS/SPS/PPS out of an RTMP HEVC seq header payload
/// (5-byte tag prefix followed by an HEVCDecoderConfigurationRecord).
pub fn parse_vps_sps_pps_from_seq_header(payload: &[u8]) -> Result<(&[u8], &[u8], &[u8])> {
    if payload.len() < 28 {
        return Err(RillError::ShortPayload {
            need: 28,
            got: payload.len(),
        });
    }
    let num_arrays = payload[27];
    let mut i = 28;

    let mut vps: Option<&[u8]> = None;
    let mut sps: Option<&[u8]> = None;
    let mut pps: Option<&[u8]> = None;

    for _ in 0..num_arrays {
        if i + 3 > payload.len() {
            return Err(RillError::InvalidCodecData("truncated hvcc array".into()));
        }
        let nalu_type = payload[i] & 0x3F;
        let num_nalus = usize::from(payload[i + 1]) << 8 | usize::from(payload[i + 2]);
        i += 3;
        for _ in 0..num_nalus {
            if i + 2 > payload.len() {
                return Err(RillError::InvalidCodecData("truncated hvcc nalu".into()));
            }
            let len = usize::from(payload[i]) << 8 | usize::from(payload[i + 1]);
            i += 2;
            if i + len > payload.len() {
                return Err(RillError::InvalidCodecData("truncated hvcc nalu".into()));
            }
            let nalu = &payload[i..i + len];
            i += len;
            match nalu_type {
                NALU_TYPE_VPS => vps = vps.or(Some(nalu)),
                NALU_TYPE_SPS => sps = sps.or(Some(nalu)),
                NALU_TYPE_PPS => pps = pps.or(Some(nalu)),
                _ => {}
            }
        }
    }

    match (vps, sps, pps) {
        (Some(v), Some(s), Some(p)) => Ok((v, s, p)),
        _ => Err(RillError::InvalidCodecData(
            "hvcc missing vps/sps/pps".into(),
        )),
    }
}

/// Strip emulation-prevention bytes (00 00 03 -> 00 00) so exp-Golomb fields
/// spanning them parse correctly.
fn unescape_rbsp(nalu: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nalu.len());
    let mut zeros = 0u32;
    for &b in nalu {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}

/// Parse the fields of an HEVC SPS NALU (2-byte header included) needed for
/// width/height derivation.
pub fn parse_sps(sps: &[u8]) -> Result<HevcSpsContext> {
    if sps.len() < 6 {
        return Err(RillError::ShortPayload {
            need: 6,
            got: sps.len(),
        });
    }
    let rbsp = unescape_rbsp(&sps[2..]);
    let mut br = BitReader::new(&rbsp);

    let _vps_id = br.read_bits(4)?;
    let max_sub_layers_minus1 = br.read_bits(3)?;
    br.skip_bits(1)?; // sps_temporal_id_nesting_flag

    // profile_tier_level
    br.skip_bits(2 + 1)?; // profile_space, tier_flag
    let profile_idc = br.read_bits(5)? as u8;
    br.skip_bits(32)?; // profile_compatibility_flags
    br.skip_bits(48)?; // source flags + reserved
    let level_idc = br.read_bits(8)? as u8;
    if max_sub_layers_minus1 > 0 {
        let mut profile_present = [false; 8];
        let mut level_present = [false; 8];
        for i in 0..max_sub_layers_minus1 as usize {
            profile_present[i] = br.read_bit()? == 1;
            level_present[i] = br.read_bit()? == 1;
        }
        for _ in max_sub_layers_minus1..8 {
            br.skip_bits(2)?; // reserved_zero_2bits
        }
        for i in 0..max_sub_layers_minus1 as usize {
            if profile_present[i] {
                br.skip_bits(88)?;
            }
            if level_present[i] {
                br.skip_bits(8)?;
            }
        }
    }

    let _sps_id = br.read_ue()?;
    let chroma_format_idc = br.read_ue()?;
    if chroma_format_idc == 3 {
        br.skip_bits(1)?; // separate_colour_plane_flag
    }
    let width = br.read_ue()?;
    let height = br.read_ue()?;

    Ok(HevcSpsContext {
        general_profile_idc: profile_idc,
        general_level_idc: level_idc,
        pic_width_in_luma_samples: width,
        pic_height_in_luma_samples: height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Main-profile 1280x720 SPS, emulation-prevention bytes included.
    const SPS_720P: [u8; 27] = [
        0x42, 0x01, 0x01, 0x01, 0x60, 0x00, 0x00, 0x03, 0x00, 0x90, 0x00, 0x00, 0x03, 0x00,
        0x00, 0x03, 0x00, 0x5D, 0xA0, 0x02, 0x80, 0x80, 0x2D, 0x16, 0x59, 0x5E, 0x49,
    ];
    const VPS: [u8; 4] = [0x40, 0x01, 0x0C, 0x01];
    const PPS: [u8; 3] = [0x44, 0x01, 0xC0];

    fn seq_header_payload() -> Vec<u8> {
        let mut p = vec![0x1c, 0x00, 0x00, 0x00, 0x00];
        // 22 bytes of fixed record fields before the array count
        p.extend_from_slice(&[0u8; 22]);
        p.push(3); // numOfArrays
        for (t, nalu) in [
            (NALU_TYPE_VPS, &VPS[..]),
            (NALU_TYPE_SPS, &SPS_720P[..]),
            (NALU_TYPE_PPS, &PPS[..]),
        ] {
            p.push(t);
            p.extend_from_slice(&1u16.to_be_bytes());
            p.extend_from_slice(&(nalu.len() as u16).to_be_bytes());
            p.extend_from_slice(nalu);
        }
        p
    }

    #[test]
    fn splits_seq_header() {
        let payload = seq_header_payload();
        let (vps, sps, pps) = parse_vps_sps_pps_from_seq_header(&payload).unwrap();
        assert_eq!(vps, &VPS);
        assert_eq!(sps, &SPS_720P);
        assert_eq!(pps, &PPS);
    }

    #[test]
    fn derives_dimensions_from_sps() {
        let ctx = parse_sps(&SPS_720P).unwrap();
        assert_eq!(ctx.general_profile_idc, 1);
        assert_eq!(ctx.pic_width_in_luma_samples, 1280);
        assert_eq!(ctx.pic_height_in_luma_samples, 720);
    }

    #[test]
    fn rejects_record_without_sps() {
        let mut p = vec![0x1c, 0x00, 0x00, 0x00, 0x00];
        p.extend_from_slice(&[0u8; 22]);
        p.push(0);
        assert!(parse_vps_sps_pps_from_seq_header(&p).is_err());
    }
}
