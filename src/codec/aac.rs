use crate::base::{RTMP_AAC_PACKET_TYPE_SEQ_HEADER, RTMP_SOUND_FORMAT_AAC};
use crate::error::{Result, RillError};

/// Fields of the 2-byte AudioSpecificConfig carried in the RTMP AAC seq
/// header and in SDP fmtp lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AscContext {
    pub audio_object_type: u8,
    pub sampling_frequency_index: u8,
    pub channel_configuration: u8,
}

pub fn parse_asc(asc: &[u8]) -> Result<AscContext> {
    if asc.len() < 2 {
        return Err(RillError::ShortPayload {
            need: 2,
            got: asc.len(),
        });
    }
    Ok(AscContext {
        audio_object_type: asc[0] >> 3,
        sampling_frequency_index: (asc[0] & 0x07) << 1 | asc[1] >> 7,
        channel_configuration: (asc[1] >> 3) & 0x0F,
    })
}

/// Parse the full RTMP AAC seq header payload (0xAF 0x00 + ASC).
pub fn parse_aac_seq_header(payload: &[u8]) -> Result<AscContext> {
    if payload.len() < 4 {
        return Err(RillError::ShortPayload {
            need: 4,
            got: payload.len(),
        });
    }
    if payload[0] >> 4 != RTMP_SOUND_FORMAT_AAC {
        return Err(RillError::UnsupportedCodec(format!(
            "sound format {}",
            payload[0] >> 4
        )));
    }
    if payload[1] != RTMP_AAC_PACKET_TYPE_SEQ_HEADER {
        return Err(RillError::InvalidCodecData(
            "not an aac seq header".into(),
        ));
    }
    parse_asc(&payload[2..])
}

/// ADTS header synthesizer. Initialized once from the ASC, then stamps a
/// 7-byte header per raw AAC frame.
#[derive(Debug, Default)]
pub struct Adts {
    ctx: Option<AscContext>,
}

impl Adts {
    pub fn init_with_asc(&mut self, asc: &[u8]) -> Result<()> {
        self.ctx = Some(parse_asc(asc)?);
        Ok(())
    }

    pub fn has_inited(&self) -> bool {
        self.ctx.is_some()
    }

    /// Header for one raw AAC frame of `frame_len` bytes (without the ADTS
    /// header itself).
    pub fn calc_adts_header(&self, frame_len: u16) -> Result<[u8; 7]> {
        let ctx = self.ctx.ok_or(RillError::AdtsNotInited)?;
        let aac_frame_len = u32::from(frame_len) + 7;

        let mut h = [0u8; 7];
        // syncword, MPEG-4, layer 0, no CRC
        h[0] = 0xFF;
        h[1] = 0xF1;
        // profile is object type minus one
        h[2] = ctx.audio_object_type.saturating_sub(1) << 6
            | (ctx.sampling_frequency_index & 0x0F) << 2
            | (ctx.channel_configuration >> 2) & 0x01;
        h[3] = (ctx.channel_configuration & 0x03) << 6 | ((aac_frame_len >> 11) & 0x03) as u8;
        h[4] = ((aac_frame_len >> 3) & 0xFF) as u8;
        // buffer fullness all-ones, one raw data block
        h[5] = ((aac_frame_len & 0x07) << 5) as u8 | 0x1F;
        h[6] = 0xFC;
        Ok(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOLDEN_SEQ_HEADER: [u8; 4] = [0xaf, 0x00, 0x11, 0x90];

    #[test]
    fn parses_golden_seq_header() {
        let ctx = parse_aac_seq_header(&GOLDEN_SEQ_HEADER).unwrap();
        assert_eq!(ctx.audio_object_type, 2);
        assert_eq!(ctx.sampling_frequency_index, 3);
        assert_eq!(ctx.channel_configuration, 2);
    }

    #[test]
    fn calc_adts_header_matches_golden() {
        let mut adts = Adts::default();
        adts.init_with_asc(&GOLDEN_SEQ_HEADER[2..]).unwrap();
        // 359-byte RTMP audio payload minus the 2-byte AAC prefix
        let header = adts.calc_adts_header(357).unwrap();
        assert_eq!(header, [0xff, 0xf1, 0x4c, 0x80, 0x2d, 0x9f, 0xfc]);

        // re-init with another ASC works
        adts.init_with_asc(&[0x12, 0x10]).unwrap();
        assert!(adts.has_inited());
    }

    #[test]
    fn corner_cases() {
        let mut adts = Adts::default();
        assert!(adts.init_with_asc(&[]).is_err());
        assert!(adts.calc_adts_header(1).is_err());

        assert!(parse_aac_seq_header(&[]).is_err());

        adts.init_with_asc(&[0x12, 0x10]).unwrap();
        assert!(adts.calc_adts_header(128).is_ok());
    }
}
