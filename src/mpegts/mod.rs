// MPEG-TS packetization: PAT/PMT bootstrap, PES wrapping, 188-byte packet
// splitting with per-PID continuity counters. Parsers cover just enough of
// the tables to verify emitted output.

use std::sync::OnceLock;

use bytes::{BufMut, BytesMut};

pub const TS_PACKET_SIZE: usize = 188;

pub const PID_PAT: u16 = 0x0000;
pub const PID_PMT: u16 = 0x1000;
pub const PID_VIDEO: u16 = 0x0100;
pub const PID_AUDIO: u16 = 0x0101;

pub const STREAM_ID_VIDEO: u8 = 0xE0;
pub const STREAM_ID_AUDIO: u8 = 0xC0;

pub const STREAM_TYPE_AVC: u8 = 0x1B;
pub const STREAM_TYPE_AAC: u8 = 0x0F;

/// One elementary-stream access unit ready for TS packetization.
///
/// `cc` is the PID's continuity counter going in; the packetizer advances it
/// per emitted packet and stores the final value back so the caller can
/// carry it to the next frame.
#[derive(Debug, Default)]
pub struct Frame {
    pub cc: u8,
    /// 90 kHz
    pub dts: u64,
    /// 90 kHz
    pub pts: u64,
    pub key: bool,
    pub pid: u16,
    pub sid: u8,
    pub raw: BytesMut,
}

// CRC-32/MPEG-2, most significant bit first.
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut j = 0;
        while j < 8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ 0x04C1_1DB7;
            } else {
                crc <<= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &b in data {
        let idx = ((crc >> 24) ^ u32::from(b)) & 0xFF;
        crc = (crc << 8) ^ CRC32_TABLE[idx as usize];
    }
    crc
}

/// The fixed PAT+PMT pair every fragment (and every HTTP-TS subscriber)
/// starts with: H.264 video on PID 0x100 (also the PCR PID), AAC audio on
/// PID 0x101, PMT on PID 0x1000.
pub fn fixed_fragment_header() -> &'static [u8] {
    static HEADER: OnceLock<Vec<u8>> = OnceLock::new();
    HEADER.get_or_init(|| {
        let mut out = Vec::with_capacity(2 * TS_PACKET_SIZE);

        // PAT
        let mut section = Vec::with_capacity(16);
        section.push(0x00); // table_id
        section.extend_from_slice(&[0xB0, 0x0D]); // syntax + section_length 13
        section.extend_from_slice(&[0x00, 0x01]); // transport_stream_id
        section.extend_from_slice(&[0xC1, 0x00, 0x00]); // version 0, current, sections
        section.extend_from_slice(&[0x00, 0x01]); // program_number 1
        section.push(0xE0 | (PID_PMT >> 8) as u8);
        section.push((PID_PMT & 0xFF) as u8);
        let crc = crc32_mpeg2(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        push_psi_packet(&mut out, PID_PAT, &section);

        // PMT
        let mut section = Vec::with_capacity(32);
        section.push(0x02); // table_id
        section.extend_from_slice(&[0xB0, 0x17]); // syntax + section_length 23
        section.extend_from_slice(&[0x00, 0x01]); // program_number
        section.extend_from_slice(&[0xC1, 0x00, 0x00]);
        section.push(0xE0 | (PID_VIDEO >> 8) as u8); // PCR PID rides video
        section.push((PID_VIDEO & 0xFF) as u8);
        section.extend_from_slice(&[0xF0, 0x00]); // program_info_length 0
        for (stream_type, pid) in [(STREAM_TYPE_AVC, PID_VIDEO), (STREAM_TYPE_AAC, PID_AUDIO)] {
            section.push(stream_type);
            section.push(0xE0 | (pid >> 8) as u8);
            section.push((pid & 0xFF) as u8);
            section.extend_from_slice(&[0xF0, 0x00]); // ES_info_length 0
        }
        let crc = crc32_mpeg2(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        push_psi_packet(&mut out, PID_PMT, &section);

        out
    })
}

fn push_psi_packet(out: &mut Vec<u8>, pid: u16, section: &[u8]) {
    let start = out.len();
    out.push(0x47);
    out.push(0x40 | (pid >> 8) as u8);
    out.push((pid & 0xFF) as u8);
    out.push(0x10); // payload only, cc 0
    out.push(0x00); // pointer_field
    out.extend_from_slice(section);
    out.resize(start + TS_PACKET_SIZE, 0xFF);
}

/// Wrap the frame in a PES header and split into 188-byte TS packets.
/// `with_pcr` puts a PCR (from the frame's DTS) into the first packet's
/// adaptation field.
pub fn pack_frame(frame: &mut Frame, with_pcr: bool) -> BytesMut {
    // Video carries PTS+DTS, audio PTS only.
    let with_dts = frame.sid == STREAM_ID_VIDEO;
    let header_data_len: usize = if with_dts { 10 } else { 5 };

    let mut pes = Vec::with_capacity(9 + header_data_len);
    pes.extend_from_slice(&[0x00, 0x00, 0x01, frame.sid]);
    let pes_len = 3 + header_data_len + frame.raw.len();
    let pes_len = if pes_len > 0xFFFF { 0 } else { pes_len };
    pes.extend_from_slice(&(pes_len as u16).to_be_bytes());
    pes.push(0x80); // marker
    pes.push(if with_dts { 0xC0 } else { 0x80 });
    pes.push(header_data_len as u8);
    put_pes_timestamp(&mut pes, if with_dts { 0x30 } else { 0x20 }, frame.pts);
    if with_dts {
        put_pes_timestamp(&mut pes, 0x10, frame.dts);
    }

    let total = pes.len() + frame.raw.len();
    let mut out = BytesMut::with_capacity((total / (TS_PACKET_SIZE - 4) + 2) * TS_PACKET_SIZE);

    let mut written = 0usize;
    while written < total {
        let remaining = total - written;
        let payload_start = written == 0;
        frame.cc = (frame.cc + 1) & 0x0F;

        out.put_u8(0x47);
        out.put_u8((frame.pid >> 8) as u8 & 0x1F | if payload_start { 0x40 } else { 0x00 });
        out.put_u8((frame.pid & 0xFF) as u8);

        let pcr_here = payload_start && with_pcr;
        // fixed adaptation cost when carrying a PCR: length + flags + 6 bytes
        let min_header = 4 + if pcr_here { 8 } else { 0 };
        let max_payload = TS_PACKET_SIZE - min_header;

        if pcr_here || remaining < max_payload {
            out.put_u8(0x30 | frame.cc); // adaptation + payload
            let payload_len = remaining.min(TS_PACKET_SIZE - min_header - if pcr_here { 0 } else { 1 });
            let af_len = TS_PACKET_SIZE - 4 - 1 - payload_len;
            out.put_u8(af_len as u8);
            if af_len > 0 {
                let mut flags = 0u8;
                if pcr_here {
                    flags |= 0x10;
                    if frame.key {
                        flags |= 0x40; // random access indicator
                    }
                }
                out.put_u8(flags);
                if pcr_here {
                    put_pcr(&mut out, frame.dts);
                }
                let used = 1 + if pcr_here { 6 } else { 0 };
                for _ in used..af_len {
                    out.put_u8(0xFF);
                }
            }
            copy_payload(&mut out, &pes, &frame.raw, written, payload_len);
            written += payload_len;
        } else {
            out.put_u8(0x10 | frame.cc);
            copy_payload(&mut out, &pes, &frame.raw, written, TS_PACKET_SIZE - 4);
            written += TS_PACKET_SIZE - 4;
        }
    }
    out
}

// Copy `len` bytes of the virtual pes||raw concatenation starting at `pos`.
fn copy_payload(out: &mut BytesMut, pes: &[u8], raw: &[u8], pos: usize, len: usize) {
    let mut pos = pos;
    let mut len = len;
    if pos < pes.len() {
        let n = len.min(pes.len() - pos);
        out.put_slice(&pes[pos..pos + n]);
        pos += n;
        len -= n;
    }
    if len > 0 {
        let off = pos - pes.len();
        out.put_slice(&raw[off..off + len]);
    }
}

fn put_pes_timestamp(buf: &mut Vec<u8>, four_bits: u8, ts: u64) {
    buf.push(four_bits | ((ts >> 29) as u8 & 0x0E) | 0x01);
    buf.push((ts >> 22) as u8);
    buf.push(((ts >> 14) as u8 & 0xFE) | 0x01);
    buf.push((ts >> 7) as u8);
    buf.push(((ts << 1) as u8 & 0xFE) | 0x01);
}

fn put_pcr(out: &mut BytesMut, base: u64) {
    out.put_u8((base >> 25) as u8);
    out.put_u8((base >> 17) as u8);
    out.put_u8((base >> 9) as u8);
    out.put_u8((base >> 1) as u8);
    out.put_u8(((base as u8 & 0x01) << 7) | 0x7E); // reserved, extension 0
    out.put_u8(0x00);
}

#[derive(Debug, Clone, Copy)]
pub struct TsPacketHeader {
    pub payload_unit_start: bool,
    pub pid: u16,
    pub adaptation_control: u8,
    pub cc: u8,
}

pub fn parse_ts_packet_header(pkt: &[u8]) -> TsPacketHeader {
    TsPacketHeader {
        payload_unit_start: pkt[1] & 0x40 != 0,
        pid: (u16::from(pkt[1]) & 0x1F) << 8 | u16::from(pkt[2]),
        adaptation_control: (pkt[3] >> 4) & 0x03,
        cc: pkt[3] & 0x0F,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Pat {
    pub program_number: u16,
    pub pmt_pid: u16,
}

/// Parse a PAT section (pointer field already skipped).
pub fn parse_pat(section: &[u8]) -> Pat {
    Pat {
        program_number: u16::from(section[8]) << 8 | u16::from(section[9]),
        pmt_pid: (u16::from(section[10]) & 0x1F) << 8 | u16::from(section[11]),
    }
}

#[derive(Debug, Clone)]
pub struct Pmt {
    pub pcr_pid: u16,
    pub elements: Vec<PmtElement>,
}

#[derive(Debug, Clone, Copy)]
pub struct PmtElement {
    pub stream_type: u8,
    pub pid: u16,
}

/// Parse a PMT section (pointer field already skipped).
pub fn parse_pmt(section: &[u8]) -> Pmt {
    let section_length = usize::from(u16::from(section[1]) & 0x0F) << 8 | usize::from(section[2]);
    let pcr_pid = (u16::from(section[8]) & 0x1F) << 8 | u16::from(section[9]);
    let program_info_length =
        usize::from(u16::from(section[10]) & 0x0F) << 8 | usize::from(section[11]);

    let mut elements = Vec::new();
    let mut i = 12 + program_info_length;
    let end = 3 + section_length - 4; // section body minus CRC
    while i + 5 <= end {
        let stream_type = section[i];
        let pid = (u16::from(section[i + 1]) & 0x1F) << 8 | u16::from(section[i + 2]);
        let es_info_length =
            usize::from(u16::from(section[i + 3]) & 0x0F) << 8 | usize::from(section[i + 4]);
        elements.push(PmtElement { stream_type, pid });
        i += 5 + es_info_length;
    }
    Pmt { pcr_pid, elements }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_header_is_two_packets_describing_both_streams() {
        let header = fixed_fragment_header();
        assert_eq!(header.len(), 2 * TS_PACKET_SIZE);

        let pat_header = parse_ts_packet_header(header);
        assert!(pat_header.payload_unit_start);
        assert_eq!(pat_header.pid, PID_PAT);

        let pat = parse_pat(&header[5..]);
        assert_eq!(pat.program_number, 1);
        assert_eq!(pat.pmt_pid, PID_PMT);

        let pmt_header = parse_ts_packet_header(&header[TS_PACKET_SIZE..]);
        assert_eq!(pmt_header.pid, PID_PMT);

        let pmt = parse_pmt(&header[TS_PACKET_SIZE + 5..]);
        assert_eq!(pmt.pcr_pid, PID_VIDEO);
        assert_eq!(pmt.elements.len(), 2);
        assert_eq!(pmt.elements[0].stream_type, STREAM_TYPE_AVC);
        assert_eq!(pmt.elements[0].pid, PID_VIDEO);
        assert_eq!(pmt.elements[1].stream_type, STREAM_TYPE_AAC);
        assert_eq!(pmt.elements[1].pid, PID_AUDIO);
    }

    #[test]
    fn packs_small_audio_frame_into_one_packet() {
        let mut frame = Frame {
            cc: 0,
            dts: 90_000,
            pts: 90_000,
            key: false,
            pid: PID_AUDIO,
            sid: STREAM_ID_AUDIO,
            raw: BytesMut::from(&[0xAAu8; 32][..]),
        };
        let packed = pack_frame(&mut frame, false);
        assert_eq!(packed.len(), TS_PACKET_SIZE);
        assert_eq!(frame.cc, 1);

        let h = parse_ts_packet_header(&packed);
        assert!(h.payload_unit_start);
        assert_eq!(h.pid, PID_AUDIO);
        assert_eq!(h.adaptation_control, 0x03); // stuffing present
        assert_eq!(h.cc, 1);

        // PES starts right after the adaptation field
        let af_len = usize::from(packed[4]);
        let pes = &packed[5 + af_len..];
        assert_eq!(&pes[..4], &[0x00, 0x00, 0x01, STREAM_ID_AUDIO]);
        // PTS-only header, 5 bytes of timestamp
        assert_eq!(pes[7], 0x80);
        assert_eq!(pes[8], 5);
        // 9 + 5 header + 32 payload fill the packet exactly
        assert_eq!(pes.len(), 14 + 32);
    }

    #[test]
    fn packs_large_video_frame_with_pcr_and_continuity() {
        let mut frame = Frame {
            cc: 15,
            dts: 180_000,
            pts: 183_600,
            key: true,
            pid: PID_VIDEO,
            sid: STREAM_ID_VIDEO,
            raw: BytesMut::from(&vec![0x42u8; 1000][..]),
        };
        let packed = pack_frame(&mut frame, true);
        assert_eq!(packed.len() % TS_PACKET_SIZE, 0);
        let n = packed.len() / TS_PACKET_SIZE;
        assert!(n >= 6);

        let mut prev_cc: Option<u8> = None;
        for i in 0..n {
            let h = parse_ts_packet_header(&packed[i * TS_PACKET_SIZE..]);
            assert_eq!(h.pid, PID_VIDEO);
            assert_eq!(h.payload_unit_start, i == 0);
            if let Some(prev) = prev_cc {
                assert_eq!(h.cc, (prev + 1) & 0x0F);
            } else {
                assert_eq!(h.cc, 0); // 15 wraps to 0
            }
            prev_cc = Some(h.cc);
        }
        assert_eq!(frame.cc, prev_cc.unwrap());

        // first packet carries PCR with the random-access flag
        assert_eq!(packed[3] >> 4, 0x03);
        let af_len = usize::from(packed[4]);
        assert_eq!(af_len, 7);
        assert_eq!(packed[5] & 0x10, 0x10);
        assert_eq!(packed[5] & 0x40, 0x40);
        // PES header advertises both PTS and DTS
        let pes = &packed[5 + af_len..];
        assert_eq!(pes[7], 0xC0);
        assert_eq!(pes[8], 10);
    }

    #[test]
    fn pes_timestamp_encoding_round_trips() {
        let mut buf = Vec::new();
        let ts: u64 = 0x1_2345_6789 & 0x1_FFFF_FFFF;
        put_pes_timestamp(&mut buf, 0x20, ts);
        let decoded = (u64::from(buf[0] & 0x0E) << 29)
            | (u64::from(buf[1]) << 22)
            | (u64::from(buf[2] & 0xFE) << 14)
            | (u64::from(buf[3]) << 7)
            | (u64::from(buf[4]) >> 1);
        assert_eq!(decoded, ts);
    }
}
