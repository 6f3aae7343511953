use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::mpegts;

/// One open .ts file. Every fragment begins with the fixed PAT+PMT pair.
pub struct Fragment {
    writer: BufWriter<File>,
}

impl Fragment {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(mpegts::fixed_fragment_header())?;
        Ok(Self { writer })
    }

    pub fn write_packets(&mut self, packets: &[u8]) -> io::Result<()> {
        self.writer.write_all(packets)
    }

    pub fn close(mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_starts_with_pat_pmt() {
        let dir = std::env::temp_dir().join("rill-fragment-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("t.ts");

        let mut frag = Fragment::open(&path).unwrap();
        frag.write_packets(&[0x47u8; 188]).unwrap();
        frag.close().unwrap();

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 3 * mpegts::TS_PACKET_SIZE);
        assert_eq!(&content[..2 * 188], mpegts::fixed_fragment_header());

        std::fs::remove_dir_all(&dir).ok();
    }
}
