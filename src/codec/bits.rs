use crate::error::{Result, RillError};

/// MSB-first bit reader over a byte slice, with the exp-Golomb reads the
/// H.264/H.265 parameter-set parsers need.
pub struct BitReader<'a> {
    buf: &'a [u8],
    pos: usize, // absolute bit position
}

impl<'a> BitReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn exhausted(&self) -> RillError {
        RillError::InvalidCodecData("bitstream exhausted".into())
    }

    pub fn read_bit(&mut self) -> Result<u8> {
        let byte = self.pos / 8;
        if byte >= self.buf.len() {
            return Err(self.exhausted());
        }
        let bit = (self.buf[byte] >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Ok(bit)
    }

    pub fn read_bits(&mut self, n: u32) -> Result<u32> {
        debug_assert!(n <= 32);
        let mut v: u32 = 0;
        for _ in 0..n {
            v = (v << 1) | u32::from(self.read_bit()?);
        }
        Ok(v)
    }

    pub fn read_bits64(&mut self, n: u32) -> Result<u64> {
        debug_assert!(n <= 64);
        let mut v: u64 = 0;
        for _ in 0..n {
            v = (v << 1) | u64::from(self.read_bit()?);
        }
        Ok(v)
    }

    pub fn skip_bits(&mut self, n: u32) -> Result<()> {
        let end = self.pos + n as usize;
        if end > self.buf.len() * 8 {
            return Err(self.exhausted());
        }
        self.pos = end;
        Ok(())
    }

    /// ue(v): unsigned exp-Golomb.
    pub fn read_ue(&mut self) -> Result<u32> {
        let mut leading_zeros = 0u32;
        while self.read_bit()? == 0 {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(RillError::InvalidCodecData("exp-golomb too long".into()));
            }
        }
        if leading_zeros == 0 {
            return Ok(0);
        }
        let rest = self.read_bits(leading_zeros)?;
        Ok((1u32 << leading_zeros) - 1 + rest)
    }

    /// se(v): signed exp-Golomb.
    pub fn read_se(&mut self) -> Result<i32> {
        let ue = self.read_ue()?;
        let k = (ue as i64 + 1) / 2;
        Ok(if ue % 2 == 1 { k as i32 } else { -(k as i32) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_bits_msb_first() {
        let mut br = BitReader::new(&[0b1010_1100, 0xff]);
        assert_eq!(br.read_bits(3).unwrap(), 0b101);
        assert_eq!(br.read_bits(5).unwrap(), 0b01100);
        assert_eq!(br.read_bits(8).unwrap(), 0xff);
        assert!(br.read_bit().is_err());
    }

    #[test]
    fn reads_exp_golomb() {
        // 1 -> 0; 010 -> 1; 011 -> 2; 00100 -> 3
        let mut br = BitReader::new(&[0b1_010_011_0, 0b0100_0000]);
        assert_eq!(br.read_ue().unwrap(), 0);
        assert_eq!(br.read_ue().unwrap(), 1);
        assert_eq!(br.read_ue().unwrap(), 2);
        assert_eq!(br.read_ue().unwrap(), 3);
    }

    #[test]
    fn reads_signed_exp_golomb() {
        // ue=1 -> +1, ue=2 -> -1
        let mut br = BitReader::new(&[0b010_011_00]);
        assert_eq!(br.read_se().unwrap(), 1);
        assert_eq!(br.read_se().unwrap(), -1);
    }
}
