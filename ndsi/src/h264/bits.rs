use crate::error::DecodeError;

/// 去除防竞争字节（`00 00 03` -> `00 00`），得到RBSP
pub fn to_rbsp(ebsp: &[u8]) -> Vec<u8> {
    let mut rbsp = Vec::with_capacity(ebsp.len());
    let mut zeros = 0usize;

    for &byte in ebsp {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        rbsp.push(byte);
    }
    rbsp
}

/// 插入防竞争字节（RBSP -> EBSP）
pub fn to_ebsp(rbsp: &[u8]) -> Vec<u8> {
    let mut ebsp = Vec::with_capacity(rbsp.len() + rbsp.len() / 64);
    let mut zeros = 0usize;

    for &byte in rbsp {
        if zeros >= 2 && byte <= 0x03 {
            ebsp.push(0x03);
            zeros = 0;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        ebsp.push(byte);
    }
    ebsp
}

/// MSB优先的位读取器（Exp-Golomb）
pub struct BitReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
    what: &'static str,
}

impl<'a> BitReader<'a> {
    /// `what` 用于截断时的错误信息
    pub fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, bit_pos: 0, what }
    }

    pub fn bits_left(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.bit_pos)
    }

    pub fn read_bit(&mut self) -> Result<bool, DecodeError> {
        let byte = self
            .data
            .get(self.bit_pos / 8)
            .ok_or(DecodeError::Truncated(self.what))?;
        let bit = (byte >> (7 - self.bit_pos % 8)) & 1;
        self.bit_pos += 1;
        Ok(bit == 1)
    }

    pub fn read_bits(&mut self, n: u8) -> Result<u32, DecodeError> {
        debug_assert!(n <= 32);
        let mut value = 0u32;
        for _ in 0..n {
            value = (value << 1) | self.read_bit()? as u32;
        }
        Ok(value)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn skip_bits(&mut self, n: usize) -> Result<(), DecodeError> {
        if self.bits_left() < n {
            return Err(DecodeError::Truncated(self.what));
        }
        self.bit_pos += n;
        Ok(())
    }

    /// ue(v)
    pub fn read_ue(&mut self) -> Result<u32, DecodeError> {
        let mut leading_zeros = 0u8;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(DecodeError::InvalidField {
                    field: "exp-golomb prefix",
                    value: leading_zeros as u32,
                });
            }
        }
        if leading_zeros == 0 {
            return Ok(0);
        }
        let suffix = self.read_bits(leading_zeros)?;
        Ok(((1u64 << leading_zeros) - 1 + suffix as u64) as u32)
    }

    /// se(v)
    pub fn read_se(&mut self) -> Result<i32, DecodeError> {
        let code = self.read_ue()? as i64;
        let value = if code % 2 == 1 { (code + 1) / 2 } else { -(code / 2) };
        Ok(value as i32)
    }
}

/// MSB优先的位写入器（用于构造测试码流与合成SPS）
#[derive(Debug, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    current: u8,
    used: u8,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bit(&mut self, bit: bool) {
        self.current = (self.current << 1) | bit as u8;
        self.used += 1;
        if self.used == 8 {
            self.bytes.push(self.current);
            self.current = 0;
            self.used = 0;
        }
    }

    pub fn put_bits(&mut self, value: u32, n: u8) {
        for i in (0..n).rev() {
            self.put_bit((value >> i) & 1 == 1);
        }
    }

    pub fn put_ue(&mut self, value: u32) {
        let code = value as u64 + 1;
        let len = 64 - code.leading_zeros() as u8;
        for _ in 0..len - 1 {
            self.put_bit(false);
        }
        for i in (0..len).rev() {
            self.put_bit((code >> i) & 1 == 1);
        }
    }

    pub fn put_se(&mut self, value: i32) {
        let code = if value > 0 {
            (value as u32) * 2 - 1
        } else {
            value.unsigned_abs() * 2
        };
        self.put_ue(code);
    }

    /// rbsp_trailing_bits，返回RBSP
    pub fn finish(mut self) -> Vec<u8> {
        self.put_bit(true);
        while self.used != 0 {
            self.put_bit(false);
        }
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_ue_values() {
        // 1 | 010 | 011 | 00100 | 00111
        let data = [0b1010_0110, 0b0100_0011, 0b1000_0000];
        let mut reader = BitReader::new(&data, "test");
        assert_eq!(reader.read_ue().unwrap(), 0);
        assert_eq!(reader.read_ue().unwrap(), 1);
        assert_eq!(reader.read_ue().unwrap(), 2);
        assert_eq!(reader.read_ue().unwrap(), 3);
        assert_eq!(reader.read_ue().unwrap(), 6);
    }

    #[test]
    fn test_read_se() {
        let mut writer = BitWriter::new();
        for v in [0, 1, -1, 2, -2, 17, -40] {
            writer.put_se(v);
        }
        let data = writer.finish();
        let mut reader = BitReader::new(&data, "test");
        for v in [0, 1, -1, 2, -2, 17, -40] {
            assert_eq!(reader.read_se().unwrap(), v);
        }
    }

    #[test]
    fn test_truncated() {
        let data = [0x00];
        let mut reader = BitReader::new(&data, "slice header");
        assert_eq!(reader.read_ue(), Err(DecodeError::Truncated("slice header")));
    }

    #[test]
    fn test_emulation_prevention() {
        let rbsp = [0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x05];
        let ebsp = to_ebsp(&rbsp);
        assert_eq!(ebsp, vec![0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x00, 0x05]);
        assert_eq!(to_rbsp(&ebsp), rbsp.to_vec());
    }

    #[test]
    fn test_writer_trailing_bits() {
        let mut writer = BitWriter::new();
        writer.put_bits(0b101, 3);
        assert_eq!(writer.finish(), vec![0b1011_0000]);
    }
}
