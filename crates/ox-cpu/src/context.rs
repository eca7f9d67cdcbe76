//! Guest thread register state

use ox_core::error::SnapshotError;
use ox_core::{ByteReader, ByteWriter};

/// Register file of one guest hardware thread
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadContext {
    /// General purpose registers
    pub r: [u64; 32],
    /// Floating point registers
    pub f: [f64; 32],
    /// Vector registers (VMX128)
    pub v: [[u32; 4]; 128],
    /// Link register
    pub lr: u64,
    /// Count register
    pub ctr: u64,
    /// Condition register
    pub cr: u32,
    /// Fixed-point exception register
    pub xer: u64,
    /// Guest program counter
    pub pc: u32,
}

impl Default for ThreadContext {
    fn default() -> Self {
        Self {
            r: [0; 32],
            f: [0.0; 32],
            v: [[0; 4]; 128],
            lr: 0,
            ctr: 0,
            cr: 0,
            xer: 0,
            pc: 0,
        }
    }
}

impl ThreadContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Human readable register listing, one register per line
    pub fn dump_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(32 + 32 + 128);
        for (i, value) in self.r.iter().enumerate() {
            lines.push(format!(" r{:<3} = {:016X}", i, value));
        }
        for (i, value) in self.f.iter().enumerate() {
            lines.push(format!(
                " f{:<3} = {:016X} = (double){} = (float){}",
                i,
                value.to_bits(),
                value,
                *value as f32
            ));
        }
        for (i, v) in self.v.iter().enumerate() {
            lines.push(format!(
                " v{:<3} = [0x{:08X}, 0x{:08X}, 0x{:08X}, 0x{:08X}]",
                i, v[0], v[1], v[2], v[3]
            ));
        }
        lines
    }

    pub fn save(&self, stream: &mut ByteWriter) -> Result<(), SnapshotError> {
        for value in &self.r {
            stream.write_u64(*value)?;
        }
        for value in &self.f {
            stream.write_f64(*value)?;
        }
        for vector in &self.v {
            for lane in vector {
                stream.write_u32(*lane)?;
            }
        }
        stream.write_u64(self.lr)?;
        stream.write_u64(self.ctr)?;
        stream.write_u32(self.cr)?;
        stream.write_u64(self.xer)?;
        stream.write_u32(self.pc)
    }

    pub fn restore(stream: &mut ByteReader) -> Result<Self, SnapshotError> {
        let mut ctx = Self::default();
        for value in ctx.r.iter_mut() {
            *value = stream.read_u64()?;
        }
        for value in ctx.f.iter_mut() {
            *value = stream.read_f64()?;
        }
        for vector in ctx.v.iter_mut() {
            for lane in vector.iter_mut() {
                *lane = stream.read_u32()?;
            }
        }
        ctx.lr = stream.read_u64()?;
        ctx.ctr = stream.read_u64()?;
        ctx.cr = stream.read_u32()?;
        ctx.xer = stream.read_u64()?;
        ctx.pc = stream.read_u32()?;
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_covers_all_register_files() {
        let mut ctx = ThreadContext::new();
        ctx.r[3] = 0xDEAD;
        ctx.v[127] = [1, 2, 3, 4];
        let lines = ctx.dump_lines();
        assert_eq!(lines.len(), 192);
        assert_eq!(lines[3], " r3   = 000000000000DEAD");
        assert!(lines[191].starts_with(" v127 = [0x00000001"));
    }

    #[test]
    fn test_context_snapshot() {
        let mut ctx = ThreadContext::new();
        ctx.r[1] = 0x7000_FF00;
        ctx.f[2] = 2.5;
        ctx.pc = 0x8200_1234;
        ctx.lr = 0x8200_0040;

        let mut writer = ByteWriter::with_capacity_limit(1 << 16);
        ctx.save(&mut writer).unwrap();
        let data = writer.into_inner();
        let restored = ThreadContext::restore(&mut ByteReader::new(&data)).unwrap();
        assert_eq!(restored, ctx);
    }
}
