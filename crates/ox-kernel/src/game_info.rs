//! GameInfo.bin, shipped at the root of XNA titles
//!
//! The file is a sequence of `{magic: u32 BE, size: u32 BE, payload}`
//! blocks. Only `EXEC` is interpreted: it carries the virtual title id and
//! the module name, each as a `u16 BE` length followed by the bytes.

use tracing::debug;

/// Folder XNA titles keep their real executable under
pub const XNA_TITLE_FOLDER: &str = "584E07D1";

const BLOCK_EXEC: u32 = u32::from_be_bytes(*b"EXEC");
const BLOCK_COMM: u32 = u32::from_be_bytes(*b"COMM");
const BLOCK_TITL: u32 = u32::from_be_bytes(*b"TITL");

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GameInfo {
    virtual_title_id: String,
    module_name: String,
    has_exec: bool,
    has_comm: bool,
    has_title: bool,
}

impl GameInfo {
    pub fn parse(data: &[u8]) -> Self {
        let mut info = Self::default();
        let mut offset = 0usize;

        while offset + 8 <= data.len() {
            let magic = u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]]);
            let size = u32::from_be_bytes([
                data[offset + 4],
                data[offset + 5],
                data[offset + 6],
                data[offset + 7],
            ]) as usize;
            let start = offset + 8;
            let Some(payload) = data.get(start..start.saturating_add(size)) else {
                debug!("GameInfo block {:08X} overruns file", magic);
                break;
            };

            match magic {
                BLOCK_EXEC => {
                    if let Some((title, module)) = Self::parse_exec(payload) {
                        info.virtual_title_id = title;
                        info.module_name = module;
                        info.has_exec = true;
                    }
                }
                BLOCK_COMM => info.has_comm = true,
                BLOCK_TITL => info.has_title = true,
                _ => {}
            }
            offset = start + size;
        }
        info
    }

    fn parse_exec(payload: &[u8]) -> Option<(String, String)> {
        let mut offset = 0;
        let mut next_string = || -> Option<String> {
            let len = u16::from_be_bytes([*payload.get(offset)?, *payload.get(offset + 1)?]) as usize;
            let bytes = payload.get(offset + 2..offset + 2 + len)?;
            offset += 2 + len;
            Some(
                String::from_utf8_lossy(bytes)
                    .trim_end_matches('\0')
                    .to_string(),
            )
        };
        let title = next_string()?;
        let module = next_string()?;
        Some((title, module))
    }

    /// All three required blocks are present
    pub fn is_valid(&self) -> bool {
        self.has_exec && self.has_comm && self.has_title
    }

    pub fn virtual_title_id(&self) -> &str {
        &self.virtual_title_id
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Serialize a minimal valid file
    pub fn build(virtual_title_id: &str, module_name: &str) -> Vec<u8> {
        let mut exec = Vec::new();
        for s in [virtual_title_id, module_name] {
            exec.extend_from_slice(&(s.len() as u16).to_be_bytes());
            exec.extend_from_slice(s.as_bytes());
        }
        let mut out = Vec::new();
        for (magic, payload) in [(b"EXEC", exec), (b"COMM", vec![0u8; 4]), (b"TITL", vec![0u8; 4])] {
            out.extend_from_slice(magic);
            out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            out.extend_from_slice(&payload);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let info = GameInfo::parse(&GameInfo::build("58410889", "game.exe"));
        assert!(info.is_valid());
        assert_eq!(info.virtual_title_id(), "58410889");
        assert_eq!(info.module_name(), "game.exe");
    }

    #[test]
    fn test_missing_block_is_invalid() {
        let mut data = GameInfo::build("58410889", "game.exe");
        // Drop the trailing TITL block
        data.truncate(data.len() - 12);
        assert!(!GameInfo::parse(&data).is_valid());
        assert!(!GameInfo::parse(&[]).is_valid());
    }
}
