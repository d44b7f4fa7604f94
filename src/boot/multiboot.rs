//! Multiboot2 information block parsing.
//!
//! Tag walk over the byte blob the bootloader leaves in memory. Pure slice
//! parsing so the logic is exercised on the host with synthetic blobs.

/// Magic the bootloader passes in EAX.
pub const MULTIBOOT2_MAGIC: u32 = 0x36d76289;

const TAG_END: u32 = 0;
const TAG_CMDLINE: u32 = 1;
const TAG_MODULE: u32 = 3;
const TAG_MMAP: u32 = 6;
const TAG_FRAMEBUFFER: u32 = 8;

/// Usable RAM in the memory map.
pub const MMAP_AVAILABLE: u32 = 1;

/// One memory-map entry: {base, length, type}.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemMapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: u32,
}

impl MemMapEntry {
    pub fn is_available(&self) -> bool {
        self.kind == MMAP_AVAILABLE
    }
}

/// Framebuffer descriptor from the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferInfo {
    pub addr: u64,
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u8,
}

/// A boot module: [start, end) physical range plus its command line.
#[derive(Debug, Clone)]
pub struct Module {
    pub start: u32,
    pub end: u32,
    pub cmdline: heapless::String<64>,
}

/// Everything the core consumes from the boot blob.
///
/// Parsed before the heap exists, so storage is fixed-capacity.
#[derive(Debug, Clone, Default)]
pub struct BootInfo {
    pub mmap: heapless::Vec<MemMapEntry, 32>,
    pub framebuffer: Option<FramebufferInfo>,
    pub cmdline: heapless::String<128>,
    pub modules: heapless::Vec<Module, 8>,
}

impl BootInfo {
    /// Total bytes of available RAM in the map.
    pub fn available_bytes(&self) -> u64 {
        self.mmap.iter().filter(|e| e.is_available()).map(|e| e.length).sum()
    }
}

fn read_u32(blob: &[u8], off: usize) -> Result<u32, &'static str> {
    let b = blob.get(off..off + 4).ok_or("truncated boot info")?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(blob: &[u8], off: usize) -> Result<u64, &'static str> {
    let b = blob.get(off..off + 8).ok_or("truncated boot info")?;
    Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
}

fn read_cstr(blob: &[u8], off: usize, end: usize) -> &str {
    let raw = &blob[off..end.min(blob.len())];
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    core::str::from_utf8(&raw[..len]).unwrap_or("")
}

/// Walk the tag list of a multiboot2 information block.
pub fn parse_bytes(blob: &[u8]) -> Result<BootInfo, &'static str> {
    let total_size = read_u32(blob, 0)? as usize;
    if total_size > blob.len() || total_size < 8 {
        return Err("bad boot info size");
    }

    let mut info = BootInfo::default();
    let mut off = 8; // skip total_size + reserved

    while off + 8 <= total_size {
        let tag_type = read_u32(blob, off)?;
        let tag_size = read_u32(blob, off + 4)? as usize;
        if tag_size < 8 || off + tag_size > total_size {
            return Err("bad tag size");
        }

        match tag_type {
            TAG_END => break,
            TAG_CMDLINE => {
                let s = read_cstr(blob, off + 8, off + tag_size);
                let _ = info.cmdline.push_str(s);
            }
            TAG_MODULE => {
                let start = read_u32(blob, off + 8)?;
                let end = read_u32(blob, off + 12)?;
                let mut cmdline = heapless::String::new();
                let _ = cmdline.push_str(read_cstr(blob, off + 16, off + tag_size));
                let _ = info.modules.push(Module { start, end, cmdline });
            }
            TAG_MMAP => {
                let entry_size = read_u32(blob, off + 8)? as usize;
                if entry_size < 24 {
                    return Err("bad mmap entry size");
                }
                let mut pos = off + 16;
                while pos + entry_size <= off + tag_size {
                    let entry = MemMapEntry {
                        base: read_u64(blob, pos)?,
                        length: read_u64(blob, pos + 8)?,
                        kind: read_u32(blob, pos + 16)?,
                    };
                    let _ = info.mmap.push(entry);
                    pos += entry_size;
                }
            }
            TAG_FRAMEBUFFER => {
                info.framebuffer = Some(FramebufferInfo {
                    addr: read_u64(blob, off + 8)?,
                    pitch: read_u32(blob, off + 16)?,
                    width: read_u32(blob, off + 20)?,
                    height: read_u32(blob, off + 24)?,
                    bpp: *blob.get(off + 28).ok_or("truncated boot info")?,
                });
            }
            _ => {}
        }

        // Tags are padded to 8-byte boundaries.
        off += (tag_size + 7) & !7;
    }

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_u32(v: &mut Vec<u8>, x: u32) {
        v.extend_from_slice(&x.to_le_bytes());
    }
    fn push_u64(v: &mut Vec<u8>, x: u64) {
        v.extend_from_slice(&x.to_le_bytes());
    }

    fn build_blob() -> Vec<u8> {
        let mut b = Vec::new();
        push_u32(&mut b, 0); // total_size patched below
        push_u32(&mut b, 0); // reserved

        // cmdline tag
        let cmd = b"console=fb quiet\0";
        push_u32(&mut b, TAG_CMDLINE);
        push_u32(&mut b, 8 + cmd.len() as u32);
        b.extend_from_slice(cmd);
        while b.len() % 8 != 0 {
            b.push(0);
        }

        // mmap tag with two entries (available + reserved)
        push_u32(&mut b, TAG_MMAP);
        push_u32(&mut b, 16 + 2 * 24);
        push_u32(&mut b, 24); // entry_size
        push_u32(&mut b, 0); // entry_version
        push_u64(&mut b, 0x0010_0000);
        push_u64(&mut b, 0x0700_0000);
        push_u32(&mut b, MMAP_AVAILABLE);
        push_u32(&mut b, 0);
        push_u64(&mut b, 0x000F_0000);
        push_u64(&mut b, 0x0001_0000);
        push_u32(&mut b, 2);
        push_u32(&mut b, 0);

        // framebuffer tag: type, size, addr, pitch, width, height, bpp,
        // fb_type, u16 reserved = 32 bytes, already 8-aligned.
        push_u32(&mut b, TAG_FRAMEBUFFER);
        push_u32(&mut b, 32);
        push_u64(&mut b, 0xFD00_0000);
        push_u32(&mut b, 1024 * 4);
        push_u32(&mut b, 1024);
        push_u32(&mut b, 768);
        b.push(32); // bpp
        b.push(1); // fb type
        b.push(0);
        b.push(0);

        // end tag
        push_u32(&mut b, TAG_END);
        push_u32(&mut b, 8);

        let total = b.len() as u32;
        b[0..4].copy_from_slice(&total.to_le_bytes());
        b
    }

    #[test]
    fn parses_mmap_cmdline_and_framebuffer() {
        let blob = build_blob();
        let info = parse_bytes(&blob).unwrap();

        assert_eq!(info.cmdline.as_str(), "console=fb quiet");
        assert_eq!(info.mmap.len(), 2);
        assert_eq!(info.mmap[0].base, 0x10_0000);
        assert!(info.mmap[0].is_available());
        assert!(!info.mmap[1].is_available());
        assert_eq!(info.available_bytes(), 0x0700_0000);

        let fb = info.framebuffer.unwrap();
        assert_eq!(fb.addr, 0xFD00_0000);
        assert_eq!(fb.width, 1024);
        assert_eq!(fb.bpp, 32);
    }

    #[test]
    fn rejects_truncated_blob() {
        let mut blob = build_blob();
        blob.truncate(16);
        assert!(parse_bytes(&blob).is_err());
    }

    #[test]
    fn stops_at_end_tag() {
        let mut b = Vec::new();
        push_u32(&mut b, 16);
        push_u32(&mut b, 0);
        push_u32(&mut b, TAG_END);
        push_u32(&mut b, 8);
        let info = parse_bytes(&b).unwrap();
        assert!(info.mmap.is_empty());
        assert!(info.framebuffer.is_none());
    }
}
