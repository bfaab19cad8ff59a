//! Embedded RAM disk
//!
//! User programs are statically linked into the kernel binary as an
//! array of `{name, bytes}` entries. exec and readfile look programs up
//! by exact name; there is no other filesystem.

use spin::Mutex;

use crate::errors::{KernError, KernResult};

/// One program image in the table of contents.
#[derive(Debug, Clone, Copy)]
pub struct Entry {
    /// Exact name exec is invoked with.
    pub name: &'static str,
    /// The raw executable image.
    pub bytes: &'static [u8],
}

static TOC: Mutex<Option<&'static [Entry]>> = Mutex::new(None);

/// Install the table of contents. Called once at boot with the images
/// the build embedded; later calls are ignored.
pub fn install(entries: &'static [Entry]) {
    let mut toc = TOC.lock();
    if toc.is_none() {
        *toc = Some(entries);
    }
}

/// Replace the table for a test run.
#[cfg(test)]
pub fn install_for_tests(entries: &'static [Entry]) {
    *TOC.lock() = Some(entries);
}

/// Find a program by exact name.
pub fn entry(name: &str) -> Option<&'static Entry> {
    (*TOC.lock())?.iter().find(|e| e.name == name)
}

/// Copy up to `buf.len()` bytes of `name` starting at `offset`.
/// Returns the number of bytes copied, which is short at end of file.
pub fn getbytes(name: &str, offset: usize, buf: &mut [u8]) -> KernResult<i32> {
    let entry = entry(name).ok_or(KernError::NoObjEntry)?;
    if offset >= entry.bytes.len() {
        return Err(KernError::InvalidOffset);
    }

    let avail = entry.bytes.len() - offset;
    let n = buf.len().min(avail);
    buf[..n].copy_from_slice(&entry.bytes[offset..offset + n]);
    Ok(n as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil;

    static IMAGES: &[Entry] = &[
        Entry {
            name: "idle",
            bytes: b"idle-image",
        },
        Entry {
            name: "init",
            bytes: b"init-image",
        },
    ];

    #[test]
    fn test_exact_name_lookup() {
        let _env = testutil::kernel_test_env();
        install_for_tests(IMAGES);
        assert!(entry("idle").is_some());
        assert!(entry("idl").is_none());
        assert!(entry("idle2").is_none());
    }

    #[test]
    fn test_getbytes_bounds() {
        let _env = testutil::kernel_test_env();
        install_for_tests(IMAGES);
        let mut buf = [0u8; 4];
        assert_eq!(getbytes("idle", 0, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"idle");

        // Short read at end of file.
        let mut buf = [0u8; 16];
        assert_eq!(getbytes("idle", 5, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"image");

        assert_eq!(
            getbytes("idle", 100, &mut buf).unwrap_err(),
            KernError::InvalidOffset
        );
        assert_eq!(
            getbytes("nope", 0, &mut buf).unwrap_err(),
            KernError::NoObjEntry
        );
    }
}
