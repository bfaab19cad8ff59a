//! Miscellaneous system calls: halt and readfile.

use alloc::vec;

use crate::arch;
use crate::errors::KernError;
use crate::syscall::helper;
use crate::vm::usermem;

/// Cease execution of the operating system.
pub fn sys_halt() {
    crate::println!("System halted.");
    arch::disable_interrupts();
    #[cfg(not(test))]
    loop {
        arch::halt();
    }
}

/// Copy bytes out of a RAM-disk file.
/// Packet: `{filename*, buf*, count, offset}`. Returns bytes copied.
pub fn sys_readfile(packet: u32) -> i32 {
    let proc = match helper::current_process() {
        Some(p) => p,
        None => return KernError::NoProcess.code(),
    };

    let (name, buf, count, offset) = {
        let dir = proc.pagedir.lock();
        if !helper::check_array(&dir, packet, 4) {
            return KernError::InvalidArg.code();
        }
        let name_ptr = usermem::read_u32(&dir, packet);
        let buf = usermem::read_u32(&dir, packet + 4);
        let count = usermem::read_u32(&dir, packet + 8) as i32;
        let offset = usermem::read_u32(&dir, packet + 12) as i32;

        if !helper::check_string(&dir, name_ptr) {
            return KernError::InvalidArg.code();
        }
        if count < 0 || offset < 0 {
            return KernError::InvalidArg.code();
        }
        if !helper::check_buffer(&dir, buf, count as usize, true) {
            return KernError::InvalidArg.code();
        }
        (helper::read_string(&dir, name_ptr), buf, count, offset)
    };

    let mut staging = vec![0u8; count as usize];
    let copied = match crate::ramdisk::getbytes(&name, offset as usize, &mut staging) {
        Ok(n) => n,
        Err(e) => return e.code(),
    };

    let dir = proc.pagedir.lock();
    usermem::write_bytes(&dir, buf, &staging[..copied as usize]);
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil;
    use crate::vm::page::create_page;
    use crate::vm::{MemType, USER_MEM_START};

    #[test]
    fn test_readfile_copies_into_user_buffer() {
        let env = testutil::kernel_test_env();
        let (god, _me) = env.boot();
        testutil::install_test_programs();

        let page = USER_MEM_START + 0xa000;
        create_page(&mut god.pagedir.lock(), page, MemType::User, None).unwrap();

        {
            let dir = god.pagedir.lock();
            usermem::write_bytes(&dir, page + 0x100, b"hello\0");
            usermem::write_u32(&dir, page, page + 0x100); // name
            usermem::write_u32(&dir, page + 4, page + 0x200); // buf
            usermem::write_u32(&dir, page + 8, 4); // count
            usermem::write_u32(&dir, page + 12, 0); // offset
        }

        let n = sys_readfile(page);
        assert_eq!(n, 4);
        let dir = god.pagedir.lock();
        let mut got = [0u8; 4];
        usermem::read_bytes(&dir, page + 0x200, &mut got);
        // The first bytes of the image are the ELF magic.
        assert_eq!(&got, &crate::loader::ELF_MAGIC);
    }

    #[test]
    fn test_readfile_rejects_missing_file() {
        let env = testutil::kernel_test_env();
        let (god, _me) = env.boot();
        testutil::install_test_programs();

        let page = USER_MEM_START + 0xa000;
        create_page(&mut god.pagedir.lock(), page, MemType::User, None).unwrap();
        {
            let dir = god.pagedir.lock();
            usermem::write_bytes(&dir, page + 0x100, b"ghost\0");
            usermem::write_u32(&dir, page, page + 0x100);
            usermem::write_u32(&dir, page + 4, page + 0x200);
            usermem::write_u32(&dir, page + 8, 4);
            usermem::write_u32(&dir, page + 12, 0);
        }
        assert_eq!(sys_readfile(page), KernError::NoObjEntry.code());
    }
}
