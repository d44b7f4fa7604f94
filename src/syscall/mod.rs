//! INT 0x80 system calls.
//!
//! Number in EAX, arguments in EBX/ECX/EDX/ESI/EDI, result back in EAX
//! (negative errno on failure). Terminal output, keyboard input, and the
//! VFS are external collaborators reached through registered hooks.

pub mod usercopy;

use spin::Mutex;

pub const SYS_EXIT: u32 = 0;
pub const SYS_WRITE: u32 = 1;
pub const SYS_READ: u32 = 2;
pub const SYS_GETPID: u32 = 7;
pub const SYS_YIELD: u32 = 8;
pub const SYS_SLEEP: u32 = 9;
pub const SYS_GETTIME: u32 = 10;
pub const SYS_OPEN: u32 = 11;
pub const SYS_CLOSE: u32 = 12;
pub const SYS_SEEK: u32 = 13;

// Keyboard extensions, above the classical set.
pub const SYS_READKEY: u32 = 20;
pub const SYS_KEY_AVAILABLE: u32 = 21;
pub const SYS_GETC: u32 = 22;
pub const SYS_GETS: u32 = 23;
pub const SYS_KBHIT: u32 = 24;
pub const SYS_KBFLUSH: u32 = 25;

// VFS extensions.
pub const SYS_TELL: u32 = 26;
pub const SYS_MKDIR: u32 = 27;
pub const SYS_UNLINK: u32 = 28;
pub const SYS_GETCWD: u32 = 29;
pub const SYS_CHDIR: u32 = 30;

pub const SYS_UNAME: u32 = 47;

/// Fixed-size identification record returned by `SYS_UNAME`. Each field
/// is null-terminated.
#[repr(C)]
pub struct UtsName {
    pub sysname: [u8; 65],
    pub nodename: [u8; 65],
    pub release: [u8; 65],
    pub version: [u8; 65],
    pub machine: [u8; 65],
    pub domainname: [u8; 65],
}

impl UtsName {
    pub fn vesper() -> UtsName {
        fn field(s: &str) -> [u8; 65] {
            let mut out = [0u8; 65];
            let n = s.len().min(64);
            out[..n].copy_from_slice(&s.as_bytes()[..n]);
            out
        }
        UtsName {
            sysname: field("Vesper"),
            nodename: field("vesper"),
            release: field(env!("CARGO_PKG_VERSION")),
            version: field(env!("VESPER_BUILD_TIME")),
            machine: field("i686"),
            domainname: field("(none)"),
        }
    }
}

/// Errno values, classic numbering. Syscalls return `-(errno)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    EIO = 5,
    EBADF = 9,
    ENOMEM = 12,
    EACCES = 13,
    EFAULT = 14,
    ENOTDIR = 20,
    EINVAL = 22,
    ENOSYS = 38,
}

impl Errno {
    pub fn as_ret(self) -> i32 {
        -(self as i32)
    }
}

/// VFS delegate for fd >= 3 and path syscalls. Absent hooks make the
/// corresponding syscalls fail cleanly.
#[derive(Clone, Copy)]
pub struct VfsHooks {
    pub open: fn(path: &str, flags: u32) -> i32,
    pub close: fn(fd: i32) -> i32,
    pub seek: fn(fd: i32, offset: i32, whence: u32) -> i32,
    pub tell: fn(fd: i32) -> i32,
    pub read: fn(fd: i32, buf: &mut [u8]) -> i32,
    pub write: fn(fd: i32, buf: &[u8]) -> i32,
    pub mkdir: fn(path: &str) -> i32,
    pub unlink: fn(path: &str) -> i32,
    pub getcwd: fn(buf: &mut [u8]) -> i32,
    pub chdir: fn(path: &str) -> i32,
}

static CONSOLE_SINK: Mutex<Option<fn(&[u8])>> = Mutex::new(None);
static KEYBOARD_SOURCE: Mutex<Option<fn() -> Option<u8>>> = Mutex::new(None);
static VFS_HOOKS: Mutex<Option<VfsHooks>> = Mutex::new(None);

pub fn register_console_sink(sink: fn(&[u8])) {
    *CONSOLE_SINK.lock() = Some(sink);
}

pub fn register_keyboard_source(source: fn() -> Option<u8>) {
    *KEYBOARD_SOURCE.lock() = Some(source);
}

pub fn register_vfs(hooks: VfsHooks) {
    *VFS_HOOKS.lock() = Some(hooks);
}

pub fn init() {
    log_info!("[SYSCALL] INT 0x80 surface ready");
}

#[cfg(target_arch = "x86")]
mod dispatch {
    use super::*;
    use crate::interrupts::Registers;
    use crate::memory::layout::VirtAddr;
    use crate::memory::paging::{self, KernelEnv, PageFlags};
    use crate::syscall::usercopy::{
        copy_from_user, copy_string_from_user, copy_to_user, UserPages,
    };

    /// The calling task's page tables: whatever CR3 points at now.
    struct CurrentPages {
        pd_phys: u32,
    }

    impl CurrentPages {
        fn new() -> CurrentPages {
            CurrentPages { pd_phys: crate::arch::x86::read_cr3() }
        }
    }

    impl UserPages for CurrentPages {
        fn flags_of(&mut self, virt: VirtAddr) -> Option<PageFlags> {
            let mut env = KernelEnv;
            paging::entry_flags(&mut env, self.pd_phys, virt)
        }
    }

    /// Entry from the interrupt dispatcher for vector 0x80.
    pub fn handle(regs: &mut Registers) {
        if !regs.from_user() {
            regs.eax = Errno::EPERM.as_ret() as u32;
            return;
        }
        let ret = dispatch(regs);
        regs.eax = ret as u32;
    }

    fn dispatch(regs: &mut Registers) -> i32 {
        let (a1, a2, a3) = (regs.ebx, regs.ecx, regs.edx);
        match regs.eax {
            SYS_EXIT => crate::sched::exit_current(a1 as i32),
            SYS_WRITE => sys_write(a1 as i32, a2, a3),
            SYS_READ => sys_read(a1 as i32, a2, a3),
            SYS_GETPID => crate::sched::current_pid() as i32,
            SYS_YIELD => {
                crate::sched::yield_now();
                0
            }
            SYS_SLEEP => {
                crate::sched::sleep_ms(a1);
                0
            }
            SYS_GETTIME => crate::time::uptime_ms() as i32,
            SYS_OPEN => sys_open(a1, a2),
            SYS_CLOSE => match *VFS_HOOKS.lock() {
                Some(v) => (v.close)(a1 as i32),
                None => Errno::ENOSYS.as_ret(),
            },
            SYS_SEEK => match *VFS_HOOKS.lock() {
                Some(v) => (v.seek)(a1 as i32, a2 as i32, a3),
                None => Errno::ENOSYS.as_ret(),
            },
            SYS_TELL => match *VFS_HOOKS.lock() {
                Some(v) => (v.tell)(a1 as i32),
                None => Errno::ENOSYS.as_ret(),
            },
            SYS_MKDIR => sys_path_op(a1, |v, p| (v.mkdir)(p)),
            SYS_UNLINK => sys_path_op(a1, |v, p| (v.unlink)(p)),
            SYS_CHDIR => sys_path_op(a1, |v, p| (v.chdir)(p)),
            SYS_GETCWD => sys_getcwd(a1, a2),
            SYS_READKEY | SYS_GETC => sys_getc(regs.eax == SYS_GETC),
            SYS_KEY_AVAILABLE | SYS_KBHIT => match poll_key() {
                Some(b) => {
                    push_back_key(b);
                    1
                }
                None => 0,
            },
            SYS_GETS => sys_gets(a1, a2),
            SYS_KBFLUSH => {
                while poll_key().is_some() {}
                0
            }
            SYS_UNAME => sys_uname(a1),
            _ => Errno::ENOSYS.as_ret(),
        }
    }

    // One pushed-back byte so the availability probes do not consume input.
    static PUSHED_KEY: Mutex<Option<u8>> = Mutex::new(None);

    fn poll_key() -> Option<u8> {
        if let Some(b) = PUSHED_KEY.lock().take() {
            return Some(b);
        }
        let source = (*KEYBOARD_SOURCE.lock())?;
        source()
    }

    fn push_back_key(b: u8) {
        *PUSHED_KEY.lock() = Some(b);
    }

    /// READKEY returns immediately (-1 when idle); GETC blocks cooperatively.
    fn sys_getc(blocking: bool) -> i32 {
        loop {
            match poll_key() {
                Some(b) => return i32::from(b),
                None if blocking => crate::sched::yield_now(),
                None => return -1,
            }
        }
    }

    /// Line input with echo left to the collaborator; stops at newline or
    /// when the user buffer fills.
    fn sys_gets(buf: u32, len: u32) -> i32 {
        if len == 0 {
            return 0;
        }
        let mut pages = CurrentPages::new();
        let mut line = [0u8; 256];
        let want = (len as usize - 1).min(line.len());
        let mut n = 0usize;
        while n < want {
            match poll_key() {
                Some(b'\n') => break,
                Some(b) => {
                    line[n] = b;
                    n += 1;
                }
                None => crate::sched::yield_now(),
            }
        }
        line[n] = 0;
        if let Err(e) = copy_to_user(&mut pages, buf, &line[..n + 1]) {
            return e.as_ret();
        }
        n as i32
    }

    fn sys_path_op(path_ptr: u32, op: impl Fn(&VfsHooks, &str) -> i32) -> i32 {
        let hooks = match *VFS_HOOKS.lock() {
            Some(v) => v,
            None => return Errno::ENOSYS.as_ret(),
        };
        let mut pages = CurrentPages::new();
        let mut raw = [0u8; 128];
        let n = match copy_string_from_user(&mut pages, path_ptr, &mut raw) {
            Ok(n) => n,
            Err(e) => return e.as_ret(),
        };
        match core::str::from_utf8(&raw[..n]) {
            Ok(path) => op(&hooks, path),
            Err(_) => Errno::EINVAL.as_ret(),
        }
    }

    fn sys_getcwd(buf: u32, len: u32) -> i32 {
        let hooks = match *VFS_HOOKS.lock() {
            Some(v) => v,
            None => return Errno::ENOSYS.as_ret(),
        };
        let mut pages = CurrentPages::new();
        let mut tmp = [0u8; 256];
        let want = (len as usize).min(tmp.len());
        let n = (hooks.getcwd)(&mut tmp[..want]);
        if n <= 0 {
            return n;
        }
        if let Err(e) = copy_to_user(&mut pages, buf, &tmp[..n as usize]) {
            return e.as_ret();
        }
        n
    }

    fn sys_uname(out_ptr: u32) -> i32 {
        let uts = UtsName::vesper();
        let bytes = unsafe {
            core::slice::from_raw_parts(
                (&uts as *const UtsName).cast::<u8>(),
                core::mem::size_of::<UtsName>(),
            )
        };
        let mut pages = CurrentPages::new();
        match copy_to_user(&mut pages, out_ptr, bytes) {
            Ok(()) => 0,
            Err(e) => e.as_ret(),
        }
    }

    fn sys_write(fd: i32, buf: u32, len: u32) -> i32 {
        if len == 0 {
            return 0;
        }
        let mut pages = CurrentPages::new();
        let mut written = 0u32;
        let mut chunk = [0u8; 256];
        while written < len {
            let take = ((len - written) as usize).min(chunk.len());
            if let Err(e) = copy_from_user(&mut pages, buf + written, &mut chunk[..take]) {
                return e.as_ret();
            }
            match fd {
                1 | 2 => match *CONSOLE_SINK.lock() {
                    Some(sink) => sink(&chunk[..take]),
                    None => return Errno::EIO.as_ret(),
                },
                fd if fd >= 3 => match *VFS_HOOKS.lock() {
                    Some(v) => {
                        let n = (v.write)(fd, &chunk[..take]);
                        if n < 0 {
                            return n;
                        }
                    }
                    None => return Errno::EBADF.as_ret(),
                },
                _ => return Errno::EBADF.as_ret(),
            }
            written += take as u32;
        }
        written as i32
    }

    fn sys_read(fd: i32, buf: u32, len: u32) -> i32 {
        if len == 0 {
            return 0;
        }
        let mut pages = CurrentPages::new();
        match fd {
            0 => {
                let source = match *KEYBOARD_SOURCE.lock() {
                    Some(s) => s,
                    None => return Errno::EIO.as_ret(),
                };
                let mut got = [0u8; 256];
                let want = (len as usize).min(got.len());
                let mut n = 0usize;
                // Block cooperatively for the first byte, then drain what
                // is immediately available.
                while n == 0 {
                    while n < want {
                        match source() {
                            Some(b) => {
                                got[n] = b;
                                n += 1;
                                if b == b'\n' {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    if n == 0 {
                        crate::sched::yield_now();
                    }
                }
                if let Err(e) = copy_to_user(&mut pages, buf, &got[..n]) {
                    return e.as_ret();
                }
                n as i32
            }
            fd if fd >= 3 => match *VFS_HOOKS.lock() {
                Some(v) => {
                    let mut tmp = [0u8; 256];
                    let want = (len as usize).min(tmp.len());
                    let n = (v.read)(fd, &mut tmp[..want]);
                    if n <= 0 {
                        return n;
                    }
                    if let Err(e) = copy_to_user(&mut pages, buf, &tmp[..n as usize]) {
                        return e.as_ret();
                    }
                    n
                }
                None => Errno::EBADF.as_ret(),
            },
            _ => Errno::EBADF.as_ret(),
        }
    }

    fn sys_open(path_ptr: u32, flags: u32) -> i32 {
        let hooks = match *VFS_HOOKS.lock() {
            Some(v) => v,
            None => return Errno::ENOSYS.as_ret(),
        };
        let mut pages = CurrentPages::new();
        let mut raw = [0u8; 128];
        let n = match copy_string_from_user(&mut pages, path_ptr, &mut raw) {
            Ok(n) => n,
            Err(e) => return e.as_ret(),
        };
        match core::str::from_utf8(&raw[..n]) {
            Ok(path) => (hooks.open)(path, flags),
            Err(_) => Errno::EINVAL.as_ret(),
        }
    }
}

#[cfg(target_arch = "x86")]
pub use dispatch::handle;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_returns_are_negative() {
        assert_eq!(Errno::EFAULT.as_ret(), -14);
        assert_eq!(Errno::ENOSYS.as_ret(), -38);
        assert_eq!(Errno::EBADF.as_ret(), -9);
    }

    #[test]
    fn uname_fields_are_null_terminated() {
        let uts = UtsName::vesper();
        for field in [&uts.sysname, &uts.nodename, &uts.release, &uts.machine] {
            assert_eq!(field[64], 0);
            assert!(field.contains(&0));
        }
        assert!(uts.sysname.starts_with(b"Vesper"));
    }

    #[test]
    fn extension_numbers_stay_clear_of_the_classical_set() {
        for n in [
            SYS_READKEY,
            SYS_KEY_AVAILABLE,
            SYS_GETC,
            SYS_GETS,
            SYS_KBHIT,
            SYS_KBFLUSH,
            SYS_TELL,
            SYS_MKDIR,
            SYS_UNLINK,
            SYS_GETCWD,
            SYS_CHDIR,
            SYS_UNAME,
        ] {
            assert!(n > SYS_SEEK);
        }
    }
}
