//! Self-modifying code: overwrites a 5-byte `call` instruction in the live
//! text segment with the architectural NOP, under temporary page
//! protection relaxation. The only place in the crate that does address
//! arithmetic on executable pages or calls into `libc::mprotect`.

/// `0F 1F 44 00 00` -- the canonical 5-byte x86-64 NOP.
pub const NOP5: [u8; 5] = [0x0F, 0x1F, 0x44, 0x00, 0x00];

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("failed to flip page protection at {0:#x}: {1}")]
    ProtectionFlip(usize, std::io::Error),
}

/// Flips a single page between read-execute and read-write-execute.
/// Implemented for real against `libc::mprotect`; faked in tests so the
/// patcher's page-straddling and rollback logic can be exercised without
/// touching the test binary's own text segment.
pub trait PageProtector: Send + Sync {
    fn page_size(&self) -> usize;
    fn make_writable(&self, page_addr: usize) -> Result<(), std::io::Error>;
    fn make_executable(&self, page_addr: usize) -> Result<(), std::io::Error>;
}

#[cfg(target_arch = "x86_64")]
pub struct LibcPageProtector;

#[cfg(target_arch = "x86_64")]
impl PageProtector for LibcPageProtector {
    fn page_size(&self) -> usize {
        // SAFETY: sysconf with a well-known, always-valid name; cached by libc internally.
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    fn make_writable(&self, page_addr: usize) -> Result<(), std::io::Error> {
        self.mprotect(page_addr, libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC)
    }

    fn make_executable(&self, page_addr: usize) -> Result<(), std::io::Error> {
        self.mprotect(page_addr, libc::PROT_READ | libc::PROT_EXEC)
    }
}

#[cfg(target_arch = "x86_64")]
impl LibcPageProtector {
    fn mprotect(&self, page_addr: usize, prot: libc::c_int) -> Result<(), std::io::Error> {
        // SAFETY: `page_addr` is a page-aligned address within this
        // process's own mapped text segment, computed by `CodePatcher`
        // from a unwind-probe-derived call-site address. The deletion
        // coordinator guarantees no other thread is executing or
        // patching concurrently.
        let rc = unsafe { libc::mprotect(page_addr as *mut libc::c_void, self.page_size(), prot) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

/// Stand-in protector for non-x86-64 builds: the patcher is wired up with
/// this so the rest of the crate still links and runs, but every `patch`
/// call fails, which `engine::sweep` treats identically to any other
/// protection-flip failure -- the region just keeps running instrumented.
pub struct UnsupportedArchProtector;

impl PageProtector for UnsupportedArchProtector {
    fn page_size(&self) -> usize {
        4096
    }
    fn make_writable(&self, _page_addr: usize) -> Result<(), std::io::Error> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "dynamic filtering is only supported on x86-64",
        ))
    }
    fn make_executable(&self, _page_addr: usize) -> Result<(), std::io::Error> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "dynamic filtering is only supported on x86-64",
        ))
    }
}

pub struct CodePatcher {
    protector: Box<dyn PageProtector>,
}

impl CodePatcher {
    pub fn new(protector: Box<dyn PageProtector>) -> Self {
        Self { protector }
    }

    /// Overwrites the 5 bytes at `addr` with [`NOP5`].
    ///
    /// # Safety
    /// `addr` must point at a live, mapped, executable 5-byte `call`
    /// instruction in this process's own text segment, at a moment the
    /// deletion coordinator guarantees no other thread is concurrently
    /// executing through it or patching alongside it.
    pub unsafe fn patch(&self, addr: usize) -> Result<(), PatchError> {
        let page_size = self.protector.page_size();
        let first_page = addr & !(page_size - 1);
        let last_page = (addr + NOP5.len() - 1) & !(page_size - 1);

        let mut touched_pages = vec![first_page];
        if last_page != first_page {
            touched_pages.push(last_page);
        }

        let mut flipped = Vec::with_capacity(touched_pages.len());
        for &page in &touched_pages {
            match self.protector.make_writable(page) {
                Ok(()) => flipped.push(page),
                Err(e) => {
                    // Best-effort rollback of whatever we already flipped.
                    for &done in &flipped {
                        let _ = self.protector.make_executable(done);
                    }
                    return Err(PatchError::ProtectionFlip(page, e));
                }
            }
        }

        std::ptr::copy_nonoverlapping(NOP5.as_ptr(), addr as *mut u8, NOP5.len());

        for &page in &touched_pages {
            self.protector
                .make_executable(page)
                .map_err(|e| PatchError::ProtectionFlip(page, e))?;
        }

        Ok(())
    }
}
