//! Entry point for the sandboxed parser child.
//!
//! Spawned by `dtprobed::sandbox` via `std::process::Command` with its
//! stdin/stdout wired to anonymous pipes and every other fd closed. Applies
//! a seccomp filter (Firecracker-jailer style, via `seccompiler`) before
//! touching a single byte of caller-supplied DOF, then loops: read a
//! `dof_helper_t` and a length-prefixed DOF blob, parse it, and write the
//! resulting [`dof_wire::record::ParsedRecord`] stream (or a single `Err`
//! record) back out. Exits on EOF or any I/O error — `dtprobed::sandbox`
//! treats either as "the parser died" and restarts it once before giving up
//! on the in-flight registration.

use std::io::{self, Read, Write};

use dof_wire::record::{self, ParsedRecord};

const HELPER_SIZE: usize = 64;

fn main() {
    // Touch the arena now, while ordinary allocation (mmap/brk) is still
    // permitted, so every allocation from here on — including everything
    // inside the seccomp jail below — is served from already-resident
    // memory. See `arena` for why this has to happen before, not after,
    // `install_seccomp_filter`.
    arena::prefault();

    env_logger::init();

    if let Err(e) = install_seccomp_filter() {
        log::error!("failed to install seccomp filter: {e}");
        std::process::exit(1);
    }

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut input = stdin.lock();
    let mut output = stdout.lock();

    loop {
        match handle_one_request(&mut input, &mut output) {
            Ok(true) => continue,
            Ok(false) => break,
            Err(e) => {
                log::warn!("parser request failed: {e}");
                break;
            }
        }
    }
}

/// Handles one helper+DOF request. Returns `Ok(false)` on clean EOF (no
/// more requests), `Ok(true)` if a request (successful or not) was fully
/// handled and the loop should continue.
fn handle_one_request<R: Read, W: Write>(input: &mut R, output: &mut W) -> io::Result<bool> {
    let mut helper = [0u8; HELPER_SIZE];
    match input.read_exact(&mut helper) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(e),
    }

    let dof_frame = match record::read_frame(input)? {
        Some(buf) => buf,
        None => return Ok(false),
    };

    let helper_struct = dof_wire::layout::parse_helper(&helper);
    let load_addr = helper_struct.load_addr.get();
    let result = match helper_struct.module_str() {
        Ok(module) => {
            let module = module.to_string();
            let mut dof = dof_frame;
            dof_parser::parse_dof(&mut dof, load_addr, &module, dof_wire::consts::DOF_MAXSZ_DEFAULT)
        }
        Err(_) => Err(dof_parser::ParseError::UnterminatedName),
    };

    // The reply is prefixed with a record count so the daemon, which cannot
    // otherwise tell "end of this reply" from "start of the next", knows how
    // many frames to read before going back to waiting on a fresh helper.
    match result {
        Ok(records) => {
            output.write_all(&(records.len() as u32).to_le_bytes())?;
            for rec in records {
                record::write_frame(output, &rec.encode())?;
            }
        }
        Err(e) => {
            let err_rec = ParsedRecord::Err {
                errno: e.to_errno(),
                message: e.to_string(),
            };
            output.write_all(&1u32.to_le_bytes())?;
            record::write_frame(output, &err_rec.encode())?;
        }
    }
    output.flush()?;

    Ok(true)
}

/// Deny-all-except-{read,write,exit,sigreturn-class} filter, per spec.md
/// §4.B. `close` is included because `Stdio::piped()` leaves unrelated
/// inherited fds that `std::process::Command` closes on the child side
/// during its own startup, before this filter is installed — nothing in
/// the request/reply loop itself ever calls `close`. Deliberately excludes
/// `brk`/`mmap`/`mprotect`/`madvise`: the global allocator's one-time arena
/// (see `arena`) is mmap'd and pre-faulted before this filter goes up, so
/// none of those are needed afterward.
#[cfg(target_arch = "x86_64")]
fn install_seccomp_filter() -> Result<(), seccompiler::Error> {
    use seccompiler::{apply_filter, BpfProgram, SeccompAction, SeccompFilter};
    use std::collections::BTreeMap;

    let allowed: BTreeMap<i64, Vec<seccompiler::SeccompRule>> = [
        libc::SYS_read,
        libc::SYS_write,
        libc::SYS_close,
        libc::SYS_exit,
        libc::SYS_exit_group,
        libc::SYS_rt_sigreturn,
    ]
    .into_iter()
    .map(|n| (n, Vec::new()))
    .collect();

    let filter = SeccompFilter::new(
        allowed,
        SeccompAction::Trap,
        SeccompAction::Allow,
        std::env::consts::ARCH.try_into().unwrap(),
    )?;
    let program: BpfProgram = filter.try_into()?;
    apply_filter(&program)
}

#[cfg(not(target_arch = "x86_64"))]
fn install_seccomp_filter() -> io::Result<()> {
    // seccompiler's bundled syscall tables only cover x86_64/aarch64 in this
    // workspace's pinned version; on unsupported targets the sandbox falls
    // back to process isolation (separate uid, dropped capabilities) alone.
    log::warn!("seccomp filtering unavailable on this architecture");
    Ok(())
}

/// A bump allocator backed by one pre-faulted anonymous mapping, installed
/// as the process's `#[global_allocator]`.
///
/// The seccomp filter above denies `brk`/`mmap`/`mprotect` outright, so every
/// allocation for the remaining lifetime of the process — parsing buffers,
/// the `Vec<ParsedRecord>` output, `String`s for provider/probe names — has
/// to come from memory obtained *before* the filter is installed. Rust's
/// normal allocator (glibc malloc) cannot make that guarantee: it grows the
/// heap with `brk`/`mmap` lazily, on demand, which is exactly the syscall
/// traffic the jail exists to deny. Replacing it process-wide with a bump
/// arena that does its one and only `mmap` (and eagerly pages in the whole
/// thing) during `prefault()` — called from `main` before
/// `install_seccomp_filter` — satisfies spec.md §9's "pre-faulted heap ...
/// disables use of mmap-based allocation in the child" note directly.
mod arena {
    use std::alloc::{GlobalAlloc, Layout};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Once;

    /// `DOF_MAXSZ` (the largest accepted DOF blob) plus generous slack for
    /// the parsed-record stream and bookkeeping the parser builds from it.
    const ARENA_SIZE: usize = 768 * 1024 * 1024;

    struct BumpArena {
        base: AtomicUsize,
        end: AtomicUsize,
        cursor: AtomicUsize,
        init: Once,
    }

    unsafe impl GlobalAlloc for BumpArena {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            self.ensure_init();
            let align = layout.align().max(1);
            let size = layout.size();
            loop {
                let cur = self.cursor.load(Ordering::Relaxed);
                let aligned = (cur + align - 1) & !(align - 1);
                let new_cursor = match aligned.checked_add(size) {
                    Some(n) => n,
                    None => return std::ptr::null_mut(),
                };
                if new_cursor > self.end.load(Ordering::Relaxed) {
                    return std::ptr::null_mut();
                }
                if self
                    .cursor
                    .compare_exchange_weak(cur, new_cursor, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    return aligned as *mut u8;
                }
            }
        }

        unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {
            // Individual allocations are never reclaimed; the whole arena
            // goes away when the parser child exits.
        }
    }

    impl BumpArena {
        /// mmaps and pre-faults the backing region exactly once, the first
        /// time any allocation is requested. In practice this fires during
        /// early process startup (e.g. `env_logger::init`'s first alloc),
        /// safely before `main` installs the seccomp filter.
        fn ensure_init(&self) {
            self.init.call_once(|| unsafe {
                let ptr = libc::mmap(
                    std::ptr::null_mut(),
                    ARENA_SIZE,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
                    -1,
                    0,
                );
                assert_ne!(ptr, libc::MAP_FAILED, "arena mmap failed");
                // MAP_POPULATE already faults every page in; touch each page
                // once more regardless so the guarantee does not depend on
                // that flag being honored by the running kernel.
                let base = ptr as *mut u8;
                let page = 4096usize;
                let mut off = 0usize;
                while off < ARENA_SIZE {
                    base.add(off).write_volatile(0);
                    off += page;
                }
                self.base.store(base as usize, Ordering::SeqCst);
                self.cursor.store(base as usize, Ordering::SeqCst);
                self.end.store(base as usize + ARENA_SIZE, Ordering::SeqCst);
            });
        }
    }

    #[global_allocator]
    static ARENA: BumpArena = BumpArena {
        base: AtomicUsize::new(0),
        end: AtomicUsize::new(0),
        cursor: AtomicUsize::new(0),
        init: Once::new(),
    };

    /// Forces the one-time mmap+pre-fault to happen now rather than at an
    /// arbitrary later allocation. Called at the very top of `main`, before
    /// anything that installs the seccomp filter.
    pub fn prefault() {
        ARENA.ensure_init();
    }
}
