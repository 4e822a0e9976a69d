//! Program loader.
//!
//! Builds the replacement address space off to the side and commits it only
//! once everything — segments, guard, stack, marshalled arguments — is in
//! place, so a failed exec leaves the caller exactly as it was. The stack
//! ends up as: argument strings at the top, then the argv pointer array,
//! then three words the new program starts from: a sentinel return address,
//! argc, and the argv array address.

use log::{debug, info};
use storage::{FsError, InodeId};
use thiserror::Error;
use types::abi::{MAX_ARG, REG_RET, REG_SP};
use types::image::{ImageError, ImageHeader, Segment, HEADER_LEN, SEGMENT_LEN};
use types::pagetable::{align_up, PAGE_SIZE};

use crate::config::{MAX_STR, USER_STACK_PAGES};
use crate::kalloc::KernelPager;
use crate::kernel::Kernel;
use crate::syscall::{self, Outcome};
use crate::vm::{self, AddressSpace, VmError};

/// Written at the top of a fresh stack where a return address would live;
/// returning from main without exiting jumps here and faults.
const STACK_SENTINEL: u32 = 0xffff_ffff;

/// Segment records a single image may carry. The count comes straight out of
/// an untrusted header, so it is capped before anything is sized from it.
const MAX_SEGMENTS: u32 = 16;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error("bad image: {0}")]
    BadImage(&'static str),
    #[error("too many arguments")]
    TooManyArgs,
}

pub(crate) fn sys_exec(k: &mut Kernel, slot: usize) -> Outcome {
    let Ok(path) = syscall::arg_path(k, slot, 0) else {
        return Outcome::Ret(-1);
    };
    let Ok(argv_ptr) = syscall::arg_raw(k, slot, 1) else {
        return Outcome::Ret(-1);
    };

    let space = syscall::proc_space(k, slot);
    let mut argv = Vec::new();
    loop {
        if argv.len() > MAX_ARG {
            return Outcome::Ret(-1);
        }
        let entry = argv_ptr.wrapping_add(4 * argv.len() as u32);
        let ptr = match vm::copy_in_u32(&k.machine.mem, &space, entry) {
            Ok(ptr) => ptr,
            Err(_) => return Outcome::Ret(-1),
        };
        if ptr == 0 {
            break;
        }
        match vm::copy_in_str(&k.machine.mem, &space, ptr, MAX_STR) {
            Ok(s) => argv.push(s),
            Err(_) => return Outcome::Ret(-1),
        }
    }

    match k.exec_into(slot, &path, &argv) {
        Ok(()) => Outcome::Exec,
        Err(e) => {
            debug!("exec {:?} failed: {}", path, e);
            Outcome::Ret(-1)
        }
    }
}

impl Kernel {
    /// Replace the process image in `slot` with the executable at `path`.
    /// On error the old image, including its register frame, is untouched.
    pub(crate) fn exec_into(
        &mut self,
        slot: usize,
        path: &str,
        argv: &[String],
    ) -> Result<(), ExecError> {
        if argv.len() > MAX_ARG {
            return Err(ExecError::TooManyArgs);
        }
        let cwd = self.ptable.get(slot).cwd;
        self.fs.begin_op();
        let ino = match self.fs.namei(cwd, path) {
            Ok(ino) => ino,
            Err(e) => {
                self.fs.end_op();
                return Err(e.into());
            }
        };
        self.fs.ilock(ino);
        let result = self.load_image(slot, ino, path, argv);
        self.fs.iunlockput(ino);
        self.fs.end_op();
        result
    }

    fn load_image(
        &mut self,
        slot: usize,
        ino: InodeId,
        path: &str,
        argv: &[String],
    ) -> Result<(), ExecError> {
        let mut hdr = [0u8; HEADER_LEN];
        if self.fs.readi(ino, 0, &mut hdr)? != HEADER_LEN {
            return Err(ImageError::Truncated.into());
        }
        let header = ImageHeader::parse(&hdr)?;
        if header.seg_count == 0 || header.seg_count > MAX_SEGMENTS {
            return Err(ExecError::BadImage("unreasonable segment count"));
        }

        let mut segments = Vec::with_capacity(header.seg_count as usize);
        for i in 0..header.seg_count {
            let mut rec = [0u8; SEGMENT_LEN];
            let off = header.seg_off + i * SEGMENT_LEN as u32;
            if self.fs.readi(ino, off, &mut rec)? != SEGMENT_LEN {
                return Err(ImageError::Truncated.into());
            }
            segments.push(Segment::parse(&rec)?);
        }

        let mut pager = KernelPager {
            mem: &mut self.machine.mem,
            frames: &mut self.frames,
        };
        let mut space = vm::new_kernel_space(&mut pager)?;

        match self.populate(ino, &segments, argv, &mut space) {
            Ok(sp) => {
                let p = self.ptable.get_mut(slot);
                let old = p.space.replace(space);
                p.frame = machine::TrapFrame::zeroed();
                p.frame.pc = header.entry;
                p.frame.regs[REG_SP] = sp;
                // By convention exec "returns" argc.
                p.frame.regs[REG_RET] = argv.len() as u32;
                p.name = basename(path).to_string();
                info!("exec: pid {} -> {:?} entry=0x{:08x}", p.pid, p.name, header.entry);

                if let Some(old) = old {
                    let mut pager = KernelPager {
                        mem: &mut self.machine.mem,
                        frames: &mut self.frames,
                    };
                    vm::destroy(&mut pager, old.root);
                }
                Ok(())
            }
            Err(e) => {
                let mut pager = KernelPager {
                    mem: &mut self.machine.mem,
                    frames: &mut self.frames,
                };
                vm::destroy(&mut pager, space.root);
                Err(e)
            }
        }
    }

    /// Load segments and build the stack in `space`; returns the initial
    /// stack pointer.
    fn populate(
        &mut self,
        ino: InodeId,
        segments: &[Segment],
        argv: &[String],
        space: &mut AddressSpace,
    ) -> Result<u32, ExecError> {
        for seg in segments {
            if seg.filesz > seg.memsz {
                return Err(ExecError::BadImage("filesz exceeds memsz"));
            }
            let end = seg
                .vaddr
                .checked_add(seg.memsz)
                .ok_or(ExecError::BadImage("segment wraps the address space"))?;
            if end > space.size {
                let mut pager = KernelPager {
                    mem: &mut self.machine.mem,
                    frames: &mut self.frames,
                };
                vm::grow(&mut pager, space, end)?;
            }

            let mut va = seg.vaddr;
            let mut file_off = seg.offset;
            let mut remaining = seg.filesz as usize;
            let mut buf = [0u8; 1024];
            while remaining > 0 {
                let n = remaining.min(buf.len());
                if self.fs.readi(ino, file_off, &mut buf[..n])? != n {
                    return Err(ImageError::Truncated.into());
                }
                vm::copy_out(&mut self.machine.mem, space, va, &buf[..n])?;
                va += n as u32;
                file_off += n as u32;
                remaining -= n;
            }
        }

        // Guard page, then the stack, above the loaded image.
        let guard_base = align_up(space.size as usize, PAGE_SIZE) as u32;
        let stack_top = guard_base + (1 + USER_STACK_PAGES) * PAGE_SIZE as u32;
        {
            let mut pager = KernelPager {
                mem: &mut self.machine.mem,
                frames: &mut self.frames,
            };
            vm::grow(&mut pager, space, stack_top)?;
            vm::protect_guard(&mut pager, space.root, guard_base)?;
        }
        let stack_base = guard_base + PAGE_SIZE as u32;

        // Argument strings, top down, each word aligned.
        let mut sp = stack_top;
        let mut arg_ptrs = Vec::with_capacity(argv.len());
        for arg in argv {
            let len = arg.len() as u32 + 1;
            sp = (sp - len) & !3;
            if sp < stack_base {
                return Err(ExecError::BadImage("arguments overflow the stack"));
            }
            let mut bytes = arg.as_bytes().to_vec();
            bytes.push(0);
            vm::copy_out(&mut self.machine.mem, space, sp, &bytes)?;
            arg_ptrs.push(sp);
        }

        // argv array, NULL terminated, then sentinel / argc / argv.
        let mut words = Vec::with_capacity(arg_ptrs.len() + 4);
        sp -= (arg_ptrs.len() as u32 + 1) * 4;
        let argv_addr = sp;
        words.extend(arg_ptrs.iter().copied());
        words.push(0);
        sp -= 12;
        let preamble = [STACK_SENTINEL, argv.len() as u32, argv_addr];
        if sp < stack_base {
            return Err(ExecError::BadImage("arguments overflow the stack"));
        }

        let mut bytes = Vec::with_capacity((preamble.len() + words.len()) * 4);
        for w in preamble.iter().chain(words.iter()) {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        vm::copy_out(&mut self.machine.mem, space, sp, &bytes)?;
        Ok(sp)
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
