//! The kernel proper: owns the machine, the process table, and the driver
//! state, and runs the scheduler loop.
//!
//! The kernel executes natively; only user programs run on the simulated
//! CPU. A context switch is therefore just installing a process's
//! translation root and register frame and letting the machine run until it
//! traps. Interrupts are masked across the install so no trap can observe a
//! half-switched pair.

use log::{debug, info, warn};
use machine::{Machine, Privilege, Trap};
use storage::{FileSystem, MemFs};
use thiserror::Error;

use crate::config::KernelConfig;
use crate::console::Console;
use crate::exec::ExecError;
use crate::file::{FileKind, FileTable};
use crate::kalloc::{FrameAllocator, KernelPager};
use crate::pipe::PipeTable;
use crate::proc::{Channel, ProcState, ProcTable};
use crate::vm;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("process table full")]
    NoProcessSlot,
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Why the scheduler loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// A process issued the halt syscall.
    Halted,
    /// Every process table slot is unused.
    Finished,
    /// The configured tick budget ran out.
    TickBudget,
}

/// Whether the scheduler keeps going after a trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrapFlow {
    Continue,
    Halt,
}

pub struct Kernel {
    pub machine: Machine,
    pub(crate) config: KernelConfig,
    pub(crate) ptable: ProcTable,
    pub(crate) frames: FrameAllocator,
    pub(crate) fs: Box<dyn FileSystem>,
    pub(crate) files: FileTable,
    pub(crate) pipes: PipeTable,
    pub(crate) console: Console,
    pub(crate) ticks: u64,
    init_slot: Option<usize>,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        Self::with_fs(config, Box::new(MemFs::new()))
    }

    pub fn with_fs(config: KernelConfig, fs: Box<dyn FileSystem>) -> Self {
        let machine = Machine::new(config.phys_frames, config.timer_interval);
        let frames = FrameAllocator::new(config.phys_frames);
        Self {
            machine,
            config,
            ptable: ProcTable::new(),
            frames,
            fs,
            files: FileTable::new(),
            pipes: PipeTable::new(),
            console: Console::new(),
            ticks: 0,
            init_slot: None,
        }
    }

    /// Ticks elapsed since boot.
    pub fn uptime(&self) -> u64 {
        self.ticks
    }

    /// Everything written to the serial line so far.
    pub fn console_output(&self) -> &[u8] {
        self.machine.serial_output()
    }

    /// Queue bytes as if typed on the serial line.
    pub fn console_input(&mut self, bytes: &[u8]) {
        self.machine.serial_input(bytes);
    }

    /// Write `bytes` to `path`, creating it if needed. Used to populate the
    /// filesystem with program images before boot.
    pub fn install_file(&mut self, path: &str, bytes: &[u8]) -> Result<(), KernelError> {
        self.fs.begin_op();
        let result = (|| {
            let ino = self
                .fs
                .create(storage::ROOT_INO, path, storage::InodeKind::File)
                .map_err(ExecError::Fs)?;
            self.fs.ilock(ino);
            let r = self.fs.writei(ino, 0, bytes).map_err(ExecError::Fs);
            self.fs.iunlockput(ino);
            r.map(|_| ())
        })();
        self.fs.end_op();
        Ok(result?)
    }

    /// Create a process from an image on the filesystem. The first spawn
    /// becomes init: orphans are reparented to it when their parent exits.
    pub fn spawn(&mut self, path: &str, argv: &[&str]) -> Result<u32, KernelError> {
        let slot = self.ptable.alloc(None).ok_or(KernelError::NoProcessSlot)?;
        self.ptable.get_mut(slot).cwd = self.fs.idup(storage::ROOT_INO);

        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        match self.exec_into(slot, path, &argv) {
            Ok(()) => {
                let p = self.ptable.get_mut(slot);
                p.state = ProcState::Runnable;
                let pid = p.pid;
                if self.init_slot.is_none() {
                    self.init_slot = Some(slot);
                }
                info!("spawn: pid {} from {:?}", pid, path);
                Ok(pid)
            }
            Err(e) => {
                let cwd = self.ptable.get(slot).cwd;
                self.fs.iput(cwd);
                self.ptable.release(slot);
                Err(e.into())
            }
        }
    }

    /// Schedule until halt, an empty process table, or the tick budget.
    pub fn run(&mut self) -> RunExit {
        loop {
            if !self.ptable.any_live() {
                return RunExit::Finished;
            }
            if self.budget_exhausted() {
                return RunExit::TickBudget;
            }

            let Some(slot) = self.ptable.pick_runnable() else {
                let sleeping = self
                    .ptable
                    .slots()
                    .any(|s| self.ptable.get(s).state == ProcState::Sleeping);
                if !sleeping {
                    // Only zombies nobody will reap remain.
                    debug!("scheduler: no runnable or sleeping processes");
                    return RunExit::Finished;
                }
                let trap = self.machine.wait_for_interrupt();
                if self.handle_trap(usize::MAX, trap) == TrapFlow::Halt {
                    return RunExit::Halted;
                }
                continue;
            };

            self.context_switch_in(slot);
            loop {
                let trap = self.machine.run();
                self.ptable.get_mut(slot).frame = self.machine.save_frame();
                if self.handle_trap(slot, trap) == TrapFlow::Halt {
                    return RunExit::Halted;
                }

                let p = self.ptable.get(slot);
                if p.killed && matches!(p.state, ProcState::Running | ProcState::Runnable) {
                    self.exit_process(slot, -1);
                }
                if self.budget_exhausted() {
                    return RunExit::TickBudget;
                }
                if self.ptable.get(slot).state != ProcState::Running {
                    break;
                }
                // Still this process's turn; reload in case a syscall moved
                // the frame or swapped the address space.
                self.context_switch_in(slot);
            }
        }
    }

    fn context_switch_in(&mut self, slot: usize) {
        let p = self.ptable.get_mut(slot);
        p.state = ProcState::Running;
        let root = p.space.as_ref().expect("running process without a space").root;
        let frame = p.frame;
        self.machine.set_interrupts(false);
        self.machine.install_root(root);
        self.machine.load_frame(&frame);
        self.machine.set_interrupts(true);
    }

    fn budget_exhausted(&self) -> bool {
        self.config.tick_budget.is_some_and(|b| self.ticks >= b)
    }

    /// Timer tick bookkeeping shared by the running and idle paths.
    pub(crate) fn clock_tick(&mut self) {
        self.ticks += 1;
        let now = self.ticks;
        self.ptable.wakeup_due_sleepers(now);
    }

    /// Move received serial bytes into the console queue and wake readers.
    pub(crate) fn drain_serial(&mut self) {
        let mut any = false;
        while let Some(b) = self.machine.serial_take_byte() {
            self.console.push(b);
            any = true;
        }
        if any {
            self.ptable.wakeup(Channel::ConsoleInput);
        }
    }

    /// Close a descriptor, releasing the underlying object on last close.
    pub(crate) fn close_fd(&mut self, slot: usize, fd: usize) {
        let Some(id) = self.ptable.get_mut(slot).files[fd].take() else {
            return;
        };
        let Some(kind) = self.files.close(id) else {
            return;
        };
        match kind {
            FileKind::Inode { ino } | FileKind::Device { ino, .. } => {
                self.fs.iput(ino);
            }
            FileKind::Pipe { pipe, write_end } => {
                self.pipes.close_end(pipe, write_end);
                // The peer may be blocked on this end going away.
                self.ptable.wakeup(Channel::PipeRead(pipe));
                self.ptable.wakeup(Channel::PipeWrite(pipe));
            }
        }
    }

    /// Tear a process down: release descriptors and cwd, hand children to
    /// init, and leave a zombie for the parent to reap. The address space
    /// stays with the zombie; whoever frees the slot frees the memory.
    pub(crate) fn exit_process(&mut self, slot: usize, status: i32) {
        let pid = self.ptable.get(slot).pid;
        debug!("exit: pid {} status {}", pid, status);

        for fd in 0..self.ptable.get(slot).files.len() {
            self.close_fd(slot, fd);
        }
        let cwd = self.ptable.get(slot).cwd;
        self.fs.iput(cwd);

        // Orphans go to init; if init itself is exiting (or gone) they have
        // no reaper, so zombies among them are freed on the spot.
        let is_init = self.init_slot == Some(slot);
        let heir = if is_init { None } else { self.init_slot };
        for child in self.ptable.children_of(slot) {
            self.ptable.get_mut(child).parent = heir;
            if self.ptable.get(child).state == ProcState::Zombie && heir.is_none() {
                self.release_process(child);
            }
        }
        if let Some(heir) = heir {
            self.ptable.wakeup(Channel::Wait(heir));
        }

        let parent = self.ptable.get(slot).parent;
        match parent {
            Some(par) if self.ptable.get(par).state != ProcState::Unused => {
                let p = self.ptable.get_mut(slot);
                p.state = ProcState::Zombie;
                p.exit_status = status;
                p.chan = None;
                self.ptable.wakeup(Channel::Wait(par));
            }
            _ => {
                // Nobody will wait for us.
                self.release_process(slot);
            }
        }
    }

    /// Free a dead process for good: destroy the address space it still
    /// holds, then return the slot to the table.
    pub(crate) fn release_process(&mut self, slot: usize) {
        if let Some(space) = self.ptable.get_mut(slot).space.take() {
            let mut pager = KernelPager {
                mem: &mut self.machine.mem,
                frames: &mut self.frames,
            };
            vm::destroy(&mut pager, space.root);
        }
        self.ptable.release(slot);
    }

    /// Trap dispatcher. `slot` is the current process, or `usize::MAX` when
    /// the trap arrived while idling (supervisor privilege).
    pub(crate) fn handle_trap(&mut self, slot: usize, trap: Trap) -> TrapFlow {
        if trap.privilege == Privilege::Supervisor {
            return self.handle_idle_trap(trap);
        }
        crate::trap::handle_user_trap(self, slot, trap)
    }

    fn handle_idle_trap(&mut self, trap: Trap) -> TrapFlow {
        use machine::Cause;
        match trap.cause {
            Cause::Timer => self.clock_tick(),
            Cause::Serial => self.drain_serial(),
            Cause::Spurious => debug!("spurious interrupt while idle"),
            _ => panic!("fatal trap in supervisor context: {:?}", trap),
        }
        TrapFlow::Continue
    }

    pub(crate) fn warn_fault(&self, slot: usize, trap: &Trap) {
        let p = self.ptable.get(slot);
        warn!(
            "pid {} ({}): {:?} at epc=0x{:08x} tval=0x{:08x}, killing",
            p.pid, p.name, trap.cause, trap.epc, trap.tval
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zombie_keeps_its_address_space_until_reaped() {
        let mut k = Kernel::new(KernelConfig::default());
        let parent = k.ptable.alloc(None).unwrap();
        let child = k.ptable.alloc(Some(parent)).unwrap();

        let idle = k.frames.available();
        let mut pager = KernelPager {
            mem: &mut k.machine.mem,
            frames: &mut k.frames,
        };
        let space = vm::new_kernel_space(&mut pager).unwrap();
        k.ptable.get_mut(child).space = Some(space);
        assert!(k.frames.available() < idle);

        k.exit_process(child, 7);
        let p = k.ptable.get(child);
        assert_eq!(p.state, ProcState::Zombie);
        assert_eq!(p.exit_status, 7);
        // A dead-but-unreaped process still owns its memory.
        assert!(p.space.is_some());
        assert!(k.frames.available() < idle);

        // Reaping frees both the slot and the frames.
        k.release_process(child);
        assert_eq!(k.ptable.get(child).state, ProcState::Unused);
        assert_eq!(k.frames.available(), idle);
    }

    #[test]
    fn exit_without_a_reaper_frees_the_slot_immediately() {
        let mut k = Kernel::new(KernelConfig::default());
        let lone = k.ptable.alloc(None).unwrap();
        let idle = k.frames.available();
        let mut pager = KernelPager {
            mem: &mut k.machine.mem,
            frames: &mut k.frames,
        };
        let space = vm::new_kernel_space(&mut pager).unwrap();
        k.ptable.get_mut(lone).space = Some(space);

        k.exit_process(lone, 0);
        assert_eq!(k.ptable.get(lone).state, ProcState::Unused);
        assert_eq!(k.frames.available(), idle);
    }
}
