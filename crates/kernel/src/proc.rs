//! Process table.
//!
//! Fixed array of slots, allocated by scanning for an unused entry. The
//! scheduler picks runnable slots round-robin starting after the last slot it
//! ran, so a process that yields cannot starve its neighbours. Blocking is a
//! state plus a wake-up channel; the channel names the event a sleeper is
//! waiting on, and waking re-runs the syscall that blocked, which re-checks
//! its condition before committing.

use machine::TrapFrame;
use storage::{InodeId, ROOT_INO};

use crate::config::{NOFILE, NPROC};
use crate::vm::AddressSpace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Embryo,
    Runnable,
    Running,
    Sleeping,
    Zombie,
}

/// What a sleeping process is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// The tick counter; sleepers carry their deadline in the PCB.
    Ticks,
    /// Bytes arriving on the console.
    ConsoleInput,
    /// A child of the process in this slot changing state.
    Wait(usize),
    /// Data appearing in a pipe.
    PipeRead(usize),
    /// Space appearing in a pipe.
    PipeWrite(usize),
}

pub struct Proc {
    pub state: ProcState,
    pub pid: u32,
    pub parent: Option<usize>,
    pub killed: bool,
    pub chan: Option<Channel>,
    /// Absolute tick at which a sleep() ends.
    pub sleep_deadline: Option<u64>,
    pub frame: TrapFrame,
    pub space: Option<AddressSpace>,
    pub name: String,
    pub exit_status: i32,
    /// Descriptor table: indices into the open file table.
    pub files: [Option<usize>; NOFILE],
    pub cwd: InodeId,
}

impl Proc {
    fn unused() -> Self {
        Self {
            state: ProcState::Unused,
            pid: 0,
            parent: None,
            killed: false,
            chan: None,
            sleep_deadline: None,
            frame: TrapFrame::zeroed(),
            space: None,
            name: String::new(),
            exit_status: 0,
            files: [None; NOFILE],
            cwd: ROOT_INO,
        }
    }
}

pub struct ProcTable {
    procs: Vec<Proc>,
    next_pid: u32,
    last_run: usize,
}

impl ProcTable {
    pub fn new() -> Self {
        Self {
            procs: (0..NPROC).map(|_| Proc::unused()).collect(),
            next_pid: 1,
            last_run: NPROC - 1,
        }
    }

    pub fn get(&self, slot: usize) -> &Proc {
        &self.procs[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut Proc {
        &mut self.procs[slot]
    }

    /// Claim an unused slot as an embryo with a fresh pid.
    pub fn alloc(&mut self, parent: Option<usize>) -> Option<usize> {
        let slot = self
            .procs
            .iter()
            .position(|p| p.state == ProcState::Unused)?;
        let pid = self.next_pid;
        self.next_pid += 1;
        let p = &mut self.procs[slot];
        *p = Proc::unused();
        p.state = ProcState::Embryo;
        p.pid = pid;
        p.parent = parent;
        Some(slot)
    }

    /// Return a slot to the free pool. The address space and descriptors
    /// must already have been released.
    pub fn release(&mut self, slot: usize) {
        debug_assert!(self.procs[slot].space.is_none(), "releasing slot with live space");
        self.procs[slot] = Proc::unused();
    }

    /// Next runnable slot after the one that last ran.
    pub fn pick_runnable(&mut self) -> Option<usize> {
        for i in 1..=NPROC {
            let slot = (self.last_run + i) % NPROC;
            if self.procs[slot].state == ProcState::Runnable {
                self.last_run = slot;
                return Some(slot);
            }
        }
        None
    }

    /// Make every sleeper on `chan` runnable again.
    pub fn wakeup(&mut self, chan: Channel) {
        for p in &mut self.procs {
            if p.state == ProcState::Sleeping && p.chan == Some(chan) {
                p.state = ProcState::Runnable;
                p.chan = None;
            }
        }
    }

    /// Wake sleepers on the tick channel whose deadline has passed.
    pub fn wakeup_due_sleepers(&mut self, now: u64) {
        for p in &mut self.procs {
            if p.state == ProcState::Sleeping
                && p.chan == Some(Channel::Ticks)
                && p.sleep_deadline.is_some_and(|d| d <= now)
            {
                p.state = ProcState::Runnable;
                p.chan = None;
            }
        }
    }

    /// Flag `pid` for termination. A sleeping target is made runnable so it
    /// notices promptly. Returns false if no such process exists.
    pub fn kill(&mut self, pid: u32) -> bool {
        for p in &mut self.procs {
            if p.pid == pid && p.state != ProcState::Unused {
                p.killed = true;
                if p.state == ProcState::Sleeping {
                    p.state = ProcState::Runnable;
                    p.chan = None;
                }
                return true;
            }
        }
        false
    }

    pub fn slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..NPROC).filter(|&i| self.procs[i].state != ProcState::Unused)
    }

    /// Child slots of `parent`.
    pub fn children_of(&self, parent: usize) -> Vec<usize> {
        (0..NPROC)
            .filter(|&i| {
                self.procs[i].state != ProcState::Unused && self.procs[i].parent == Some(parent)
            })
            .collect()
    }

    pub fn any_live(&self) -> bool {
        self.procs.iter().any(|p| p.state != ProcState::Unused)
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_assigns_fresh_pids_and_recycles_slots() {
        let mut pt = ProcTable::new();
        let a = pt.alloc(None).unwrap();
        let b = pt.alloc(Some(a)).unwrap();
        assert_ne!(pt.get(a).pid, pt.get(b).pid);
        assert_eq!(pt.get(b).parent, Some(a));

        let old_pid = pt.get(a).pid;
        pt.release(a);
        let c = pt.alloc(None).unwrap();
        assert_eq!(c, a);
        assert_ne!(pt.get(c).pid, old_pid);
    }

    #[test]
    fn round_robin_resumes_after_last_run() {
        let mut pt = ProcTable::new();
        let a = pt.alloc(None).unwrap();
        let b = pt.alloc(None).unwrap();
        let c = pt.alloc(None).unwrap();
        for slot in [a, b, c] {
            pt.get_mut(slot).state = ProcState::Runnable;
        }
        assert_eq!(pt.pick_runnable(), Some(a));
        pt.get_mut(a).state = ProcState::Runnable;
        assert_eq!(pt.pick_runnable(), Some(b));
        pt.get_mut(b).state = ProcState::Runnable;
        assert_eq!(pt.pick_runnable(), Some(c));
        // Wraps around.
        assert_eq!(pt.pick_runnable(), Some(a));
    }

    #[test]
    fn wakeup_only_touches_matching_channel() {
        let mut pt = ProcTable::new();
        let a = pt.alloc(None).unwrap();
        let b = pt.alloc(None).unwrap();
        pt.get_mut(a).state = ProcState::Sleeping;
        pt.get_mut(a).chan = Some(Channel::ConsoleInput);
        pt.get_mut(b).state = ProcState::Sleeping;
        pt.get_mut(b).chan = Some(Channel::PipeRead(3));

        pt.wakeup(Channel::ConsoleInput);
        assert_eq!(pt.get(a).state, ProcState::Runnable);
        assert_eq!(pt.get(b).state, ProcState::Sleeping);
    }

    #[test]
    fn deadline_wakeups_respect_the_clock() {
        let mut pt = ProcTable::new();
        let a = pt.alloc(None).unwrap();
        pt.get_mut(a).state = ProcState::Sleeping;
        pt.get_mut(a).chan = Some(Channel::Ticks);
        pt.get_mut(a).sleep_deadline = Some(10);

        pt.wakeup_due_sleepers(9);
        assert_eq!(pt.get(a).state, ProcState::Sleeping);
        pt.wakeup_due_sleepers(10);
        assert_eq!(pt.get(a).state, ProcState::Runnable);
    }

    #[test]
    fn kill_rouses_a_sleeping_target() {
        let mut pt = ProcTable::new();
        let a = pt.alloc(None).unwrap();
        pt.get_mut(a).state = ProcState::Sleeping;
        pt.get_mut(a).chan = Some(Channel::Ticks);
        let pid = pt.get(a).pid;

        assert!(pt.kill(pid));
        assert!(pt.get(a).killed);
        assert_eq!(pt.get(a).state, ProcState::Runnable);
        assert!(!pt.kill(9999));
    }
}
