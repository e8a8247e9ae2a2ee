//! Interned command names and the (pid, tid) threads that carry them.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

pub type PidTid = (u32, u32);

/// Name of the kernel idle process. Perf never records a COMM event for pid
/// 0, but behaves as if it had; so do we.
const SWAPPER_COMMAND_NAME: &str = "swapper";
const SWAPPER_PID: u32 = 0;

/// Canonical storage of distinct command strings. Each string is stored once
/// and shared by reference; a thread's command stays valid until a later
/// COMM event overwrites that (pid, tid) entry.
#[derive(Debug)]
pub struct CommandTable {
    commands: HashSet<Rc<str>>,
    by_thread: HashMap<PidTid, Rc<str>>,
}

impl CommandTable {
    pub fn new() -> Self {
        let mut table = CommandTable {
            commands: HashSet::new(),
            by_thread: HashMap::new(),
        };
        table.insert(SWAPPER_PID, SWAPPER_PID, SWAPPER_COMMAND_NAME);
        table
    }

    /// Interns `comm` and points (pid, tid) at it.
    pub fn insert(&mut self, pid: u32, tid: u32, comm: &str) {
        let interned = match self.commands.get(comm) {
            Some(existing) => existing.clone(),
            None => {
                let fresh: Rc<str> = Rc::from(comm);
                self.commands.insert(fresh.clone());
                fresh
            }
        };
        self.by_thread.insert((pid, tid), interned);
    }

    pub fn lookup(&self, pid: u32, tid: u32) -> Option<Rc<str>> {
        self.by_thread.get(&(pid, tid)).cloned()
    }

    /// Copies the parent's command to the child on fork. Best effort; a
    /// parent without a recorded command is not an error.
    pub fn propagate(&mut self, parent: PidTid, child: PidTid) {
        if parent == child {
            return;
        }
        if let Some(comm) = self.by_thread.get(&parent).cloned() {
            self.by_thread.insert(child, comm);
        }
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}
