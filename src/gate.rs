// src/gate.rs

//! Command-in-flight gate
//!
//! At most one command runs at a time. What happens to a second caller
//! depends on the call site: direct commands are rejected, while the
//! suggestion path waits for the running command to finish.

use crate::error::{Error, Result};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Behavior when the gate is already held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contention {
    /// Fail with `Error::Busy`
    Reject,
    /// Block until the holder releases the gate
    Wait,
}

/// Mutual exclusion between commands
#[derive(Debug, Default)]
pub struct CommandGate {
    busy: Mutex<bool>,
    idle: Condvar,
}

impl CommandGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.busy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the gate, released when the guard is dropped
    pub fn acquire(&self, contention: Contention) -> Result<CommandGuard<'_>> {
        let mut busy = self.lock();
        if *busy {
            match contention {
                Contention::Reject => {
                    warn!("Another command is already executing, doing nothing");
                    return Err(Error::Busy);
                }
                Contention::Wait => {
                    debug!("Another command is executing, waiting until it is finished");
                    while *busy {
                        busy = self.idle.wait(busy).unwrap_or_else(PoisonError::into_inner);
                    }
                }
            }
        }
        *busy = true;
        Ok(CommandGuard { gate: self })
    }

    /// Block until no command holds the gate, without taking it
    pub fn wait_idle(&self) {
        let mut busy = self.lock();
        if *busy {
            debug!("Another command is executing, waiting until it is finished");
        }
        while *busy {
            busy = self.idle.wait(busy).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn is_busy(&self) -> bool {
        *self.lock()
    }
}

/// Holds the command gate until dropped
#[derive(Debug)]
pub struct CommandGuard<'a> {
    gate: &'a CommandGate,
}

impl Drop for CommandGuard<'_> {
    fn drop(&mut self) {
        *self.gate.lock() = false;
        self.gate.idle.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_reject_while_held() {
        let gate = CommandGate::new();
        let guard = gate.acquire(Contention::Reject).unwrap();
        assert!(gate.is_busy());
        assert!(matches!(gate.acquire(Contention::Reject), Err(Error::Busy)));

        drop(guard);
        assert!(!gate.is_busy());
        assert!(gate.acquire(Contention::Reject).is_ok());
    }

    #[test]
    fn test_wait_proceeds_after_release() {
        let gate = Arc::new(CommandGate::new());
        let finished = Arc::new(AtomicBool::new(false));
        let guard = gate.acquire(Contention::Reject).unwrap();

        let waiter = {
            let gate = gate.clone();
            let finished = finished.clone();
            std::thread::spawn(move || {
                let _guard = gate.acquire(Contention::Wait).unwrap();
                finished.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        assert!(!finished.load(Ordering::SeqCst));

        drop(guard);
        waiter.join().unwrap();
        assert!(finished.load(Ordering::SeqCst));
        assert!(!gate.is_busy());
    }

    #[test]
    fn test_wait_idle_does_not_take_the_gate() {
        let gate = Arc::new(CommandGate::new());
        gate.wait_idle();
        assert!(!gate.is_busy());

        let idle = Arc::new(AtomicBool::new(false));
        let guard = gate.acquire(Contention::Reject).unwrap();
        let waiter = {
            let gate = gate.clone();
            let idle = idle.clone();
            std::thread::spawn(move || {
                gate.wait_idle();
                idle.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        assert!(!idle.load(Ordering::SeqCst));

        drop(guard);
        waiter.join().unwrap();
        assert!(idle.load(Ordering::SeqCst));
        assert!(gate.acquire(Contention::Reject).is_ok());
    }

    #[test]
    fn test_wait_on_free_gate_is_immediate() {
        let gate = CommandGate::new();
        let _guard = gate.acquire(Contention::Wait).unwrap();
        assert!(gate.is_busy());
    }
}
