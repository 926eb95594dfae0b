//! Storage fault injection for writable layers.
//!
//! Every writable layer owns a `FaultInjector`. Production code calls
//! `check` at the points where storage can fail (copying data, committing a
//! rename, persisting the whiteout index); with no rules installed the check
//! is a no-op. Tests install rules to prove that failed operations leave no
//! partial state behind.

use parking_lot::Mutex;
use std::io;

/// Storage operations that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOp {
    /// One chunk of file content written during copy-up.
    CopyData,
    /// The rename that publishes a staged entry into the layer tree.
    Commit,
    /// Persisting the whiteout index.
    Whiteout,
    /// Creating a directory in the parent skeleton.
    CreateDir,
}

/// Errno values a rule can inject.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultErrno {
    Eio,
    Enospc,
}

impl FaultErrno {
    fn to_error(self) -> io::Error {
        match self {
            FaultErrno::Eio => io::Error::from_raw_os_error(libc::EIO),
            FaultErrno::Enospc => io::Error::from_raw_os_error(libc::ENOSPC),
        }
    }
}

/// Which op should fail, when, and how often.
#[derive(Clone, Debug)]
pub struct FaultRule {
    pub op: FaultOp,
    pub errno: FaultErrno,
    /// Number of leading invocations to let through before failing.
    pub start_after: u64,
    /// Maximum number of injected failures; `None` fails forever.
    pub max_faults: Option<u64>,
}

impl FaultRule {
    pub fn new(op: FaultOp) -> Self {
        FaultRule {
            op,
            errno: FaultErrno::Eio,
            start_after: 0,
            max_faults: None,
        }
    }

    pub fn errno(mut self, errno: FaultErrno) -> Self {
        self.errno = errno;
        self
    }

    pub fn after(mut self, invocations: u64) -> Self {
        self.start_after = invocations;
        self
    }

    pub fn times(mut self, max_faults: u64) -> Self {
        self.max_faults = Some(max_faults);
        self
    }
}

#[derive(Clone, Debug, Default)]
struct RuleCounters {
    hits: u64,
    invocations: u64,
}

#[derive(Debug, Default)]
struct FaultState {
    rules: Vec<(FaultRule, RuleCounters)>,
}

/// Runtime controller that tracks rules and hit counts.
#[derive(Debug, Default)]
pub struct FaultInjector {
    state: Mutex<FaultState>,
}

impl FaultInjector {
    pub fn add_rule(&self, rule: FaultRule) {
        self.state
            .lock()
            .rules
            .push((rule, RuleCounters::default()));
    }

    pub fn clear(&self) {
        self.state.lock().rules.clear();
    }

    /// Total number of faults injected so far.
    pub fn injected(&self) -> u64 {
        self.state.lock().rules.iter().map(|(_, c)| c.hits).sum()
    }

    pub fn check(&self, op: FaultOp) -> io::Result<()> {
        let mut state = self.state.lock();
        for (rule, counters) in state.rules.iter_mut() {
            if rule.op != op {
                continue;
            }
            counters.invocations = counters.invocations.saturating_add(1);
            if counters.invocations <= rule.start_after {
                continue;
            }
            if let Some(max) = rule.max_faults {
                if counters.hits >= max {
                    continue;
                }
            }
            counters.hits = counters.hits.saturating_add(1);
            tracing::debug!("fault injected: {:?} -> {:?}", op, rule.errno);
            return Err(rule.errno.to_error());
        }
        Ok(())
    }
}
