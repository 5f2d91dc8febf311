//! Open/close bookkeeping shared by the managers

use parking_lot::Mutex;

use crate::error::{CoordError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotOpen,
    Opening,
    Open,
    Closed,
}

/// Lifecycle of a manager: `NotOpen → Opening → Open → Closed`
///
/// `Closed` is terminal; a manager cannot be reopened.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    component: &'static str,
    phase: Mutex<Phase>,
}

impl Lifecycle {
    pub(crate) fn new(component: &'static str) -> Self {
        Self {
            component,
            phase: Mutex::new(Phase::NotOpen),
        }
    }

    /// Claim the right to open; pair with `finish_open` or `abort_open`
    pub(crate) fn begin_open(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        match *phase {
            Phase::NotOpen => {
                *phase = Phase::Opening;
                Ok(())
            }
            _ => Err(CoordError::AlreadyOpen { component: self.component }),
        }
    }

    pub(crate) fn finish_open(&self) {
        let mut phase = self.phase.lock();
        if *phase == Phase::Opening {
            *phase = Phase::Open;
        }
    }

    pub(crate) fn abort_open(&self) {
        let mut phase = self.phase.lock();
        if *phase == Phase::Opening {
            *phase = Phase::NotOpen;
        }
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if *self.phase.lock() == Phase::Open {
            Ok(())
        } else {
            Err(CoordError::NotOpen { component: self.component })
        }
    }

    /// Move to `Closed`; fails if never opened or already closed
    pub(crate) fn close(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        match *phase {
            Phase::Open => {
                *phase = Phase::Closed;
                Ok(())
            }
            Phase::Closed => Err(CoordError::AlreadyClosed { component: self.component }),
            Phase::NotOpen | Phase::Opening => Err(CoordError::NotOpen { component: self.component }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let lifecycle = Lifecycle::new("test manager");
        assert!(lifecycle.check_open().is_err());
        assert_eq!(lifecycle.close().unwrap_err(), CoordError::NotOpen { component: "test manager" });

        lifecycle.begin_open().unwrap();
        assert_eq!(lifecycle.begin_open().unwrap_err(), CoordError::AlreadyOpen { component: "test manager" });
        lifecycle.abort_open();
        lifecycle.begin_open().unwrap();
        lifecycle.finish_open();
        assert!(lifecycle.check_open().is_ok());

        lifecycle.close().unwrap();
        assert_eq!(lifecycle.close().unwrap_err(), CoordError::AlreadyClosed { component: "test manager" });
        assert!(lifecycle.begin_open().is_err());
        assert!(lifecycle.check_open().is_err());
    }
}
