//! POSIX named semaphores
//!
//! Named semaphores are visible to every process that opens the same name,
//! and a handle opened before `fork()` stays valid in the child. All the
//! cross-process exclusion in chatd (handoff mailbox, control pipe, stores)
//! goes through this type.

use crate::error::SysError;
use nix::errno::Errno;
use std::ffi::CString;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{trace, warn};

/// Outcome of a blocking acquire that may be cut short
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The semaphore was decremented
    Acquired,
    /// EINTR: a signal arrived, nothing was decremented
    Interrupted,
    /// The deadline passed, nothing was decremented
    TimedOut,
}

/// A process-shared named semaphore
pub struct NamedSemaphore {
    name: CString,
    sem: *mut libc::sem_t,
}

// sem_t operations are safe to call from any thread
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Create a fresh semaphore with the given initial value
    ///
    /// A stale semaphore left behind by a crashed instance under the same name
    /// is unlinked first, so the new one always starts at `initial`.
    pub fn create(name: &str, initial: u32) -> Result<Self, SysError> {
        let cname = CString::new(name).map_err(|_| SysError::new("sem_open", Errno::EINVAL))?;

        // Ignore ENOENT: there is usually nothing to remove
        unsafe {
            libc::sem_unlink(cname.as_ptr());
        }

        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(SysError::last("sem_open"));
        }

        trace!(name, initial, "created semaphore");
        Ok(Self { name: cname, sem })
    }

    /// Open an existing semaphore by name
    pub fn open(name: &str) -> Result<Self, SysError> {
        let cname = CString::new(name).map_err(|_| SysError::new("sem_open", Errno::EINVAL))?;
        let sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(SysError::last("sem_open"));
        }
        Ok(Self { name: cname, sem })
    }

    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or("<invalid>")
    }

    /// Block until the semaphore can be decremented
    ///
    /// Returns `Interrupted` if a signal cut the wait short. The count is
    /// untouched in that case.
    pub fn wait(&self) -> Result<Acquire, SysError> {
        let rc = unsafe { libc::sem_wait(self.sem) };
        if rc == 0 {
            return Ok(Acquire::Acquired);
        }
        match Errno::last() {
            Errno::EINTR => Ok(Acquire::Interrupted),
            errno => Err(SysError::new("sem_wait", errno)),
        }
    }

    /// Block until decremented, retrying across signal interruptions
    pub fn wait_uninterrupted(&self) -> Result<(), SysError> {
        loop {
            if self.wait()? == Acquire::Acquired {
                return Ok(());
            }
        }
    }

    /// Block for at most `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Acquire, SysError> {
        let deadline = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            + timeout;
        let ts = libc::timespec {
            tv_sec: deadline.as_secs() as libc::time_t,
            tv_nsec: deadline.subsec_nanos() as libc::c_long,
        };

        let rc = unsafe { libc::sem_timedwait(self.sem, &ts) };
        if rc == 0 {
            return Ok(Acquire::Acquired);
        }
        match Errno::last() {
            Errno::EINTR => Ok(Acquire::Interrupted),
            Errno::ETIMEDOUT => Ok(Acquire::TimedOut),
            errno => Err(SysError::new("sem_timedwait", errno)),
        }
    }

    /// Decrement without blocking; `false` if the count was zero
    pub fn try_wait(&self) -> Result<bool, SysError> {
        let rc = unsafe { libc::sem_trywait(self.sem) };
        if rc == 0 {
            return Ok(true);
        }
        match Errno::last() {
            Errno::EAGAIN => Ok(false),
            errno => Err(SysError::new("sem_trywait", errno)),
        }
    }

    /// Increment, waking one waiter
    pub fn post(&self) -> Result<(), SysError> {
        let rc = unsafe { libc::sem_post(self.sem) };
        if rc != 0 {
            return Err(SysError::last("sem_post"));
        }
        Ok(())
    }

    /// Current count (for diagnostics and tests)
    pub fn value(&self) -> Result<i32, SysError> {
        let mut value: libc::c_int = 0;
        let rc = unsafe { libc::sem_getvalue(self.sem, &mut value) };
        if rc != 0 {
            return Err(SysError::last("sem_getvalue"));
        }
        Ok(value)
    }

    /// Acquire as a mutex; released when the guard drops
    pub fn lock(&self) -> Result<SemGuard<'_>, SysError> {
        self.wait_uninterrupted()?;
        Ok(SemGuard { sem: self })
    }

    /// Remove the name from the system; open handles stay usable
    pub fn unlink(&self) -> Result<(), SysError> {
        let rc = unsafe { libc::sem_unlink(self.name.as_ptr()) };
        if rc != 0 {
            let errno = Errno::last();
            if errno != Errno::ENOENT {
                return Err(SysError::new("sem_unlink", errno));
            }
        }
        Ok(())
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

impl std::fmt::Debug for NamedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedSemaphore")
            .field("name", &self.name())
            .finish()
    }
}

/// Holds a semaphore acquired as a binary mutex
pub struct SemGuard<'a> {
    sem: &'a NamedSemaphore,
}

impl Drop for SemGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.sem.post() {
            warn!(semaphore = self.sem.name(), error = %e, "failed to release semaphore");
        }
    }
}
