/* fairsched locking primitives
 *
 * Provides a standard spin lock, a named mutex, and a sequence lock
 * for publishing small copyable values to lock-free readers.
 *
 * The mutex is named to aid debugging and keeps acquisition stats.
 * A lock() call that spins past a generous threshold is reported as
 * a likely deadlock. try_lock() exists for paths that must never
 * stall on a contended lock, such as the remote-cell scan in the
 * dispatcher.
 *
 * The sequence lock follows the usual versioned scheme: the writer
 * bumps the version to odd, updates the payload, bumps it to even.
 * Readers retry while the version is odd or changed underneath them.
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

/* if a lock() call spins more than DEADLOCK_THRESHOLD times
   then it's considered a deadlocked mutex */
const DEADLOCK_THRESHOLD: usize = 1000000;

/* define a spin lock primitive */
pub struct SpinLock
{
    lock: AtomicBool
}

impl SpinLock
{
    pub const fn new() -> SpinLock
    {
        SpinLock { lock: AtomicBool::new(false) }
    }

    /* acquire the lock, and block until successful */
    pub fn lock(&self)
    {
        loop
        {
            if self.try_lock() == true
            {
                return;
            }

            while self.lock.load(Ordering::Relaxed) == true
            {
                core::hint::spin_loop();
            }
        }
    }

    /* attempt to acquire the lock exactly once
       <= true if the lock was acquired, false if it was already held */
    pub fn try_lock(&self) -> bool
    {
        self.lock.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed) == Ok(false)
    }

    /* release the lock */
    pub fn unlock(&self)
    {
        self.lock.store(false, Ordering::Release);
    }
}

pub struct Mutex<T>
{
    /* the data we're protecting */
    content: UnsafeCell<T>,

    /* the hold flag: true while some caller owns the content */
    held: SpinLock,

    /* accounting */
    lock_attempts: AtomicUsize,
    lock_count: AtomicUsize,
    description: &'static str
}

/* Mutex uses the same API shape as std's Mutex. Create a Mutex using new() and then
   call lock() to block until the mutex is successfully acquired. Drop the guard to release */
impl<T> Mutex<T>
{
    pub const fn new(description: &'static str, data: T) -> Mutex<T>
    {
        Mutex
        {
            content: UnsafeCell::new(data),
            held: SpinLock::new(),
            lock_attempts: AtomicUsize::new(0),
            lock_count: AtomicUsize::new(0),
            description
        }
    }

    /* spin until ready to return a reference to the protected data */
    pub fn lock(&self) -> MutexGuard<'_, T>
    {
        let mut attempts = 0;

        loop
        {
            self.lock_attempts.fetch_add(1, Ordering::Relaxed);
            attempts = attempts + 1;
            if attempts == DEADLOCK_THRESHOLD
            {
                hvalert!("BUG: {} mutex ({:p}) may be deadlocked", self.description, &self.content);
            }

            if self.held.try_lock() == true
            {
                break;
            }
        }

        self.lock_count.fetch_add(1, Ordering::Relaxed);
        MutexGuard { mutex: &self }
    }

    /* make exactly one attempt to acquire the mutex, returning None if it is
       already held. used where stalling on contention is worse than skipping
       the work, such as scanning a remote cell's queues */
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>>
    {
        self.lock_attempts.fetch_add(1, Ordering::Relaxed);
        if self.held.try_lock() == true
        {
            self.lock_count.fetch_add(1, Ordering::Relaxed);
            return Some(MutexGuard { mutex: &self });
        }
        None
    }

    /* unlock the mutex */
    fn unlock(&self)
    {
        self.held.unlock();
    }

    /* return true if the mutex is locked, or false if not */
    pub fn is_locked(&self) -> bool
    {
        if self.held.try_lock() == true
        {
            self.held.unlock();
            return false;
        }
        true
    }

    /* return the mutex's name, for diagnostics */
    pub fn name(&self) -> &'static str { self.description }
}

/* pretty print a mutex's stats */
impl<T> core::fmt::Debug for MutexGuard<'_, T>
{
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result
    {
        write!(f, "{} attempts to acquire {}, {} succeeded",
            self.mutex.lock_attempts.load(Ordering::Relaxed),
            self.mutex.description,
            self.mutex.lock_count.load(Ordering::Relaxed))
    }
}

pub struct MutexGuard<'a, T>
{
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T>
{
    type Target = T;

    fn deref(&self) -> &Self::Target
    {
        unsafe { &*self.mutex.content.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T>
{
    fn deref_mut(&mut self) -> &mut Self::Target
    {
        unsafe { &mut *self.mutex.content.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T>
{
    fn drop(&mut self)
    {
        self.mutex.unlock()
    }
}

/* keep rustc happy */
unsafe impl<T> Send for Mutex<T> where T: Send {}
unsafe impl<T> Sync for Mutex<T> where T: Send {}
unsafe impl<T> Send for MutexGuard<'_, T> where T: Send {}
unsafe impl<T> Sync for MutexGuard<'_, T> where T: Send + Sync {}

/* publish a small copyable value to readers that must not take a lock.
   the writer must provide its own mutual exclusion: in this scheduler
   every seqlock writer already holds the relevant cell or tree lock */
pub struct SeqLock<T: Copy>
{
    version: AtomicUsize,
    content: UnsafeCell<T>
}

impl<T: Copy> SeqLock<T>
{
    pub const fn new(data: T) -> SeqLock<T>
    {
        SeqLock
        {
            version: AtomicUsize::new(0),
            content: UnsafeCell::new(data)
        }
    }

    /* update the protected value. caller must hold the writer-side lock */
    pub fn write(&self, data: T)
    {
        self.version.fetch_add(1, Ordering::Release);
        unsafe { *self.content.get() = data };
        self.version.fetch_add(1, Ordering::Release);
    }

    /* read a consistent copy of the protected value without locking.
       loops until the writer is out of the way */
    pub fn read(&self) -> T
    {
        loop
        {
            let started = self.version.load(Ordering::Acquire);
            if started & 1 != 0
            {
                core::hint::spin_loop();
                continue;
            }

            let copied = unsafe { *self.content.get() };

            if self.version.load(Ordering::Acquire) == started
            {
                return copied;
            }
        }
    }
}

unsafe impl<T: Copy + Send> Send for SeqLock<T> {}
unsafe impl<T: Copy + Send> Sync for SeqLock<T> {}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn mutex_lock_and_release()
    {
        let m = Mutex::new("test mutex", 1usize);

        {
            let mut guard = m.lock();
            *guard = 2;
            assert_eq!(m.is_locked(), true);
        }

        assert_eq!(m.is_locked(), false);
        assert_eq!(*m.lock(), 2);
    }

    #[test]
    fn mutex_try_lock_contention()
    {
        let m = Mutex::new("test mutex", 0usize);

        let first = m.try_lock();
        assert!(first.is_some());
        assert!(m.try_lock().is_none());

        drop(first);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn seqlock_read_back()
    {
        let s = SeqLock::new((1u64, 2u64));
        assert_eq!(s.read(), (1, 2));

        s.write((3, 4));
        assert_eq!(s.read(), (3, 4));
    }
}
