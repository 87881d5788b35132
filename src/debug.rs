/* fairsched debug console output code
 *
 * debug text is queued under its own lock and drained out to the host's
 * console by housekeeping, so the scheduler never blocks on a slow
 * output device while it holds a cell lock
 *
 * (c) Chris Williams, 2025-2026.
 *
 * See LICENSE for usage and copying.
 */

#![allow(unused_imports)]

use core::fmt;
use spin::Mutex;
use alloc::string::String;

lazy_static!
{
    pub static ref DEBUG_LOCK: Mutex<bool> = Mutex::new(false);
    static ref DEBUG_QUEUE: Mutex<String> = Mutex::new(String::new());
}

/* top level debug macros */
/* useful messages */
#[macro_export]
macro_rules! hvlog
{
    ($fmt:expr) => (hvprintln!("[+] {}", $fmt));
    ($fmt:expr, $($arg:tt)*) => (hvprintln!(concat!("[+] ", $fmt), $($arg)*));
}

/* bad news: bug detection, failures, etc. */
#[macro_export]
macro_rules! hvalert
{
    ($fmt:expr) => (hvprintln!("[!] {}", $fmt));
    ($fmt:expr, $($arg:tt)*) => (hvprintln!(concat!("[!] ", $fmt), $($arg)*));
}

/* only output if debug build is enabled */
#[macro_export]
#[cfg(debug_assertions)]
macro_rules! hvdebug
{
    ($fmt:expr) => (hvprintln!("[?] {}", $fmt));
    ($fmt:expr, $($arg:tt)*) => (hvprintln!(concat!("[?] ", $fmt), $($arg)*));
}

/* silence debug if disabled */
#[macro_export]
#[cfg(not(debug_assertions))]
macro_rules! hvdebug
{
    ($fmt:expr) => ({});
    ($fmt:expr, $($arg:tt)*) => ({});
}

/* low-level macros for hypervisor-only hvprintln and hvprint debug output routines */
macro_rules! hvprintln
{
    ($fmt:expr) => (hvprint!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => (hvprint!(concat!($fmt, "\n"), $($arg)*));
}

macro_rules! hvprint
{
    ($($arg:tt)*) =>
    ({
        use core::fmt::Write;
        {
            /* we do this little lock dance to ensure the lock isn't immediately dropped by rust */
            let mut lock = $crate::debug::DEBUG_LOCK.lock();
            *lock = true;

            let mut writer = $crate::debug::ConsoleWriter;
            let _ = writer.write_fmt(format_args!($($arg)*));

            *lock = false;
            drop(lock);
        }
    });
}

macro_rules! debughousekeeper
{
    () => ($crate::debug::drain_queue());
}

/* create a generic debug console writer */
pub struct ConsoleWriter;

impl fmt::Write for ConsoleWriter
{
    fn write_str(&mut self, s: &str) -> core::fmt::Result
    {
        /* queue debug output so it can be printed when free to do so */
        DEBUG_QUEUE.lock().push_str(s);
        Ok(())
    }
}

/* attempt to empty the queue out to whatever console this build has.
   hosted (test) builds drain to the process's stdout. bare-metal
   integrations pull the text themselves via drain_queue_into() */
#[cfg(test)]
pub fn drain_queue()
{
    let mut queue = DEBUG_QUEUE.lock();
    std::print!("{}", &*queue);
    queue.clear();
}

#[cfg(not(test))]
pub fn drain_queue() {}

/* hand the queued debug text to the caller, clearing the queue
   => target = string to append the queued output to */
pub fn drain_queue_into(target: &mut String)
{
    let mut queue = DEBUG_QUEUE.lock();
    target.push_str(&queue);
    queue.clear();
}
