//! Cooperative scheduler: coroutine lifecycle, cancellation, and
//! timer-driven suspension.
//!
//! Single logical thread of control: every coroutine launched through a
//! [`Runtime`] runs interleaved on the thread that owns it, switching only
//! at explicit suspension points ([`sleep_until`], [`sleep`], [`yield_now`])
//! or when a body returns. Cancellation is cooperative: [`close`] flags the
//! target and the flag is observed at the target's next suspension point. A
//! panic that escapes a coroutine body aborts the process; there is no
//! per-coroutine isolation.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::time::Duration;

use crate::arch::{self, Context};
use crate::clock::{Clock, MonotonicClock, Timestamp};
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleTable, ROOT_ID};
use crate::stack::{DEFAULT_STACK_SIZE, Stack};
use crate::timer::TimerQueue;

/// Ceiling on simultaneously open handles, bootstrap slot included.
const HANDLE_LIMIT: usize = 1 << 20;

/// Lifecycle state of a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    /// Currently executing on the runtime's thread.
    Running,
    /// In the ready queue, waiting for the running coroutine to suspend.
    Runnable,
    /// Waiting on a timer deadline or on another coroutine's termination.
    Blocked,
    /// Body returned; only the handle-table entry remains.
    Terminated,
}

/// Per-coroutine control state.
struct Coroutine {
    context: Context,
    stack: Stack,
    status: Status,
    /// Set by `close`; observed at the next suspension point.
    cancel_requested: bool,
    /// Token of the live timer-queue entry while sleeping.
    sleep_token: Option<u64>,
    /// Coroutine blocked in `close` waiting for this one to terminate.
    closer: Option<u32>,
    /// A close is finalizing this handle; later closes see InvalidHandle.
    closing: bool,
}

impl Coroutine {
    fn new(context: Context, stack: Stack) -> Self {
        Coroutine {
            context,
            stack,
            status: Status::Runnable,
            cancel_requested: false,
            sleep_token: None,
            closer: None,
            closing: false,
        }
    }

    /// Control block for the caller's own flow. Its registers are captured
    /// at the first switch away from it.
    fn host() -> Self {
        Coroutine {
            context: Context::default(),
            stack: Stack::Host,
            status: Status::Running,
            cancel_requested: false,
            sleep_token: None,
            closer: None,
            closing: false,
        }
    }
}

/// Whole scheduler state for one thread.
struct Sched {
    table: HandleTable<Coroutine>,
    ready: VecDeque<u32>,
    timers: TimerQueue,
    current: u32,
    clock: Box<dyn Clock>,
}

thread_local! {
    static SCHED: UnsafeCell<Option<Sched>> = const { UnsafeCell::new(None) };
}

/// Raw pointer to the thread's scheduler.
///
/// Raw rather than borrowed because a context switch needs the state
/// reachable from two coroutines at once, which the borrow checker cannot
/// express.
fn sched() -> *mut Sched {
    SCHED.with(|cell| match unsafe { (*cell.get()).as_mut() } {
        Some(s) => s as *mut Sched,
        None => panic!("no coroutine runtime active on this thread"),
    })
}

/// Control block for `id`.
///
/// # Safety
/// `s` must point at the live scheduler and `id` at an open slot; the
/// returned borrow must be dropped before any other table access.
unsafe fn coro_mut<'a>(s: *mut Sched, id: u32) -> &'a mut Coroutine {
    unsafe {
        (*s).table
            .get_mut(id)
            .expect("control block missing for live coroutine")
    }
}

/// Owner of a thread's scheduler state.
///
/// Create one per thread before launching coroutines; every operation in
/// this module works on the current thread's runtime. Dropping it tears the
/// scheduler down and asserts that every handle has been closed.
pub struct Runtime {
    /// The scheduler state is thread-local; keep the guard off other
    /// threads.
    _not_send: PhantomData<*const ()>,
}

impl Runtime {
    /// Create a runtime backed by the default monotonic clock.
    ///
    /// Panics if this thread already has an active runtime.
    pub fn new() -> Self {
        Self::with_clock(Box::new(MonotonicClock::new()))
    }

    /// Create a runtime reading time from `clock`.
    ///
    /// Panics if this thread already has an active runtime.
    pub fn with_clock(clock: Box<dyn Clock>) -> Self {
        SCHED.with(|cell| {
            let slot = unsafe { &mut *cell.get() };
            if slot.is_some() {
                panic!("coroutine runtime already active on this thread");
            }
            let mut table = HandleTable::new(HANDLE_LIMIT);
            table.insert_root(Coroutine::host());
            *slot = Some(Sched {
                table,
                ready: VecDeque::new(),
                timers: TimerQueue::new(),
                current: ROOT_ID,
                clock,
            });
        });
        tracing::debug!("coroutine runtime started");
        Runtime {
            _not_send: PhantomData,
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        SCHED.with(|cell| {
            let slot = unsafe { &mut *cell.get() };
            let Some(sched) = slot.take() else { return };
            let open = sched.table.open_handles();
            tracing::debug!(open, "coroutine runtime shut down");
            if open != 0 && !std::thread::panicking() {
                panic!("runtime dropped with {open} coroutine handle(s) still open");
            }
        });
    }
}

/// Launch a coroutine on a runtime-allocated stack.
///
/// The coroutine starts executing immediately; the call returns once it
/// first suspends or its body returns. On success the handle must
/// eventually be passed to [`close`]. Allocation failure is atomic: on
/// `Err` nothing was registered.
pub fn launch<F>(f: F) -> Result<Handle>
where
    F: FnOnce() + 'static,
{
    let stack = Stack::alloc(DEFAULT_STACK_SIZE)?;
    unsafe { launch_on(f, stack) }
}

/// Launch a coroutine on a caller-supplied stack.
///
/// Behaves like [`launch`] except that the runtime never frees the buffer:
/// it belongs to the caller before the launch and again the moment
/// [`close`] on the returned handle returns.
///
/// # Safety
/// `base..base + len` must be writable memory that nothing else reads or
/// writes until `close` has returned, and `len` must be large enough for
/// the coroutine body. The runtime cannot detect overflow of a
/// caller-supplied stack; undersizing it is undefined behavior.
pub unsafe fn launch_with_stack<F>(f: F, base: *mut u8, len: usize) -> Result<Handle>
where
    F: FnOnce() + 'static,
{
    unsafe { launch_on(f, Stack::Borrowed { base, len }) }
}

/// Shared launch path: register the control block, then switch straight
/// into the new coroutine. The launcher re-enters the ready queue at the
/// front, so it resumes as soon as the child first suspends or returns.
unsafe fn launch_on<F>(f: F, mut stack: Stack) -> Result<Handle>
where
    F: FnOnce() + 'static,
{
    let s = sched();
    unsafe {
        let top = stack.top();
        let f_ptr = Box::into_raw(Box::new(f));
        let context = Context::first_entry(top, coroutine_entry::<F> as usize, f_ptr as u64);

        let id = match (*s).table.insert(Coroutine::new(context, stack)) {
            Ok(id) => id,
            Err(err) => {
                // Atomic launch: reclaim the closure and leave no trace.
                drop(Box::from_raw(f_ptr));
                return Err(err);
            }
        };
        tracing::trace!(handle = id, "coroutine launched");

        let prev = (*s).current;
        coro_mut(s, prev).status = Status::Runnable;
        (*s).ready.push_front(prev);
        coro_mut(s, id).status = Status::Running;
        (*s).current = id;

        let save: *mut Context = &mut coro_mut(s, prev).context;
        let load: *const Context = &coro_mut(s, id).context;
        arch::switch(save, load);

        Ok(Handle(id))
    }
}

/// Entry trampoline for new coroutines.
///
/// The closure pointer arrives in a callee-saved register and must be read
/// before anything else can clobber it.
extern "C" fn coroutine_entry<F>()
where
    F: FnOnce() + 'static,
{
    let f = unsafe {
        let f_ptr = arch::entry_arg();
        Box::from_raw(f_ptr as *mut F)
    };
    f();

    finish_current();
}

/// Transition the running coroutine to Terminated, wake a pending closer,
/// and leave this context for good.
fn finish_current() -> ! {
    let s = sched();
    unsafe {
        let id = (*s).current;
        let coro = coro_mut(s, id);
        debug_assert!(coro.sleep_token.is_none());
        coro.status = Status::Terminated;
        let closer = coro.closer.take();
        if let Some(closer) = closer {
            wake(s, closer);
        }
        tracing::trace!(handle = id, "coroutine finished");
        // A Terminated coroutine never re-enters the ready queue, so this
        // switch never comes back.
        reschedule(s);
    }
    unreachable!("terminated coroutine was resumed");
}

/// Promote a blocked coroutine to the back of the ready queue.
unsafe fn wake(s: *mut Sched, id: u32) {
    let coro = unsafe { coro_mut(s, id) };
    debug_assert_eq!(coro.status, Status::Blocked);
    coro.status = Status::Runnable;
    unsafe { (*s).ready.push_back(id) };
}

/// Promote every coroutine whose deadline has passed, earliest first.
unsafe fn fire_due_timers(s: *mut Sched) {
    unsafe {
        let now = (*s).clock.now();
        for (id, seq) in (*s).timers.pop_due(now) {
            // A stale entry (sleep canceled, or the handle closed and maybe
            // reused) no longer matches the block's token; drop it.
            let Some(coro) = (*s).table.get_mut(id) else {
                continue;
            };
            if coro.sleep_token != Some(seq) || coro.status != Status::Blocked {
                continue;
            }
            coro.sleep_token = None;
            coro.status = Status::Runnable;
            (*s).ready.push_back(id);
            tracing::trace!(handle = id, "timer fired");
        }
    }
}

/// Core run-loop step: hand the thread to the next runnable coroutine.
///
/// Called with the current coroutine already parked — queued as Runnable
/// (yield), registered against a wake-up (Blocked), or Terminated. Returns
/// once this context is switched back into; never, for a terminated one.
/// While nothing is runnable the thread idles on the clock until the
/// nearest deadline.
unsafe fn reschedule(s: *mut Sched) {
    unsafe {
        loop {
            fire_due_timers(s);

            if let Some(next) = (*s).ready.pop_front() {
                let prev = (*s).current;
                if next == prev {
                    coro_mut(s, prev).status = Status::Running;
                    return;
                }
                coro_mut(s, next).status = Status::Running;
                (*s).current = next;

                let save: *mut Context = &mut coro_mut(s, prev).context;
                let load: *const Context = &coro_mut(s, next).context;
                arch::switch(save, load);

                // Back again: whoever resumed us already popped us from the
                // ready queue and made us current.
                return;
            }

            // Nothing runnable; wait out the nearest deadline.
            let Some(deadline) = (*s).timers.next_deadline() else {
                panic!("deadlock: every coroutine is blocked and no timer is pending");
            };
            (*s).clock.sleep_until(deadline);
        }
    }
}

/// Flag `id` for cancellation and, if it is parked on a timer, promote it
/// so the request is observed now instead of at the deadline.
unsafe fn request_cancel(s: *mut Sched, id: u32) {
    let coro = unsafe { coro_mut(s, id) };
    coro.cancel_requested = true;
    let was_sleeping = coro.sleep_token.take().is_some();
    if was_sleeping {
        debug_assert_eq!(coro.status, Status::Blocked);
        coro.status = Status::Runnable;
        unsafe { (*s).ready.push_back(id) };
    }
    tracing::trace!(handle = id, "cancellation requested");
}

/// Close a coroutine handle.
///
/// If the coroutine already terminated this releases the handle and, for a
/// runtime-allocated stack, the stack memory — nothing else. Otherwise it
/// requests cancellation, promotes the target out of any timed sleep, and
/// cooperatively drains the scheduler (other coroutines keep running) until
/// the target terminates before releasing. There is no timeout: a body that
/// never suspends and never returns blocks `close` forever.
///
/// Returns [`Error::InvalidHandle`] for a handle that was never issued or
/// has already been closed. Panics if `handle` names the calling coroutine
/// itself.
pub fn close(handle: Handle) -> Result<()> {
    let s = sched();
    unsafe {
        let id = handle.0;
        if id == (*s).current {
            panic!("a coroutine cannot close its own handle");
        }
        let Some(coro) = (*s).table.get_mut(id) else {
            return Err(Error::InvalidHandle);
        };
        if coro.closing {
            // Someone else is already finalizing this handle.
            return Err(Error::InvalidHandle);
        }
        coro.closing = true;
        let terminated = coro.status == Status::Terminated;

        if !terminated {
            request_cancel(s, id);

            let me = (*s).current;
            coro_mut(s, id).closer = Some(me);
            while coro_mut(s, id).status != Status::Terminated {
                coro_mut(s, me).status = Status::Blocked;
                reschedule(s);
            }
        }

        let coro = (*s)
            .table
            .remove(id)
            .expect("closed handle vanished while draining");
        // An Owned stack frees with the control block here; a Borrowed one
        // goes back to the caller untouched.
        drop(coro);
        tracing::trace!(handle = id, "handle closed");
        Ok(())
    }
}

/// Current runtime timestamp in milliseconds.
pub fn now() -> Timestamp {
    let s = sched();
    unsafe { (*s).clock.now() }
}

/// Suspend the calling coroutine until `deadline`.
///
/// Returns `Ok(())` once the deadline has passed, or [`Error::Canceled`] if
/// the coroutine was asked to close in the meantime — including before the
/// call, in which case it does not block at all. A deadline already in the
/// past still lets every already-runnable coroutine go first.
pub fn sleep_until(deadline: Timestamp) -> Result<()> {
    let s = sched();
    unsafe {
        let id = (*s).current;
        if coro_mut(s, id).cancel_requested {
            return Err(Error::Canceled);
        }

        let seq = (*s).timers.insert(deadline, id);
        let coro = coro_mut(s, id);
        coro.sleep_token = Some(seq);
        coro.status = Status::Blocked;
        reschedule(s);

        // Woken either by the deadline or cut short by close; both paths
        // cleared the token.
        let coro = coro_mut(s, id);
        debug_assert!(coro.sleep_token.is_none());
        if coro.cancel_requested {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }
}

/// Suspend the calling coroutine for `duration` from now.
pub fn sleep(duration: Duration) -> Result<()> {
    let deadline = now().saturating_add(duration.as_millis() as u64);
    sleep_until(deadline)
}

/// Yield the calling coroutine to the back of the ready queue.
///
/// Returns [`Error::Canceled`] instead of yielding — or after resuming —
/// once the coroutine is being closed.
pub fn yield_now() -> Result<()> {
    let s = sched();
    unsafe {
        let id = (*s).current;
        if coro_mut(s, id).cancel_requested {
            return Err(Error::Canceled);
        }

        coro_mut(s, id).status = Status::Runnable;
        (*s).ready.push_back(id);
        reschedule(s);

        if coro_mut(s, id).cancel_requested {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_clock::ManualClock;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn runtime() -> Runtime {
        Runtime::with_clock(Box::new(ManualClock::new()))
    }

    #[test]
    fn launch_dispatches_before_returning() {
        let rt = runtime();
        let ran = Rc::new(RefCell::new(false));
        let flag = ran.clone();

        let h = launch(move || *flag.borrow_mut() = true).unwrap();
        assert!(*ran.borrow());

        close(h).unwrap();
        drop(rt);
    }

    #[test]
    fn close_after_natural_finish_is_clean() {
        let rt = runtime();

        let h = launch(|| {}).unwrap();
        close(h).unwrap();

        // Idle the scheduler for a while; leftover state would surface as a
        // stray wake-up or a panic.
        sleep_until(now() + 100).unwrap();
        drop(rt);
    }

    #[test]
    fn close_unknown_or_closed_handle_fails() {
        let rt = runtime();

        let h = launch(|| {}).unwrap();
        close(h).unwrap();
        assert_eq!(close(h), Err(Error::InvalidHandle));

        drop(rt);
    }

    #[test]
    fn sleepers_wake_in_deadline_order() {
        let rt = runtime();
        let order = Rc::new(RefCell::new(Vec::new()));

        let mut handles = Vec::new();
        for (name, deadline) in [("late", 30u64), ("early", 10), ("mid", 20)] {
            let order = order.clone();
            handles.push(
                launch(move || {
                    sleep_until(deadline).unwrap();
                    order.borrow_mut().push(name);
                })
                .unwrap(),
            );
        }

        sleep_until(100).unwrap();
        assert_eq!(*order.borrow(), vec!["early", "mid", "late"]);

        for h in handles {
            close(h).unwrap();
        }
        drop(rt);
    }

    #[test]
    fn equal_deadlines_wake_in_launch_order() {
        let rt = runtime();
        let order = Rc::new(RefCell::new(Vec::new()));

        let mut handles = Vec::new();
        for name in ["a", "b", "c"] {
            let order = order.clone();
            handles.push(
                launch(move || {
                    sleep_until(10).unwrap();
                    order.borrow_mut().push(name);
                })
                .unwrap(),
            );
        }

        sleep_until(50).unwrap();
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);

        for h in handles {
            close(h).unwrap();
        }
        drop(rt);
    }

    #[test]
    fn close_cuts_a_sleep_short() {
        let rt = runtime();
        let outcome = Rc::new(RefCell::new(None));
        let seen = outcome.clone();

        let h = launch(move || {
            *seen.borrow_mut() = Some(sleep_until(1_000_000));
        })
        .unwrap();

        close(h).unwrap();
        assert_eq!(*outcome.borrow(), Some(Err(Error::Canceled)));
        // The closer never waited out the deadline.
        assert_eq!(now(), 0);

        drop(rt);
    }

    #[test]
    fn canceled_coroutine_fails_every_blocking_call() {
        let rt = runtime();
        let results = Rc::new(RefCell::new(Vec::new()));
        let seen = results.clone();

        let h = launch(move || {
            seen.borrow_mut().push(sleep_until(1_000_000));
            seen.borrow_mut().push(sleep_until(now() + 5));
            seen.borrow_mut().push(yield_now());
        })
        .unwrap();

        close(h).unwrap();
        assert_eq!(
            *results.borrow(),
            vec![
                Err(Error::Canceled),
                Err(Error::Canceled),
                Err(Error::Canceled)
            ]
        );

        drop(rt);
    }

    #[test]
    fn yield_interleaves_coroutines() {
        let rt = runtime();
        let trace = Rc::new(RefCell::new(Vec::new()));

        let mut handles = Vec::new();
        for name in ["a", "b"] {
            let trace = trace.clone();
            handles.push(
                launch(move || {
                    for round in 0..2 {
                        trace.borrow_mut().push((name, round));
                        yield_now().unwrap();
                    }
                })
                .unwrap(),
            );
        }

        // Let both run to completion.
        sleep_until(now() + 1).unwrap();
        assert_eq!(
            *trace.borrow(),
            vec![("a", 0), ("b", 0), ("a", 1), ("b", 1)]
        );

        for h in handles {
            close(h).unwrap();
        }
        drop(rt);
    }

    #[test]
    fn borrowed_stack_runs_and_is_left_to_the_caller() {
        let rt = runtime();
        let ran = Rc::new(RefCell::new(false));
        let flag = ran.clone();

        let mut stack = vec![0u8; DEFAULT_STACK_SIZE];
        let h = unsafe {
            launch_with_stack(
                move || {
                    sleep_until(10).unwrap();
                    *flag.borrow_mut() = true;
                },
                stack.as_mut_ptr(),
                stack.len(),
            )
        }
        .unwrap();

        sleep_until(50).unwrap();
        close(h).unwrap();
        assert!(*ran.borrow());
        drop(stack);

        drop(rt);
    }

    #[test]
    fn handles_are_not_reused_while_open() {
        let rt = runtime();

        let a = launch(|| {}).unwrap();
        let b = launch(|| {}).unwrap();
        assert_ne!(a, b);

        close(a).unwrap();
        close(b).unwrap();
        drop(rt);
    }

    #[test]
    fn coroutines_can_launch_and_close_coroutines() {
        let rt = runtime();
        let order = Rc::new(RefCell::new(Vec::new()));

        let outer_order = order.clone();
        let h = launch(move || {
            let inner_order = outer_order.clone();
            let inner = launch(move || {
                inner_order.borrow_mut().push("inner");
            })
            .unwrap();
            outer_order.borrow_mut().push("outer");
            close(inner).unwrap();
        })
        .unwrap();

        close(h).unwrap();
        assert_eq!(*order.borrow(), vec!["inner", "outer"]);
        drop(rt);
    }

    #[test]
    fn root_flow_can_sleep() {
        let rt = runtime();
        let before = now();
        sleep_until(before + 25).unwrap();
        assert!(now() >= before + 25);
        drop(rt);
    }

    #[test]
    #[should_panic(expected = "no coroutine runtime active")]
    fn operations_require_a_runtime() {
        let _ = now();
    }

    #[test]
    #[should_panic(expected = "already active")]
    fn one_runtime_per_thread() {
        let _rt = runtime();
        let _second = runtime();
    }

    #[test]
    #[should_panic(expected = "still open")]
    fn teardown_asserts_all_handles_closed() {
        let rt = runtime();
        let _h = launch(|| {
            let _ = sleep_until(1_000_000);
        })
        .unwrap();
        drop(rt);
    }
}
