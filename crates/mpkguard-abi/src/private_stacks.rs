//! Private run stacks of untrusted threads.
//!
//! A stack handed to `pthread_attr_setstack` stays in use until its thread
//! has fully exited, and only a join observes that. Every private stack is
//! therefore started joinable and tracked here. A joined thread gives its
//! stack back right after the join. A thread its creator wanted detached is
//! marked by the domain key destructor on its way out and joined on its
//! behalf by the next thread creation or join.

use std::ptr;

use mpkguard_membrane::diag;
use mpkguard_membrane::diag::LogLevel;
use mpkguard_membrane::spin::SpinLock;
use mpkguard_membrane::{AllocatorBackend, IsolationError, IsolationResult};

use crate::runtime_state::{self, IsolationRuntime};

struct StackRecord {
    /// Set by the creator once the real `pthread_create` returned.
    thread: Option<libc::pthread_t>,
    base: *mut u8,
    size: usize,
    /// Nobody will join this thread, so the runtime does.
    detached: bool,
    /// The domain key destructor has run on this thread.
    exited: bool,
    next: *mut StackRecord,
}

impl StackRecord {
    fn contains(&self, addr: usize) -> bool {
        let base = self.base as usize;
        addr >= base && addr - base < self.size
    }

    fn reclaimable(&self) -> bool {
        self.detached && self.exited && self.thread.is_some()
    }
}

struct RecordList {
    head: *mut StackRecord,
}

// SAFETY: records are only reached through the lock.
unsafe impl Send for RecordList {}

impl RecordList {
    /// First linked record matching `pred`, or null.
    fn find(&self, mut pred: impl FnMut(&StackRecord) -> bool) -> *mut StackRecord {
        let mut cursor = self.head;
        // SAFETY: every linked record is a live block owned by the list.
        unsafe {
            while !cursor.is_null() && !pred(&*cursor) {
                cursor = (*cursor).next;
            }
        }
        cursor
    }

    /// Unlink and return the first record matching `pred`.
    fn unlink(
        &mut self,
        mut pred: impl FnMut(&StackRecord) -> bool,
    ) -> Option<*mut StackRecord> {
        let mut link: *mut *mut StackRecord = &mut self.head;
        // SAFETY: as in `find`.
        unsafe {
            while !(*link).is_null() {
                let record = *link;
                if pred(&*record) {
                    *link = (*record).next;
                    return Some(record);
                }
                link = &mut (*record).next;
            }
        }
        None
    }

    fn count(&self, mut pred: impl FnMut(&StackRecord) -> bool) -> usize {
        let mut total = 0;
        let mut cursor = self.head;
        // SAFETY: as in `find`.
        unsafe {
            while !cursor.is_null() {
                if pred(&*cursor) {
                    total += 1;
                }
                cursor = (*cursor).next;
            }
        }
        total
    }
}

static RECORDS: SpinLock<RecordList> = SpinLock::new(RecordList {
    head: ptr::null_mut(),
});

fn current_stack_address() -> usize {
    let marker = 0_u8;
    ptr::addr_of!(marker) as usize
}

/// A stack registered before its thread starts.
#[derive(Debug)]
pub(crate) struct Tracked(*mut StackRecord);

/// Track `[base, base + size)` ahead of starting a thread on it.
pub(crate) fn track(
    runtime: &IsolationRuntime,
    base: *mut u8,
    size: usize,
    detached: bool,
) -> IsolationResult<Tracked> {
    let len = std::mem::size_of::<StackRecord>();
    let record = runtime.backends().safe().allocate(len).cast::<StackRecord>();
    if record.is_null() {
        return Err(IsolationError::OutOfMemory {
            what: "stack record",
            size: len,
        });
    }
    let mut list = RECORDS.lock();
    // SAFETY: fresh block sized for a StackRecord.
    unsafe {
        record.write(StackRecord {
            thread: None,
            base,
            size,
            detached,
            exited: false,
            next: list.head,
        });
    }
    list.head = record;
    Ok(Tracked(record))
}

impl Tracked {
    /// The thread is running; remember its handle.
    pub(crate) fn started(self, thread: libc::pthread_t) {
        let _list = RECORDS.lock();
        // SAFETY: a record is only unlinked after a join, which needs the
        // handle stored here.
        unsafe { (*self.0).thread = Some(thread) };
    }

    /// The thread never started. The stack itself stays with the caller.
    pub(crate) fn abandon(self, runtime: &IsolationRuntime) {
        let record = RECORDS.lock().unlink(|r| ptr::eq(r, self.0));
        if let Some(record) = record {
            // SAFETY: unlinked, so nothing else reaches it.
            unsafe { runtime.backends().safe().deallocate(record.cast()) };
        }
    }
}

/// Note that the calling thread is exiting. Runs from the domain key
/// destructor, still on the thread's own stack.
pub(crate) fn mark_exiting() {
    let here = current_stack_address();
    let list = RECORDS.lock();
    let record = list.find(|r| r.contains(here));
    if !record.is_null() {
        // SAFETY: linked record, guarded by the lock.
        unsafe { (*record).exited = true };
    }
}

/// Take over `pthread_detach` for a tracked thread. Returns `false` when
/// `thread` is not tracked and the real call has to be made.
pub(crate) fn detach(thread: libc::pthread_t) -> bool {
    // SAFETY: pthread_self has no preconditions.
    let is_self = unsafe { libc::pthread_equal(thread, libc::pthread_self()) } != 0;
    let here = current_stack_address();
    let list = RECORDS.lock();
    // A child detaching itself may run before its creator stored the handle.
    let record = list.find(|r| {
        !r.detached && (r.thread == Some(thread) || (is_self && r.contains(here)))
    });
    if record.is_null() {
        return false;
    }
    // SAFETY: linked record, guarded by the lock.
    unsafe { (*record).detached = true };
    true
}

/// # Safety
///
/// `record` is unlinked and its thread has been joined.
unsafe fn release(runtime: &IsolationRuntime, record: *mut StackRecord) {
    // SAFETY: caller contract; the stack is no longer in use.
    unsafe {
        let (base, size) = ((*record).base, (*record).size);
        diag!(LogLevel::Debug, "private stack {base:p}+{size:#x} released");
        runtime.backends().unsafe_backend().deallocate(base);
        runtime.backends().safe().deallocate(record.cast());
    }
}

/// `thread` was joined by its owner; give back its stack if it had one.
pub(crate) fn joined(runtime: &IsolationRuntime, thread: libc::pthread_t) {
    let record = RECORDS
        .lock()
        .unlink(|r| !r.detached && r.thread == Some(thread));
    if let Some(record) = record {
        // SAFETY: unlinked and joined.
        unsafe { release(runtime, record) };
    }
}

/// Join detached threads that have passed their key destructor and give
/// back their stacks.
pub(crate) fn reclaim(runtime: &IsolationRuntime) {
    // SAFETY: pthread_self has no preconditions.
    let me = unsafe { libc::pthread_self() };
    loop {
        let Some(record) = RECORDS
            .lock()
            .unlink(|r| r.reclaimable() && r.thread != Some(me))
        else {
            return;
        };
        // SAFETY: reclaimable records hold the handle of a joinable thread
        // that nothing else joins.
        unsafe {
            let Some(thread) = (*record).thread else {
                continue;
            };
            let rc = (runtime.real_pthread_join())(thread, ptr::null_mut());
            if rc == 0 {
                release(runtime, record);
            } else {
                diag!(
                    LogLevel::Warn,
                    "unable to join exited thread (code {rc}); keeping its stack"
                );
                runtime.backends().safe().deallocate(record.cast());
            }
        }
    }
}

/// Private stacks whose thread has not been joined yet.
#[must_use]
pub fn tracked_stacks() -> usize {
    RECORDS.lock().count(|_| true)
}

/// Tracked stacks ready for [`reclaim_exited`].
#[must_use]
pub fn exited_stacks() -> usize {
    RECORDS.lock().count(StackRecord::reclaimable)
}

/// Reclaim the stacks of exited detached threads now.
pub fn reclaim_exited() {
    reclaim(runtime_state::runtime());
}
