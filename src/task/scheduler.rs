//! Task list, ready queue, and round-robin-with-quantum scheduler (§4.6).

use super::context::{build_initial_stack, switch};
use crate::config::{DEFAULT_QUANTUM_TICKS, KERNEL_STACK_FRAMES};
use crate::memory::{frame_allocator, paging};
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use conquer_once::spin::OnceCell;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    New,
    Ready,
    Running,
    Blocked,
    Terminated,
}

struct Task {
    name: String,
    state: TaskState,
    #[allow(dead_code)]
    priority: u8,
    stack_base: VirtAddr,
    stack_size: usize,
    saved_sp: u64,
    entry: extern "C" fn() -> !,
    /// Cleared after the task's first dispatch; tells the tick/terminate
    /// paths whether `task_trampoline` still needs arming before switching
    /// in, since a never-run task's stack has no prior `context_switch`
    /// frame to resume into.
    first_run: bool,
    quantum_max: u32,
    quantum_used: u32,
}

struct Scheduler {
    tasks: BTreeMap<TaskId, Task>,
    ready_queue: VecDeque<TaskId>,
    current: Option<TaskId>,
}

impl Scheduler {
    fn new() -> Self {
        Scheduler {
            tasks: BTreeMap::new(),
            ready_queue: VecDeque::new(),
            current: None,
        }
    }
}

static SCHEDULER: OnceCell<Mutex<Scheduler>> = OnceCell::uninit();

/// Entry point of the task about to run, read by `task_trampoline` right
/// after the very first switch into it — there is no register convention
/// to pass it directly, since `context_switch` takes no arguments on entry.
static PENDING_ENTRY: Mutex<Option<extern "C" fn() -> !>> = Mutex::new(None);

const IDLE_STACK_SIZE: usize = KERNEL_STACK_FRAMES * frame_allocator::FRAME_SIZE as usize;

extern "C" fn idle_entry() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Allocate and map a fresh kernel stack. Returns `(base, size)`.
fn allocate_stack(size: usize) -> (VirtAddr, usize) {
    let frames = (size + frame_allocator::FRAME_SIZE as usize - 1) / frame_allocator::FRAME_SIZE as usize;
    let phys = frame_allocator::alloc_frames(frames).expect("out of memory allocating task stack");
    // This core has no per-task address space (single address space,
    // §1 non-goals), so task stacks are simply mapped through the HHDM.
    let base = paging::phys_to_virt(phys);
    for i in 0..frames {
        let virt = base + (i as u64 * frame_allocator::FRAME_SIZE);
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
        paging::map_page(virt, phys + (i as u64 * frame_allocator::FRAME_SIZE), flags);
    }
    (base, frames * frame_allocator::FRAME_SIZE as usize)
}

extern "C" fn task_trampoline() -> ! {
    unsafe {
        x86_64::instructions::interrupts::enable();
    }
    let entry = PENDING_ENTRY.lock().take().expect("task_trampoline: no pending entry");
    entry();
    terminate_current();
}

/// Seed the scheduler with the always-ready idle task so `current_task` is
/// never `None` once bringup completes (§4.6 implementation note).
pub fn init() {
    SCHEDULER
        .try_init_once(|| Mutex::new(Scheduler::new()))
        .map_err(|_| ())
        .expect("scheduler already initialized");

    let id = create_internal("idle", 0, idle_entry, IDLE_STACK_SIZE);
    let sched_lock = SCHEDULER.try_get().unwrap();
    let mut sched = sched_lock.lock();
    sched.current = Some(id);
    let task = sched.tasks.get_mut(&id).unwrap();
    task.state = TaskState::Running;
    task.first_run = false;

    log::info!("scheduler: initialized with idle task");
}

/// Allocate a TCB and stack and insert into the task table as `New`,
/// without touching the ready queue (§4.6 Create).
fn create_internal(name: &str, priority: u8, entry: extern "C" fn() -> !, stack_size: usize) -> TaskId {
    let (stack_base, stack_size) = allocate_stack(stack_size);
    let stack_top = (stack_base.as_u64() + stack_size as u64) & !0xF;
    let saved_sp = unsafe { build_initial_stack(stack_top, task_trampoline) };

    let id = TaskId::next();
    let task = Task {
        name: String::from(name),
        state: TaskState::New,
        priority,
        stack_base,
        stack_size,
        saved_sp,
        entry,
        first_run: true,
        quantum_max: DEFAULT_QUANTUM_TICKS,
        quantum_used: 0,
    };

    let sched = SCHEDULER.try_get().expect("scheduler::init not called");
    let mut sched = sched.lock();
    sched.tasks.insert(id, task);
    id
}

/// Create a new task control block and stack, without scheduling it to run
/// (§4.6 Create). Call [`schedule_add`] to admit it to the ready queue.
pub fn create(name: &str, priority: u8, entry: extern "C" fn() -> !) -> TaskId {
    create_internal(name, priority, entry, IDLE_STACK_SIZE)
}

/// Admit `id` to the ready queue. Valid from `New` (a just-created task's
/// first admission) or `Blocked` (an unblocked task rejoining the rotation);
/// a no-op for any other state (already `Ready`/`Running`, or `Terminated`).
pub fn schedule_add(id: TaskId) {
    let Ok(lock) = SCHEDULER.try_get() else { return };
    let mut sched = lock.lock();
    let Some(task) = sched.tasks.get_mut(&id) else { return };
    match task.state {
        TaskState::New | TaskState::Blocked => {
            task.state = TaskState::Ready;
            sched.ready_queue.push_back(id);
        }
        TaskState::Ready | TaskState::Running | TaskState::Terminated => {}
    }
}

/// Create a new task and add it to the ready queue in one step (§4.6
/// Create). Equivalent to [`create`] followed by [`schedule_add`].
pub fn spawn(name: &str, priority: u8, entry: extern "C" fn() -> !) -> TaskId {
    let id = create(name, priority, entry);
    schedule_add(id);
    id
}

pub fn current_task() -> Option<TaskId> {
    SCHEDULER.try_get().ok().and_then(|s| s.lock().current)
}

pub fn task_name(id: TaskId) -> Option<String> {
    SCHEDULER.try_get().ok().and_then(|s| s.lock().tasks.get(&id).map(|t| t.name.clone()))
}

fn arm_trampoline(entry: extern "C" fn() -> !) {
    *PENDING_ENTRY.lock() = Some(entry);
}

/// Dispatch to `next_id`: flip bookkeeping, arm the trampoline if this is
/// its first run, and return the raw stack pointers `context::switch` needs.
fn prepare_dispatch(sched: &mut Scheduler, current_id: TaskId, next_id: TaskId) -> (*mut u64, u64) {
    let next = sched.tasks.get_mut(&next_id).unwrap();
    next.state = TaskState::Running;
    let first_run = next.first_run;
    next.first_run = false;
    let entry = next.entry;
    let new_sp = next.saved_sp;

    sched.current = Some(next_id);
    if first_run {
        arm_trampoline(entry);
    }

    let old_sp_slot = &mut sched.tasks.get_mut(&current_id).unwrap().saved_sp as *mut u64;
    (old_sp_slot, new_sp)
}

/// Scheduler tick, called from the timer handler (§4.6). If no current
/// task, do nothing; otherwise advance the quantum counter and, on
/// expiry, round-robin to the next ready task.
pub fn tick() {
    let Ok(lock) = SCHEDULER.try_get() else { return };

    let switch_args: Option<(*mut u64, u64)> = {
        let mut sched = lock.lock();
        let Some(current_id) = sched.current else { return };

        let quantum_max = sched.tasks.get(&current_id).map(|t| t.quantum_max).unwrap_or(u32::MAX);
        let used = {
            let t = sched.tasks.get_mut(&current_id).expect("current task missing from task list");
            t.quantum_used += 1;
            t.quantum_used
        };
        if used < quantum_max {
            None
        } else if let Some(next_id) = sched.ready_queue.pop_front() {
            let cur = sched.tasks.get_mut(&current_id).unwrap();
            cur.quantum_used = 0;
            cur.state = TaskState::Ready;
            sched.ready_queue.push_back(current_id);
            Some(prepare_dispatch(&mut sched, current_id, next_id))
        } else {
            None // no other ready task: keep running, no preemption without work
        }
    };

    if let Some((old_sp_slot, new_sp)) = switch_args {
        unsafe {
            switch(old_sp_slot, new_sp);
        }
    }
}

/// Remove the current task from scheduling entirely (§4.6 Destroy), freeing
/// its stack and TCB. Never returns to the caller.
pub fn terminate_current() -> ! {
    let lock = SCHEDULER.try_get().unwrap_or_else(|_| crate::hlt_loop());
    let new_sp: u64;
    {
        let mut sched = lock.lock();
        let id = sched.current.expect("terminate_current: no current task");
        let next_id = loop {
            if let Some(n) = sched.ready_queue.pop_front() {
                break n;
            }
            crate::hlt_loop(); // idle itself terminated: nothing left to run
        };
        if let Some(task) = sched.tasks.remove(&id) {
            if let Some(phys) = paging::translate(task.stack_base) {
                frame_allocator::free_frames(phys, task.stack_size / frame_allocator::FRAME_SIZE as usize);
            }
        }
        let next = sched.tasks.get_mut(&next_id).unwrap();
        next.state = TaskState::Running;
        let first_run = next.first_run;
        next.first_run = false;
        let entry = next.entry;
        new_sp = next.saved_sp;
        sched.current = Some(next_id);
        if first_run {
            arm_trampoline(entry);
        }
    }
    static mut SCRATCH_SP: u64 = 0;
    unsafe {
        switch(core::ptr::addr_of_mut!(SCRATCH_SP), new_sp);
    }
    unreachable!("terminated task resumed")
}

/// Remove an arbitrary task from scheduling, freeing its stack and TCB
/// (§4.6 Destroy). Terminating the current task diverges the same way
/// [`terminate_current`] does; terminating any other task returns normally.
pub fn terminate(id: TaskId) {
    if current_task() == Some(id) {
        terminate_current();
    }
    let Ok(lock) = SCHEDULER.try_get() else { return };
    let mut sched = lock.lock();
    sched.ready_queue.retain(|t| *t != id);
    if let Some(task) = sched.tasks.remove(&id) {
        if let Some(phys) = paging::translate(task.stack_base) {
            frame_allocator::free_frames(phys, task.stack_size / frame_allocator::FRAME_SIZE as usize);
        }
    }
}

/// Move the current task to `Blocked` and dispatch to the next ready task.
/// A no-op if no other task is ready to run (blocking would stall the CPU
/// with nothing left to dispatch).
pub fn block_current() {
    let Ok(lock) = SCHEDULER.try_get() else { return };
    let switch_args: Option<(*mut u64, u64)> = {
        let mut sched = lock.lock();
        let Some(current_id) = sched.current else { return };
        let Some(next_id) = sched.ready_queue.pop_front() else {
            return;
        };
        sched.tasks.get_mut(&current_id).unwrap().state = TaskState::Blocked;
        Some(prepare_dispatch(&mut sched, current_id, next_id))
    };
    if let Some((old_sp_slot, new_sp)) = switch_args {
        unsafe {
            switch(old_sp_slot, new_sp);
        }
    }
}

/// Move a `Blocked` task back onto the ready queue. A no-op if `id` is not
/// currently blocked.
pub fn unblock(id: TaskId) {
    let Ok(lock) = SCHEDULER.try_get() else { return };
    {
        let sched = lock.lock();
        if sched.tasks.get(&id).map(|t| t.state) != Some(TaskState::Blocked) {
            return;
        }
    }
    schedule_add(id);
}

#[cfg(feature = "testing")]
pub fn task_count() -> usize {
    SCHEDULER.try_get().map(|s| s.lock().tasks.len()).unwrap_or(0)
}

#[cfg(feature = "testing")]
pub fn ready_len() -> usize {
    SCHEDULER.try_get().map(|s| s.lock().ready_queue.len()).unwrap_or(0)
}
