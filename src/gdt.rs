//! Segment table and task-state segment (§4.4).
//!
//! Five user-visible segments (null, kernel code/data, user code/data) plus
//! the TSS, which carries `rsp0` and seven IST slots, one per category of
//! exception that needs a guaranteed-good stack to land on.

use conquer_once::spin::OnceCell;
use core::sync::atomic::{AtomicPtr, Ordering};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

pub const DEBUG_IST_INDEX: u16 = 0;
pub const NMI_IST_INDEX: u16 = 1;
pub const DOUBLE_FAULT_IST_INDEX: u16 = 2;
pub const MACHINE_CHECK_IST_INDEX: u16 = 3;
pub const STACK_FAULT_IST_INDEX: u16 = 4;
pub const GENERAL_PROTECTION_IST_INDEX: u16 = 5;
pub const GENERIC_IST_INDEX: u16 = 6;

const IST_STACK_SIZE: usize = 4096 * 5;
const NUM_IST_STACKS: usize = 7;

static mut IST_STACKS: [[u8; IST_STACK_SIZE]; NUM_IST_STACKS] = [[0; IST_STACK_SIZE]; NUM_IST_STACKS];

static TSS: OnceCell<TaskStateSegment> = OnceCell::uninit();
static GDT: OnceCell<(GlobalDescriptorTable, Selectors)> = OnceCell::uninit();
static TSS_PTR: AtomicPtr<TaskStateSegment> = AtomicPtr::new(core::ptr::null_mut());

struct Selectors {
    code_selector: SegmentSelector,
    data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
    user_code_selector: SegmentSelector,
    user_data_selector: SegmentSelector,
}

pub fn init() {
    use x86_64::instructions::segmentation::{Segment, CS, DS};
    use x86_64::instructions::tables::load_tss;

    TSS.init_once(|| {
        let mut tss = TaskStateSegment::new();
        for i in 0..NUM_IST_STACKS {
            let stack_start = VirtAddr::from_ptr(unsafe { IST_STACKS[i].as_ptr() });
            tss.interrupt_stack_table[i] = stack_start + IST_STACK_SIZE as u64;
        }
        tss
    });

    let tss_ref = TSS.get().unwrap();
    TSS_PTR.store(tss_ref as *const _ as *mut _, Ordering::Release);

    GDT.init_once(|| {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(TSS.get().unwrap()));
        let user_data_selector = gdt.append(Descriptor::user_data_segment());
        let user_code_selector = gdt.append(Descriptor::user_code_segment());
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                tss_selector,
                user_code_selector,
                user_data_selector,
            },
        )
    });

    let (gdt, selectors) = GDT.get().unwrap();
    gdt.load();
    unsafe {
        CS::set_reg(selectors.code_selector);
        DS::set_reg(selectors.data_selector);
        load_tss(selectors.tss_selector);
    }

    log::info!("gdt: loaded, {} IST stacks installed", NUM_IST_STACKS);
}

pub fn kernel_code_selector() -> SegmentSelector {
    GDT.get().expect("gdt::init not called").1.code_selector
}

pub fn kernel_data_selector() -> SegmentSelector {
    GDT.get().expect("gdt::init not called").1.data_selector
}

pub fn user_code_selector() -> SegmentSelector {
    GDT.get().expect("gdt::init not called").1.user_code_selector
}

pub fn user_data_selector() -> SegmentSelector {
    GDT.get().expect("gdt::init not called").1.user_data_selector
}

/// Point `rsp0` (the stack loaded on a ring3->ring0 transition) at a task's
/// kernel stack. Called by the scheduler on every context switch.
pub fn set_kernel_stack(stack_top: VirtAddr) {
    let tss_ptr = TSS_PTR.load(Ordering::Acquire);
    if !tss_ptr.is_null() {
        unsafe {
            (*tss_ptr).privilege_stack_table[0] = stack_top;
        }
    }
}

#[cfg(feature = "testing")]
pub fn double_fault_stack_top() -> VirtAddr {
    TSS.get().expect("gdt::init not called").interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize]
}
