//! Interrupt vector table and device-vector dispatch (§4.4, §4.5).
//!
//! CPU exceptions (0..31) get dedicated `extern "x86-interrupt"` handlers,
//! each of which first consults a caller-installable override
//! (`install_exception_handler`) before falling back to its hardcoded
//! default behavior. Device vectors (32..255) are dispatched through a
//! separate lock-free table of registered callbacks, since handlers must
//! not block.

pub mod timer;

use crate::gdt;
use core::sync::atomic::{AtomicUsize, Ordering};
use pic8259::ChainedPics;
use spin::Once;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;
const NUM_DEVICE_VECTORS: usize = 256 - 32;

pub static PICS: spin::Mutex<ChainedPics> =
    spin::Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
    Keyboard,
}

impl InterruptIndex {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
    pub fn as_usize(self) -> usize {
        usize::from(self.as_u8())
    }
}

/// One lock-free slot per device vector. A handler is a plain function
/// pointer cast to `usize`; 0 means "unregistered". Real closures/state live
/// in the driver collaborator, not here.
static DEVICE_HANDLERS: [AtomicUsize; NUM_DEVICE_VECTORS] = {
    const ZERO: AtomicUsize = AtomicUsize::new(0);
    [ZERO; NUM_DEVICE_VECTORS]
};

/// Register a handler for device vector `vector` (32..255). Overwrites any
/// previously-registered handler.
pub fn register_handler(vector: u8, handler: fn(u8)) {
    assert!(vector >= 32, "vectors 0..31 are CPU exceptions, not device vectors");
    DEVICE_HANDLERS[(vector - 32) as usize].store(handler as usize, Ordering::Release);
}

pub fn unregister_handler(vector: u8) {
    assert!(vector >= 32);
    DEVICE_HANDLERS[(vector - 32) as usize].store(0, Ordering::Release);
}

fn dispatch_device(vector: u8) {
    let slot = DEVICE_HANDLERS[(vector - 32) as usize].load(Ordering::Acquire);
    if slot != 0 {
        let handler: fn(u8) = unsafe { core::mem::transmute(slot) };
        handler(vector);
    } else {
        log::trace!("interrupts: unhandled device vector {}", vector);
    }
}

/// One lock-free slot per CPU exception vector (0..31), mirroring
/// `DEVICE_HANDLERS`. A caller-installed handler runs before this module's
/// own hardcoded behavior for that vector; it cannot stop a divergent
/// handler (machine check, double fault) from eventually halting, since
/// those can never return control to the faulting context.
static EXCEPTION_HANDLERS: [AtomicUsize; 32] = {
    const ZERO: AtomicUsize = AtomicUsize::new(0);
    [ZERO; 32]
};

/// Install a handler for CPU exception vector `vector` (0..31). Overwrites
/// any previously-installed handler for that vector.
pub fn install_exception_handler(vector: u8, handler: fn(u8)) {
    assert!(vector < 32, "vectors 32.. are device vectors, not CPU exceptions");
    EXCEPTION_HANDLERS[vector as usize].store(handler as usize, Ordering::Release);
}

pub fn uninstall_exception_handler(vector: u8) {
    assert!(vector < 32);
    EXCEPTION_HANDLERS[vector as usize].store(0, Ordering::Release);
}

/// Run an installed override for `vector`, if any. Returns whether one ran.
fn dispatch_exception(vector: u8) -> bool {
    let slot = EXCEPTION_HANDLERS[vector as usize].load(Ordering::Acquire);
    if slot != 0 {
        let handler: fn(u8) = unsafe { core::mem::transmute(slot) };
        handler(vector);
        true
    } else {
        false
    }
}

static IDT: Once<InterruptDescriptorTable> = Once::new();

pub fn init() {
    gdt::init();
    init_idt();
    unsafe {
        PICS.lock().initialize();
    }
    log::info!("interrupts: IDT and legacy PIC initialized");
}

fn init_idt() {
    IDT.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.non_maskable_interrupt.set_handler_fn(nmi_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);

        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
            idt.machine_check
                .set_handler_fn(machine_check_handler)
                .set_stack_index(gdt::MACHINE_CHECK_IST_INDEX);
            idt.stack_segment_fault
                .set_handler_fn(stack_segment_fault_handler)
                .set_stack_index(gdt::STACK_FAULT_IST_INDEX);
        }

        idt[InterruptIndex::Timer.as_usize()].set_handler_fn(timer_interrupt_handler);
        idt[InterruptIndex::Keyboard.as_usize()].set_handler_fn(generic_device_handler_33);

        idt
    });
    IDT.get().unwrap().load();
}

/// CPU exception vector numbers, for `dispatch_exception`/`install_exception_handler`.
mod vectors {
    pub const DIVIDE_ERROR: u8 = 0;
    pub const DEBUG: u8 = 1;
    pub const NMI: u8 = 2;
    pub const BREAKPOINT: u8 = 3;
    pub const INVALID_OPCODE: u8 = 6;
    pub const DOUBLE_FAULT: u8 = 8;
    pub const STACK_SEGMENT_FAULT: u8 = 12;
    pub const GENERAL_PROTECTION_FAULT: u8 = 13;
    pub const PAGE_FAULT: u8 = 14;
    pub const MACHINE_CHECK: u8 = 18;
}

fn fatal(vector: u8, name: &str, frame: &InterruptStackFrame) {
    if dispatch_exception(vector) {
        return;
    }
    log::error!("fatal exception: {} at {:#x}", name, frame.instruction_pointer.as_u64());
    crate::hlt_loop();
}

extern "x86-interrupt" fn divide_error_handler(frame: InterruptStackFrame) {
    fatal(vectors::DIVIDE_ERROR, "divide error", &frame)
}

extern "x86-interrupt" fn debug_handler(_frame: InterruptStackFrame) {
    dispatch_exception(vectors::DEBUG);
}

extern "x86-interrupt" fn nmi_handler(frame: InterruptStackFrame) {
    if !dispatch_exception(vectors::NMI) {
        log::error!("NMI at {:#x}", frame.instruction_pointer.as_u64());
    }
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    if !dispatch_exception(vectors::BREAKPOINT) {
        log::debug!("breakpoint at {:#x}", frame.instruction_pointer.as_u64());
    }
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    fatal(vectors::INVALID_OPCODE, "invalid opcode", &frame)
}

extern "x86-interrupt" fn general_protection_fault_handler(frame: InterruptStackFrame, error_code: u64) {
    log::error!("general protection fault (code {:#x})", error_code);
    fatal(vectors::GENERAL_PROTECTION_FAULT, "general protection fault", &frame)
}

extern "x86-interrupt" fn stack_segment_fault_handler(frame: InterruptStackFrame, error_code: u64) {
    log::error!("stack segment fault (code {:#x})", error_code);
    fatal(vectors::STACK_SEGMENT_FAULT, "stack segment fault", &frame)
}

extern "x86-interrupt" fn page_fault_handler(frame: InterruptStackFrame, error_code: PageFaultErrorCode) {
    let addr = x86_64::registers::control::Cr2::read();
    log::error!("page fault at {:#x} (error {:?})", addr, error_code);
    fatal(vectors::PAGE_FAULT, "page fault", &frame)
}

extern "x86-interrupt" fn machine_check_handler(frame: InterruptStackFrame) -> ! {
    dispatch_exception(vectors::MACHINE_CHECK);
    log::error!("machine check at {:#x}", frame.instruction_pointer.as_u64());
    crate::hlt_loop()
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, _error_code: u64) -> ! {
    dispatch_exception(vectors::DOUBLE_FAULT);
    log::error!("double fault at {:#x}", frame.instruction_pointer.as_u64());
    crate::hlt_loop()
}

extern "x86-interrupt" fn timer_interrupt_handler(_frame: InterruptStackFrame) {
    timer::on_tick();
    unsafe {
        PICS.lock().notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }
}

extern "x86-interrupt" fn generic_device_handler_33(_frame: InterruptStackFrame) {
    dispatch_device(InterruptIndex::Keyboard.as_u8());
    unsafe {
        PICS.lock().notify_end_of_interrupt(InterruptIndex::Keyboard.as_u8());
    }
}

/// Collaborator hook for a per-CPU local advanced interrupt controller
/// (§4.5's "advanced controller"). This core never implements one; a driver
/// collaborator that discovers and programs real hardware can register
/// itself here so timer/IPI delivery can move off the legacy PIC path.
pub trait AdvancedController: Send + Sync {
    fn enable(&self);
    fn end_of_interrupt(&self, vector: u8);
}
