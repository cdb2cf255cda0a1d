#![no_std]
#![no_main]

use bootloader_api::config::{BootloaderConfig, Mapping};
use bootloader_api::{entry_point, BootInfo};
use core::panic::PanicInfo;
use kestrel::{config, fs, hlt_loop, interrupts, logger, memory, serial, task};

/// Ask the loader to establish a higher-half direct map of all physical
/// memory and report its offset in [`BootInfo::physical_memory_offset`];
/// the frame allocator and page mapper both need that offset to turn a
/// physical address into one they can dereference.
static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    config
};

entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

/// Ordered one-shot bringup: PFA, then VMM, then heap, then segmentation,
/// then interrupts/PIC/timer, then the scheduler, then the root filesystem.
/// Each step is a hard prerequisite of the next; any failure here is
/// irrecoverable and halts.
fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    serial::init();
    logger::init();
    log::info!("kestrel: booting");

    let hhdm_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("bootloader did not map physical memory");
    let regions = memory::regions_from_bootinfo(&boot_info.memory_regions);

    unsafe {
        memory::init(&regions, x86_64::VirtAddr::new(hhdm_offset));
    }

    interrupts::init();
    task::scheduler::init();

    fs::ext2::init_ramdisk_root(config::ROOT_RAMDISK_BLOCKS)
        .expect("failed to format/mount the root filesystem");

    x86_64::instructions::interrupts::enable();
    log::info!("kestrel: bringup complete");

    #[cfg(feature = "testing")]
    kestrel::selftest::run();

    hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    log::error!("panic: {}", info);
    hlt_loop()
}
