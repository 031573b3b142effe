use core::panic::PanicInfo;

use log::error;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    if let Some(location) = info.location() {
        error!("[kernel] panicked at {}:{} {}", location.file(), location.line(), info.message());
    } else {
        error!("[kernel] panicked: {}", info.message());
    }
    loop {
        #[cfg(target_arch = "riscv64")]
        unsafe {
            riscv::asm::wfi();
        }
    }
}
