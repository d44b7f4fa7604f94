//! APIC detection.
//!
//! Interrupt delivery runs on the legacy 8259 pair either way; the APIC is
//! only probed so boot logs record what the machine has.

/// What the CPU offers for interrupt control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptController {
    LegacyPicOnly,
    ApicPresent,
}

/// Decode CPUID leaf 1 EDX: bit 9 is the local APIC.
pub fn controller_from_cpuid_edx(edx: u32) -> InterruptController {
    if edx & (1 << 9) != 0 {
        InterruptController::ApicPresent
    } else {
        InterruptController::LegacyPicOnly
    }
}

#[cfg(target_arch = "x86")]
pub fn detect() -> InterruptController {
    let feature_edx = x86::cpuid::CpuId::new()
        .get_feature_info()
        .map(|f| if f.has_apic() { 1u32 << 9 } else { 0 })
        .unwrap_or(0);
    let controller = controller_from_cpuid_edx(feature_edx);
    log_info!("[APIC] {:?}", controller);
    controller
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apic_bit_decides_controller() {
        assert_eq!(controller_from_cpuid_edx(0), InterruptController::LegacyPicOnly);
        assert_eq!(controller_from_cpuid_edx(1 << 9), InterruptController::ApicPresent);
    }
}
