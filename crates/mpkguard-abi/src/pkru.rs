//! Protection-key rights register (PKRU) access.
//!
//! `wrpkru` faults on CPUs or kernels without protection keys, so every
//! write is preceded by a capability check.

/// Access-disable bit for one key.
pub const PKEY_DISABLE_ACCESS: u32 = 0x1;
/// Write-disable bit for one key.
pub const PKEY_DISABLE_WRITE: u32 = 0x2;

/// Highest key index the register encodes.
pub const MAX_PKEY: u32 = 15;

/// PKRU image granting `rights` to `pkey` and full access to every other
/// key. Out-of-range keys yield 0.
#[must_use]
pub const fn pkru_value(pkey: u32, rights: u32) -> u32 {
    if pkey > MAX_PKEY {
        return 0;
    }
    (rights & (PKEY_DISABLE_ACCESS | PKEY_DISABLE_WRITE)) << (2 * pkey)
}

/// Whether the CPU supports protection keys and the OS enabled them
/// (`CPUID.(EAX=7,ECX=0):ECX.OSPKE[bit 4]`).
#[cfg(target_arch = "x86_64")]
#[must_use]
pub fn pku_supported() -> bool {
    use core::arch::x86_64::{__cpuid_count, __get_cpuid_max};
    // SAFETY: cpuid is available on every x86-64 CPU.
    #[allow(unused_unsafe)]
    let (max_leaf, _) = unsafe { __get_cpuid_max(0) };
    if max_leaf < 7 {
        return false;
    }
    // SAFETY: leaf 7 exists, checked above.
    #[allow(unused_unsafe)]
    let leaf = unsafe { __cpuid_count(7, 0) };
    leaf.ecx & (1 << 4) != 0
}

#[cfg(not(target_arch = "x86_64"))]
#[must_use]
pub fn pku_supported() -> bool {
    false
}

/// # Safety
///
/// The CPU must support protection keys ([`pku_supported`]).
#[cfg(target_arch = "x86_64")]
pub unsafe fn write_pkru(value: u32) {
    // SAFETY: caller contract; ecx and edx must be zero.
    unsafe {
        core::arch::asm!(
            "wrpkru",
            in("eax") value,
            in("ecx") 0_u32,
            in("edx") 0_u32,
            options(nostack, preserves_flags),
        );
    }
}

/// # Safety
///
/// Never callable: no PKRU on this target.
#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn write_pkru(_value: u32) {}

/// Current PKRU, or `None` when the CPU has no protection keys.
#[cfg(target_arch = "x86_64")]
#[must_use]
pub fn read_pkru() -> Option<u32> {
    if !pku_supported() {
        return None;
    }
    let value: u32;
    // SAFETY: support checked above; rdpkru only reads.
    unsafe {
        core::arch::asm!(
            "rdpkru",
            in("ecx") 0_u32,
            out("eax") value,
            out("edx") _,
            options(nomem, nostack, preserves_flags),
        );
    }
    Some(value)
}

#[cfg(not(target_arch = "x86_64"))]
#[must_use]
pub fn read_pkru() -> Option<u32> {
    None
}

/// Write `pkru_value(pkey, rights)` if supported. Returns 0 on success and
/// -1 when the CPU lacks protection keys.
pub fn set_pkey_rights(pkey: u32, rights: u32) -> i32 {
    if !pku_supported() {
        return -1;
    }
    // SAFETY: support checked above.
    unsafe { write_pkru(pkru_value(pkey, rights)) };
    0
}
