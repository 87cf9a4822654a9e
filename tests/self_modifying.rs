#![cfg(all(
    any(target_os = "linux", target_os = "android"),
    any(target_arch = "x86_64", target_arch = "aarch64")
))]

use k23_native::{ffi, invalidate, CodeMemory, MemoryRange};

type ReturnsU32 = extern "C" fn() -> u32;

/// `mov eax, imm32; ret`, the immediate lives at offset 1.
#[cfg(target_arch = "x86_64")]
fn return_constant(value: u32) -> Vec<u8> {
    let mut code = vec![0xb8];
    code.extend_from_slice(&value.to_le_bytes());
    code.push(0xc3);
    code
}

#[cfg(target_arch = "x86_64")]
fn patch_constant(value: u32) -> (usize, Vec<u8>) {
    (1, value.to_le_bytes().to_vec())
}

/// `movz w0, #imm16; ret`
#[cfg(target_arch = "aarch64")]
fn return_constant(value: u32) -> Vec<u8> {
    assert!(value <= 0xffff);
    let movz = 0x5280_0000_u32 | (value << 5);
    let ret = 0xd65f_03c0_u32;
    [movz.to_le_bytes(), ret.to_le_bytes()].concat()
}

#[cfg(target_arch = "aarch64")]
fn patch_constant(value: u32) -> (usize, Vec<u8>) {
    (0, return_constant(value)[..4].to_vec())
}

fn entry(mem: &CodeMemory) -> ReturnsU32 {
    assert!(mem.is_published());
    // Safety: the mapping holds a complete function with this signature
    unsafe { core::mem::transmute::<*const u8, ReturnsU32>(mem.as_ptr()) }
}

#[test_log::test]
fn publish_then_execute() -> anyhow::Result<()> {
    let mut mem = CodeMemory::new(64)?;
    mem.write(0, &return_constant(42))?;
    mem.publish()?;

    assert_eq!(entry(&mem)(), 42);
    Ok(())
}

#[test_log::test]
fn patched_code_is_observed() -> anyhow::Result<()> {
    let mut mem = CodeMemory::new(64)?;
    mem.write(0, &return_constant(1))?;
    mem.publish()?;
    assert_eq!(entry(&mem)(), 1);

    for value in [2, 300, 0x1234] {
        let (offset, bytes) = patch_constant(value);
        mem.patch(offset, &bytes)?;
        assert_eq!(entry(&mem)(), value);
    }

    Ok(())
}

#[test_log::test]
fn repeated_flushes_are_harmless() -> anyhow::Result<()> {
    let mut mem = CodeMemory::new(64)?;
    mem.write(0, &return_constant(7))?;
    mem.publish()?;

    let range = mem.range();
    assert_eq!(range.len(), return_constant(7).len());

    for _ in 0..4 {
        // Safety: the range lies inside the live mapping
        unsafe {
            invalidate(range);
            invalidate(MemoryRange::new(range.start(), range.start())?);
            ffi::flush_cache(range.start() as *mut _, range.end() as *mut _);
        }
    }

    assert_eq!(entry(&mem)(), 7);
    Ok(())
}
