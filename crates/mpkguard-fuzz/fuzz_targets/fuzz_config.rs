#![no_main]
use libfuzzer_sys::fuzz_target;
use mpkguard_membrane::RuntimeConfig;
use mpkguard_membrane::config::DEFAULT_EXTERN_STACK_SIZE;

fuzz_target!(|data: &[u8]| {
    // Every variable sees the same arbitrary bytes; parsing must never panic
    // and must keep the extern stack at or above the default.
    let config = RuntimeConfig::from_lookup(|_| Some(data));
    assert!(config.extern_stack_size >= DEFAULT_EXTERN_STACK_SIZE);
});
