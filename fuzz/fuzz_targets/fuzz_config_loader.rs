#![no_main]
use libfuzzer_sys::fuzz_target;

// Fuzz the TOML config path end to end: arbitrary input must either parse
// into a `Config` or fail cleanly, and a parsed config must survive
// `validate()` without panicking (rejection is fine). The validator runs on
// whatever deserialized, so out-of-range sigmas, weight vectors of the
// wrong length, and degenerate rig dimensions all get exercised.
fuzz_target!(|data: &str| {
    if let Ok(cfg) = toml::from_str::<selfcal_config::Config>(data) {
        let _ = cfg.validate();
    }
});
