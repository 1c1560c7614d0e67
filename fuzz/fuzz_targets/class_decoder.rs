#![no_main]

use libfuzzer_sys::fuzz_target;
use method_tracer::instrument::InstrumentationCounter;
use method_tracer::orchestrator::{rewrite_unit, UnitRewrite};

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary bytes must fail cleanly, never panic
    let Ok(class) = method_tracer::classfile::decode(data) else {
        return;
    };

    let _ = method_tracer::classfile::encode(&class);

    // A rewritten class must decode again
    if let Ok(UnitRewrite::Rewritten { bytes, .. }) = rewrite_unit(data, &InstrumentationCounter::new()) {
        assert!(method_tracer::classfile::decode(&bytes).is_ok());
    }
});
