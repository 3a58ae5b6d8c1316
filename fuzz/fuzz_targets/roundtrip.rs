#![no_main]
use libfuzzer_sys::fuzz_target;
use pickle_engine::{value_from_slice, value_to_vec, SerOptions};

// Anything that loads must dump again, and load to an equal graph.
fuzz_target!(|data: &[u8]| {
    if let Ok((heap, value)) = value_from_slice(data, Default::default()) {
        for proto in 0..=5 {
            if let Ok(again) = value_to_vec(&heap, &value, SerOptions::new().proto(proto)) {
                let (heap2, value2) = value_from_slice(&again, Default::default()).unwrap();
                assert!(heap.equal(&value, &heap2, &value2));
            }
        }
    }
});
