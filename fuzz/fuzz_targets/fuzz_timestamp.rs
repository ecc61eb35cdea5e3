//! Fuzz target for timestamp packing and ordering.

#![no_main]

use change_watch::event::Timestamp;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u32, u32, u32, u32)| {
    let (t1, i1, t2, i2) = data;
    let a = Timestamp::new(t1, i1);
    let b = Timestamp::new(t2, i2);

    // Packing is lossless
    assert_eq!(Timestamp::from_u64(a.as_u64()), a);

    // Packed order matches field order
    assert_eq!(a.cmp(&b), a.as_u64().cmp(&b.as_u64()));
});
