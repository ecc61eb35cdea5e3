//! Fuzz target for change stream document parsing.
//!
//! Arbitrary bytes are decoded as BSON and fed to the event parser. Parsing
//! must never panic, and anything it accepts must survive a JSON roundtrip.

#![no_main]

use change_watch::event::ChangeEvent;
use change_watch::source::parse_change_document;
use libfuzzer_sys::fuzz_target;
use mongodb::bson::Document;

fuzz_target!(|data: &[u8]| {
    let Ok(document) = Document::from_reader(data) else {
        return;
    };

    // Should never panic
    if let Ok(Some(event)) = parse_change_document(document) {
        let json = serde_json::to_vec(&event).expect("parsed events serialize");
        let back: ChangeEvent = serde_json::from_slice(&json).expect("serialized events parse");
        assert_eq!(back.id, event.id);
        assert_eq!(back.operation_type, event.operation_type);
        assert_eq!(back.timestamp, event.timestamp);
    }
});
