#![no_main]
//! Fuzz target for the streaming UTF-8 decoder
//!
//! The first byte picks a split point. Decoding the two halves separately
//! must give the same text as decoding the input in one go.

use libfuzzer_sys::fuzz_target;

use multiplexer::decoder::Utf8Decoder;

fuzz_target!(|data: &[u8]| {
    let Some((&split, input)) = data.split_first() else {
        return;
    };
    let split = (split as usize).min(input.len());

    let mut decoder = Utf8Decoder::new();
    let mut text = decoder.decode(&input[..split]);
    assert!(decoder.pending_len() < 4);
    text.push_str(&decoder.decode(&input[split..]));
    text.push_str(&decoder.flush());
    assert_eq!(decoder.pending_len(), 0);

    assert_eq!(text, String::from_utf8_lossy(input));
});
