// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#![no_main]

use libfuzzer_sys::fuzz_target;
use vp9_hwdec::bitstream_utils::IvfIterator;
use vp9_hwdec::codec::vp9::parser::Parser;
use vp9_hwdec::codec::vp9::superframe::SuperframeSplitter;

fuzz_target!(|data: &[u8]| {
    let mut parser = Parser::default();
    let mut splitter = SuperframeSplitter::default();

    for chunk in IvfIterator::new(data) {
        loop {
            let Ok(sub_frame) = splitter.next_frame(chunk) else {
                splitter.reset();
                break;
            };

            if let Ok(hdr) = parser.parse_frame(sub_frame.data(chunk)) {
                parser.commit(&hdr);
            }

            if splitter.advance() {
                break;
            }
        }
    }
});
