#![no_main]

use std::str::FromStr;

use libfuzzer_sys::fuzz_target;
use vcenc_rc::gop::GopConfig;
use vcenc_rc::gop::GopSize;
use vcenc_rc::gop::GopStructure;
use vcenc_rc::gop::MiniGopPredictor;
use vcenc_rc::Resolution;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(structure) = GopStructure::from_str(text) else {
        return;
    };

    // A structure that parsed must be usable.
    let config = GopConfig {
        size: GopSize::Custom(structure),
        intra_period: 7,
        ..Default::default()
    };
    let mut predictor = MiniGopPredictor::new(&config, Resolution::from((1280, 720)));
    for _ in 0..16 {
        let _ = predictor.decide(8, None, false);
    }
});
