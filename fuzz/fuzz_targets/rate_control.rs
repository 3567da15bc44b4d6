#![no_main]

use libfuzzer_sys::fuzz_target;
use vcenc_rc::encoder::CodingType;
use vcenc_rc::encoder::EncoderConfig;
use vcenc_rc::encoder::RateControl;
use vcenc_rc::rate_control::PictureStats;
use vcenc_rc::rate_control::RateController;
use vcenc_rc::rate_control::RcPicture;
use vcenc_rc::rate_control::MAX_QP;
use vcenc_rc::Resolution;

fuzz_target!(|data: &[u8]| {
    let mut config = EncoderConfig {
        resolution: Resolution::from((320, 240)),
        rate_control: RateControl::ConstantBitrate(500_000),
        ..Default::default()
    };
    config.rc.hrd = data.first().is_some_and(|b| b & 1 != 0);

    let Ok(mut rc) = RateController::new(&config) else {
        return;
    };

    // Every 3 bytes drive one picture: its type, size and the number of time units it covers.
    for chunk in data.chunks_exact(3) {
        let coding_type = match chunk[0] % 3 {
            0 => CodingType::Intra,
            1 => CodingType::Predicted,
            _ => CodingType::Bipredicted,
        };
        let picture = RcPicture::new(coding_type);
        let Ok(decision) = rc.before_picture(u32::from(chunk[2] % 4), &picture, None) else {
            return;
        };
        assert!(decision.qp_hdr <= MAX_QP);

        let byte_count = usize::from(chunk[1]) * 64;
        let stats = PictureStats {
            byte_count,
            non_zero_count: u32::from(byte_count > 0),
            qp_sum: u64::from(decision.qp_hdr),
            qp_count: 1,
        };
        if rc.after_picture(&stats).is_err() {
            return;
        }
        assert!(rc.occupancy() <= rc.buffer_size());
    }
});
