// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs the encode pipeline on the synthetic backend and prints the decision taken for every
//! picture.

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use argh::FromArgs;
use vcenc_rc::backend::dummy::SyntheticBackend;
use vcenc_rc::encoder::stateless::StatelessEncoder;
use vcenc_rc::encoder::stateless::StatelessVideoEncoder;
use vcenc_rc::encoder::CodedPicture;
use vcenc_rc::encoder::EncoderConfig;
use vcenc_rc::encoder::FrameMetadata;
use vcenc_rc::encoder::FrameRate;
use vcenc_rc::encoder::Picture;
use vcenc_rc::encoder::RateControl;
use vcenc_rc::gop::GopConfig;
use vcenc_rc::gop::GopSize;
use vcenc_rc::gop::GopStructure;
use vcenc_rc::lookahead::LookaheadConfig;
use vcenc_rc::Resolution;

/// Rate control simulator
#[derive(Debug, FromArgs)]
struct Args {
    /// raw I420 or NV12 input. A moving pattern is generated when not given.
    #[argh(option)]
    input: Option<PathBuf>,

    /// frames width
    #[argh(option, default = "640")]
    width: u32,

    /// frames height
    #[argh(option, default = "480")]
    height: u32,

    /// frames count
    #[argh(option, default = "120")]
    count: u64,

    /// target bitrate in bits per second
    #[argh(option, default = "1_000_000")]
    bitrate: u64,

    /// constant QP, overrides the bitrate
    #[argh(option)]
    qp: Option<u32>,

    /// framerate
    #[argh(option, default = "30")]
    framerate: u32,

    /// mini-GOP size, or "adaptive"
    #[argh(option, default = "String::from(\"4\")")]
    gop: String,

    /// file with a custom GOP structure, overrides --gop
    #[argh(option)]
    gop_config: Option<PathBuf>,

    /// distance between intra pictures, 0 for only the first one
    #[argh(option, default = "0")]
    intra_period: u32,

    /// look-ahead depth, 0 disables the look-ahead
    #[argh(option, default = "0")]
    lookahead: usize,

    /// CU-tree strength
    #[argh(option, default = "2.0")]
    cutree_strength: f32,

    /// run the CU-tree in its own thread
    #[argh(switch)]
    cutree_worker: bool,

    /// reject pictures overflowing the buffer
    #[argh(switch)]
    hrd: bool,

    /// multiplies the complexity of the synthetic content halfway through the sequence
    #[argh(option, default = "1.0")]
    scene_change: f64,

    /// output file to write the synthetic bitstream to
    #[argh(option)]
    output: Option<PathBuf>,
}

/// Moving diagonal bars, shifted by `t` pixels.
fn pattern(resolution: Resolution, t: u64) -> Picture {
    let (width, height) = (resolution.width as usize, resolution.height as usize);
    let shift = t as usize * 2;
    let luma = (0..width * height)
        .map(|i| {
            let (x, y) = (i % width, i / width);
            (((x + y + shift) / 8) % 2 * 160 + (x * 31 / width.max(1))) as u8
        })
        .collect::<Vec<_>>();
    Picture::new(resolution, luma)
}

fn gop_config(args: &Args) -> anyhow::Result<GopConfig> {
    let size = match &args.gop_config {
        Some(path) => {
            let mut text = String::new();
            File::open(path)
                .with_context(|| format!("opening {}", path.display()))?
                .read_to_string(&mut text)?;
            GopSize::Custom(GopStructure::from_str(&text)?)
        }
        None if args.gop == "adaptive" => GopSize::Adaptive,
        None => GopSize::Fixed(args.gop.parse().context("invalid --gop")?),
    };

    Ok(GopConfig {
        size,
        intra_period: args.intra_period,
        ..Default::default()
    })
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();

    let resolution = Resolution {
        width: args.width,
        height: args.height,
    };

    let mut config = EncoderConfig {
        resolution,
        frame_rate: FrameRate {
            num: args.framerate,
            denom: 1,
        },
        rate_control: match args.qp {
            Some(qp) => RateControl::ConstantQuality(qp),
            None => RateControl::ConstantBitrate(args.bitrate),
        },
        gop: gop_config(&args)?,
        lookahead: (args.lookahead > 0).then(|| LookaheadConfig {
            depth: args.lookahead,
            cutree_strength: args.cutree_strength,
            cutree_worker: args.cutree_worker,
            ..Default::default()
        }),
        ..Default::default()
    };
    config.rc.hrd = args.hrd;

    let backend = SyntheticBackend::new(&config);
    let mut encoder =
        StatelessEncoder::new(config, backend).context("Unable to create encoder")?;

    let mut input = args
        .input
        .as_ref()
        .map(|path| File::open(path).with_context(|| format!("opening {}", path.display())))
        .transpose()?;
    let luma_size = resolution.get_area();
    let mut buf = vec![0u8; luma_size + luma_size / 2];

    let mut output = args.output.as_ref().map(File::create).transpose()?;
    let mut total_bits = 0u64;
    let mut coded_count = 0u64;
    let mut consume = |coded: CodedPicture| -> anyhow::Result<()> {
        println!(
            "{:5} {:?} qp={:2} {:8} bytes{}",
            coded.metadata.timestamp,
            coded.coding_type,
            coded.qp,
            coded.bitstream.len(),
            if coded.skipped { " skipped" } else { "" }
        );
        total_bits += coded.bitstream.len() as u64 * 8;
        coded_count += 1;
        if let Some(output) = output.as_mut() {
            output.write_all(&coded.bitstream)?;
        }
        Ok(())
    };

    for t in 0..args.count {
        if t == args.count / 2 && args.scene_change != 1.0 {
            encoder.backend_mut().set_complexity(4.0 * args.scene_change);
        }

        let picture = match input.as_mut() {
            Some(input) => {
                input.read_exact(&mut buf)?;
                Picture::new(resolution, buf[..luma_size].to_vec())
            }
            None => pattern(resolution, t),
        };
        let meta = FrameMetadata {
            timestamp: t,
            time_increment: 1,
            force_keyframe: false,
        };

        encoder.encode(meta, picture)?;
        while let Some(coded) = encoder.poll()? {
            consume(coded)?;
        }
    }

    encoder.drain()?;
    while let Some(coded) = encoder.poll()? {
        consume(coded)?;
    }

    let seconds = args.count as f64 / f64::from(args.framerate.max(1));
    println!(
        "{} pictures, {:.0} bits/s",
        coded_count,
        total_bits as f64 / seconds.max(f64::EPSILON)
    );

    Ok(())
}
