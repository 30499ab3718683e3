// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! replay, runs a synthetic stream through the decoder and the recording accelerator.
//!
//! The stream is a regular group of pictures, an intra picture followed by anchors with
//! `b-frames` bidirectional pictures between them. Every command buffer submitted to the
//! accelerator can be dumped to a file, and the CRC32 of the submitted data is printed at the end
//! so two runs can be compared.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use argh::FromArgs;
use log::debug;
use log::info;

use cros_hwdec::backend::dummy::Fault;
use cros_hwdec::backend::dummy::FaultPoint;
use cros_hwdec::backend::dummy::RecordingAccelerator;
use cros_hwdec::codec::h264;
use cros_hwdec::codec::h265;
use cros_hwdec::codec::vc1;
use cros_hwdec::codec::PictureParams;
use cros_hwdec::codec::SequenceParams;
use cros_hwdec::codec::SliceSyntax;
use cros_hwdec::config::DecoderConfig;
use cros_hwdec::decoder::BlockingMode;
use cros_hwdec::decoder::DecodeError;
use cros_hwdec::decoder::DecodeStatus;
use cros_hwdec::decoder::DecodeUnit;
use cros_hwdec::decoder::Decoder;
use cros_hwdec::decoder::PictureHeader;
use cros_hwdec::decoder::Slice;
use cros_hwdec::dpb::marking::ReferenceMarking;
use cros_hwdec::memory::SlotTable;
use cros_hwdec::packer::protected::SliceEncryption;
use cros_hwdec::packer::protected::Subsample;
use cros_hwdec::packer::AccelGeneration;
use cros_hwdec::Codec;

const WIDTH: u16 = 320;
const HEIGHT: u16 = 240;

/// Number of times a busy submission is retried before giving up.
const MAX_RETRIES: usize = 8;

/// Replays a synthetic stream through the decoder and a recording accelerator
#[derive(Debug, FromArgs)]
struct Args {
    /// codec of the stream (h264, h265 or vc1). Default: h264
    #[argh(option, default = "Codec::H264")]
    codec: Codec,

    /// number of frames to decode. Default: 30
    #[argh(option, default = "30")]
    frames: usize,

    /// number of B frames between two anchors. Default: 2
    #[argh(option, default = "2")]
    b_frames: usize,

    /// number of slices per frame. Default: 2
    #[argh(option, default = "2")]
    slices: usize,

    /// size of each slice payload, in bytes. Default: 4096
    #[argh(option, default = "4096")]
    slice_size: usize,

    /// capacity of the slice data buffer of one hardware round, in bytes. Default: 1048576
    #[argh(option, default = "1 << 20")]
    slice_data_capacity: usize,

    /// accelerator generation (gen9, gen11 or gen12). Default: gen12
    #[argh(option, default = "AccelGeneration::Gen12")]
    generation: AccelGeneration,

    /// whether slice payloads are encrypted
    #[argh(switch)]
    protected: bool,

    /// make every Nth hardware submission report a busy accelerator
    #[argh(option)]
    busy_every: Option<usize>,

    /// whether to poll frame completion without blocking
    #[argh(switch)]
    non_blocking: bool,

    /// file to write the submitted command buffers to
    #[argh(option)]
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Intra,
    Predicted,
    Bidirectional,
}

/// One picture of the synthetic stream, in decode order.
#[derive(Debug)]
struct Coded {
    kind: Kind,
    poc: i32,
    references: Vec<i32>,
}

/// Lays out `frames` pictures in decode order: each anchor precedes the B pictures displayed
/// before it.
fn group_of_pictures(frames: usize, b_frames: usize) -> Vec<Coded> {
    let period = b_frames + 1;
    let mut gop = Vec::with_capacity(frames);

    if frames == 0 {
        return gop;
    }

    gop.push(Coded {
        kind: Kind::Intra,
        poc: 0,
        references: vec![],
    });

    let mut previous = 0;
    let mut anchor = period;
    while anchor < frames {
        let poc = |display: usize| (display * 2) as i32;

        gop.push(Coded {
            kind: Kind::Predicted,
            poc: poc(anchor),
            references: vec![poc(previous)],
        });

        for display in previous + 1..anchor {
            gop.push(Coded {
                kind: Kind::Bidirectional,
                poc: poc(display),
                references: vec![poc(previous), poc(anchor)],
            });
        }

        previous = anchor;
        anchor += period;
    }

    gop
}

/// Builds the syntax structures of each codec for the synthetic pictures.
struct Stream {
    codec: Codec,
    sequence: SequenceParams,
    /// Number of reference pictures decoded so far, for H.264 `frame_num`.
    num_refs: u16,
}

impl Stream {
    fn new(codec: Codec, b_frames: usize) -> Self {
        let sequence = match codec {
            Codec::H264 => SequenceParams::H264(Arc::new(h264::Sps {
                profile_idc: h264::Profile::High as u8,
                level_idc: h264::Level::L4,
                pic_width_in_mbs_minus1: u32::from(WIDTH / 16 - 1),
                pic_height_in_map_units_minus1: u32::from(HEIGHT / 16 - 1),
                frame_mbs_only_flag: true,
                log2_max_frame_num_minus4: 4,
                max_num_ref_frames: 2,
                max_num_reorder_frames: Some(b_frames.min(2) as u32),
                ..Default::default()
            })),
            Codec::H265 => SequenceParams::H265(Arc::new(h265::Sps {
                general_level_idc: h265::Level::L4,
                pic_width_in_luma_samples: WIDTH,
                pic_height_in_luma_samples: HEIGHT,
                max_dec_pic_buffering_minus1: 4,
                max_num_reorder_pics: b_frames.min(2) as u8,
                ..Default::default()
            })),
            Codec::Vc1 => SequenceParams::Vc1(Arc::new(vc1::SequenceHeader {
                profile: vc1::Profile::Main,
                coded_width: WIDTH,
                coded_height: HEIGHT,
                max_b_frames: b_frames.min(7) as u8,
                ..Default::default()
            })),
        };

        Self {
            codec,
            sequence,
            num_refs: 0,
        }
    }

    fn picture(&mut self, coded: &Coded) -> Arc<PictureHeader> {
        let is_ref = coded.kind != Kind::Bidirectional;
        let frame_num = self.num_refs % 256;

        let (params, marking) = match &self.sequence {
            SequenceParams::H264(sps) => {
                let params = h264::PictureParams {
                    sps: Arc::clone(sps),
                    frame_num,
                    nal_ref_idc: is_ref as u8,
                    top_field_order_cnt: coded.poc,
                    bottom_field_order_cnt: coded.poc,
                    ..Default::default()
                };
                let marking = match coded.kind {
                    Kind::Intra => ReferenceMarking::Idr {
                        long_term: false,
                        no_output_of_prior_pics: false,
                    },
                    Kind::Predicted => ReferenceMarking::SlidingWindow,
                    Kind::Bidirectional => ReferenceMarking::NonReference,
                };
                (PictureParams::H264(params), marking)
            }
            SequenceParams::H265(sps) => {
                let (before, after) = match coded.references.as_slice() {
                    [] => (vec![], vec![]),
                    [forward] => (vec![*forward], vec![]),
                    [forward, backward, ..] => (vec![*forward], vec![*backward]),
                };
                let short_term = before.iter().chain(&after).copied().collect();

                let params = h265::PictureParams {
                    sps: Arc::clone(sps),
                    pps: Default::default(),
                    pic_order_cnt: coded.poc,
                    irap_pic: coded.kind == Kind::Intra,
                    idr_pic: coded.kind == Kind::Intra,
                    intra_pic: coded.kind == Kind::Intra,
                    rps: h265::RefPicSet {
                        st_curr_before: before,
                        st_curr_after: after,
                        ..Default::default()
                    },
                    st_rps_bits: 0,
                };
                let marking = ReferenceMarking::ReferenceSet {
                    short_term,
                    long_term: vec![],
                };
                (PictureParams::H265(params), marking)
            }
            SequenceParams::Vc1(seq) => {
                let ptype = match coded.kind {
                    Kind::Intra => vc1::PictureType::I,
                    Kind::Predicted => vc1::PictureType::P,
                    Kind::Bidirectional => vc1::PictureType::B,
                };
                let params = vc1::PictureParams {
                    sequence: Arc::clone(seq),
                    header: vc1::PictureHeader {
                        ptype,
                        pquant: 4,
                        ..Default::default()
                    },
                    ..Default::default()
                };
                let marking = if is_ref {
                    ReferenceMarking::SlidingWindow
                } else {
                    ReferenceMarking::NonReference
                };
                (PictureParams::Vc1(params), marking)
            }
        };

        if is_ref {
            self.num_refs = self.num_refs.wrapping_add(1);
        }

        let mut picture = PictureHeader::new(params, coded.poc);
        picture.frame_num = i32::from(frame_num);
        picture.marking = marking;
        picture.references = coded.references.clone();

        Arc::new(picture)
    }

    fn slice_header(&self, coded: &Coded, index: usize) -> SliceSyntax {
        let list0: Vec<_> = coded.references.iter().take(1).copied().collect();
        let list1: Vec<_> = coded.references.iter().skip(1).copied().collect();

        match self.codec {
            Codec::H264 => SliceSyntax::H264(h264::SliceHeader {
                first_mb_in_slice: index as u32,
                slice_type: match coded.kind {
                    Kind::Intra => h264::SliceType::I,
                    Kind::Predicted => h264::SliceType::P,
                    Kind::Bidirectional => h264::SliceType::B,
                },
                header_bit_size: 28,
                ref_pic_list0: list0,
                ref_pic_list1: list1,
                ..Default::default()
            }),
            Codec::H265 => SliceSyntax::H265(h265::SliceHeader {
                segment_address: index as u32,
                slice_type: match coded.kind {
                    Kind::Intra => h265::SliceType::I,
                    Kind::Predicted => h265::SliceType::P,
                    Kind::Bidirectional => h265::SliceType::B,
                },
                max_num_merge_cand: 5,
                header_size: 6,
                ref_pic_list0: list0,
                ref_pic_list1: list1,
                ..Default::default()
            }),
            Codec::Vc1 => SliceSyntax::Vc1(vc1::SliceHeader {
                macroblock_offset: 32,
                slice_vertical_position: index as u32,
            }),
        }
    }
}

/// Feeds `unit`, retrying it while the accelerator reports busy.
fn feed(decoder: &mut Decoder, unit: DecodeUnit) -> anyhow::Result<DecodeStatus> {
    for attempt in 0..MAX_RETRIES {
        match decoder.decode(unit.clone()) {
            Err(DecodeError::Busy) => debug!("Accelerator busy, retry {}", attempt + 1),
            res => return Ok(res?),
        }
    }

    bail!("accelerator still busy after {} retries", MAX_RETRIES)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();

    let recorder = RecordingAccelerator::new();
    let config = DecoderConfig::new(args.codec)
        .generation(args.generation)
        .protected(args.protected)
        .slice_data_capacity(args.slice_data_capacity)
        .blocking_mode(if args.non_blocking {
            BlockingMode::NonBlocking
        } else {
            BlockingMode::Blocking
        });

    let mut decoder = Decoder::new(config, Box::new(recorder.clone()), SlotTable::shared(32))?;
    let mut stream = Stream::new(args.codec, args.b_frames);
    decoder.set_sequence(stream.sequence.clone())?;

    let gop = group_of_pictures(args.frames, args.b_frames);
    let mut executes = 0;
    let mut output_order = Vec::new();

    for coded in &gop {
        let picture = stream.picture(coded);

        for index in 0..args.slices {
            let payload: Vec<u8> = (0..args.slice_size)
                .map(|i| (i + index * 7 + coded.poc as usize) as u8)
                .collect();

            let mut slice = Slice::new(
                Arc::clone(&picture),
                stream.slice_header(coded, index),
                payload,
            );
            if args.protected {
                slice.encryption = Some(SliceEncryption {
                    iv: [coded.poc as u8; 16],
                    subsamples: vec![Subsample {
                        clear_bytes: 16,
                        encrypted_bytes: args.slice_size.saturating_sub(16),
                    }],
                    ..Default::default()
                });
            }

            feed(&mut decoder, DecodeUnit::Slice(slice))?;
        }

        if let Some(every) = args.busy_every {
            executes += 1;
            if every > 0 && executes % every == 0 {
                recorder.inject(FaultPoint::Execute, Fault::Busy);
            }
        }

        if let DecodeStatus::FrameQueued { frame_counter } =
            feed(&mut decoder, DecodeUnit::FrameComplete)?
        {
            debug!("Frame {} (POC {}) queued", frame_counter, coded.poc);
        }

        while let Some(frame) = decoder.next_frame() {
            output_order.push(frame.poc);
        }
    }

    feed(&mut decoder, DecodeUnit::EndOfStream)?;
    while let Some(frame) = decoder.next_frame() {
        if !frame.corruption.is_empty() {
            info!("POC {} is corrupted: {:?}", frame.poc, frame.corruption);
        }
        output_order.push(frame.poc);
    }

    if let Some(path) = &args.output {
        let mut file = File::create(path).context("creating the output file")?;
        for submission in recorder.submissions() {
            for buffer in &submission.buffers {
                file.write_all(&buffer.data)
                    .context("writing the output file")?;
            }
        }
    }

    let stats = decoder.stats();
    println!("output order: {:?}", output_order);
    println!(
        "{} frames submitted in {} rounds, {} output ({} corrupted), {} slices skipped",
        stats.frames_submitted,
        stats.hardware_rounds,
        stats.frames_output,
        stats.corrupted_frames_output,
        stats.slices_skipped
    );
    println!("checksum: {:08x}", recorder.checksum());

    Ok(())
}
