// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end decoding sessions against the recording accelerator.

use std::sync::Arc;

use cros_hwdec::accel::BufferType;
use cros_hwdec::accel::VaStatus;
use cros_hwdec::backend::dummy::Fault;
use cros_hwdec::backend::dummy::FaultPoint;
use cros_hwdec::backend::dummy::RecordingAccelerator;
use cros_hwdec::codec::h264;
use cros_hwdec::codec::PictureParams;
use cros_hwdec::codec::SequenceParams;
use cros_hwdec::codec::SliceSyntax;
use cros_hwdec::config::DecoderConfig;
use cros_hwdec::decoder::BlockingMode;
use cros_hwdec::decoder::DecodeError;
use cros_hwdec::decoder::DecodeStatus;
use cros_hwdec::decoder::DecodeUnit;
use cros_hwdec::decoder::Decoder;
use cros_hwdec::decoder::DecoderStatus;
use cros_hwdec::decoder::PictureHeader;
use cros_hwdec::decoder::Slice;
use cros_hwdec::dpb::marking::MarkingCommand;
use cros_hwdec::dpb::marking::ReferenceMarking;
use cros_hwdec::frame::Corruption;
use cros_hwdec::frame::DecodedFrame;
use cros_hwdec::memory::FrameAllocator;
use cros_hwdec::memory::SlotTable;
use cros_hwdec::Codec;

const POOL_SIZE: usize = 6;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A H.264 session decoding 64x64 frames.
struct Session {
    decoder: Decoder,
    recorder: RecordingAccelerator,
    allocator: Arc<SlotTable>,
    sps: Arc<h264::Sps>,
}

impl Session {
    fn new(max_num_reorder: u32) -> Self {
        Self::with_config(max_num_reorder, DecoderConfig::new(Codec::H264))
    }

    fn with_config(max_num_reorder: u32, config: DecoderConfig) -> Self {
        init_logging();

        let sps = Arc::new(h264::Sps {
            profile_idc: h264::Profile::High as u8,
            level_idc: h264::Level::L4,
            pic_width_in_mbs_minus1: 3,
            pic_height_in_map_units_minus1: 3,
            frame_mbs_only_flag: true,
            max_num_ref_frames: 2,
            max_dec_frame_buffering: Some(4),
            max_num_reorder_frames: Some(max_num_reorder),
            ..Default::default()
        });

        let recorder = RecordingAccelerator::new();
        let allocator = Arc::new(SlotTable::new(16));
        let shared: Arc<dyn FrameAllocator> = allocator.clone();

        let mut decoder = Decoder::new(
            config.pool_size(POOL_SIZE),
            Box::new(recorder.clone()),
            shared,
        )
        .unwrap();
        decoder
            .set_sequence(SequenceParams::H264(Arc::clone(&sps)))
            .unwrap();

        Self {
            decoder,
            recorder,
            allocator,
            sps,
        }
    }

    fn picture(
        &self,
        frame_num: u16,
        poc: i32,
        marking: ReferenceMarking,
        references: Vec<i32>,
    ) -> Arc<PictureHeader> {
        let params = h264::PictureParams {
            sps: Arc::clone(&self.sps),
            pps: Default::default(),
            frame_num,
            nal_ref_idc: if marking == ReferenceMarking::NonReference {
                0
            } else {
                1
            },
            top_field_order_cnt: poc,
            bottom_field_order_cnt: poc,
            ..Default::default()
        };

        let mut picture = PictureHeader::new(PictureParams::H264(params), poc);
        picture.frame_num = i32::from(frame_num);
        picture.marking = marking;
        picture.references = references;
        Arc::new(picture)
    }

    fn slice(picture: &Arc<PictureHeader>, payload_size: usize) -> DecodeUnit {
        let refs = &picture.references;
        let slice_type = match refs.len() {
            0 => h264::SliceType::I,
            1 => h264::SliceType::P,
            _ => h264::SliceType::B,
        };

        let header = h264::SliceHeader {
            slice_type,
            header_bit_size: 24,
            ref_pic_list0: refs.iter().take(1).copied().collect(),
            ref_pic_list1: refs.iter().skip(1).copied().collect(),
            ..Default::default()
        };

        let payload: Vec<u8> = (0..payload_size).map(|i| i as u8).collect();
        DecodeUnit::Slice(Slice::new(
            Arc::clone(picture),
            SliceSyntax::H264(header),
            payload,
        ))
    }

    /// Feeds a one-slice frame and closes it, returning its frame counter.
    fn decode_frame(&mut self, picture: &Arc<PictureHeader>) -> u64 {
        assert_eq!(
            self.decoder.decode(Self::slice(picture, 64)).unwrap(),
            DecodeStatus::NeedMoreData
        );

        match self.decoder.decode(DecodeUnit::FrameComplete).unwrap() {
            DecodeStatus::FrameQueued { frame_counter } => frame_counter,
            status => panic!("frame not queued: {:?}", status),
        }
    }

    fn output(&mut self) -> Vec<DecodedFrame> {
        std::iter::from_fn(|| self.decoder.next_frame()).collect()
    }
}

fn pocs(frames: &[DecodedFrame]) -> Vec<i32> {
    frames.iter().map(|f| f.poc).collect()
}

#[test]
fn frames_without_reordering_are_output_in_decode_order() {
    let mut s = Session::new(0);

    let i = s.picture(0, 0, ReferenceMarking::SlidingWindow, vec![]);
    let p1 = s.picture(1, 2, ReferenceMarking::SlidingWindow, vec![0]);
    let p2 = s.picture(2, 4, ReferenceMarking::SlidingWindow, vec![2]);

    let mut released = Vec::new();
    for picture in [&i, &p1, &p2] {
        let frame_counter = s.decode_frame(picture);

        // Each frame is released and its descriptor recycled as soon as it is decoded.
        let frames = s.output();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_counter, frame_counter);
        assert_eq!(s.decoder.task_store().stats().free, POOL_SIZE);

        released.extend(frames);
    }

    assert_eq!(
        released.iter().map(|f| f.frame_counter).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(released.iter().all(|f| f.corruption.is_empty()));
    assert_eq!(s.recorder.submissions().len(), 3);

    assert_eq!(
        s.decoder.decode(DecodeUnit::EndOfStream).unwrap(),
        DecodeStatus::Drained
    );
    assert!(s.output().is_empty());
}

#[test]
fn b_frames_are_reordered() {
    let mut s = Session::new(1);

    let i = s.picture(0, 0, ReferenceMarking::SlidingWindow, vec![]);
    let p = s.picture(1, 6, ReferenceMarking::SlidingWindow, vec![0]);
    let b1 = s.picture(2, 2, ReferenceMarking::NonReference, vec![0, 6]);
    let b2 = s.picture(2, 4, ReferenceMarking::NonReference, vec![0, 6]);

    assert_eq!(s.decode_frame(&i), 1);
    assert!(s.output().is_empty());

    assert_eq!(s.decode_frame(&p), 2);
    let mut frames = s.output();
    assert_eq!(pocs(&frames), vec![0]);

    assert_eq!(s.decode_frame(&b1), 3);
    assert_eq!(s.decode_frame(&b2), 4);
    s.decoder.decode(DecodeUnit::EndOfStream).unwrap();
    frames.extend(s.output());

    assert_eq!(pocs(&frames), vec![0, 2, 4, 6]);
    assert_eq!(
        frames.iter().map(|f| f.frame_counter).collect::<Vec<_>>(),
        vec![1, 3, 4, 2]
    );

    // The B frames were submitted with both references.
    let submissions = s.recorder.submissions();
    let pic_param = submissions[2]
        .buffer(BufferType::PictureParameter)
        .unwrap();
    assert!(!pic_param.data.is_empty());
    assert_eq!(s.decoder.dpb(0).unwrap().num_refs(), 2);
}

#[test]
fn busy_execute_is_retried_without_corruption() {
    let mut s = Session::new(0);
    s.recorder.inject(FaultPoint::Execute, Fault::Busy);

    let i = s.picture(0, 0, ReferenceMarking::SlidingWindow, vec![]);
    s.decoder.decode(Session::slice(&i, 64)).unwrap();

    let err = s.decoder.decode(DecodeUnit::FrameComplete).unwrap_err();
    assert!(matches!(err, DecodeError::Busy));
    assert_eq!(err.status(), DecoderStatus::DeviceFailed);
    assert!(s.recorder.submissions().is_empty());

    s.decoder.submit_pending().unwrap();
    assert_eq!(s.decoder.poll(BlockingMode::Blocking).unwrap(), 1);

    let frames = s.output();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].corruption.is_empty());

    // The frame was begun once and its buffers submitted once.
    assert_eq!(s.recorder.begin_count(), 1);
    assert_eq!(s.recorder.submissions().len(), 1);
    assert_eq!(s.decoder.task_store().stats().aborted, 0);

    // Decoding goes on.
    let p = s.picture(1, 2, ReferenceMarking::SlidingWindow, vec![0]);
    s.decode_frame(&p);
    assert!(s.output()[0].corruption.is_empty());
}

#[test]
fn marking_of_absent_picture_corrupts_dependants() {
    let mut s = Session::new(0);

    let i = s.picture(0, 0, ReferenceMarking::SlidingWindow, vec![]);
    let p1 = s.picture(
        1,
        2,
        ReferenceMarking::Adaptive(vec![MarkingCommand::UnmarkPoc { poc: 8 }]),
        vec![0],
    );
    let p2 = s.picture(2, 4, ReferenceMarking::SlidingWindow, vec![2]);
    let idr = s.picture(
        0,
        6,
        ReferenceMarking::Idr {
            long_term: false,
            no_output_of_prior_pics: false,
        },
        vec![],
    );

    for picture in [&i, &p1, &p2, &idr] {
        s.decode_frame(picture);
    }
    s.decoder.decode(DecodeUnit::EndOfStream).unwrap();

    let frames = s.output();
    assert_eq!(pocs(&frames), vec![0, 2, 4, 6]);
    assert!(frames[0].corruption.is_empty());
    assert!(frames[1].corruption.contains(Corruption::DPB));
    assert!(frames[2].corruption.contains(Corruption::REFERENCE_FRAME));
    assert!(frames[3].corruption.is_empty());

    let stats = s.decoder.stats();
    assert_eq!(stats.dpb_errors, 1);
    assert_eq!(stats.corrupted_frames_output, 2);
    assert_eq!(stats.task_store.aborted, 0);
    assert_eq!(s.recorder.submissions().len(), 4);
}

#[test]
fn large_slices_are_chopped_across_rounds() {
    let mut s = Session::with_config(0, DecoderConfig::new(Codec::H264).slice_data_capacity(128));

    let i = s.picture(0, 0, ReferenceMarking::SlidingWindow, vec![]);
    s.decoder.decode(Session::slice(&i, 300)).unwrap();
    s.decoder.decode(DecodeUnit::FrameComplete).unwrap();

    let submissions = s.recorder.submissions();
    assert_eq!(submissions.len(), 3);

    let sizes: Vec<_> = submissions
        .iter()
        .map(|sub| sub.buffer(BufferType::SliceData).unwrap().data.len())
        .collect();
    // The last round holds the 44 remaining bytes, zero padded.
    assert_eq!(sizes, vec![128, 128, 128]);
    let tail = &submissions[2].buffer(BufferType::SliceData).unwrap().data;
    assert_eq!(tail[43], (299 % 256) as u8);
    assert!(tail[44..].iter().all(|b| *b == 0));

    let stats = s.decoder.stats();
    assert_eq!(stats.hardware_rounds, 3);
    assert_eq!(stats.frames_submitted, 1);
}

#[test]
fn decode_errors_are_reported_not_fatal() {
    let mut s = Session::new(0);
    s.recorder.inject(FaultPoint::Sync, Fault::DecodeError);

    let i = s.picture(0, 0, ReferenceMarking::SlidingWindow, vec![]);
    let p = s.picture(1, 2, ReferenceMarking::SlidingWindow, vec![0]);
    s.decode_frame(&i);
    s.decode_frame(&p);

    let frames = s.output();
    assert!(frames[0].corruption.contains(Corruption::MAJOR));
    assert!(frames[1].corruption.contains(Corruption::REFERENCE_FRAME));
}

#[test]
fn refused_execute_delivers_a_corrupted_frame() {
    let mut s = Session::new(0);
    s.recorder.inject(
        FaultPoint::Execute,
        Fault::Status(VaStatus::OperationFailed),
    );

    let i = s.picture(0, 0, ReferenceMarking::SlidingWindow, vec![]);
    let p = s.picture(1, 2, ReferenceMarking::SlidingWindow, vec![0]);
    assert_eq!(s.decode_frame(&i), 1);
    assert_eq!(s.decode_frame(&p), 2);
    s.decoder.decode(DecodeUnit::EndOfStream).unwrap();

    let frames = s.output();
    assert_eq!(pocs(&frames), vec![0, 2]);
    assert!(frames[0].corruption.contains(Corruption::MAJOR));
    assert!(frames[0].corruption.contains(Corruption::DEVICE_FAILURE));
    assert!(frames[1].corruption.contains(Corruption::REFERENCE_FRAME));

    // The refused frame was closed on the driver side and never aborted.
    assert_eq!(s.recorder.begin_count(), s.recorder.end_count());
    assert_eq!(s.recorder.submissions().len(), 1);
    let stats = s.decoder.stats();
    assert_eq!(stats.task_store.aborted, 0);
    assert_eq!(stats.corrupted_frames_output, 2);
    assert_eq!(stats.task_store.free, POOL_SIZE);
}

#[test]
fn device_loss_ends_the_session() {
    let mut s = Session::new(0);

    let i = s.picture(0, 0, ReferenceMarking::SlidingWindow, vec![]);
    s.decode_frame(&i);

    s.recorder.inject(FaultPoint::Begin, Fault::DeviceLost);
    let p = s.picture(1, 2, ReferenceMarking::SlidingWindow, vec![0]);
    s.decoder.decode(Session::slice(&p, 64)).unwrap();

    let err = s.decoder.decode(DecodeUnit::FrameComplete).unwrap_err();
    assert_eq!(err.status(), DecoderStatus::DeviceLost);
    assert!(s.recorder.is_lost());

    // Only the frame in flight was dropped.
    assert_eq!(s.decoder.task_store().stats().aborted, 1);
    assert_eq!(s.decoder.dpb(0).unwrap().len(), 1);

    assert!(matches!(
        s.decoder.decode(DecodeUnit::EndOfStream),
        Err(DecodeError::DeviceLost)
    ));
}

#[test]
fn non_blocking_poll_collects_completed_frames() {
    let mut s = Session::with_config(
        0,
        DecoderConfig::new(Codec::H264).blocking_mode(BlockingMode::NonBlocking),
    );

    let i = s.picture(0, 0, ReferenceMarking::SlidingWindow, vec![]);
    s.decode_frame(&i);
    assert_eq!(s.decoder.poll(BlockingMode::NonBlocking).unwrap(), 0);
    assert_eq!(s.output().len(), 1);
}

#[test]
fn memory_is_released_with_the_session() {
    let mut s = Session::new(1);

    for n in 0..5u16 {
        let poc = i32::from(n) * 2;
        let refs = if n == 0 { vec![] } else { vec![poc - 2] };
        let picture = s.picture(n, poc, ReferenceMarking::SlidingWindow, refs);
        s.decode_frame(&picture);
    }
    s.decoder.decode(DecodeUnit::EndOfStream).unwrap();

    let frames = s.output();
    assert_eq!(pocs(&frames), vec![0, 2, 4, 6, 8]);

    // Two references in the DPB, plus the frames held by the client.
    assert_eq!(s.allocator.num_in_use(), 5);
    drop(frames);
    assert_eq!(s.allocator.num_in_use(), 2);

    let stats = s.decoder.stats();
    assert_eq!(stats.task_store.free, POOL_SIZE);
    assert_eq!(stats.task_store.reclaimed, 5);

    let allocator = Arc::clone(&s.allocator);
    drop(s);
    assert_eq!(allocator.num_in_use(), 0);
}
