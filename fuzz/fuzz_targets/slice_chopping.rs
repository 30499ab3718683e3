#![no_main]

use std::sync::Arc;

use cros_hwdec::backend::dummy::RecordingAccelerator;
use cros_hwdec::codec::h264;
use cros_hwdec::codec::PictureParams;
use cros_hwdec::codec::SequenceParams;
use cros_hwdec::codec::SliceSyntax;
use cros_hwdec::config::DecoderConfig;
use cros_hwdec::decoder::DecodeUnit;
use cros_hwdec::decoder::Decoder;
use cros_hwdec::decoder::PictureHeader;
use cros_hwdec::decoder::Slice;
use cros_hwdec::memory::SlotTable;
use cros_hwdec::packer::SliceMode;
use cros_hwdec::Codec;
use libfuzzer_sys::fuzz_target;

// The first byte selects the slice data capacity and the slice mode, every following group is a
// slice: one byte of header size in bytes, one byte of payload length, then the payload.
fn run(data: &[u8]) -> anyhow::Result<()> {
    let Some((&head, mut rest)) = data.split_first() else {
        return Ok(());
    };

    let slice_mode = if head & 0x80 != 0 {
        SliceMode::Short
    } else {
        SliceMode::Long
    };
    let config = DecoderConfig::new(Codec::H264)
        .slice_data_capacity(128 * (1 + usize::from(head & 0x7)))
        .slice_mode(slice_mode)
        .pool_size(4);

    let mut decoder = Decoder::new(
        config,
        Box::new(RecordingAccelerator::new()),
        SlotTable::shared(8),
    )?;

    let sps = Arc::new(h264::Sps {
        frame_mbs_only_flag: true,
        max_num_ref_frames: 1,
        ..Default::default()
    });
    decoder.set_sequence(SequenceParams::H264(Arc::clone(&sps)))?;

    let params = h264::PictureParams {
        sps,
        ..Default::default()
    };
    let picture = Arc::new(PictureHeader::new(PictureParams::H264(params), 0));

    while let [header_size, len, tail @ ..] = rest {
        let len = std::cmp::min(usize::from(*len) * 4, tail.len());
        let (payload, next) = tail.split_at(len);
        rest = next;

        let header = h264::SliceHeader {
            header_bit_size: usize::from(*header_size) * 8,
            ..Default::default()
        };
        let slice = Slice::new(
            Arc::clone(&picture),
            SliceSyntax::H264(header),
            payload.to_vec(),
        );
        decoder.decode(DecodeUnit::Slice(slice))?;
    }

    decoder.decode(DecodeUnit::EndOfStream)?;
    while decoder.next_frame().is_some() {}

    Ok(())
}

fuzz_target!(|data: &[u8]| {
    let _ = run(data);
});
