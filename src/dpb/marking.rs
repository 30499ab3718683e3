// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture marking.
//!
//! Every picture carries one [`ReferenceMarking`] telling how the references of the DPB change
//! once it is decoded: the H.264 sliding window and memory management control operations, and the
//! H.265 style reference picture set where everything not listed is dropped.

use log::debug;
use log::warn;
use thiserror::Error;

use crate::dpb::Dpb;
use crate::dpb::DpbError;
use crate::dpb::DpbResult;
use crate::frame::Corruption;
use crate::frame::DecoderFrame;
use crate::frame::FrameKey;
use crate::frame::Reference;

/// An explicit marking command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MarkingCommand {
    /// MMCO 1: a short term reference stops being a reference.
    UnmarkShortTerm { difference_of_pic_nums_minus1: u32 },
    /// MMCO 2: a long term reference stops being a reference.
    UnmarkLongTerm { long_term_pic_num: i32 },
    /// MMCO 3: a short term reference becomes a long term one.
    ShortTermToLongTerm {
        difference_of_pic_nums_minus1: u32,
        long_term_frame_idx: i32,
    },
    /// MMCO 4
    SetMaxLongTermFrameIdx { max_long_term_frame_idx_plus1: i32 },
    /// MMCO 5: every reference is dropped.
    UnmarkAll,
    /// MMCO 6: the current picture becomes a long term reference.
    CurrentToLongTerm { long_term_frame_idx: i32 },
    /// The reference with the given picture order count stops being a reference.
    UnmarkPoc { poc: i32 },
}

/// How the references of the DPB evolve when a picture is stored.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ReferenceMarking {
    /// The picture is not used for reference and nothing else changes.
    #[default]
    NonReference,
    /// Instantaneous decoder refresh: every previous reference is dropped.
    Idr {
        long_term: bool,
        /// Frames waiting for output are discarded instead of being output.
        no_output_of_prior_pics: bool,
    },
    /// The picture is a short term reference, the oldest one is evicted when the DPB is full.
    SlidingWindow,
    Adaptive(Vec<MarkingCommand>),
    /// Only the listed pictures remain references.
    ReferenceSet {
        short_term: Vec<i32>,
        long_term: Vec<i32>,
    },
}

/// A marking command could not be applied. The frame was stored nonetheless, under `key`.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("reference marking of frame {key:?} failed: {source}")]
pub struct MarkingError {
    pub key: FrameKey,
    pub source: DpbError,
}

impl Dpb {
    /// Stores `frame` and updates the references of the DPB according to `marking`.
    ///
    /// The frame is always inserted. If a command refers to a picture that is not in the DPB, the
    /// remaining commands are still applied, the new frame is flagged [`Corruption::DPB`] and the
    /// first such failure is returned.
    pub fn update_reference_marking(
        &mut self,
        mut frame: DecoderFrame,
        marking: &ReferenceMarking,
    ) -> Result<FrameKey, MarkingError> {
        let mut errors = Vec::new();

        self.update_frame_num_wrap(frame.frame_num);
        frame.frame_num_wrap = frame.frame_num;

        frame.reference = match marking {
            ReferenceMarking::NonReference => Reference::None,
            ReferenceMarking::Idr {
                long_term,
                no_output_of_prior_pics,
            } => {
                self.mark_idr(*no_output_of_prior_pics);

                if *long_term {
                    frame.long_term_frame_idx = 0;
                    self.max_long_term_frame_idx = Some(0);
                    Reference::LongTerm
                } else {
                    self.max_long_term_frame_idx = None;
                    Reference::ShortTerm
                }
            }
            ReferenceMarking::SlidingWindow => Reference::ShortTerm,
            ReferenceMarking::Adaptive(commands) => {
                let mut reference = Reference::ShortTerm;

                for command in commands {
                    if let Err(e) = self.apply_command(command, &mut frame, &mut reference) {
                        warn!("Failed to apply {:?}: {}", command, e);
                        errors.push(e);
                    }
                }

                reference
            }
            ReferenceMarking::ReferenceSet {
                short_term,
                long_term,
            } => {
                errors.extend(self.apply_reference_set(short_term, long_term));
                Reference::ShortTerm
            }
        };

        if frame.is_ref() {
            if let Err(e) = self.make_room_for_reference() {
                warn!("Could not make room for POC {}: {}", frame.poc, e);
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            frame.corruption |= Corruption::DPB;
            self.num_errors += errors.len() as u64;
        }

        self.remove_unused();
        let key = self.insert(frame);

        match errors.into_iter().next() {
            Some(source) => Err(MarkingError { key, source }),
            None => Ok(key),
        }
    }

    /// Applies `f` to every stored frame, in insertion order.
    fn for_each_frame_mut(&mut self, mut f: impl FnMut(&mut DecoderFrame)) {
        for key in self.keys() {
            if let Some(frame) = self.get_mut(key) {
                f(frame);
            }
        }
    }

    /// Derives `FrameNumWrap` of the short term references for a picture with `frame_num`.
    fn update_frame_num_wrap(&mut self, frame_num: i32) {
        let max_frame_num = self.max_frame_num;

        self.for_each_frame_mut(|f| {
            if f.is_short_term() {
                f.frame_num_wrap = if max_frame_num > 0 && f.frame_num > frame_num {
                    f.frame_num - max_frame_num
                } else {
                    f.frame_num
                };
            }
        });
    }

    fn unmark_all(&mut self) {
        self.for_each_frame_mut(|f| f.reference = Reference::None);
    }

    fn mark_idr(&mut self, no_output_of_prior_pics: bool) {
        if no_output_of_prior_pics {
            debug!("IDR discards the {} frames of the DPB", self.len());
            self.clear();
        } else {
            self.unmark_all();
        }
    }

    /// Evicts references until a new reference fits: short term ones first, lowest POC first.
    ///
    /// If only long term references are left, the one with the lowest `LongTermFrameIdx` goes
    /// and [`DpbError::NoShortTermToEvict`] is reported once room has been made.
    fn make_room_for_reference(&mut self) -> DpbResult<()> {
        let max_num_refs = std::cmp::max(1, self.capacity.max_num_refs);
        let mut result = Ok(());

        while self.num_refs() >= max_num_refs {
            // min_by_key keeps the first of equal elements, i.e. the oldest one.
            let short_term = self
                .iter()
                .filter(|(_, f)| f.is_short_term())
                .min_by_key(|(_, f)| f.poc)
                .map(|(key, _)| key);

            let to_evict = match short_term {
                Some(key) => key,
                None => {
                    let long_term = self
                        .iter()
                        .filter(|(_, f)| f.is_long_term())
                        .min_by_key(|(_, f)| f.long_term_frame_idx)
                        .map(|(key, _)| key);

                    let Some(key) = long_term else {
                        break;
                    };
                    result = Err(DpbError::NoShortTermToEvict);
                    key
                }
            };

            let frame = self.frame_mut(to_evict)?;
            debug!("Evicting {:?} reference POC {}", frame.reference, frame.poc);
            frame.reference = Reference::None;
        }

        result
    }

    fn find_short_term_by_pic_num(&self, pic_num: i32) -> Option<FrameKey> {
        self.iter()
            .find(|(_, f)| f.is_short_term() && f.pic_num() == pic_num)
            .map(|(key, _)| key)
    }

    fn find_long_term_by_pic_num(&self, long_term_pic_num: i32) -> Option<FrameKey> {
        self.iter()
            .find(|(_, f)| f.is_long_term() && f.long_term_pic_num() == long_term_pic_num)
            .map(|(key, _)| key)
    }

    fn unmark_long_term_frame_idx(&mut self, long_term_frame_idx: i32) {
        self.for_each_frame_mut(|f| {
            if f.is_long_term() && f.long_term_frame_idx == long_term_frame_idx {
                f.reference = Reference::None;
            }
        });
    }

    fn apply_command(
        &mut self,
        command: &MarkingCommand,
        current: &mut DecoderFrame,
        reference: &mut Reference,
    ) -> DpbResult<()> {
        debug!("Applying {:?} for POC {}", command, current.poc);

        match *command {
            MarkingCommand::UnmarkShortTerm {
                difference_of_pic_nums_minus1,
            } => {
                let pic_num_x = current.pic_num() - (difference_of_pic_nums_minus1 as i32 + 1);
                let key = self
                    .find_short_term_by_pic_num(pic_num_x)
                    .ok_or(DpbError::MissingPicNum(pic_num_x))?;
                self.frame_mut(key)?.reference = Reference::None;
            }
            MarkingCommand::UnmarkLongTerm { long_term_pic_num } => {
                let key = self
                    .find_long_term_by_pic_num(long_term_pic_num)
                    .ok_or(DpbError::MissingLongTermPicNum(long_term_pic_num))?;
                self.frame_mut(key)?.reference = Reference::None;
            }
            MarkingCommand::ShortTermToLongTerm {
                difference_of_pic_nums_minus1,
                long_term_frame_idx,
            } => {
                let pic_num_x = current.pic_num() - (difference_of_pic_nums_minus1 as i32 + 1);
                let key = self
                    .find_short_term_by_pic_num(pic_num_x)
                    .ok_or(DpbError::MissingPicNum(pic_num_x))?;

                self.unmark_long_term_frame_idx(long_term_frame_idx);

                let frame = self.frame_mut(key)?;
                frame.reference = Reference::LongTerm;
                frame.long_term_frame_idx = long_term_frame_idx;
            }
            MarkingCommand::SetMaxLongTermFrameIdx {
                max_long_term_frame_idx_plus1,
            } => {
                let max = (max_long_term_frame_idx_plus1 > 0)
                    .then_some(max_long_term_frame_idx_plus1 - 1);

                self.for_each_frame_mut(|f| {
                    if f.is_long_term() && max.map_or(true, |max| f.long_term_frame_idx > max) {
                        f.reference = Reference::None;
                    }
                });
                self.max_long_term_frame_idx = max;
            }
            MarkingCommand::UnmarkAll => {
                self.unmark_all();
                self.max_long_term_frame_idx = None;
                current.frame_num = 0;
                current.frame_num_wrap = 0;
            }
            MarkingCommand::CurrentToLongTerm {
                long_term_frame_idx,
            } => {
                self.unmark_long_term_frame_idx(long_term_frame_idx);
                current.long_term_frame_idx = long_term_frame_idx;
                *reference = Reference::LongTerm;
            }
            MarkingCommand::UnmarkPoc { poc } => {
                let key = self.find_ref_by_poc(poc).ok_or(DpbError::MissingPoc(poc))?;
                self.frame_mut(key)?.reference = Reference::None;
            }
        }

        Ok(())
    }

    /// Keeps as references only the pictures listed, and reports the listed ones that are
    /// missing.
    fn apply_reference_set(&mut self, short_term: &[i32], long_term: &[i32]) -> Vec<DpbError> {
        let mut errors = Vec::new();

        for &poc in short_term {
            if !self.iter().any(|(_, f)| f.is_short_term() && f.poc == poc) {
                warn!("Short term reference POC {} is not in the DPB", poc);
                errors.push(DpbError::MissingPoc(poc));
            }
        }

        for &poc in long_term {
            if self.find_ref_by_poc(poc).is_none() {
                warn!("Long term reference POC {} is not in the DPB", poc);
                errors.push(DpbError::MissingPoc(poc));
            }
        }

        self.for_each_frame_mut(|f| {
            if !f.is_ref() {
                return;
            }

            f.reference = if long_term.contains(&f.poc) {
                Reference::LongTerm
            } else if f.is_short_term() && short_term.contains(&f.poc) {
                Reference::ShortTerm
            } else {
                Reference::None
            };
        });

        errors
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::codec::DpbCapacity;
    use crate::memory::FrameAllocator;
    use crate::memory::FrameInfo;
    use crate::memory::FrameRef;
    use crate::memory::SlotTable;

    struct Fixture {
        table: Arc<SlotTable>,
        allocator: Arc<dyn FrameAllocator>,
        dpb: Dpb,
        counter: u64,
    }

    impl Fixture {
        fn new(max_num_refs: usize) -> Self {
            let table = Arc::new(SlotTable::new(32));
            let allocator: Arc<dyn FrameAllocator> = table.clone();
            let capacity = DpbCapacity {
                max_num_pics: 16,
                max_num_refs,
                max_num_reorder: 16,
            };

            Self {
                table,
                allocator,
                dpb: Dpb::new(capacity, 0),
                counter: 0,
            }
        }

        fn frame(&mut self, poc: i32, frame_num: i32) -> DecoderFrame {
            self.counter += 1;
            let memory = FrameRef::alloc(&self.allocator, &FrameInfo::default()).unwrap();
            let mut frame = DecoderFrame::new(memory, poc, self.counter);
            frame.frame_num = frame_num;
            frame
        }

        fn store(
            &mut self,
            poc: i32,
            frame_num: i32,
            marking: ReferenceMarking,
        ) -> Result<FrameKey, MarkingError> {
            let frame = self.frame(poc, frame_num);
            self.dpb.update_reference_marking(frame, &marking)
        }

        fn ref_pocs(&self) -> Vec<(i32, Reference)> {
            self.dpb
                .iter()
                .filter(|(_, f)| f.is_ref())
                .map(|(_, f)| (f.poc, f.reference))
                .collect()
        }
    }

    #[test]
    fn sliding_window_evicts_lowest_poc() {
        let mut fx = Fixture::new(2);

        fx.store(0, 0, ReferenceMarking::SlidingWindow).unwrap();
        fx.store(8, 1, ReferenceMarking::SlidingWindow).unwrap();
        fx.store(4, 2, ReferenceMarking::SlidingWindow).unwrap();

        assert_eq!(
            fx.ref_pocs(),
            vec![(8, Reference::ShortTerm), (4, Reference::ShortTerm)]
        );
        // The evicted frame still awaits output.
        assert_eq!(fx.dpb.len(), 3);
    }

    #[test]
    fn eviction_ties_are_broken_by_insertion_order() {
        let mut fx = Fixture::new(2);

        let first = fx.store(2, 0, ReferenceMarking::SlidingWindow).unwrap();
        let second = fx.store(2, 1, ReferenceMarking::SlidingWindow).unwrap();
        fx.store(6, 2, ReferenceMarking::SlidingWindow).unwrap();

        assert!(!fx.dpb.get(first).unwrap().is_ref());
        assert!(fx.dpb.get(second).unwrap().is_ref());
    }

    #[test]
    fn reference_count_never_exceeds_capacity() {
        let mut fx = Fixture::new(3);

        for i in 0..10 {
            fx.store(i * 2, i, ReferenceMarking::SlidingWindow).unwrap();
            assert!(fx.dpb.num_refs() <= 3);
        }
    }

    #[test]
    fn long_term_references_are_evicted_when_no_short_term_is_left() {
        let mut fx = Fixture::new(2);

        for (i, idx) in [3, 1, 2].into_iter().enumerate() {
            let res = fx.store(
                i as i32 * 2,
                i as i32,
                ReferenceMarking::Adaptive(vec![MarkingCommand::CurrentToLongTerm {
                    long_term_frame_idx: idx,
                }]),
            );
            assert!(fx.dpb.num_refs() <= 2);

            if i < 2 {
                res.unwrap();
            } else {
                let err = res.unwrap_err();
                assert_eq!(err.source, DpbError::NoShortTermToEvict);
                let frame = fx.dpb.get(err.key).unwrap();
                assert!(frame.corruption.contains(Corruption::DPB));
            }
        }

        // The reference with the lowest LongTermFrameIdx made room for the new one.
        assert_eq!(
            fx.ref_pocs(),
            vec![(0, Reference::LongTerm), (4, Reference::LongTerm)]
        );
        assert_eq!(fx.dpb.num_errors(), 1);
    }

    #[test]
    fn unused_frames_release_their_memory() {
        let mut fx = Fixture::new(1);

        let key = fx.store(0, 0, ReferenceMarking::SlidingWindow).unwrap();
        fx.dpb.get_mut(key).unwrap().needed_for_output = false;
        assert_eq!(fx.table.num_in_use(), 1);

        fx.store(2, 1, ReferenceMarking::SlidingWindow).unwrap();
        assert!(fx.dpb.get(key).is_none());
        assert_eq!(fx.table.num_in_use(), 1);
    }

    #[test]
    fn missing_poc_is_reported_after_insertion() {
        let mut fx = Fixture::new(4);
        fx.store(0, 0, ReferenceMarking::SlidingWindow).unwrap();
        fx.store(4, 1, ReferenceMarking::SlidingWindow).unwrap();

        let err = fx
            .store(
                8,
                2,
                ReferenceMarking::Adaptive(vec![
                    MarkingCommand::UnmarkPoc { poc: 42 },
                    MarkingCommand::UnmarkPoc { poc: 0 },
                ]),
            )
            .unwrap_err();

        assert_eq!(err.source, DpbError::MissingPoc(42));
        let frame = fx.dpb.get(err.key).unwrap();
        assert_eq!(frame.poc, 8);
        assert!(frame.corruption.contains(Corruption::DPB));
        assert_eq!(fx.dpb.num_errors(), 1);

        // The command after the failing one was applied.
        assert_eq!(
            fx.ref_pocs(),
            vec![(4, Reference::ShortTerm), (8, Reference::ShortTerm)]
        );
    }

    #[test]
    fn mmco_short_and_long_term() {
        let mut fx = Fixture::new(4);
        fx.store(0, 0, ReferenceMarking::SlidingWindow).unwrap();
        fx.store(2, 1, ReferenceMarking::SlidingWindow).unwrap();

        // pic_num_x = 2 - (0 + 1) = 1, i.e. POC 2 becomes long term index 0.
        fx.store(
            4,
            2,
            ReferenceMarking::Adaptive(vec![MarkingCommand::ShortTermToLongTerm {
                difference_of_pic_nums_minus1: 0,
                long_term_frame_idx: 0,
            }]),
        )
        .unwrap();

        assert_eq!(
            fx.ref_pocs(),
            vec![
                (0, Reference::ShortTerm),
                (2, Reference::LongTerm),
                (4, Reference::ShortTerm)
            ]
        );

        // pic_num_x = 3 - (2 + 1) = 0, i.e. POC 0. Then long term index 0 goes away.
        fx.store(
            6,
            3,
            ReferenceMarking::Adaptive(vec![
                MarkingCommand::UnmarkShortTerm {
                    difference_of_pic_nums_minus1: 2,
                },
                MarkingCommand::UnmarkLongTerm {
                    long_term_pic_num: 0,
                },
            ]),
        )
        .unwrap();

        assert_eq!(
            fx.ref_pocs(),
            vec![(4, Reference::ShortTerm), (6, Reference::ShortTerm)]
        );
    }

    #[test]
    fn frame_num_wraps() {
        let mut fx = Fixture::new(4);
        fx.dpb.set_max_frame_num(16);

        fx.store(0, 15, ReferenceMarking::SlidingWindow).unwrap();
        // FrameNumWrap of frame_num 15 is -1 once frame_num wrapped to 0.
        fx.store(
            2,
            0,
            ReferenceMarking::Adaptive(vec![MarkingCommand::UnmarkShortTerm {
                difference_of_pic_nums_minus1: 0,
            }]),
        )
        .unwrap();

        assert_eq!(fx.ref_pocs(), vec![(2, Reference::ShortTerm)]);
    }

    #[test]
    fn current_to_long_term_and_max_idx() {
        let mut fx = Fixture::new(4);
        fx.store(
            0,
            0,
            ReferenceMarking::Adaptive(vec![MarkingCommand::CurrentToLongTerm {
                long_term_frame_idx: 1,
            }]),
        )
        .unwrap();
        assert_eq!(fx.ref_pocs(), vec![(0, Reference::LongTerm)]);

        fx.store(
            2,
            1,
            ReferenceMarking::Adaptive(vec![MarkingCommand::SetMaxLongTermFrameIdx {
                max_long_term_frame_idx_plus1: 1,
            }]),
        )
        .unwrap();
        assert_eq!(fx.ref_pocs(), vec![(2, Reference::ShortTerm)]);
    }

    #[test]
    fn reference_set_keeps_listed_pictures() {
        let mut fx = Fixture::new(8);
        for (i, poc) in [0, 4, 8].into_iter().enumerate() {
            fx.store(poc, i as i32, ReferenceMarking::SlidingWindow)
                .unwrap();
        }

        let err = fx
            .store(
                16,
                3,
                ReferenceMarking::ReferenceSet {
                    short_term: vec![4, 12],
                    long_term: vec![8],
                },
            )
            .unwrap_err();

        assert_eq!(err.source, DpbError::MissingPoc(12));
        assert_eq!(
            fx.ref_pocs(),
            vec![
                (4, Reference::ShortTerm),
                (8, Reference::LongTerm),
                (16, Reference::ShortTerm)
            ]
        );
    }

    #[test]
    fn idr_drops_references() {
        let mut fx = Fixture::new(4);
        fx.store(0, 0, ReferenceMarking::SlidingWindow).unwrap();
        fx.store(2, 1, ReferenceMarking::SlidingWindow).unwrap();

        fx.store(
            0,
            0,
            ReferenceMarking::Idr {
                long_term: false,
                no_output_of_prior_pics: false,
            },
        )
        .unwrap();
        assert_eq!(fx.dpb.num_refs(), 1);
        // The previous frames still await output.
        assert_eq!(fx.dpb.len(), 3);

        fx.store(
            0,
            0,
            ReferenceMarking::Idr {
                long_term: true,
                no_output_of_prior_pics: true,
            },
        )
        .unwrap();
        assert_eq!(fx.dpb.len(), 1);
        assert_eq!(fx.ref_pocs(), vec![(0, Reference::LongTerm)]);
        assert_eq!(fx.table.num_in_use(), 1);
    }

    #[test]
    fn non_reference_pictures_do_not_evict() {
        let mut fx = Fixture::new(1);
        fx.store(0, 0, ReferenceMarking::SlidingWindow).unwrap();
        fx.store(2, 1, ReferenceMarking::NonReference).unwrap();

        assert_eq!(fx.ref_pocs(), vec![(0, Reference::ShortTerm)]);
    }
}
