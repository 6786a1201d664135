//! Pure segment/turn merge: assigns each transcript segment the speaker of
//! the diarization turn it overlaps most. Uses a straightforward `O(N*M)`
//! scan rather than a sweep-line optimization, since N and M are bounded by
//! audio length in practice.

use std::collections::BTreeSet;

use crate::job::{DiarizationTurn, TranscriptSegment};

fn overlap(seg_start: f64, seg_end: f64, turn: &DiarizationTurn) -> f64 {
    let start = seg_start.max(turn.start_sec);
    let end = seg_end.min(turn.end_sec);
    (end - start).max(0.0)
}

/// Assign a `speaker_label` to each segment by maximum temporal overlap with
/// `turns`, ties broken by the earlier turn start. Segments with zero overlap
/// against every turn are left unlabeled. Returns the merged segments and the
/// distinct set of speaker labels that appear among them.
pub fn merge_segments(
    segments: Vec<TranscriptSegment>,
    turns: &[DiarizationTurn],
) -> (Vec<TranscriptSegment>, Vec<String>) {
    if turns.is_empty() || segments.is_empty() {
        return (segments, Vec::new());
    }

    let mut speakers = BTreeSet::new();
    let merged = segments
        .into_iter()
        .map(|mut seg| {
            let mut best: Option<(&DiarizationTurn, f64)> = None;
            for turn in turns {
                let ov = overlap(seg.start_sec, seg.end_sec, turn);
                if ov <= 0.0 {
                    continue;
                }
                best = match best {
                    None => Some((turn, ov)),
                    Some((best_turn, best_ov)) => {
                        if ov > best_ov
                            || (ov == best_ov && turn.start_sec < best_turn.start_sec)
                        {
                            Some((turn, ov))
                        } else {
                            Some((best_turn, best_ov))
                        }
                    }
                };
            }
            if let Some((turn, _)) = best {
                speakers.insert(turn.speaker_label.clone());
                seg.speaker_label = Some(turn.speaker_label.clone());
            }
            seg
        })
        .collect();

    (merged, speakers.into_iter().collect())
}
