//! Pure rendition selection. No I/O, deterministic, inputs untouched.

use crate::catalog::Rendition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    AudioOnly,
    VideoWithAudio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityPreference {
    Best,
    ExactVideoHeight(u32),
    /// Exact match when the catalog offers it, otherwise the maximum
    /// available bitrate. The preference never constrains the audio half
    /// of a dual-stream plan.
    ExactAudioBitrate(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputRequest {
    pub kind: OutputKind,
    pub quality: QualityPreference,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectionPlan {
    Single(Rendition),
    Dual { video: Rendition, audio: Rendition },
    NoPlan,
}

impl SelectionPlan {
    pub fn is_none(&self) -> bool {
        matches!(self, SelectionPlan::NoPlan)
    }
}

/// Picks the best-fitting rendition(s) for the request.
///
/// Combined (video+audio) renditions always win over a dual-stream pair:
/// exact height first, then the closest height below the request, then
/// the highest available. Only when no combined rendition exists at all
/// does selection fall through to a separate video-only / audio-only
/// pair.
pub fn select(renditions: &[Rendition], request: &OutputRequest) -> SelectionPlan {
    match request.kind {
        OutputKind::AudioOnly => select_audio_only(renditions, request.quality),
        OutputKind::VideoWithAudio => {
            if let Some(combined) = select_combined(renditions, request.quality) {
                return SelectionPlan::Single(combined.clone());
            }
            select_dual(renditions, request.quality)
        }
    }
}

/// Dual-stream fallback, exposed separately so a failed single-stream
/// acquisition can re-plan against the original rendition list.
pub fn select_dual(renditions: &[Rendition], quality: QualityPreference) -> SelectionPlan {
    let video = pick_video(
        renditions
            .iter()
            .filter(|r| r.schedulable() && r.has_video && !r.has_audio && r.video_height.is_some()),
        quality,
    );
    let audio = best_by(
        renditions
            .iter()
            .filter(|r| r.schedulable() && !r.has_video && r.has_audio),
        |r| r.audio_bitrate_kbps,
    );
    match (video, audio) {
        (Some(video), Some(audio)) => SelectionPlan::Dual {
            video: video.clone(),
            audio: audio.clone(),
        },
        _ => SelectionPlan::NoPlan,
    }
}

fn select_combined(renditions: &[Rendition], quality: QualityPreference) -> Option<&Rendition> {
    pick_video(
        renditions
            .iter()
            .filter(|r| r.schedulable() && r.has_video && r.has_audio && r.video_height.is_some()),
        quality,
    )
}

fn select_audio_only(renditions: &[Rendition], quality: QualityPreference) -> SelectionPlan {
    let candidates = || {
        renditions
            .iter()
            .filter(|r| r.schedulable() && !r.has_video && r.has_audio)
            .filter(|r| r.audio_bitrate_kbps.is_some())
    };
    let picked = match quality {
        QualityPreference::ExactAudioBitrate(kbps) => best_by(
            candidates().filter(|r| r.audio_bitrate_kbps == Some(kbps)),
            |r| r.audio_bitrate_kbps,
        )
        .or_else(|| best_by(candidates(), |r| r.audio_bitrate_kbps)),
        _ => best_by(candidates(), |r| r.audio_bitrate_kbps),
    };
    match picked {
        Some(rendition) => SelectionPlan::Single(rendition.clone()),
        None => SelectionPlan::NoPlan,
    }
}

fn pick_video<'a>(
    candidates: impl Iterator<Item = &'a Rendition> + Clone,
    quality: QualityPreference,
) -> Option<&'a Rendition> {
    match quality {
        QualityPreference::ExactVideoHeight(height) => {
            let exact = best_by(
                candidates.clone().filter(|r| r.video_height == Some(height)),
                |r| r.video_height,
            );
            if exact.is_some() {
                return exact;
            }
            // Closest without exceeding; above-target heights only as a
            // last resort.
            best_by(
                candidates
                    .clone()
                    .filter(|r| r.video_height.is_some_and(|h| h <= height)),
                |r| r.video_height,
            )
            .or_else(|| best_by(candidates, |r| r.video_height))
        }
        _ => best_by(candidates, |r| r.video_height),
    }
}

/// Maximum by `key`, ties broken by larger size hint, then first in
/// catalog order.
fn best_by<'a, F>(candidates: impl Iterator<Item = &'a Rendition>, key: F) -> Option<&'a Rendition>
where
    F: Fn(&Rendition) -> Option<u32>,
{
    let mut best: Option<&Rendition> = None;
    for candidate in candidates {
        let Some(candidate_key) = key(candidate) else {
            continue;
        };
        best = match best {
            None => Some(candidate),
            Some(current) => {
                let current_key = key(current).unwrap_or(0);
                if candidate_key > current_key
                    || (candidate_key == current_key
                        && candidate.size_hint.unwrap_or(0) > current.size_hint.unwrap_or(0))
                {
                    Some(candidate)
                } else {
                    Some(current)
                }
            }
        };
    }
    best
}
