//! Stream composition
//!
//! Folds the camera and screen sources into the single outgoing stream:
//!
//! - video: screen video if screen is enabled and live, else camera video if
//!   enabled, else none
//! - audio: screen audio if present and live, else microphone audio if
//!   enabled, else none
//!
//! The composer only decides *what* is sent. Swapping tracks on live
//! connections and stopping replaced tracks is up to the owner, which must
//! attach the replacement everywhere before stopping the old track.

use crate::capture::{MediaSource, MediaTrack, TrackKind};
use crate::error::{Error, Result};
use tracing::{debug, warn};

/// How many times a composition is recomputed when a track ends mid-compose
const MAX_COMPOSE_ATTEMPTS: usize = 3;

/// The outgoing stream: at most one video and one audio track
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposedStream {
    video: Option<MediaTrack>,
    audio: Option<MediaTrack>,
}

impl ComposedStream {
    #[must_use]
    pub fn new(video: Option<MediaTrack>, audio: Option<MediaTrack>) -> Self {
        Self { video, audio }
    }

    #[must_use]
    pub fn video(&self) -> Option<&MediaTrack> {
        self.video.as_ref()
    }

    #[must_use]
    pub fn audio(&self) -> Option<&MediaTrack> {
        self.audio.as_ref()
    }

    #[must_use]
    pub fn track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        match kind {
            TrackKind::Video => self.video.as_ref(),
            TrackKind::Audio => self.audio.as_ref(),
        }
    }

    /// Set or clear the track of one kind
    pub fn set_track(&mut self, kind: TrackKind, track: Option<MediaTrack>) {
        match kind {
            TrackKind::Video => self.video = track,
            TrackKind::Audio => self.audio = track,
        }
    }

    pub fn tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.video.iter().chain(self.audio.iter())
    }

    #[must_use]
    pub fn track_count(&self) -> usize {
        self.tracks().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }

    /// Check that every selected track is still live
    pub fn validate(&self) -> Result<()> {
        match self.tracks().find(|t| !t.is_live()) {
            Some(dead) => Err(Error::CompositionConflict(format!(
                "selected {} track {} has ended",
                dead.kind(),
                dead.id()
            ))),
            None => Ok(()),
        }
    }
}

/// Compose the outgoing stream from the enabled sources.
///
/// `screen` being present means screen sharing is enabled. Camera tracks
/// additionally honour their per-track enabled flag.
#[must_use]
pub fn compose(camera: Option<&MediaSource>, screen: Option<&MediaSource>) -> ComposedStream {
    let camera_video = camera
        .and_then(MediaSource::live_video)
        .filter(|t| t.is_enabled());
    let camera_audio = camera
        .and_then(MediaSource::live_audio)
        .filter(|t| t.is_enabled());

    let video = screen.and_then(MediaSource::live_video).or(camera_video);
    let audio = screen.and_then(MediaSource::live_audio).or(camera_audio);

    ComposedStream {
        video: video.cloned(),
        audio: audio.cloned(),
    }
}

/// One track slot that changed between compositions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSwap {
    pub kind: TrackKind,
    pub previous: Option<MediaTrack>,
    pub next: Option<MediaTrack>,
}

/// Result of a recomposition that changed the outgoing stream
#[derive(Debug, Clone)]
pub struct Recomposition {
    pub generation: u64,
    pub swaps: Vec<TrackSwap>,
}

/// Owns the current composition. Recompositions are totally ordered by
/// `&mut self`.
#[derive(Debug, Default)]
pub struct StreamComposer {
    current: ComposedStream,
    generation: u64,
}

impl StreamComposer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current(&self) -> &ComposedStream {
        &self.current
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Recompute the composition. Returns `None` when nothing changed.
    ///
    /// A track ending between selection and validation is a conflict; the
    /// composition is recomputed rather than returned.
    pub fn recompose(
        &mut self,
        camera: Option<&MediaSource>,
        screen: Option<&MediaSource>,
    ) -> Option<Recomposition> {
        let mut next = compose(camera, screen);
        for attempt in 1..MAX_COMPOSE_ATTEMPTS {
            match next.validate() {
                Ok(()) => break,
                Err(e) => {
                    debug!(attempt, error = %e, "Recomputing composition");
                    next = compose(camera, screen);
                }
            }
        }
        if let Err(e) = next.validate() {
            // Tracks keep ending under us; drop the dead ones.
            warn!(error = %e, "Composition still conflicting, dropping ended tracks");
            next.video = next.video.filter(MediaTrack::is_live);
            next.audio = next.audio.filter(MediaTrack::is_live);
        }

        let swaps: Vec<TrackSwap> = [TrackKind::Video, TrackKind::Audio]
            .into_iter()
            .filter(|kind| self.current.track(*kind) != next.track(*kind))
            .map(|kind| TrackSwap {
                kind,
                previous: self.current.track(kind).cloned(),
                next: next.track(kind).cloned(),
            })
            .collect();

        if swaps.is_empty() {
            return None;
        }

        self.current = next;
        self.generation += 1;
        debug!(
            generation = self.generation,
            video = ?self.current.video().map(MediaTrack::id),
            audio = ?self.current.audio().map(MediaTrack::id),
            "Recomposed outgoing stream"
        );

        Some(Recomposition {
            generation: self.generation,
            swaps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{SourceKind, TrackSettings};

    fn source(kind: SourceKind, video: bool, audio: bool) -> MediaSource {
        let mut tracks = Vec::new();
        if video {
            tracks.push(MediaTrack::new(TrackKind::Video, kind, "v", TrackSettings::default()));
        }
        if audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, kind, "a", TrackSettings::default()));
        }
        MediaSource::new(kind, tracks, None)
    }

    #[test]
    fn test_priority_for_every_enabled_combination() {
        // (camera enabled, screen enabled), screen has no audio
        for (camera_on, screen_on) in [(false, true), (true, false), (true, true)] {
            let camera = source(SourceKind::Camera, true, true);
            let screen = source(SourceKind::Screen, true, false);

            let stream = compose(camera_on.then_some(&camera), screen_on.then_some(&screen));

            let video = stream.video().expect("exactly one video track");
            let expected_video = if screen_on { SourceKind::Screen } else { SourceKind::Camera };
            assert_eq!(video.source(), expected_video, "camera={camera_on} screen={screen_on}");
            assert!(stream.track_count() <= 2);

            if camera_on {
                assert_eq!(stream.audio().unwrap().source(), SourceKind::Camera);
            } else {
                assert!(stream.audio().is_none());
            }
        }
    }

    #[test]
    fn test_screen_audio_preferred_over_microphone() {
        let camera = source(SourceKind::Camera, true, true);
        let screen = source(SourceKind::Screen, true, true);

        let stream = compose(Some(&camera), Some(&screen));
        assert_eq!(stream.audio().unwrap().source(), SourceKind::Screen);
        assert_eq!(stream.track_count(), 2);
    }

    #[test]
    fn test_disabled_camera_tracks_are_skipped() {
        let camera = source(SourceKind::Camera, true, true);
        camera.live_video().unwrap().set_enabled(false);

        let stream = compose(Some(&camera), None);
        assert!(stream.video().is_none());
        assert_eq!(stream.audio().unwrap().source(), SourceKind::Camera);
    }

    #[test]
    fn test_ended_screen_falls_back_to_camera() {
        let camera = source(SourceKind::Camera, true, false);
        let screen = source(SourceKind::Screen, true, false);
        screen.stop();

        let stream = compose(Some(&camera), Some(&screen));
        assert_eq!(stream.video().unwrap().source(), SourceKind::Camera);
    }

    #[test]
    fn test_recompose_reports_only_changed_slots() {
        let camera = source(SourceKind::Camera, true, true);
        let screen = source(SourceKind::Screen, true, false);
        let mut composer = StreamComposer::new();

        let first = composer.recompose(Some(&camera), None).unwrap();
        assert_eq!(first.swaps.len(), 2);
        assert_eq!(composer.generation(), 1);

        let second = composer.recompose(Some(&camera), Some(&screen)).unwrap();
        assert_eq!(second.swaps.len(), 1);
        let swap = &second.swaps[0];
        assert_eq!(swap.kind, TrackKind::Video);
        assert_eq!(swap.previous.as_ref().unwrap().source(), SourceKind::Camera);
        assert_eq!(swap.next.as_ref().unwrap().source(), SourceKind::Screen);

        assert!(composer.recompose(Some(&camera), Some(&screen)).is_none());
        assert_eq!(composer.generation(), 2);
    }

    #[test]
    fn test_validate_flags_ended_tracks() {
        let camera = source(SourceKind::Camera, true, false);
        let stream = compose(Some(&camera), None);
        assert!(stream.validate().is_ok());

        camera.stop();
        assert!(matches!(stream.validate(), Err(Error::CompositionConflict(_))));
    }
}
