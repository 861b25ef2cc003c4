//! Semantic display operations on top of the serial link
//!
//! At most one animation runs at a time. It free-runs on the blocking pool
//! and is stopped through a cancellation token checked between frames.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::link::SharedLink;
use super::render::Renderer;
use crate::{Error, Result};

/// Longest single sleep between cancellation checks inside an animation
const CANCEL_POLL: Duration = Duration::from_millis(10);

type Frames = Arc<Vec<Vec<u8>>>;

struct Animation {
    cancel: CancellationToken,
    task: JoinHandle<AnimationStats>,
}

/// Counters reported when an animation stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnimationStats {
    /// Frames acknowledged by the device
    pub sent: u64,
    /// Frames that were never acknowledged
    pub dropped: u64,
}

/// Renders stills, loops, fades and blanks on the attached display
pub struct DisplayDriver {
    link: SharedLink,
    renderer: Renderer,
    animation: Option<Animation>,
}

impl DisplayDriver {
    /// Create a driver that sends through `link`
    #[must_use]
    pub fn new(link: SharedLink, renderer: Renderer) -> Self {
        Self {
            link,
            renderer,
            animation: None,
        }
    }

    /// The link this driver writes to
    #[must_use]
    pub const fn link(&self) -> &SharedLink {
        &self.link
    }

    /// Whether an animation loop is currently running
    #[must_use]
    pub fn is_animating(&self) -> bool {
        self.animation
            .as_ref()
            .is_some_and(|a| !a.task.is_finished())
    }

    /// Show a still image, replacing any running animation
    ///
    /// Returns whether the device acknowledged the image.
    ///
    /// # Errors
    ///
    /// Returns error if the image cannot be decoded
    pub async fn show_still(&mut self, path: &Path) -> Result<bool> {
        self.stop().await;
        let renderer = self.renderer.clone();
        let path = path.to_path_buf();
        let payload = run_blocking(move || renderer.still(&path)).await?;
        Ok(self.link.send_image(payload.into()).await)
    }

    /// Start looping an animated GIF until [`Self::stop`] is called
    ///
    /// Frames are decoded once per call and live only as long as the loop. A
    /// frame the device does not acknowledge is logged and skipped; the loop
    /// keeps going.
    ///
    /// # Errors
    ///
    /// Returns error if the animation cannot be decoded
    pub async fn play_loop(&mut self, gif: &Path, frame_delay: Duration) -> Result<()> {
        self.stop().await;
        let renderer = self.renderer.clone();
        let path = gif.to_path_buf();
        let frames: Frames = Arc::new(run_blocking(move || renderer.animation(&path)).await?);

        let cancel = CancellationToken::new();
        let link = self.link.clone();
        let token = cancel.clone();
        let task = tokio::task::spawn_blocking(move || run_loop(&link, &frames, frame_delay, &token));

        tracing::debug!(path = %gif.display(), ?frame_delay, "animation started");
        self.animation = Some(Animation { cancel, task });
        Ok(())
    }

    /// Stop the running animation, if any
    ///
    /// Raises the cancellation flag and waits for the frame in flight to finish.
    pub async fn stop(&mut self) -> Option<AnimationStats> {
        let animation = self.animation.take()?;
        animation.cancel.cancel();

        match animation.task.await {
            Ok(stats) => {
                tracing::debug!(sent = stats.sent, dropped = stats.dropped, "animation stopped");
                Some(stats)
            }
            Err(e) => {
                tracing::warn!(error = %e, "animation task failed");
                None
            }
        }
    }

    /// Fade an image in from black over `steps` payloads
    ///
    /// Gives up at the first step the device does not acknowledge, so a
    /// degraded link costs at most one transfer timeout cycle.
    ///
    /// # Errors
    ///
    /// Returns error if the image cannot be decoded
    pub async fn fade_to(&mut self, path: &Path, steps: u32) -> Result<bool> {
        self.stop().await;
        let renderer = self.renderer.clone();
        let owned = path.to_path_buf();
        let payloads = run_blocking(move || renderer.fade(&owned, steps)).await?;

        for (step, payload) in payloads.into_iter().enumerate() {
            if !self.link.send_image(payload.into()).await {
                tracing::debug!(step, path = %path.display(), "fade interrupted");
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Paint the whole canvas white
    ///
    /// # Errors
    ///
    /// Returns error if the blank payload cannot be encoded
    pub async fn blank(&mut self) -> Result<bool> {
        self.stop().await;
        let payload = self.renderer.blank()?;
        Ok(self.link.send_image(payload.into()).await)
    }

}

impl Drop for DisplayDriver {
    fn drop(&mut self) {
        if let Some(animation) = &self.animation {
            animation.cancel.cancel();
        }
    }
}

fn run_loop(
    link: &SharedLink,
    frames: &[Vec<u8>],
    frame_delay: Duration,
    cancel: &CancellationToken,
) -> AnimationStats {
    let mut stats = AnimationStats::default();
    if frames.is_empty() {
        return stats;
    }

    'outer: loop {
        for (index, frame) in frames.iter().enumerate() {
            if cancel.is_cancelled() {
                break 'outer;
            }

            let started = Instant::now();
            if link.send_image_blocking(frame) {
                stats.sent += 1;
            } else {
                stats.dropped += 1;
                tracing::warn!(frame = index, "animation frame dropped");
            }

            let deadline = started + frame_delay;
            while !cancel.is_cancelled() {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                std::thread::sleep((deadline - now).min(CANCEL_POLL));
            }
        }
    }

    stats
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Display(format!("render task failed: {e}")))?
}
