//! Crossfade between the outgoing and incoming slot of a switch.
//!
//! Two strategies:
//! - with a `MixGraph`, both gains are ramped on the graph's clock and the
//!   outgoing pause is left to the caller, scheduled after the fade;
//! - without one, the outgoing element volume is stepped down in
//!   `steps` increments, paused at zero, then the incoming one starts at target.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::media::{MediaElement, MixGraph};

/// Linear gain at `progress` (0..=1) of a ramp from `from` to `to`.
pub fn linear_gain(from: f32, to: f32, progress: f32) -> f32 {
    let t = progress.clamp(0.0, 1.0);
    from + (to - from) * t
}

/// Volumes applied to the outgoing element by the stepped fade.  The last one
/// is always exactly zero.
pub fn stepped_volumes(start: f32, steps: u32) -> Vec<f32> {
    let steps = steps.max(1);
    (1..=steps)
        .map(|i| {
            if i == steps {
                0.0
            } else {
                linear_gain(start, 0.0, i as f32 / steps as f32)
            }
        })
        .collect()
}

pub struct FadeSide {
    pub index: usize,
    pub element: Arc<dyn MediaElement>,
    /// Current audible volume of this side.
    pub volume: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeOutcome {
    /// No outgoing side; the incoming slot just started.
    Direct,
    /// Stepped fade finished and the outgoing element is paused.
    OutgoingPaused,
    /// Gain ramps are running; pause the outgoing slot after this long.
    PauseDeferred(Duration),
}

#[derive(Debug, Clone, Copy)]
pub struct Crossfade {
    pub duration: Duration,
    pub steps: u32,
}

impl Crossfade {
    pub fn new(duration: Duration, steps: u32) -> Self {
        Self {
            duration,
            steps: steps.max(1),
        }
    }

    pub async fn run(
        &self,
        outgoing: Option<&FadeSide>,
        incoming: &FadeSide,
        target: f32,
        mix: Option<&dyn MixGraph>,
        cancel: &CancellationToken,
    ) -> Result<FadeOutcome> {
        let target = target.clamp(0.0, 1.0);

        let Some(outgoing) = outgoing else {
            match mix {
                Some(mix) => {
                    incoming.element.set_volume(1.0).await?;
                    mix.set_gain(incoming.index, target);
                }
                None => incoming.element.set_volume(target).await?,
            }
            incoming.element.play().await?;
            return Ok(FadeOutcome::Direct);
        };

        match mix {
            Some(mix) => self.ramp(outgoing, incoming, target, mix).await,
            None => self.stepped(outgoing, incoming, target, cancel).await,
        }
    }

    async fn ramp(
        &self,
        outgoing: &FadeSide,
        incoming: &FadeSide,
        target: f32,
        mix: &dyn MixGraph,
    ) -> Result<FadeOutcome> {
        debug!(
            "crossfade: ramping slot {} -> slot {} over {:?}",
            outgoing.index, incoming.index, self.duration
        );
        let from = mix.gain(outgoing.index);
        mix.ramp_gain(outgoing.index, from, 0.0, self.duration);

        incoming.element.set_volume(1.0).await?;
        mix.set_gain(incoming.index, 0.0);
        incoming.element.play().await?;
        mix.ramp_gain(incoming.index, 0.0, target, self.duration);

        Ok(FadeOutcome::PauseDeferred(self.duration))
    }

    async fn stepped(
        &self,
        outgoing: &FadeSide,
        incoming: &FadeSide,
        target: f32,
        cancel: &CancellationToken,
    ) -> Result<FadeOutcome> {
        debug!(
            "crossfade: stepping slot {} -> slot {} in {} steps",
            outgoing.index, incoming.index, self.steps
        );
        let step = self.duration / self.steps;
        for volume in stepped_volumes(outgoing.volume, self.steps) {
            // Errors on the outgoing side are not worth failing the switch.
            let _ = outgoing.element.set_volume(volume).await;
            tokio::select! {
                _ = cancel.cancelled() => {
                    // The outgoing slot stays audible, so put it back where it was.
                    let _ = outgoing.element.set_volume(outgoing.volume).await;
                    return Err(EngineError::Superseded);
                }
                _ = tokio::time::sleep(step) => {}
            }
        }
        let _ = outgoing.element.pause().await;

        incoming.element.set_volume(target).await?;
        incoming.element.play().await?;
        Ok(FadeOutcome::OutgoingPaused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stepped_fade_ends_silent() {
        let volumes = stepped_volumes(0.8, 10);
        assert_eq!(volumes.len(), 10);
        assert_eq!(volumes.last().copied(), Some(0.0));
        assert!(volumes.windows(2).all(|w| w[1] <= w[0]));
        assert!((volumes[0] - 0.72).abs() < 1e-6);
    }

    #[test]
    fn single_step_is_a_cut() {
        assert_eq!(stepped_volumes(1.0, 0), vec![0.0]);
    }

    #[test]
    fn linear_gain_clamps_progress() {
        assert_eq!(linear_gain(0.0, 0.6, 2.0), 0.6);
        assert_eq!(linear_gain(1.0, 0.0, -1.0), 1.0);
        assert!((linear_gain(0.0, 0.5, 0.5) - 0.25).abs() < f32::EPSILON);
    }
}
