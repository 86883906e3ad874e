use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// External detection + tracking engine.
///
/// The engine is a black box: it receives a frame and returns tracked
/// detections. Track ids must stay stable for the same physical object while
/// the engine keeps tracking it.
///
/// Backends are owned by exactly one camera worker, so `&mut self` is never
/// contended. A failure is scoped to the frame it was raised for; the worker
/// skips that frame and keeps going.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection and tracking on one frame.
    fn detect_and_track(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
