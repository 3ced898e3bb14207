use crate::error::ProfileError;
use crate::runtime::FrameHandle;
use crate::serialization::profile::ProfileData;

/// Common surface of the profiling collectors. The embedder's GC glue calls
/// `mark_reachable_frames` from its mark phase and `on_compact` after the
/// host moved objects.
pub trait Collector: Send + Sync {
    fn start(&self) -> Result<(), ProfileError>;

    fn stop(&self) -> Result<ProfileData, ProfileError>;

    /// Manually record a sample of the calling thread. Only meaningful for
    /// collectors that support it.
    fn sample(&self) -> Result<(), ProfileError> {
        Err(ProfileError::InvalidConfiguration(
            "collector doesn't support manual sampling".to_string(),
        ))
    }

    fn mark_reachable_frames(&self, visitor: &mut dyn FnMut(FrameHandle));

    fn on_compact(&self) {}
}
