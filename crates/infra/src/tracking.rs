//! Delivery-tracking probe.

use campaigner_core::SesKeys;

/// Reports whether the sender's account has a delivery-tracking
/// configuration set. The answer is stamped on every dispatch message.
pub trait TrackingProbe: Send + Sync {
    fn configuration_set_exists(&self, keys: &SesKeys) -> bool;
}

impl<T> TrackingProbe for std::sync::Arc<T>
where
    T: TrackingProbe + ?Sized,
{
    fn configuration_set_exists(&self, keys: &SesKeys) -> bool {
        (**self).configuration_set_exists(keys)
    }
}

/// Probe with a fixed answer, taken from configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticTrackingProbe(pub bool);

impl TrackingProbe for StaticTrackingProbe {
    fn configuration_set_exists(&self, _keys: &SesKeys) -> bool {
        self.0
    }
}
