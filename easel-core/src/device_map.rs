/// Where a pipeline's tensors should live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    /// Stay on the CPU even when an accelerator is available.
    ForceCpu,
    /// Use the accelerator with this ordinal, falling back to CPU when none
    /// is present.
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::ForceCpu
    }
}
