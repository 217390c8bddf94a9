//! Device clock collaborator.

/// Settable wall clock, seconds-since-epoch resolution.
///
/// Every remote command carries a timestamp that is applied here before the
/// command itself runs, so records are stamped with peer time even across
/// device reboots.
pub trait Clock {
    /// Current time in seconds since the UNIX epoch.
    fn now(&self) -> u32;

    /// Sets the clock to the given epoch second.
    fn set(&self, epoch: u32);
}
