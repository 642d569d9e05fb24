/// Control messages flowing from direct methods and the updater back to
/// the agent run loop
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Control {
    /// Run an update check outside the regular schedule
    CheckUpdate,

    /// Exit cleanly so the service supervisor relaunches the agent
    Restart { reason: String },
}
