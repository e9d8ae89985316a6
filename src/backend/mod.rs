mod control;
mod launcher;
mod process;
mod state;

pub use control::{ControlReply, TorControl};
pub use launcher::{Launcher, TorLauncher};
pub use process::{BackendEvent, BackendInfo, BackendPorts, BackendProcess};
pub use state::{BackendState, Lifecycle, Marker, OutputLine, OutputMatcher, Severity};
