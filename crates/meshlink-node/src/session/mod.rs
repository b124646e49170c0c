pub mod queue;
pub mod registry;
pub mod state;

pub use queue::BlockQueue;
pub use registry::{SessionRegistry, SharedSession};
pub use state::{KeyOrigin, Phase, Session, SessionSnapshot};
