//! Session orchestration: lifecycle, teardown and the public API the view
//! layer drives

pub mod controller;
pub mod generation;
pub mod handle;
pub mod state;

pub use controller::{SessionController, SessionInput};
pub use generation::{Generation, GenerationGuard, TeardownHandle};
pub use handle::SessionHandle;
pub use state::{ChatEntry, LifecycleState, SessionEvent, SessionSnapshot};
