//! Host collaborator interfaces for gatehoused
//!
//! The core never sleeps on its own. When a duration session needs to be cut
//! off while no surface is asking for access, it asks a [`WakeScheduler`] for
//! a one-shot wake-up and handles the resulting [`WakeEvent`].

mod mock;
mod tokio_scheduler;
mod traits;

pub use mock::*;
pub use tokio_scheduler::*;
pub use traits::*;
