extern crate serde;
#[macro_use]
extern crate serde_derive;

mod error;

pub mod allocation_collector;
pub mod collector;
pub mod custom_collector;
pub mod marker;
pub mod memory_tracker;
pub mod periodic_thread;
pub mod raw_sample;
pub mod retained_collector;
pub mod runtime;
pub mod semaphore;
pub mod serialization;
pub mod session;
pub mod signal_coordinator;
pub mod stack_table;
pub mod thread_table;
pub mod time_collector;
pub mod timestamp;

pub use error::ProfileError;
pub use serialization::profile::ProfileData;
pub use session::configuration::{Configuration, Mode};
pub use session::Session;
