pub mod logging;
pub mod rwsem;
pub mod spin;
pub mod task;
pub mod wait;
