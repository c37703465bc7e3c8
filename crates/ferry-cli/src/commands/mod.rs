pub mod info;
pub mod queue;
pub mod task;
