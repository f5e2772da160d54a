//! Task domain — data model and state machine.

pub mod model;

pub use model::{NewTask, Task, TaskRelease, TaskScope, TaskStatus};
