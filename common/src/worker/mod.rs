// Worker module: callable registry and the execution pool

pub mod pool;
pub mod registry;

pub use pool::{ScheduledRun, WorkerPool};
pub use registry::{JobCallable, JobInvocation, JobRegistry};
