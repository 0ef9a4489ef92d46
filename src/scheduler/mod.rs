pub mod assigner;
pub mod operation;
pub mod queue;

pub use assigner::{schedule_step_runs, ScheduleReport};
pub use operation::{schedule_fn, Operation, OperationPool, OperationStatus, ScheduleFn};
pub use queue::{TenantQueueHandle, TenantQueueService};
