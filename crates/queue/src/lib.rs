//! Background processing for the postbox email queue.
//!
//! - **Processor loop**: ticks `process_queue` on an interval, one tick at a time
//! - **Supervisor**: owns the loop, health-checks it and restarts it on faults

pub mod processor;
pub mod supervisor;

pub use processor::{LoopConfig, ProcessorLoop, QueueProcessor, StoppingLoop};
pub use supervisor::{
    ProcessorStatus, ProcessorSupervisor, SupervisorConfig, SupervisorFault, SupervisorState,
};
