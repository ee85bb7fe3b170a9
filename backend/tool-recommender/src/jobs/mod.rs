// ============================================
// Background Jobs Module
// ============================================
//
// Contains background job runners for:
// 1. Scheduled model training (full on a timer, incremental on backlog)

pub mod training_scheduler;

pub use training_scheduler::{run_training_scheduler, SchedulerStats};
