//! Worker engine: the scheduling loop driving jobs to completion.

pub mod worker;

pub use worker::{JobReport, LoopConfig, ShutdownHandle, Worker, WorkerState, WorkerStats};
