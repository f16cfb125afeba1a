// Extraction pipeline
//
// Units flow from the orchestrator through the scheduler to pool workers,
// which run the signal scan, window selection and frame sampling.

pub mod detection;
pub mod orchestrator;
pub mod sampler;
pub mod scheduler;
pub mod signal;
pub mod types;
pub mod units;
pub mod window;
pub mod worker;
