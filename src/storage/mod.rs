pub mod calibration_store;
pub mod results;

pub use calibration_store::{CalibrationStore, write_stage_samples};
pub use results::{PersistedSession, ResultsStore};
