pub mod calibration;
pub mod smoothing;
pub mod trial;
