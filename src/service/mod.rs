pub mod calibrate_loop;
pub mod session;
pub mod test_loop;
