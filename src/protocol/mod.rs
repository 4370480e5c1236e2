pub mod parser;
pub mod types;

pub use parser::parse_line;
pub use types::{Axis, MaterialIdentity, Reading, STANDARD_GRAVITY, Unit};
