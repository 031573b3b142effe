pub mod logging;
pub mod measurement;
pub mod structures;
pub mod utils;
