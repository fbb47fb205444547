pub mod progress;
pub mod time;
