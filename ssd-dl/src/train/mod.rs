//! Synchronous epoch/batch training driver.

mod history;
mod trainer;

pub use history::*;
pub use trainer::*;
