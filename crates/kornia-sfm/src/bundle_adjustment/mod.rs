/// Robust loss functions.
pub mod losses;

mod problem;
pub use problem::*;
