//! Gradient-descent class balancing for dataset sampling.

mod gd_balancer;

pub use gd_balancer::*;
