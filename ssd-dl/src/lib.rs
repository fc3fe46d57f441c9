//! The building blocks of single-shot detection models.

mod common;

pub mod anchor;
pub mod balance;
pub mod loss;
pub mod model;
pub mod optim;
pub mod train;
