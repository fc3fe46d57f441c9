pub use anyhow::{ensure, Error, Result};
pub use num_traits::{Num, NumCast, ToPrimitive};
