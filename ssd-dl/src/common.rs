pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use approx::abs_diff_eq;
pub use derivative::Derivative;
pub use getset::Getters;
pub use indexmap::IndexMap;
pub use itertools::{iproduct, izip, Itertools as _};
pub use log::{info, warn};
pub use noisy_float::prelude::*;
pub use rand::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    convert::{TryFrom, TryInto},
    fmt::Debug,
    ops::Range,
    path::Path,
    str::FromStr,
};
pub use tch::{
    nn::{self, OptimizerConfig as _},
    Device, IndexOp, Kind, Tensor,
};
pub use tch_tensor_like::TensorLike;
