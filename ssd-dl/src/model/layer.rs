use crate::common::*;

/// Activation functions referable by name in architecture manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Relu6,
    LeakyRelu,
    Sigmoid,
    Tanh,
    Softmax,
}

impl Activation {
    pub fn from_name(name: &str) -> Result<Self> {
        let activation = match name {
            "relu" => Self::Relu,
            "relu6" => Self::Relu6,
            "leaky_relu" => Self::LeakyRelu,
            "sigmoid" => Self::Sigmoid,
            "tanh" => Self::Tanh,
            "softmax" => Self::Softmax,
            _ => bail!("unknown activation name '{}'", name),
        };
        Ok(activation)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Relu => "relu",
            Self::Relu6 => "relu6",
            Self::LeakyRelu => "leaky_relu",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
            Self::Softmax => "softmax",
        }
    }

    pub fn forward(&self, xs: &Tensor) -> Tensor {
        match self {
            Self::Relu => xs.relu(),
            Self::Relu6 => xs.clamp(0.0, 6.0),
            Self::LeakyRelu => xs.clamp_min(0.0) + xs.clamp_max(0.0) * 0.1,
            Self::Sigmoid => xs.sigmoid(),
            Self::Tanh => xs.tanh(),
            Self::Softmax => xs.softmax(-1, Kind::Float),
        }
    }
}

/// Pooling padding policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolPadding {
    #[serde(rename = "SAME")]
    Same,
    #[serde(rename = "VALID")]
    Valid,
}

impl FromStr for PoolPadding {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let padding = match text {
            "SAME" => Self::Same,
            "VALID" => Self::Valid,
            _ => bail!("malformed padding spec '{}', expect 'SAME' or 'VALID'", text),
        };
        Ok(padding)
    }
}

/// Architecture layer descriptors.
///
/// The serialized form is a `{"type": ..., "params": {...}}` mapping whose
/// field names stay stable for persisted architecture files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum Layer {
    #[serde(rename = "InputLayer")]
    Input(Input),
    #[serde(rename = "ReshapeLayer")]
    Reshape(Reshape),
    #[serde(rename = "MulByAlphaLayer")]
    MulByAlpha(MulByAlpha),
    #[serde(rename = "SumLayer")]
    Sum(Sum),
    #[serde(rename = "ConcatLayer")]
    Concat(Concat),
    #[serde(rename = "ZeroPaddingLayer")]
    ZeroPadding(ZeroPadding),
    #[serde(rename = "GlobalMaxPoolLayer")]
    GlobalMaxPool(GlobalMaxPool),
    #[serde(rename = "GlobalAvgPoolLayer")]
    GlobalAvgPool(GlobalAvgPool),
    #[serde(rename = "MaxPoolLayer")]
    MaxPool(MaxPool),
    #[serde(rename = "AvgPoolLayer")]
    AvgPool(AvgPool),
    #[serde(rename = "UpSamplingLayer")]
    UpSampling(UpSampling),
    #[serde(rename = "ActivationLayer")]
    Activation(ActivationLayer),
    #[serde(rename = "FlattenLayer")]
    Flatten(Flatten),
    #[serde(rename = "DropoutLayer")]
    Dropout(Dropout),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Input {
    pub name: String,
    pub input_shape: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reshape {
    pub name: String,
    pub new_shape: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MulByAlpha {
    pub name: String,
    pub alpha: R64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sum {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concat {
    pub name: String,
    #[serde(default = "default_concat_axis")]
    pub axis: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZeroPadding {
    pub name: String,
    /// `[[top, bottom], [left, right]]` rows/columns of zeros.
    pub padding: [[i64; 2]; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalMaxPool {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalAvgPool {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxPool {
    pub name: String,
    #[serde(default = "default_pool_window")]
    pub ksize: [i64; 4],
    #[serde(default = "default_pool_window")]
    pub strides: [i64; 4],
    #[serde(default = "default_pool_padding")]
    pub padding: PoolPadding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvgPool {
    pub name: String,
    #[serde(default = "default_pool_window")]
    pub ksize: [i64; 4],
    #[serde(default = "default_pool_window")]
    pub strides: [i64; 4],
    #[serde(default = "default_pool_padding")]
    pub padding: PoolPadding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpSampling {
    pub name: String,
    #[serde(default = "default_upsampling_size")]
    pub size: [i64; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationLayer {
    pub name: String,
    pub activation: Activation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flatten {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dropout {
    pub name: String,
    #[serde(default = "default_p_keep")]
    pub p_keep: R64,
}

fn default_concat_axis() -> i64 {
    3
}

fn default_pool_window() -> [i64; 4] {
    [1, 2, 2, 1]
}

fn default_pool_padding() -> PoolPadding {
    PoolPadding::Same
}

fn default_upsampling_size() -> [i64; 2] {
    [2, 2]
}

fn default_p_keep() -> R64 {
    r64(0.9)
}

impl Layer {
    pub fn name(&self) -> &str {
        match self {
            Self::Input(layer) => &layer.name,
            Self::Reshape(layer) => &layer.name,
            Self::MulByAlpha(layer) => &layer.name,
            Self::Sum(layer) => &layer.name,
            Self::Concat(layer) => &layer.name,
            Self::ZeroPadding(layer) => &layer.name,
            Self::GlobalMaxPool(layer) => &layer.name,
            Self::GlobalAvgPool(layer) => &layer.name,
            Self::MaxPool(layer) => &layer.name,
            Self::AvgPool(layer) => &layer.name,
            Self::UpSampling(layer) => &layer.name,
            Self::Activation(layer) => &layer.name,
            Self::Flatten(layer) => &layer.name,
            Self::Dropout(layer) => &layer.name,
        }
    }

    /// Forward pass. Sum and Concat consume every input; the remaining
    /// layers take exactly one.
    pub fn forward_t(&self, inputs: &[&Tensor], train: bool) -> Result<Tensor> {
        let single = |inputs: &[&Tensor]| -> Result<&Tensor> {
            ensure!(
                inputs.len() == 1,
                "layer '{}' takes exactly one input, but get {}",
                self.name(),
                inputs.len()
            );
            Ok(inputs[0])
        };

        let output = match self {
            Self::Input(layer) => {
                let xs = single(inputs)?;
                if !layer.input_shape.is_empty() {
                    ensure!(
                        xs.size() == layer.input_shape,
                        "input '{}' expects shape {:?}, but get {:?}",
                        layer.name,
                        layer.input_shape,
                        xs.size()
                    );
                }
                xs.shallow_clone()
            }
            Self::Reshape(layer) => single(inputs)?.reshape(&layer.new_shape),
            Self::MulByAlpha(layer) => single(inputs)? * layer.alpha.raw(),
            Self::Sum(_layer) => {
                ensure!(!inputs.is_empty(), "sum layer takes at least one input");
                inputs[1..]
                    .iter()
                    .fold(inputs[0].shallow_clone(), |sum, xs| sum + *xs)
            }
            Self::Concat(layer) => {
                ensure!(!inputs.is_empty(), "concat layer takes at least one input");
                Tensor::cat(inputs, layer.axis)
            }
            Self::ZeroPadding(layer) => {
                let xs = single(inputs)?;
                let [[top, bottom], [left, right]] = layer.padding;
                ensure!(
                    top >= 0 && bottom >= 0 && left >= 0 && right >= 0,
                    "padding amounts of '{}' must be non-negative",
                    layer.name
                );
                xs.constant_pad_nd(&[left, right, top, bottom])
            }
            Self::GlobalMaxPool(layer) => {
                let xs = single(inputs)?;
                ensure!(
                    xs.dim() == 4,
                    "global pooling layer '{}' expects a 4-dimensional input",
                    layer.name
                );
                xs.amax(&[2, 3], false)
            }
            Self::GlobalAvgPool(layer) => {
                let xs = single(inputs)?;
                ensure!(
                    xs.dim() == 4,
                    "global pooling layer '{}' expects a 4-dimensional input",
                    layer.name
                );
                xs.mean_dim(&[2, 3], false, Kind::Float)
            }
            Self::MaxPool(layer) => {
                let xs = single(inputs)?;
                let (k, s, p, ceil_mode) =
                    pool_params(&layer.name, &layer.ksize, &layer.strides, layer.padding)?;
                xs.max_pool2d(&k, &s, &p, &[1, 1], ceil_mode)
            }
            Self::AvgPool(layer) => {
                let xs = single(inputs)?;
                let (k, s, p, ceil_mode) =
                    pool_params(&layer.name, &layer.ksize, &layer.strides, layer.padding)?;
                xs.avg_pool2d(&k, &s, &p, ceil_mode, true, None)
            }
            Self::UpSampling(layer) => {
                let xs = single(inputs)?;
                let (_b, _c, in_h, in_w) = xs.size4()?;
                let [scale_h, scale_w] = layer.size;
                ensure!(
                    scale_h >= 1 && scale_w >= 1,
                    "upsampling factors of '{}' must be at least 1",
                    layer.name
                );
                xs.upsample_nearest2d(&[in_h * scale_h, in_w * scale_w], None, None)
            }
            Self::Activation(layer) => layer.activation.forward(single(inputs)?),
            Self::Flatten(_layer) => single(inputs)?.flatten(1, -1),
            Self::Dropout(layer) => single(inputs)?.dropout(1.0 - layer.p_keep.raw(), train),
        };

        Ok(output)
    }
}

fn pool_params(
    name: &str,
    ksize: &[i64; 4],
    strides: &[i64; 4],
    padding: PoolPadding,
) -> Result<([i64; 2], [i64; 2], [i64; 2], bool)> {
    ensure!(
        ksize[0] == 1 && ksize[3] == 1 && strides[0] == 1 && strides[3] == 1,
        "pooling layer '{}' must keep batch and channel dimensions, \
         expect ksize/strides of the form [1, kh, kw, 1]",
        name
    );
    let k = [ksize[1], ksize[2]];
    let s = [strides[1], strides[2]];
    ensure!(
        k[0] >= 1 && k[1] >= 1 && s[0] >= 1 && s[1] >= 1,
        "pooling window and strides of '{}' must be positive",
        name
    );

    let (p, ceil_mode) = match padding {
        PoolPadding::Same => ([(k[0] - 1) / 2, (k[1] - 1) / 2], true),
        PoolPadding::Valid => ([0, 0], false),
    };
    Ok((k, s, p, ceil_mode))
}
