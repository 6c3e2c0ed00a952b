// Built-in portable estimators
//
// The built-in decoders read the crate's own JSON encodings: `LinearModel`
// for estimator-style tags and `DenseNetwork` for checkpoint-style tags.
// Foreign binary formats are supported by registering another decoder.

use super::loader::{Artifact, ArtifactDecoder, ForwardModule, Predictor, Tensor};
use super::model::FeatureBatch;
use crate::error::{Result, ServeError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Output link function of a linear model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Link {
    #[default]
    Identity,
    Logistic,
}

/// Linear model: `y = link(W x + b)`, one weight row per output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
    #[serde(default)]
    pub link: Link,
}

impl LinearModel {
    /// Creates a model with identity link.
    pub fn new(weights: Vec<Vec<f64>>, bias: Vec<f64>) -> Result<Self> {
        let model = Self {
            weights,
            bias,
            link: Link::Identity,
        };
        model.validate()?;
        Ok(model)
    }

    /// Sets the link function.
    pub fn with_link(mut self, link: Link) -> Self {
        self.link = link;
        self
    }

    /// Number of inputs.
    pub fn inputs(&self) -> usize {
        self.weights.first().map(Vec::len).unwrap_or(0)
    }

    fn validate(&self) -> Result<()> {
        if self.weights.is_empty() || self.inputs() == 0 {
            return Err(ServeError::Validation("linear model has no weights".to_string()));
        }
        if self.weights.iter().any(|row| row.len() != self.inputs()) {
            return Err(ServeError::Validation("linear model weights are ragged".to_string()));
        }
        if self.bias.len() != self.weights.len() {
            return Err(ServeError::Validation(format!(
                "linear model has {} outputs but {} bias terms",
                self.weights.len(),
                self.bias.len()
            )));
        }
        Ok(())
    }
}

impl Predictor for LinearModel {
    fn predict(&self, features: &FeatureBatch) -> Result<Vec<Vec<f64>>> {
        if features.width() != self.inputs() {
            return Err(ServeError::InferenceFailure(format!(
                "model expects {} features, got {}",
                self.inputs(),
                features.width()
            )));
        }

        Ok(features
            .rows()
            .iter()
            .map(|row| {
                self.weights
                    .iter()
                    .zip(&self.bias)
                    .map(|(w, b)| {
                        let z = w.iter().zip(row).map(|(w, x)| w * x).sum::<f64>() + b;
                        match self.link {
                            Link::Identity => z,
                            Link::Logistic => 1.0 / (1.0 + (-z).exp()),
                        }
                    })
                    .collect()
            })
            .collect())
    }
}

/// Layer activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Identity,
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
}

/// Fully connected layer; `weights` holds one row per output unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseLayer {
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
    #[serde(default)]
    pub activation: Activation,
}

impl DenseLayer {
    fn inputs(&self) -> usize {
        self.weights.first().map(Vec::len).unwrap_or(0)
    }

    fn outputs(&self) -> usize {
        self.weights.len()
    }

    fn apply(&self, input: &[f32]) -> Vec<f32> {
        let mut out: Vec<f32> = self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(w, b)| w.iter().zip(input).map(|(w, x)| w * x).sum::<f32>() + b)
            .collect();

        match self.activation {
            Activation::Identity => {}
            Activation::Relu => out.iter_mut().for_each(|v| *v = v.max(0.0)),
            Activation::Sigmoid => out.iter_mut().for_each(|v| *v = 1.0 / (1.0 + (-*v).exp())),
            Activation::Tanh => out.iter_mut().for_each(|v| *v = v.tanh()),
            Activation::Softmax => {
                // Subtract max for numerical stability
                let max = out.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0f32;
                for v in out.iter_mut() {
                    *v = (*v - max).exp();
                    sum += *v;
                }
                if sum > 0.0 {
                    out.iter_mut().for_each(|v| *v /= sum);
                }
            }
        }

        out
    }
}

/// Feed-forward network of dense layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseNetwork {
    pub layers: Vec<DenseLayer>,
}

impl DenseNetwork {
    /// Creates a network, checking that layer shapes chain.
    pub fn new(layers: Vec<DenseLayer>) -> Result<Self> {
        let network = Self { layers };
        network.validate()?;
        Ok(network)
    }

    fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(ServeError::Validation("network has no layers".to_string()));
        }

        for (i, layer) in self.layers.iter().enumerate() {
            if layer.outputs() == 0 || layer.inputs() == 0 {
                return Err(ServeError::Validation(format!("layer {} is empty", i)));
            }
            if layer.weights.iter().any(|row| row.len() != layer.inputs()) {
                return Err(ServeError::Validation(format!("layer {} weights are ragged", i)));
            }
            if layer.bias.len() != layer.outputs() {
                return Err(ServeError::Validation(format!(
                    "layer {} has {} units but {} bias terms",
                    i,
                    layer.outputs(),
                    layer.bias.len()
                )));
            }
            if i > 0 && self.layers[i - 1].outputs() != layer.inputs() {
                return Err(ServeError::Validation(format!(
                    "layer {} expects {} inputs but layer {} produces {}",
                    i,
                    layer.inputs(),
                    i - 1,
                    self.layers[i - 1].outputs()
                )));
            }
        }

        Ok(())
    }

    fn input_width(&self) -> usize {
        self.layers[0].inputs()
    }

    fn output_width(&self) -> usize {
        self.layers[self.layers.len() - 1].outputs()
    }
}

impl ForwardModule for DenseNetwork {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let (rows, width) = match input.shape.as_slice() {
            [rows, width] => (*rows, *width),
            other => {
                return Err(ServeError::InferenceFailure(format!(
                    "expected a 2-d input, got shape {:?}",
                    other
                )))
            }
        };

        if width != self.input_width() {
            return Err(ServeError::InferenceFailure(format!(
                "network expects {} features, got {}",
                self.input_width(),
                width
            )));
        }

        let mut data = Vec::with_capacity(rows * self.output_width());
        for row in input.data.chunks(width) {
            let out = self
                .layers
                .iter()
                .fold(row.to_vec(), |activations, layer| layer.apply(&activations));
            data.extend(out);
        }

        Tensor::new(vec![rows, self.output_width()], data)
    }
}

/// Encoded estimator, tagged by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EstimatorSpec {
    Linear(LinearModel),
}

/// Decodes estimator artifacts into direct-predict models.
pub struct EstimatorDecoder;

impl ArtifactDecoder for EstimatorDecoder {
    fn name(&self) -> &str {
        "estimator-json"
    }

    fn decode(&self, bytes: &[u8]) -> Result<Artifact> {
        let spec: EstimatorSpec = serde_json::from_slice(bytes)?;
        match spec {
            EstimatorSpec::Linear(model) => {
                model.validate()?;
                Ok(Artifact::DirectPredict(Arc::new(model)))
            }
        }
    }
}

/// Decodes checkpoint artifacts into tensor-forward networks.
pub struct NetworkDecoder;

impl ArtifactDecoder for NetworkDecoder {
    fn name(&self) -> &str {
        "dense-network-json"
    }

    fn decode(&self, bytes: &[u8]) -> Result<Artifact> {
        let network: DenseNetwork = serde_json::from_slice(bytes)?;
        network.validate()?;
        Ok(Artifact::TensorForward(Arc::new(network)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::loader::Capability;
    use serde_json::json;

    fn batch(rows: Vec<Vec<f64>>) -> FeatureBatch {
        FeatureBatch::from_rows(rows).unwrap()
    }

    #[test]
    fn test_linear_predict() {
        let model = LinearModel::new(vec![vec![1.0, 2.0], vec![0.0, 1.0]], vec![0.5, 0.0]).unwrap();
        let out = model.predict(&batch(vec![vec![1.0, 1.0], vec![2.0, 0.0]])).unwrap();
        assert_eq!(out, vec![vec![3.5, 1.0], vec![2.5, 0.0]]);
    }

    #[test]
    fn test_linear_logistic_link() {
        let model = LinearModel::new(vec![vec![0.0]], vec![0.0])
            .unwrap()
            .with_link(Link::Logistic);
        let out = model.predict(&batch(vec![vec![5.0]])).unwrap();
        assert!((out[0][0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_linear_width_mismatch() {
        let model = LinearModel::new(vec![vec![1.0, 1.0]], vec![0.0]).unwrap();
        let err = model.predict(&batch(vec![vec![1.0]])).unwrap_err();
        assert!(matches!(err, ServeError::InferenceFailure(_)));
    }

    #[test]
    fn test_linear_rejects_bad_shapes() {
        assert!(LinearModel::new(vec![], vec![]).is_err());
        assert!(LinearModel::new(vec![vec![1.0], vec![1.0, 2.0]], vec![0.0, 0.0]).is_err());
        assert!(LinearModel::new(vec![vec![1.0]], vec![0.0, 1.0]).is_err());
    }

    #[test]
    fn test_network_forward_softmax() {
        let network = DenseNetwork::new(vec![
            DenseLayer {
                weights: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
                bias: vec![0.0, 0.0],
                activation: Activation::Relu,
            },
            DenseLayer {
                weights: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
                bias: vec![0.0, 0.0],
                activation: Activation::Softmax,
            },
        ])
        .unwrap();

        let input = Tensor::new(vec![1, 2], vec![-3.0, 0.0]).unwrap();
        let output = network.forward(&input).unwrap();
        assert_eq!(output.shape, vec![1, 2]);
        assert!((output.data[0] - 0.5).abs() < 1e-6);
        assert!((output.data.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_network_rejects_unchained_layers() {
        let result = DenseNetwork::new(vec![
            DenseLayer {
                weights: vec![vec![1.0, 1.0]],
                bias: vec![0.0],
                activation: Activation::Identity,
            },
            DenseLayer {
                weights: vec![vec![1.0, 1.0]],
                bias: vec![0.0],
                activation: Activation::Identity,
            },
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_decoders() {
        let estimator = json!({"kind": "linear", "weights": [[1.0, 1.0]], "bias": [0.0]});
        let artifact = EstimatorDecoder
            .decode(estimator.to_string().as_bytes())
            .unwrap();
        assert_eq!(artifact.capability(), Capability::DirectPredict);

        let network = json!({"layers": [{"weights": [[1.0]], "bias": [0.0], "activation": "tanh"}]});
        let artifact = NetworkDecoder.decode(network.to_string().as_bytes()).unwrap();
        assert_eq!(artifact.capability(), Capability::TensorForward);

        assert!(EstimatorDecoder.decode(b"{\"kind\": \"forest\"}").is_err());
        assert!(NetworkDecoder.decode(b"{\"layers\": []}").is_err());
    }
}
