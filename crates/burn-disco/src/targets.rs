//! Text prompts and per-model target embeddings

use burn::prelude::*;
use burn_disco_clip::ImageTextEmbedder;
use burn_disco_core::random::randn;
use rand::Rng;
use tracing::debug;

use crate::error::ConfigError;

/// Noisy copies added per prompt when fuzzy prompts are on
pub const FUZZY_COPIES: usize = 25;

/// Smallest accepted `|sum|` of a model's target weights
pub const MIN_WEIGHT_SUM: f64 = 1e-3;

/// A prompt split into text and weight
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub text: String,
    pub weight: f64,
}

/// Splits `text:weight` at the last colon
///
/// The weight defaults to 1. URLs keep the colon after their scheme, so
/// `https://host/a.png:2` has text `https://host/a.png`.
pub fn parse_prompt(prompt: &str) -> Result<Prompt, ConfigError> {
    let is_url = prompt.starts_with("http://") || prompt.starts_with("https://");
    let split = prompt
        .rsplit_once(':')
        .filter(|(head, _)| !is_url || head.contains(':'));

    match split {
        None => Ok(Prompt {
            text: prompt.to_string(),
            weight: 1.0,
        }),
        Some((text, weight)) => {
            let weight = weight
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|w| w.is_finite())
                .ok_or_else(|| ConfigError::InvalidPromptWeight {
                    prompt: prompt.to_string(),
                })?;
            Ok(Prompt {
                text: text.to_string(),
                weight,
            })
        }
    }
}

pub fn parse_prompts(prompts: &[String]) -> Result<Vec<Prompt>, ConfigError> {
    if prompts.is_empty() {
        return Err(ConfigError::NoPrompts);
    }
    prompts.iter().map(|p| parse_prompt(p)).collect()
}

/// Target embeddings of one model with weights normalized to `|sum| = 1`
#[derive(Debug, Clone)]
pub struct TargetSet<B: Backend> {
    model: String,
    embeddings: Tensor<B, 2>,
    weights: Tensor<B, 1>,
    weight_values: Vec<f64>,
}

impl<B: Backend> TargetSet<B> {
    /// Encodes every prompt with `embedder`
    ///
    /// With `fuzzy_magnitude`, each prompt is replaced by [`FUZZY_COPIES`]
    /// copies perturbed by `N(0, 1) * magnitude` and clamped to `[0, 1]`,
    /// sharing the prompt's weight. The clean embedding is not kept.
    pub fn build<R: Rng>(
        embedder: &dyn ImageTextEmbedder<B>,
        prompts: &[Prompt],
        fuzzy_magnitude: Option<f64>,
        rng: &mut R,
    ) -> Result<Self, ConfigError> {
        let mut embeddings = Vec::new();
        let mut weights = Vec::new();

        for prompt in prompts {
            let text = embedder.encode_text(&prompt.text).detach();

            match fuzzy_magnitude {
                Some(magnitude) => {
                    let [_, dim] = text.dims();
                    for _ in 0..FUZZY_COPIES {
                        let noise: Tensor<B, 2> = randn(rng, [1, dim], &text.device());
                        embeddings.push((text.clone() + noise * magnitude).clamp(0.0, 1.0));
                        weights.push(prompt.weight);
                    }
                }
                None => {
                    embeddings.push(text);
                    weights.push(prompt.weight);
                }
            }
        }

        debug!(model = embedder.name(), targets = embeddings.len(), "encoded prompts");
        Self::from_embeddings(embedder.name(), embeddings, weights)
    }

    /// Stacks `[1, dim]` embeddings and normalizes their weights
    pub fn from_embeddings(model: &str, embeddings: Vec<Tensor<B, 2>>, weights: Vec<f64>) -> Result<Self, ConfigError> {
        let sum: f64 = weights.iter().sum();
        if embeddings.is_empty() || sum.abs() < MIN_WEIGHT_SUM {
            return Err(ConfigError::DegenerateWeights {
                model: model.to_string(),
                sum,
            });
        }

        let weight_values: Vec<f64> = weights.iter().map(|w| w / sum.abs()).collect();
        let embeddings = Tensor::cat(embeddings, 0);
        let device = embeddings.device();
        let floats: Vec<f32> = weight_values.iter().map(|&w| w as f32).collect();
        let weights = Tensor::from_data(TensorData::new(floats, [weight_values.len()]), &device);

        Ok(Self {
            model: model.to_string(),
            embeddings,
            weights,
            weight_values,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn len(&self) -> usize {
        self.weight_values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weight_values.is_empty()
    }

    /// `[targets, dim]`
    pub fn embeddings(&self) -> Tensor<B, 2> {
        self.embeddings.clone()
    }

    /// `[targets]`
    pub fn weights(&self) -> Tensor<B, 1> {
        self.weights.clone()
    }

    pub fn weight_values(&self) -> &[f64] {
        &self.weight_values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_disco_core::random::seeded_rng;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    /// Embeds text as its length along the first axis
    struct LengthEmbedder;

    impl ImageTextEmbedder<TestBackend> for LengthEmbedder {
        fn name(&self) -> &str {
            "length"
        }

        fn encode_text(&self, text: &str) -> Tensor<TestBackend, 2> {
            Tensor::from_floats([[text.len() as f32 / 100.0, 0.5, 0.5]], &Default::default())
        }

        fn encode_image(&self, images: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 2> {
            let [n, _, _, _] = images.dims();
            Tensor::zeros([n, 3], &images.device())
        }
    }

    #[test]
    fn test_parse_prompt_weights() {
        assert_eq!(
            parse_prompt("a lighthouse:3").unwrap(),
            Prompt {
                text: "a lighthouse".into(),
                weight: 3.0
            }
        );
        assert_eq!(parse_prompt("no weight").unwrap().weight, 1.0);
        assert_eq!(parse_prompt("the word 'HI' :13").unwrap().text, "the word 'HI' ");
        assert_eq!(parse_prompt("ugly:-1.5").unwrap().weight, -1.5);
        assert!(matches!(
            parse_prompt("ratio: wide"),
            Err(ConfigError::InvalidPromptWeight { .. })
        ));
    }

    #[test]
    fn test_parse_prompt_urls() {
        let plain = parse_prompt("https://example.com/a.png").unwrap();
        assert_eq!(plain.text, "https://example.com/a.png");
        assert_eq!(plain.weight, 1.0);

        let weighted = parse_prompt("http://example.com/a.png:2").unwrap();
        assert_eq!(weighted.text, "http://example.com/a.png");
        assert_eq!(weighted.weight, 2.0);
    }

    #[test]
    fn test_weights_normalized_by_absolute_sum() {
        let prompts = parse_prompts(&["sea:3".into(), "storm:-1".into(), "ship".into()]).unwrap();
        let targets = TargetSet::build(&LengthEmbedder, &prompts, None, &mut seeded_rng(0)).unwrap();

        assert_eq!(targets.len(), 3);
        assert_eq!(targets.embeddings().dims(), [3, 3]);
        let sum: f64 = targets.weight_values().iter().sum();
        assert!((sum.abs() - 1.0).abs() < 1e-12);
        assert!((targets.weight_values()[0] - 1.0).abs() < 1e-12);
        assert!((targets.weight_values()[1] + 1.0 / 3.0).abs() < 1e-12);

        let on_device: Vec<f32> = targets.weights().into_data().to_vec().unwrap();
        assert!((on_device.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_weights_rejected() {
        let prompts = parse_prompts(&["sea:1".into(), "land:-1".into()]).unwrap();
        let err = TargetSet::build(&LengthEmbedder, &prompts, None, &mut seeded_rng(0)).unwrap_err();
        assert!(matches!(err, ConfigError::DegenerateWeights { ref model, .. } if model == "length"));
    }

    #[test]
    fn test_fuzzy_copies() {
        let prompts = parse_prompts(&["sea:2".into(), "sky".into()]).unwrap();
        let targets = TargetSet::build(&LengthEmbedder, &prompts, Some(0.05), &mut seeded_rng(4)).unwrap();

        // Noisy copies replace the clean embedding
        assert_eq!(targets.len(), 2 * FUZZY_COPIES);
        let values: Vec<f32> = targets.embeddings().into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));

        let clean: Vec<Vec<f32>> = ["sea", "sky"]
            .iter()
            .map(|text| LengthEmbedder.encode_text(text).into_data().to_vec().unwrap())
            .collect();
        for row in values.chunks_exact(3) {
            assert!(clean.iter().all(|c| c.as_slice() != row));
        }

        // Copies share the weight of their prompt
        let w = targets.weight_values();
        assert_eq!(w[0], w[FUZZY_COPIES - 1]);
        assert!((w[0] / w[FUZZY_COPIES] - 2.0).abs() < 1e-12);
    }
}
