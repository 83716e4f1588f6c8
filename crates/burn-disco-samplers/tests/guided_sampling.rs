//! Schedule values checked against a JSON fixture, and full guided
//! sampling loops driven by stub networks.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use burn::prelude::*;
use burn::tensor::Int;
use burn_disco_core::random::seeded_rng;
use burn_disco_samplers::{
    sample_progressive, ConditionFn, DdimConfig, DdimSampler, DdpmSampler, Denoiser, NoiseSchedule,
    PredictionType, SampleInit, SchedulerError, SpacedSchedule, StepCoefficients, TimestepSpacing,
};
use burn_ndarray::NdArray;
use serde::Deserialize;

type TestBackend = NdArray<f32>;

const EPSILON: f64 = 1e-9;

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn assert_approx_eq(expected: f64, actual: f64, name: &str) {
    let diff = (expected - actual).abs();
    assert!(diff < EPSILON, "{name}: expected {expected}, got {actual} (diff: {diff})");
}

#[derive(Debug, Deserialize)]
struct ScheduleFixture {
    num_train_steps: usize,
    alphas_cumprod: HashMap<usize, f64>,
    ddim250_betas: RespacedBetas,
    continuous_time_996: f64,
}

#[derive(Debug, Deserialize)]
struct RespacedBetas {
    first: f64,
    second: f64,
    last: f64,
}

fn load_fixture() -> ScheduleFixture {
    let content = fs::read_to_string(fixtures_dir().join("guided_schedule.json")).expect("Failed to read fixture");
    serde_json::from_str(&content).expect("Failed to parse fixture")
}

#[test]
fn test_guided_schedule_matches_reference() {
    let fixture = load_fixture();
    let schedule = NoiseSchedule::guided_linear(fixture.num_train_steps);

    for (t, expected) in &fixture.alphas_cumprod {
        assert_approx_eq(*expected, schedule.alphas_cumprod[*t], &format!("alphas_cumprod[{t}]"));
    }
}

#[test]
fn test_respaced_betas_match_reference() {
    let fixture = load_fixture();
    let spaced = SpacedSchedule::guided(fixture.num_train_steps, TimestepSpacing::Ddim(250)).unwrap();

    assert_eq!(spaced.len(), 250);
    assert_approx_eq(fixture.ddim250_betas.first, spaced.betas[0], "betas[0]");
    assert_approx_eq(fixture.ddim250_betas.second, spaced.betas[1], "betas[1]");
    assert_approx_eq(fixture.ddim250_betas.last, spaced.betas[249], "betas[249]");

    let last = spaced.coefficients(249);
    assert_eq!(last.timestep, 996);
    assert_approx_eq(fixture.continuous_time_996, last.continuous_time(), "continuous_time");
}

/// Predicts a fixed clean image regardless of input
struct Oracle {
    target: Tensor<TestBackend, 4>,
}

impl Denoiser<TestBackend> for Oracle {
    fn prediction_type(&self) -> PredictionType {
        PredictionType::Sample
    }

    fn forward(
        &self,
        _x: Tensor<TestBackend, 4>,
        _step: &StepCoefficients,
        _labels: Option<&Tensor<TestBackend, 1, Int>>,
    ) -> Tensor<TestBackend, 4> {
        self.target.clone()
    }
}

/// Records the steps it was called at and pushes every pixel up
#[derive(Default)]
struct Recorder {
    timesteps: Vec<usize>,
}

impl ConditionFn<TestBackend> for Recorder {
    type Error = std::convert::Infallible;

    fn gradient(
        &mut self,
        x: Tensor<TestBackend, 4>,
        step: &StepCoefficients,
        _labels: Option<&Tensor<TestBackend, 1, Int>>,
    ) -> Result<Tensor<TestBackend, 4>, Self::Error> {
        self.timesteps.push(step.timestep);
        Ok(x.ones_like() * 0.01)
    }
}

#[test]
fn test_ddim_loop_visits_every_step_once() {
    let device = Default::default();
    let schedule = SpacedSchedule::guided(1000, TimestepSpacing::Ddim(20)).unwrap();
    let oracle = Oracle {
        target: Tensor::zeros([1, 3, 4, 4], &device),
    };
    let sampler = DdimSampler::new(DdimConfig {
        eta: 0.0,
        clip_denoised: false,
    });
    let mut recorder = Recorder::default();
    let mut rng = seeded_rng(0);

    let outputs: Vec<_> = sample_progressive(
        &sampler,
        &schedule,
        &oracle,
        &mut recorder,
        &mut rng,
        SampleInit::noise([1, 3, 4, 4]),
        &device,
    )
    .unwrap()
    .collect::<Result<_, _>>()
    .unwrap();

    assert_eq!(outputs.len(), 20);
    let indices: Vec<usize> = outputs.iter().map(|o| o.index).collect();
    assert_eq!(indices, (0..20).rev().collect::<Vec<_>>());
    assert_eq!(recorder.timesteps.first(), Some(&950));
    assert_eq!(recorder.timesteps.last(), Some(&0));

    let last = outputs.last().unwrap();
    let values: Vec<f32> = last.sample.clone().into_data().to_vec().unwrap();
    assert!(values.iter().all(|v| v.is_finite()));
}

#[test]
fn test_skip_timesteps_starts_from_noised_init() {
    let device = Default::default();
    let schedule = SpacedSchedule::guided(1000, TimestepSpacing::Uniform(10)).unwrap();
    let init = Tensor::<TestBackend, 4>::full([1, 3, 2, 2], 0.5, &device);
    let oracle = Oracle { target: init.clone() };
    let sampler = DdpmSampler::default();
    let mut cond = Recorder::default();
    let mut rng = seeded_rng(3);

    let outputs: Vec<_> = sample_progressive(
        &sampler,
        &schedule,
        &oracle,
        &mut cond,
        &mut rng,
        SampleInit {
            shape: [1, 3, 2, 2],
            init_image: Some(init),
            skip_timesteps: 4,
            labels: None,
        },
        &device,
    )
    .unwrap()
    .collect::<Result<_, _>>()
    .unwrap();

    assert_eq!(outputs.len(), 6);
    assert_eq!(outputs[0].index, 5);
    assert_eq!(cond.timesteps.len(), 6);
}

#[test]
fn test_skipping_every_step_is_rejected() {
    let device = Default::default();
    let schedule = SpacedSchedule::guided(1000, TimestepSpacing::Uniform(10)).unwrap();
    let oracle = Oracle {
        target: Tensor::zeros([1, 3, 2, 2], &device),
    };
    let mut cond = Recorder::default();
    let mut rng = seeded_rng(0);
    let sampler = DdimSampler::default();

    let result = sample_progressive(
        &sampler,
        &schedule,
        &oracle,
        &mut cond,
        &mut rng,
        SampleInit {
            shape: [1, 3, 2, 2],
            init_image: None,
            skip_timesteps: 10,
            labels: None,
        },
        &device,
    );

    assert!(matches!(result, Err(SchedulerError::SkipTooLarge { skip: 10, steps: 10 })));
}

#[test]
fn test_same_seed_same_trajectory() {
    let device = Default::default();
    let schedule = SpacedSchedule::guided(1000, TimestepSpacing::Ddim(10)).unwrap();
    let oracle = Oracle {
        target: Tensor::zeros([1, 3, 2, 2], &device),
    };

    let run = |seed| {
        let mut cond = Recorder::default();
        let mut rng = seeded_rng(seed);
        let outputs: Vec<_> = sample_progressive(
            &DdimSampler::default(),
            &schedule,
            &oracle,
            &mut cond,
            &mut rng,
            SampleInit::noise([1, 3, 2, 2]),
            &device,
        )
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
        outputs
            .first()
            .map(|o| o.sample.clone().into_data().to_vec::<f32>().unwrap())
            .unwrap()
    };

    assert_eq!(run(11), run(11));
    assert_ne!(run(11), run(12));
}
