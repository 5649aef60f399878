//! Subset tempering: staged MCMC on growing random subsets of the data.
//!
//! Early stages sample against a small random subset of the pixels, where the
//! posterior is broad and walkers move freely. Each stage's posterior summary
//! becomes the prior that seeds the next stage's walkers, and the final stage
//! runs on the full subset size. The log-posterior of every stage is always
//! evaluated with the model's own priors; refined priors only place walkers.

use crate::result::SamplingResult;
use crate::sampler::EnsembleDriver;
use holofit_core::config::TemperingOptions;
use holofit_core::data::{FitData, Image, RandomSubset, SubsetSelector};
use holofit_core::errors::{FitError, FitResult};
use holofit_core::model::{ForwardModel, Repriored};
use holofit_core::parameter::ParameterSet;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::borrow::Cow;
use std::ops::ControlFlow;
use std::time::Instant;
use tracing::info;

/// One stage of a schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stage {
    pub index: usize,
    /// Fraction of each frame's pixels sampled against
    pub fraction: f64,
    pub n_steps: usize,
    pub n_walkers: usize,
}

/// Per-pixel transformation applied to every frame before fitting.
pub type Preprocess<'a> = &'a dyn Fn(&Image) -> Image;

/// Pixel fractions for `stages + 1` stages, log-spaced from `min_pixels` to `max_pixels`.
///
/// Pixel counts above `n_pixels` are clamped to `n_pixels`. With `stages == 0`
/// the only fraction is the one for `max_pixels`.
pub fn stage_fractions(
    min_pixels: usize,
    max_pixels: usize,
    stages: usize,
    n_pixels: usize,
) -> FitResult<Vec<f64>> {
    if n_pixels == 0 {
        return Err(FitError::InvalidSchedule(
            "Cannot schedule stages for an image with no pixels".to_string(),
        ));
    }
    if min_pixels == 0 {
        return Err(FitError::InvalidSchedule(
            "min_pixels must be at least 1".to_string(),
        ));
    }
    if min_pixels > max_pixels {
        return Err(FitError::InvalidSchedule(format!(
            "min_pixels ({}) exceeds max_pixels ({})",
            min_pixels, max_pixels
        )));
    }

    let n = n_pixels as f64;
    let low = min_pixels.min(n_pixels) as f64;
    let high = max_pixels.min(n_pixels) as f64;
    if stages == 0 {
        return Ok(vec![high / n]);
    }

    let (log_low, log_high) = (low.log10(), high.log10());
    let fractions: Vec<f64> = (0..=stages)
        .map(|k| match k {
            0 => low / n,
            k if k == stages => high / n,
            k => 10f64.powf(log_low + (log_high - log_low) * k as f64 / stages as f64) / n,
        })
        .collect();

    if fractions.windows(2).any(|w| w[1] <= w[0]) {
        return Err(FitError::InvalidSchedule(format!(
            "{} stages between {} and {} of {} pixels do not give increasing subsets",
            stages, min_pixels, max_pixels, n_pixels
        )));
    }
    Ok(fractions)
}

/// Lay out every stage of a run over frames of `n_pixels` pixels; the last entry is the final stage.
pub fn plan_stages(options: &TemperingOptions, n_pixels: usize) -> FitResult<Vec<Stage>> {
    let fractions = stage_fractions(
        options.min_pixels,
        options.max_pixels,
        options.stages,
        n_pixels,
    )?;
    Ok(fractions
        .into_iter()
        .enumerate()
        .map(|(index, fraction)| Stage {
            index,
            fraction,
            n_steps: if index == options.stages {
                options.final_len
            } else {
                options.stage_len
            },
            n_walkers: options.n_walkers,
        })
        .collect())
}

/// Fit `model` to `data` by subset tempering and return the final stage's samples.
///
/// # Example
///
/// ```ignore
/// let options = TemperingOptions { n_walkers: 50, seed: Some(1), ..Default::default() };
/// let result = subset_tempering(&model, &data, &options, EnsembleSampler::new(), None)?;
/// println!("{}", result);
/// ```
pub fn subset_tempering<M, D>(
    model: &M,
    data: &FitData,
    options: &TemperingOptions,
    driver: D,
    preprocess: Option<Preprocess<'_>>,
) -> FitResult<SamplingResult>
where
    M: ForwardModel,
    D: EnsembleDriver,
{
    subset_tempering_with_observer(model, data, options, driver, preprocess, |_, _| {
        ControlFlow::Continue(())
    })
}

/// [`subset_tempering`] with a callback after each preliminary stage.
///
/// `on_stage` receives the finished stage and the priors refined from it.
/// Returning [`ControlFlow::Break`] stops the run with [`FitError::Cancelled`].
pub fn subset_tempering_with_observer<M, D, F>(
    model: &M,
    data: &FitData,
    options: &TemperingOptions,
    driver: D,
    preprocess: Option<Preprocess<'_>>,
    mut on_stage: F,
) -> FitResult<SamplingResult>
where
    M: ForwardModel,
    D: EnsembleDriver,
    F: FnMut(&Stage, &ParameterSet) -> ControlFlow<()>,
{
    options.validate()?;
    let driver = match options.threads {
        Some(threads) => driver.with_threads(Some(threads)),
        None => driver,
    };

    let data = match preprocess {
        Some(preprocess) => data.try_map(|image| Ok(preprocess(image)))?,
        None => data.clone(),
    };
    let n_pixels = data.n_pixels();
    let plan = plan_stages(options, n_pixels)?;
    let Some((last, preliminary)) = plan.split_last() else {
        return Err(FitError::InvalidSchedule("No stages to run".to_string()));
    };

    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let extra_uncertainty = options.extra_uncertainty.as_deref();
    let mut seed_priors = Cow::Borrowed(model.parameters());

    for stage in preliminary {
        let start = Instant::now();
        let refined = run_stage(model, &data, stage, &seed_priors, &driver, &mut rng)
            .and_then(|result| result.updated_priors(extra_uncertainty))
            .map_err(|e| e.at_stage(stage.index))?;

        info!(
            stage = stage.index,
            fraction = stage.fraction,
            pixels = RandomSubset::n_selected(n_pixels, stage.fraction),
            elapsed_s = start.elapsed().as_secs_f64(),
            priors = %describe(&refined),
            "Stage complete"
        );

        if on_stage(stage, &refined).is_break() {
            return Err(FitError::Cancelled { stage: stage.index });
        }
        seed_priors = Cow::Owned(refined);
    }

    let start = Instant::now();
    let result = run_stage(model, &data, last, &seed_priors, &driver, &mut rng)
        .map_err(|e| e.at_stage(last.index))?;
    info!(
        stage = last.index,
        fraction = last.fraction,
        steps = last.n_steps,
        elapsed_s = start.elapsed().as_secs_f64(),
        "Final stage complete"
    );

    Ok(result)
}

fn run_stage<M, D>(
    model: &M,
    data: &FitData,
    stage: &Stage,
    seed_priors: &ParameterSet,
    driver: &D,
    rng: &mut StdRng,
) -> FitResult<SamplingResult>
where
    M: ForwardModel,
    D: EnsembleDriver,
{
    let subset = RandomSubset.select_data(data, stage.fraction, rng)?;
    let initial = seed_priors.sample(stage.n_walkers, rng)?;
    let chain = driver.run(model, &subset, initial, stage.n_steps, rng)?;
    Ok(SamplingResult::from_chain(chain, model.parameters().clone()))
}

fn describe(parameters: &ParameterSet) -> String {
    parameters
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Fit every frame of a sequence in turn.
///
/// Frame `i + 1` is fitted with the priors refined from frame `i`, so slowly
/// drifting parameters are tracked from one frame to the next. Each frame gets
/// its own seed derived from `options.seed`.
pub fn fit_timeseries<M, D>(
    model: &M,
    data: &FitData,
    options: &TemperingOptions,
    driver: D,
    preprocess: Option<Preprocess<'_>>,
) -> FitResult<Vec<SamplingResult>>
where
    M: ForwardModel,
    D: EnsembleDriver + Clone,
{
    let mut priors = model.parameters().clone();
    let mut results = Vec::with_capacity(data.n_frames());

    for (i, frame) in data.frames().iter().enumerate() {
        let frame_model = Repriored::new(model, priors)?;
        let frame_options = TemperingOptions {
            seed: options.seed.map(|seed| seed.wrapping_add(i as u64)),
            ..options.clone()
        };
        let result = subset_tempering(
            &frame_model,
            &FitData::SingleFrame(frame.clone()),
            &frame_options,
            driver.clone(),
            preprocess,
        )?;
        priors = result.updated_priors(options.extra_uncertainty.as_deref())?;

        info!(frame = i, priors = %describe(&priors), "Frame complete");
        results.push(result);
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use approx::assert_relative_eq;
    use holofit_core::prior::{Gaussian, Uniform};
    use ndarray::{Array1, Array2};
    use rand::Rng;
    use std::sync::{Arc, Mutex};

    /// Single-parameter model with the likelihood peaked at `x = 0`.
    struct Flat {
        params: ParameterSet,
    }

    impl Flat {
        fn new() -> Self {
            let mut params = ParameterSet::new();
            params
                .add("x", Box::new(Uniform::new(-5.0, 5.0).unwrap()))
                .unwrap();
            Self { params }
        }
    }

    impl ForwardModel for Flat {
        fn parameters(&self) -> &ParameterSet {
            &self.params
        }

        fn log_likelihood(&self, values: &[f64], _data: &FitData) -> FitResult<f64> {
            Ok(-2.0 * values[0].powi(2))
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Call {
        pixels: usize,
        walkers: usize,
        steps: usize,
    }

    /// Records each call and returns walkers spread evenly over [-1, 1].
    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<Call>>>,
        collapse: bool,
    }

    impl EnsembleDriver for Recorder {
        fn run<M, R>(
            &self,
            model: &M,
            data: &FitData,
            initial: Array2<f64>,
            n_steps: usize,
            _rng: &mut R,
        ) -> FitResult<Chain>
        where
            M: ForwardModel,
            R: Rng,
        {
            let (n_walkers, n_params) = initial.dim();
            self.calls.lock().unwrap().push(Call {
                pixels: data.n_pixels(),
                walkers: n_walkers,
                steps: n_steps,
            });

            let x = if self.collapse {
                Array1::from_elem(n_walkers, 0.5)
            } else {
                Array1::linspace(-1.0, 1.0, n_walkers)
            };
            let positions = Array2::from_shape_fn((n_walkers, n_params), |(w, _)| x[w]);
            let log_probs = x.mapv(|v| -2.0 * v * v);
            let mut chain = Chain::new(model.parameters().names());
            for _ in 0..n_steps {
                chain.push(positions.clone(), log_probs.clone());
            }
            Ok(chain)
        }

        fn with_threads(self, _threads: Option<usize>) -> Self {
            self
        }
    }

    fn image(n: usize) -> FitData {
        Image::from_array(&Array2::zeros((n, n))).into()
    }

    fn options() -> TemperingOptions {
        TemperingOptions {
            final_len: 7,
            n_walkers: 12,
            min_pixels: 4,
            max_pixels: 100,
            stages: 2,
            stage_len: 3,
            seed: Some(0),
            ..Default::default()
        }
    }

    #[test]
    fn test_fractions_are_log_spaced() {
        let fractions = stage_fractions(10, 1000, 2, 1600).unwrap();
        assert_eq!(fractions.len(), 3);
        assert_relative_eq!(fractions[0], 10.0 / 1600.0);
        assert_relative_eq!(fractions[1], 100.0 / 1600.0, epsilon = 1e-12);
        assert_relative_eq!(fractions[2], 1000.0 / 1600.0);
    }

    #[test]
    fn test_fractions_strictly_increasing_and_bounded() {
        let fractions = stage_fractions(10, 1000, 5, 1600).unwrap();
        assert_eq!(fractions.len(), 6);
        assert!(fractions.windows(2).all(|w| w[0] < w[1]));
        assert!(fractions.iter().all(|&f| f > 0.0 && f <= 1.0));
    }

    #[test]
    fn test_max_pixels_clamped_to_image() {
        let fractions = stage_fractions(10, 5000, 3, 400).unwrap();
        assert_eq!(*fractions.last().unwrap(), 1.0);
    }

    #[test]
    fn test_zero_stages_uses_max_pixels() {
        assert_eq!(stage_fractions(10, 200, 0, 400).unwrap(), vec![0.5]);
        assert_eq!(stage_fractions(10, 1000, 0, 400).unwrap(), vec![1.0]);
    }

    #[test]
    fn test_invalid_fractions() {
        for (min, max, stages, n) in [(0, 100, 2, 400), (200, 100, 2, 400), (50, 50, 2, 400), (10, 100, 2, 0)] {
            assert!(
                matches!(
                    stage_fractions(min, max, stages, n),
                    Err(FitError::InvalidSchedule(_))
                ),
                "expected failure for {:?}",
                (min, max, stages, n)
            );
        }
        // both counts clamp to the same size
        assert!(stage_fractions(500, 1000, 2, 400).is_err());
    }

    #[test]
    fn test_plan_stage_lengths() {
        let plan = plan_stages(&options(), 400).unwrap();
        let steps: Vec<usize> = plan.iter().map(|s| s.n_steps).collect();
        assert_eq!(steps, vec![3, 3, 7]);
        assert!(plan.iter().all(|s| s.n_walkers == 12));
        assert_eq!(plan[2].index, 2);
    }

    #[test]
    fn test_stages_run_on_growing_subsets() {
        let driver = Recorder::default();
        let result = subset_tempering(&Flat::new(), &image(20), &options(), driver.clone(), None)
            .unwrap();

        let calls = driver.calls.lock().unwrap().clone();
        let pixels: Vec<usize> = calls.iter().map(|c| c.pixels).collect();
        assert_eq!(pixels.len(), 3);
        assert_eq!((pixels[0], pixels[2]), (4, 100));
        assert!((19..=21).contains(&pixels[1]), "{:?}", pixels);
        let steps: Vec<usize> = calls.iter().map(|c| c.steps).collect();
        assert_eq!(steps, vec![3, 3, 7]);
        assert!(calls.iter().all(|c| c.walkers == 12));
        assert_eq!(result.n_steps(), Some(7));
    }

    #[test]
    fn test_observer_sees_refined_priors_and_can_cancel() {
        let mut seen = Vec::new();
        let err = subset_tempering_with_observer(
            &Flat::new(),
            &image(20),
            &options(),
            Recorder::default(),
            None,
            |stage, priors| {
                seen.push(priors.get("x").unwrap().prior().to_string());
                if stage.index == 1 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        )
        .unwrap_err();

        assert!(matches!(err, FitError::Cancelled { stage: 1 }));
        assert_eq!(seen.len(), 2);
        // uniform refines to a gaussian bounded to the same range
        assert!(seen[0].contains("lb=-5, ub=5"), "{}", seen[0]);
    }

    #[test]
    fn test_collapsed_stage_fails_refinement() {
        let driver = Recorder {
            collapse: true,
            ..Default::default()
        };
        let err = subset_tempering(&Flat::new(), &image(20), &options(), driver, None).unwrap_err();

        match err {
            FitError::PriorRefinement {
                stage, parameter, ..
            } => {
                assert_eq!(stage, Some(0));
                assert_eq!(parameter, "x");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_extra_uncertainty_rescues_collapsed_stage() {
        let driver = Recorder {
            collapse: true,
            ..Default::default()
        };
        let options = TemperingOptions {
            extra_uncertainty: Some(vec![0.1]),
            ..options()
        };
        assert!(subset_tempering(&Flat::new(), &image(20), &options, driver, None).is_ok());
    }

    #[test]
    fn test_preprocess_applies_to_every_frame() {
        struct Brightness(ParameterSet);
        impl ForwardModel for Brightness {
            fn parameters(&self) -> &ParameterSet {
                &self.0
            }
            fn log_likelihood(&self, _values: &[f64], data: &FitData) -> FitResult<f64> {
                assert!(data.frames()[0].values().iter().all(|&v| v == 1.0));
                Ok(0.0)
            }
        }

        let mut params = ParameterSet::new();
        params
            .add("x", Box::new(Gaussian::new(0.0, 1.0).unwrap()))
            .unwrap();
        let preprocess = |image: &Image| image.map_values(|v| v + 1.0);
        let options = TemperingOptions {
            stages: 0,
            ..options()
        };

        subset_tempering(
            &Brightness(params),
            &image(10),
            &options,
            crate::sampler::EnsembleSampler::new(),
            Some(&preprocess),
        )
        .unwrap();
    }

    #[test]
    fn test_timeseries_fits_each_frame() {
        let driver = Recorder::default();
        let frames: FitData = vec![
            Image::from_array(&Array2::zeros((10, 10))),
            Image::from_array(&Array2::zeros((10, 10))),
            Image::from_array(&Array2::zeros((10, 10))),
        ]
        .into();

        let results = fit_timeseries(&Flat::new(), &frames, &options(), driver.clone(), None).unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(driver.calls.lock().unwrap().len(), 9);
        // later frames carry the refined priors forward
        let second = results[1].parameters().get("x").unwrap().prior().to_string();
        assert!(second.starts_with("mu="), "{}", second);
    }
}
