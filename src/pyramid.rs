//! Resolution pyramid: level planning and mean-window downsampling

use crate::access::LevelReader;
use crate::error::{ConvertError, Result};
use crate::utils::ceil_div;
use crate::volume::{map_buffer, Element, Region, VolumeBuffer};
use crate::writer::ChunkSource;
use async_trait::async_trait;
use ndarray::{ArrayD, IxDyn, Zip};
use serde::{Deserialize, Serialize};

/// Parameters controlling how many levels are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PyramidOptions {
    /// Downsampling factor along pooled axes
    pub factor: usize,
    /// A new level is added only while its smallest pooled extent exceeds this
    pub min_extent: usize,
    /// Upper bound on the number of levels, including level 0
    pub max_levels: Option<usize>,
}

impl Default for PyramidOptions {
    fn default() -> Self {
        Self {
            factor: 2,
            min_extent: 64,
            max_levels: None,
        }
    }
}

/// Shape and factors of one resolution level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelSpec {
    pub index: usize,
    pub shape: Vec<usize>,
    /// Factor relative to the previous level (all ones for level 0)
    pub factor: Vec<usize>,
    /// Factor relative to level 0
    pub cumulative: Vec<usize>,
}

/// The sequence of levels a job will write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PyramidPlan {
    pub factor: usize,
    pub levels: Vec<LevelSpec>,
}

impl PyramidPlan {
    pub fn new(shape: &[usize], pooled: &[bool], options: &PyramidOptions) -> Result<Self> {
        if options.factor < 2 {
            return Err(ConvertError::InvalidConfig(format!(
                "downsample factor must be at least 2, got {}",
                options.factor
            )));
        }
        if pooled.len() != shape.len() {
            return Err(ConvertError::Internal(format!(
                "{} pooling flags for a {}-d volume",
                pooled.len(),
                shape.len()
            )));
        }
        if options.max_levels == Some(0) {
            return Err(ConvertError::InvalidConfig(
                "max_levels must be at least 1".to_string(),
            ));
        }

        let factor: Vec<usize> = pooled
            .iter()
            .map(|&p| if p { options.factor } else { 1 })
            .collect();

        let mut levels = vec![LevelSpec {
            index: 0,
            shape: shape.to_vec(),
            factor: vec![1; shape.len()],
            cumulative: vec![1; shape.len()],
        }];

        if pooled.iter().any(|&p| p) {
            loop {
                if options.max_levels.is_some_and(|max| levels.len() >= max) {
                    break;
                }
                let Some(previous) = levels.last() else {
                    break;
                };
                let next: Vec<usize> = previous
                    .shape
                    .iter()
                    .zip(&factor)
                    .map(|(&n, &f)| ceil_div(n, f))
                    .collect();
                let smallest = next
                    .iter()
                    .zip(pooled)
                    .filter(|(_, p)| **p)
                    .map(|(n, _)| *n)
                    .min()
                    .unwrap_or(0);
                if smallest <= options.min_extent || next == previous.shape {
                    break;
                }
                let cumulative = previous
                    .cumulative
                    .iter()
                    .zip(&factor)
                    .map(|(c, f)| c * f)
                    .collect();
                levels.push(LevelSpec {
                    index: levels.len(),
                    shape: next,
                    factor: factor.clone(),
                    cumulative,
                });
            }
        }

        Ok(Self {
            factor: options.factor,
            levels,
        })
    }

    /// A plan with only full resolution
    pub fn single_level(shape: &[usize]) -> Self {
        Self {
            factor: 2,
            levels: vec![LevelSpec {
                index: 0,
                shape: shape.to_vec(),
                factor: vec![1; shape.len()],
                cumulative: vec![1; shape.len()],
            }],
        }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }
}

/// Region of the finer level averaged into `region` of the coarser one
pub fn source_region(region: &Region, factor: &[usize], finer_shape: &[usize]) -> Region {
    let (start, shape) = region
        .start
        .iter()
        .zip(region.end())
        .zip(factor.iter().zip(finer_shape))
        .map(|((&a, b), (&f, &n))| {
            let lo = a * f;
            let hi = (b * f).min(n);
            (lo, hi - lo)
        })
        .unzip();
    Region::new(start, shape)
}

/// Mean over non-overlapping windows; edge windows average what is available
pub fn downsample<T: Element>(input: &ArrayD<T>, factor: &[usize]) -> ArrayD<T> {
    let out_shape: Vec<usize> = input
        .shape()
        .iter()
        .zip(factor)
        .map(|(&n, &f)| ceil_div(n, f))
        .collect();

    // One pass over the input, accumulating into the window each sample falls in
    let mut sums = ArrayD::<f64>::zeros(IxDyn(&out_shape));
    let mut counts = ArrayD::<u32>::zeros(IxDyn(&out_shape));
    let mut window = vec![0usize; out_shape.len()];
    for (idx, value) in input.indexed_iter() {
        for (axis, w) in window.iter_mut().enumerate() {
            *w = idx[axis] / factor[axis];
        }
        sums[window.as_slice()] += value.to_f64().unwrap_or(0.0);
        counts[window.as_slice()] += 1;
    }

    Zip::from(&sums)
        .and(&counts)
        .map_collect(|&sum, &count| T::from_mean(sum / f64::from(count)))
}

/// [`downsample`] over a buffer of any sample type
pub fn downsample_buffer(input: &VolumeBuffer, factor: &[usize]) -> VolumeBuffer {
    map_buffer!(input, a => downsample(a, factor))
}

/// Build every planned level in memory
pub fn build_pyramid(
    volume: &VolumeBuffer,
    pooled: &[bool],
    options: &PyramidOptions,
) -> Result<(PyramidPlan, Vec<VolumeBuffer>)> {
    let plan = PyramidPlan::new(volume.shape(), pooled, options)?;
    let mut levels = vec![volume.clone()];
    for spec in &plan.levels[1..] {
        let coarser = levels
            .last()
            .map(|finer| downsample_buffer(finer, &spec.factor))
            .ok_or_else(|| ConvertError::Internal("empty pyramid".to_string()))?;
        debug_assert_eq!(coarser.shape(), spec.shape.as_slice());
        levels.push(coarser);
    }
    Ok((plan, levels))
}

/// Produces a level's chunks from the previous level as stored
pub struct Downsampler {
    finer: LevelReader,
    factor: Vec<usize>,
}

impl Downsampler {
    pub fn new(finer: LevelReader, spec: &LevelSpec) -> Self {
        Self {
            finer,
            factor: spec.factor.clone(),
        }
    }
}

#[async_trait]
impl ChunkSource for Downsampler {
    async fn read(&self, region: &Region) -> Result<VolumeBuffer> {
        let input = source_region(region, &self.factor, self.finer.shape());
        let block = self.finer.read_region(&input).await?;
        let factor = self.factor.clone();
        Ok(tokio::task::spawn_blocking(move || downsample_buffer(&block, &factor)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn options(min_extent: usize) -> PyramidOptions {
        PyramidOptions {
            factor: 2,
            min_extent,
            max_levels: None,
        }
    }

    fn shapes(plan: &PyramidPlan) -> Vec<Vec<usize>> {
        plan.levels.iter().map(|l| l.shape.clone()).collect()
    }

    #[test]
    fn test_plan_stops_at_min_extent() {
        let plan = PyramidPlan::new(&[256, 256, 256], &[true; 3], &options(64)).unwrap();
        assert_eq!(shapes(&plan), vec![vec![256; 3], vec![128; 3]]);
        assert_eq!(plan.levels[1].cumulative, vec![2, 2, 2]);
    }

    #[test]
    fn test_plan_level_shapes_round_up() {
        let plan = PyramidPlan::new(&[3, 101, 57], &[false, true, true], &options(4)).unwrap();
        assert_eq!(
            shapes(&plan),
            vec![
                vec![3, 101, 57],
                vec![3, 51, 29],
                vec![3, 26, 15],
                vec![3, 13, 8],
            ]
        );
        for pair in plan.levels.windows(2) {
            for axis in 0..3 {
                assert_eq!(
                    pair[1].shape[axis],
                    ceil_div(pair[0].shape[axis], pair[1].factor[axis])
                );
            }
        }
    }

    #[test]
    fn test_plan_max_levels_and_small_input() {
        let capped = PyramidOptions {
            max_levels: Some(2),
            ..options(1)
        };
        let plan = PyramidPlan::new(&[1024, 1024], &[true, true], &capped).unwrap();
        assert_eq!(plan.num_levels(), 2);

        let plan = PyramidPlan::new(&[40, 40], &[true, true], &options(64)).unwrap();
        assert_eq!(plan.num_levels(), 1);

        let plan = PyramidPlan::new(&[5], &[false], &options(0)).unwrap();
        assert_eq!(plan.num_levels(), 1);
    }

    #[test]
    fn test_plan_rejects_bad_factor() {
        let bad = PyramidOptions {
            factor: 1,
            ..options(1)
        };
        assert!(PyramidPlan::new(&[8], &[true], &bad).is_err());
    }

    #[test]
    fn test_downsample_mean_with_truncated_edge() {
        let input = Array::from_shape_vec(IxDyn(&[1, 5]), vec![1u8, 2, 3, 4, 10]).unwrap();
        let out = downsample(&input, &[1, 2]);
        // (1+2)/2 = 1.5 -> 2, (3+4)/2 = 3.5 -> 4, 10 alone
        assert_eq!(out.into_raw_vec_and_offset().0, vec![2, 4, 10]);
    }

    #[test]
    fn test_downsample_float_and_signed() {
        let input = Array::from_shape_vec(IxDyn(&[2, 2]), vec![1.0f32, 2.0, 3.0, 5.0]).unwrap();
        assert_eq!(downsample(&input, &[2, 2])[[0, 0]], 2.75);

        let input = Array::from_shape_vec(IxDyn(&[2]), vec![-2i16, -3]).unwrap();
        assert_eq!(downsample(&input, &[2])[[0]], -3);
    }

    #[test]
    fn test_downsample_windows_in_3d() {
        // Transposed storage, odd extents on every pooled axis
        let input = Array::from_shape_fn(IxDyn(&[5, 3, 7]), |i| {
            (i[0] * 21 + i[1] * 7 + i[2]) as f64
        })
        .reversed_axes();
        assert_eq!(input.shape(), &[7, 3, 5]);
        let out = downsample(&input, &[2, 1, 2]);
        assert_eq!(out.shape(), &[4, 3, 3]);
        let out = out.into_dimensionality::<ndarray::Ix3>().unwrap();
        for ((a, b, c), &mean) in out.indexed_iter() {
            let mut values = Vec::new();
            for x in 2 * a..(2 * a + 2).min(7) {
                for z in 2 * c..(2 * c + 2).min(5) {
                    values.push(input[[x, b, z]]);
                }
            }
            let expected = values.iter().sum::<f64>() / values.len() as f64;
            assert_eq!(mean, expected, "window {:?}", (a, b, c));
        }
    }

    #[test]
    fn test_source_region_clamps_to_finer_level() {
        let region = Region::new(vec![0, 2], vec![3, 2]);
        let input = source_region(&region, &[1, 2], &[3, 7]);
        assert_eq!(input, Region::new(vec![0, 4], vec![3, 3]));
    }

    #[test]
    fn test_build_pyramid_in_memory() {
        let volume: VolumeBuffer = Array::from_elem(IxDyn(&[16, 16]), 7u16).into();
        let (plan, levels) = build_pyramid(&volume, &[true, true], &options(2)).unwrap();
        assert_eq!(plan.num_levels(), 3);
        assert_eq!(levels[2].shape(), &[4, 4]);
        assert!(levels[2].to_f64_vec().iter().all(|&v| v == 7.0));
    }
}
