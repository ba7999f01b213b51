//! Top-1 / top-5 scoring.

use ndarray::ArrayView1;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::error::{QuantError, Result};
use crate::nn::{as_matrix, Model};
use crate::tensor::Tensor;
use crate::zoo::Dataset;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Percentages in `[0, 100]`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Accuracy {
    pub top1: f64,
    pub top5: f64,
}

/// Maps raw `0..=255` features to normalized ones; feature `j` is treated as
/// colour channel `j % 3`.
pub fn imagenet_normalize(tensor: &Tensor) -> Tensor {
    let mut data = tensor.data().clone();
    for mut row in data.rows_mut() {
        for (j, v) in row.iter_mut().enumerate() {
            let c = j % 3;
            *v = (*v / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    tensor.with_data(data)
}

/// Position `label` would take if `scores` were stably sorted descending.
fn rank_of(scores: ArrayView1<'_, f32>, label: usize) -> usize {
    let target = scores[label];
    scores
        .iter()
        .enumerate()
        .filter(|&(j, &s)| s > target || (s == target && j < label))
        .count()
}

/// First index of the largest score.
pub fn argmax(scores: ArrayView1<'_, f32>) -> usize {
    scores
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_score), (j, &s)| {
            if s > best_score {
                (j, s)
            } else {
                (best, best_score)
            }
        })
        .0
}

/// Runs `model` over at most `sample_limit` batches of `dataset`.
///
/// Forward passes are issued one batch at a time in dataset order, which is
/// what drives activation calibration. `device_count` is recorded only:
/// evaluation is single-stream.
pub fn evaluate(
    model: &mut Model,
    dataset: &Dataset,
    ctx: &ExecutionContext,
    device_count: usize,
    sample_limit: Option<usize>,
    is_imagenet: bool,
) -> Result<Accuracy> {
    if device_count == 0 {
        return Err(QuantError::Configuration("device_count must be positive".into()));
    }
    let limit = sample_limit.unwrap_or(dataset.len());

    let mut passed = 0usize;
    let mut correct1 = 0usize;
    let mut correct5 = 0usize;
    for batch in dataset.iter().take(limit) {
        let input = if is_imagenet {
            imagenet_normalize(&batch.input)
        } else {
            batch.input.clone()
        };
        let output = model.forward(&input, ctx)?;
        let scores = as_matrix(&output)?;
        if scores.nrows() != batch.labels.len() {
            return Err(QuantError::ShapeMismatch {
                expected: vec![batch.labels.len(), scores.ncols()],
                got: output.shape().to_vec(),
            });
        }

        for (row, &label) in scores.rows().into_iter().zip(&batch.labels) {
            let rank = rank_of(row, label);
            correct1 += usize::from(rank < 1);
            correct5 += usize::from(rank < 5);
        }
        passed += batch.labels.len();
    }

    if passed == 0 {
        debug!("no samples evaluated");
        return Ok(Accuracy::default());
    }
    let accuracy = Accuracy {
        top1: correct1 as f64 * 100.0 / passed as f64,
        top5: correct5 as f64 * 100.0 / passed as f64,
    };
    debug!(samples = passed, device_count, top1 = accuracy.top1, top5 = accuracy.top5, "evaluated");
    Ok(accuracy)
}
