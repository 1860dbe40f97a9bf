use crate::operator::{ForwardOperator, OperatorError};
use crate::solver::WeightedSystem;
use ndarray::{Array1, ArrayView1};
use std::borrow::Cow;

/// Flux bins whose weighted pixel support falls below this fraction of the
/// best-supported bin are pulled toward zero flux.
pub const DEFAULT_MIN_WEIGHT_FRACTION: f64 = 0.01;

/// Per-flux-bin regularization decision for one extraction.
#[derive(Debug, Clone)]
pub struct RegularizationTerm {
    /// Column sums of `W A`.
    pub effective_weight: Array1<f64>,
    pub max_weight: f64,
    pub min_weight: f64,
    /// Diagonal of the synthetic constraint block: the strength everywhere, the
    /// weight deficit `min_weight - effective_weight` on flagged bins.
    pub diagonal: Array1<f64>,
    pub flagged: Vec<usize>,
}

impl RegularizationTerm {
    pub fn compute(
        operator: &ForwardOperator,
        weights: ArrayView1<f64>,
        strength: f64,
        min_weight_fraction: f64,
    ) -> Result<Self, OperatorError> {
        let effective_weight = operator.weighted_column_sums(weights)?;
        let max_weight = effective_weight.iter().copied().fold(0.0_f64, f64::max);
        let min_weight = min_weight_fraction * max_weight;

        let mut diagonal = Array1::from_elem(effective_weight.len(), strength);
        let mut flagged = Vec::new();
        for (bin, &weight) in effective_weight.iter().enumerate() {
            if weight < min_weight {
                diagonal[bin] = min_weight - weight;
                flagged.push(bin);
            }
        }

        if !flagged.is_empty() {
            log::debug!(
                "{} of {} flux bins have pixel weight below {:.3e}; constraining them toward zero",
                flagged.len(),
                effective_weight.len(),
                min_weight
            );
        }

        Ok(Self {
            effective_weight,
            max_weight,
            min_weight,
            diagonal,
            flagged,
        })
    }

    pub fn is_active(&self) -> bool {
        self.diagonal.iter().any(|&d| d != 0.0)
    }

    /// Stacks `diag(diagonal)` under the operator, with zero pixels and unit weights
    /// for the new rows. Without any non-zero entry the inputs pass through untouched.
    pub fn apply<'a>(
        &self,
        operator: &'a ForwardOperator,
        weights: &'a Array1<f64>,
        pixels: &'a Array1<f64>,
    ) -> Result<WeightedSystem<'a>, OperatorError> {
        if !self.is_active() {
            return Ok(WeightedSystem::new(operator, weights, pixels));
        }
        let nflux = self.diagonal.len();
        let extended = operator.stack_diagonal(self.diagonal.view())?;
        let extended_pixels: Array1<f64> = pixels
            .iter()
            .copied()
            .chain(std::iter::repeat_n(0.0, nflux))
            .collect();
        let extended_weights: Array1<f64> = weights
            .iter()
            .copied()
            .chain(std::iter::repeat_n(1.0, nflux))
            .collect();
        Ok(WeightedSystem {
            operator: Cow::Owned(extended),
            weights: Cow::Owned(extended_weights),
            pixels: Cow::Owned(extended_pixels),
        })
    }
}
