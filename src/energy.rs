//! Boundary and regional energy terms.
//!
//! A boundary term maps the dissimilarity `d` of two neighbouring samples to an edge capacity in
//! `(0, 1]`. The capacity decreases with `d`: cutting between similar neighbours is expensive,
//! cutting between dissimilar ones is cheap. Every term is floored at the smallest positive
//! float, the max-flow solver treats zero as "no edge".

use crate::arrays::Volume;
use crate::error::{GraphCutError, GraphCutResult};
use crate::graph::{Capacity, Graph};
use multiversion::multiversion;

/// Replaces weights below the smallest positive normal float (including subnormals, zero and
/// NaN) by that float.
#[inline(always)]
pub fn floor_positive(w: f64) -> f64 {
    if w >= f64::MIN_POSITIVE {
        w
    } else {
        f64::MIN_POSITIVE
    }
}

/// `1 - d / D`, where `D` is the maximum possible difference in the image.
#[inline(always)]
pub fn linear(d: f64, max_difference: f64) -> f64 {
    if max_difference == 0.0 {
        // all samples equal, every pair is maximally similar
        return 1.0;
    }
    floor_positive(1.0 - d / max_difference)
}

/// `exp(-d^2 / sigma^2)`
#[inline(always)]
pub fn exponential(d: f64, sigma: f64) -> f64 {
    floor_positive((-(d * d) / (sigma * sigma)).exp())
}

/// `1 / (1 + d / sigma)`
#[inline(always)]
pub fn division(d: f64, sigma: f64) -> f64 {
    floor_positive(1.0 / (1.0 + d / sigma))
}

/// `(1 / (1 + d))^sigma`
#[inline(always)]
pub fn power(d: f64, sigma: f64) -> f64 {
    floor_positive((1.0 / (1.0 + d)).powf(sigma))
}

/// How the samples of two neighbours are combined into the dissimilarity `d`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Neighbourhood {
    /// `|I_p - I_q|`, meant for the original (intensity) image.
    Difference,
    /// `max(|I_p|, |I_q|)`, meant for a gradient magnitude image.
    Maximum,
}

impl Neighbourhood {
    #[inline(always)]
    pub fn dissimilarity(self, p: f64, q: f64) -> f64 {
        match self {
            Neighbourhood::Difference => (p - q).abs(),
            Neighbourhood::Maximum => p.abs().max(q.abs()),
        }
    }
}

/// The boundary functions with their parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BoundaryFunction {
    Linear { max_difference: f64 },
    Exponential { sigma: f64 },
    Division { sigma: f64 },
    Power { sigma: f64 },
}

impl BoundaryFunction {
    #[inline(always)]
    pub fn apply(&self, d: f64) -> f64 {
        match *self {
            BoundaryFunction::Linear { max_difference } => linear(d, max_difference),
            BoundaryFunction::Exponential { sigma } => exponential(d, sigma),
            BoundaryFunction::Division { sigma } => division(d, sigma),
            BoundaryFunction::Power { sigma } => power(d, sigma),
        }
    }
}

/// Edge weight of a pair of neighbouring samples.
///
/// Implemented by [`VoxelBoundary`], by [`Directed`] and by every `Fn(f64, f64) -> f64` closure,
/// so callers can plug in their own terms. Builders never clamp what a term returns: a
/// non-positive capacity is reported as `InvalidCapacity`.
pub trait BoundaryTerm: Sync {
    /// `(cap(p->q), cap(q->p))` for the samples `p` and `q` of two neighbours, `q` being the
    /// successor of `p` along an axis.
    fn capacities(&self, p: f64, q: f64) -> (Capacity, Capacity);

    /// Batch version, `out[i] = capacities(first[i], second[i])`.
    fn capacities_into(&self, first: &[f64], second: &[f64], out: &mut [(Capacity, Capacity)]) {
        debug_assert_eq!(first.len(), second.len());
        debug_assert_eq!(first.len(), out.len());
        for ((p, q), o) in first.iter().zip(second).zip(out.iter_mut()) {
            *o = self.capacities(*p, *q);
        }
    }
}

impl<F> BoundaryTerm for F
where
    F: Fn(f64, f64) -> f64 + Sync,
{
    #[inline(always)]
    fn capacities(&self, p: f64, q: f64) -> (Capacity, Capacity) {
        let w = self(p, q);
        (w, w)
    }
}

/// Undirected boundary term `g(d(I_p, I_q))`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoxelBoundary {
    pub function: BoundaryFunction,
    pub neighbourhood: Neighbourhood,
}

fn max_difference(image: &Volume<f64>) -> f64 {
    image.min_max().map_or(0.0, |(lo, hi)| (hi - lo).abs())
}

impl VoxelBoundary {
    pub fn new(function: BoundaryFunction, neighbourhood: Neighbourhood) -> Self {
        Self {
            function,
            neighbourhood,
        }
    }

    /// Linear term on the original image, normalised by its intensity range.
    pub fn difference_linear(original: &Volume<f64>) -> Self {
        Self::new(
            BoundaryFunction::Linear {
                max_difference: max_difference(original),
            },
            Neighbourhood::Difference,
        )
    }

    /// Linear term on the gradient image, normalised by its range.
    pub fn maximum_linear(gradient: &Volume<f64>) -> Self {
        Self::new(
            BoundaryFunction::Linear {
                max_difference: max_difference(gradient),
            },
            Neighbourhood::Maximum,
        )
    }

    pub fn difference_exponential(sigma: f64) -> Self {
        Self::new(
            BoundaryFunction::Exponential { sigma },
            Neighbourhood::Difference,
        )
    }

    pub fn maximum_exponential(sigma: f64) -> Self {
        Self::new(BoundaryFunction::Exponential { sigma }, Neighbourhood::Maximum)
    }

    pub fn difference_division(sigma: f64) -> Self {
        Self::new(BoundaryFunction::Division { sigma }, Neighbourhood::Difference)
    }

    pub fn maximum_division(sigma: f64) -> Self {
        Self::new(BoundaryFunction::Division { sigma }, Neighbourhood::Maximum)
    }

    pub fn difference_power(sigma: f64) -> Self {
        Self::new(BoundaryFunction::Power { sigma }, Neighbourhood::Difference)
    }

    pub fn maximum_power(sigma: f64) -> Self {
        Self::new(BoundaryFunction::Power { sigma }, Neighbourhood::Maximum)
    }

    #[inline(always)]
    pub fn weight(&self, p: f64, q: f64) -> f64 {
        self.function.apply(self.neighbourhood.dissimilarity(p, q))
    }
}

#[multiversion(targets = "simd")]
fn voxel_boundary_weights(
    function: BoundaryFunction,
    neighbourhood: Neighbourhood,
    first: &[f64],
    second: &[f64],
    out: &mut [(Capacity, Capacity)],
) {
    for ((p, q), o) in first.iter().zip(second).zip(out.iter_mut()) {
        let w = function.apply(neighbourhood.dissimilarity(*p, *q));
        *o = (w, w);
    }
}

impl BoundaryTerm for VoxelBoundary {
    #[inline(always)]
    fn capacities(&self, p: f64, q: f64) -> (Capacity, Capacity) {
        let w = self.weight(p, q);
        (w, w)
    }

    fn capacities_into(&self, first: &[f64], second: &[f64], out: &mut [(Capacity, Capacity)]) {
        debug_assert_eq!(first.len(), second.len());
        debug_assert_eq!(first.len(), out.len());
        voxel_boundary_weights(self.function, self.neighbourhood, first, second, out)
    }
}

/// Makes a term directed: the favoured transition gets `min(1, w + |directedness|)`.
///
/// A positive `directedness` favours light-to-dark transitions (cutting `p -> q` is more
/// expensive when `I_p > I_q`), so darker voxels than the object tend to join it. A negative one
/// favours dark-to-light transitions. Zero gives back the undirected term.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Directed<B> {
    pub inner: B,
    pub directedness: f64,
}

impl<B: BoundaryTerm> Directed<B> {
    pub fn new(inner: B, directedness: f64) -> Self {
        Self {
            inner,
            directedness,
        }
    }
}

impl<B: BoundaryTerm> BoundaryTerm for Directed<B> {
    fn capacities(&self, p: f64, q: f64) -> (Capacity, Capacity) {
        let (w, _) = self.inner.capacities(p, q);
        let boosted = (w + self.directedness.abs()).min(1.0).max(w);
        let light_to_dark = self.directedness >= 0.0;
        match (light_to_dark, p > q) {
            (true, true) | (false, false) => (boosted, w),
            (true, false) | (false, true) => (w, boosted),
        }
    }
}

/// Regional term of a foreground probability `p`: `(p * alpha, (1 - p) * alpha)`.
#[inline(always)]
pub fn regional_probability(p: f64, alpha: f64) -> (Capacity, Capacity) {
    (p * alpha, (1.0 - p) * alpha)
}

/// Sets the t-weights of every node of `graph` from a probability map with one value per node.
///
/// Probabilities outside `[0, 1]` produce negative t-weights and fail with `InvalidCapacity`.
pub fn regional_probability_map(
    graph: &mut Graph,
    probability: &Volume<f64>,
    alpha: f64,
) -> GraphCutResult<()> {
    if probability.len() != graph.node_count() {
        return Err(GraphCutError::shape_mismatch(
            &[graph.node_count()],
            probability.shape(),
        ));
    }
    graph.set_tweights_all(
        probability
            .as_slice()
            .iter()
            .map(|p| regional_probability(*p, alpha)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MAX_CAPACITY;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn boundary_functions_values() {
        assert_relative_eq!(linear(1.0, 4.0), 0.75);
        assert_eq!(linear(4.0, 4.0), f64::MIN_POSITIVE);
        assert_eq!(linear(3.0, 0.0), 1.0);
        assert_relative_eq!(exponential(0.0, 2.0), 1.0);
        assert_relative_eq!(exponential(2.0, 2.0), (-1.0f64).exp());
        assert_eq!(exponential(1e6, 1.0), f64::MIN_POSITIVE);
        assert_relative_eq!(division(2.0, 2.0), 0.5);
        assert_relative_eq!(power(1.0, 2.0), 0.25);
        assert_relative_eq!(power(0.0, 3.0), 1.0);
    }

    #[test]
    fn boundary_functions_floor_subnormals() {
        // exp(-737.6) is subnormal, it must not undercut the floor of a larger difference
        let near = exponential(831.13, 30.6035);
        let far = exponential(1327.97, 30.6035);
        assert_eq!(near, f64::MIN_POSITIVE);
        assert_eq!(far, f64::MIN_POSITIVE);
        assert!(near >= far);
        assert_eq!(floor_positive(f64::MIN_POSITIVE / 4.0), f64::MIN_POSITIVE);
        assert_eq!(floor_positive(f64::NAN), f64::MIN_POSITIVE);
        assert_eq!(floor_positive(0.5), 0.5);
    }

    #[test]
    fn neighbourhood_flavours() {
        assert_eq!(Neighbourhood::Difference.dissimilarity(2.0, 5.0), 3.0);
        assert_eq!(Neighbourhood::Difference.dissimilarity(5.0, 2.0), 3.0);
        assert_eq!(Neighbourhood::Maximum.dissimilarity(2.0, -5.0), 5.0);
        assert_eq!(Neighbourhood::Maximum.dissimilarity(-1.0, 0.5), 1.0);
    }

    #[test]
    fn voxel_boundary_linear_range() {
        let image = Volume::from_slice(&[0.0, 2.0, 6.0, 1.0], &[2, 2]).unwrap();
        let term = VoxelBoundary::difference_linear(&image);
        assert_eq!(
            term.function,
            BoundaryFunction::Linear {
                max_difference: 6.0
            }
        );
        assert_relative_eq!(term.weight(0.0, 3.0), 0.5);
        assert_eq!(term.capacities(0.0, 6.0), (f64::MIN_POSITIVE, f64::MIN_POSITIVE));
    }

    #[test]
    fn voxel_boundary_batch_matches_single() {
        let term = VoxelBoundary::maximum_exponential(3.0);
        let first = [0.0, 1.0, -4.0, 10.0, 2.5];
        let second = [0.5, 1.0, 2.0, -1.0, 7.0];
        let mut out = [(0.0, 0.0); 5];
        term.capacities_into(&first, &second, &mut out);
        for ((p, q), o) in first.iter().zip(&second).zip(&out) {
            assert_eq!(*o, term.capacities(*p, *q));
        }
    }

    #[test]
    fn closure_is_a_term() {
        let term = |p: f64, q: f64| 1.0 / (1.0 + (p - q).abs());
        assert_eq!(term.capacities(1.0, 3.0), (1.0 / 3.0, 1.0 / 3.0));
    }

    #[test]
    fn directed_term_favours_transitions() {
        let inner = VoxelBoundary::maximum_power(2.0);
        let w = inner.weight(3.0, 1.0);
        let ltd = Directed::new(inner, 0.1);
        assert_eq!(ltd.capacities(3.0, 1.0), (w + 0.1, w));
        assert_eq!(ltd.capacities(1.0, 3.0), (w, w + 0.1));
        let dtl = Directed::new(inner, -0.1);
        assert_eq!(dtl.capacities(3.0, 1.0), (w, w + 0.1));
        assert_eq!(dtl.capacities(1.0, 3.0), (w + 0.1, w));
        // capped at 1
        let strong = Directed::new(inner, 5.0);
        assert_eq!(strong.capacities(0.0, 0.0), (1.0, 1.0));
        assert_eq!(strong.capacities(0.0, -1.0), (1.0, 0.25));
    }

    #[test]
    fn regional_probability_map_sets_tweights() {
        let mut graph = Graph::new(3, 0).unwrap();
        graph.set_sink_nodes([2]).unwrap();
        let probability = Volume::from_slice(&[1.0, 0.25, 0.5], &[3]).unwrap();
        regional_probability_map(&mut graph, &probability, 2.0).unwrap();
        assert_eq!(graph.tweight(0), (2.0, 0.0));
        assert_eq!(graph.tweight(1), (0.5, 1.5));
        assert_eq!(graph.tweight(2), (0.0, MAX_CAPACITY));

        let out_of_range = Volume::from_slice(&[1.5, 0.0, 0.0], &[3]).unwrap();
        assert!(matches!(
            regional_probability_map(&mut graph, &out_of_range, 1.0),
            Err(GraphCutError::InvalidCapacity { .. })
        ));
        let wrong_size = Volume::from_slice(&[0.5, 0.5], &[2]).unwrap();
        assert!(regional_probability_map(&mut graph, &wrong_size, 1.0).is_err());
    }

    proptest! {
        #[test]
        fn boundary_functions_are_monotone_and_positive(
            d1 in 0.0f64..1000.0,
            delta in 0.0f64..1000.0,
            sigma in 0.1f64..50.0,
            range in 1.0f64..2000.0,
        ) {
            let d2 = d1 + delta;
            let functions = [
                BoundaryFunction::Linear { max_difference: range },
                BoundaryFunction::Exponential { sigma },
                BoundaryFunction::Division { sigma },
                BoundaryFunction::Power { sigma },
            ];
            for function in functions {
                let w1 = function.apply(d1);
                let w2 = function.apply(d2);
                prop_assert!(w1 > 0.0 && w2 > 0.0);
                prop_assert!(w1 <= 1.0);
                prop_assert!(w2 <= w1, "{:?}: f({}) = {} < f({}) = {}", function, d1, w1, d2, w2);
            }
        }
    }
}
