use crate::error::{GraphCutError, GraphCutResult};
use aligned_vec::{AVec, ConstAlign};
use std::ops::{Index, IndexMut};

const ALIGN: usize = 64;

/// nD array of samples in C order (last axis is the fastest one), the same layout numpy uses.
///
/// Besides the samples it carries the physical voxel `spacing` (one value per axis, used for
/// directional weighting of edges) and the `offset` of the volume inside the volume it was cut
/// from (zeros for a full volume).
#[derive(Debug, Clone)]
pub struct Volume<T> {
    pub data: AVec<T, ConstAlign<ALIGN>>,
    shape: Vec<usize>,
    strides: Vec<usize>,
    spacing: Vec<f64>,
    offset: Vec<usize>,
}

fn c_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

fn checked_len(shape: &[usize]) -> GraphCutResult<usize> {
    if shape.is_empty() {
        return Err(GraphCutError::shape_mismatch(&[1], shape));
    }
    shape
        .iter()
        .try_fold(1usize, |acc, s| acc.checked_mul(*s))
        .ok_or_else(|| {
            GraphCutError::ResourceExhausted(format!("volume of shape {shape:?} overflows usize"))
        })
}

impl<T> Volume<T> {
    fn from_avec(data: AVec<T, ConstAlign<ALIGN>>, shape: &[usize]) -> Self {
        Self {
            data,
            strides: c_strides(shape),
            spacing: vec![1.0; shape.len()],
            offset: vec![0; shape.len()],
            shape: shape.to_vec(),
        }
    }

    pub fn from_slice(data: &[T], shape: &[usize]) -> GraphCutResult<Self>
    where
        T: Clone,
    {
        if checked_len(shape)? != data.len() {
            return Err(GraphCutError::shape_mismatch(shape, &[data.len()]));
        }
        Ok(Self::from_avec(AVec::from_slice(ALIGN, data), shape))
    }

    pub fn from_vec(data: Vec<T>, shape: &[usize]) -> GraphCutResult<Self> {
        if checked_len(shape)? != data.len() {
            return Err(GraphCutError::shape_mismatch(shape, &[data.len()]));
        }
        Ok(Self::from_avec(AVec::from_iter(ALIGN, data), shape))
    }

    pub fn from_fill(value: T, shape: &[usize]) -> GraphCutResult<Self>
    where
        T: Clone + Copy,
    {
        let len = checked_len(shape)?;
        let data: AVec<T, ConstAlign<ALIGN>> = AVec::from_iter(ALIGN, (0..len).map(|_| value));
        Ok(Self::from_avec(data, shape))
    }

    /// Builds the volume from a function of the flat index.
    pub fn from_fn<F>(shape: &[usize], f: F) -> GraphCutResult<Self>
    where
        F: FnMut(usize) -> T,
    {
        let len = checked_len(shape)?;
        Ok(Self::from_avec(AVec::from_iter(ALIGN, (0..len).map(f)), shape))
    }

    /// Sets the physical voxel size. One strictly positive value per axis.
    pub fn with_spacing(mut self, spacing: &[f64]) -> GraphCutResult<Self> {
        if spacing.len() != self.ndim() {
            return Err(GraphCutError::shape_mismatch(
                &[self.ndim()],
                &[spacing.len()],
            ));
        }
        if let Some(s) = spacing.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(GraphCutError::invalid_capacity(*s, "voxel spacing"));
        }
        self.spacing = spacing.to_vec();
        Ok(self)
    }

    #[inline(always)]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }
    #[inline(always)]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }
    pub fn spacing(&self) -> &[f64] {
        &self.spacing
    }
    pub fn offset(&self) -> &[usize] {
        &self.offset
    }
    #[inline(always)]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn fill(&mut self, value: T)
    where
        T: Clone,
    {
        self.data.fill(value)
    }

    /// Fails with `ShapeMismatch` if `other` is not of the same shape.
    pub fn check_shape<U>(&self, other: &Volume<U>) -> GraphCutResult<()> {
        if self.shape != other.shape {
            return Err(GraphCutError::shape_mismatch(&self.shape, &other.shape));
        }
        Ok(())
    }

    #[inline(always)]
    pub fn get_index(&self, coords: &[usize]) -> usize {
        debug_assert_eq!(coords.len(), self.ndim());
        coords
            .iter()
            .zip(&self.shape)
            .zip(&self.strides)
            .map(|((c, s), stride)| {
                debug_assert!(c < s, "Index {coords:?} is out of bounds {:?}", self.shape);
                c * stride
            })
            .sum()
    }

    pub fn get_coords(&self, index: usize) -> Vec<usize> {
        debug_assert!(index < self.len());
        self.strides
            .iter()
            .zip(&self.shape)
            .map(|(stride, s)| (index / stride) % s)
            .collect()
    }

    /// Number of neighbouring voxel pairs along `axis`.
    pub fn axis_pair_count(&self, axis: usize) -> usize {
        debug_assert!(axis < self.ndim());
        if self.shape[axis] == 0 {
            return 0;
        }
        self.len() / self.shape[axis] * (self.shape[axis] - 1)
    }

    /// Flat indices `(p, q)` of the `pair`-th neighbouring voxel pair along `axis`, where `q` is
    /// the successor of `p` along the axis. Pairs are enumerated in memory order of `p`.
    #[inline(always)]
    pub fn axis_pair(&self, axis: usize, pair: usize) -> (usize, usize) {
        let inner = self.strides[axis];
        let per_outer = (self.shape[axis] - 1) * inner;
        let outer = pair / per_outer;
        let rem = pair % per_outer;
        let p = outer * self.shape[axis] * inner + rem;
        debug_assert!(
            p + inner < self.len(),
            "pair {pair} on axis {axis} out of bounds"
        );
        (p, p + inner)
    }

    /// Calls `f(local_coords, parent_index)` for the first voxel of every row (run along the last
    /// axis) of the region `[start, start + extent)`. Rows are visited in memory order.
    pub(crate) fn for_each_region_row<F>(&self, start: &[usize], extent: &[usize], mut f: F)
    where
        F: FnMut(&[usize], usize),
    {
        debug_assert_eq!(start.len(), self.ndim());
        debug_assert_eq!(extent.len(), self.ndim());
        if extent.iter().any(|e| *e == 0) {
            return;
        }
        let last = self.ndim() - 1;
        let mut local = vec![0usize; self.ndim()];
        loop {
            let parent: usize = local
                .iter()
                .zip(start)
                .zip(&self.strides)
                .map(|((l, s), stride)| (l + s) * stride)
                .sum();
            f(&local, parent);
            // odometer over all axes but the last one
            let mut axis = last;
            loop {
                if axis == 0 {
                    return;
                }
                axis -= 1;
                local[axis] += 1;
                if local[axis] < extent[axis] {
                    break;
                }
                local[axis] = 0;
            }
        }
    }

    /// Copies the region `[start, end)` into a new volume. The spacing is kept and the offset of
    /// the result points at `start` in the coordinates of the outermost volume.
    pub fn subvolume(&self, start: &[usize], end: &[usize]) -> GraphCutResult<Volume<T>>
    where
        T: Clone,
    {
        if start.len() != self.ndim() || end.len() != self.ndim() {
            return Err(GraphCutError::shape_mismatch(&self.shape, end));
        }
        if start
            .iter()
            .zip(end)
            .zip(&self.shape)
            .any(|((s, e), n)| s > e || e > n)
        {
            return Err(GraphCutError::shape_mismatch(&self.shape, end));
        }
        let extent: Vec<usize> = start.iter().zip(end).map(|(s, e)| e - s).collect();
        let row_len = extent[self.ndim() - 1];
        let mut data: Vec<T> = Vec::new();
        data.try_reserve_exact(checked_len(&extent)?)?;
        self.for_each_region_row(start, &extent, |_, parent| {
            data.extend_from_slice(&self.data[parent..parent + row_len]);
        });
        let mut sub = Self::from_avec(AVec::from_iter(ALIGN, data), &extent);
        sub.spacing = self.spacing.clone();
        sub.offset = self.offset.iter().zip(start).map(|(o, s)| o + s).collect();
        Ok(sub)
    }

    /// Element-wise conversion keeping spacing and offset.
    pub fn map<U, F>(&self, f: F) -> Volume<U>
    where
        F: FnMut(&T) -> U,
    {
        Volume {
            data: AVec::from_iter(ALIGN, self.data.iter().map(f)),
            shape: self.shape.clone(),
            strides: self.strides.clone(),
            spacing: self.spacing.clone(),
            offset: self.offset.clone(),
        }
    }

    pub fn min_max(&self) -> Option<(T, T)>
    where
        T: PartialOrd + Copy,
    {
        let mut iter = self.data.iter();
        let first = *iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), v| {
            (
                if *v < lo { *v } else { lo },
                if *v > hi { *v } else { hi },
            )
        }))
    }
}

impl<T: PartialEq> PartialEq for Volume<T> {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.data[..] == other.data[..]
    }
}

impl<'a, T> Index<&'a [usize]> for Volume<T> {
    type Output = T;
    fn index(&self, coords: &'a [usize]) -> &Self::Output {
        &self.data[self.get_index(coords)]
    }
}
impl<'a, T> IndexMut<&'a [usize]> for Volume<T> {
    fn index_mut(&mut self, coords: &'a [usize]) -> &mut Self::Output {
        let idx = self.get_index(coords);
        &mut self.data[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::Volume;
    use crate::error::GraphCutError;

    #[test]
    fn volume_from_slice_shape_check() {
        assert!(Volume::from_slice(&[1, 2, 3, 4, 5, 6], &[2, 3]).is_ok());
        assert!(matches!(
            Volume::from_slice(&[1, 2, 3, 4, 5], &[2, 3]),
            Err(GraphCutError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn volume_index_is_c_ordered() {
        let vol = Volume::from_fn(&[2, 3, 4], |i| i).unwrap();
        assert_eq!(vol.strides(), &[12, 4, 1]);
        assert_eq!(vol[&[1, 2, 3][..]], 23);
        assert_eq!(vol.get_index(&[1, 0, 2]), 14);
        assert_eq!(vol.get_coords(14), vec![1, 0, 2]);
    }

    #[test]
    fn volume_axis_pairs() {
        let vol = Volume::from_fill(0u8, &[2, 3, 4]).unwrap();
        assert_eq!(vol.axis_pair_count(0), 12);
        assert_eq!(vol.axis_pair_count(1), 16);
        assert_eq!(vol.axis_pair_count(2), 18);
        for axis in 0..3 {
            let stride = vol.strides()[axis];
            let mut seen = std::collections::HashSet::new();
            for pair in 0..vol.axis_pair_count(axis) {
                let (p, q) = vol.axis_pair(axis, pair);
                assert_eq!(q - p, stride);
                let coords_p = vol.get_coords(p);
                let coords_q = vol.get_coords(q);
                assert_eq!(coords_p[axis] + 1, coords_q[axis]);
                assert!(seen.insert(p));
            }
        }
    }

    #[test]
    fn volume_subvolume_copy() {
        let vol = Volume::from_fn(&[4, 5], |i| i as i32)
            .unwrap()
            .with_spacing(&[2.0, 0.5])
            .unwrap();
        let sub = vol.subvolume(&[1, 2], &[3, 5]).unwrap();
        assert_eq!(sub.shape(), &[2, 3]);
        assert_eq!(sub.as_slice(), &[7, 8, 9, 12, 13, 14]);
        assert_eq!(sub.offset(), &[1, 2]);
        assert_eq!(sub.spacing(), &[2.0, 0.5]);
        let subsub = sub.subvolume(&[1, 1], &[2, 3]).unwrap();
        assert_eq!(subsub.as_slice(), &[13, 14]);
        assert_eq!(subsub.offset(), &[2, 3]);
        assert!(vol.subvolume(&[0, 0], &[5, 5]).is_err());
    }

    #[test]
    fn volume_spacing_validation() {
        let vol = Volume::from_fill(0f64, &[2, 2]).unwrap();
        assert!(vol.clone().with_spacing(&[1.0]).is_err());
        assert!(matches!(
            vol.with_spacing(&[1.0, 0.0]),
            Err(GraphCutError::InvalidCapacity { .. })
        ));
    }

    #[test]
    fn volume_min_max() {
        let vol = Volume::from_slice(&[3.0, -1.0, 7.5, 2.0], &[4]).unwrap();
        assert_eq!(vol.min_max(), Some((-1.0, 7.5)));
    }
}
