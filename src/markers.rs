use crate::arrays::Volume;
use crate::common::MarkerCodes;
use crate::error::{GraphCutError, GraphCutResult};

/// Splits an integer-coded marker volume into the foreground and the background markers.
pub fn split_markers(markers: &Volume<i32>, codes: MarkerCodes) -> (Volume<bool>, Volume<bool>) {
    (
        markers.map(|m| *m == codes.foreground),
        markers.map(|m| *m == codes.background),
    )
}

/// Encodes two marker volumes into one. Unmarked voxels get 0.
///
/// Fails with `ShapeMismatch` for different shapes and with `InvalidLabeling` if a voxel is in
/// both volumes, such a volume can not be encoded.
pub fn encode_markers(
    foreground: &Volume<bool>,
    background: &Volume<bool>,
    codes: MarkerCodes,
) -> GraphCutResult<Volume<i32>> {
    foreground.check_shape(background)?;
    let data = foreground
        .as_slice()
        .iter()
        .zip(background.as_slice())
        .enumerate()
        .map(|(i, (fg, bg))| match (fg, bg) {
            (true, true) => Err(GraphCutError::InvalidLabeling(format!(
                "voxel {:?} is marked as both foreground and background",
                foreground.get_coords(i)
            ))),
            (true, false) => Ok(codes.foreground),
            (false, true) => Ok(codes.background),
            (false, false) => Ok(0),
        })
        .collect::<GraphCutResult<Vec<i32>>>()?;
    Volume::from_vec(data, foreground.shape())?.with_spacing(foreground.spacing())
}
