//! Utility functions

/// Integer division rounding up
pub fn ceil_div(value: usize, divisor: usize) -> usize {
    debug_assert!(divisor > 0);
    value.div_ceil(divisor)
}

/// Iterate every index of an n-dimensional grid in C order
pub fn grid_indices(shape: &[usize]) -> impl Iterator<Item = Vec<usize>> + Send + 'static {
    let shape = shape.to_vec();
    let total: usize = if shape.is_empty() {
        0
    } else {
        shape.iter().product()
    };
    (0..total).map(move |linear| unravel_index(linear, &shape))
}

/// Convert a C-order linear index into grid coordinates
pub fn unravel_index(mut linear: usize, shape: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; shape.len()];
    for (axis, coord) in coords.iter_mut().enumerate().rev() {
        *coord = linear % shape[axis];
        linear /= shape[axis];
    }
    coords
}

/// Convert grid coordinates into a C-order linear index
pub fn ravel_index(coords: &[usize], shape: &[usize]) -> usize {
    coords
        .iter()
        .zip(shape)
        .fold(0, |acc, (&c, &n)| acc * n + c)
}

/// Format byte size in human-readable form
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Format a shape as `A x B x C`
pub fn format_shape(shape: &[usize]) -> String {
    shape
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(" x ")
}
