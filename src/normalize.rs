//! Metadata normalization: reader metadata plus configuration to canonical axes

use crate::config::ConvertConfig;
use crate::error::{ConvertError, Result};
use crate::types::{canonical_rank, Axis, AxisKind, DataType, CANONICAL_AXES};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Unit assumed when neither the input nor the configuration names one
pub const DEFAULT_UNIT: &str = "micrometer";

/// Metadata as a reader found it, in the reader's own axis order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Axis labels in source order
    pub axes: Vec<char>,
    /// Sample spacing per source axis, `None` where unknown or not spatial
    pub spacing: Vec<Option<f64>>,
    pub unit: Option<String>,
    pub channel_names: Vec<String>,
    /// Modality tag, e.g. `darkfield`
    pub modality: String,
    /// Modality-specific attributes carried into the store
    pub attributes: Map<String, Value>,
    /// Source axes that must not be downsampled
    pub unpooled: Vec<char>,
}

impl SourceMetadata {
    pub fn new(modality: impl Into<String>, axes: &str) -> Self {
        let axes: Vec<char> = axes.chars().collect();
        Self {
            spacing: vec![None; axes.len()],
            axes,
            modality: modality.into(),
            ..Default::default()
        }
    }

    /// Set the spacing of the source axis labelled `axis`
    pub fn with_spacing(mut self, axis: char, value: f64) -> Self {
        if let Some(i) = self.axes.iter().position(|&a| a == axis) {
            self.spacing[i] = Some(value);
        }
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_channel_names(mut self, names: Vec<String>) -> Self {
        self.channel_names = names;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn unpooled(mut self, axis: char) -> Self {
        self.unpooled.push(axis);
        self
    }
}

/// Axis semantics and physical scale of the volume as it will be stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMetadata {
    /// Axes in canonical `t, c, z, y, x` order
    pub axes: Vec<Axis>,
    /// Canonical axis `i` is source axis `permutation[i]`
    pub permutation: Vec<usize>,
    pub data_type: DataType,
    pub channel_names: Vec<String>,
    pub modality: String,
    pub attributes: Map<String, Value>,
}

impl CanonicalMetadata {
    pub fn shape(&self) -> Vec<usize> {
        self.axes.iter().map(|a| a.num_samples).collect()
    }

    pub fn pooled(&self) -> Vec<bool> {
        self.axes.iter().map(|a| a.pooled).collect()
    }

    pub fn axis_names(&self) -> String {
        self.axes.iter().map(|a| a.name).collect()
    }

    pub fn axis(&self, name: char) -> Option<&Axis> {
        self.axes.iter().find(|a| a.name == name)
    }

    /// Spacing of the spatial axes, in canonical order
    pub fn voxel_size(&self) -> Vec<f64> {
        self.axes
            .iter()
            .filter(|a| a.kind == AxisKind::Space)
            .map(|a| a.scale)
            .collect()
    }

    /// Whether the source axes are already in canonical order
    pub fn is_identity(&self) -> bool {
        self.permutation.iter().enumerate().all(|(i, &p)| i == p)
    }
}

/// Map a unit spelling to its OME name
pub fn ome_unit(unit: &str) -> Result<&'static str> {
    let normalized = unit.trim().to_lowercase();
    let name = match normalized.as_str() {
        "um" | "µm" | "μm" | "micron" | "microns" | "micrometer" | "micrometre"
        | "micrometers" | "micrometres" => "micrometer",
        "nm" | "nanometer" | "nanometre" | "nanometers" | "nanometres" => "nanometer",
        "mm" | "millimeter" | "millimetre" | "millimeters" | "millimetres" => "millimeter",
        "cm" | "centimeter" | "centimetre" | "centimeters" | "centimetres" => "centimeter",
        "m" | "meter" | "metre" | "meters" | "metres" => "meter",
        "pm" | "picometer" | "picometre" => "picometer",
        "a" | "å" | "angstrom" | "angstroms" => "angstrom",
        _ => {
            return Err(ConvertError::malformed(format!("unknown unit {:?}", unit)));
        }
    };
    Ok(name)
}

/// Abbreviated spelling of an OME unit name, as used in BIDS sidecars
pub fn short_unit(ome: &str) -> &str {
    match ome {
        "micrometer" => "um",
        "nanometer" => "nm",
        "millimeter" => "mm",
        "centimeter" => "cm",
        "meter" => "m",
        "picometer" => "pm",
        "angstrom" => "A",
        other => other,
    }
}

fn parse_axis_order(order: &str, ndim: usize) -> Result<Vec<char>> {
    let labels: Vec<char> = order
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if labels.len() != ndim {
        return Err(ConvertError::UnsupportedAxisConvention(format!(
            "axis order {:?} names {} axes but the input has {}",
            order,
            labels.len(),
            ndim
        )));
    }
    Ok(labels)
}

fn check_labels(labels: &[char]) -> Result<()> {
    let mut seen = HashSet::new();
    for &label in labels {
        if canonical_rank(label).is_none() {
            return Err(ConvertError::UnsupportedAxisConvention(format!(
                "unknown axis {:?}; expected a subset of {}",
                label,
                CANONICAL_AXES.iter().collect::<String>()
            )));
        }
        if !seen.insert(label) {
            return Err(ConvertError::UnsupportedAxisConvention(format!(
                "axis {:?} appears more than once",
                label
            )));
        }
    }
    Ok(())
}

/// Reconcile reader metadata and configuration into canonical metadata.
///
/// Pure and deterministic: the same inputs always give the same result.
pub fn normalize(
    shape: &[usize],
    data_type: DataType,
    source: &SourceMetadata,
    config: &ConvertConfig,
) -> Result<CanonicalMetadata> {
    let ndim = shape.len();
    let labels = match &config.axis_order {
        Some(order) => parse_axis_order(order, ndim)?,
        None => source.axes.clone(),
    };
    if labels.len() != ndim {
        return Err(ConvertError::UnsupportedAxisConvention(format!(
            "reader reported axes {:?} for a {}-d volume",
            labels, ndim
        )));
    }
    check_labels(&labels)?;

    let mut permutation: Vec<usize> = (0..ndim).collect();
    permutation.sort_by_key(|&i| canonical_rank(labels[i]));

    let unit = match config.unit.as_deref().or(source.unit.as_deref()) {
        Some(unit) => ome_unit(unit)?,
        None => DEFAULT_UNIT,
    };

    let spatial: Vec<usize> = permutation
        .iter()
        .copied()
        .filter(|&i| AxisKind::from_label(labels[i]) == Some(AxisKind::Space))
        .collect();

    let mut spacing: Vec<Option<f64>> = (0..ndim)
        .map(|i| source.spacing.get(i).copied().flatten())
        .collect();
    if let Some(voxel_size) = &config.voxel_size {
        let n = spatial.len();
        match voxel_size.len() {
            1 => spatial.iter().for_each(|&i| spacing[i] = Some(voxel_size[0])),
            len if len == n => {
                for (&i, &v) in spatial.iter().zip(voxel_size) {
                    spacing[i] = Some(v);
                }
            }
            // In-plane size only: the leading spatial axis keeps the source spacing
            len if n > 1 && len == n - 1 => {
                for (&i, &v) in spatial[1..].iter().zip(voxel_size) {
                    spacing[i] = Some(v);
                }
            }
            len => {
                return Err(ConvertError::InvalidConfig(format!(
                    "{} voxel size values for {} spatial axes",
                    len, n
                )));
            }
        }
    }

    let mut unpooled: HashSet<char> = source
        .unpooled
        .iter()
        .filter_map(|a| source.axes.iter().position(|s| s == a))
        .map(|i| labels[i])
        .collect();
    for &axis in &config.no_pool {
        if !labels.contains(&axis) {
            return Err(ConvertError::UnsupportedAxisConvention(format!(
                "cannot disable pooling on axis {:?}: the volume has axes {}",
                axis,
                labels.iter().collect::<String>()
            )));
        }
        unpooled.insert(axis);
    }

    let mut axes = Vec::with_capacity(ndim);
    for &i in &permutation {
        let label = labels[i];
        let axis = match AxisKind::from_label(label) {
            Some(AxisKind::Space) => {
                let scale = spacing[i].ok_or_else(|| {
                    ConvertError::MissingMetadata(format!(
                        "voxel size along {} is unknown; pass --voxel-size",
                        label
                    ))
                })?;
                if !scale.is_finite() || scale <= 0.0 {
                    return Err(ConvertError::malformed(format!(
                        "voxel size along {} must be positive, got {}",
                        label, scale
                    )));
                }
                let axis = Axis::space(label, shape[i], unit, scale);
                if unpooled.contains(&label) {
                    axis.unpooled()
                } else {
                    axis
                }
            }
            Some(AxisKind::Channel) => Axis::channel(shape[i]),
            Some(AxisKind::Time) => Axis {
                name: label,
                kind: AxisKind::Time,
                num_samples: shape[i],
                unit: None,
                scale: spacing[i].unwrap_or(1.0),
                pooled: false,
            },
            None => {
                return Err(ConvertError::UnsupportedAxisConvention(format!(
                    "unknown axis {:?}",
                    label
                )))
            }
        };
        axes.push(axis);
    }

    let channels = axes
        .iter()
        .find(|a| a.kind == AxisKind::Channel)
        .map_or(0, |a| a.num_samples);
    if !source.channel_names.is_empty() && source.channel_names.len() != channels {
        return Err(ConvertError::malformed(format!(
            "{} channel names for {} channels",
            source.channel_names.len(),
            channels
        )));
    }

    Ok(CanonicalMetadata {
        axes,
        permutation,
        data_type,
        channel_names: source.channel_names.clone(),
        modality: source.modality.clone(),
        attributes: source.attributes.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConvertConfig {
        ConvertConfig::default()
    }

    #[test]
    fn test_canonical_passthrough() {
        let source = SourceMetadata::new("lightsheet", "zyx")
            .with_spacing('z', 4.0)
            .with_spacing('y', 1.0)
            .with_spacing('x', 1.0)
            .with_unit("um");
        let meta = normalize(&[10, 20, 30], DataType::U16, &source, &config()).unwrap();
        assert_eq!(meta.axis_names(), "zyx");
        assert_eq!(meta.shape(), vec![10, 20, 30]);
        assert_eq!(meta.voxel_size(), vec![4.0, 1.0, 1.0]);
        assert!(meta.is_identity());
        assert_eq!(meta.axes[0].unit.as_deref(), Some("micrometer"));
    }

    #[test]
    fn test_axis_order_override_permutes() {
        let source = SourceMetadata::new("psoct", "zyx");
        let config = config()
            .with_axis_order("xyz")
            .with_voxel_size(vec![3.0, 2.0, 1.0]);
        let meta = normalize(&[30, 20, 10], DataType::F32, &source, &config).unwrap();
        assert_eq!(meta.axis_names(), "zyx");
        assert_eq!(meta.shape(), vec![10, 20, 30]);
        assert_eq!(meta.permutation, vec![2, 1, 0]);
        // Voxel size is given in canonical order
        assert_eq!(meta.voxel_size(), vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_bad_axis_orders() {
        let source = SourceMetadata::new("psoct", "zyx");
        for order in ["xyy", "xyq", "xy", "czyx"] {
            let config = config().with_axis_order(order).with_voxel_size(vec![1.0]);
            let err = normalize(&[3, 4, 5], DataType::U8, &source, &config).unwrap_err();
            assert!(
                matches!(err, ConvertError::UnsupportedAxisConvention(_)),
                "{}: {:?}",
                order,
                err
            );
        }
    }

    #[test]
    fn test_missing_voxel_size() {
        let source = SourceMetadata::new("darkfield", "zyx").with_spacing('z', 1.0);
        let err = normalize(&[3, 4, 5], DataType::U8, &source, &config()).unwrap_err();
        assert!(matches!(err, ConvertError::MissingMetadata(_)));
    }

    #[test]
    fn test_voxel_size_forms() {
        let source = SourceMetadata::new("darkfield", "czyx").unpooled('z');
        let iso = config().with_voxel_size(vec![0.5]);
        let meta = normalize(&[3, 2, 4, 5], DataType::U8, &source, &iso).unwrap();
        assert_eq!(meta.voxel_size(), vec![0.5, 0.5, 0.5]);
        assert!(!meta.axis('z').unwrap().pooled);
        assert!(!meta.axis('c').unwrap().pooled);
        assert!(meta.axis('y').unwrap().pooled);

        let in_plane = config().with_voxel_size(vec![0.25, 0.25]);
        let sectioned = source.clone().with_spacing('z', 40.0);
        let meta = normalize(&[3, 2, 4, 5], DataType::U8, &sectioned, &in_plane).unwrap();
        assert_eq!(meta.voxel_size(), vec![40.0, 0.25, 0.25]);
    }

    #[test]
    fn test_in_plane_voxel_size_needs_depth() {
        let source = SourceMetadata::new("psoct", "zyx");
        let in_plane = config().with_voxel_size(vec![0.25, 0.25]);
        let err = normalize(&[4, 4, 4], DataType::F32, &source, &in_plane).unwrap_err();
        match err {
            ConvertError::MissingMetadata(message) => assert!(message.contains('z'), "{}", message),
            other => panic!("expected missing metadata, got {:?}", other),
        }
    }

    #[test]
    fn test_units() {
        assert_eq!(ome_unit("µm").unwrap(), "micrometer");
        assert_eq!(ome_unit("Micron").unwrap(), "micrometer");
        assert_eq!(ome_unit("mm").unwrap(), "millimeter");
        assert_eq!(short_unit(ome_unit("microns").unwrap()), "um");
        assert!(matches!(
            ome_unit("furlong"),
            Err(ConvertError::MalformedInput(_))
        ));

        let source = SourceMetadata::new("x", "yx").with_unit("parsec");
        let config = config().with_voxel_size(vec![1.0]);
        assert!(normalize(&[2, 2], DataType::U8, &source, &config).is_err());
    }

    #[test]
    fn test_no_pool_and_channel_names() {
        let source = SourceMetadata::new("psoct", "czyx")
            .with_channel_names(vec!["dBI".into(), "R3D".into()]);
        let config = config().with_voxel_size(vec![1.0]).with_no_pool('x');
        let meta = normalize(&[2, 4, 4, 4], DataType::F32, &source, &config).unwrap();
        assert_eq!(meta.pooled(), vec![false, true, true, false]);
        assert_eq!(meta.channel_names, vec!["dBI", "R3D"]);

        let bad = ConvertConfig::default()
            .with_voxel_size(vec![1.0])
            .with_no_pool('t');
        assert!(matches!(
            normalize(&[2, 4, 4, 4], DataType::F32, &source, &bad),
            Err(ConvertError::UnsupportedAxisConvention(_))
        ));

        let wrong_names = SourceMetadata::new("psoct", "czyx").with_channel_names(vec!["a".into()]);
        assert!(normalize(&[2, 4, 4, 4], DataType::F32, &wrong_names, &config).is_err());
    }
}
