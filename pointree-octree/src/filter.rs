//! Composable spatial and attribute filters over octree nodes.
//!
//! Filters are plain values. They are stored as JSON objects whose `Type` tag names the variant,
//! e.g. `{"Type": "FilterInsideSphere3d", "Sphere": {"Center": [0, 0, 0], "Radius": 1}}`.

use std::{collections::BTreeSet, ops::RangeInclusive};

use glam::{DVec3, Vec3};
use itertools::Itertools;
use pointree_lib::{
    bounds::Box3,
    geometry::{Hull3, Sphere3},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Error, Result},
    node::PointCloudNode,
};

/// A predicate selecting points of octree nodes.
///
/// Besides testing single points, every filter can decide for whole bounding boxes whether they are
/// fully inside or fully outside, which allows skipping entire subtrees.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum Filter {
    #[serde(rename = "FilterInsideBox3d")]
    InsideBox {
        #[serde(rename = "Box")]
        bounds: Box3,
    },
    #[serde(rename = "FilterOutsideBox3d")]
    OutsideBox {
        #[serde(rename = "Box")]
        bounds: Box3,
    },
    #[serde(rename = "FilterInsideSphere3d")]
    InsideSphere {
        #[serde(rename = "Sphere")]
        sphere: Sphere3,
    },
    #[serde(rename = "FilterInsideConvexHull3d")]
    InsideConvexHull {
        #[serde(rename = "Array")]
        hull: Hull3,
    },
    /// Keeps points with an intensity within `min..=max`.
    #[serde(rename = "FilterIntensity")]
    Intensity {
        #[serde(rename = "Min")]
        min: i32,
        #[serde(rename = "Max")]
        max: i32,
    },
    /// Keeps points of any of the listed classes.
    #[serde(rename = "FilterClassification")]
    Classification {
        #[serde(rename = "Filter")]
        classes: BTreeSet<u8>,
    },
    /// Keeps points whose normal deviates at most `max_angle_degrees` from `direction`.
    #[serde(rename = "FilterNormalDirection")]
    NormalDirection {
        #[serde(rename = "Direction")]
        direction: Vec3,
        #[serde(rename = "EpsInDegrees")]
        max_angle_degrees: f32,
    },
    #[serde(rename = "FilterAnd")]
    And {
        #[serde(rename = "Left")]
        left: Box<Filter>,
        #[serde(rename = "Right")]
        right: Box<Filter>,
    },
    #[serde(rename = "FilterOr")]
    Or {
        #[serde(rename = "Left")]
        left: Box<Filter>,
        #[serde(rename = "Right")]
        right: Box<Filter>,
    },
}

impl Filter {
    /// The `Type` tags of all known filters.
    pub const TYPES: [&'static str; 9] = [
        "FilterInsideBox3d",
        "FilterOutsideBox3d",
        "FilterInsideSphere3d",
        "FilterInsideConvexHull3d",
        "FilterIntensity",
        "FilterClassification",
        "FilterNormalDirection",
        "FilterAnd",
        "FilterOr",
    ];

    pub fn inside_box(bounds: Box3) -> Self {
        Self::InsideBox { bounds }
    }

    pub fn outside_box(bounds: Box3) -> Self {
        Self::OutsideBox { bounds }
    }

    pub fn inside_sphere(sphere: Sphere3) -> Self {
        Self::InsideSphere { sphere }
    }

    pub fn inside_convex_hull(hull: Hull3) -> Self {
        Self::InsideConvexHull { hull }
    }

    pub fn intensity(range: RangeInclusive<i32>) -> Self {
        Self::Intensity {
            min: *range.start(),
            max: *range.end(),
        }
    }

    pub fn classification(classes: impl IntoIterator<Item = u8>) -> Self {
        Self::Classification {
            classes: classes.into_iter().collect(),
        }
    }

    pub fn normal_direction(direction: Vec3, max_angle_degrees: f32) -> Self {
        Self::NormalDirection {
            direction,
            max_angle_degrees,
        }
    }

    pub fn and(left: Self, right: Self) -> Self {
        Self::And {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn or(left: Self, right: Self) -> Self {
        Self::Or {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// The `Type` tag this filter is stored with.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::InsideBox { .. } => Self::TYPES[0],
            Self::OutsideBox { .. } => Self::TYPES[1],
            Self::InsideSphere { .. } => Self::TYPES[2],
            Self::InsideConvexHull { .. } => Self::TYPES[3],
            Self::Intensity { .. } => Self::TYPES[4],
            Self::Classification { .. } => Self::TYPES[5],
            Self::NormalDirection { .. } => Self::TYPES[6],
            Self::And { .. } => Self::TYPES[7],
            Self::Or { .. } => Self::TYPES[8],
        }
    }

    /// Whether the filter only looks at positions.
    pub fn is_spatial(&self) -> bool {
        match self {
            Self::InsideBox { .. }
            | Self::OutsideBox { .. }
            | Self::InsideSphere { .. }
            | Self::InsideConvexHull { .. } => true,
            Self::Intensity { .. } | Self::Classification { .. } | Self::NormalDirection { .. } => {
                false
            }
            Self::And { left, right } | Self::Or { left, right } => {
                left.is_spatial() && right.is_spatial()
            }
        }
    }

    /// Whether every point within `bounds` passes the filter.
    ///
    /// Attribute filters never know this without looking at the points.
    pub fn is_fully_inside(&self, bounds: Box3) -> bool {
        match self {
            Self::InsideBox { bounds: filter } => filter.encloses(bounds),
            Self::OutsideBox { bounds: filter } => !filter.intersects(bounds),
            Self::InsideSphere { sphere } => sphere.encloses(bounds),
            Self::InsideConvexHull { hull } => hull.encloses(bounds),
            Self::Intensity { .. } | Self::Classification { .. } | Self::NormalDirection { .. } => {
                false
            }
            Self::And { left, right } => left.is_fully_inside(bounds) && right.is_fully_inside(bounds),
            Self::Or { left, right } => left.is_fully_inside(bounds) || right.is_fully_inside(bounds),
        }
    }

    /// Whether no point within `bounds` passes the filter.
    ///
    /// Attribute filters never know this without looking at the points.
    pub fn is_fully_outside(&self, bounds: Box3) -> bool {
        match self {
            Self::InsideBox { bounds: filter } => !filter.intersects(bounds),
            Self::OutsideBox { bounds: filter } => filter.encloses(bounds),
            Self::InsideSphere { sphere } => !sphere.intersects(bounds),
            Self::InsideConvexHull { hull } => !hull.intersects(bounds),
            Self::Intensity { .. } | Self::Classification { .. } | Self::NormalDirection { .. } => {
                false
            }
            Self::And { left, right } => {
                left.is_fully_outside(bounds) || right.is_fully_outside(bounds)
            }
            Self::Or { left, right } => {
                left.is_fully_outside(bounds) && right.is_fully_outside(bounds)
            }
        }
    }

    /// Shrinks `bounds` to the part that can hold points passing the filter.
    pub fn clip(&self, bounds: Box3) -> Box3 {
        match self {
            Self::InsideBox { bounds: filter } => filter.intersection(bounds),
            Self::InsideSphere { sphere } => sphere.bounds().intersection(bounds),
            Self::InsideConvexHull { hull } => hull.intersection_bounds(bounds),
            Self::OutsideBox { .. }
            | Self::Intensity { .. }
            | Self::Classification { .. }
            | Self::NormalDirection { .. } => bounds,
            Self::And { left, right } => left.clip(right.clip(bounds)),
            Self::Or { left, right } => left.clip(bounds).union(right.clip(bounds)),
        }
    }

    /// Returns the ascending indices of the points of `node` that pass the filter.
    ///
    /// Only the indices in `selected` are considered if given, which must be ascending as well.
    /// Nodes lacking the attribute an attribute filter looks at have no passing points.
    pub fn filter_points<N>(&self, node: &N, selected: Option<&[usize]>) -> Vec<usize>
    where
        N: PointCloudNode + ?Sized,
    {
        let count = node.point_count_cell();
        let candidates = || candidates(selected, count);
        let retain_positions = |contains: &dyn Fn(DVec3) -> bool| -> Vec<usize> {
            let positions = node.global_positions();
            candidates().filter(|&i| contains(positions[i])).collect()
        };

        match self {
            Self::InsideBox { bounds } => retain_positions(&|p| bounds.contains(p)),
            Self::OutsideBox { bounds } => retain_positions(&|p| !bounds.contains(p)),
            Self::InsideSphere { sphere } => retain_positions(&|p| sphere.contains(p)),
            Self::InsideConvexHull { hull } => retain_positions(&|p| hull.contains(p)),
            Self::Intensity { min, max } => match node.intensities() {
                Some(intensities) => candidates()
                    .filter(|&i| (*min..=*max).contains(&intensities[i]))
                    .collect(),
                None => Vec::new(),
            },
            Self::Classification { classes } => match node.classifications() {
                Some(classifications) => candidates()
                    .filter(|&i| classes.contains(&classifications[i]))
                    .collect(),
                None => Vec::new(),
            },
            Self::NormalDirection {
                direction,
                max_angle_degrees,
            } => match node.normals() {
                Some(normals) => {
                    let direction = direction.normalize_or_zero();
                    let min_cos = max_angle_degrees.to_radians().cos();
                    candidates()
                        .filter(|&i| normals[i].normalize_or_zero().dot(direction) >= min_cos)
                        .collect()
                }
                None => Vec::new(),
            },
            Self::And { left, right } => {
                let left = left.filter_points(node, selected);
                right.filter_points(node, Some(&left))
            }
            Self::Or { left, right } => left
                .filter_points(node, selected)
                .into_iter()
                .merge(right.filter_points(node, selected))
                .dedup()
                .collect(),
        }
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Reads a filter from its JSON representation.
    ///
    /// Fails with [`Error::UnknownFilterType`] if any (nested) `Type` tag is not known.
    pub fn from_json(json: &Value) -> Result<Self> {
        check_types(json)?;
        Ok(Self::deserialize(json)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Self::from_json(&serde_json::from_str(json)?)
    }
}

fn candidates(selected: Option<&[usize]>, count: usize) -> Box<dyn Iterator<Item = usize> + '_> {
    match selected {
        Some(selected) => Box::new(selected.iter().copied()),
        None => Box::new(0..count),
    }
}

/// Rejects unknown `Type` tags before handing the JSON to serde, which would only report them as
/// generic syntax errors.
fn check_types(json: &Value) -> Result<()> {
    let Some(tag) = json.get("Type").and_then(Value::as_str) else {
        return Ok(());
    };
    if !Filter::TYPES.contains(&tag) {
        return Err(Error::UnknownFilterType(tag.to_owned()));
    }
    for operand in ["Left", "Right"] {
        if let Some(operand) = json.get(operand) {
            check_types(operand)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pointree_lib::{cell::Cell, geometry::Plane3};
    use serde_json::json;

    use super::*;
    use crate::{
        batch::{BatchParts, PointBatch},
        node::OctreeNode,
    };

    fn unit_box() -> Box3 {
        Box3::new(DVec3::ZERO, DVec3::ONE)
    }

    fn node() -> OctreeNode {
        let positions = (0..8).map(|i| DVec3::splat(i as f64 + 0.5)).collect();
        let points = PointBatch::new(
            BatchParts::new(positions)
                .intensities((0..8).map(|i| i * 10).collect())
                .classifications(vec![1, 2, 1, 2, 3, 3, 1, 2])
                .normals(vec![
                    Vec3::Z,
                    Vec3::X,
                    Vec3::new(0.0, 0.1, 1.0),
                    Vec3::NEG_Z,
                    Vec3::Z,
                    Vec3::Y,
                    Vec3::new(1.0, 0.0, 1.0),
                    Vec3::Z,
                ]),
        )
        .unwrap();
        OctreeNode::leaf(Cell::new(0, 0, 0, 3), points).unwrap()
    }

    #[test]
    fn box_tests() {
        let inside = Filter::inside_box(Box3::new(DVec3::splat(-1.0), DVec3::splat(2.0)));
        let outside = Filter::outside_box(Box3::new(DVec3::splat(-1.0), DVec3::splat(2.0)));
        let far = Box3::new(DVec3::splat(5.0), DVec3::splat(6.0));
        let straddling = Box3::new(DVec3::splat(1.0), DVec3::splat(3.0));

        assert!(inside.is_fully_inside(unit_box()));
        assert!(inside.is_fully_outside(far));
        assert!(!inside.is_fully_inside(straddling) && !inside.is_fully_outside(straddling));

        assert!(outside.is_fully_outside(unit_box()));
        assert!(outside.is_fully_inside(far));
        assert!(!outside.is_fully_inside(straddling) && !outside.is_fully_outside(straddling));
    }

    #[test]
    fn attribute_filters_never_decide_by_bounds() {
        for filter in [
            Filter::intensity(0..=10),
            Filter::classification([1]),
            Filter::normal_direction(Vec3::Z, 10.0),
        ] {
            assert!(!filter.is_spatial());
            assert!(!filter.is_fully_inside(unit_box()));
            assert!(!filter.is_fully_outside(unit_box()));
            assert_eq!(filter.clip(unit_box()), unit_box());
        }
    }

    #[test]
    fn combinators_decide_by_bounds() {
        let a = Filter::inside_box(Box3::new(DVec3::ZERO, DVec3::splat(2.0)));
        let b = Filter::inside_sphere(Sphere3::new(DVec3::splat(10.0), 1.0));
        let and = Filter::and(a.clone(), b.clone());
        let or = Filter::or(a.clone(), b.clone());

        assert!(and.is_fully_outside(unit_box()));
        assert!(!and.is_fully_inside(unit_box()));
        assert!(or.is_fully_inside(unit_box()));
        assert!(!or.is_fully_outside(unit_box()));

        let nowhere = Box3::new(DVec3::splat(4.0), DVec3::splat(5.0));
        assert!(or.is_fully_outside(nowhere));
        assert!(and.is_spatial());
        assert!(!Filter::and(a, Filter::intensity(0..=1)).is_spatial());
    }

    #[test]
    fn spatial_points() {
        let node = node();
        let sphere = Filter::inside_sphere(Sphere3::new(DVec3::splat(2.5), 1.8));
        assert_eq!(sphere.filter_points(&node, None), [1, 2, 3]);
        assert_eq!(sphere.filter_points(&node, Some(&[0, 2, 3])), [2, 3]);

        let hull = Filter::inside_convex_hull(Hull3::from_box(Box3::new(
            DVec3::splat(4.0),
            DVec3::splat(8.0),
        )));
        assert_eq!(hull.filter_points(&node, None), [4, 5, 6, 7]);

        let outside = Filter::outside_box(Box3::new(DVec3::ZERO, DVec3::splat(6.0)));
        assert_eq!(outside.filter_points(&node, None), [6, 7]);
    }

    #[test]
    fn attribute_points() {
        let node = node();
        assert_eq!(
            Filter::intensity(15..=40).filter_points(&node, None),
            [2, 3, 4]
        );
        assert_eq!(
            Filter::classification([2, 3]).filter_points(&node, None),
            [1, 3, 4, 5, 7]
        );
        assert_eq!(
            Filter::normal_direction(Vec3::new(0.0, 0.0, 2.0), 10.0).filter_points(&node, None),
            [0, 2, 4, 7]
        );
        assert_eq!(
            Filter::normal_direction(Vec3::Z, 45.5).filter_points(&node, Some(&[5, 6, 7])),
            [6, 7]
        );
    }

    #[test]
    fn missing_attributes_select_nothing() {
        let node = OctreeNode::leaf(
            Cell::new(0, 0, 0, 0),
            PointBatch::from_positions(vec![DVec3::splat(0.5)]),
        )
        .unwrap();
        assert!(Filter::intensity(i32::MIN..=i32::MAX)
            .filter_points(&node, None)
            .is_empty());
        assert!(Filter::classification(0..=255)
            .filter_points(&node, None)
            .is_empty());
        assert!(Filter::normal_direction(Vec3::Z, 180.0)
            .filter_points(&node, None)
            .is_empty());
    }

    #[test]
    fn combined_points() {
        let node = node();
        let low = Filter::intensity(0..=30);
        let class_one = Filter::classification([1]);
        assert_eq!(
            Filter::and(low.clone(), class_one.clone()).filter_points(&node, None),
            [0, 2]
        );
        assert_eq!(
            Filter::or(low, class_one).filter_points(&node, None),
            [0, 1, 2, 3, 6]
        );
    }

    #[test]
    fn clipping() {
        let sphere = Filter::inside_sphere(Sphere3::new(DVec3::ZERO, 0.5));
        assert_eq!(
            sphere.clip(unit_box()),
            Box3::new(DVec3::ZERO, DVec3::splat(0.5))
        );
        let inside = Filter::inside_box(Box3::new(DVec3::splat(0.25), DVec3::splat(4.0)));
        let or = Filter::or(sphere.clone(), inside.clone());
        assert_eq!(or.clip(unit_box()), unit_box());
        let and = Filter::and(sphere, inside);
        assert_eq!(
            and.clip(unit_box()),
            Box3::new(DVec3::splat(0.25), DVec3::splat(0.5))
        );
    }

    #[test]
    fn json_layout() {
        let filter = Filter::and(
            Filter::inside_convex_hull(Hull3::new(vec![Plane3::new(DVec3::X, DVec3::ZERO)])),
            Filter::intensity(1..=2),
        );
        let json = filter.to_json().unwrap();
        assert_eq!(
            json,
            json!({
                "Type": "FilterAnd",
                "Left": {
                    "Type": "FilterInsideConvexHull3d",
                    "Array": [{ "Normal": [1.0, 0.0, 0.0], "Point": [0.0, 0.0, 0.0] }],
                },
                "Right": { "Type": "FilterIntensity", "Min": 1, "Max": 2 },
            })
        );
        assert_eq!(Filter::from_json(&json).unwrap(), filter);

        let text = Filter::classification([4, 2]).to_json_string().unwrap();
        assert_eq!(text, r#"{"Type":"FilterClassification","Filter":[2,4]}"#);
    }

    #[test]
    fn every_variant_reads_back() {
        let filters = [
            Filter::inside_box(unit_box()),
            Filter::outside_box(unit_box()),
            Filter::inside_sphere(Sphere3::new(DVec3::ONE, 2.0)),
            Filter::normal_direction(Vec3::Y, 12.5),
            Filter::or(Filter::classification([]), Filter::intensity(-5..=5)),
        ];
        for filter in filters {
            let text = filter.to_json_string().unwrap();
            assert!(text.contains(filter.type_name()));
            assert_eq!(Filter::from_json_str(&text).unwrap(), filter);
        }
    }

    #[test]
    fn unknown_types_are_reported() {
        let error = Filter::from_json(&json!({ "Type": "FilterBogus" })).unwrap_err();
        assert!(matches!(error, Error::UnknownFilterType(tag) if tag == "FilterBogus"));

        let nested = json!({
            "Type": "FilterOr",
            "Left": { "Type": "FilterIntensity", "Min": 0, "Max": 1 },
            "Right": { "Type": "FilterTeapot" },
        });
        let error = Filter::from_json(&nested).unwrap_err();
        assert!(matches!(error, Error::UnknownFilterType(tag) if tag == "FilterTeapot"));

        let error = Filter::from_json_str(r#"{"Min": 0}"#).unwrap_err();
        assert!(matches!(error, Error::Json(_)));
    }
}
