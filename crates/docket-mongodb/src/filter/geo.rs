//! Geospatial predicates

use bson::{doc, Bson, Document};
use docket_common::Result;

use crate::field::{FieldPath, FieldResolver};

/// Reference point of a `$near` / `$nearSphere` query
#[derive(Debug, Clone, PartialEq)]
pub enum NearPoint {
    /// Legacy coordinate pair, rendered as `[x, y]`
    Legacy { x: f64, y: f64 },
    /// GeoJSON point, rendered under `$geometry`
    GeoJson(Document),
}

/// Region for `$geoWithin`
#[derive(Debug, Clone, PartialEq)]
pub enum GeoShape {
    Geometry(Document),
    Box {
        lower_left: (f64, f64),
        upper_right: (f64, f64),
    },
    Center { x: f64, y: f64, radius: f64 },
    CenterSphere { x: f64, y: f64, radius: f64 },
    Polygon(Vec<(f64, f64)>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeoFilter {
    Near {
        field: FieldPath,
        point: NearPoint,
        spherical: bool,
        max_distance: Option<f64>,
        min_distance: Option<f64>,
    },
    Within { field: FieldPath, shape: GeoShape },
    Intersects { field: FieldPath, geometry: Document },
}

fn pair(x: f64, y: f64) -> Bson {
    Bson::Array(vec![Bson::Double(x), Bson::Double(y)])
}

impl GeoShape {
    fn render(&self) -> Document {
        match self {
            GeoShape::Geometry(geometry) => doc! { "$geometry": geometry.clone() },
            GeoShape::Box {
                lower_left,
                upper_right,
            } => doc! {
                "$box": [pair(lower_left.0, lower_left.1), pair(upper_right.0, upper_right.1)]
            },
            GeoShape::Center { x, y, radius } => doc! { "$center": [pair(*x, *y), *radius] },
            GeoShape::CenterSphere { x, y, radius } => {
                doc! { "$centerSphere": [pair(*x, *y), *radius] }
            }
            GeoShape::Polygon(points) => {
                let points: Vec<Bson> = points.iter().map(|(x, y)| pair(*x, *y)).collect();
                doc! { "$polygon": points }
            }
        }
    }
}

impl GeoFilter {
    pub(crate) fn render(&self, resolver: &dyn FieldResolver) -> Result<Document> {
        let (field, selector) = match self {
            GeoFilter::Near {
                field,
                point,
                spherical,
                max_distance,
                min_distance,
            } => {
                let operator = if *spherical { "$nearSphere" } else { "$near" };
                let selector = match point {
                    NearPoint::Legacy { x, y } => {
                        let mut selector = Document::new();
                        selector.insert(operator, pair(*x, *y));
                        push_distances(&mut selector, *max_distance, *min_distance);
                        selector
                    }
                    NearPoint::GeoJson(geometry) => {
                        let mut near = doc! { "$geometry": geometry.clone() };
                        push_distances(&mut near, *max_distance, *min_distance);
                        let mut selector = Document::new();
                        selector.insert(operator, near);
                        selector
                    }
                };
                (field, selector)
            }
            GeoFilter::Within { field, shape } => (field, doc! { "$geoWithin": shape.render() }),
            GeoFilter::Intersects { field, geometry } => (
                field,
                doc! { "$geoIntersects": { "$geometry": geometry.clone() } },
            ),
        };

        let resolved = resolver.resolve(field)?;
        let mut rendered = Document::new();
        rendered.insert(resolved.wire_name, selector);
        Ok(rendered)
    }
}

fn push_distances(target: &mut Document, max_distance: Option<f64>, min_distance: Option<f64>) {
    if let Some(max) = max_distance {
        target.insert("$maxDistance", max);
    }
    if let Some(min) = min_distance {
        target.insert("$minDistance", min);
    }
}

/// GeoJSON point document
pub fn point(x: f64, y: f64) -> Document {
    doc! { "type": "Point", "coordinates": [x, y] }
}

/// GeoJSON polygon with a single outer ring
pub fn polygon(ring: &[(f64, f64)]) -> Document {
    let ring: Vec<Bson> = ring.iter().map(|(x, y)| pair(*x, *y)).collect();
    doc! { "type": "Polygon", "coordinates": [ring] }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::schema::DocumentSchema;

    fn render(filter: Filter) -> Document {
        filter.render(&DocumentSchema::dynamic()).unwrap()
    }

    #[test]
    fn test_near_legacy_with_distances() {
        let rendered = render(Filter::near("loc", 1.0, 2.0, Some(10.0), Some(1.0)));
        assert_eq!(
            rendered,
            doc! { "loc": { "$near": [1.0, 2.0], "$maxDistance": 10.0, "$minDistance": 1.0 } }
        );
    }

    #[test]
    fn test_near_sphere_legacy_without_distances() {
        let rendered = render(Filter::near_sphere("loc", 1.0, 2.0, None, None));
        assert_eq!(rendered, doc! { "loc": { "$nearSphere": [1.0, 2.0] } });
    }

    #[test]
    fn test_near_geojson() {
        let rendered =
            render(Filter::near_geometry("loc", point(1.0, 2.0), false, Some(10.0), None));
        assert_eq!(
            rendered,
            doc! {
                "loc": {
                    "$near": {
                        "$geometry": { "type": "Point", "coordinates": [1.0, 2.0] },
                        "$maxDistance": 10.0
                    }
                }
            }
        );
    }

    #[test]
    fn test_geo_within_shapes() {
        assert_eq!(
            render(Filter::geo_within_box("loc", (0.0, 0.0), (5.0, 5.0))),
            doc! { "loc": { "$geoWithin": { "$box": [[0.0, 0.0], [5.0, 5.0]] } } }
        );
        assert_eq!(
            render(Filter::geo_within_center("loc", 1.0, 2.0, 3.0)),
            doc! { "loc": { "$geoWithin": { "$center": [[1.0, 2.0], 3.0] } } }
        );
        assert_eq!(
            render(Filter::geo_within_center_sphere("loc", 1.0, 2.0, 0.5)),
            doc! { "loc": { "$geoWithin": { "$centerSphere": [[1.0, 2.0], 0.5] } } }
        );
        assert_eq!(
            render(Filter::geo_within_polygon("loc", &[(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)])),
            doc! { "loc": { "$geoWithin": { "$polygon": [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]] } } }
        );
    }

    #[test]
    fn test_geo_intersects() {
        let shape = polygon(&[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 0.0)]);
        let rendered = render(Filter::geo_intersects("area", shape.clone()));
        assert_eq!(rendered, doc! { "area": { "$geoIntersects": { "$geometry": shape } } });
    }
}
