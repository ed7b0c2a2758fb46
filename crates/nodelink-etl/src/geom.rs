//! Geometry values
//!
//! A geometry is either a point or an ordered line of vertices, always
//! tagged with an explicit SRID. There is deliberately no way to build one
//! without naming its coordinate system; an unknown SRID is a construction
//! error, never a default.
//!
//! Geometries are shipped to the store as EWKT (`SRID=4326;POINT(...)`),
//! which both the COPY text protocol and `ST_GeomFromEWKT` accept. Rust's
//! default `f64` formatting is shortest-round-trip, so emission is lossless
//! to the source's precision.

use nodelink_common::{EtlError, Result};
use serde::{Deserialize, Serialize};

use crate::proj;

/// A single coordinate pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

impl Coord {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A point or ordered path, tagged with the SRID it is expressed in
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point { srid: i32, coord: Coord },
    LineString { srid: i32, coords: Vec<Coord> },
}

impl Geometry {
    /// Build a point in a known coordinate system
    pub fn point(srid: i32, x: f64, y: f64) -> Result<Self> {
        if !proj::is_supported(srid) {
            return Err(EtlError::UnknownSrid(srid));
        }
        Ok(Geometry::Point {
            srid,
            coord: Coord::new(x, y),
        })
    }

    /// Build an ordered path in a known coordinate system.
    /// A path needs at least two vertices.
    pub fn line_string(srid: i32, coords: Vec<Coord>) -> Result<Self> {
        if !proj::is_supported(srid) {
            return Err(EtlError::UnknownSrid(srid));
        }
        if coords.len() < 2 {
            return Err(EtlError::Config(format!(
                "line geometry needs at least 2 vertices, got {}",
                coords.len()
            )));
        }
        Ok(Geometry::LineString { srid, coords })
    }

    pub fn srid(&self) -> i32 {
        match self {
            Geometry::Point { srid, .. } | Geometry::LineString { srid, .. } => *srid,
        }
    }

    pub fn coords(&self) -> &[Coord] {
        match self {
            Geometry::Point { coord, .. } => std::slice::from_ref(coord),
            Geometry::LineString { coords, .. } => coords,
        }
    }

    /// All coordinates finite (reprojection of out-of-domain input can
    /// produce NaN/inf; such geometries must never reach the store)
    pub fn is_finite(&self) -> bool {
        self.coords()
            .iter()
            .all(|c| c.x.is_finite() && c.y.is_finite())
    }

    /// EWKT representation, e.g. `SRID=4326;POINT(126.97 37.56)`
    pub fn to_ewkt(&self) -> String {
        match self {
            Geometry::Point { srid, coord } => {
                format!("SRID={};POINT({} {})", srid, coord.x, coord.y)
            }
            Geometry::LineString { srid, coords } => {
                let body = coords
                    .iter()
                    .map(|c| format!("{} {}", c.x, c.y))
                    .collect::<Vec<_>>()
                    .join(",");
                format!("SRID={};LINESTRING({})", srid, body)
            }
        }
    }
}
