//! Coordinate reprojection
//!
//! Supports the two coordinate systems the node-link network ships in:
//! EPSG:5179 (Korea 2000 / Unified CS, a Transverse Mercator projection on
//! the GRS80 ellipsoid) and EPSG:4326 (WGS 84 longitude/latitude, with the
//! GRS80/WGS84 ellipsoid difference far below the network's precision).
//!
//! The transform is a pure function of the input coordinates: same input,
//! same output, no tool defaults involved. The forward/inverse pair
//! round-trips well within 1e-6 degrees.
//!
//! Series expansions follow the standard USGS formulation for the
//! ellipsoidal Transverse Mercator (Snyder, "Map Projections: A Working
//! Manual", eqs. 8-9 through 8-25).

use nodelink_common::{EtlError, Result};

use crate::geom::{Coord, Geometry};

/// WGS 84 longitude/latitude
pub const WGS84: i32 = 4326;

/// Korea 2000 / Unified CS (Transverse Mercator, GRS80)
pub const KOREA_UNIFIED: i32 = 5179;

/// Whether this SRID has a registered transform
pub fn is_supported(srid: i32) -> bool {
    matches!(srid, WGS84 | KOREA_UNIFIED)
}

/// Reproject a geometry to the target SRID.
///
/// Identity when the geometry already carries the target SRID. Errors on
/// unregistered SRIDs; out-of-domain coordinates surface as non-finite
/// output, which the mapper rejects per record.
pub fn reproject(geometry: &Geometry, target_srid: i32) -> Result<Geometry> {
    let source_srid = geometry.srid();
    if !is_supported(target_srid) {
        return Err(EtlError::UnknownSrid(target_srid));
    }
    if source_srid == target_srid {
        return Ok(geometry.clone());
    }

    match geometry {
        Geometry::Point { coord, .. } => {
            let coord = transform(source_srid, target_srid, *coord)?;
            Ok(Geometry::Point {
                srid: target_srid,
                coord,
            })
        }
        Geometry::LineString { coords, .. } => {
            let coords = coords
                .iter()
                .map(|c| transform(source_srid, target_srid, *c))
                .collect::<Result<Vec<_>>>()?;
            Ok(Geometry::LineString {
                srid: target_srid,
                coords,
            })
        }
    }
}

fn transform(source_srid: i32, target_srid: i32, coord: Coord) -> Result<Coord> {
    match (source_srid, target_srid) {
        (KOREA_UNIFIED, WGS84) => {
            let (lon, lat) = KOREA_2000_UNIFIED.inverse(coord.x, coord.y);
            Ok(Coord::new(lon, lat))
        }
        (WGS84, KOREA_UNIFIED) => {
            let (easting, northing) = KOREA_2000_UNIFIED.forward(coord.x, coord.y);
            Ok(Coord::new(easting, northing))
        }
        (src, _) => Err(EtlError::UnknownSrid(src)),
    }
}

/// Transverse Mercator projection parameters on an ellipsoid
struct TransverseMercator {
    /// Semi-major axis (meters)
    a: f64,
    /// Flattening
    f: f64,
    /// Latitude of natural origin (degrees)
    lat0: f64,
    /// Longitude of natural origin (degrees)
    lon0: f64,
    /// Scale factor at the natural origin
    k0: f64,
    /// False easting (meters)
    false_easting: f64,
    /// False northing (meters)
    false_northing: f64,
}

/// EPSG:5179 definition: TM at 38N 127.5E, k0 = 0.9996, FE 1,000,000,
/// FN 2,000,000, GRS80 ellipsoid.
const KOREA_2000_UNIFIED: TransverseMercator = TransverseMercator {
    a: 6_378_137.0,
    f: 1.0 / 298.257_222_101,
    lat0: 38.0,
    lon0: 127.5,
    k0: 0.9996,
    false_easting: 1_000_000.0,
    false_northing: 2_000_000.0,
};

impl TransverseMercator {
    fn e2(&self) -> f64 {
        self.f * (2.0 - self.f)
    }

    fn ep2(&self) -> f64 {
        let e2 = self.e2();
        e2 / (1.0 - e2)
    }

    /// Meridional arc length from the equator to latitude `phi` (radians)
    fn meridional_arc(&self, phi: f64) -> f64 {
        let e2 = self.e2();
        let e4 = e2 * e2;
        let e6 = e4 * e2;
        self.a
            * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
                - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
                + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
                - (35.0 * e6 / 3072.0) * (6.0 * phi).sin())
    }

    /// Geographic (lon, lat in degrees) to projected (easting, northing)
    fn forward(&self, lon: f64, lat: f64) -> (f64, f64) {
        let phi = lat.to_radians();
        let lam = lon.to_radians();
        let lam0 = self.lon0.to_radians();
        let phi0 = self.lat0.to_radians();

        let e2 = self.e2();
        let ep2 = self.ep2();
        let sin_phi = phi.sin();
        let cos_phi = phi.cos();
        let tan_phi = phi.tan();

        let n = self.a / (1.0 - e2 * sin_phi * sin_phi).sqrt();
        let t = tan_phi * tan_phi;
        let c = ep2 * cos_phi * cos_phi;
        let a_term = (lam - lam0) * cos_phi;

        let m = self.meridional_arc(phi);
        let m0 = self.meridional_arc(phi0);

        let a2 = a_term * a_term;
        let a3 = a2 * a_term;
        let a4 = a3 * a_term;
        let a5 = a4 * a_term;
        let a6 = a5 * a_term;

        let easting = self.false_easting
            + self.k0
                * n
                * (a_term
                    + (1.0 - t + c) * a3 / 6.0
                    + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a5 / 120.0);
        let northing = self.false_northing
            + self.k0
                * (m - m0
                    + n * tan_phi
                        * (a2 / 2.0
                            + (5.0 - t + 9.0 * c + 4.0 * c * c) * a4 / 24.0
                            + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a6 / 720.0));

        (easting, northing)
    }

    /// Projected (easting, northing) to geographic (lon, lat in degrees)
    fn inverse(&self, easting: f64, northing: f64) -> (f64, f64) {
        let e2 = self.e2();
        let ep2 = self.ep2();
        let phi0 = self.lat0.to_radians();
        let lam0 = self.lon0.to_radians();

        let m0 = self.meridional_arc(phi0);
        let m = m0 + (northing - self.false_northing) / self.k0;

        let e4 = e2 * e2;
        let e6 = e4 * e2;
        let mu = m / (self.a * (1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0));

        let sqrt_1me2 = (1.0 - e2).sqrt();
        let e1 = (1.0 - sqrt_1me2) / (1.0 + sqrt_1me2);
        let e1_2 = e1 * e1;
        let e1_3 = e1_2 * e1;
        let e1_4 = e1_3 * e1;

        let phi1 = mu
            + (3.0 * e1 / 2.0 - 27.0 * e1_3 / 32.0) * (2.0 * mu).sin()
            + (21.0 * e1_2 / 16.0 - 55.0 * e1_4 / 32.0) * (4.0 * mu).sin()
            + (151.0 * e1_3 / 96.0) * (6.0 * mu).sin()
            + (1097.0 * e1_4 / 512.0) * (8.0 * mu).sin();

        let sin_phi1 = phi1.sin();
        let cos_phi1 = phi1.cos();
        let tan_phi1 = phi1.tan();

        let c1 = ep2 * cos_phi1 * cos_phi1;
        let t1 = tan_phi1 * tan_phi1;
        let n1 = self.a / (1.0 - e2 * sin_phi1 * sin_phi1).sqrt();
        let r1 = self.a * (1.0 - e2) / (1.0 - e2 * sin_phi1 * sin_phi1).powf(1.5);
        let d = (easting - self.false_easting) / (n1 * self.k0);

        let d2 = d * d;
        let d3 = d2 * d;
        let d4 = d3 * d;
        let d5 = d4 * d;
        let d6 = d5 * d;

        let phi = phi1
            - (n1 * tan_phi1 / r1)
                * (d2 / 2.0
                    - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d4 / 24.0
                    + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1
                        - 252.0 * ep2
                        - 3.0 * c1 * c1)
                        * d6
                        / 720.0);
        let lam = lam0
            + (d - (1.0 + 2.0 * t1 + c1) * d3 / 6.0
                + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1)
                    * d5
                    / 120.0)
                / cos_phi1;

        (lam.to_degrees(), phi.to_degrees())
    }
}
