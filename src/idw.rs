//! Inverse-distance-weighted interpolation of point scores onto polygons.
//!
//! The NI and Wales variants only have scores at GP surgery locations, so
//! the surface in between is estimated with a k-nearest-neighbour regressor
//! weighted by `1/distance^p`, predicted over a regular grid covering the
//! points, then averaged within each target polygon (zonal means).

use crate::{ArcStr, Result};
use anyhow::{bail, ensure, Context};
use geo::{BoundingRect, Contains, Geometry, MultiPolygon, Point};
use noisy_float::prelude::*;
use qu::ick_use::*;
use rand::{seq::SliceRandom, SeedableRng};
use rayon::prelude::*;
use std::{fs, path::Path};

/// A known location with a composite score, in British National Grid
/// easting/northing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredPoint {
    pub easting: f64,
    pub northing: f64,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdwParams {
    pub neighbours: usize,
    pub power: f64,
}

/// Baseline parameters the grid search must beat.
pub const DEFAULT_PARAMS: IdwParams = IdwParams {
    neighbours: 5,
    power: 2.0,
};

/// Weight used for a neighbour at exactly zero distance. Large enough to
/// dominate any realistic `1/d^p` term, so a query on a training point
/// returns (essentially) that point's value instead of a NaN.
const ZERO_DISTANCE_WEIGHT: f64 = 1e12;

/// Grid cell size in BNG metres.
pub const CELL_SIZE: f64 = 250.0;

/// Candidate neighbour counts; kept low since the point sets are small.
const NEIGHBOUR_CANDIDATES: [usize; 4] = [2, 3, 4, 5];
const POWER_CANDIDATES: [f64; 4] = [0.5, 1.0, 1.5, 2.0];

const CV_FOLDS: usize = 5;
const SHUFFLE_SEED: u64 = 42;

/// A fitted IDW regressor. "Fitting" just checks and borrows the training
/// points; all work happens at prediction time.
#[derive(Debug, Clone)]
pub struct IdwModel<'a> {
    params: IdwParams,
    points: &'a [ScoredPoint],
}

impl<'a> IdwModel<'a> {
    pub fn fit(params: IdwParams, points: &'a [ScoredPoint]) -> Result<Self> {
        ensure!(params.neighbours > 0, "need at least one neighbour");
        ensure!(!points.is_empty(), "cannot fit IDW model to zero points");
        Ok(IdwModel { params, points })
    }

    pub fn predict(&self, easting: f64, northing: f64) -> f64 {
        let mut nearest: Vec<(R64, f64)> = self
            .points
            .iter()
            .map(|p| {
                let dx = p.easting - easting;
                let dy = p.northing - northing;
                (r64((dx * dx + dy * dy).sqrt()), p.value)
            })
            .collect();
        let k = self.params.neighbours.min(nearest.len());
        nearest.select_nth_unstable_by_key(k - 1, |&(distance, _)| distance);
        nearest.truncate(k);

        let mut weight_sum = 0.0;
        let mut value_sum = 0.0;
        for (distance, value) in nearest {
            let d = distance.raw();
            let weight = if d == 0.0 {
                ZERO_DISTANCE_WEIGHT
            } else {
                1.0 / d.powf(self.params.power)
            };
            weight_sum += weight;
            value_sum += weight * value;
        }
        value_sum / weight_sum
    }
}

fn mean_squared_error(model: &IdwModel, test: &[ScoredPoint]) -> f64 {
    let sum: f64 = test
        .iter()
        .map(|p| {
            let err = model.predict(p.easting, p.northing) - p.value;
            err * err
        })
        .sum();
    sum / test.len() as f64
}

/// Mean held-out MSE over k folds of `train` for one parameter candidate.
fn cross_validate(params: IdwParams, train: &[ScoredPoint], folds: usize) -> Result<f64> {
    let mut total = 0.0;
    for fold in 0..folds {
        let held_out: Vec<ScoredPoint> = train
            .iter()
            .enumerate()
            .filter(|(i, _)| i % folds == fold)
            .map(|(_, p)| *p)
            .collect();
        let rest: Vec<ScoredPoint> = train
            .iter()
            .enumerate()
            .filter(|(i, _)| i % folds != fold)
            .map(|(_, p)| *p)
            .collect();
        if held_out.is_empty() || rest.is_empty() {
            continue;
        }
        let model = IdwModel::fit(params, &rest)?;
        total += mean_squared_error(&model, &held_out);
    }
    Ok(total / folds as f64)
}

/// Pick `k` and `p` by cross-validated grid search on a seeded 80/20 split,
/// logging how the winner compares with [`DEFAULT_PARAMS`] on the held-out
/// test points. Falls back to the defaults when there are too few points to
/// split meaningfully.
pub fn select_params(points: &[ScoredPoint]) -> Result<IdwParams> {
    if points.len() < 2 * CV_FOLDS {
        event!(
            Level::WARN,
            "only {} points; skipping grid search and using default parameters",
            points.len()
        );
        return Ok(DEFAULT_PARAMS);
    }

    let mut shuffled: Vec<ScoredPoint> = points.to_vec();
    let mut rng = rand::rngs::StdRng::seed_from_u64(SHUFFLE_SEED);
    shuffled.shuffle(&mut rng);
    let test_len = (shuffled.len() / 5).max(1);
    let (test, train) = shuffled.split_at(test_len);

    let mut best: Option<(R64, IdwParams)> = None;
    for &neighbours in &NEIGHBOUR_CANDIDATES {
        for &power in &POWER_CANDIDATES {
            let params = IdwParams { neighbours, power };
            let mse = r64(cross_validate(params, train, CV_FOLDS)?);
            // strict less-than keeps the first candidate on ties
            if best.map_or(true, |(best_mse, _)| mse < best_mse) {
                best = Some((mse, params));
            }
        }
    }
    // candidate lists are non-empty
    let (_, best_params) = best.unwrap();

    let best_model = IdwModel::fit(best_params, train)?;
    let default_model = IdwModel::fit(DEFAULT_PARAMS, train)?;
    event!(
        Level::INFO,
        "grid search chose k={} p={}; held-out MSE {:.6} (default k={} p={}: {:.6})",
        best_params.neighbours,
        best_params.power,
        mean_squared_error(&best_model, test),
        DEFAULT_PARAMS.neighbours,
        DEFAULT_PARAMS.power,
        mean_squared_error(&default_model, test),
    );
    Ok(best_params)
}

/// A regular grid of prediction nodes covering the bounding box of the
/// input points, with the bounds pushed out to multiples of the cell size
/// so nodes line up with the grid origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid {
    pub xmin: f64,
    pub ymin: f64,
    pub cellsize: f64,
    pub cols: usize,
    pub rows: usize,
}

impl Grid {
    pub fn covering(points: &[ScoredPoint], cellsize: f64) -> Result<Self> {
        ensure!(!points.is_empty(), "cannot grid zero points");
        ensure!(cellsize > 0.0, "cell size must be positive");
        let mut xmin = f64::INFINITY;
        let mut xmax = f64::NEG_INFINITY;
        let mut ymin = f64::INFINITY;
        let mut ymax = f64::NEG_INFINITY;
        for p in points {
            xmin = xmin.min(p.easting);
            xmax = xmax.max(p.easting);
            ymin = ymin.min(p.northing);
            ymax = ymax.max(p.northing);
        }
        let xmin = (xmin / cellsize).floor() * cellsize;
        let xmax = (xmax / cellsize).ceil() * cellsize;
        let ymin = (ymin / cellsize).floor() * cellsize;
        let ymax = (ymax / cellsize).ceil() * cellsize;
        Ok(Grid {
            xmin,
            ymin,
            cellsize,
            cols: ((xmax - xmin) / cellsize).round() as usize + 1,
            rows: ((ymax - ymin) / cellsize).round() as usize + 1,
        })
    }

    pub fn len(&self) -> usize {
        self.cols * self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn x(&self, col: usize) -> f64 {
        self.xmin + col as f64 * self.cellsize
    }

    pub fn y(&self, row: usize) -> f64 {
        self.ymin + row as f64 * self.cellsize
    }
}

/// Grid node predictions, row-major from the south-west corner.
#[derive(Debug, Clone)]
pub struct Surface {
    pub grid: Grid,
    pub values: Vec<f64>,
}

pub fn predict_surface(model: &IdwModel, grid: Grid) -> Surface {
    let values: Vec<f64> = (0..grid.len())
        .into_par_iter()
        .map(|idx| {
            let row = idx / grid.cols;
            let col = idx % grid.cols;
            model.predict(grid.x(col), grid.y(row))
        })
        .collect();
    Surface { grid, values }
}

/// Target polygons, keyed by area code, read from a GeoJSON feature
/// collection (e.g. the SDZ or LSOA boundary files).
#[derive(Debug, Clone)]
pub struct Boundaries {
    areas: Vec<(ArcStr, MultiPolygon<f64>)>,
}

impl Boundaries {
    pub fn load(path: impl AsRef<Path>, code_property: &str) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("opening boundaries \"{}\"", path.display()))?;
        Self::from_geojson(&contents, code_property)
            .with_context(|| format!("while reading \"{}\"", path.display()))
    }

    pub fn from_geojson(contents: &str, code_property: &str) -> Result<Self> {
        let geojson: geojson::GeoJson = contents.parse()?;
        let collection = match geojson {
            geojson::GeoJson::FeatureCollection(fc) => fc,
            _ => bail!("boundary file is not a feature collection"),
        };

        let mut areas = Vec::with_capacity(collection.features.len());
        for feature in collection.features {
            let code = match feature
                .properties
                .as_ref()
                .and_then(|props| props.get(code_property))
            {
                Some(serde_json::Value::String(code)) => ArcStr::from(code.as_str()),
                _ => bail!("feature without a \"{}\" property", code_property),
            };
            let geometry = feature
                .geometry
                .with_context(|| format!("feature \"{}\" has no geometry", code))?;
            let geometry = Geometry::<f64>::try_from(geometry.value)
                .with_context(|| format!("feature \"{}\" has invalid geometry", code))?;
            let polygons = match geometry {
                Geometry::Polygon(p) => MultiPolygon(vec![p]),
                Geometry::MultiPolygon(mp) => mp,
                _ => bail!("feature \"{}\" is not a polygon", code),
            };
            areas.push((code, polygons));
        }
        ensure!(!areas.is_empty(), "boundary file has no features");
        Ok(Boundaries { areas })
    }

    pub fn from_areas(areas: impl IntoIterator<Item = (ArcStr, MultiPolygon<f64>)>) -> Self {
        Boundaries {
            areas: areas.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ArcStr, MultiPolygon<f64>)> {
        self.areas.iter()
    }
}

/// Mean of the grid nodes inside each polygon. A polygon covering no nodes
/// gets a missing score (typically one with no GP postcode inside it).
pub fn zonal_means(surface: &Surface, boundaries: &Boundaries) -> Vec<(ArcStr, Option<f64>)> {
    let grid = &surface.grid;
    boundaries
        .areas
        .par_iter()
        .map(|(code, polygons)| {
            let rect = match polygons.bounding_rect() {
                Some(r) => r,
                None => return (code.clone(), None),
            };
            let col_lo = (((rect.min().x - grid.xmin) / grid.cellsize).floor()).max(0.0) as usize;
            let row_lo = (((rect.min().y - grid.ymin) / grid.cellsize).floor()).max(0.0) as usize;
            let col_hi =
                ((((rect.max().x - grid.xmin) / grid.cellsize).ceil()).max(0.0) as usize + 1)
                    .min(grid.cols);
            let row_hi =
                ((((rect.max().y - grid.ymin) / grid.cellsize).ceil()).max(0.0) as usize + 1)
                    .min(grid.rows);

            let mut sum = 0.0;
            let mut count = 0usize;
            for row in row_lo..row_hi {
                for col in col_lo..col_hi {
                    let point = Point::new(grid.x(col), grid.y(row));
                    if polygons.contains(&point) {
                        sum += surface.values[row * grid.cols + col];
                        count += 1;
                    }
                }
            }
            let mean = if count == 0 {
                None
            } else {
                Some(sum / count as f64)
            };
            (code.clone(), mean)
        })
        .collect()
}

/// The whole NI/Wales spatial stage: parameter search, surface prediction
/// and zonal averaging.
pub fn interpolate_to_areas(
    points: &[ScoredPoint],
    boundaries: &Boundaries,
    cellsize: f64,
) -> Result<Vec<(ArcStr, Option<f64>)>> {
    let params = select_params(points)?;
    let model = IdwModel::fit(params, points)?;
    let grid = Grid::covering(points, cellsize)?;
    event!(
        Level::INFO,
        "predicting {}x{} grid ({} nodes) at {}m spacing",
        grid.cols,
        grid.rows,
        grid.len(),
        cellsize
    );
    let surface = predict_surface(&model, grid);
    let means = zonal_means(&surface, boundaries);
    let scored = means.iter().filter(|(_, m)| m.is_some()).count();
    event!(
        Level::INFO,
        "zonal averaging scored {} of {} areas",
        scored,
        means.len()
    );
    Ok(means)
}
