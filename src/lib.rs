#![forbid(unsafe_code)]

//! Fast hierarchical geospatial point clustering for interactive maps.
//!
//! Given a batch of longitude/latitude points, [`ClusterIndex::build`]
//! precomputes one spatial index per zoom level, merging nearby points into
//! weighted cluster markers with a greedy single-pass sweep from the deepest
//! zoom up to the shallowest. A map frontend can then ask for the markers of
//! a viewport ([`ClusterIndex::get_clusters`]) or a slippy-map tile
//! ([`ClusterIndex::get_tile`]) and always receive a small, visually
//! non-overlapping set of clusters and individual points.
//!
//! The index is batch-built and read-only afterwards; concurrent queries on
//! a built index are safe.
//!
//! ```
//! use geocluster::{ClusterIndex, GeoCoordinates, Options};
//!
//! let points = vec![
//!     GeoCoordinates { lon: 13.38, lat: 52.52 },
//!     GeoCoordinates { lon: 13.40, lat: 52.51 },
//!     GeoCoordinates { lon: 2.35, lat: 48.86 },
//! ];
//!
//! let mut index = ClusterIndex::new(Options::default())?;
//! index.build(&points)?;
//!
//! let markers = index.all_clusters(3);
//! assert_eq!(markers.iter().map(|m| m.num_points).sum::<usize>(), 3);
//! # Ok::<(), geocluster::ClusterError>(())
//! ```

mod kdtree;

use kdtree::KDTree;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Zoom marker for a node that no aggregate has consumed yet.
///
/// Real zoom levels stop at [`MAX_SUPPORTED_ZOOM`]; this sentinel is far
/// outside that range.
pub const INFINITE_ZOOM: u8 = 100;

/// Deepest zoom level the engine clusters on; `max_zoom` is clamped to it.
pub const MAX_SUPPORTED_ZOOM: u8 = 21;

/// A WGS84 position on the Earth, in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoCoordinates {
    /// Longitude, nominally in `[-180, 180]`.
    pub lon: f64,

    /// Latitude, nominally in `[-90, 90]`.
    pub lat: f64,
}

/// Anything that can be clustered.
///
/// The engine never copies or stores the implementing value; it remembers
/// inputs by their position in the slice passed to [`ClusterIndex::build`],
/// which becomes the `id` of the resulting singleton node.
pub trait GeoPoint {
    /// Position of the point on the Earth.
    fn coordinates(&self) -> GeoCoordinates;
}

impl GeoPoint for GeoCoordinates {
    fn coordinates(&self) -> GeoCoordinates {
        *self
    }
}

/// Clustering configuration.
///
/// `point_size` and `tile_size` together define the clustering radius at
/// zoom `z`: `point_size / (tile_size * 2^z)` in projected units.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Options {
    /// Shallowest zoom level to generate clusters for.
    pub min_zoom: u8,

    /// Deepest zoom level to generate clusters for, clamped to
    /// [`MAX_SUPPORTED_ZOOM`].
    pub max_zoom: u8,

    /// Pixel footprint of a marker; affects the clustering radius.
    pub point_size: f64,

    /// Pixel size of a map tile; affects the clustering radius and the
    /// pixel coordinates produced by [`ClusterIndex::get_tile`].
    pub tile_size: f64,

    /// Leaf size of the per-level KD-trees. Affects performance only.
    pub node_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            min_zoom: 0,
            max_zoom: 16,
            point_size: 40.0,
            tile_size: 512.0,
            node_size: 64,
        }
    }
}

/// A node of the cluster pyramid: either an original input point
/// (`num_points == 1`) or an aggregate of several (`num_points >= 2`).
///
/// Inside the pyramid `x`/`y` are unit-square Mercator coordinates. Query
/// methods return copies with `x`/`y` rewritten: longitude/latitude for
/// [`ClusterIndex::get_clusters`], [`ClusterIndex::all_clusters`] and
/// [`ClusterIndex::get_tile_latlon`], tile-relative pixels for
/// [`ClusterIndex::get_tile`].
///
/// `zoom` is the shallowest zoom at which the node was consumed into an
/// aggregate, or [`INFINITE_ZOOM`] if it never was. Singleton ids equal the
/// input position; cluster ids are assigned from a disjoint range starting
/// at the smallest power of ten not below the input count.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterPoint {
    pub x: f64,
    pub y: f64,
    pub zoom: u8,
    pub id: usize,
    pub num_points: usize,
}

impl ClusterPoint {
    /// Whether this node aggregates more than one input point.
    pub fn is_cluster(&self) -> bool {
        self.num_points > 1
    }
}

/// Errors reported by [`ClusterIndex::new`] and [`ClusterIndex::build`].
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("min_zoom ({min_zoom}) must not exceed max_zoom ({max_zoom})")]
    ZoomRangeInvalid { min_zoom: u8, max_zoom: u8 },

    #[error("point_size ({point_size}) and tile_size ({tile_size}) must be positive")]
    SizeInvalid { point_size: f64, tile_size: f64 },

    #[error("point {index} has non-finite coordinates ({lon}, {lat})")]
    NonFiniteCoordinates { index: usize, lon: f64, lat: f64 },
}

/// Hook for carrying user payloads through the clustering process.
///
/// The engine owns all geometry: positions, weights, ids and zoom markers
/// are computed before the hook runs and cannot be altered by it. A
/// customizer typically keeps its payloads on the side, keyed by node id;
/// singleton and cluster ids never collide, so one map suffices.
pub trait Customizer<P: GeoPoint> {
    /// Called once per input point when its singleton node is created.
    fn init(&mut self, point: &P, node: &ClusterPoint);

    /// Called when `seed` absorbs `members` into the new `cluster` node
    /// during the pass over zoom level `zoom`.
    fn aggregate(
        &mut self,
        cluster: &ClusterPoint,
        seed: &ClusterPoint,
        members: &[ClusterPoint],
        zoom: u8,
    );
}

/// The no-op customizer used by [`ClusterIndex::build`].
impl<P: GeoPoint> Customizer<P> for () {
    fn init(&mut self, _point: &P, _node: &ClusterPoint) {}

    fn aggregate(
        &mut self,
        _cluster: &ClusterPoint,
        _seed: &ClusterPoint,
        _members: &[ClusterPoint],
        _zoom: u8,
    ) {
    }
}

/// One zoom level of the pyramid: its node array and the KD-tree over it.
#[derive(Clone, Debug, Default)]
struct Level {
    index: KDTree,
    nodes: Vec<ClusterPoint>,
}

/// A multi-level cluster pyramid over a batch of points.
///
/// Create with [`ClusterIndex::new`], populate with
/// [`ClusterIndex::build`], then query. Queries on an index that has not
/// been built yet return empty results.
#[derive(Clone, Debug)]
pub struct ClusterIndex {
    options: Options,

    /// One entry per zoom; slots `min_zoom..=max_zoom + 1` are populated by
    /// `build`, with `max_zoom + 1` holding the original projected points.
    levels: Vec<Level>,
}

impl ClusterIndex {
    /// Validate `options` and create an empty index.
    ///
    /// `max_zoom` is clamped to [`MAX_SUPPORTED_ZOOM`] before validation.
    ///
    /// # Errors
    ///
    /// [`ClusterError::ZoomRangeInvalid`] if `min_zoom > max_zoom` after
    /// clamping, [`ClusterError::SizeInvalid`] if `point_size` or
    /// `tile_size` is not strictly positive.
    pub fn new(mut options: Options) -> Result<Self, ClusterError> {
        options.max_zoom = options.max_zoom.min(MAX_SUPPORTED_ZOOM);

        if options.min_zoom > options.max_zoom {
            return Err(ClusterError::ZoomRangeInvalid {
                min_zoom: options.min_zoom,
                max_zoom: options.max_zoom,
            });
        }
        if !(options.point_size > 0.0) || !(options.tile_size > 0.0) {
            return Err(ClusterError::SizeInvalid {
                point_size: options.point_size,
                tile_size: options.tile_size,
            });
        }

        Ok(ClusterIndex {
            options,
            levels: Vec::new(),
        })
    }

    /// The validated configuration, with `max_zoom` already clamped.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Cluster `points` into one index per zoom level.
    ///
    /// Equivalent to [`ClusterIndex::build_with`] with a no-op customizer.
    pub fn build<P: GeoPoint>(&mut self, points: &[P]) -> Result<(), ClusterError> {
        self.build_with(points, &mut ())
    }

    /// Cluster `points` into one index per zoom level, invoking `customizer`
    /// for every singleton and every aggregate node created.
    ///
    /// Points are projected in input order; the sweep that merges each level
    /// into the next follows that order, so the resulting pyramid (node
    /// positions, ids and node order alike) is deterministic for a given
    /// input sequence. Rebuilding replaces any previous pyramid; on error
    /// the previous pyramid is left untouched.
    ///
    /// # Errors
    ///
    /// [`ClusterError::NonFiniteCoordinates`] if any input has a NaN or
    /// infinite longitude or latitude.
    pub fn build_with<P, C>(&mut self, points: &[P], customizer: &mut C) -> Result<(), ClusterError>
    where
        P: GeoPoint,
        C: Customizer<P>,
    {
        let min_zoom = self.options.min_zoom;
        let max_zoom = self.options.max_zoom;

        let mut nodes = Vec::with_capacity(points.len());
        for (i, point) in points.iter().enumerate() {
            let GeoCoordinates { lon, lat } = point.coordinates();
            if !lon.is_finite() || !lat.is_finite() {
                return Err(ClusterError::NonFiniteCoordinates { index: i, lon, lat });
            }

            let (x, y) = project(GeoCoordinates { lon, lat });
            let node = ClusterPoint {
                x,
                y,
                zoom: INFINITE_ZOOM,
                id: i,
                num_points: 1,
            };
            customizer.init(point, &node);
            nodes.push(node);
        }

        debug!(
            "clustering {} points over zoom levels {}..={}",
            nodes.len(),
            min_zoom,
            max_zoom
        );

        let mut next_cluster_id = cluster_id_seed(nodes.len());
        let mut levels = vec![Level::default(); max_zoom as usize + 2];

        // Cluster the deepest level first, then cluster those results, and
        // so on up to min_zoom. The tree for level z + 1 and the sweep both
        // walk the same node array, so zoom markers written by the sweep
        // block re-visits within the same pass.
        for z in (min_zoom..=max_zoom).rev() {
            let index = KDTree::build(nodes.iter().map(|n| (n.x, n.y)), self.options.node_size);
            let radius = self.options.point_size / (self.options.tile_size * 2f64.powi(z as i32));

            let next =
                merge_level::<P, C>(&index, &mut nodes, z, radius, &mut next_cluster_id, customizer);
            trace!("zoom {}: {} -> {} nodes", z, nodes.len(), next.len());

            levels[z as usize + 1] = Level { index, nodes };
            nodes = next;
        }

        levels[min_zoom as usize] = Level {
            index: KDTree::build(nodes.iter().map(|n| (n.x, n.y)), self.options.node_size),
            nodes,
        };

        self.levels = levels;
        Ok(())
    }

    /// Markers inside a viewport at the given zoom, in longitude/latitude.
    ///
    /// The corner convention follows the projected rectangle: the engine
    /// queries `range(se.x, se.y, nw.x, nw.y)`, so callers must pass corners
    /// whose projections satisfy `se_x <= nw_x` and `se_y <= nw_y` (i.e.
    /// `south_east` carries the westernmost longitude and northernmost
    /// latitude of the viewport). Corners that violate this yield an empty
    /// result rather than an error.
    pub fn get_clusters(
        &self,
        north_west: GeoCoordinates,
        south_east: GeoCoordinates,
        zoom: u8,
    ) -> Vec<ClusterPoint> {
        let Some(level) = self.level(zoom) else {
            return Vec::new();
        };

        let (nw_x, nw_y) = project(north_west);
        let (se_x, se_y) = project(south_east);

        level
            .index
            .range(se_x, se_y, nw_x, nw_y)
            .into_iter()
            .map(|i| unprojected(level.nodes[i]))
            .collect()
    }

    /// Every marker present at the given zoom, in longitude/latitude.
    pub fn all_clusters(&self, zoom: u8) -> Vec<ClusterPoint> {
        let Some(level) = self.level(zoom) else {
            return Vec::new();
        };

        level.nodes.iter().copied().map(unprojected).collect()
    }

    /// Markers of tile `(x, y)` at zoom `z`, in tile-relative pixels.
    ///
    /// The tile box is padded by `point_size / tile_size` on every side so
    /// markers whose icons straddle the tile edge are included. Tiles on
    /// the antimeridian (`x == 0` and `x == 2^z - 1`) additionally pick up
    /// nearby markers from the opposite edge of the world, offset by one
    /// full world width so they render in the right place.
    ///
    /// Pixel coordinates are rounded half away from zero. The `zoom` field
    /// of returned nodes is always 0 and carries no meaning. `z` beyond the
    /// configured range is served by the nearest existing level; `x`/`y`
    /// outside `[0, 2^z)` produce an empty result.
    pub fn get_tile(&self, x: u32, y: u32, z: u8) -> Vec<ClusterPoint> {
        let Some(level) = self.level(z) else {
            return Vec::new();
        };

        let z2 = 2f64.powi(i32::from(z));
        let xf = f64::from(x);
        let yf = f64::from(y);
        let (direct, before, after) = self.tile_ids(level, x, y, z);

        let mut tile = Vec::new();
        self.render_pixels(level, direct, xf, yf, z2, &mut tile);
        self.render_pixels(level, before, xf + z2, yf, z2, &mut tile);
        self.render_pixels(level, after, xf - z2, yf, z2, &mut tile);

        tile
    }

    /// Markers of tile `(x, y)` at zoom `z`, in longitude/latitude.
    ///
    /// Runs the same padded tile query as [`ClusterIndex::get_tile`],
    /// including the antimeridian branches, but returns canonical
    /// coordinates instead of offset pixels.
    pub fn get_tile_latlon(&self, x: u32, y: u32, z: u8) -> Vec<ClusterPoint> {
        let Some(level) = self.level(z) else {
            return Vec::new();
        };

        let (direct, before, after) = self.tile_ids(level, x, y, z);

        direct
            .into_iter()
            .chain(before)
            .chain(after)
            .map(|i| unprojected(level.nodes[i]))
            .collect()
    }

    /// Node indices for a padded tile query: those inside the tile box,
    /// plus the two antimeridian bands when the tile touches a world edge.
    fn tile_ids(
        &self,
        level: &Level,
        x: u32,
        y: u32,
        z: u8,
    ) -> (Vec<usize>, Vec<usize>, Vec<usize>) {
        let z2 = 2f64.powi(i32::from(z));
        let p = self.options.point_size / self.options.tile_size;
        let xf = f64::from(x);
        let yf = f64::from(y);
        let min_y = (yf - p) / z2;
        let max_y = (yf + 1.0 + p) / z2;

        let direct = level
            .index
            .range((xf - p) / z2, min_y, (xf + 1.0 + p) / z2, max_y);

        let before = if xf == 0.0 {
            level.index.range((1.0 - p) / z2, min_y, 1.0, max_y)
        } else {
            Vec::new()
        };

        let after = if xf == z2 - 1.0 {
            level.index.range(0.0, min_y, p / z2, max_y)
        } else {
            Vec::new()
        };

        (direct, before, after)
    }

    /// Convert the nodes at `ids` to pixels relative to the effective tile
    /// `tile_x` (which includes the world-width offset for wrapped bands).
    fn render_pixels(
        &self,
        level: &Level,
        ids: Vec<usize>,
        tile_x: f64,
        tile_y: f64,
        z2: f64,
        out: &mut Vec<ClusterPoint>,
    ) {
        let extent = self.options.tile_size;

        for i in ids {
            let mut node = level.nodes[i];
            node.x = (extent * (node.x * z2 - tile_x)).round();
            node.y = (extent * (node.y * z2 - tile_y)).round();
            node.zoom = 0;
            out.push(node);
        }
    }

    /// The level serving queries for `zoom`, or `None` before `build`.
    fn level(&self, zoom: u8) -> Option<&Level> {
        self.levels.get(self.limit_zoom(zoom))
    }

    /// Clamp a requested zoom into the range of existing levels. Queries
    /// above `max_zoom` are served by the unclustered original points.
    fn limit_zoom(&self, zoom: u8) -> usize {
        zoom.max(self.options.min_zoom).min(self.options.max_zoom + 1) as usize
    }
}

/// Sweep one level in its natural order, merging every unvisited node with
/// its unvisited neighbours into a weighted centroid. Returns the node
/// array of the next (shallower) level.
///
/// `index` was built over `nodes`, so neighbour indices point into the same
/// array the sweep is marking; a node consumed by an earlier iteration of
/// this pass is skipped by the zoom-marker check.
fn merge_level<P, C>(
    index: &KDTree,
    nodes: &mut [ClusterPoint],
    zoom: u8,
    radius: f64,
    next_cluster_id: &mut usize,
    customizer: &mut C,
) -> Vec<ClusterPoint>
where
    P: GeoPoint,
    C: Customizer<P>,
{
    let mut next = Vec::new();
    let mut members = Vec::new();

    for i in 0..nodes.len() {
        if nodes[i].zoom <= zoom {
            continue;
        }
        nodes[i].zoom = zoom;
        let seed = nodes[i];

        let neighbours = index.within(seed.x, seed.y, radius);

        let mut wx = seed.x * seed.num_points as f64;
        let mut wy = seed.y * seed.num_points as f64;
        let mut count = seed.num_points;

        members.clear();
        for j in neighbours {
            let q = &mut nodes[j];

            // Skips the seed itself and anything consumed earlier this pass.
            if q.zoom <= zoom {
                continue;
            }
            q.zoom = zoom;

            wx += q.x * q.num_points as f64;
            wy += q.y * q.num_points as f64;
            count += q.num_points;
            members.push(*q);
        }

        if members.is_empty() {
            next.push(seed);
            continue;
        }

        let cluster = ClusterPoint {
            x: wx / count as f64,
            y: wy / count as f64,
            zoom: INFINITE_ZOOM,
            id: *next_cluster_id,
            num_points: count,
        };
        *next_cluster_id += 1;

        customizer.aggregate(&cluster, &seed, &members, zoom);
        next.push(cluster);
    }

    next
}

/// Smallest power of ten not below `n`, used as the first cluster id so
/// that singleton ids `[0, n)` and cluster ids can never collide.
fn cluster_id_seed(n: usize) -> usize {
    let mut seed = 1;
    while seed < n {
        seed *= 10;
    }
    seed
}

/// Copy of `node` with its position converted back to longitude/latitude.
fn unprojected(mut node: ClusterPoint) -> ClusterPoint {
    let GeoCoordinates { lon, lat } = unproject(node.x, node.y);
    node.x = lon;
    node.y = lat;
    node
}

/// Project WGS84 coordinates onto the unit-square spherical Mercator plane.
///
/// `y` is clamped to `[0, 1]` so the poles stay finite. `x` is deliberately
/// left unclamped: longitudes outside `[-180, 180]` map outside `[0, 1]`.
pub fn project(coordinates: GeoCoordinates) -> (f64, f64) {
    let x = coordinates.lon / 360.0 + 0.5;

    let sin = (coordinates.lat * PI / 180.0).sin();
    let y = 0.5 - 0.25 * ((1.0 + sin) / (1.0 - sin)).ln() / PI;

    (x, y.clamp(0.0, 1.0))
}

/// Inverse of [`project`] for latitudes strictly between the poles.
pub fn unproject(x: f64, y: f64) -> GeoCoordinates {
    let lon = (x - 0.5) * 360.0;
    let lat = 360.0 * ((180.0 - y * 360.0) * PI / 180.0).exp().atan() / PI - 90.0;

    GeoCoordinates { lon, lat }
}
