use geocluster::{ClusterIndex, GeoCoordinates, Options};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Shorthand for a test coordinate.
pub fn coords(lon: f64, lat: f64) -> GeoCoordinates {
    GeoCoordinates { lon, lat }
}

/// A reproducible spread of points across the inhabited latitudes.
pub fn world_cloud(count: usize, seed: u64) -> Vec<GeoCoordinates> {
    let mut rng = StdRng::seed_from_u64(seed);

    (0..count)
        .map(|_| GeoCoordinates {
            lon: rng.gen_range(-180.0..180.0),
            lat: rng.gen_range(-70.0..70.0),
        })
        .collect()
}

/// Build an index over `points` with the default configuration.
pub fn build_default(points: &[GeoCoordinates]) -> ClusterIndex {
    let mut index = ClusterIndex::new(Options::default()).expect("default options are valid");
    index.build(points).expect("build should succeed");
    index
}

/// Build an index that clusters on a single zoom level, which makes merge
/// scenarios easy to stage by hand.
pub fn build_single_level(points: &[GeoCoordinates]) -> ClusterIndex {
    let mut index = ClusterIndex::new(Options {
        min_zoom: 0,
        max_zoom: 0,
        ..Options::default()
    })
    .expect("options are valid");
    index.build(points).expect("build should succeed");
    index
}
