//! End-to-end runs over synthetic tiles with ~1 m pixels near the equator.

use chrono::{TimeZone, Utc};
use geo::Area;
use lotmap::{
    AffineTransform, FeatureCollection, LotError, Pipeline, PipelineConfig, SizeCategory, Tile,
    TileInput,
};

const LON0: f64 = 10.0;
const LAT0: f64 = 0.002;
const ON: f32 = 0.9;
const OFF: f32 = 0.05;

/// North-up transform whose pixels are 1 m × 1 m at the tile centre, with
/// pixel column 0 of the tile sitting at global column `col0`.
fn metre_transform(col0: usize, height: usize) -> AffineTransform {
    let e = 1.0 / 110_574.0;
    let lat_c = LAT0 - height as f64 / 2.0 * e;
    let a = 1.0 / (111_320.0 * lat_c.to_radians().cos());
    AffineTransform::north_up(LON0 + col0 as f64 * a, LAT0, a, e)
}

/// `lots` are `[x0, y0, x1, y1)` rectangles in global pixel columns/rows.
fn tile_input(
    id: &str,
    col0: usize,
    width: usize,
    height: usize,
    lots: &[(usize, usize, usize, usize)],
) -> TileInput {
    let rows = (0..height)
        .map(|y| {
            (0..width)
                .map(|x| {
                    let gx = col0 + x;
                    let hit = lots
                        .iter()
                        .any(|&(x0, y0, x1, y1)| (x0..x1).contains(&gx) && (y0..y1).contains(&y));
                    if hit {
                        ON
                    } else {
                        OFF
                    }
                })
                .collect()
        })
        .collect();
    TileInput {
        tile: Tile {
            tile_id: id.to_string(),
            pixel_width: width,
            pixel_height: height,
            affine_transform: metre_transform(col0, height),
            crs: "EPSG:4326".to_string(),
            captured_at: None,
        },
        probability_raster: rows,
    }
}

fn pipeline() -> Pipeline {
    Pipeline::new(PipelineConfig::default()).unwrap()
}

fn split_lot_tiles() -> Vec<TileInput> {
    // Tiles overlap in global columns 69..71; the lot spans 20..120.
    let lot = [(20, 10, 120, 70)];
    vec![
        tile_input("west", 0, 71, 80, &lot),
        tile_input("east", 69, 71, 80, &lot),
    ]
}

#[test]
fn test_full_tile_is_one_large_lot() {
    let input = tile_input("full", 0, 100, 100, &[(0, 0, 100, 100)]);
    let out = pipeline().run(vec![input]);
    assert_eq!(out.collection.features.len(), 1);
    let p = &out.collection.features[0].properties;
    assert!((p.area_m2 - 10_000.0).abs() < 1.0, "area {}", p.area_m2);
    assert_eq!(p.num_spots, 333);
    assert_eq!(p.size_category, SizeCategory::Large);
    assert_eq!(p.lot_id, 0);
    assert!((p.confidence - ON as f64).abs() < 1e-6);
}

#[test]
fn test_speck_yields_nothing() {
    let mut input = tile_input("speck", 0, 50, 50, &[]);
    for (x, y) in [(25, 24), (24, 25), (25, 25), (26, 25), (25, 26)] {
        input.probability_raster[y][x] = ON;
    }
    let out = pipeline().run(vec![input]);
    assert!(out.collection.features.is_empty());
    assert_eq!(out.stats.tiles_processed, 1);
    assert_eq!(out.stats.polygons_extracted, 0);
}

#[test]
fn test_lot_split_across_tiles_merges() {
    let out = pipeline().run(split_lot_tiles());
    assert_eq!(out.stats.polygons_extracted, 2);
    assert_eq!(out.collection.features.len(), 1);
    assert_eq!(out.stats.merge.merged_groups, 1);
    assert_eq!(out.stats.merge.degraded_groups, 0);
    let p = &out.collection.features[0].properties;
    assert!((p.area_m2 - 6_000.0).abs() < 6.0, "area {}", p.area_m2);
    assert_eq!(p.num_spots, 200);
}

#[test]
fn test_distant_lots_stay_separate() {
    // Both lots sit in the wide overlap, so each is seen by both tiles.
    let lots = [(120, 10, 160, 50), (620, 10, 660, 50)];
    let inputs = vec![
        tile_input("west", 0, 700, 80, &lots),
        tile_input("east", 100, 700, 80, &lots),
    ];
    let out = pipeline().run(inputs);
    assert_eq!(out.stats.polygons_extracted, 4);
    assert_eq!(out.collection.features.len(), 2);
    assert_eq!(out.stats.merge.merged_groups, 2);
    let f = &out.collection.features;
    assert!(f[0].properties.center_lon < f[1].properties.center_lon);
    for feature in f {
        assert!((feature.properties.area_m2 - 1_600.0).abs() < 1.6);
    }
}

#[test]
fn test_rerun_is_byte_identical() {
    let a = pipeline().run(split_lot_tiles()).collection.to_json().unwrap();
    let b = pipeline().run(split_lot_tiles()).collection.to_json().unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_export_reimport_area() {
    let lots = [(5, 5, 45, 35), (60, 20, 90, 70)];
    let out = pipeline().run(vec![tile_input("t", 0, 100, 80, &lots)]);
    let json = out.collection.to_json().unwrap();
    let back = FeatureCollection::from_json(&json).unwrap();
    assert_eq!(back, out.collection);

    for f in &back.features {
        let deg2 = f.polygon().unwrap().unsigned_area();
        let lat = f.properties.center_lat.to_radians();
        let m2 = deg2 * 111_320.0 * lat.cos() * 110_574.0;
        let rel = (m2 - f.properties.area_m2).abs() / f.properties.area_m2;
        assert!(rel < 1e-3, "relative area error {rel}");
    }
}

#[test]
fn test_hole_survives_to_geojson() {
    let mut input = tile_input("ring", 0, 60, 60, &[(10, 10, 50, 50)]);
    for row in input.probability_raster.iter_mut().take(35).skip(25) {
        for v in row.iter_mut().take(35).skip(25) {
            *v = OFF;
        }
    }
    let out = pipeline().run(vec![input]);
    assert_eq!(out.collection.features.len(), 1);
    let f = &out.collection.features[0];
    assert_eq!(f.geometry.coordinates.len(), 2);
    assert!((f.properties.area_m2 - 1_500.0).abs() < 1.5);
}

#[test]
fn test_bad_tile_is_isolated() {
    let mut bad = tile_input("bad", 0, 40, 40, &[(5, 5, 30, 30)]);
    bad.tile.affine_transform = AffineTransform::IDENTITY;
    let good = tile_input("good", 0, 40, 40, &[(5, 5, 30, 30)]);

    let out = pipeline().run(vec![bad, good]);
    assert_eq!(out.stats.tiles_failed, 1);
    assert_eq!(out.stats.failures[0].tile_id, "bad");
    assert_eq!(out.collection.features.len(), 1);
}

#[test]
fn test_unsupported_crs_is_isolated() {
    let mut odd = tile_input("odd", 0, 40, 40, &[(5, 5, 30, 30)]);
    odd.tile.crs = "LOCAL:7".into();
    let out = pipeline().run(vec![odd]);
    assert_eq!(out.stats.tiles_failed, 1);
    assert!(out.collection.features.is_empty());
}

#[test]
fn test_capture_window_in_stats() {
    let early = Utc.with_ymd_and_hms(2021, 9, 3, 12, 0, 0).unwrap();
    let late = Utc.with_ymd_and_hms(2022, 5, 1, 12, 0, 0).unwrap();
    let mut a = tile_input("a", 0, 30, 30, &[]);
    let mut b = tile_input("b", 0, 30, 30, &[]);
    let c = tile_input("c", 0, 30, 30, &[]);
    a.tile.captured_at = Some(late);
    b.tile.captured_at = Some(early);

    let out = pipeline().run(vec![a, b, c]);
    assert_eq!(out.stats.earliest_capture, Some(early));
    assert_eq!(out.stats.latest_capture, Some(late));
}

#[test]
fn test_out_of_range_config_rejected() {
    let cfg = PipelineConfig::from_json_str(r#"{ "merge": { "overlap_threshold": 1.2 } }"#);
    let cfg = cfg.unwrap();
    assert!(matches!(Pipeline::new(cfg), Err(LotError::Configuration(_))));
}
