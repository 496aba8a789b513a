use argos_core::{
    point_in_polygon, BBox, FusedDetection, Point, Tracker, TrackerConfig, Zone, ZoneEvaluator,
    ZoneEventKind, ZoneKind,
};
use proptest::prelude::*;

fn fused(bbox: BBox) -> FusedDetection {
    FusedDetection {
        class_id: 0,
        class_name: "person".to_string(),
        confidence: 0.9,
        bbox,
        keypoints: Vec::new(),
        contributors: vec!["yolo_1".to_string()],
    }
}

fn rectangle(x1: f32, y1: f32, x2: f32, y2: f32) -> Vec<Point> {
    vec![
        Point::new(x1, y1),
        Point::new(x2, y1),
        Point::new(x2, y2),
        Point::new(x1, y2),
    ]
}

proptest! {
    #[test]
    fn containment_ignores_starting_vertex(
        x1 in 0.0f32..0.45, y1 in 0.0f32..0.45,
        x2 in 0.55f32..1.0, y2 in 0.55f32..1.0,
        px in 0.0f32..1.0, py in 0.0f32..1.0,
        shift in 0usize..4,
    ) {
        let polygon = rectangle(x1, y1, x2, y2);
        let mut rotated = polygon.clone();
        rotated.rotate_left(shift);
        let point = Point::new(px, py);
        prop_assert_eq!(
            point_in_polygon(point, &polygon),
            point_in_polygon(point, &rotated)
        );
    }

    #[test]
    fn rectangle_center_is_inside(
        x1 in 0.0f32..0.45, y1 in 0.0f32..0.45,
        x2 in 0.55f32..1.0, y2 in 0.55f32..1.0,
    ) {
        let center = Point::new((x1 + x2) / 2.0, (y1 + y2) / 2.0);
        prop_assert!(point_in_polygon(center, &rectangle(x1, y1, x2, y2)));
    }

    #[test]
    fn steadily_moving_box_keeps_its_id(
        start_x in 50.0f32..400.0, start_y in 50.0f32..300.0,
        dx in -2.0f32..2.0, dy in -2.0f32..2.0,
        frames in 2usize..40,
    ) {
        let mut tracker = Tracker::new(TrackerConfig::default());
        let mut ids = Vec::new();
        for i in 0..frames {
            let offset = i as f32;
            let bbox = BBox::new(
                start_x + dx * offset,
                start_y + dy * offset,
                start_x + dx * offset + 40.0,
                start_y + dy * offset + 80.0,
            );
            tracker.update(&[fused(bbox)], i as f64 * 0.1);
            prop_assert_eq!(tracker.tracks().len(), 1);
            ids.push(tracker.tracks()[0].id);
        }
        prop_assert!(ids.iter().all(|id| *id == 1));
    }

    #[test]
    fn enter_fires_once_after_debounce(min_frames in 1u32..6, frames in 1u32..10) {
        let mut tracker = Tracker::new(TrackerConfig {
            min_hits: 1,
            ..TrackerConfig::default()
        });
        let mut evaluator = ZoneEvaluator::new(min_frames);
        evaluator.set_zones(
            vec![Zone::new("lawn", "Lawn", ZoneKind::Warning, rectangle(0.0, 0.0, 1.0, 1.0))],
            0.0,
        );
        let mut enters = 0;
        let mut first_enter = None;
        for i in 1..=frames {
            let ts = i as f64;
            tracker.update(&[fused(BBox::new(40.0, 20.0, 60.0, 60.0))], ts);
            let tracks: Vec<_> = tracker.tracks().iter().collect();
            for event in evaluator.evaluate(&tracks, (100.0, 100.0), ts) {
                if event.event == ZoneEventKind::Enter {
                    enters += 1;
                    first_enter.get_or_insert(i);
                }
            }
        }
        if frames >= min_frames {
            prop_assert_eq!(enters, 1);
            prop_assert_eq!(first_enter, Some(min_frames));
        } else {
            prop_assert_eq!(enters, 0);
        }
    }
}
