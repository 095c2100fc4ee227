//! Property tests for distance, filtering and ranking invariants.

use chrono::{DateTime, Duration, TimeZone, Utc};
use petfind_core::{Coordinate, FilterCriteria, Pet, Post, SortSpec, Topic};
use petfind_engine::{distance_km, matches, query};
use proptest::prelude::*;
use uuid::Uuid;

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap()
}

fn coordinate() -> impl Strategy<Value = Coordinate> {
    (-90.0f64..=90.0, -180.0f64..=180.0).prop_map(|(lat, lng)| Coordinate::new(lat, lng))
}

fn topic() -> impl Strategy<Value = Topic> {
    prop::sample::select(Topic::ALL.to_vec())
}

fn post() -> impl Strategy<Value = Post> {
    (
        topic(),
        0i64..10_000,
        proptest::option::of(coordinate()),
        prop::collection::vec("[A-Za-z]{0,8}", 0..3),
        "[a-z_]{0,8}",
    )
        .prop_map(|(topic, minutes, location, species, author)| Post {
            id: Uuid::new_v4(),
            topic,
            title: "post".into(),
            description: String::new(),
            contact: String::new(),
            author_handle: author,
            status: "active".into(),
            created_at: base_time() + Duration::minutes(minutes),
            location,
            location_label: String::new(),
            pets: species
                .into_iter()
                .map(|species| Pet {
                    id: Uuid::new_v4(),
                    species,
                    breed: String::new(),
                    color: String::new(),
                    size: String::new(),
                    gender: String::new(),
                    characteristics: String::new(),
                })
                .collect(),
            images: vec![],
        })
}

proptest! {
    #[test]
    fn prop_distance_to_self_is_zero(a in coordinate()) {
        prop_assert_eq!(distance_km(a, a), 0.0);
    }

    #[test]
    fn prop_distance_is_symmetric_and_finite(a in coordinate(), b in coordinate()) {
        let ab = distance_km(a, b);
        let ba = distance_km(b, a);
        prop_assert!(ab.is_finite());
        prop_assert!(ab >= 0.0);
        prop_assert!((ab - ba).abs() < 1e-9);
    }

    #[test]
    fn prop_distance_grows_along_a_meridian(lat in -80.0f64..80.0, step in 0.01f64..5.0) {
        let origin = Coordinate::new(lat, 10.0);
        let near = Coordinate::new(lat + step, 10.0);
        let far = Coordinate::new(lat + step * 2.0, 10.0);
        prop_assert!(distance_km(origin, near) < distance_km(origin, far));
    }

    #[test]
    fn prop_topic_only_criteria_match_by_topic(p in post(), t in topic()) {
        prop_assert_eq!(matches(&p, &FilterCriteria::for_topic(t)), p.topic == t);
    }

    #[test]
    fn prop_query_is_idempotent_and_leaves_input_untouched(
        posts in prop::collection::vec(post(), 0..20),
        t in topic(),
        center in coordinate(),
        radius in -10.0f64..3000.0,
    ) {
        let snapshot = posts.clone();
        let criteria = FilterCriteria::for_topic(t).with_nearby(center, radius);
        let first = query(&posts, &criteria, SortSpec::NearestFirst);
        let second = query(&posts, &criteria, SortSpec::NearestFirst);
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(&posts, &snapshot);
    }

    #[test]
    fn prop_newest_is_non_increasing(posts in prop::collection::vec(post(), 0..30), t in topic()) {
        let out = query(&posts, &FilterCriteria::for_topic(t), SortSpec::Newest);
        for pair in out.windows(2) {
            prop_assert!(pair[0].post.created_at >= pair[1].post.created_at);
        }
    }

    #[test]
    fn prop_nearest_first_puts_located_before_unlocated(
        posts in prop::collection::vec(post(), 0..30),
        t in topic(),
        center in coordinate(),
    ) {
        // Radius 0 disables the filter but keeps the center for ranking.
        let criteria = FilterCriteria::for_topic(t).with_nearby(center, 0.0);
        let out = query(&posts, &criteria, SortSpec::NearestFirst);
        let first_unlocated = out.iter().position(|r| r.post.location().is_none());
        if let Some(idx) = first_unlocated {
            prop_assert!(out[idx..].iter().all(|r| r.post.location().is_none()));
        }
    }

    #[test]
    fn prop_unsorted_preserves_relative_order(posts in prop::collection::vec(post(), 0..30), t in topic()) {
        let out = query(&posts, &FilterCriteria::for_topic(t), SortSpec::Unsorted);
        let expected: Vec<Uuid> = posts.iter().filter(|p| p.topic == t).map(|p| p.id).collect();
        let got: Vec<Uuid> = out.iter().map(|r| r.post.id).collect();
        prop_assert_eq!(got, expected);
    }
}

#[test]
fn concurrent_queries_over_one_snapshot_agree() {
    let posts: Vec<Post> = (0..50)
        .map(|i| Post {
            id: Uuid::new_v4(),
            topic: Topic::ALL[i % 3],
            title: format!("post {i}"),
            description: String::new(),
            contact: String::new(),
            author_handle: "anna".into(),
            status: "active".into(),
            created_at: base_time() + Duration::minutes(i as i64),
            location: Some(Coordinate::new(40.0 + i as f64 * 0.01, -3.0)),
            location_label: String::new(),
            pets: vec![],
            images: vec![],
        })
        .collect();
    let criteria = FilterCriteria::for_topic(Topic::Lost).with_nearby(Coordinate::new(40.0, -3.0), 30.0);
    let expected = query(&posts, &criteria, SortSpec::NearestFirst);

    std::thread::scope(|scope| {
        let handles = (0..4)
            .map(|_| scope.spawn(|| query(&posts, &criteria, SortSpec::NearestFirst)))
            .collect::<Vec<_>>();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    });
}
