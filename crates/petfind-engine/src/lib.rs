//! Filtering, ranking and relation aggregation over an immutable snapshot of posts.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use petfind_core::{
    Coordinate, FilterCriteria, JoinedRow, Nearby, PetField, Post, SortSpec, Topic,
};
use serde::Serialize;
use tracing::{debug, debug_span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "petfind-engine";

/// Mean Earth radius used by the haversine formula.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone)]
pub struct QueryDefaults {
    pub per_page: usize,
    pub max_per_page: usize,
    pub sort: SortSpec,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            per_page: 20,
            max_per_page: 100,
            sort: SortSpec::Newest,
        }
    }
}

impl QueryDefaults {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            per_page: std::env::var("PETFIND_PER_PAGE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.per_page),
            max_per_page: std::env::var("PETFIND_MAX_PER_PAGE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_per_page),
            sort: std::env::var("PETFIND_DEFAULT_SORT")
                .map(|v| SortSpec::parse_lenient(&v))
                .unwrap_or(defaults.sort),
        }
    }
}

/// Great-circle distance in kilometres (haversine, spherical Earth).
pub fn distance_km(a: Coordinate, b: Coordinate) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    // Rounding can push h slightly past 1 near antipodes.
    let h = h.clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

pub fn format_distance_km(distance_km: f64) -> String {
    format!("{distance_km:.1} km away")
}

struct PostAccumulator {
    post: Post,
    pet_ids: HashSet<Uuid>,
    image_ids: HashSet<Uuid>,
}

/// Folds join rows (N pets x M images per post) into posts holding each distinct pet and
/// image once, in first-seen order. Posts keep the order of their first row.
pub fn aggregate_rows(rows: &[JoinedRow]) -> Vec<Post> {
    let mut index: HashMap<Uuid, usize> = HashMap::new();
    let mut acc: Vec<PostAccumulator> = Vec::new();

    for row in rows {
        let slot = *index.entry(row.post_id).or_insert_with(|| {
            acc.push(PostAccumulator {
                post: row.post_header(),
                pet_ids: HashSet::new(),
                image_ids: HashSet::new(),
            });
            acc.len() - 1
        });
        let entry = &mut acc[slot];

        if let Some(pet) = row.pet() {
            if entry.pet_ids.insert(pet.id) {
                entry.post.pets.push(pet);
            }
        }
        if let Some(image) = row.image() {
            if entry.image_ids.insert(image.id) {
                entry.post.images.push(image);
            }
        }
    }

    debug!(rows = rows.len(), posts = acc.len(), "aggregated joined rows");
    acc.into_iter().map(|a| a.post).collect()
}

/// Post that survived filtering, optionally annotated with its distance to the query center.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedPost {
    #[serde(flatten)]
    pub post: Post,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
}

impl RankedPost {
    pub fn distance_label(&self) -> Option<String> {
        self.distance_km.map(format_distance_km)
    }
}

pub trait PostPredicate: Send + Sync {
    fn name(&self) -> &'static str;
    fn matches(&self, post: &Post) -> bool;
}

fn contains_ci(haystack: &str, needle_lower: &str) -> bool {
    haystack.to_lowercase().contains(needle_lower)
}

/// Trimmed, lowercased pattern; blank patterns are treated as unset.
fn active_pattern(pattern: Option<&str>) -> Option<String> {
    pattern
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_lowercase)
}

pub struct TopicPredicate {
    pub topic: Topic,
}

impl PostPredicate for TopicPredicate {
    fn name(&self) -> &'static str {
        "topic"
    }

    fn matches(&self, post: &Post) -> bool {
        post.topic == self.topic
    }
}

/// Substring match against the union of the post's pets for a single field. A post with
/// no pets never matches.
pub struct PetFieldPredicate {
    pub field: PetField,
    needle: String,
}

impl PetFieldPredicate {
    pub fn new(field: PetField, pattern: &str) -> Option<Self> {
        active_pattern(Some(pattern)).map(|needle| Self { field, needle })
    }
}

impl PostPredicate for PetFieldPredicate {
    fn name(&self) -> &'static str {
        self.field.as_str()
    }

    fn matches(&self, post: &Post) -> bool {
        post.pets
            .iter()
            .any(|pet| contains_ci(pet.field(self.field), &self.needle))
    }
}

pub struct AuthorPredicate {
    needle: String,
}

impl AuthorPredicate {
    pub fn new(pattern: &str) -> Option<Self> {
        active_pattern(Some(pattern)).map(|needle| Self { needle })
    }
}

impl PostPredicate for AuthorPredicate {
    fn name(&self) -> &'static str {
        "author"
    }

    fn matches(&self, post: &Post) -> bool {
        contains_ci(&post.author_handle, &self.needle)
    }
}

pub struct StatusPredicate {
    status: String,
}

impl StatusPredicate {
    pub fn new(status: &str) -> Option<Self> {
        active_pattern(Some(status)).map(|status| Self { status })
    }
}

impl PostPredicate for StatusPredicate {
    fn name(&self) -> &'static str {
        "status"
    }

    fn matches(&self, post: &Post) -> bool {
        post.status.trim().to_lowercase() == self.status
    }
}

/// Inclusive creation-time window; either bound may be open.
pub struct CreatedRangePredicate {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl PostPredicate for CreatedRangePredicate {
    fn name(&self) -> &'static str {
        "created_at"
    }

    fn matches(&self, post: &Post) -> bool {
        self.from.map_or(true, |from| post.created_at >= from)
            && self.to.map_or(true, |to| post.created_at <= to)
    }
}

pub struct ProximityPredicate {
    pub nearby: Nearby,
}

impl ProximityPredicate {
    /// Distance to the center when the post lies within the radius.
    pub fn within(&self, post: &Post) -> Option<f64> {
        let location = post.location()?;
        let d = distance_km(self.nearby.center, location);
        (d <= self.nearby.radius_km).then_some(d)
    }
}

impl PostPredicate for ProximityPredicate {
    fn name(&self) -> &'static str {
        "nearby"
    }

    fn matches(&self, post: &Post) -> bool {
        self.within(post).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Excluded,
    Included { distance_km: Option<f64> },
}

/// AND-composition of every predicate the criteria activates.
pub struct FilterPipeline {
    predicates: Vec<Box<dyn PostPredicate>>,
    proximity: Option<ProximityPredicate>,
}

impl FilterPipeline {
    pub fn from_criteria(criteria: &FilterCriteria) -> Self {
        let mut pipeline = Self::without_topic(criteria);
        pipeline.predicates.insert(
            0,
            Box::new(TopicPredicate {
                topic: criteria.topic,
            }),
        );
        pipeline
    }

    /// Every predicate except topic; used for per-topic facet counts.
    pub fn without_topic(criteria: &FilterCriteria) -> Self {
        let mut predicates: Vec<Box<dyn PostPredicate>> = Vec::new();

        for field in PetField::ALL {
            if let Some(p) = criteria
                .pet_pattern(field)
                .and_then(|pattern| PetFieldPredicate::new(field, pattern))
            {
                predicates.push(Box::new(p));
            }
        }
        if let Some(p) = criteria.author.as_deref().and_then(AuthorPredicate::new) {
            predicates.push(Box::new(p));
        }
        if let Some(p) = criteria.status.as_deref().and_then(StatusPredicate::new) {
            predicates.push(Box::new(p));
        }
        let (from, to) = (criteria.created_from(), criteria.created_to());
        if from.is_some() || to.is_some() {
            predicates.push(Box::new(CreatedRangePredicate { from, to }));
        }

        Self {
            predicates,
            proximity: criteria
                .active_nearby()
                .map(|nearby| ProximityPredicate { nearby }),
        }
    }

    pub fn len(&self) -> usize {
        self.predicates.len() + usize::from(self.proximity.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn predicate_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.predicates.iter().map(|p| p.name()).collect();
        if let Some(p) = &self.proximity {
            names.push(p.name());
        }
        names
    }

    pub fn evaluate(&self, post: &Post) -> Verdict {
        if !self.predicates.iter().all(|p| p.matches(post)) {
            return Verdict::Excluded;
        }
        match &self.proximity {
            None => Verdict::Included { distance_km: None },
            Some(proximity) => match proximity.within(post) {
                Some(d) => Verdict::Included {
                    distance_km: Some(d),
                },
                None => Verdict::Excluded,
            },
        }
    }

    pub fn matches(&self, post: &Post) -> bool {
        matches!(self.evaluate(post), Verdict::Included { .. })
    }

    /// Clones the surviving posts; the snapshot itself is never touched.
    pub fn apply(&self, posts: &[Post]) -> Vec<RankedPost> {
        posts
            .iter()
            .filter_map(|post| match self.evaluate(post) {
                Verdict::Excluded => None,
                Verdict::Included { distance_km } => Some(RankedPost {
                    post: post.clone(),
                    distance_km,
                }),
            })
            .collect()
    }
}

pub fn matches(post: &Post, criteria: &FilterCriteria) -> bool {
    FilterPipeline::from_criteria(criteria).matches(post)
}

/// Stable ordering of filtered posts. `NearestFirst` puts unlocated posts (or all posts
/// when there is no center) at +inf and breaks ties newest first.
pub fn rank(
    mut posts: Vec<RankedPost>,
    sort: SortSpec,
    center: Option<Coordinate>,
) -> Vec<RankedPost> {
    match sort {
        SortSpec::Newest => {
            posts.sort_by(|a, b| b.post.created_at.cmp(&a.post.created_at));
            posts
        }
        SortSpec::NearestFirst => {
            let center = center.filter(Coordinate::is_valid);
            let mut keyed = posts
                .into_iter()
                .map(|p| {
                    let d = center
                        .zip(p.post.location())
                        .map(|(c, loc)| distance_km(c, loc))
                        .unwrap_or(f64::INFINITY);
                    (d, p)
                })
                .collect::<Vec<_>>();
            keyed.sort_by(|(da, a), (db, b)| {
                da.total_cmp(db)
                    .then_with(|| b.post.created_at.cmp(&a.post.created_at))
            });
            keyed.into_iter().map(|(_, p)| p).collect()
        }
        SortSpec::Unsorted => posts,
    }
}

/// Filter then rank one snapshot. Pure: same inputs give the same output.
pub fn query(posts: &[Post], criteria: &FilterCriteria, sort: SortSpec) -> Vec<RankedPost> {
    let span = debug_span!("post_query", topic = %criteria.topic, ?sort, input = posts.len());
    let _guard = span.enter();

    let pipeline = FilterPipeline::from_criteria(criteria);
    let survivors = pipeline.apply(posts);
    debug!(
        predicates = ?pipeline.predicate_names(),
        matched = survivors.len(),
        "filtered snapshot"
    );
    rank(survivors, sort, criteria.nearby.map(|n| n.center))
}

pub fn query_rows(rows: &[JoinedRow], criteria: &FilterCriteria, sort: SortSpec) -> Vec<RankedPost> {
    let posts = aggregate_rows(rows);
    query(&posts, criteria, sort)
}

pub fn find_post(posts: &[Post], id: Uuid) -> Option<&Post> {
    posts.iter().find(|p| p.id == id)
}

/// Every post by one author (exact handle, any case, any topic), newest first.
pub fn posts_by_author(posts: &[Post], handle: &str) -> Vec<Post> {
    let handle = handle.trim().to_lowercase();
    let mut out = posts
        .iter()
        .filter(|p| p.author_handle.trim().to_lowercase() == handle)
        .cloned()
        .collect::<Vec<_>>();
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicCount {
    pub topic: Topic,
    pub count: usize,
    pub selected: bool,
}

/// Per-topic counts of posts passing every other active predicate.
pub fn topic_counts(posts: &[Post], criteria: &FilterCriteria) -> Vec<TopicCount> {
    let pipeline = FilterPipeline::without_topic(criteria);
    let mut counts: HashMap<Topic, usize> = HashMap::new();
    for post in posts.iter().filter(|p| pipeline.matches(p)) {
        *counts.entry(post.topic).or_default() += 1;
    }
    Topic::ALL
        .into_iter()
        .map(|topic| TopicCount {
            topic,
            count: counts.get(&topic).copied().unwrap_or(0),
            selected: topic == criteria.topic,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
}

pub fn paginate<T>(
    items: Vec<T>,
    page: Option<usize>,
    per_page: Option<usize>,
    defaults: &QueryDefaults,
) -> Page<T> {
    let per_page = per_page
        .unwrap_or(defaults.per_page)
        .clamp(1, defaults.max_per_page.max(1));
    let total = items.len();
    let total_pages = total.max(1).div_ceil(per_page);
    let page = page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;
    let items = items.into_iter().skip(start).take(per_page).collect();
    Page {
        items,
        page,
        per_page,
        total,
        total_pages,
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub criteria: FilterCriteria,
    pub sort: Option<SortSpec>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub sort: SortSpec,
    pub topics: Vec<TopicCount>,
    #[serde(flatten)]
    pub page: Page<RankedPost>,
}

/// Query plus pagination and topic facets, with env-driven defaults.
pub struct QueryEngine {
    defaults: QueryDefaults,
}

impl QueryEngine {
    pub fn new(defaults: QueryDefaults) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &QueryDefaults {
        &self.defaults
    }

    pub fn search(&self, posts: &[Post], request: &SearchRequest) -> SearchPage {
        let sort = request.sort.unwrap_or(self.defaults.sort);
        let ranked = query(posts, &request.criteria, sort);
        SearchPage {
            sort,
            topics: topic_counts(posts, &request.criteria),
            page: paginate(ranked, request.page, request.per_page, &self.defaults),
        }
    }
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self::new(QueryDefaults::default())
    }
}
