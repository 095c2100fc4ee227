//! Core domain model for the pet board: posts, their pets and images, and query inputs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "petfind-core";

/// Status assigned to posts that do not carry one.
pub const DEFAULT_STATUS: &str = "active";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown topic `{0}` (expected lost, found or adoption)")]
    Topic(String),
    #[error("invalid coordinate `{0}` (expected LAT,LNG in degrees)")]
    Coordinate(String),
    #[error("invalid date `{0}` (expected YYYY-MM-DD)")]
    Date(String),
}

/// Board a post belongs to. Parsed case-insensitively, always stored canonical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum Topic {
    #[default]
    Lost,
    Found,
    Adoption,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Lost, Topic::Found, Topic::Adoption];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Lost => "Lost",
            Topic::Found => "Found",
            Topic::Adoption => "Adoption",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| ParseError::Topic(s.to_string()))
    }
}

impl TryFrom<String> for Topic {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// WGS84 point in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Builds a coordinate from two nullable columns. Half-present, non-finite or
    /// out-of-range pairs mean "no location".
    pub fn from_parts(lat: Option<f64>, lng: Option<f64>) -> Option<Self> {
        let coord = Self::new(lat?, lng?);
        coord.is_valid().then_some(coord)
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

impl FromStr for Coordinate {
    type Err = ParseError;

    /// Parses `LAT,LNG`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseError::Coordinate(s.to_string());
        let (lat, lng) = s.split_once(',').ok_or_else(err)?;
        let lat = lat.trim().parse::<f64>().map_err(|_| err())?;
        let lng = lng.trim().parse::<f64>().map_err(|_| err())?;
        Coordinate::from_parts(Some(lat), Some(lng)).ok_or_else(err)
    }
}

/// Stored location as two nullable numbers, before validation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct LocationParts {
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
}

impl LocationParts {
    pub fn is_partial(&self) -> bool {
        self.lat.is_some() != self.lng.is_some()
    }

    pub fn coordinate(self) -> Option<Coordinate> {
        Coordinate::from_parts(self.lat, self.lng)
    }
}

fn lenient_location<'de, D>(deserializer: D) -> Result<Option<Coordinate>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<LocationParts>::deserialize(deserializer)?.and_then(LocationParts::coordinate))
}

/// Free-text pet attributes a query can match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PetField {
    Species,
    Breed,
    Color,
    Size,
    Gender,
}

impl PetField {
    pub const ALL: [PetField; 5] = [
        PetField::Species,
        PetField::Breed,
        PetField::Color,
        PetField::Size,
        PetField::Gender,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PetField::Species => "species",
            PetField::Breed => "breed",
            PetField::Color => "color",
            PetField::Size => "size",
            PetField::Gender => "gender",
        }
    }
}

/// Pet described by a post. Empty text means "unspecified".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pet {
    pub id: Uuid,
    #[serde(default)]
    pub species: String,
    #[serde(default)]
    pub breed: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub characteristics: String,
}

impl Pet {
    pub fn field(&self, field: PetField) -> &str {
        match field {
            PetField::Species => &self.species,
            PetField::Breed => &self.breed,
            PetField::Color => &self.color,
            PetField::Size => &self.size,
            PetField::Gender => &self.gender,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: Uuid,
    pub url: String,
}

fn default_status() -> String {
    DEFAULT_STATUS.to_string()
}

/// A fully-resolved post with its pets and images joined in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: Uuid,
    pub topic: Topic,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub contact: String,
    #[serde(default)]
    pub author_handle: String,
    #[serde(default = "default_status")]
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "lenient_location")]
    pub location: Option<Coordinate>,
    #[serde(default)]
    pub location_label: String,
    #[serde(default)]
    pub pets: Vec<Pet>,
    #[serde(default)]
    pub images: Vec<Image>,
}

impl Post {
    /// Location usable for distance math; invalid coordinates count as absent.
    pub fn location(&self) -> Option<Coordinate> {
        self.location.filter(Coordinate::is_valid)
    }
}

/// One row of the posts ⟕ pets ⟕ images join. Pet and image columns are null when the
/// post has no related rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedRow {
    pub post_id: Uuid,
    pub topic: Topic,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub author_handle: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub location_label: Option<String>,
    #[serde(default)]
    pub pet_id: Option<Uuid>,
    #[serde(default)]
    pub species: Option<String>,
    #[serde(default)]
    pub breed: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub characteristics: Option<String>,
    #[serde(default)]
    pub image_id: Option<Uuid>,
    #[serde(default)]
    pub image_url: Option<String>,
}

impl JoinedRow {
    /// Post columns only, with empty pet and image collections.
    pub fn post_header(&self) -> Post {
        Post {
            id: self.post_id,
            topic: self.topic,
            title: self.title.clone(),
            description: self.description.clone().unwrap_or_default(),
            contact: self.contact.clone().unwrap_or_default(),
            author_handle: self.author_handle.clone().unwrap_or_default(),
            status: self.status.clone().unwrap_or_else(default_status),
            created_at: self.created_at,
            location: Coordinate::from_parts(self.latitude, self.longitude),
            location_label: self.location_label.clone().unwrap_or_default(),
            pets: Vec::new(),
            images: Vec::new(),
        }
    }

    pub fn pet(&self) -> Option<Pet> {
        let id = self.pet_id?;
        let text = |v: &Option<String>| v.clone().unwrap_or_default();
        Some(Pet {
            id,
            species: text(&self.species),
            breed: text(&self.breed),
            color: text(&self.color),
            size: text(&self.size),
            gender: text(&self.gender),
            characteristics: text(&self.characteristics),
        })
    }

    pub fn image(&self) -> Option<Image> {
        Some(Image {
            id: self.image_id?,
            url: self.image_url.clone()?,
        })
    }
}

/// Proximity option: center point plus search radius.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Nearby {
    pub center: Coordinate,
    pub radius_km: f64,
}

impl Nearby {
    pub fn new(center: Coordinate, radius_km: f64) -> Self {
        Self { center, radius_km }
    }

    /// A non-positive or NaN radius disables the filter instead of matching nothing.
    pub fn is_active(&self) -> bool {
        self.radius_km > 0.0 && self.center.is_valid()
    }
}

/// Every recognized query option. Unset fields never exclude a post.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterCriteria {
    pub topic: Topic,
    #[serde(default)]
    pub species: Option<String>,
    #[serde(default)]
    pub breed: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub date_from: Option<NaiveDate>,
    #[serde(default)]
    pub date_to: Option<NaiveDate>,
    #[serde(default)]
    pub nearby: Option<Nearby>,
}

impl FilterCriteria {
    pub fn for_topic(topic: Topic) -> Self {
        Self {
            topic,
            ..Self::default()
        }
    }

    pub fn with_pet_field(mut self, field: PetField, pattern: impl Into<String>) -> Self {
        let pattern = Some(pattern.into());
        match field {
            PetField::Species => self.species = pattern,
            PetField::Breed => self.breed = pattern,
            PetField::Color => self.color = pattern,
            PetField::Size => self.size = pattern,
            PetField::Gender => self.gender = pattern,
        }
        self
    }

    pub fn with_author(mut self, pattern: impl Into<String>) -> Self {
        self.author = Some(pattern.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_date_range(mut self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        self.date_from = from;
        self.date_to = to;
        self
    }

    pub fn with_nearby(mut self, center: Coordinate, radius_km: f64) -> Self {
        self.nearby = Some(Nearby::new(center, radius_km));
        self
    }

    pub fn pet_pattern(&self, field: PetField) -> Option<&str> {
        match field {
            PetField::Species => self.species.as_deref(),
            PetField::Breed => self.breed.as_deref(),
            PetField::Color => self.color.as_deref(),
            PetField::Size => self.size.as_deref(),
            PetField::Gender => self.gender.as_deref(),
        }
    }

    /// First instant included by `date_from` (midnight UTC).
    pub fn created_from(&self) -> Option<DateTime<Utc>> {
        self.date_from
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
    }

    /// Last instant included by `date_to` (final millisecond of that day, UTC).
    pub fn created_to(&self) -> Option<DateTime<Utc>> {
        self.date_to
            .and_then(|d| d.and_hms_milli_opt(23, 59, 59, 999))
            .map(|dt| dt.and_utc())
    }

    /// Proximity option only when it actually constrains the result.
    pub fn active_nearby(&self) -> Option<Nearby> {
        self.nearby.filter(Nearby::is_active)
    }
}

pub fn parse_date(input: &str) -> Result<NaiveDate, ParseError> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .map_err(|_| ParseError::Date(input.to_string()))
}

/// Result ordering. Unrecognized input falls back to `Unsorted`, which keeps input order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortSpec {
    Newest,
    NearestFirst,
    #[default]
    Unsorted,
}

impl SortSpec {
    pub fn parse_lenient(input: &str) -> Self {
        match input.trim().to_ascii_lowercase().as_str() {
            "new" | "newest" => SortSpec::Newest,
            "near" | "nearest" | "nearest_first" | "nearest-first" => SortSpec::NearestFirst,
            _ => SortSpec::Unsorted,
        }
    }
}
