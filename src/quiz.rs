//! Product-matching quiz scoring.
//!
//! Each answered question is a [`Criterion`] worth a fixed weight. A product earns partial credit
//! in `0.0..=1.0` per criterion, and its score is the weighted mean credit over the answered
//! criteria only. Unanswered questions neither help nor hurt.
use serde::{Deserialize, Serialize};

/// How much the customer cares about a built-in camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraNeed {
    /// Products without a camera earn no credit.
    Required,
    /// Products without a camera earn half credit.
    NiceToHave,
    /// Any product earns full credit.
    NotNeeded,
}

/// Answers collected by the quiz. `None` (or an empty feature list) means the question was
/// skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct QuizAnswers {
    pub application: Option<String>,
    /// Target magnification, e.g. `40.0` for 40x.
    pub magnification: Option<f64>,
    pub camera: Option<CameraNeed>,
    pub persona: Option<String>,
    /// Maximum price the customer is comfortable with.
    pub budget: Option<f64>,
    pub features: Vec<String>,
}

/// Inclusive magnification range of a product.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct MagnificationRange {
    pub min: f64,
    pub max: f64,
}

/// What the quiz knows about a product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct ProductProfile {
    pub id: String,
    pub price: f64,
    #[serde(default)]
    pub applications: Vec<String>,
    #[serde(default)]
    pub magnification: Option<MagnificationRange>,
    #[serde(default)]
    pub has_camera: bool,
    #[serde(default)]
    pub personas: Vec<String>,
    #[serde(default)]
    pub features: Vec<String>,
}

impl ProductProfile {
    /// Create a profile with no metadata.
    pub fn new(id: impl Into<String>, price: f64) -> ProductProfile {
        ProductProfile {
            id: id.into(),
            price,
            applications: Vec::new(),
            magnification: None,
            has_camera: false,
            personas: Vec::new(),
            features: Vec::new(),
        }
    }

    /// Build a profile from product tags.
    ///
    /// Recognized tags are `application:<name>`, `magnification:<min>-<max>x` (or
    /// `magnification:<n>x` for a fixed magnification), `camera`, `persona:<name>` and
    /// `feature:<name>`. Tag names are case-insensitive; other tags are ignored.
    ///
    /// ```
    /// # use splitkit::quiz::ProductProfile;
    /// let profile = ProductProfile::from_tags(
    ///     "stereo-pro",
    ///     449.0,
    ///     ["application:biology", "magnification:10-40x", "camera", "feature:led"],
    /// );
    /// assert!(profile.has_camera);
    /// assert_eq!(profile.magnification.unwrap().max, 40.0);
    /// ```
    pub fn from_tags<S: AsRef<str>>(
        id: impl Into<String>,
        price: f64,
        tags: impl IntoIterator<Item = S>,
    ) -> ProductProfile {
        let mut profile = ProductProfile::new(id, price);

        for tag in tags {
            let tag = tag.as_ref().trim();
            let (name, value) = match tag.split_once(':') {
                Some((name, value)) => (name.trim(), value.trim()),
                None => (tag, ""),
            };

            match name.to_ascii_lowercase().as_str() {
                "application" if !value.is_empty() => profile.applications.push(value.to_owned()),
                "persona" if !value.is_empty() => profile.personas.push(value.to_owned()),
                "feature" if !value.is_empty() => profile.features.push(value.to_owned()),
                "camera" => profile.has_camera = true,
                "magnification" => match parse_magnification(value) {
                    Some(range) => profile.magnification = Some(range),
                    None => {
                        log::debug!(target: "splitkit",
                                    product_id = profile.id.as_str(),
                                    tag;
                                    "ignoring malformed magnification tag");
                    }
                },
                _ => {}
            }
        }

        profile
    }
}

fn parse_magnification(value: &str) -> Option<MagnificationRange> {
    let value = value.trim_end_matches(['x', 'X']);
    let (min, max) = match value.split_once('-') {
        Some((min, max)) => (min.trim().parse().ok()?, max.trim().parse().ok()?),
        None => {
            let n: f64 = value.trim().parse().ok()?;
            (n, n)
        }
    };
    (min <= max).then_some(MagnificationRange { min, max })
}

/// A quiz question contributing to the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Criterion {
    Application,
    Magnification,
    Budget,
    Camera,
    Persona,
    Features,
}

impl Criterion {
    /// Relative importance of the criterion. Weights of all criteria add up to 1.
    pub fn weight(self) -> f64 {
        match self {
            Criterion::Application => 0.25,
            Criterion::Magnification => 0.20,
            Criterion::Budget => 0.20,
            Criterion::Camera => 0.15,
            Criterion::Persona => 0.10,
            Criterion::Features => 0.10,
        }
    }
}

/// Credit earned on one criterion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct CriterionScore {
    pub criterion: Criterion,
    /// In `0.0..=1.0`.
    pub credit: f64,
}

/// Score of a product against the quiz answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductMatch {
    #[allow(missing_docs)]
    pub product_id: String,
    /// Weighted mean credit, in `0.0..=1.0`. Zero if no question was answered.
    pub score: f64,
    /// Per-criterion breakdown, answered criteria only.
    pub criteria: Vec<CriterionScore>,
}

/// Budget overrun at which budget credit reaches zero, relative to the budget.
const BUDGET_TOLERANCE: f64 = 0.25;

/// Score a single product.
pub fn score_product(answers: &QuizAnswers, product: &ProductProfile) -> ProductMatch {
    let mut criteria = Vec::new();

    if let Some(application) = &answers.application {
        criteria.push(CriterionScore {
            criterion: Criterion::Application,
            credit: contains_ignore_case(&product.applications, application).into(),
        });
    }
    if let Some(target) = answers.magnification {
        criteria.push(CriterionScore {
            criterion: Criterion::Magnification,
            credit: product
                .magnification
                .map_or(0.0, |range| magnification_credit(target, range)),
        });
    }
    if let Some(budget) = answers.budget {
        criteria.push(CriterionScore {
            criterion: Criterion::Budget,
            credit: budget_credit(budget, product.price),
        });
    }
    if let Some(camera) = answers.camera {
        let credit = match (camera, product.has_camera) {
            (_, true) | (CameraNeed::NotNeeded, false) => 1.0,
            (CameraNeed::NiceToHave, false) => 0.5,
            (CameraNeed::Required, false) => 0.0,
        };
        criteria.push(CriterionScore {
            criterion: Criterion::Camera,
            credit,
        });
    }
    if let Some(persona) = &answers.persona {
        criteria.push(CriterionScore {
            criterion: Criterion::Persona,
            credit: contains_ignore_case(&product.personas, persona).into(),
        });
    }
    if !answers.features.is_empty() {
        let matched = answers
            .features
            .iter()
            .filter(|feature| contains_ignore_case(&product.features, feature))
            .count();
        criteria.push(CriterionScore {
            criterion: Criterion::Features,
            credit: matched as f64 / answers.features.len() as f64,
        });
    }

    let total_weight: f64 = criteria.iter().map(|c| c.criterion.weight()).sum();
    let score = if total_weight > 0.0 {
        let earned: f64 = criteria
            .iter()
            .map(|c| c.criterion.weight() * c.credit)
            .sum();
        (earned / total_weight).clamp(0.0, 1.0)
    } else {
        0.0
    };

    ProductMatch {
        product_id: product.id.clone(),
        score,
        criteria,
    }
}

/// Score every product, best match first. Ties are ordered by product id.
pub fn score_products(answers: &QuizAnswers, products: &[ProductProfile]) -> Vec<ProductMatch> {
    let mut matches: Vec<_> = products
        .iter()
        .map(|product| score_product(answers, product))
        .collect();
    matches.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.product_id.cmp(&b.product_id))
    });
    matches
}

fn contains_ignore_case(values: &[String], needle: &str) -> bool {
    values.iter().any(|v| v.eq_ignore_ascii_case(needle))
}

fn magnification_credit(target: f64, range: MagnificationRange) -> f64 {
    let bound = if target < range.min {
        range.min
    } else if target > range.max {
        range.max
    } else {
        return 1.0;
    };
    if bound <= 0.0 {
        return 0.0;
    }
    let distance = (target - bound).abs() / bound;
    (1.0 - distance).max(0.0)
}

fn budget_credit(budget: f64, price: f64) -> f64 {
    if price <= budget {
        return 1.0;
    }
    if budget <= 0.0 {
        return 0.0;
    }
    let overrun = (price - budget) / budget;
    (1.0 - overrun / BUDGET_TOLERANCE).max(0.0)
}
