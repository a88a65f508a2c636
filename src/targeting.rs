use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::{AttributeValue, Device, PropertyRef, UserContext};

/// Declarative eligibility rules for an experiment or a feature flag.
///
/// An empty list means "no constraint". A `Targeting` with no constraints at all admits everyone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Targeting {
    /// Allowed devices.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<Device>,
    /// Allowed country codes (case-insensitive).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub countries: Vec<String>,
    /// Allowed browsers (case-insensitive).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub browsers: Vec<String>,
    /// Additional rules. All of them must pass.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_rules: Vec<TargetingRule>,
}

impl Targeting {
    /// Returns `true` if no constraint is set.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
            && self.countries.is_empty()
            && self.browsers.is_empty()
            && self.custom_rules.is_empty()
    }

    #[allow(missing_docs)]
    pub fn with_devices(mut self, devices: impl IntoIterator<Item = Device>) -> Self {
        self.devices = devices.into_iter().collect();
        self
    }

    #[allow(missing_docs)]
    pub fn with_countries<S: Into<String>>(
        mut self,
        countries: impl IntoIterator<Item = S>,
    ) -> Self {
        self.countries = countries.into_iter().map(Into::into).collect();
        self
    }

    #[allow(missing_docs)]
    pub fn with_browsers<S: Into<String>>(
        mut self,
        browsers: impl IntoIterator<Item = S>,
    ) -> Self {
        self.browsers = browsers.into_iter().map(Into::into).collect();
        self
    }

    #[allow(missing_docs)]
    pub fn with_rule(mut self, rule: TargetingRule) -> Self {
        self.custom_rules.push(rule);
        self
    }

    /// Check whether `context` is eligible.
    pub fn eval(&self, context: &UserContext) -> bool {
        let device_allowed = self.devices.is_empty() || self.devices.contains(&context.device);

        device_allowed
            && matches_list(&self.countries, context.country.as_deref())
            && matches_list(&self.browsers, context.browser.as_deref())
            && self.custom_rules.iter().all(|rule| rule.eval(context))
    }
}

fn matches_list(allowed: &[String], value: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    value.is_some_and(|value| allowed.iter().any(|it| it.eq_ignore_ascii_case(value)))
}

/// A single `{property, operator, value}` condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetingRule {
    /// Context field or `custom.<name>` property to test.
    pub property: PropertyRef,
    #[allow(missing_docs)]
    pub operator: Operator,
    /// Value to compare against. `in`/`not_in` expect a list.
    pub value: RuleValue,
}

impl TargetingRule {
    /// Create a new rule.
    ///
    /// ```
    /// # use splitkit::{Operator, TargetingRule};
    /// let rule = TargetingRule::new("custom.plan", Operator::In, vec!["pro", "lab"]);
    /// ```
    pub fn new(
        property: impl Into<PropertyRef>,
        operator: Operator,
        value: impl Into<RuleValue>,
    ) -> TargetingRule {
        TargetingRule {
            property: property.into(),
            operator,
            value: value.into(),
        }
    }

    /// A rule fails if the property is missing from the context.
    pub fn eval(&self, context: &UserContext) -> bool {
        self.operator
            .eval(context.resolve(&self.property).as_ref(), &self.value)
    }
}

/// Right-hand side of a [`TargetingRule`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleValue {
    #[allow(missing_docs)]
    Multiple(Vec<AttributeValue>),
    #[allow(missing_docs)]
    Single(AttributeValue),
}

impl From<AttributeValue> for RuleValue {
    fn from(value: AttributeValue) -> Self {
        Self::Single(value)
    }
}
impl From<&str> for RuleValue {
    fn from(value: &str) -> Self {
        Self::Single(value.into())
    }
}
impl From<String> for RuleValue {
    fn from(value: String) -> Self {
        Self::Single(value.into())
    }
}
impl From<f64> for RuleValue {
    fn from(value: f64) -> Self {
        Self::Single(value.into())
    }
}
impl From<bool> for RuleValue {
    fn from(value: bool) -> Self {
        Self::Single(value.into())
    }
}
impl<T: Into<AttributeValue>> From<Vec<T>> for RuleValue {
    fn from(value: Vec<T>) -> Self {
        Self::Multiple(value.into_iter().map(Into::into).collect())
    }
}

/// Comparison applied by a [`TargetingRule`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    In,
    NotIn,
    /// Regular expression match.
    Matches,
    NotMatches,
}

impl Operator {
    /// Applying `Operator` to the values. Returns `false` if the operator cannot be applied or
    /// the rule is misconfigured.
    pub fn eval(&self, attribute: Option<&AttributeValue>, rule_value: &RuleValue) -> bool {
        self.try_eval(attribute, rule_value).unwrap_or(false)
    }

    /// Try applying `Operator` to the values, returning `None` if the operator cannot be applied.
    fn try_eval(
        &self,
        attribute: Option<&AttributeValue>,
        rule_value: &RuleValue,
    ) -> Option<bool> {
        let attribute = attribute.filter(|it| **it != AttributeValue::Null)?;

        match self {
            Self::Equals | Self::NotEquals => {
                let RuleValue::Single(expected) = rule_value else {
                    return None;
                };
                let equal = loosely_equal(attribute, expected)?;
                Some(equal == (*self == Self::Equals))
            }

            Self::Contains | Self::NotContains => {
                let haystack = attribute.to_plain_string()?;
                let needle = match rule_value {
                    RuleValue::Single(value) => value.to_plain_string()?,
                    RuleValue::Multiple(_) => return None,
                };
                let contains = haystack.contains(&needle);
                Some(contains == (*self == Self::Contains))
            }

            Self::In | Self::NotIn => {
                let s = attribute.to_plain_string()?;
                let RuleValue::Multiple(values) = rule_value else {
                    return None;
                };
                let is_one_of = values
                    .iter()
                    .any(|v| v.to_plain_string().as_deref() == Some(s.as_str()));
                Some(is_one_of == (*self == Self::In))
            }

            Self::Matches | Self::NotMatches => {
                let s = attribute.as_str()?;
                let regex = match rule_value {
                    RuleValue::Single(AttributeValue::String(pattern)) => {
                        Regex::new(pattern).ok()?
                    }
                    _ => return None,
                };
                let matches = regex.is_match(s);
                Some(matches == (*self == Self::Matches))
            }

            Self::GreaterThan | Self::LessThan => {
                let RuleValue::Single(expected) = rule_value else {
                    return None;
                };

                let condition_version = expected.as_str().and_then(|s| Version::parse(s).ok());

                if let Some(condition_version) = condition_version {
                    // semver comparison
                    let attribute_version = Version::parse(attribute.as_str()?).ok()?;

                    Some(if *self == Self::GreaterThan {
                        attribute_version > condition_version
                    } else {
                        attribute_version < condition_version
                    })
                } else {
                    // numeric comparison
                    let condition_value = to_number(expected)?;
                    let attribute_value = to_number(attribute)?;

                    Some(if *self == Self::GreaterThan {
                        attribute_value > condition_value
                    } else {
                        attribute_value < condition_value
                    })
                }
            }
        }
    }
}

fn to_number(value: &AttributeValue) -> Option<f64> {
    match value {
        AttributeValue::Number(n) => Some(*n),
        AttributeValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Numbers and booleans compare by value, everything else by textual form.
fn loosely_equal(attribute: &AttributeValue, expected: &AttributeValue) -> Option<bool> {
    Some(match (attribute, expected) {
        (AttributeValue::Number(a), AttributeValue::Number(b)) => a == b,
        (AttributeValue::Boolean(a), AttributeValue::Boolean(b)) => a == b,
        _ => attribute.to_plain_string()? == expected.to_plain_string()?,
    })
}

#[cfg(test)]
mod tests {
    use super::{Operator, RuleValue, Targeting, TargetingRule};
    use crate::{AttributeValue, Device, UserContext};

    fn context() -> UserContext {
        UserContext::new("user-1", "session-1")
            .with_device(Device::Mobile)
            .with_country("US")
            .with_browser("Chrome")
            .with_custom_property("plan", "lab-pro")
            .with_custom_property("orders", 3.0)
            .with_custom_property("app_version", "2.10.1")
            .with_custom_property("newsletter", true)
    }

    #[test]
    fn equals() {
        assert!(Operator::Equals.eval(Some(&"alice".into()), &"alice".into()));
        assert!(!Operator::Equals.eval(Some(&"alice".into()), &"bob".into()));
        assert!(Operator::Equals.eval(Some(&42.0.into()), &"42".into()));
        assert!(Operator::Equals.eval(Some(&true.into()), &true.into()));
        assert!(!Operator::Equals.eval(None, &"alice".into()));
    }

    #[test]
    fn not_equals() {
        assert!(Operator::NotEquals.eval(Some(&"alice".into()), &"bob".into()));
        assert!(!Operator::NotEquals.eval(Some(&"alice".into()), &"alice".into()));
        // missing attribute never passes
        assert!(!Operator::NotEquals.eval(None, &"alice".into()));
        assert!(!Operator::NotEquals.eval(Some(&AttributeValue::Null), &"alice".into()));
    }

    #[test]
    fn contains() {
        assert!(Operator::Contains.eval(Some(&"microscope-pro".into()), &"scope".into()));
        assert!(!Operator::Contains.eval(Some(&"microscope-pro".into()), &"camera".into()));
        assert!(Operator::NotContains.eval(Some(&"microscope-pro".into()), &"camera".into()));
        assert!(!Operator::NotContains.eval(None, &"camera".into()));
    }

    #[test]
    fn in_list() {
        let list: RuleValue = vec!["US", "CA"].into();
        assert!(Operator::In.eval(Some(&"US".into()), &list));
        assert!(!Operator::In.eval(Some(&"DE".into()), &list));
        assert!(Operator::NotIn.eval(Some(&"DE".into()), &list));
        assert!(!Operator::NotIn.eval(Some(&"CA".into()), &list));
        assert!(!Operator::NotIn.eval(None, &list));

        // a single value is a misconfiguration
        assert!(!Operator::In.eval(Some(&"US".into()), &"US".into()));
    }

    #[test]
    fn in_list_number() {
        assert!(Operator::In.eval(Some(&42.0.into()), &vec!["42"].into()));
        assert!(Operator::In.eval(Some(&true.into()), &vec!["true"].into()));
    }

    #[test]
    fn greater_and_less_than() {
        assert!(Operator::GreaterThan.eval(Some(&19.0.into()), &18.0.into()));
        assert!(!Operator::GreaterThan.eval(Some(&18.0.into()), &18.0.into()));
        assert!(Operator::LessThan.eval(Some(&17.0.into()), &18.0.into()));
        assert!(!Operator::LessThan.eval(Some(&18.0.into()), &18.0.into()));
        assert!(Operator::GreaterThan.eval(Some(&"250".into()), &100.0.into()));
        assert!(!Operator::GreaterThan.eval(Some(&"n/a".into()), &100.0.into()));
    }

    #[test]
    fn semver_comparison() {
        assert!(Operator::GreaterThan.eval(Some(&"1.13.0".into()), &"1.5.0".into()));
        assert!(!Operator::GreaterThan.eval(Some(&"1.2.0".into()), &"1.10.0".into()));
        assert!(Operator::LessThan.eval(Some(&"0.9.9".into()), &"1.0.0".into()));
        assert!(!Operator::LessThan.eval(Some(&"1.0.0".into()), &"1.0.0".into()));
    }

    #[test]
    fn matches_regex() {
        assert!(Operator::Matches.eval(Some(&"test@example.com".into()), &"^test.*".into()));
        assert!(!Operator::Matches.eval(Some(&"example@test.com".into()), &"^test.*".into()));
        assert!(Operator::NotMatches.eval(Some(&"example@test.com".into()), &"^test.*".into()));
        assert!(!Operator::Matches.eval(Some(&"test".into()), &"(unclosed".into()));
    }

    #[test]
    fn empty_targeting_admits_everyone() {
        assert!(Targeting::default().is_empty());
        assert!(Targeting::default().eval(&context()));
        assert!(Targeting::default().eval(&UserContext::new("", "")));
    }

    #[test]
    fn device_list() {
        let targeting = Targeting::default().with_devices([Device::Desktop, Device::Tablet]);
        assert!(!targeting.eval(&context()));
        assert!(targeting.eval(&context().with_device(Device::Tablet)));
    }

    #[test]
    fn country_and_browser_lists() {
        let targeting = Targeting::default()
            .with_countries(["us", "CA"])
            .with_browsers(["chrome", "firefox"]);
        assert!(targeting.eval(&context()));
        assert!(!targeting.eval(&context().with_country("DE")));
        assert!(!targeting.eval(&context().with_browser("Safari")));

        // list is set but the context has no country
        let mut no_country = context();
        no_country.country = None;
        assert!(!targeting.eval(&no_country));
    }

    #[test]
    fn custom_rules_are_combined_with_and() {
        let targeting = Targeting::default()
            .with_rule(TargetingRule::new(
                "custom.plan",
                Operator::In,
                vec!["lab-pro", "lab-enterprise"],
            ))
            .with_rule(TargetingRule::new(
                "custom.orders",
                Operator::GreaterThan,
                2.0,
            ));
        assert!(targeting.eval(&context()));
        assert!(!targeting.eval(&context().with_custom_property("orders", 1.0)));
        assert!(!targeting.eval(&context().with_custom_property("plan", "hobby")));
    }

    #[test]
    fn rules_on_context_fields() {
        let targeting =
            Targeting::default().with_rule(TargetingRule::new("country", Operator::Equals, "US"));
        assert!(targeting.eval(&context()));

        let targeting = Targeting::default().with_rule(TargetingRule::new(
            "custom.app_version",
            Operator::GreaterThan,
            "2.9.0",
        ));
        assert!(targeting.eval(&context()));
    }

    #[test]
    fn unknown_property_fails() {
        let targeting = Targeting::default().with_rule(TargetingRule::new(
            "plan",
            Operator::NotEquals,
            "hobby",
        ));
        assert!(!targeting.eval(&context()));
    }

    #[test]
    fn parses_targeting_json() {
        let targeting: Targeting = serde_json::from_str(
            r#"{
                "devices": ["mobile", "tablet"],
                "countries": ["US"],
                "customRules": [
                    {"property": "custom.plan", "operator": "not_in", "value": ["hobby"]},
                    {"property": "custom.newsletter", "operator": "equals", "value": true}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(targeting.devices, vec![Device::Mobile, Device::Tablet]);
        assert_eq!(targeting.custom_rules[0].operator, Operator::NotIn);
        assert!(targeting.eval(&context()));
    }
}
