use std::{collections::HashMap, fmt};

use chrono::Utc;
use derive_more::From;
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

use crate::storage::KeyValueStorage;

/// Storage key holding the long-lived anonymous user id.
pub const USER_ID_KEY: &str = "ab_test_user_id";

/// Custom user properties available to targeting rules as `custom.<name>`.
///
/// # Examples
/// ```
/// # use splitkit::{Attributes, AttributeValue};
/// let attributes = [
///     ("plan".to_owned(), "lab-pro".into()),
///     ("orders".to_owned(), 3.0.into()),
///     ("newsletter".to_owned(), true.into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, AttributeValue>;

/// Value of a user property.
#[derive(Debug, Serialize, Deserialize, PartialEq, PartialOrd, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A null value or absence of value.
    Null,
}

impl AttributeValue {
    /// Returns the string if the value is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Textual form used for string comparisons. `Null` has none.
    pub(crate) fn to_plain_string(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) => Some(s.clone()),
            AttributeValue::Number(n) => Some(n.to_string()),
            AttributeValue::Boolean(b) => Some(b.to_string()),
            AttributeValue::Null => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// Device class of the visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[allow(missing_docs)]
    #[default]
    Desktop,
    #[allow(missing_docs)]
    Mobile,
    #[allow(missing_docs)]
    Tablet,
}

impl Device {
    /// Lowercase name, as used in targeting rules.
    pub fn as_str(self) -> &'static str {
        match self {
            Device::Desktop => "desktop",
            Device::Mobile => "mobile",
            Device::Tablet => "tablet",
        }
    }

    /// Best-effort classification of a `User-Agent` header.
    pub fn from_user_agent(user_agent: &str) -> Device {
        let ua = user_agent.to_ascii_lowercase();
        let android_tablet = ua.contains("android") && !ua.contains("mobile");
        if ua.contains("ipad") || ua.contains("tablet") || android_tablet {
            Device::Tablet
        } else if ua.contains("mobi") || ua.contains("iphone") || ua.contains("android") {
            Device::Mobile
        } else {
            Device::Desktop
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the engine knows about the current visitor.
///
/// The engine only reads the context. To change it (e.g., after login), build a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    /// Long-lived user id. Assignments are sticky per user id.
    pub user_id: String,
    /// Id of the current browsing session.
    pub session_id: String,
    #[allow(missing_docs)]
    #[serde(default)]
    pub device: Device,
    #[allow(missing_docs)]
    #[serde(default)]
    pub browser: Option<String>,
    /// Country code, e.g. `"US"`.
    #[serde(default)]
    pub country: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Free-form properties addressable as `custom.<name>` in targeting rules.
    #[serde(default)]
    pub custom_properties: Attributes,
}

impl UserContext {
    /// Create a desktop context with no optional fields set.
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> UserContext {
        UserContext {
            user_id: user_id.into(),
            session_id: session_id.into(),
            device: Device::default(),
            browser: None,
            country: None,
            user_agent: None,
            custom_properties: Attributes::new(),
        }
    }

    /// Create a context for the user persisted in `storage` (creating one if needed) with a fresh
    /// session id.
    pub fn from_storage(storage: &dyn KeyValueStorage) -> UserContext {
        UserContext::new(load_or_create_user_id(storage), generate_session_id())
    }

    #[allow(missing_docs)]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    #[allow(missing_docs)]
    pub fn with_browser(mut self, browser: impl Into<String>) -> Self {
        self.browser = Some(browser.into());
        self
    }

    #[allow(missing_docs)]
    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    /// Set the user agent and derive [`Device`] from it.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        let user_agent = user_agent.into();
        self.device = Device::from_user_agent(&user_agent);
        self.user_agent = Some(user_agent);
        self
    }

    #[allow(missing_docs)]
    pub fn with_custom_property(
        mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.custom_properties.insert(name.into(), value.into());
        self
    }

    /// Resolve a targeting property against this context.
    ///
    /// Returns `None` for unset fields, unknown property names, and `Null` custom values.
    pub fn resolve(&self, property: &PropertyRef) -> Option<AttributeValue> {
        let value = match property {
            PropertyRef::Context(field) => self.field(*field)?,
            PropertyRef::Custom(name) => self.custom_properties.get(name)?.clone(),
            PropertyRef::Unknown(_) => return None,
        };
        (value != AttributeValue::Null).then_some(value)
    }

    fn field(&self, field: ContextField) -> Option<AttributeValue> {
        let value = match field {
            ContextField::UserId => self.user_id.as_str(),
            ContextField::SessionId => self.session_id.as_str(),
            ContextField::Device => self.device.as_str(),
            ContextField::Browser => self.browser.as_deref()?,
            ContextField::Country => self.country.as_deref()?,
            ContextField::UserAgent => self.user_agent.as_deref()?,
        };
        Some(value.into())
    }
}

/// Context fields that targeting rules may reference by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ContextField {
    UserId,
    SessionId,
    Device,
    Browser,
    Country,
    UserAgent,
}

impl ContextField {
    /// Name used in serialized rules.
    pub fn name(self) -> &'static str {
        match self {
            ContextField::UserId => "userId",
            ContextField::SessionId => "sessionId",
            ContextField::Device => "device",
            ContextField::Browser => "browser",
            ContextField::Country => "country",
            ContextField::UserAgent => "userAgent",
        }
    }

    fn from_name(name: &str) -> Option<ContextField> {
        Some(match name {
            "userId" | "user_id" => ContextField::UserId,
            "sessionId" | "session_id" => ContextField::SessionId,
            "device" => ContextField::Device,
            "browser" => ContextField::Browser,
            "country" => ContextField::Country,
            "userAgent" | "user_agent" => ContextField::UserAgent,
            _ => return None,
        })
    }
}

/// Property referenced by a targeting rule.
///
/// Serialized as a plain string: a context field name (`"country"`) or `"custom.<name>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PropertyRef {
    /// One of the whitelisted [`UserContext`] fields.
    Context(ContextField),
    /// Entry of [`UserContext::custom_properties`].
    Custom(String),
    /// Anything else. Never resolves to a value.
    Unknown(String),
}

impl From<&str> for PropertyRef {
    fn from(value: &str) -> Self {
        if let Some(name) = value.strip_prefix("custom.") {
            PropertyRef::Custom(name.to_owned())
        } else if let Some(field) = ContextField::from_name(value) {
            PropertyRef::Context(field)
        } else {
            PropertyRef::Unknown(value.to_owned())
        }
    }
}

impl From<String> for PropertyRef {
    fn from(value: String) -> Self {
        PropertyRef::from(value.as_str())
    }
}

impl From<PropertyRef> for String {
    fn from(value: PropertyRef) -> Self {
        match value {
            PropertyRef::Context(field) => field.name().to_owned(),
            PropertyRef::Custom(name) => format!("custom.{name}"),
            PropertyRef::Unknown(name) => name,
        }
    }
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

/// Generate a new anonymous user id, e.g. `anon_1718000000000_k3j9x0a1b`.
pub fn generate_user_id() -> String {
    format!("anon_{}_{}", Utc::now().timestamp_millis(), random_suffix())
}

/// Generate a new session id.
pub fn generate_session_id() -> String {
    format!("sess_{}_{}", Utc::now().timestamp_millis(), random_suffix())
}

/// Generate an id for an analytics event.
pub(crate) fn generate_event_id() -> String {
    format!("evt_{}_{}", Utc::now().timestamp_millis(), random_suffix())
}

/// Read the persisted user id or create (and persist) a new anonymous one.
///
/// Storage failures are logged and result in a fresh, unpersisted id.
pub fn load_or_create_user_id(storage: &dyn KeyValueStorage) -> String {
    match storage.get(USER_ID_KEY) {
        Ok(Some(user_id)) if !user_id.trim().is_empty() => return user_id.trim().to_owned(),
        Ok(_) => {}
        Err(err) => {
            log::warn!(target: "splitkit", "failed to read user id from storage: {err}");
        }
    }

    let user_id = generate_user_id();
    if let Err(err) = storage.set(USER_ID_KEY, &user_id) {
        log::warn!(target: "splitkit", "failed to persist user id: {err}");
    }
    user_id
}
