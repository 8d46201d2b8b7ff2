use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::DynamicValue;

/// Custom attributes of a user.
pub type Attributes = BTreeMap<String, DynamicValue>;

/// The subject of an evaluation.
///
/// `private_attributes` take part in evaluation but are stripped from every copy of the user that
/// leaves the process (exposure events, client snapshots).
///
/// # Examples
/// ```
/// # use featuregate::User;
/// let user = User::with_user_id("a-user")
///     .with_custom_id("companyID", "acme")
///     .with_custom("plan", "pro")
///     .with_environment_tier("staging");
/// assert_eq!(user.get_unit_id("companyID"), Some("acme"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: Attributes,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub private_attributes: Attributes,
    #[serde(rename = "customIDs", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_ids: BTreeMap<String, String>,
    /// Environment tags, e.g. `{"tier": "production"}`.
    #[serde(rename = "statsigEnvironment", default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
}

impl User {
    pub fn with_user_id(user_id: impl Into<String>) -> User {
        User {
            user_id: Some(user_id.into()),
            ..User::default()
        }
    }

    pub fn with_custom_id(mut self, id_type: impl Into<String>, id: impl Into<String>) -> User {
        self.custom_ids.insert(id_type.into(), id.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<DynamicValue>) -> User {
        self.custom.insert(key.into(), value.into());
        self
    }

    pub fn with_private_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<DynamicValue>,
    ) -> User {
        self.private_attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_environment_tier(mut self, tier: impl Into<String>) -> User {
        self.environment
            .get_or_insert_with(BTreeMap::new)
            .insert("tier".to_owned(), tier.into());
        self
    }

    /// Resolve the unit id used for hashing under the given id type. `userID` (any case) maps to
    /// the primary id; anything else is looked up in custom ids, exact match first.
    pub fn get_unit_id(&self, id_type: &str) -> Option<&str> {
        if id_type.is_empty() || id_type.eq_ignore_ascii_case("userid") {
            return self.user_id.as_deref();
        }
        self.custom_ids
            .get(id_type)
            .or_else(|| {
                self.custom_ids
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(id_type))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }

    /// Look up a user field by name: top-level fields first, then custom, then private attributes.
    pub fn get_field(&self, field: &str) -> Option<DynamicValue> {
        let top_level = match field.to_ascii_lowercase().as_str() {
            "userid" | "user_id" => self.user_id.as_deref(),
            "email" => self.email.as_deref(),
            "ip" | "ipaddress" | "ip_address" => self.ip.as_deref(),
            "useragent" | "user_agent" => self.user_agent.as_deref(),
            "country" => self.country.as_deref(),
            "locale" => self.locale.as_deref(),
            "appversion" | "app_version" => self.app_version.as_deref(),
            _ => None,
        };
        if let Some(value) = top_level {
            return Some(DynamicValue::from(value));
        }

        lookup(&self.custom, field).or_else(|| lookup(&self.private_attributes, field))
    }

    /// Look up an environment tag (case-insensitive key).
    pub fn get_environment_field(&self, field: &str) -> Option<&str> {
        let env = self.environment.as_ref()?;
        env.get(field)
            .or_else(|| {
                env.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(field))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }

    /// Copy of the user safe to log: private attributes are dropped.
    pub fn to_loggable(&self) -> User {
        User {
            private_attributes: Attributes::new(),
            ..self.clone()
        }
    }

    /// Copy of the user with the environment set, unless the user already carries one.
    pub(crate) fn with_default_environment(&self, tier: Option<&str>) -> User {
        let mut user = self.clone();
        if let (None, Some(tier)) = (&user.environment, tier) {
            user = user.with_environment_tier(tier);
        }
        user
    }
}

fn lookup(attributes: &Attributes, field: &str) -> Option<DynamicValue> {
    attributes
        .get(field)
        .or_else(|| {
            attributes
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(field))
                .map(|(_, v)| v)
        })
        .cloned()
}

impl From<&str> for User {
    fn from(user_id: &str) -> Self {
        User::with_user_id(user_id)
    }
}
