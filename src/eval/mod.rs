//! Rule evaluation.
//!
//! Evaluation is a pure function of an [`EvalContext`] (user, store snapshot, persisted values and
//! the current time) and a spec. It never touches the network and never fails: malformed rules
//! surface as an `unsupported` result carrying the spec's default value.
use std::sync::Arc;

mod cmab;
mod conditions;
mod evaluator;
mod overrides;
mod result;

pub use cmab::evaluate_cmab;
pub use evaluator::{evaluate, EvalContext, MAX_DEPTH};
pub use overrides::LocalOverrides;
pub use result::{rule_ids, DerivedDeviceMetadata, EvalResult, SecondaryExposure};

/// Fields extracted from a user agent string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedUserAgent {
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub browser_name: Option<String>,
    pub browser_version: Option<String>,
}

/// Parses user agent strings for `ua_based` conditions.
pub trait UserAgentParser: Send + Sync {
    fn parse(&self, user_agent: &str) -> Option<ParsedUserAgent>;
}

/// Resolves an ip address to an ISO country code for `ip_based` conditions.
pub trait CountryLookup: Send + Sync {
    fn lookup(&self, ip: &str) -> Option<String>;
}

/// Pluggable device metadata sources. Without them, `ua_based` and `ip_based` conditions only
/// see fields the user sets explicitly.
#[derive(Clone, Default)]
pub struct MetadataProviders {
    pub user_agent_parser: Option<Arc<dyn UserAgentParser>>,
    pub country_lookup: Option<Arc<dyn CountryLookup>>,
}

impl std::fmt::Debug for MetadataProviders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataProviders")
            .field("user_agent_parser", &self.user_agent_parser.is_some())
            .field("country_lookup", &self.country_lookup.is_some())
            .finish()
    }
}
