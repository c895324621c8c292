use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::CoreError;
use crate::id::{RouteId, UserId};
use crate::slug::Slug;

/// An operator-authored (or generated) request handler bound to a slug.
///
/// Routes are created in [`RouteStatus::Draft`] and only dispatched while
/// [`RouteStatus::Active`]. `execution_count` and `last_executed_at` are
/// owned by the execution logger and survive redeployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub id: RouteId,
    pub kind: RouteKind,
    pub name: String,
    pub slug: Slug,
    pub http_method: HttpMethod,
    pub description: String,
    pub source_code: String,
    pub declared_dependencies: Vec<String>,
    pub installed_dependencies: Vec<String>,
    pub status: RouteStatus,
    pub auth_required: bool,
    pub plan_access_tier: PlanAccessTier,
    pub rate_limit_per_day: Option<u32>,
    pub execution_count: u64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Route {
    /// Builds a fresh draft route from a validated spec.
    ///
    /// # Errors
    /// Returns a [`CoreError`] if the slug, name, dependencies, or rate limit
    /// are invalid.
    pub fn from_spec(spec: RouteSpec, now: DateTime<Utc>) -> Result<Self, CoreError> {
        let name = spec.name.trim().to_owned();
        if name.is_empty() {
            return Err(CoreError::Validation {
                field: "name".to_owned(),
                reason: "must not be empty".to_owned(),
            });
        }
        let slug = Slug::normalize(spec.slug.as_deref().unwrap_or(&name))?;
        validate_rate_limit(spec.rate_limit_per_day)?;
        for dep in &spec.dependencies {
            DependencySpec::parse(dep)?;
        }
        Ok(Self {
            id: RouteId::new(),
            kind: spec.kind,
            name,
            slug,
            http_method: spec.http_method,
            description: spec.description,
            source_code: spec.source_code,
            declared_dependencies: spec.dependencies,
            installed_dependencies: Vec::new(),
            status: spec.status.unwrap_or(RouteStatus::Draft),
            auth_required: spec.auth_required,
            plan_access_tier: spec.plan_access_tier,
            rate_limit_per_day: spec.rate_limit_per_day,
            execution_count: 0,
            last_executed_at: None,
            created_by: spec.created_by,
            created_at: now,
            updated_at: now,
        })
    }

    /// Whether a caller identity must be resolved before dispatch.
    ///
    /// Any non-public tier implies authentication, whatever `auth_required`
    /// says.
    #[must_use]
    pub fn requires_identity(&self) -> bool {
        self.auth_required || self.plan_access_tier != PlanAccessTier::Public
    }

    /// Whether the route may be dispatched at all.
    #[must_use]
    pub fn is_dispatchable(&self) -> bool {
        self.status == RouteStatus::Active
    }

    /// Applies a partial update in place. Counters are never touched.
    ///
    /// # Errors
    /// Returns a [`CoreError`] if any patched field is invalid. On error the
    /// route is left unchanged.
    pub fn apply_patch(&mut self, patch: RoutePatch, now: DateTime<Utc>) -> Result<(), CoreError> {
        let slug = patch.slug.as_deref().map(Slug::normalize).transpose()?;
        if let Some(name) = &patch.name {
            if name.trim().is_empty() {
                return Err(CoreError::Validation {
                    field: "name".to_owned(),
                    reason: "must not be empty".to_owned(),
                });
            }
        }
        if let Some(limit) = patch.rate_limit_per_day {
            validate_rate_limit(limit)?;
        }
        if let Some(deps) = &patch.dependencies {
            for dep in deps {
                DependencySpec::parse(dep)?;
            }
        }

        if let Some(name) = patch.name {
            self.name = name.trim().to_owned();
        }
        if let Some(slug) = slug {
            self.slug = slug;
        }
        if let Some(method) = patch.http_method {
            self.http_method = method;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(source) = patch.source_code {
            self.source_code = source;
        }
        if let Some(deps) = patch.dependencies {
            self.installed_dependencies.retain(|installed| deps.contains(installed));
            self.declared_dependencies = deps;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(auth) = patch.auth_required {
            self.auth_required = auth;
        }
        if let Some(tier) = patch.plan_access_tier {
            self.plan_access_tier = tier;
        }
        if let Some(limit) = patch.rate_limit_per_day {
            self.rate_limit_per_day = limit;
        }
        self.updated_at = now;
        Ok(())
    }
}

fn validate_rate_limit(limit: Option<u32>) -> Result<(), CoreError> {
    if limit == Some(0) {
        return Err(CoreError::Validation {
            field: "rateLimitPerDay".to_owned(),
            reason: "must be at least 1 when set".to_owned(),
        });
    }
    Ok(())
}

/// Which dispatch surface a route belongs to.
///
/// Slugs are unique per kind, so `custom/echo` and `logic/echo` may coexist.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    /// Ad-hoc routes served under `/api/custom/{slug}`.
    #[default]
    Custom,
    /// Structured logic pages served under `/api/logic/{slug}`.
    Logic,
}

impl RouteKind {
    /// Stable lower-case name used in storage and URLs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Custom => "custom",
            Self::Logic => "logic",
        }
    }

    /// URL prefix the kind is dispatched under.
    #[must_use]
    pub fn path_prefix(self) -> &'static str {
        match self {
            Self::Custom => "/api/custom/",
            Self::Logic => "/api/logic/",
        }
    }
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RouteKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "custom" => Ok(Self::Custom),
            "logic" => Ok(Self::Logic),
            other => Err(CoreError::Validation {
                field: "kind".to_owned(),
                reason: format!("unknown route kind '{other}'"),
            }),
        }
    }
}

/// The HTTP methods a route may bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    /// Upper-case wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = CoreError;

    /// Parses a method name case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "PATCH" => Ok(Self::Patch),
            _ => Err(CoreError::InvalidMethod(s.to_owned())),
        }
    }
}

impl<'de> Deserialize<'de> for HttpMethod {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Lifecycle state of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Draft,
    Active,
    Inactive,
}

impl RouteStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl FromStr for RouteStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(CoreError::Validation {
                field: "status".to_owned(),
                reason: format!("unknown status '{other}'"),
            }),
        }
    }
}

/// Subscription gate applied by the access control layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAccessTier {
    /// Anyone, authenticated or not (unless `auth_required` is set).
    #[default]
    Public,
    /// Any authenticated user, whatever their plan.
    AnySubscriber,
    /// Authenticated users whose plan is not the default/free plan.
    PaidOnly,
}

impl PlanAccessTier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::AnySubscriber => "any_subscriber",
            Self::PaidOnly => "paid_only",
        }
    }
}

impl FromStr for PlanAccessTier {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "any_subscriber" => Ok(Self::AnySubscriber),
            "paid_only" => Ok(Self::PaidOnly),
            other => Err(CoreError::Validation {
                field: "planAccessTier".to_owned(),
                reason: format!("unknown tier '{other}'"),
            }),
        }
    }
}

/// A parsed dependency declaration: `name` or `name@version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencySpec {
    pub name: String,
    pub version: Option<String>,
}

impl DependencySpec {
    /// Parses a declared dependency string.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidDependency`] if the name is empty, contains
    /// characters outside `[a-z0-9_-]`, or the version is empty or contains
    /// path separators.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let invalid = |reason: &str| CoreError::InvalidDependency {
            raw: raw.to_owned(),
            reason: reason.to_owned(),
        };
        let (name, version) = match raw.trim().split_once('@') {
            Some((n, v)) => (n, Some(v)),
            None => (raw.trim(), None),
        };
        if name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(invalid("name must match [a-z0-9_-]+"));
        }
        if let Some(v) = version {
            if v.is_empty() {
                return Err(invalid("version must not be empty"));
            }
            if !v.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+')) {
                return Err(invalid("version must match [A-Za-z0-9.+-]+"));
            }
        }
        Ok(Self { name: name.to_owned(), version: version.map(str::to_owned) })
    }
}

impl fmt::Display for DependencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}@{v}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Input to route registration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    #[serde(default)]
    pub kind: RouteKind,
    pub name: String,
    /// Defaults to the normalized name.
    #[serde(default)]
    pub slug: Option<String>,
    pub http_method: HttpMethod,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source_code: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Defaults to [`RouteStatus::Draft`].
    #[serde(default)]
    pub status: Option<RouteStatus>,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub plan_access_tier: PlanAccessTier,
    #[serde(default)]
    pub rate_limit_per_day: Option<u32>,
    #[serde(default)]
    pub created_by: Option<UserId>,
}

/// Partial replacement of route fields.
///
/// `rate_limit_per_day` distinguishes "absent" (`None`) from an explicit
/// JSON `null` (`Some(None)`), which clears the limit.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePatch {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub http_method: Option<HttpMethod>,
    pub description: Option<String>,
    pub source_code: Option<String>,
    pub dependencies: Option<Vec<String>>,
    pub status: Option<RouteStatus>,
    pub auth_required: Option<bool>,
    pub plan_access_tier: Option<PlanAccessTier>,
    #[serde(default, deserialize_with = "double_option")]
    pub rate_limit_per_day: Option<Option<u32>>,
}

fn double_option<'de, D>(deserializer: D) -> Result<Option<Option<u32>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<u32>::deserialize(deserializer).map(Some)
}
