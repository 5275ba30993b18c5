// crates/drudge-core/src/descriptor.rs
//
// Runtime description of an RPC method: its kind, HTTP binding rule, request
// validator and the request fields copied into log tags.

use std::fmt;
use std::sync::Arc;

use http::Method;
use serde::Serialize;
use serde_json::Value;

use crate::error::DrudgeError;

/// Unary or server-streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    Unary,
    ServerStreaming,
}

impl MethodKind {
    /// Label value used in metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodKind::Unary => "unary",
            MethodKind::ServerStreaming => "server_stream",
        }
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which part of the HTTP request becomes the request message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyRule {
    /// Body ignored; query parameters are bound instead.
    None,
    /// The whole JSON body is the request message (`body: "*"`).
    All,
}

/// HTTP binding of an RPC method, e.g. `GET /v1/users/{id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRule {
    method: Method,
    template: String,
    body: BodyRule,
}

impl HttpRule {
    pub fn new(method: Method, template: impl Into<String>, body: BodyRule) -> Self {
        Self {
            method,
            template: template.into(),
            body,
        }
    }

    pub fn get(template: impl Into<String>) -> Self {
        Self::new(Method::GET, template, BodyRule::None)
    }

    pub fn delete(template: impl Into<String>) -> Self {
        Self::new(Method::DELETE, template, BodyRule::None)
    }

    pub fn post(template: impl Into<String>) -> Self {
        Self::new(Method::POST, template, BodyRule::All)
    }

    pub fn put(template: impl Into<String>) -> Self {
        Self::new(Method::PUT, template, BodyRule::All)
    }

    pub fn patch(template: impl Into<String>) -> Self {
        Self::new(Method::PATCH, template, BodyRule::All)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn body(&self) -> BodyRule {
        self.body
    }

    /// Names of the `{field}` segments, in template order.
    pub fn path_params(&self) -> Result<Vec<String>, DrudgeError> {
        self.segments()?
            .into_iter()
            .filter_map(|segment| match segment {
                Segment::Param(name) => Some(Ok(name)),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// The template rewritten with `:field` captures for the HTTP router.
    pub fn router_path(&self) -> Result<String, DrudgeError> {
        let segments = self.segments()?;
        if segments.is_empty() {
            return Ok("/".to_string());
        }
        let mut path = String::new();
        for segment in segments {
            path.push('/');
            match segment {
                Segment::Literal(lit) => path.push_str(&lit),
                Segment::Param(name) => {
                    path.push(':');
                    path.push_str(&name);
                }
            }
        }
        Ok(path)
    }

    /// Check the template is well formed.
    pub fn validate(&self) -> Result<(), DrudgeError> {
        let params = self.path_params()?;
        for (i, name) in params.iter().enumerate() {
            if params[..i].contains(name) {
                return Err(self.invalid(format!("parameter '{name}' appears twice")));
            }
        }
        Ok(())
    }

    fn segments(&self) -> Result<Vec<Segment>, DrudgeError> {
        let rest = self
            .template
            .strip_prefix('/')
            .ok_or_else(|| self.invalid("template must start with '/'".to_string()))?;
        if rest.is_empty() {
            return Ok(Vec::new());
        }
        rest.split('/')
            .map(|raw| {
                if raw.is_empty() {
                    return Err(self.invalid("empty path segment".to_string()));
                }
                match raw.strip_prefix('{') {
                    Some(inner) => {
                        let name = inner
                            .strip_suffix('}')
                            .ok_or_else(|| self.invalid(format!("unclosed parameter '{raw}'")))?;
                        let valid = !name.is_empty()
                            && name
                                .chars()
                                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
                        if !valid {
                            return Err(self.invalid(format!("bad parameter name '{name}'")));
                        }
                        Ok(Segment::Param(name.to_string()))
                    }
                    None if raw.contains(['{', '}', ':', '*']) => {
                        Err(self.invalid(format!("unsupported segment '{raw}'")))
                    }
                    None => Ok(Segment::Literal(raw.to_string())),
                }
            })
            .collect()
    }

    fn invalid(&self, reason: String) -> DrudgeError {
        DrudgeError::InvalidRoute {
            template: self.template.clone(),
            reason,
        }
    }
}

impl fmt::Display for HttpRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.template)
    }
}

enum Segment {
    Literal(String),
    Param(String),
}

/// Type-erased request check, run by the validation interceptor before the
/// handler sees the message.
pub type RequestValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Implemented by request types that carry their own field checks.
pub trait Validate {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl Validate for Value {}

/// Everything the runtime knows about one RPC method.
#[derive(Clone)]
pub struct MethodDescriptor {
    service: String,
    name: String,
    kind: MethodKind,
    rule: Option<HttpRule>,
    log_fields: Vec<String>,
    validator: Option<RequestValidator>,
}

impl MethodDescriptor {
    pub fn new(service: impl Into<String>, name: impl Into<String>, kind: MethodKind) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
            kind,
            rule: None,
            log_fields: Vec::new(),
            validator: None,
        }
    }

    pub fn with_rule(mut self, rule: Option<HttpRule>) -> Self {
        self.rule = rule;
        self
    }

    pub fn with_log_fields(mut self, fields: Vec<String>) -> Self {
        self.log_fields = fields;
        self
    }

    pub fn with_validator(mut self, validator: RequestValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn rule(&self) -> Option<&HttpRule> {
        self.rule.as_ref()
    }

    pub fn log_fields(&self) -> &[String] {
        &self.log_fields
    }

    /// RPC path, `/{service}/{method}`.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.name)
    }

    pub fn validate(&self, request: &Value) -> Result<(), String> {
        match &self.validator {
            Some(check) => check(request),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("service", &self.service)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("rule", &self.rule)
            .field("log_fields", &self.log_fields)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}
