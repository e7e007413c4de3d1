//! Parameter resolution.
//!
//! Turns a step's raw parameter map into a fully concrete map by
//! substituting `${variable.NAME}` and `{{ credential.NAME.field }}`
//! markers, applying credential autofill and declared defaults, and
//! checking `file`-typed parameters against the playbook base directory.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use serde_json::Value;

use crate::credentials::{Credential, CredentialLookup};
use crate::error::ResolutionError;
use crate::playbook::{ParamType, ParameterSpec};

/// Everything a single resolution pass needs from the run.
pub struct ResolveContext<'a> {
    /// Run-scoped variable store.
    pub variables: &'a HashMap<String, Value>,

    /// Playbook-declared parameters, for defaults and required checks.
    pub specs: &'a [ParameterSpec],

    /// Injected credential lookup.
    pub credentials: &'a dyn CredentialLookup,

    /// Base directory for `file`-typed parameters.
    pub base_dir: Option<&'a Path>,
}

/// Resolves template markers in step parameters.
pub struct ParameterResolver {
    marker_re: Regex,
    credential_re: Regex,
}

impl ParameterResolver {
    pub fn new() -> Self {
        Self {
            // ${variable.NAME} plus any other ${...} marker, so unknown
            // namespaces fail loudly instead of passing through.
            marker_re: Regex::new(r"\$\{\s*([A-Za-z0-9_.\-]+)\s*\}").expect("valid marker regex"),
            credential_re: Regex::new(
                r"\{\{\s*credential\.([A-Za-z0-9_\-]+)\.([A-Za-z_]+)\s*\}\}",
            )
            .expect("valid credential regex"),
        }
    }

    /// Resolve a raw parameter map into a concrete one.
    ///
    /// Deterministic for a fixed variable store and credential set:
    /// resolving the same input twice yields identical output.
    pub async fn resolve(
        &self,
        raw: &HashMap<String, Value>,
        ctx: &ResolveContext<'_>,
    ) -> Result<HashMap<String, Value>, ResolutionError> {
        // Credential lookups are async; collect every referenced name up
        // front so substitution itself stays synchronous and pure.
        let mut names = HashSet::new();
        for value in raw.values() {
            self.collect_credential_names(value, &mut names);
        }

        let mut credentials = HashMap::new();
        for name in names {
            match ctx.credentials.lookup(&name).await {
                Some(credential) => {
                    credentials.insert(name, credential);
                }
                None => return Err(ResolutionError::UnknownCredential(name)),
            }
        }

        let mut resolved = HashMap::with_capacity(raw.len());
        for (key, value) in raw {
            let mut value = self.substitute_value(value, ctx, &credentials)?;

            if let Some(spec) = ctx.specs.iter().find(|s| s.name == *key) {
                if spec.param_type == ParamType::File {
                    value = Value::String(self.resolve_file_path(&value, ctx.base_dir)?);
                }
            }

            resolved.insert(key.clone(), value);
        }

        Ok(resolved)
    }

    /// Substitute `${variable.NAME}` markers in a standalone string.
    ///
    /// Used by condition evaluation, where no credential context applies.
    pub fn substitute_variables(
        &self,
        input: &str,
        variables: &HashMap<String, Value>,
    ) -> Result<Value, ResolutionError> {
        let ctx = ResolveContext {
            variables,
            specs: &[],
            credentials: &NO_CREDENTIALS,
            base_dir: None,
        };
        self.substitute_string(input, &ctx, &HashMap::new())
    }

    /// Merge credential autofill and declared defaults into the caller's
    /// run parameters. Caller-supplied values are never overwritten.
    ///
    /// Autofill order: credential-typed parameters get the credential
    /// name, `gateway_url`/`url` parameters get the credential URL, then
    /// username/password-named parameters get the account fields.
    pub fn autofill_run_parameters(
        &self,
        caller: &HashMap<String, Value>,
        specs: &[ParameterSpec],
        credential: Option<&Credential>,
    ) -> HashMap<String, Value> {
        let mut merged = caller.clone();

        if let Some(credential) = credential {
            for spec in specs {
                if merged.contains_key(&spec.name) {
                    continue;
                }
                if spec.param_type == ParamType::Credential {
                    merged.insert(spec.name.clone(), Value::String(credential.name.clone()));
                }
            }
            for spec in specs {
                if merged.contains_key(&spec.name) {
                    continue;
                }
                let filled = match spec.name.as_str() {
                    "gateway_url" | "url" => credential.gateway_url.clone(),
                    "username" | "user" => Some(credential.username.clone()),
                    "password" | "pass" => Some(credential.password.clone()),
                    _ => None,
                };
                if let Some(value) = filled {
                    merged.insert(spec.name.clone(), Value::String(value));
                }
            }
        }

        for spec in specs {
            if let Some(default) = &spec.default {
                merged
                    .entry(spec.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }

        merged
    }

    fn collect_credential_names(&self, value: &Value, names: &mut HashSet<String>) {
        match value {
            Value::String(s) => {
                for caps in self.credential_re.captures_iter(s) {
                    names.insert(caps[1].to_string());
                }
            }
            Value::Object(map) => {
                for v in map.values() {
                    self.collect_credential_names(v, names);
                }
            }
            Value::Array(items) => {
                for v in items {
                    self.collect_credential_names(v, names);
                }
            }
            _ => {}
        }
    }

    fn substitute_value(
        &self,
        value: &Value,
        ctx: &ResolveContext<'_>,
        credentials: &HashMap<String, Credential>,
    ) -> Result<Value, ResolutionError> {
        match value {
            Value::String(s) => self.substitute_string(s, ctx, credentials),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.substitute_value(v, ctx, credentials)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => {
                let out: Result<Vec<_>, _> = items
                    .iter()
                    .map(|v| self.substitute_value(v, ctx, credentials))
                    .collect();
                Ok(Value::Array(out?))
            }
            // Non-string scalars pass through untouched.
            _ => Ok(value.clone()),
        }
    }

    fn substitute_string(
        &self,
        input: &str,
        ctx: &ResolveContext<'_>,
        credentials: &HashMap<String, Credential>,
    ) -> Result<Value, ResolutionError> {
        // A value that is exactly one variable marker keeps the stored
        // JSON type instead of stringifying.
        if let Some(caps) = self.marker_re.captures(input.trim()) {
            if caps.get(0).map(|m| m.as_str()) == Some(input.trim()) {
                let inner = &caps[1];
                if let Some(name) = inner.strip_prefix("variable.") {
                    return match ctx.variables.get(name) {
                        Some(value) => Ok(value.clone()),
                        None => Err(self.missing_variable(name, ctx)),
                    };
                }
            }
        }

        let mut out = String::new();
        let mut last = 0;
        for caps in self.marker_re.captures_iter(input) {
            let whole = caps.get(0).expect("marker match");
            out.push_str(&input[last..whole.start()]);

            let inner = &caps[1];
            let name = inner
                .strip_prefix("variable.")
                .ok_or_else(|| ResolutionError::UnresolvedTemplate(inner.to_string()))?;
            let value = ctx
                .variables
                .get(name)
                .ok_or_else(|| self.missing_variable(name, ctx))?;
            out.push_str(&stringify(value));
            last = whole.end();
        }
        out.push_str(&input[last..]);

        // Credential markers always stringify.
        let mut result = String::new();
        let mut last = 0;
        for caps in self.credential_re.captures_iter(&out) {
            let whole = caps.get(0).expect("credential match");
            result.push_str(&out[last..whole.start()]);

            let (name, field) = (&caps[1], &caps[2]);
            let credential = credentials
                .get(name)
                .ok_or_else(|| ResolutionError::UnknownCredential(name.to_string()))?;
            let value = credential.field(field).ok_or_else(|| {
                ResolutionError::UnresolvedTemplate(format!("credential.{name}.{field}"))
            })?;
            result.push_str(&value);
            last = whole.end();
        }
        result.push_str(&out[last..]);

        Ok(Value::String(result))
    }

    fn missing_variable(&self, name: &str, ctx: &ResolveContext<'_>) -> ResolutionError {
        // A declared required parameter that was never supplied surfaces
        // as MissingRequired at the first step that references it.
        if ctx.specs.iter().any(|s| s.name == name && s.required) {
            ResolutionError::MissingRequired(name.to_string())
        } else {
            ResolutionError::UnresolvedTemplate(format!("variable.{name}"))
        }
    }

    fn resolve_file_path(
        &self,
        value: &Value,
        base_dir: Option<&Path>,
    ) -> Result<String, ResolutionError> {
        let raw = value
            .as_str()
            .ok_or_else(|| ResolutionError::UnsafePath(value.to_string()))?;
        let path = Path::new(raw);

        if path.is_absolute() {
            return Err(ResolutionError::UnsafePath(raw.to_string()));
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(ResolutionError::UnsafePath(raw.to_string()));
        }

        let joined: PathBuf = match base_dir {
            Some(base) => base.join(path),
            None => path.to_path_buf(),
        };
        Ok(joined.to_string_lossy().into_owned())
    }
}

impl Default for ParameterResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Lookup that knows no credentials, for contexts without secrets.
struct NoCredentials;

static NO_CREDENTIALS: NoCredentials = NoCredentials;

#[async_trait::async_trait]
impl CredentialLookup for NoCredentials {
    async fn lookup(&self, _name: &str) -> Option<Credential> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::InMemoryCredentials;
    use crate::playbook::ParameterSpec;
    use serde_json::json;

    fn credential() -> Credential {
        Credential {
            name: "prod".to_string(),
            username: "admin".to_string(),
            password: "hunter2".to_string(),
            gateway_url: Some("https://gw.example.com".to_string()),
        }
    }

    fn spec(name: &str, param_type: ParamType, required: bool) -> ParameterSpec {
        ParameterSpec {
            name: name.to_string(),
            param_type,
            default: None,
            required,
        }
    }

    fn raw(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    async fn resolve_with(
        raw_params: HashMap<String, Value>,
        variables: HashMap<String, Value>,
        specs: Vec<ParameterSpec>,
    ) -> Result<HashMap<String, Value>, ResolutionError> {
        let lookup = InMemoryCredentials::shared(vec![credential()]);
        let resolver = ParameterResolver::new();
        let ctx = ResolveContext {
            variables: &variables,
            specs: &specs,
            credentials: lookup.as_ref(),
            base_dir: None,
        };
        resolver.resolve(&raw_params, &ctx).await
    }

    #[tokio::test]
    async fn test_whole_marker_keeps_type() {
        let mut variables = HashMap::new();
        variables.insert("count".to_string(), json!(5));

        let resolved = resolve_with(
            raw(&[("n", json!("${variable.count}"))]),
            variables,
            vec![],
        )
        .await
        .unwrap();

        assert_eq!(resolved["n"], json!(5));
    }

    #[tokio::test]
    async fn test_embedded_marker_stringifies() {
        let mut variables = HashMap::new();
        variables.insert("x".to_string(), json!(5));

        let resolved = resolve_with(
            raw(&[("message", json!("x is ${variable.x}"))]),
            variables,
            vec![],
        )
        .await
        .unwrap();

        assert_eq!(resolved["message"], json!("x is 5"));
    }

    #[tokio::test]
    async fn test_non_template_values_pass_through() {
        let resolved = resolve_with(
            raw(&[
                ("n", json!(42)),
                ("flag", json!(true)),
                ("plain", json!("no markers")),
            ]),
            HashMap::new(),
            vec![],
        )
        .await
        .unwrap();

        assert_eq!(resolved["n"], json!(42));
        assert_eq!(resolved["flag"], json!(true));
        assert_eq!(resolved["plain"], json!("no markers"));
    }

    #[tokio::test]
    async fn test_nested_objects_resolved_recursively() {
        let mut variables = HashMap::new();
        variables.insert("host".to_string(), json!("gw-1"));

        let resolved = resolve_with(
            raw(&[(
                "request",
                json!({"target": "${variable.host}", "hops": ["${variable.host}"]}),
            )]),
            variables,
            vec![],
        )
        .await
        .unwrap();

        assert_eq!(
            resolved["request"],
            json!({"target": "gw-1", "hops": ["gw-1"]})
        );
    }

    #[tokio::test]
    async fn test_credential_field_substitution() {
        let resolved = resolve_with(
            raw(&[("password", json!("{{ credential.prod.password }}"))]),
            HashMap::new(),
            vec![],
        )
        .await
        .unwrap();

        assert_eq!(resolved["password"], json!("hunter2"));
    }

    #[tokio::test]
    async fn test_unknown_credential_errors() {
        let err = resolve_with(
            raw(&[("password", json!("{{ credential.staging.password }}"))]),
            HashMap::new(),
            vec![],
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ResolutionError::UnknownCredential(name) if name == "staging"));
    }

    #[tokio::test]
    async fn test_unknown_credential_field_errors() {
        let err = resolve_with(
            raw(&[("token", json!("{{ credential.prod.token }}"))]),
            HashMap::new(),
            vec![],
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ResolutionError::UnresolvedTemplate(_)));
    }

    #[tokio::test]
    async fn test_missing_variable_is_unresolved() {
        let err = resolve_with(
            raw(&[("m", json!("${variable.nope}"))]),
            HashMap::new(),
            vec![],
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ResolutionError::UnresolvedTemplate(_)));
    }

    #[tokio::test]
    async fn test_missing_required_parameter_reported_as_such() {
        let err = resolve_with(
            raw(&[("url", json!("${variable.gateway_url}"))]),
            HashMap::new(),
            vec![spec("gateway_url", ParamType::String, true)],
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ResolutionError::MissingRequired(name) if name == "gateway_url"));
    }

    #[tokio::test]
    async fn test_unknown_marker_namespace_errors() {
        let err = resolve_with(
            raw(&[("m", json!("${secrets.key}"))]),
            HashMap::new(),
            vec![],
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ResolutionError::UnresolvedTemplate(inner) if inner == "secrets.key"));
    }

    #[tokio::test]
    async fn test_resolution_is_deterministic() {
        let mut variables = HashMap::new();
        variables.insert("x".to_string(), json!([1, 2, 3]));
        let params = raw(&[
            ("list", json!("${variable.x}")),
            ("user", json!("{{ credential.prod.username }}")),
        ]);

        let first = resolve_with(params.clone(), variables.clone(), vec![]).await.unwrap();
        let second = resolve_with(params, variables, vec![]).await.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_autofill_fills_declared_parameters_in_order() {
        let resolver = ParameterResolver::new();
        let specs = vec![
            spec("login", ParamType::Credential, false),
            spec("gateway_url", ParamType::String, true),
            spec("username", ParamType::String, false),
            spec("password", ParamType::String, false),
        ];

        let merged =
            resolver.autofill_run_parameters(&HashMap::new(), &specs, Some(&credential()));

        assert_eq!(merged["login"], json!("prod"));
        assert_eq!(merged["gateway_url"], json!("https://gw.example.com"));
        assert_eq!(merged["username"], json!("admin"));
        assert_eq!(merged["password"], json!("hunter2"));
    }

    #[test]
    fn test_autofill_never_overwrites_caller_values() {
        let resolver = ParameterResolver::new();
        let specs = vec![spec("gateway_url", ParamType::String, true)];
        let caller = raw(&[("gateway_url", json!("https://other.example.com"))]);

        let merged = resolver.autofill_run_parameters(&caller, &specs, Some(&credential()));
        assert_eq!(merged["gateway_url"], json!("https://other.example.com"));
    }

    #[test]
    fn test_defaults_applied_when_absent() {
        let resolver = ParameterResolver::new();
        let specs = vec![ParameterSpec {
            name: "retries".to_string(),
            param_type: ParamType::Number,
            default: Some(json!(3)),
            required: false,
        }];

        let merged = resolver.autofill_run_parameters(&HashMap::new(), &specs, None);
        assert_eq!(merged["retries"], json!(3));

        let caller = raw(&[("retries", json!(7))]);
        let merged = resolver.autofill_run_parameters(&caller, &specs, None);
        assert_eq!(merged["retries"], json!(7));
    }

    #[tokio::test]
    async fn test_file_parameter_joined_to_base_dir() {
        let lookup = InMemoryCredentials::shared(vec![]);
        let resolver = ParameterResolver::new();
        let specs = vec![spec("backup", ParamType::File, false)];
        let variables = HashMap::new();
        let base = Path::new("/srv/playbooks/restore");
        let ctx = ResolveContext {
            variables: &variables,
            specs: &specs,
            credentials: lookup.as_ref(),
            base_dir: Some(base),
        };

        let resolved = resolver
            .resolve(&raw(&[("backup", json!("dumps/latest.gwbk"))]), &ctx)
            .await
            .unwrap();
        assert_eq!(
            resolved["backup"],
            json!("/srv/playbooks/restore/dumps/latest.gwbk")
        );

        let err = resolver
            .resolve(&raw(&[("backup", json!("../secrets.txt"))]), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::UnsafePath(_)));

        let err = resolver
            .resolve(&raw(&[("backup", json!("/etc/passwd"))]), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::UnsafePath(_)));
    }

    #[test]
    fn test_substitute_variables_standalone() {
        let resolver = ParameterResolver::new();
        let mut variables = HashMap::new();
        variables.insert("state".to_string(), json!("ready"));

        let value = resolver
            .substitute_variables("${variable.state}", &variables)
            .unwrap();
        assert_eq!(value, json!("ready"));
    }
}
