//! Config, result and var resolution
//!
//! Each map is merged from its sources in a fixed order, later sources
//! overriding earlier ones:
//!
//! 1. Secret (every key)
//! 2. Literal entries
//! 3. Template entries, rendered against `{resource, data, vars}`
//! 4. ConfigMap
//! 5. Apparatus `/config` response (config only)
//!
//! The merged map is then checked against the interface properties of its side.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use integration_common::crd::{CouplingSources, MapSources, SchemaProperties, Var};
use integration_common::kube_utils::{lookup_path, value_to_string, DynamicClient};
use integration_common::template::TemplateEngine;
use integration_common::Error;

use crate::apparatus::{Apparatus, ApparatusRequest, ObjectMeta};
use crate::bus::Side;
use crate::client::CouplingClient;

/// Field read from a var's object when no fieldref is given
pub const DEFAULT_VAR_FIELD_PATH: &str = "metadata.name";

/// The plug or socket whose maps are being resolved
pub struct ResolveInput<'a> {
    /// Side of the object
    pub side: Side,
    /// Serialized object, exposed to templates as `resource`
    pub object: &'a Value,
    /// Identity of the object
    pub meta: ObjectMeta,
    /// Sources declared on the object
    pub sources: &'a CouplingSources,
}

impl ResolveInput<'_> {
    fn resource_key(&self) -> String {
        format!("{}/{}", self.meta.namespace, self.meta.name)
    }
}

/// Resolves data, vars, config and results for one side of a coupling
pub struct ConfigResolver {
    client: Arc<dyn CouplingClient>,
    dynamic: Arc<dyn DynamicClient>,
    apparatus: Arc<dyn Apparatus>,
    templates: TemplateEngine,
}

impl ConfigResolver {
    /// Create a resolver
    pub fn new(
        client: Arc<dyn CouplingClient>,
        dynamic: Arc<dyn DynamicClient>,
        apparatus: Arc<dyn Apparatus>,
    ) -> Self {
        Self {
            client,
            dynamic,
            apparatus,
            templates: TemplateEngine::new(),
        }
    }

    /// Resolve vars by reading a field from each referenced object
    ///
    /// Objects without a namespace are looked up in `namespace`. A missing
    /// object is an error; a missing field resolves to an empty string.
    pub async fn resolve_vars(
        &self,
        vars: &[Var],
        namespace: &str,
    ) -> Result<BTreeMap<String, String>, Error> {
        let mut resolved = BTreeMap::new();
        for var in vars {
            let target = &var.objref;
            let api_version = target.resolved_api_version();
            let target_ns = target
                .namespace
                .clone()
                .filter(|ns| !ns.is_empty())
                .unwrap_or_else(|| namespace.to_string());

            let object = self
                .dynamic
                .get(&api_version, &target.kind, &target.name, Some(target_ns.clone()))
                .await?
                .ok_or_else(|| {
                    Error::not_found(target.kind.clone(), format!("{}/{}", target_ns, target.name))
                })?;

            let path = var
                .fieldref
                .as_ref()
                .map(|f| f.field_path.as_str())
                .filter(|p| !p.is_empty())
                .unwrap_or(DEFAULT_VAR_FIELD_PATH);
            let value = lookup_path(&object, path).map(value_to_string).unwrap_or_default();
            debug!(var = %var.name, kind = %target.kind, path = %path, "resolved var");
            resolved.insert(var.name.clone(), value);
        }
        Ok(resolved)
    }

    /// Resolve the data map exposed to templates
    pub async fn resolve_data(&self, input: &ResolveInput<'_>) -> Result<BTreeMap<String, String>, Error> {
        self.merge_sources(input, input.sources.data_sources(), &Value::Null)
            .await
    }

    /// Resolve the config of one side and validate it against its interface properties
    pub async fn resolve_config(
        &self,
        input: &ResolveInput<'_>,
        schema: Option<&SchemaProperties>,
    ) -> Result<BTreeMap<String, String>, Error> {
        let data = self.resolve_data(input).await?;
        let vars = self
            .resolve_vars(&input.sources.vars, &input.meta.namespace)
            .await?;
        let ctx = json!({
            "resource": input.object,
            "data": data,
            "vars": vars,
        });

        let mut config = self
            .merge_sources(input, input.sources.config_sources(), &ctx)
            .await?;

        if let Some(apparatus) = &input.sources.apparatus {
            let mut request = ApparatusRequest {
                data: Some(data),
                vars: Some(vars),
                ..Default::default()
            };
            match input.side {
                Side::Plug => {
                    request.plug = Some(input.object.clone());
                    request.plug_meta = Some(input.meta.clone());
                }
                Side::Socket => {
                    request.socket = Some(input.object.clone());
                    request.socket_meta = Some(input.meta.clone());
                }
            }
            config.extend(self.apparatus.get_config(&apparatus.endpoint, request).await?);
        }

        validate_properties(&input.resource_key(), config, schema)
    }

    /// Resolve the result of one side
    ///
    /// Result templates see the coupling (`plug`, `socket`, `plugConfig`,
    /// `socketConfig`) in addition to `resource`, `data` and the result vars.
    /// Properties the interface declares but no result source supplies are
    /// taken from `config`, the side's resolved config, so a value handed
    /// out by the apparatus can satisfy a required result.
    pub async fn resolve_result(
        &self,
        input: &ResolveInput<'_>,
        coupling: &Value,
        config: &BTreeMap<String, String>,
        schema: Option<&SchemaProperties>,
    ) -> Result<BTreeMap<String, String>, Error> {
        let mut result = if input.sources.declares_result() {
            let data = self.resolve_data(input).await?;
            let vars = self
                .resolve_vars(&input.sources.result_vars, &input.meta.namespace)
                .await?;
            let mut ctx = match coupling {
                Value::Object(map) => map.clone(),
                _ => serde_json::Map::new(),
            };
            ctx.insert("resource".to_string(), input.object.clone());
            ctx.insert("data".to_string(), serde_json::to_value(&data)?);
            ctx.insert("vars".to_string(), serde_json::to_value(&vars)?);

            self.merge_sources(input, input.sources.result_sources(), &Value::Object(ctx))
                .await?
        } else {
            BTreeMap::new()
        };

        if let Some(schema) = schema {
            for name in schema.keys() {
                if result.contains_key(name) {
                    continue;
                }
                if let Some(value) = config.get(name) {
                    result.insert(name.clone(), value.clone());
                }
            }
        }
        validate_properties(&input.resource_key(), result, schema)
    }

    async fn merge_sources(
        &self,
        input: &ResolveInput<'_>,
        sources: MapSources<'_>,
        template_ctx: &Value,
    ) -> Result<BTreeMap<String, String>, Error> {
        let namespace = input.meta.namespace.as_str();
        let mut merged = BTreeMap::new();

        if let Some(name) = sources.secret_name.filter(|n| !n.is_empty()) {
            let data = self
                .client
                .get_secret_data(name, namespace)
                .await?
                .ok_or_else(|| Error::not_found("Secret", format!("{}/{}", namespace, name)))?;
            merged.extend(data);
        }

        merged.extend(sources.literal.iter().map(|(k, v)| (k.clone(), v.clone())));

        if let Some(templates) = sources.template {
            for (key, template) in templates {
                merged.insert(key.clone(), self.templates.render(template, template_ctx)?);
            }
        }

        if let Some(name) = sources.config_map_name.filter(|n| !n.is_empty()) {
            let data = self
                .client
                .get_config_map_data(name, namespace)
                .await?
                .ok_or_else(|| Error::not_found("ConfigMap", format!("{}/{}", namespace, name)))?;
            merged.extend(data);
        }

        Ok(merged)
    }
}

/// Check a resolved map against interface properties
///
/// Missing required properties are an error, defaults fill the gaps and
/// undeclared keys are dropped. Without a schema the map is returned unchanged.
pub fn validate_properties(
    resource: &str,
    mut values: BTreeMap<String, String>,
    schema: Option<&SchemaProperties>,
) -> Result<BTreeMap<String, String>, Error> {
    let Some(schema) = schema else {
        return Ok(values);
    };

    let mut validated = BTreeMap::new();
    for (name, property) in schema {
        match values.remove(name).or_else(|| property.default.clone()) {
            Some(value) => {
                validated.insert(name.clone(), value);
            }
            None if property.required => {
                return Err(Error::required_property(resource, name));
            }
            None => {}
        }
    }
    Ok(validated)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::apparatus::MockApparatus;
    use crate::client::MockCouplingClient;
    use integration_common::crd::{FieldRef, SchemaProperty, SpecApparatus, Target};
    use mockall::mock;

    mock! {
        pub Dynamic {}

        #[async_trait::async_trait]
        impl DynamicClient for Dynamic {
            async fn get(
                &self,
                api_version: &str,
                kind: &str,
                name: &str,
                namespace: Option<String>,
            ) -> Result<Option<Value>, Error>;
            async fn apply(&self, manifest: Value, default_namespace: String) -> Result<Value, Error>;
            async fn create(&self, manifest: Value, default_namespace: String) -> Result<Value, Error>;
            async fn delete(&self, manifest: Value, default_namespace: String) -> Result<bool, Error>;
        }
    }

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn meta() -> ObjectMeta {
        ObjectMeta {
            name: "db".to_string(),
            namespace: "data".to_string(),
            uid: "s1".to_string(),
        }
    }

    fn resolver(client: MockCouplingClient, dynamic: MockDynamic, apparatus: MockApparatus) -> ConfigResolver {
        ConfigResolver::new(Arc::new(client), Arc::new(dynamic), Arc::new(apparatus))
    }

    fn required(default: Option<&str>) -> SchemaProperty {
        SchemaProperty {
            default: default.map(str::to_string),
            description: None,
            required: true,
        }
    }

    // =========================================================================
    // Precedence
    // =========================================================================

    #[tokio::test]
    async fn story_configmap_beats_template_beats_literal_beats_secret() {
        let mut client = MockCouplingClient::new();
        client
            .expect_get_secret_data()
            .returning(|_, _| Ok(Some(map(&[("a", "secret"), ("b", "secret"), ("c", "secret"), ("d", "secret")]))));
        client
            .expect_get_config_map_data()
            .returning(|_, _| Ok(Some(map(&[("d", "configmap")]))));

        let sources = CouplingSources {
            config: map(&[("b", "literal"), ("c", "literal"), ("d", "literal")]),
            config_template: map(&[("c", "{{ resource.metadata.name }}-template"), ("d", "template")]),
            config_secret_name: Some("db-secret".to_string()),
            config_config_map_name: Some("db-config".to_string()),
            ..Default::default()
        };
        let object = json!({ "metadata": { "name": "db" } });
        let input = ResolveInput {
            side: Side::Socket,
            object: &object,
            meta: meta(),
            sources: &sources,
        };

        let config = resolver(client, MockDynamic::new(), MockApparatus::new())
            .resolve_config(&input, None)
            .await
            .unwrap();

        assert_eq!(config["a"], "secret");
        assert_eq!(config["b"], "literal");
        assert_eq!(config["c"], "db-template");
        assert_eq!(config["d"], "configmap");
    }

    #[tokio::test]
    async fn story_apparatus_config_overlays_everything() {
        let mut apparatus = MockApparatus::new();
        apparatus
            .expect_get_config()
            .withf(|endpoint, request| {
                endpoint == "db-apparatus:8080"
                    && request.socket_meta.as_ref().map(|m| m.name.as_str()) == Some("db")
                    && request.plug.is_none()
            })
            .times(1)
            .returning(|_, _| Ok(map(&[("host", "10.0.0.5")])));

        let sources = CouplingSources {
            config: map(&[("host", "localhost"), ("port", "5432")]),
            apparatus: Some(SpecApparatus {
                endpoint: "db-apparatus:8080".to_string(),
                idle_timeout: None,
            }),
            ..Default::default()
        };
        let object = json!({ "metadata": { "name": "db" } });
        let input = ResolveInput {
            side: Side::Socket,
            object: &object,
            meta: meta(),
            sources: &sources,
        };

        let config = resolver(MockCouplingClient::new(), MockDynamic::new(), apparatus)
            .resolve_config(&input, None)
            .await
            .unwrap();

        assert_eq!(config, map(&[("host", "10.0.0.5"), ("port", "5432")]));
    }

    #[tokio::test]
    async fn story_missing_secret_is_not_found() {
        let mut client = MockCouplingClient::new();
        client.expect_get_secret_data().returning(|_, _| Ok(None));

        let sources = CouplingSources {
            config_secret_name: Some("missing".to_string()),
            ..Default::default()
        };
        let object = json!({});
        let input = ResolveInput {
            side: Side::Plug,
            object: &object,
            meta: meta(),
            sources: &sources,
        };

        let err = resolver(client, MockDynamic::new(), MockApparatus::new())
            .resolve_config(&input, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    // =========================================================================
    // Vars
    // =========================================================================

    #[tokio::test]
    async fn story_vars_feed_config_templates() {
        let mut dynamic = MockDynamic::new();
        dynamic
            .expect_get()
            .withf(|api, kind, name, ns| {
                api == "v1" && kind == "Service" && name == "postgres" && ns.as_deref() == Some("data")
            })
            .returning(|_, _, _, _| {
                Ok(Some(json!({
                    "metadata": { "name": "postgres" },
                    "spec": { "clusterIP": "10.0.0.5", "ports": [{ "port": 5432 }] }
                })))
            });

        let sources = CouplingSources {
            vars: vec![
                Var {
                    name: "ip".to_string(),
                    objref: Target {
                        kind: "Service".to_string(),
                        name: "postgres".to_string(),
                        ..Default::default()
                    },
                    fieldref: Some(FieldRef {
                        field_path: "spec.clusterIP".to_string(),
                    }),
                },
                Var {
                    name: "port".to_string(),
                    objref: Target {
                        api_version: Some("v1".to_string()),
                        kind: "Service".to_string(),
                        name: "postgres".to_string(),
                        ..Default::default()
                    },
                    fieldref: Some(FieldRef {
                        field_path: "spec.ports.0.port".to_string(),
                    }),
                },
                Var {
                    name: "svc".to_string(),
                    objref: Target {
                        kind: "Service".to_string(),
                        name: "postgres".to_string(),
                        ..Default::default()
                    },
                    fieldref: None,
                },
            ],
            config_template: map(&[("url", "postgres://{{ vars.ip }}:{{ vars.port }}/{{ vars.svc }}")]),
            ..Default::default()
        };
        let object = json!({});
        let input = ResolveInput {
            side: Side::Socket,
            object: &object,
            meta: meta(),
            sources: &sources,
        };

        let config = resolver(MockCouplingClient::new(), dynamic, MockApparatus::new())
            .resolve_config(&input, None)
            .await
            .unwrap();
        assert_eq!(config["url"], "postgres://10.0.0.5:5432/postgres");
    }

    #[tokio::test]
    async fn story_missing_var_object_is_not_found() {
        let mut dynamic = MockDynamic::new();
        dynamic.expect_get().returning(|_, _, _, _| Ok(None));

        let vars = vec![Var {
            name: "ip".to_string(),
            objref: Target {
                kind: "Service".to_string(),
                name: "postgres".to_string(),
                namespace: Some("other".to_string()),
                ..Default::default()
            },
            fieldref: None,
        }];

        let err = resolver(MockCouplingClient::new(), dynamic, MockApparatus::new())
            .resolve_vars(&vars, "data")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Service 'other/postgres' not found");
    }

    // =========================================================================
    // Interface validation
    // =========================================================================

    #[test]
    fn story_required_property_missing_fails() {
        let schema = SchemaProperties::from([("host".to_string(), required(None))]);
        let err = validate_properties("data/db", BTreeMap::new(), Some(&schema)).unwrap_err();
        assert_eq!(err.to_string(), "property 'host' is required");
        assert!(err.is_missing_required());
    }

    #[test]
    fn story_defaults_fill_gaps_and_undeclared_keys_drop() {
        let schema = SchemaProperties::from([
            ("host".to_string(), required(None)),
            ("port".to_string(), required(Some("5432"))),
            (
                "sslmode".to_string(),
                SchemaProperty {
                    default: None,
                    description: Some("optional".to_string()),
                    required: false,
                },
            ),
        ]);
        let values = map(&[("host", "10.0.0.5"), ("extra", "dropped")]);

        let validated = validate_properties("data/db", values, Some(&schema)).unwrap();
        assert_eq!(validated, map(&[("host", "10.0.0.5"), ("port", "5432")]));
    }

    #[test]
    fn story_no_schema_passes_through() {
        let values = map(&[("anything", "goes")]);
        assert_eq!(validate_properties("data/db", values.clone(), None).unwrap(), values);
    }

    // =========================================================================
    // Results
    // =========================================================================

    #[tokio::test]
    async fn story_result_templates_see_the_coupling() {
        let sources = CouplingSources {
            result: map(&[("kind", "postgres")]),
            result_template: map(&[("dsn", "{{ socketConfig.host }}/{{ resource.metadata.name }}")]),
            ..Default::default()
        };
        let object = json!({ "metadata": { "name": "app" } });
        let input = ResolveInput {
            side: Side::Plug,
            object: &object,
            meta: meta(),
            sources: &sources,
        };
        let coupling = json!({ "socketConfig": { "host": "10.0.0.5" } });

        let result = resolver(MockCouplingClient::new(), MockDynamic::new(), MockApparatus::new())
            .resolve_result(&input, &coupling, &BTreeMap::new(), None)
            .await
            .unwrap();
        assert_eq!(result, map(&[("dsn", "10.0.0.5/app"), ("kind", "postgres")]));
    }

    #[tokio::test]
    async fn story_undeclared_result_still_applies_defaults() {
        let sources = CouplingSources::default();
        let object = json!({});
        let input = ResolveInput {
            side: Side::Plug,
            object: &object,
            meta: meta(),
            sources: &sources,
        };
        let schema = SchemaProperties::from([(
            "ready".to_string(),
            SchemaProperty {
                default: Some("true".to_string()),
                description: None,
                required: false,
            },
        )]);

        let result = resolver(MockCouplingClient::new(), MockDynamic::new(), MockApparatus::new())
            .resolve_result(&input, &Value::Null, &BTreeMap::new(), Some(&schema))
            .await
            .unwrap();
        assert_eq!(result, map(&[("ready", "true")]));
    }

    #[tokio::test]
    async fn story_required_result_falls_back_to_config() {
        let sources = CouplingSources {
            result: map(&[("port", "5432")]),
            ..Default::default()
        };
        let object = json!({});
        let input = ResolveInput {
            side: Side::Socket,
            object: &object,
            meta: meta(),
            sources: &sources,
        };
        let schema = SchemaProperties::from([
            (
                "host".to_string(),
                SchemaProperty {
                    required: true,
                    ..Default::default()
                },
            ),
            (
                "port".to_string(),
                SchemaProperty::default(),
            ),
        ]);
        // Config from the apparatus; `port` from the result source wins
        let config = map(&[("host", "10.0.0.5"), ("port", "6543"), ("password", "secret")]);

        let result = resolver(MockCouplingClient::new(), MockDynamic::new(), MockApparatus::new())
            .resolve_result(&input, &Value::Null, &config, Some(&schema))
            .await
            .unwrap();
        assert_eq!(result, map(&[("host", "10.0.0.5"), ("port", "5432")]));
    }
}
