//! Helpers for assembling provider configs and function-tool schemas.
//!
//! The full `LLMBuilder`/`ProviderRegistry` builder this module once carried
//! assumed a plugin-loaded registry of providers; the gateway instead
//! resolves adapters through the [`crate::router::AdapterRouter`] and builds
//! each one directly from its [`crate::factory::HTTPLLMProviderFactory`].
//! What survives from the builder is what the router's bootstrap and the
//! tool-definition call sites still need: config pruning and function-tool
//! construction.

use crate::chat::{FunctionTool, ParameterProperty, ParametersSchema, Tool};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Restricts `cfg` to the keys declared in `schema`'s `properties`, recursing
/// into nested objects that themselves declare properties. Used when handing
/// a merged config (defaults + environment + per-adapter overrides) to a
/// factory whose `#[serde(deny_unknown_fields)]` struct would otherwise
/// reject the extra keys.
pub fn prune_config_by_schema(cfg: &Value, schema: &Value) -> Value {
    match (cfg, schema.get("properties")) {
        (Value::Object(cfg_map), Some(Value::Object(props))) => {
            let mut out = Map::with_capacity(cfg_map.len());
            for (k, v) in cfg_map {
                if let Some(prop_schema) = props.get(k) {
                    let pruned_val = if prop_schema.get("properties").is_some() {
                        prune_config_by_schema(v, prop_schema)
                    } else {
                        v.clone()
                    };
                    out.insert(k.clone(), pruned_val);
                }
            }
            Value::Object(out)
        }
        _ => cfg.clone(),
    }
}

/// Builder for one function-tool parameter.
pub struct ParamBuilder {
    name: String,
    property_type: String,
    description: String,
    items: Option<Box<ParamBuilder>>,
    enum_list: Option<Vec<String>>,
}

impl ParamBuilder {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            property_type: "string".to_string(),
            description: String::new(),
            items: None,
            enum_list: None,
        }
    }

    pub fn type_of<T: Into<String>>(mut self, type_str: T) -> Self {
        self.property_type = type_str.into();
        self
    }

    pub fn description<D: Into<String>>(mut self, desc: D) -> Self {
        self.description = desc.into();
        self
    }

    pub fn items(mut self, item_builder: ParamBuilder) -> Self {
        self.items = Some(Box::new(item_builder));
        self
    }

    pub fn enum_list<I, S>(mut self, vals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_list = Some(vals.into_iter().map(Into::into).collect());
        self
    }

    pub fn build(self) -> (String, ParameterProperty) {
        let items_prop = self.items.map(|b| Box::new(b.build().1));
        (
            self.name.clone(),
            ParameterProperty {
                property_type: self.property_type,
                description: self.description,
                items: items_prop,
                enum_list: self.enum_list,
            },
        )
    }
}

/// Builder for a function tool definition, assembled from [`ParamBuilder`]s.
pub struct FunctionBuilder {
    name: String,
    description: String,
    parameters: Vec<ParamBuilder>,
    required: Vec<String>,
}

impl FunctionBuilder {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            parameters: Vec::new(),
            required: Vec::new(),
        }
    }

    pub fn description<D: Into<String>>(mut self, desc: D) -> Self {
        self.description = desc.into();
        self
    }

    pub fn param(mut self, param: ParamBuilder) -> Self {
        self.parameters.push(param);
        self
    }

    pub fn required<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> Tool {
        let mut props = HashMap::new();
        for pb in self.parameters {
            let (key, prop) = pb.build();
            props.insert(key, prop);
        }

        let function = FunctionTool {
            name: self.name,
            description: self.description,
            parameters: serde_json::to_value(ParametersSchema {
                schema_type: "object".to_string(),
                properties: props,
                required: self.required,
            })
            .expect("ParametersSchema always serializes"),
        };

        Tool {
            tool_type: "function".to_string(),
            function,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prune_drops_keys_not_in_schema() {
        let cfg = json!({ "api_key": "x", "model": "gpt-4o", "bogus": 1 });
        let schema = json!({ "properties": { "api_key": {}, "model": {} } });
        let pruned = prune_config_by_schema(&cfg, &schema);
        assert_eq!(pruned, json!({ "api_key": "x", "model": "gpt-4o" }));
    }

    #[test]
    fn function_builder_assembles_parameters_schema() {
        let tool = FunctionBuilder::new("shell")
            .description("run a shell command")
            .param(ParamBuilder::new("cmd").description("the command"))
            .required(["cmd"])
            .build();
        assert_eq!(tool.function.name, "shell");
        assert_eq!(tool.function.parameters["required"][0], "cmd");
    }
}
