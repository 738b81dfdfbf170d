// Named-endpoint routing table and URI template substitution
use crate::error::{Result, TeslaError};
use serde::Deserialize;
use std::collections::HashMap;

const BUNDLED: &str = include_str!("../endpoints.json");

/// Payload kind an endpoint serves. Only JSON endpoints can be dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum Content {
    #[default]
    #[serde(rename = "JSON")]
    Json,
    #[serde(rename = "HTML")]
    Html,
}

/// One named HTTP route: method, URI template with `{placeholder}` path
/// variables, and whether a bearer token is required.
#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "TYPE")]
    pub method: String,
    #[serde(rename = "URI")]
    pub uri: String,
    #[serde(rename = "AUTH")]
    pub auth: bool,
    #[serde(rename = "CONTENT", default)]
    pub content: Content,
}

/// Read-only endpoint name to descriptor mapping, owned by the session that
/// uses it so tests can run against isolated tables.
#[derive(Debug, Clone)]
pub struct EndpointTable {
    endpoints: HashMap<String, Endpoint>,
}

impl EndpointTable {
    /// Parse the table bundled with the crate.
    pub fn bundled() -> Result<Self> {
        let table = Self::from_json(BUNDLED)?;
        tracing::debug!("{} endpoints loaded", table.endpoints.len());
        Ok(table)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self {
            endpoints: serde_json::from_str(json)?,
        })
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Look up an endpoint by name; an unknown name is a configuration
    /// error naming the endpoint.
    pub fn get(&self, name: &str) -> Result<&Endpoint> {
        self.endpoints
            .get(name)
            .ok_or_else(|| TeslaError::Config(format!("Unknown endpoint name {}", name)))
    }
}

/// Substitute every `{placeholder}` in a URI template from `path_vars`.
/// A placeholder with no matching variable fails, naming the variable.
pub fn substitute_path_vars(
    name: &str,
    template: &str,
    path_vars: &[(&str, &str)],
) -> Result<String> {
    let mut uri = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        uri.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            TeslaError::Config(format!("Malformed URI template for {}", name))
        })?;
        let var = &after[..close];
        let value = path_vars
            .iter()
            .find(|(key, _)| *key == var)
            .map(|(_, value)| *value)
            .ok_or_else(|| {
                TeslaError::Config(format!("{} requires path variable '{}'", name, var))
            })?;
        uri.push_str(value);
        rest = &after[close + 1..];
    }
    uri.push_str(rest);
    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_table_parses() {
        let table = EndpointTable::bundled().unwrap();
        assert!(!table.is_empty());
        let endpoint = table.get("VEHICLE_LIST").unwrap();
        assert_eq!(endpoint.method, "GET");
        assert!(endpoint.auth);
        assert_eq!(endpoint.content, Content::Json);
    }

    #[test]
    fn test_unknown_endpoint_name() {
        let table = EndpointTable::bundled().unwrap();
        let err = table.get("DOES_NOT_EXIST").unwrap_err();
        assert!(matches!(err, TeslaError::Config(_)));
        assert!(err.to_string().contains("DOES_NOT_EXIST"));
    }

    #[test]
    fn test_html_content_kind() {
        let table = EndpointTable::bundled().unwrap();
        assert_eq!(table.get("STATUS").unwrap().content, Content::Html);
    }

    #[test]
    fn test_substitution() {
        let uri = substitute_path_vars(
            "VEHICLE_DATA",
            "api/1/vehicles/{vehicle_id}/vehicle_data",
            &[("vehicle_id", "42")],
        )
        .unwrap();
        assert_eq!(uri, "api/1/vehicles/42/vehicle_data");
    }

    #[test]
    fn test_substitution_multiple_vars() {
        let uri = substitute_path_vars(
            "X",
            "api/1/{a}/thing/{b}",
            &[("b", "two"), ("a", "one")],
        )
        .unwrap();
        assert_eq!(uri, "api/1/one/thing/two");
    }

    #[test]
    fn test_missing_path_variable_names_it() {
        let err = substitute_path_vars(
            "VEHICLE_DATA",
            "api/1/vehicles/{vehicle_id}/vehicle_data",
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, TeslaError::Config(_)));
        assert!(err.to_string().contains("vehicle_id"));
    }

    #[test]
    fn test_no_placeholders_passthrough() {
        let uri = substitute_path_vars("VEHICLE_LIST", "api/1/vehicles", &[]).unwrap();
        assert_eq!(uri, "api/1/vehicles");
    }
}
