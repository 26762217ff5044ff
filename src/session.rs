//! Per-user session state threaded through a scripted flow.
//!
//! Each virtual user exclusively owns one [`SessionState`]: its generated (or
//! fixed) credentials, the auth token captured by a successful login step, the
//! product catalog captured by a successful catalog fetch, and the product
//! record most recently selected from that catalog. Path and payload templates
//! reference these fields with `{variable}` placeholders, and headers are
//! rendered fresh from the current snapshot before every request.

use lazy_static::lazy_static;
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

lazy_static! {
    static ref TEMPLATE_VAR: Regex = Regex::new(r"\{([a-z_]+)\}").unwrap();
}

/// The identity a virtual user presents to the target service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub name: String,
    pub email: String,
    pub password: String,
    pub address: String,
}

impl Credentials {
    /// Generate unique throwaway credentials for one virtual user.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let uid: String = (0..8)
            .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
            .collect();
        Credentials {
            name: format!("LoadTester{}", uid),
            email: format!("user_{}@loadtest.local", uid),
            password: format!("Pwd!{}", uid),
            address: "123 Load St".to_string(),
        }
    }

    /// Use a pre-provisioned account shared by every virtual user.
    pub fn fixed(email: &str, password: &str) -> Self {
        Credentials {
            name: "Load Tester".to_string(),
            email: email.to_string(),
            password: password.to_string(),
            address: "123 Load St".to_string(),
        }
    }
}

/// One product as returned by the catalog endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    /// The record identifier, extracted from the configured id field.
    pub id: String,
    /// The full record, kept for custom sinks and debugging.
    pub record: Value,
}

/// Mutable per-user context, exclusively owned by one runner and never shared.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Who this virtual user logs in as.
    pub credentials: Credentials,
    /// Set if and only if a login step returned Success.
    pub auth_token: Option<String>,
    /// Ordered product records, empty until a catalog step succeeds.
    pub catalog: Vec<ProductRecord>,
    /// The product most recently sampled from the catalog.
    pub selected_product_id: Option<String>,
}

impl SessionState {
    pub fn new(credentials: Credentials) -> Self {
        SessionState {
            credentials,
            auth_token: None,
            catalog: Vec::new(),
            selected_product_id: None,
        }
    }

    /// Resolve one template variable from the current snapshot.
    pub(crate) fn lookup(&self, variable: &str) -> Option<String> {
        match variable {
            "name" => Some(self.credentials.name.clone()),
            "email" => Some(self.credentials.email.clone()),
            "password" => Some(self.credentials.password.clone()),
            "address" => Some(self.credentials.address.clone()),
            "access_token" => self.auth_token.clone(),
            "product_id" => self.selected_product_id.clone(),
            _ => None,
        }
    }

    /// Substitute all `{variable}` placeholders in a template string.
    ///
    /// Returns the name of the first unresolvable variable on failure; scenario
    /// validation makes this unreachable for well-formed scenarios.
    pub(crate) fn render_template(&self, template: &str) -> Result<String, String> {
        let mut rendered = template.to_string();
        for capture in TEMPLATE_VAR.captures_iter(template) {
            let variable = &capture[1];
            match self.lookup(variable) {
                Some(value) => {
                    rendered = rendered.replace(&format!("{{{}}}", variable), &value);
                }
                None => return Err(variable.to_string()),
            }
        }
        Ok(rendered)
    }

    /// Substitute placeholders in every string value of a JSON payload template.
    pub(crate) fn render_payload(&self, payload: &Value) -> Result<Value, String> {
        match payload {
            Value::String(template) => Ok(Value::String(self.render_template(template)?)),
            Value::Array(items) => {
                let mut rendered = Vec::with_capacity(items.len());
                for item in items {
                    rendered.push(self.render_payload(item)?);
                }
                Ok(Value::Array(rendered))
            }
            Value::Object(map) => {
                let mut rendered = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    rendered.insert(key.clone(), self.render_payload(value)?);
                }
                Ok(Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }

    /// The headers attached to the next request, derived from the current
    /// snapshot. The Authorization header is present if and only if a login
    /// step has succeeded for this user.
    pub(crate) fn request_headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(token) = &self.auth_token {
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }
        headers
    }

    /// Sample a uniformly random product from the catalog into
    /// `selected_product_id`. Returns false when the catalog is empty.
    pub(crate) fn select_random_product(&mut self) -> bool {
        match self.catalog.choose(&mut rand::thread_rng()) {
            Some(product) => {
                self.selected_product_id = Some(product.id.clone());
                true
            }
            None => false,
        }
    }
}

/// Extract all `{variable}` names referenced by a template string.
pub(crate) fn template_variables(template: &str) -> Vec<String> {
    TEMPLATE_VAR
        .captures_iter(template)
        .map(|capture| capture[1].to_string())
        .collect()
}

/// Extract all `{variable}` names referenced anywhere in a JSON payload template.
pub(crate) fn payload_variables(payload: &Value) -> Vec<String> {
    match payload {
        Value::String(template) => template_variables(template),
        Value::Array(items) => items.iter().flat_map(payload_variables).collect(),
        Value::Object(map) => map.values().flat_map(payload_variables).collect(),
        _ => Vec::new(),
    }
}
