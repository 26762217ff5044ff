//! Executes one step against the target service.
//!
//! The executor renders a request from the step's templates and the current
//! session snapshot, dispatches it with a bounded timeout, classifies the
//! result, and applies the step's declared session update. It never raises past
//! its own boundary: every failure mode, including errors from the HTTP client,
//! becomes a classified [`StepOutcome`].

use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::Value;
use url::Url;

use crate::metrics::{StepClassification, StepOutcome};
use crate::scenario::{BodyPredicate, Precondition, StateUpdate, StepSpec};
use crate::session::{ProductRecord, SessionState};

// The field a catalog record's identifier is read from.
const CATALOG_ID_FIELD: &str = "_id";

pub(crate) async fn execute_step(
    client: &Client,
    base_url: &Url,
    timeout: Duration,
    user: usize,
    step: &StepSpec,
    session: &mut SessionState,
) -> StepOutcome {
    // A precondition gates the request; unmet means the request is never sent.
    if let Some(Precondition::NonEmptyCatalog) = step.precondition {
        if !session.select_random_product() {
            debug!("[user {}]: skipping {}, catalog is empty", user, step.name);
            return StepOutcome::new(
                user,
                &step.name,
                StepClassification::Skipped,
                0,
                Some("catalog is empty".to_string()),
            );
        }
    }

    // Render path, payload and headers from the current session snapshot.
    let path = match session.render_template(&step.path) {
        Ok(path) => path,
        Err(variable) => {
            return StepOutcome::new(
                user,
                &step.name,
                StepClassification::ValidationFailure,
                0,
                Some(format!("unresolved template variable {{{}}}", variable)),
            )
        }
    };
    let url = match base_url.join(&path) {
        Ok(url) => url,
        Err(error) => {
            return StepOutcome::new(
                user,
                &step.name,
                StepClassification::ValidationFailure,
                0,
                Some(format!("invalid request path {}: {}", path, error)),
            )
        }
    };
    let payload = match &step.payload {
        Some(template) => match session.render_payload(template) {
            Ok(payload) => Some(payload),
            Err(variable) => {
                return StepOutcome::new(
                    user,
                    &step.name,
                    StepClassification::ValidationFailure,
                    0,
                    Some(format!("unresolved template variable {{{}}}", variable)),
                )
            }
        },
        None => None,
    };

    let mut request = client
        .request(step.method.clone(), url)
        .timeout(timeout);
    for (header, value) in session.request_headers() {
        request = request.header(&header, &value);
    }
    if let Some(body) = &payload {
        request = request.json(body);
    }

    // Dispatch; any client error (timeout, connect failure, invalid request)
    // classifies as TransportError and is reported, never propagated.
    let started = Instant::now();
    let response = match request.send().await {
        Ok(response) => response,
        Err(error) => {
            let elapsed = started.elapsed().as_millis() as u64;
            return StepOutcome::new(
                user,
                &step.name,
                StepClassification::TransportError,
                elapsed,
                Some(error.to_string()),
            );
        }
    };

    let status = response.status().as_u16();
    if !step.expected_status.contains(&status) {
        let elapsed = started.elapsed().as_millis() as u64;
        return StepOutcome::new(
            user,
            &step.name,
            StepClassification::ValidationFailure,
            elapsed,
            Some(format!("unexpected status code: {}", status)),
        );
    }

    // The body is only read when the contract or state update needs it.
    if step.predicate.is_some() || step.state_update != StateUpdate::None {
        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(error) => {
                let elapsed = started.elapsed().as_millis() as u64;
                return StepOutcome::new(
                    user,
                    &step.name,
                    StepClassification::ValidationFailure,
                    elapsed,
                    Some(format!("response body is not valid JSON: {}", error)),
                );
            }
        };
        let elapsed = started.elapsed().as_millis() as u64;

        if let Some(predicate) = &step.predicate {
            if let Err(detail) = check_predicate(predicate, &body) {
                return StepOutcome::new(
                    user,
                    &step.name,
                    StepClassification::ValidationFailure,
                    elapsed,
                    Some(detail),
                );
            }
        }

        if let Err(detail) = apply_state_update(&step.state_update, session, &body) {
            return StepOutcome::new(
                user,
                &step.name,
                StepClassification::ValidationFailure,
                elapsed,
                Some(detail),
            );
        }

        return StepOutcome::new(user, &step.name, StepClassification::Success, elapsed, None);
    }

    let elapsed = started.elapsed().as_millis() as u64;
    StepOutcome::new(user, &step.name, StepClassification::Success, elapsed, None)
}

// Confirm the response body honors the step's declared contract.
fn check_predicate(predicate: &BodyPredicate, body: &Value) -> Result<(), String> {
    match predicate {
        BodyPredicate::HasField(field) => match body.get(field) {
            Some(Value::Null) | None => Err(format!("response body is missing `{}`", field)),
            Some(_) => Ok(()),
        },
        BodyPredicate::ArrayOfRecordsWith(field) => match body.as_array() {
            Some(records) => {
                for record in records {
                    if record.get(field).is_none() {
                        return Err(format!("response record is missing `{}`", field));
                    }
                }
                Ok(())
            }
            None => Err("response body is not an array".to_string()),
        },
    }
}

// Mutate the session as the step declares. Only ever called on Success.
fn apply_state_update(
    update: &StateUpdate,
    session: &mut SessionState,
    body: &Value,
) -> Result<(), String> {
    match update {
        StateUpdate::None => Ok(()),
        StateUpdate::StoreAuthToken(field) => match body.get(field).and_then(Value::as_str) {
            Some(token) => {
                session.auth_token = Some(token.to_string());
                Ok(())
            }
            None => Err(format!("response body is missing `{}`", field)),
        },
        StateUpdate::StoreCatalog => match body.as_array() {
            Some(records) => {
                let mut catalog = Vec::with_capacity(records.len());
                for record in records {
                    match record.get(CATALOG_ID_FIELD).and_then(Value::as_str) {
                        Some(id) => catalog.push(ProductRecord {
                            id: id.to_string(),
                            record: record.clone(),
                        }),
                        None => {
                            return Err(format!(
                                "catalog record is missing `{}`",
                                CATALOG_ID_FIELD
                            ))
                        }
                    }
                }
                // Replace, don't append: each fetch is a full snapshot.
                session.catalog = catalog;
                session.selected_product_id = None;
                Ok(())
            }
            None => Err("catalog response is not an array".to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Credentials;
    use serde_json::json;

    #[test]
    fn has_field_predicate() {
        let predicate = BodyPredicate::HasField("accessToken".to_string());
        assert!(check_predicate(&predicate, &json!({"accessToken": "tok123"})).is_ok());
        assert!(check_predicate(&predicate, &json!({"accessToken": null})).is_err());
        assert!(check_predicate(&predicate, &json!({"error": "nope"})).is_err());
        assert!(check_predicate(&predicate, &json!([1, 2, 3])).is_err());
    }

    #[test]
    fn array_of_records_predicate() {
        let predicate = BodyPredicate::ArrayOfRecordsWith("_id".to_string());
        assert!(check_predicate(&predicate, &json!([{"_id": "a"}, {"_id": "b"}])).is_ok());
        // An empty array still honors the contract; emptiness is a skip
        // condition for later steps, not a failure here.
        assert!(check_predicate(&predicate, &json!([])).is_ok());
        assert!(check_predicate(&predicate, &json!([{"_id": "a"}, {"name": "b"}])).is_err());
        assert!(check_predicate(&predicate, &json!({"products": []})).is_err());
    }

    #[test]
    fn store_auth_token() {
        let mut session = SessionState::new(Credentials::fixed("a@b.c", "pw"));
        let update = StateUpdate::StoreAuthToken("accessToken".to_string());

        assert!(apply_state_update(&update, &mut session, &json!({})).is_err());
        assert_eq!(session.auth_token, None);

        apply_state_update(&update, &mut session, &json!({"accessToken": "tok123"})).unwrap();
        assert_eq!(session.auth_token, Some("tok123".to_string()));
    }

    #[test]
    fn store_catalog_replaces_previous_snapshot() {
        let mut session = SessionState::new(Credentials::fixed("a@b.c", "pw"));

        apply_state_update(
            &StateUpdate::StoreCatalog,
            &mut session,
            &json!([{"_id": "p1", "name": "one"}, {"_id": "p2"}]),
        )
        .unwrap();
        assert_eq!(session.catalog.len(), 2);
        assert_eq!(session.catalog[0].id, "p1");

        session.selected_product_id = Some("p1".to_string());
        apply_state_update(&StateUpdate::StoreCatalog, &mut session, &json!([])).unwrap();
        assert!(session.catalog.is_empty());
        // A stale selection can't outlive the snapshot that produced it.
        assert_eq!(session.selected_product_id, None);
    }
}
