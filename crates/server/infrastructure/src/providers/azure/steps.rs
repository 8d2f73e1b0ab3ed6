//! Resource step engine.
//!
//! Two primitives drive every pipeline: provision one resource, remove one
//! resource. Both are idempotent and resumable: each invocation inspects
//! the `(name, id, operation)` triple, takes at most one cloud action, and
//! records the result in the triple before returning. Cloud GETs answer
//! 404 both for "never created" and "already destroyed", so the name is
//! the only stable identity and a 404 after a delete attempt is the proof
//! of deletion.

use serde_json::Value;

use cirrus_server_domain::workers::provider_data::ResourceRecord;

use super::client::{ArmResource, AzureApi, CloudError, ResourceKind};

/// Provisioning states that mean a resource will never become usable.
pub const FAIL_PROVISIONING_STATES: [&str; 4] =
    ["Failed", "Deleting", "Canceled", "Deallocating"];

/// States during removal that mean a delete is already underway.
const DELETE_IN_PROGRESS_STATES: [&str; 3] = ["Deleting", "Deallocating", "Deallocated"];

pub fn is_fail_provisioning_state(state: Option<&str>) -> bool {
    matches!(state, Some(s) if FAIL_PROVISIONING_STATES.contains(&s))
}

/// What one provisioning step observed.
#[derive(Debug)]
pub enum ProvisionOutcome {
    /// `id` was already recorded; nothing to do
    Ready,
    /// The resource turned up; `id` has been recorded and the caller
    /// should run its modify hook against the returned body
    Created(ArmResource),
    /// A create (or its operation) is still in flight; try again next pass
    Pending,
    /// The resource failed or vanished out-of-band; tear the worker down
    Abandon {
        reason: String,
        /// Error message reported by the async operation, if that is how
        /// we found out
        operation_error: Option<String>,
    },
}

/// Result of polling an async-operation URL.
#[derive(Debug, PartialEq, Eq)]
pub enum OpOutcome {
    InProgress,
    Done { error: Option<String> },
}

/// Poll one async-operation URL.
///
/// Transport failures are treated as "still in progress": the next scan
/// pass retries, and wrongly assuming completion is the only unsafe
/// direction.
pub async fn handle_operation(api: &dyn AzureApi, operation_url: &str) -> OpOutcome {
    let body = match api.get_operation(operation_url).await {
        Err(_) => return OpOutcome::InProgress,
        // the operation record itself is gone; treat as finished
        Ok(None) => return OpOutcome::Done { error: None },
        Ok(Some(body)) => body,
    };

    if body.get("status").and_then(Value::as_str) == Some("InProgress") {
        return OpOutcome::InProgress;
    }

    let error = body.get("error").map(|err| {
        err.get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string())
    });
    OpOutcome::Done { error }
}

/// Advance creation of one resource by at most one cloud action.
///
/// `config` is only invoked if a create actually has to be issued.
pub async fn provision_resource<F>(
    api: &dyn AzureApi,
    kind: ResourceKind,
    record: &mut ResourceRecord,
    config: F,
) -> Result<ProvisionOutcome, CloudError>
where
    F: FnOnce() -> Value,
{
    if record.id.is_some() {
        return Ok(ProvisionOutcome::Ready);
    }

    match api.get_resource(kind, &record.name).await? {
        Some(resource) => {
            let state = resource.provisioning_state();
            if is_fail_provisioning_state(state) {
                record.operation = None;
                return Ok(ProvisionOutcome::Abandon {
                    reason: format!(
                        "{} {} has provisioningState {}",
                        kind.display(),
                        record.name,
                        state.unwrap_or("unknown"),
                    ),
                    operation_error: None,
                });
            }

            record.id = resource.id();
            record.operation = None;
            Ok(ProvisionOutcome::Created(resource))
        }
        None if record.operation.is_some() => {
            let operation_url = record.operation.clone().unwrap_or_else(String::new);
            match handle_operation(api, &operation_url).await {
                OpOutcome::InProgress => Ok(ProvisionOutcome::Pending),
                OpOutcome::Done { error } => {
                    // operation finished but the resource still 404s:
                    // deleted out-of-band, or the create failed outright
                    record.operation = None;
                    Ok(ProvisionOutcome::Abandon {
                        reason: format!(
                            "{} {} not found after its operation completed",
                            kind.display(),
                            record.name,
                        ),
                        operation_error: error,
                    })
                }
            }
        }
        None => {
            let started = api
                .begin_create_or_update(kind, &record.name, config())
                .await?;
            record.operation = started.operation_url;
            Ok(ProvisionOutcome::Pending)
        }
    }
}

/// Advance removal of one resource by at most one cloud action.
///
/// Returns `true` once the resource is verified gone (a GET answered 404).
/// The operation URL from `begin_delete` is recorded but deliberately not
/// consulted: only a 404 proves deletion.
pub async fn remove_resource(
    api: &dyn AzureApi,
    kind: ResourceKind,
    record: &mut ResourceRecord,
) -> Result<bool, CloudError> {
    let mut should_delete = record.id.is_some();

    if !should_delete {
        match api.get_resource(kind, &record.name).await? {
            None => {
                record.clear();
                return Ok(true);
            }
            Some(resource) => {
                let state = resource.provisioning_state();
                if matches!(state, Some(s) if DELETE_IN_PROGRESS_STATES.contains(&s)) {
                    // a delete is already winding down; check again later
                    return Ok(false);
                }
                should_delete = true;
            }
        }
    }

    if should_delete {
        let operation_url = api.begin_delete(kind, &record.name).await?;
        record.id = None;
        if operation_url.is_some() {
            record.operation = operation_url;
        }
    }

    Ok(false)
}
