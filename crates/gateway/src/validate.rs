use serde_json::Value;

use crate::errors::ApiError;

/// The fields dispatch needs from a create payload, after the invariants
/// below have been checked.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub model: String,
    pub stream: bool,
    pub previous_response_id: Option<String>,
    /// Upstream cache key; doubles as the session fingerprint seed.
    pub prompt_cache_key: Option<String>,
}

/// Check the minimum invariants of a create payload:
/// - `model` present and a string
/// - `stream`, when present, a boolean
/// - `previous_response_id`, when present, a response id (never a message id)
/// - `input[]` function-call outputs carry their correlation id
pub fn validate_create_payload(body: &Value) -> Result<ValidatedRequest, ApiError> {
    let obj = body
        .as_object()
        .ok_or_else(|| ApiError::invalid_request("request body must be a JSON object"))?;

    let model = match obj.get("model") {
        Some(Value::String(model)) if !model.is_empty() => model.clone(),
        Some(Value::String(_)) => {
            return Err(ApiError::invalid_request("model must not be empty"));
        },
        Some(_) => return Err(ApiError::invalid_request("model must be a string")),
        None => return Err(ApiError::invalid_request("model is required")),
    };

    let stream = match obj.get("stream") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(stream)) => *stream,
        Some(_) => return Err(ApiError::invalid_request("stream must be a boolean")),
    };

    let previous_response_id = match obj.get("previous_response_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) => {
            if id.starts_with("msg_") {
                return Err(ApiError::invalid_request(
                    "previous_response_id must reference a response, not a message",
                ));
            }
            Some(id.clone())
        },
        Some(_) => {
            return Err(ApiError::invalid_request(
                "previous_response_id must be a string",
            ));
        },
    };

    if let Some(input) = obj.get("input") {
        let items = input
            .as_array()
            .ok_or_else(|| ApiError::invalid_request("input must be an array"))?;
        for item in items {
            validate_input_item(item)?;
        }
    }

    let prompt_cache_key = obj
        .get("prompt_cache_key")
        .and_then(Value::as_str)
        .map(String::from);

    Ok(ValidatedRequest {
        model,
        stream,
        previous_response_id,
        prompt_cache_key,
    })
}

fn validate_input_item(item: &Value) -> Result<(), ApiError> {
    let Some(kind) = item.get("type").and_then(Value::as_str) else {
        return Ok(());
    };
    if kind != "function_call_output" {
        return Ok(());
    }
    // The upstream rejects outputs it cannot correlate; catch it here
    // before any slot is acquired.
    match item.get("call_id").and_then(Value::as_str) {
        Some(call_id) if !call_id.is_empty() => Ok(()),
        _ => Err(ApiError::invalid_request(
            "function_call_output items require a call_id",
        )),
    }
}
