//! Turns a request configuration into a [`TransportCall`]

use bytes::Bytes;
use serde_json::Value;
use url::Url;

use super::TransportCall;
use crate::config::TransportSettings;
use crate::error::RequestError;
use crate::request::{Authorization, Method, RequestConfig, RequestSerializer, ResponseSerializer};

/// Build the URL, headers and body for `config`
///
/// Arguments go into the query string for `GET`, `HEAD` and `DELETE`, and
/// into the body (form or JSON per the request serializer) otherwise.
pub fn build_call(
    config: &RequestConfig,
    settings: &TransportSettings,
) -> Result<TransportCall, RequestError> {
    let mut url = resolve_url(config, settings)?;

    let mut headers = Vec::with_capacity(config.headers.len() + 2);
    if let Some(accept) = accept_header(config.response_serializer) {
        headers.push(("Accept".to_string(), accept));
    }

    let mut body = None;
    if let Some(arguments) = &config.arguments {
        if config.method.carries_query() {
            append_query(&mut url, arguments)?;
        } else {
            let (content_type, bytes) = encode_body(config.request_serializer, arguments)?;
            headers.push(("Content-Type".to_string(), content_type));
            body = Some(bytes);
        }
    }

    for (name, value) in &config.headers {
        headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        headers.push((name.clone(), value.clone()));
    }

    let authorization = config.authorization.clone().or_else(|| {
        settings
            .auth_token
            .as_ref()
            .map(|token| Authorization::Bearer(token.clone()))
    });

    Ok(TransportCall {
        method: config.method,
        url,
        headers,
        authorization,
        body,
        timeout: config.timeout.unwrap_or_else(|| settings.timeout()),
        allows_cellular: config.allows_cellular && settings.allows_cellular,
        priority: config.priority,
        download_path: config.download_path.clone(),
    })
}

/// Effective base URL of a request: its own, else the configured default
pub fn effective_base_url<'a>(
    config: &'a RequestConfig,
    settings: &'a TransportSettings,
) -> Option<&'a str> {
    config
        .base_url
        .as_deref()
        .or(settings.base_url.as_deref())
}

fn resolve_url(config: &RequestConfig, settings: &TransportSettings) -> Result<Url, RequestError> {
    // Absolute paths bypass the base URL entirely
    if let Ok(url) = Url::parse(&config.path) {
        if url.has_host() {
            return Ok(url);
        }
    }

    let base = effective_base_url(config, settings)
        .ok_or_else(|| RequestError::InvalidUrl(format!("no base URL for path '{}'", config.path)))?;

    let mut base = Url::parse(base).map_err(|e| RequestError::InvalidUrl(format!("{base}: {e}")))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }

    base.join(config.path.trim_start_matches('/'))
        .map_err(|e| RequestError::InvalidUrl(format!("{}: {e}", config.path)))
}

fn accept_header(serializer: ResponseSerializer) -> Option<String> {
    match serializer {
        ResponseSerializer::Json => Some(mime::APPLICATION_JSON.to_string()),
        ResponseSerializer::Text => Some(mime::TEXT_PLAIN.to_string()),
        ResponseSerializer::Raw => None,
    }
}

fn append_query(url: &mut Url, arguments: &Value) -> Result<(), RequestError> {
    let pairs = form_pairs(arguments)?;
    if !pairs.is_empty() {
        url.query_pairs_mut().extend_pairs(pairs);
    }
    Ok(())
}

fn encode_body(
    serializer: RequestSerializer,
    arguments: &Value,
) -> Result<(String, Bytes), RequestError> {
    match serializer {
        RequestSerializer::Json => {
            let bytes = serde_json::to_vec(arguments)
                .map_err(|e| RequestError::Serialization(e.to_string()))?;
            Ok((mime::APPLICATION_JSON.to_string(), Bytes::from(bytes)))
        }
        RequestSerializer::Form => {
            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(form_pairs(arguments)?)
                .finish();
            Ok((
                mime::APPLICATION_WWW_FORM_URLENCODED.to_string(),
                Bytes::from(encoded),
            ))
        }
    }
}

fn form_pairs(arguments: &Value) -> Result<Vec<(String, String)>, RequestError> {
    let Value::Object(map) = arguments else {
        return Err(RequestError::Serialization(
            "form and query arguments must be a JSON object".to_string(),
        ));
    };

    Ok(map
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect())
}

impl Method {
    fn carries_query(self) -> bool {
        matches!(self, Method::Get | Method::Head | Method::Delete)
    }
}
