//! Ollama model discovery.
//!
//! Pings the configured server and, if responsive, lists the locally
//! downloaded models from `/api/tags`.  Used for the startup check and the
//! `/models` command; embedding models show up here too.

use serde::Deserialize;

/// A single model entry returned by Ollama's `/api/tags` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct OllamaModel {
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

/// Ping the Ollama server and return the list of available models.
///
/// Returns `Err(reason)` when the server is offline, answers with a non-2xx
/// status or sends an unexpected body.
pub fn fetch_models(base_url: &str) -> Result<Vec<OllamaModel>, String> {
    let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
    let response = reqwest::blocking::get(&url)
        .map_err(|e| format!("Ollama unreachable at {}: {}", url, e))?;

    if !response.status().is_success() {
        return Err(format!("Ollama returned HTTP {}", response.status()));
    }

    let tags: TagsResponse = response
        .json()
        .map_err(|e| format!("Failed to parse Ollama response: {}", e))?;

    Ok(tags.models)
}

/// `true` when `model` is among `models`, accepting Ollama's implicit
/// `:latest` tag (`llama3` matches `llama3:latest`).
pub fn has_model(models: &[OllamaModel], model: &str) -> bool {
    models
        .iter()
        .any(|m| m.name == model || m.name.strip_suffix(":latest") == Some(model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn models(names: &[&str]) -> Vec<OllamaModel> {
        names.iter().map(|n| OllamaModel { name: n.to_string() }).collect()
    }

    #[test]
    fn has_model_accepts_latest_tag() {
        let list = models(&["llama3:latest", "nomic-embed-text:v1.5"]);
        assert!(has_model(&list, "llama3"));
        assert!(has_model(&list, "llama3:latest"));
        assert!(!has_model(&list, "nomic-embed-text"));
        assert!(!has_model(&[], "llama3"));
    }

    // The blocking client must not run on a runtime worker thread.
    #[tokio::test(flavor = "multi_thread")]
    async fn fetch_models_parses_tags() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [{ "name": "llama3:latest", "size": 1 }, { "name": "qwen2.5" }]
            })))
            .mount(&server)
            .await;

        let base = format!("{}/", server.uri());
        let found = tokio::task::spawn_blocking(move || fetch_models(&base))
            .await
            .unwrap()
            .expect("online");
        let names: Vec<_> = found.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["llama3:latest", "qwen2.5"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fetch_models_reports_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let base = server.uri();
        let err = tokio::task::spawn_blocking(move || fetch_models(&base))
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.contains("503"), "unexpected error: {err}");
    }
}
