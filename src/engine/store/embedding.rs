// Colony Memory — Embedding Providers
//
//   EmbeddingClient   Ollama (/api/embed, legacy /api/embeddings) or any
//                     OpenAI-compatible /v1/embeddings endpoint
//   LocalEmbedder     offline, deterministic feature hashing over tokens
//
// Every failure surfaces as MemoryError::Embedding, which the error handler
// treats as transient.

use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::traits::EmbeddingProvider;
use crate::engine::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::engine::store::vector::l2_normalize;
use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Build the provider named in the config.
pub fn build_provider(config: &EmbeddingConfig) -> MemoryResult<Arc<dyn EmbeddingProvider>> {
    let provider: Arc<dyn EmbeddingProvider> = match config.provider {
        EmbeddingProviderKind::Local => Arc::new(LocalEmbedder::new(config.dimensions)),
        EmbeddingProviderKind::Ollama | EmbeddingProviderKind::Openai => {
            Arc::new(EmbeddingClient::new(config)?)
        }
    };
    info!(
        "[memory::embedding] Using {} provider ({} dims)",
        provider.name(),
        provider.dimensions()
    );
    Ok(provider)
}

fn parse_vector(values: &[Value]) -> Vec<f32> {
    values.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect()
}

// ── HTTP client ────────────────────────────────────────────────────────────

pub struct EmbeddingClient {
    client: Client,
    kind: EmbeddingProviderKind,
    base_url: String,
    model: String,
    dimensions: usize,
    api_key: Option<String>,
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> MemoryResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()
            .map_err(|e| MemoryError::Config(format!("embedding client: {}", e)))?;
        let api_key = config.api_key_env.as_deref().and_then(|var| match std::env::var(var) {
            Ok(key) if !key.trim().is_empty() => Some(key),
            _ => {
                warn!("[memory::embedding] {} is not set; sending requests without a key", var);
                None
            }
        });
        Ok(EmbeddingClient {
            client,
            kind: config.provider,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimensions: config.dimensions,
            api_key,
        })
    }

    fn post(&self, url: &str, body: &Value) -> reqwest::RequestBuilder {
        let req = self.client.post(url).json(body);
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    /// Ollama current API: POST /api/embed { model, input } → { embeddings: [[f32…]] }.
    /// Falls back to legacy POST /api/embeddings { model, prompt } → { embedding: [f32…] }.
    async fn embed_ollama(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let url = format!("{}/api/embed", self.base_url);
        let resp = self.post(&url, &json!({ "model": self.model, "input": text })).send().await?;
        if resp.status().is_success() {
            let v: Value = resp.json().await?;
            let vec = v["embeddings"]
                .as_array()
                .and_then(|all| all.first())
                .and_then(|first| first.as_array())
                .or_else(|| v["embedding"].as_array())
                .map(|arr| parse_vector(arr))
                .unwrap_or_default();
            if !vec.is_empty() {
                return Ok(vec);
            }
        } else if resp.status().as_u16() != 404 {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(MemoryError::Embedding(format!("ollama embed {}: {}", status, body)));
        }

        info!("[memory::embedding] /api/embed unavailable, trying legacy endpoint");
        let legacy = format!("{}/api/embeddings", self.base_url);
        let resp = self.post(&legacy, &json!({ "model": self.model, "prompt": text })).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(MemoryError::Embedding(format!("ollama embeddings {}: {}", status, body)));
        }
        let v: Value = resp.json().await?;
        let vec = v["embedding"].as_array().map(|arr| parse_vector(arr)).unwrap_or_default();
        if vec.is_empty() {
            return Err(MemoryError::Embedding("empty embedding from ollama".into()));
        }
        Ok(vec)
    }

    /// OpenAI-compatible: POST /v1/embeddings { model, input } → { data: [{ embedding }] }.
    async fn embed_openai(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let resp = self.post(&url, &json!({ "model": self.model, "input": text })).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(MemoryError::Embedding(format!("openai embed {}: {}", status, body)));
        }
        let v: Value = resp.json().await?;
        let vec = v["data"][0]["embedding"].as_array().map(|arr| parse_vector(arr)).unwrap_or_default();
        if vec.is_empty() {
            return Err(MemoryError::Embedding("empty embedding from openai endpoint".into()));
        }
        Ok(vec)
    }
}

#[async_trait]
impl EmbeddingProvider for EmbeddingClient {
    fn name(&self) -> &str {
        match self.kind {
            EmbeddingProviderKind::Openai => "openai",
            _ => "ollama",
        }
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let vec = match self.kind {
            EmbeddingProviderKind::Openai => self.embed_openai(text).await?,
            _ => self.embed_ollama(text).await?,
        };
        if vec.len() != self.dimensions {
            return Err(MemoryError::Embedding(format!(
                "model '{}' returned {} dimensions, store expects {}",
                self.model,
                vec.len(),
                self.dimensions
            )));
        }
        Ok(vec)
    }
}

// ── Local feature hashing ──────────────────────────────────────────────────

/// Deterministic bag-of-words embedding: each lowercase token (and each
/// adjacent token pair) is hashed into a bucket with a hashed sign, then the
/// vector is L2-normalised. Texts sharing vocabulary score higher.
pub struct LocalEmbedder {
    dimensions: usize,
}

impl LocalEmbedder {
    pub fn new(dimensions: usize) -> Self {
        LocalEmbedder { dimensions: dimensions.max(1) }
    }

    fn add_feature(&self, vec: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let bucket = u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]) as usize
            % self.dimensions;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vec[bucket] += sign * weight;
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dimensions];
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();
        for token in &tokens {
            self.add_feature(&mut vec, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.add_feature(&mut vec, &format!("{} {}", pair[0], pair[1]), 0.5);
        }
        l2_normalize(&mut vec);
        vec
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbedder {
    fn name(&self) -> &str {
        "local"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}
