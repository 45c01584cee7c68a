//! gRPC transport surface for verification engines.
//!
//! The wire contract is schema-defined protobuf: a streaming `SendQuery`
//! plus the two simulation calls. This module owns the generated bindings
//! and the helpers that build the shared `ComponentsInfo` block.

use serde::Deserialize;

/// Generated protobuf bindings for the engine RPC surface.
pub mod proto {
    #![allow(missing_docs)]
    #![allow(clippy::pedantic)]
    tonic::include_proto!("veribridge");
}

pub use proto::verification_engine_client::VerificationEngineClient;

/// Source of model components, owned by the host application.
///
/// The core serializes the full component list into every request so the
/// engine can detect stale models, and hands engine-generated components
/// back for insertion.
pub trait ComponentRepository: Send + Sync {
    /// Current model components as `(name, json)` pairs, in name order.
    fn components(&self) -> Vec<(String, String)>;

    /// Accepts a component generated by the engine, keyed by its name.
    fn insert_generated(&self, name: &str, json: &str);
}

/// Fields of a generated component's JSON the core needs to key it.
#[derive(Debug, Deserialize)]
pub struct GeneratedComponent {
    /// Component name as declared in the JSON payload.
    pub name: String,
}

/// Builds the components-info block sent with every request.
///
/// The hash is a stable 32-bit digest of the `(name, json)` list; the
/// engine compares it against its cached model to detect changes.
#[must_use]
pub fn components_info(components: &[(String, String)]) -> proto::ComponentsInfo {
    let mut hasher = blake3::Hasher::new();
    for (name, json) in components {
        hasher.update(&(name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());
        hasher.update(&(json.len() as u64).to_le_bytes());
        hasher.update(json.as_bytes());
    }
    let digest = hasher.finalize();
    let mut word = [0u8; 4];
    word.copy_from_slice(&digest.as_bytes()[..4]);

    proto::ComponentsInfo {
        components: components
            .iter()
            .map(|(name, json)| proto::Component {
                name: name.clone(),
                json: json.clone(),
            })
            .collect(),
        components_hash: i32::from_le_bytes(word),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<(String, String)> {
        vec![
            ("Administration".to_string(), "{\"name\":\"Administration\"}".to_string()),
            ("Machine".to_string(), "{\"name\":\"Machine\"}".to_string()),
        ]
    }

    #[test]
    fn hash_is_stable_for_equal_lists() {
        let a = components_info(&sample());
        let b = components_info(&sample());
        assert_eq!(a.components_hash, b.components_hash);
        assert_eq!(a.components.len(), 2);
    }

    #[test]
    fn hash_changes_when_a_component_changes() {
        let a = components_info(&sample());
        let mut edited = sample();
        edited[1].1 = "{\"name\":\"Machine\",\"edited\":true}".to_string();
        let b = components_info(&edited);
        assert_ne!(a.components_hash, b.components_hash);
    }

    #[test]
    fn hash_is_sensitive_to_field_boundaries() {
        // ("ab", "c") and ("a", "bc") must not collide.
        let a = components_info(&[("ab".to_string(), "c".to_string())]);
        let b = components_info(&[("a".to_string(), "bc".to_string())]);
        assert_ne!(a.components_hash, b.components_hash);
    }

    #[test]
    fn generated_component_name_parses_from_json() {
        let parsed: GeneratedComponent =
            serde_json::from_str("{\"name\":\"Synth\",\"locations\":[]}").unwrap();
        assert_eq!(parsed.name, "Synth");
    }
}
