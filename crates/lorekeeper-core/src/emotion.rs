//! Emotion (§3 data model) — the four-field affective state the Character
//! agent's `analyze_emotion` tool produces and `generate_response` consumes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Emotion {
    pub mood: f64,
    pub affection: f64,
    pub energy: f64,
    pub trust: f64,
}

impl Default for Emotion {
    fn default() -> Self {
        Self {
            mood: 0.6,
            affection: 0.5,
            energy: 0.7,
            trust: 0.5,
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

impl Emotion {
    /// Clamp to the documented ranges and round to two decimals. Idempotent:
    /// `normalize(normalize(e)) == normalize(e)` for any `e`.
    pub fn normalize(self) -> Self {
        Self {
            mood: round2(self.mood.clamp(-1.0, 1.0)),
            affection: round2(self.affection.clamp(-1.0, 1.0)),
            energy: round2(self.energy.clamp(0.0, 1.0)),
            trust: round2(self.trust.clamp(0.0, 1.0)),
        }
    }

    /// Build an `Emotion` from a loosely-typed JSON mapping (as produced by an
    /// LLM tool call), defaulting any missing or non-numeric field.
    pub fn from_value(value: &Value) -> Self {
        let default = Self::default();
        let field = |key: &str, fallback: f64| -> f64 {
            value.get(key).and_then(Value::as_f64).unwrap_or(fallback)
        };
        Self {
            mood: field("mood", default.mood),
            affection: field("affection", default.affection),
            energy: field("energy", default.energy),
            trust: field("trust", default.trust),
        }
        .normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent_and_clamps() {
        let wild = Emotion {
            mood: 5.0,
            affection: -5.0,
            energy: 3.0,
            trust: -3.0,
        };
        let once = wild.normalize();
        let twice = once.normalize();
        assert_eq!(once, twice);
        assert_eq!(once.mood, 1.0);
        assert_eq!(once.affection, -1.0);
        assert_eq!(once.energy, 1.0);
        assert_eq!(once.trust, 0.0);
    }

    #[test]
    fn rounds_to_two_decimals() {
        let e = Emotion {
            mood: 0.123456,
            affection: 0.0,
            energy: 0.999,
            trust: 0.0,
        }
        .normalize();
        assert_eq!(e.mood, 0.12);
        assert_eq!(e.energy, 1.0);
    }

    #[test]
    fn missing_keys_default() {
        let e = Emotion::from_value(&serde_json::json!({"mood": 0.1}));
        let default = Emotion::default();
        assert_eq!(e.mood, 0.1);
        assert_eq!(e.affection, default.affection);
        assert_eq!(e.energy, default.energy);
        assert_eq!(e.trust, default.trust);
    }
}
