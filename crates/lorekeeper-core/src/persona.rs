//! Persona (§3 data model) — the record the Character agent prompts from.
//! Swapped atomically via [`Persona::set`]; the character agent holds one
//! `Arc<RwLock<Persona>>` so a `set_persona` call is visible to the next
//! `invoke` without restarting anything.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupation: Option<String>,
    pub traits: Vec<String>,
    pub speaking_style: String,
    pub verbal_habits: Vec<String>,
    pub likes: Vec<String>,
    pub dislikes: Vec<String>,
    pub background: String,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

impl Default for Persona {
    /// Carried over unchanged from the reference persona defaults (§3).
    fn default() -> Self {
        Self {
            name: "Assistant".to_string(),
            age: None,
            gender: None,
            occupation: None,
            traits: vec![
                "friendly".to_string(),
                "patient".to_string(),
                "humorous".to_string(),
            ],
            speaking_style: "warm, natural, occasionally playful".to_string(),
            verbal_habits: Vec::new(),
            likes: Vec::new(),
            dislikes: Vec::new(),
            background: String::new(),
            extra: HashMap::new(),
        }
    }
}

impl Persona {
    /// Render a persona block for inclusion in the Character agent's system prompt.
    pub fn describe(&self) -> String {
        let mut lines = vec![format!("Name: {}", self.name)];
        if let Some(age) = self.age {
            lines.push(format!("Age: {age}"));
        }
        if let Some(gender) = &self.gender {
            lines.push(format!("Gender: {gender}"));
        }
        if let Some(occupation) = &self.occupation {
            lines.push(format!("Occupation: {occupation}"));
        }
        if !self.traits.is_empty() {
            lines.push(format!("Traits: {}", self.traits.join(", ")));
        }
        lines.push(format!("Speaking style: {}", self.speaking_style));
        if !self.verbal_habits.is_empty() {
            lines.push(format!("Verbal habits: {}", self.verbal_habits.join(", ")));
        }
        if !self.likes.is_empty() {
            lines.push(format!("Likes: {}", self.likes.join(", ")));
        }
        if !self.dislikes.is_empty() {
            lines.push(format!("Dislikes: {}", self.dislikes.join(", ")));
        }
        if !self.background.is_empty() {
            lines.push(format!("Background: {}", self.background));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_persona_matches_reference_defaults() {
        let persona = Persona::default();
        assert_eq!(persona.name, "Assistant");
        assert_eq!(persona.traits, vec!["friendly", "patient", "humorous"]);
        assert_eq!(persona.speaking_style, "warm, natural, occasionally playful");
    }
}
