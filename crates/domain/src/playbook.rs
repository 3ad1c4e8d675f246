//! Playbook definitions and the in-memory Playbook Registry placeholder
//! (§9 "construct... Playbook Registry... once at process startup").
//!
//! The full playbook-authoring format (how SOP bodies are written, how
//! structured step lists are versioned) sits outside this engine's scope;
//! this module carries just enough shape for the Runner to resolve a
//! pack code to a SOP body and an optional step list.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookMetadata {
    pub name: String,
    pub code: String,
}

/// One side-effect tier a pack can declare (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectTier {
    Readonly,
    SoftWrite,
    ExternalWrite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    pub metadata: PlaybookMetadata,
    pub sop_content: String,
    pub tier: SideEffectTier,
    /// Optional structured step names; if empty the playbook is
    /// conversational and `total_steps` is inferred or grown dynamically.
    #[serde(default)]
    pub steps: Vec<String>,
    /// Marks "background" playbooks such as `habit_learning` (§4.1
    /// "Creating a suggestion").
    #[serde(default)]
    pub is_background: bool,
}

impl Playbook {
    /// Count of `### Phase N:` markers in the SOP body, used as a
    /// fallback `total_steps` for conversational playbooks (§4.3 step 1).
    pub fn phase_marker_count(&self) -> usize {
        self.sop_content.matches("### Phase ").count()
    }
}

/// Pack codes that are always valid regardless of registry contents
/// (§4.1 "Validation").
pub const BUILTIN_SPECIAL_PACKS: &[&str] = &["intent_extraction", "semantic_seeds"];

#[derive(Debug, Default)]
pub struct PlaybookRegistry {
    packs: HashMap<String, Playbook>,
    /// Registered capability codes that aren't full playbooks (tool-like
    /// packs), also valid targets for a coordinator proposal.
    capabilities: std::collections::HashSet<String>,
}

impl PlaybookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, playbook: Playbook) {
        self.packs.insert(playbook.metadata.code.clone(), playbook);
    }

    pub fn register_capability(&mut self, code: impl Into<String>) {
        self.capabilities.insert(code.into());
    }

    pub fn get(&self, code: &str) -> Option<&Playbook> {
        self.packs.get(code)
    }

    /// Is `code` a registered playbook, a registered capability, or one
    /// of the built-in special-case packs?
    pub fn is_valid_pack(&self, code: &str) -> bool {
        self.packs.contains_key(code)
            || self.capabilities.contains(code)
            || BUILTIN_SPECIAL_PACKS.contains(&code)
    }

    pub fn tier_of(&self, code: &str) -> Option<SideEffectTier> {
        self.packs.get(code).map(|p| p.tier)
    }

    pub fn is_background(&self, code: &str) -> bool {
        self.packs.get(code).map(|p| p.is_background).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playbook(code: &str, tier: SideEffectTier) -> Playbook {
        Playbook {
            metadata: PlaybookMetadata {
                name: code.to_string(),
                code: code.to_string(),
            },
            sop_content: "### Phase 1: one\n### Phase 2: two\n".to_string(),
            tier,
            steps: Vec::new(),
            is_background: false,
        }
    }

    #[test]
    fn builtin_packs_are_always_valid() {
        let registry = PlaybookRegistry::new();
        assert!(registry.is_valid_pack("intent_extraction"));
        assert!(registry.is_valid_pack("semantic_seeds"));
        assert!(!registry.is_valid_pack("unknown_pack"));
    }

    #[test]
    fn registered_playbook_is_valid_and_tiered() {
        let mut registry = PlaybookRegistry::new();
        registry.register(playbook("daily_planning", SideEffectTier::SoftWrite));
        assert!(registry.is_valid_pack("daily_planning"));
        assert_eq!(registry.tier_of("daily_planning"), Some(SideEffectTier::SoftWrite));
    }

    #[test]
    fn phase_marker_count_matches_sop_body() {
        let p = playbook("x", SideEffectTier::Readonly);
        assert_eq!(p.phase_marker_count(), 2);
    }

    #[test]
    fn registered_capability_counts_as_valid() {
        let mut registry = PlaybookRegistry::new();
        registry.register_capability("web_search");
        assert!(registry.is_valid_pack("web_search"));
    }
}
