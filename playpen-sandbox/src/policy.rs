//! Isolation policy: the named capability set an execution context runs under.
//!
//! Tokens match the HTML `sandbox` attribute so a browser-backed context
//! can apply [`SandboxPolicy::attribute`] verbatim.

use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Scripts,
    Modals,
    Forms,
    Popups,
    Downloads,
    SameOrigin,
    TopNavigation,
}

impl Capability {
    pub fn token(&self) -> &'static str {
        match self {
            Capability::Scripts => "allow-scripts",
            Capability::Modals => "allow-modals",
            Capability::Forms => "allow-forms",
            Capability::Popups => "allow-popups",
            Capability::Downloads => "allow-downloads",
            Capability::SameOrigin => "allow-same-origin",
            Capability::TopNavigation => "allow-top-navigation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// Script plus same-origin lets framed code remove its own sandbox.
    #[error("allow-scripts combined with allow-same-origin escapes the sandbox")]
    SandboxEscape,

    #[error("top-level navigation must stay denied")]
    TopNavigation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPolicy {
    granted: BTreeSet<Capability>,
}

impl Default for SandboxPolicy {
    /// Script execution and simple modal dialogs; nothing else.
    fn default() -> Self {
        Self::deny_all()
            .with(Capability::Scripts)
            .with(Capability::Modals)
    }
}

impl SandboxPolicy {
    pub fn deny_all() -> Self {
        Self {
            granted: BTreeSet::new(),
        }
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.granted.insert(capability);
        self
    }

    pub fn permits(&self, capability: Capability) -> bool {
        self.granted.contains(&capability)
    }

    /// Space-separated token list, e.g. `allow-scripts allow-modals`.
    pub fn attribute(&self) -> String {
        self.granted
            .iter()
            .map(Capability::token)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.permits(Capability::TopNavigation) {
            return Err(PolicyError::TopNavigation);
        }
        if self.permits(Capability::Scripts) && self.permits(Capability::SameOrigin) {
            return Err(PolicyError::SandboxEscape);
        }
        Ok(())
    }
}
