//! Module identities, registrations and action targets.
//!
//! Every instantiated module lives in exactly one worker session, either as
//! the session's own module (dedicated hosting) or as a resident loaded into
//! another module's session so that both share one store (shared hosting).
//! The registry remembers where each module went and answers the question
//! "which session, and which module inside it, does this action address?".

use crate::config::LinkMap;
use crate::session::SessionId;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// Imports from this module are served by the worker itself.
pub const SPECTEST: &str = "spectest";

/// Where an instantiated module lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleIdentity {
    /// `$name` from the script, if any.
    pub internal_name: Option<String>,
    pub session: SessionId,
    /// Name of the module inside a shared session; `None` when it is the
    /// session's own module.
    pub resident: Option<String>,
    pub path: PathBuf,
}

/// A module made importable under a registration name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub session: SessionId,
    pub path: PathBuf,
}

/// How an action reaches its module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The session's main module.
    Direct(SessionId),
    /// A registered module, by registration name.
    InvokeOn { session: SessionId, module: String },
    /// A resident of a shared session, by resident name.
    InvokeOnShared { session: SessionId, module: String },
    Unresolvable,
}

impl Target {
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Target::Direct(s) | Target::InvokeOn { session: s, .. } | Target::InvokeOnShared { session: s, .. } => {
                Some(*s)
            }
            Target::Unresolvable => None,
        }
    }

    /// Module name to pass with `invoke_on`/`get_on`, `None` for the main
    /// module.
    pub fn module(&self) -> Option<&str> {
        match self {
            Target::InvokeOn { module, .. } | Target::InvokeOnShared { module, .. } => Some(module),
            _ => None,
        }
    }
}

/// How a new module is to be hosted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hosting {
    /// A new session of its own, linked against these registered modules.
    Dedicated { links: LinkMap },
    /// A resident of an existing session that owns one of its imports.
    Shared { session: SessionId },
}

#[derive(Debug, Default)]
pub struct ModuleRegistry {
    current: Option<ModuleIdentity>,
    /// internal name → registration name
    registrations: HashMap<String, String>,
    /// registration name → owner
    registered: HashMap<String, Registration>,
    /// internal name → (host session, resident name)
    residents: HashMap<String, (SessionId, String)>,
    /// internal name → identity, for addressing named modules directly
    named: HashMap<String, ModuleIdentity>,
    /// `module_definition` templates
    definitions: HashMap<String, PathBuf>,
    anonymous: usize,
}

impl ModuleRegistry {
    pub fn new() -> ModuleRegistry {
        ModuleRegistry::default()
    }

    pub fn current(&self) -> Option<&ModuleIdentity> {
        self.current.as_ref()
    }

    /// Make `identity` the module unnamed actions go to.
    pub fn set_current(&mut self, identity: ModuleIdentity) {
        if let Some(name) = &identity.internal_name {
            if let Some(resident) = &identity.resident {
                self.residents.insert(name.clone(), (identity.session, resident.clone()));
            }
            self.named.insert(name.clone(), identity.clone());
        }
        debug!(
            "current module: {} in session {}",
            identity.internal_name.as_deref().unwrap_or("<anonymous>"),
            identity.session
        );
        self.current = Some(identity);
    }

    /// Put back a previously current module, without touching any other
    /// bookkeeping.
    pub fn restore_current(&mut self, identity: Option<ModuleIdentity>) {
        self.current = identity;
    }

    /// A name for a resident that has none in the script.
    pub fn resident_name(&mut self, internal_name: Option<&str>) -> String {
        match internal_name {
            Some(name) => name.to_string(),
            None => {
                self.anonymous += 1;
                format!("$anon{}", self.anonymous)
            }
        }
    }

    /// Which resident, if any, should be the main module of `session`.
    pub fn main_for(&self, session: SessionId) -> Option<&str> {
        self.current
            .as_ref()
            .filter(|c| c.session == session)
            .and_then(|c| c.resident.as_deref())
    }

    /// Find a module by internal name; `None` is the current module.
    pub fn locate(&self, name: Option<&str>) -> Option<&ModuleIdentity> {
        match name {
            None | Some("") => self.current.as_ref(),
            Some(n) => match &self.current {
                Some(c) if c.internal_name.as_deref() == Some(n) => Some(c),
                _ => self.named.get(n),
            },
        }
    }

    /// Route an action naming `name` (or the current module) to a session.
    pub fn resolve(&self, name: Option<&str>, is_alive: impl Fn(SessionId) -> bool) -> Target {
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return self.current.as_ref().map_or(Target::Unresolvable, |c| Target::Direct(c.session));
        };
        if let Some(current) = &self.current {
            if current.internal_name.as_deref() == Some(name) {
                return Target::Direct(current.session);
            }
        }
        if let Some((host, resident)) = self.residents.get(name) {
            if is_alive(*host) {
                return Target::InvokeOnShared {
                    session: *host,
                    module: resident.clone(),
                };
            }
        }
        let registration = if self.registered.contains_key(name) {
            Some(name)
        } else {
            self.registrations.get(name).map(String::as_str)
        };
        if let Some(reg) = registration {
            if let Some(owner) = self.registered.get(reg) {
                if is_alive(owner.session) {
                    return Target::InvokeOn {
                        session: owner.session,
                        module: reg.to_string(),
                    };
                }
                if let Some(current) = self.current.as_ref().filter(|c| is_alive(c.session)) {
                    return Target::InvokeOn {
                        session: current.session,
                        module: reg.to_string(),
                    };
                }
            }
        }
        match self.named.get(name) {
            Some(identity) if is_alive(identity.session) => Target::Direct(identity.session),
            _ => Target::Unresolvable,
        }
    }

    /// Decide how a module importing from `imports` is hosted.
    pub fn hosting_for(&self, imports: &[String], is_alive: impl Fn(SessionId) -> bool) -> Hosting {
        for import in imports.iter().filter(|m| *m != SPECTEST) {
            if let Some(owner) = self.registered.get(import) {
                if is_alive(owner.session) {
                    return Hosting::Shared { session: owner.session };
                }
            }
        }
        Hosting::Dedicated {
            links: self.links_for(imports),
        }
    }

    /// Link map for a dedicated session importing from `imports`.
    pub fn links_for(&self, imports: &[String]) -> LinkMap {
        imports
            .iter()
            .filter(|m| *m != SPECTEST)
            .filter_map(|m| self.registered.get(m).map(|r| (m.clone(), r.path.clone())))
            .collect()
    }

    /// Remember that `identity` was registered as `as_name`.
    pub fn record_registration(&mut self, identity: &ModuleIdentity, as_name: &str) {
        if let Some(name) = &identity.internal_name {
            self.registrations.insert(name.clone(), as_name.to_string());
        }
        self.registered.insert(
            as_name.to_string(),
            Registration {
                session: identity.session,
                path: identity.path.clone(),
            },
        );
    }

    pub fn define(&mut self, name: &str, path: PathBuf) {
        self.definitions.insert(name.to_string(), path);
    }

    pub fn definition(&self, name: &str) -> Option<&PathBuf> {
        self.definitions.get(name)
    }

    /// Sessions some module still lives in.
    pub fn sessions_in_use(&self) -> HashSet<SessionId> {
        let mut used: HashSet<SessionId> = self.registered.values().map(|r| r.session).collect();
        used.extend(self.named.values().map(|i| i.session));
        used.extend(self.residents.values().map(|(s, _)| *s));
        used.extend(self.current.as_ref().map(|c| c.session));
        used
    }
}
